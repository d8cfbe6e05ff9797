use std::{error::Error, process::exit};

/// Outcome of a subcommand. `Err` carries the process exit code so setup
/// failures (bad trace version, missing logger, ...) surface as a nonzero
/// exit without a panic.
pub enum ExitResult<T> {
    Ok(T),
    Err(Box<dyn Error>, i32),
}

impl<T> ExitResult<T> {
    pub fn err_from<E: Error + 'static>(e: E, code: i32) -> ExitResult<T> {
        ExitResult::Err(Box::new(e), code)
    }

    /// Terminate the process accordingly. Only `main` should call this.
    pub fn finish(self) -> ! {
        match self {
            ExitResult::Ok(_) => exit(0),
            ExitResult::Err(b, c) => {
                eprintln!("Error: {}", b);
                exit(c)
            }
        }
    }
}
