use crate::commands::retrace_options::{RetraceOptions, RetraceSubCommand};
use std::path::PathBuf;
use structopt::StructOpt;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

/// What to do when a replayed result disagrees with the traced one.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum WarnLevel {
    /// No comparison at all (the default).
    Ignore,
    /// Log the mismatch and keep going.
    Warn,
    /// Log the mismatch, then terminate the replay.
    Abort,
}

/// Where the payload bytes for write-family records come from. The trace
/// records only byte counts for outgoing data.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PatternKind {
    Fixed(u8),
    Random,
    Urandom,
}

#[derive(Clone)]
pub struct Flags {
    /// Log every applied record.
    pub verbose: bool,
    /// Compare replayed buffers (not just return values) against captured
    /// data where the trace carries it.
    pub verify: bool,
    pub warn: WarnLevel,
    pub pattern: PatternKind,
    /// Log destination. Mandatory whenever verbose/verify/warn are active.
    pub logger: Option<PathBuf>,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

pub fn init_flags() -> Flags {
    let options = RetraceOptions::from_args();

    match options.cmd {
        RetraceSubCommand::Replay {
            verbose,
            verify,
            warn,
            pattern,
            logger,
            ..
        } => Flags {
            verbose,
            verify,
            warn,
            pattern: pattern.unwrap_or(PatternKind::Fixed(0)),
            logger,
        },
        _ => Flags {
            verbose: false,
            verify: false,
            warn: WarnLevel::Ignore,
            pattern: PatternKind::Fixed(0),
            logger: None,
        },
    }
}
