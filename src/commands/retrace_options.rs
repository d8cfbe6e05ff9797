use crate::flags::{PatternKind, WarnLevel};
use std::{error::Error, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "retrace",
    about = "The system-call trace replay tool",
    after_help = "Use RETRACE_LOG to control logging; e.g. RETRACE_LOG=all:warn,scheduler:debug"
)]
#[structopt(global_settings =
&[AppSettings::AllowNegativeNumbers, AppSettings::UnifiedHelpMessage])]
pub struct RetraceOptions {
    #[structopt(subcommand)]
    pub cmd: RetraceSubCommand,
}

#[derive(Debug, Clone, StructOpt)]
pub enum RetraceSubCommand {
    /// Re-execute the system calls recorded in the given trace file(s)
    /// against the live system.
    #[structopt(name = "replay")]
    Replay {
        #[structopt(short = "v", long, help = "Log every record as it is applied.")]
        verbose: bool,

        #[structopt(
            long,
            help = "Compare replayed return values and buffers against the captured ones."
        )]
        verify: bool,

        #[structopt(
        short = "w",
        long,
        default_value = "0",
        parse(try_from_str = parse_warn),
        help = "Where <warn> := 0 | 1 | 2. 0: no comparison (default). 1: warn on \
                mismatch between replayed and traced results. 2: abort on mismatch."
        )]
        warn: WarnLevel,

        #[structopt(
        short = "p",
        long,
        parse(try_from_str = parse_pattern),
        help = "Where <pattern> := <byte-value> | `random` | `urandom`. Payload fill \
                for write-family records. Defaults to zero bytes."
        )]
        pattern: Option<PatternKind>,

        #[structopt(
            short = "l",
            long,
            parse(from_os_str),
            help = "Log file. Required whenever -v, --verify or -w > 0 is given."
        )]
        logger: Option<PathBuf>,

        #[structopt(
            parse(from_os_str),
            required = true,
            help = "Input trace file(s), replayed one after another."
        )]
        inputs: Vec<PathBuf>,
    },

    /// Print a JSON summary of a trace file's header and extent directory.
    #[structopt(name = "trace-info")]
    TraceInfo {
        #[structopt(parse(from_os_str), help = "Input trace file.")]
        input: PathBuf,
    },
}

fn parse_warn(warn_s: &str) -> Result<WarnLevel, Box<dyn Error>> {
    match warn_s {
        "0" => Ok(WarnLevel::Ignore),
        "1" => Ok(WarnLevel::Warn),
        "2" => Ok(WarnLevel::Abort),
        _ => Err(Box::new(clap::Error::with_description(
            "Only 0, 1 or 2 is valid here",
            clap::ErrorKind::InvalidValue,
        ))),
    }
}

fn parse_pattern(pattern_s: &str) -> Result<PatternKind, Box<dyn Error>> {
    if pattern_s == "random" {
        Ok(PatternKind::Random)
    } else if pattern_s == "urandom" {
        Ok(PatternKind::Urandom)
    } else if pattern_s.chars().all(|c| c.is_ascii_digit()) {
        Ok(PatternKind::Fixed(pattern_s.parse::<u8>()?))
    } else {
        Err(Box::new(clap::Error::with_description(
            "Only `random`, `urandom` or a byte value is valid here",
            clap::ErrorKind::InvalidValue,
        )))
    }
}
