use super::exit_result::ExitResult;
use crate::commands::{
    retrace_options::{RetraceOptions, RetraceSubCommand},
    RetraceCommand,
};
use crate::trace::trace_stream::TraceStream;
use serde::Serialize;
use std::path::PathBuf;

pub struct TraceInfoCommand {
    input: PathBuf,
}

impl TraceInfoCommand {
    pub fn new(options: &RetraceOptions) -> TraceInfoCommand {
        match options.cmd.clone() {
            RetraceSubCommand::TraceInfo { input } => TraceInfoCommand { input },
            _ => panic!("Unexpected RetraceSubCommand variant. Not a `TraceInfo` variant!"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtentInfo {
    syscall: &'static str,
    records: u64,
    bytes: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceInfo {
    major: u16,
    minor: u16,
    total_records: u64,
    extents: Vec<ExtentInfo>,
}

impl RetraceCommand for TraceInfoCommand {
    fn run(&mut self) -> ExitResult<()> {
        let stream = match TraceStream::open(&self.input) {
            Ok(stream) => stream,
            Err(e) => return ExitResult::err_from(e, 1),
        };

        let extents = stream
            .extents()
            .iter()
            .map(|e| ExtentInfo {
                syscall: e.kind.name(),
                records: e.record_count,
                bytes: e.byte_len,
            })
            .collect();
        let info = TraceInfo {
            major: stream.major(),
            minor: stream.minor(),
            total_records: stream.total_records(),
            extents,
        };

        let serialized = serde_json::to_string(&info).unwrap();
        println!("{}", serialized);
        ExitResult::Ok(())
    }
}
