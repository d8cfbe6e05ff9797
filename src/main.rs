#![allow(dead_code)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
mod log;
mod address_space;
mod commands;
mod flags;
mod replay_unit;
mod resources;
mod scheduler;
mod scoped_fd;
mod trace;
mod util;

use crate::commands::{
    replay_command::ReplayCommand,
    retrace_options::{RetraceOptions, RetraceSubCommand},
    trace_info_command::TraceInfoCommand,
    RetraceCommand,
};
use structopt::StructOpt;

fn main() {
    let options = RetraceOptions::from_args();

    let result = match &options.cmd {
        RetraceSubCommand::Replay { .. } => ReplayCommand::new(&options).run(),
        RetraceSubCommand::TraceInfo { .. } => TraceInfoCommand::new(&options).run(),
    };
    result.finish()
}
