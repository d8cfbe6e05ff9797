use super::{
    exit_result::ExitResult,
    retrace_options::{RetraceOptions, RetraceSubCommand},
};
use crate::commands::RetraceCommand;
use crate::flags::{Flags, WarnLevel};
use crate::log::{set_default_level, set_log_file, LogInfo};
use crate::replay_unit::{unit_for, ReplayConfig, ReplayContext};
use crate::scheduler::ReplayScheduler;
use crate::trace::trace_stream::TraceStream;
use nix::sys::stat::{umask, Mode};
use std::path::PathBuf;

pub struct ReplayCommand {
    inputs: Vec<PathBuf>,
}

impl ReplayCommand {
    pub fn new(options: &RetraceOptions) -> ReplayCommand {
        match options.cmd.clone() {
            RetraceSubCommand::Replay {
                verbose,
                verify,
                warn,
                logger,
                inputs,
                ..
            } => {
                if (verbose || verify || warn != WarnLevel::Ignore) && logger.is_none() {
                    clean_fatal!(
                        "A log file (-l/--logger) is required whenever -v, --verify or -w > 0 \
                         is given"
                    );
                }
                ReplayCommand { inputs }
            }
            _ => panic!("Unexpected RetraceSubCommand variant. Not a `Replay` variant!"),
        }
    }
}

impl RetraceCommand for ReplayCommand {
    fn run(&mut self) -> ExitResult<()> {
        let flags = Flags::get();
        if let Some(logger) = &flags.logger {
            set_log_file(logger);
        }
        if flags.verbose {
            set_default_level(LogInfo);
        }

        // The traced processes' umasks are applied by hand from the trace's
        // umask records; the replay process itself must not mask anything.
        umask(Mode::empty());

        for input in &self.inputs {
            let stream = match TraceStream::open(input) {
                Ok(stream) => stream,
                Err(e) => return ExitResult::err_from(e, 1),
            };
            log!(
                LogInfo,
                "replaying `{}' (format {}.{}, {} records in {} extents)",
                input.display(),
                stream.major(),
                stream.minor(),
                stream.total_records(),
                stream.extents().len()
            );

            let ctx = ReplayContext::new(ReplayConfig::from_flags());
            let mut scheduler = ReplayScheduler::new(ctx);
            for entry in stream.extents() {
                scheduler.add_unit(unit_for(
                    entry.kind,
                    stream.extent_reader(entry),
                    entry.record_count,
                ));
            }
            scheduler.run();
        }
        ExitResult::Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::flags::PatternKind;
    use crate::replay_unit::{unit_for, ReplayConfig, ReplayContext};
    use crate::scheduler::ReplayScheduler;
    use crate::trace::extent_writer::TraceWriter;
    use crate::trace::trace_frame::test_support::common;
    use crate::trace::trace_stream::{SyscallKind, TraceStream};

    /// The full pipeline over a synthetic trace: umask, open, write,
    /// close, exit. The scheduler must apply them in unique_id order, the
    /// written file must hold the patterned bytes, and the fd must be gone
    /// from the table afterwards.
    #[test]
    fn open_write_close_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let trace_path = dir.path().join("t.trace");
        let target = dir.path().join("out");

        let mut w = TraceWriter::new();
        crate::replay_unit::process::UmaskRecord {
            common: common(0, 100, 0o22, 0),
            mask: 0,
        }
        .encode(w.extent(SyscallKind::Umask));
        crate::replay_unit::open::OpenRecord {
            common: common(1, 100, 3, 0),
            path: target.clone(),
            flags: libc::O_CREAT | libc::O_WRONLY,
            mode: 0o644,
        }
        .encode(w.extent(SyscallKind::Open));
        crate::replay_unit::rw::WriteRecord {
            common: common(2, 100, 5, 0),
            traced_fd: 3,
            count: 5,
        }
        .encode(w.extent(SyscallKind::Write));
        crate::replay_unit::open::CloseRecord {
            common: common(3, 100, 0, 0),
            traced_fd: 3,
        }
        .encode(w.extent(SyscallKind::Close));
        crate::replay_unit::process::ExitRecord {
            common: common(4, 100, 0, 0),
            status: 0,
        }
        .encode(w.extent(SyscallKind::Exit));
        w.close(&trace_path).unwrap();

        let stream = TraceStream::open(&trace_path).unwrap();
        assert_eq!(stream.total_records(), 5);

        let mut config = ReplayConfig::default();
        config.pattern = PatternKind::Fixed(b'a');
        let mut scheduler = ReplayScheduler::new(ReplayContext::new(config));
        for entry in stream.extents() {
            scheduler.add_unit(unit_for(
                entry.kind,
                stream.extent_reader(entry),
                entry.record_count,
            ));
        }
        scheduler.run();

        assert_eq!(scheduler.stats().applied, 5);
        assert_eq!(std::fs::read(&target).unwrap(), b"aaaaa");
        // Close removed the mapping; exit removed the whole table.
        assert!(scheduler.ctx().resources.get_fd(100, 3).is_err());
        assert!(scheduler.ctx().resources.get_umask(100).is_err());
    }

    /// Batching must not reorder records even when one stream repeatedly
    /// holds the minimum: interleave two files' worth of writes.
    #[test]
    fn interleaved_writes_land_in_trace_order() {
        let dir = tempfile::tempdir().unwrap();
        let trace_path = dir.path().join("t.trace");
        let target = dir.path().join("out");

        let mut w = TraceWriter::new();
        crate::replay_unit::process::UmaskRecord {
            common: common(0, 100, 0, 0),
            mask: 0,
        }
        .encode(w.extent(SyscallKind::Umask));
        crate::replay_unit::open::OpenRecord {
            common: common(1, 100, 3, 0),
            path: target.clone(),
            flags: libc::O_CREAT | libc::O_WRONLY,
            mode: 0o644,
        }
        .encode(w.extent(SyscallKind::Open));
        // Writes and seeks alternate between two extents, so the merge has
        // to keep switching streams: write "xx", seek to 0, write "yy".
        crate::replay_unit::rw::WriteRecord {
            common: common(2, 100, 2, 0),
            traced_fd: 3,
            count: 2,
        }
        .encode(w.extent(SyscallKind::Write));
        crate::replay_unit::rw::LseekRecord {
            common: common(3, 100, 0, 0),
            traced_fd: 3,
            offset: 0,
            whence: libc::SEEK_SET,
        }
        .encode(w.extent(SyscallKind::Lseek));
        crate::replay_unit::rw::WriteRecord {
            common: common(4, 100, 2, 0),
            traced_fd: 3,
            count: 2,
        }
        .encode(w.extent(SyscallKind::Write));
        crate::replay_unit::open::CloseRecord {
            common: common(5, 100, 0, 0),
            traced_fd: 3,
        }
        .encode(w.extent(SyscallKind::Close));
        w.close(&trace_path).unwrap();

        let stream = TraceStream::open(&trace_path).unwrap();
        let mut config = ReplayConfig::default();
        config.pattern = PatternKind::Fixed(b'z');
        let mut scheduler = ReplayScheduler::new(ReplayContext::new(config));
        for entry in stream.extents() {
            scheduler.add_unit(unit_for(
                entry.kind,
                stream.extent_reader(entry),
                entry.record_count,
            ));
        }
        scheduler.run();

        // If the seek had been applied out of order the file would be 4
        // bytes long.
        assert_eq!(std::fs::read(&target).unwrap(), b"zz");
        assert_eq!(scheduler.stats().applied, 6);
    }
}
