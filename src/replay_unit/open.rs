//! The open family. A successful traced open established a traced fd (its
//! return value); replay performs the real open and registers the mapping
//! from that traced fd to whatever fd this process was handed.

use crate::replay_unit::{
    mode_after_umask, ReplayContext, ReplayOutcome, ReplayableRecord,
};
use crate::resources::{FdFlags, ReplayedFd, ResourceError};
use crate::trace::extent_reader::ExtentReader;
use crate::trace::extent_writer::ExtentWriter;
use crate::trace::trace_frame::CommonFields;
use crate::trace::trace_stream::SyscallKind;
use libc::mode_t;
use nix::fcntl::{open, openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

fn fd_flags_of(oflag: i32) -> FdFlags {
    if oflag & libc::O_CLOEXEC != 0 {
        FdFlags::CLOEXEC
    } else {
        FdFlags::empty()
    }
}

fn register_open(
    ctx: &mut ReplayContext,
    common: &CommonFields,
    oflag: i32,
    res: nix::Result<RawFd>,
) -> ReplayOutcome {
    let outcome = ReplayOutcome::of(res);
    if common.succeeded() && outcome.ret >= 0 {
        ctx.resources.add_fd(
            common.pid,
            common.return_value as RawFd,
            ReplayedFd::Real(outcome.ret as RawFd),
            fd_flags_of(oflag),
        );
    } else if outcome.ret >= 0 {
        // The traced call failed but ours succeeded; there is no traced fd
        // to map, so don't leak the real one.
        close(outcome.ret as RawFd).unwrap_or(());
    }
    outcome
}

pub struct OpenRecord {
    pub common: CommonFields,
    pub path: PathBuf,
    pub flags: i32,
    pub mode: mode_t,
}

impl ReplayableRecord for OpenRecord {
    const KIND: SyscallKind = SyscallKind::Open;

    fn decode(r: &mut ExtentReader) -> OpenRecord {
        OpenRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
            flags: r.read_i32(),
            mode: r.read_u32() as mode_t,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let mode = if self.flags & libc::O_CREAT != 0 {
            mode_after_umask(ctx, self.common.pid, self.mode)
        } else {
            self.mode
        };
        let res = open(
            &self.path,
            OFlag::from_bits_truncate(self.flags),
            Mode::from_bits_truncate(mode),
        );
        Ok(register_open(ctx, &self.common, self.flags, res))
    }

    fn returns_handle(&self) -> bool {
        true
    }
}

impl OpenRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_path(&self.path);
        w.write_i32(self.flags);
        w.write_u32(self.mode as u32);
    }
}

pub struct OpenAtRecord {
    pub common: CommonFields,
    pub traced_dirfd: RawFd,
    pub path: PathBuf,
    pub flags: i32,
    pub mode: mode_t,
}

impl ReplayableRecord for OpenAtRecord {
    const KIND: SyscallKind = SyscallKind::OpenAt;

    fn decode(r: &mut ExtentReader) -> OpenAtRecord {
        OpenAtRecord {
            common: CommonFields::decode(r),
            traced_dirfd: r.read_i32(),
            path: r.read_path(),
            flags: r.read_i32(),
            mode: r.read_u32() as mode_t,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let dirfd = match ctx.resources.get_fd(self.common.pid, self.traced_dirfd)? {
            ReplayedFd::Real(fd) => fd,
            ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
        };
        let mode = if self.flags & libc::O_CREAT != 0 {
            mode_after_umask(ctx, self.common.pid, self.mode)
        } else {
            self.mode
        };
        let res = openat(
            dirfd,
            &self.path,
            OFlag::from_bits_truncate(self.flags),
            Mode::from_bits_truncate(mode),
        );
        Ok(register_open(ctx, &self.common, self.flags, res))
    }

    fn returns_handle(&self) -> bool {
        true
    }
}

pub struct CreatRecord {
    pub common: CommonFields,
    pub path: PathBuf,
    pub mode: mode_t,
}

impl ReplayableRecord for CreatRecord {
    const KIND: SyscallKind = SyscallKind::Creat;

    fn decode(r: &mut ExtentReader) -> CreatRecord {
        CreatRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
            mode: r.read_u32() as mode_t,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        // creat(2) is open with O_CREAT|O_WRONLY|O_TRUNC.
        let flags = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC;
        let mode = mode_after_umask(ctx, self.common.pid, self.mode);
        let res = open(
            &self.path,
            OFlag::from_bits_truncate(flags),
            Mode::from_bits_truncate(mode),
        );
        Ok(register_open(ctx, &self.common, flags, res))
    }

    fn returns_handle(&self) -> bool {
        true
    }
}

pub struct CloseRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
}

impl ReplayableRecord for CloseRecord {
    const KIND: SyscallKind = SyscallKind::Close;

    fn decode(r: &mut ExtentReader) -> CloseRecord {
        CloseRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        match ctx.resources.remove_fd(self.common.pid, self.traced_fd)? {
            // The standard descriptors belong to the replay process; the
            // traced close of one is bookkeeping only.
            ReplayedFd::Real(fd) if fd > 2 => Ok(ReplayOutcome::of_unit(close(fd))),
            ReplayedFd::Real(_) | ReplayedFd::Simulated => {
                Ok(ReplayOutcome::simulated(&self.common))
            }
        }
    }
}

impl CloseRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_i32(self.traced_fd);
    }
}

#[cfg(test)]
mod test {
    use super::{CloseRecord, OpenRecord};
    use crate::replay_unit::{ReplayConfig, ReplayContext, ReplayableRecord};
    use crate::resources::{FdFlags, ReplayedFd};
    use crate::trace::trace_frame::test_support::common;
    use std::io::Write;

    #[test]
    fn open_maps_the_traced_fd_to_the_real_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"x")
            .unwrap();

        let mut ctx = ReplayContext::new(ReplayConfig::default());
        // The traced process saw fd 7.
        let mut rec = OpenRecord {
            common: common(1, 100, 7, 0),
            path: path.clone(),
            flags: libc::O_RDONLY,
            mode: 0,
        };
        let outcome = rec.apply(&mut ctx).unwrap();
        assert!(outcome.ret >= 0);
        assert!(!outcome.simulated);

        let replayed = ctx.resources.get_fd(100, 7).unwrap();
        assert_eq!(replayed, ReplayedFd::Real(outcome.ret as i32));

        // close through the table really closes and unmaps.
        let mut close_rec = CloseRecord {
            common: common(2, 100, 0, 0),
            traced_fd: 7,
        };
        let close_outcome = close_rec.apply(&mut ctx).unwrap();
        assert_eq!(close_outcome.ret, 0);
        assert!(ctx.resources.get_fd(100, 7).is_err());
    }

    #[test]
    fn failed_traced_open_registers_nothing() {
        let mut ctx = ReplayContext::new(ReplayConfig::default());
        let mut rec = OpenRecord {
            common: common(1, 100, -1, libc::ENOENT),
            path: "/nonexistent/retrace/test/path".into(),
            flags: libc::O_RDONLY,
            mode: 0,
        };
        let outcome = rec.apply(&mut ctx).unwrap();
        assert_eq!(outcome.ret, -1);
        assert_eq!(outcome.errno, libc::ENOENT);
        assert!(ctx.resources.get_fd(100, 3).is_err());
    }

    #[test]
    fn close_of_a_simulated_fd_short_circuits() {
        let mut ctx = ReplayContext::new(ReplayConfig::default());
        ctx.resources
            .add_fd(100, 9, ReplayedFd::Simulated, FdFlags::empty());
        let mut rec = CloseRecord {
            common: common(5, 100, 0, 0),
            traced_fd: 9,
        };
        let outcome = rec.apply(&mut ctx).unwrap();
        assert!(outcome.simulated);
        assert_eq!(outcome.ret, 0);
    }

    #[test]
    fn creation_mode_honors_the_traced_umask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("masked");

        let mut ctx = ReplayContext::new(ReplayConfig::default());
        ctx.resources.add_umask(100, 0o077);
        let mut rec = OpenRecord {
            common: common(1, 100, 3, 0),
            path: path.clone(),
            flags: libc::O_CREAT | libc::O_WRONLY,
            mode: 0o666,
        };
        rec.apply(&mut ctx).unwrap();

        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::metadata(&path).unwrap().permissions();
        // 0o666 & !0o077 == 0o600, regardless of the replayer's own umask.
        assert_eq!(perms.mode() & 0o777, 0o600);
    }
}
