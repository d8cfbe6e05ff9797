//! Metadata calls: the stat and statfs families, access, chmod, truncate
//! and the sync calls. The stat family can cross-check the replayed
//! file's size and mode against the traced ones under --verify.

use crate::replay_unit::{ReplayContext, ReplayOutcome, ReplayableRecord};
use crate::resources::{ReplayedFd, ResourceError};
use crate::trace::extent_reader::ExtentReader;
use crate::trace::trace_frame::CommonFields;
use crate::trace::trace_stream::SyscallKind;
use libc::mode_t;
use nix::sys::stat::{fchmod, fchmodat, fstat, lstat, stat, FchmodatFlags, FileStat, Mode};
use nix::sys::statfs::{fstatfs, statfs};
use nix::unistd::{access, fdatasync, fsync, ftruncate, AccessFlags};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// The stat columns the capture tool stores and replay can check.
#[derive(Copy, Clone, Debug)]
pub struct TracedStat {
    pub st_size: i64,
    pub st_mode: u32,
}

impl TracedStat {
    fn decode(r: &mut ExtentReader) -> TracedStat {
        TracedStat {
            st_size: r.read_i64(),
            st_mode: r.read_u32(),
        }
    }

    fn mismatch_against(&self, replayed: &Option<FileStat>) -> Option<String> {
        let replayed = replayed.as_ref()?;
        if replayed.st_size != self.st_size {
            return Some(format!(
                "stat size: traced {}, replayed {}",
                self.st_size, replayed.st_size
            ));
        }
        // Compare the permission bits and the file type.
        if u32::from(replayed.st_mode) != self.st_mode {
            return Some(format!(
                "stat mode: traced {:#o}, replayed {:#o}",
                self.st_mode, replayed.st_mode
            ));
        }
        None
    }
}

pub struct StatRecord {
    pub common: CommonFields,
    pub path: PathBuf,
    pub traced_stat: TracedStat,
    replayed: Option<FileStat>,
}

impl ReplayableRecord for StatRecord {
    const KIND: SyscallKind = SyscallKind::Stat;

    fn decode(r: &mut ExtentReader) -> StatRecord {
        StatRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
            traced_stat: TracedStat::decode(r),
            replayed: None,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let res = stat(&self.path);
        if let Ok(st) = &res {
            self.replayed = Some(*st);
        }
        Ok(ReplayOutcome::of_unit(res.map(|_| ())))
    }

    fn buffer_mismatch(&self) -> Option<String> {
        self.traced_stat.mismatch_against(&self.replayed)
    }
}

pub struct FstatRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub traced_stat: TracedStat,
    replayed: Option<FileStat>,
}

impl ReplayableRecord for FstatRecord {
    const KIND: SyscallKind = SyscallKind::Fstat;

    fn decode(r: &mut ExtentReader) -> FstatRecord {
        FstatRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
            traced_stat: TracedStat::decode(r),
            replayed: None,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let fd = match ctx.resources.get_fd(self.common.pid, self.traced_fd)? {
            ReplayedFd::Real(fd) => fd,
            ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
        };
        let res = fstat(fd);
        if let Ok(st) = &res {
            self.replayed = Some(*st);
        }
        Ok(ReplayOutcome::of_unit(res.map(|_| ())))
    }

    fn buffer_mismatch(&self) -> Option<String> {
        self.traced_stat.mismatch_against(&self.replayed)
    }
}

pub struct LstatRecord {
    pub common: CommonFields,
    pub path: PathBuf,
    pub traced_stat: TracedStat,
    replayed: Option<FileStat>,
}

impl ReplayableRecord for LstatRecord {
    const KIND: SyscallKind = SyscallKind::Lstat;

    fn decode(r: &mut ExtentReader) -> LstatRecord {
        LstatRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
            traced_stat: TracedStat::decode(r),
            replayed: None,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let res = lstat(&self.path);
        if let Ok(st) = &res {
            self.replayed = Some(*st);
        }
        Ok(ReplayOutcome::of_unit(res.map(|_| ())))
    }

    fn buffer_mismatch(&self) -> Option<String> {
        self.traced_stat.mismatch_against(&self.replayed)
    }
}

pub struct StatfsRecord {
    pub common: CommonFields,
    pub path: PathBuf,
}

impl ReplayableRecord for StatfsRecord {
    const KIND: SyscallKind = SyscallKind::Statfs;

    fn decode(r: &mut ExtentReader) -> StatfsRecord {
        StatfsRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        Ok(ReplayOutcome::of_unit(statfs(&self.path).map(|_| ())))
    }
}

pub struct FstatfsRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
}

impl ReplayableRecord for FstatfsRecord {
    const KIND: SyscallKind = SyscallKind::Fstatfs;

    fn decode(r: &mut ExtentReader) -> FstatfsRecord {
        FstatfsRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let fd = match ctx.resources.get_fd(self.common.pid, self.traced_fd)? {
            ReplayedFd::Real(fd) => fd,
            ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
        };
        Ok(ReplayOutcome::of_unit(fstatfs(&fd).map(|_| ())))
    }
}

pub struct AccessRecord {
    pub common: CommonFields,
    pub path: PathBuf,
    pub mode: i32,
}

impl ReplayableRecord for AccessRecord {
    const KIND: SyscallKind = SyscallKind::Access;

    fn decode(r: &mut ExtentReader) -> AccessRecord {
        AccessRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
            mode: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        Ok(ReplayOutcome::of_unit(access(
            &self.path,
            AccessFlags::from_bits_truncate(self.mode),
        )))
    }
}

pub struct ChmodRecord {
    pub common: CommonFields,
    pub path: PathBuf,
    pub mode: mode_t,
}

impl ReplayableRecord for ChmodRecord {
    const KIND: SyscallKind = SyscallKind::Chmod;

    fn decode(r: &mut ExtentReader) -> ChmodRecord {
        ChmodRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
            mode: r.read_u32() as mode_t,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        // chmod is not umask-filtered; the traced mode is literal.
        Ok(ReplayOutcome::of_unit(fchmodat(
            None,
            &self.path,
            Mode::from_bits_truncate(self.mode),
            FchmodatFlags::FollowSymlink,
        )))
    }
}

pub struct FchmodRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub mode: mode_t,
}

impl ReplayableRecord for FchmodRecord {
    const KIND: SyscallKind = SyscallKind::Fchmod;

    fn decode(r: &mut ExtentReader) -> FchmodRecord {
        FchmodRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
            mode: r.read_u32() as mode_t,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let fd = match ctx.resources.get_fd(self.common.pid, self.traced_fd)? {
            ReplayedFd::Real(fd) => fd,
            ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
        };
        Ok(ReplayOutcome::of_unit(fchmod(
            fd,
            Mode::from_bits_truncate(self.mode),
        )))
    }
}

pub struct FtruncateRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub length: i64,
}

impl ReplayableRecord for FtruncateRecord {
    const KIND: SyscallKind = SyscallKind::Ftruncate;

    fn decode(r: &mut ExtentReader) -> FtruncateRecord {
        FtruncateRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
            length: r.read_i64(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let fd = match ctx.resources.get_fd(self.common.pid, self.traced_fd)? {
            ReplayedFd::Real(fd) => fd,
            ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
        };
        Ok(ReplayOutcome::of_unit(ftruncate(fd, self.length)))
    }
}

pub struct FsyncRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
}

impl ReplayableRecord for FsyncRecord {
    const KIND: SyscallKind = SyscallKind::Fsync;

    fn decode(r: &mut ExtentReader) -> FsyncRecord {
        FsyncRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let fd = match ctx.resources.get_fd(self.common.pid, self.traced_fd)? {
            ReplayedFd::Real(fd) => fd,
            ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
        };
        Ok(ReplayOutcome::of_unit(fsync(fd)))
    }
}

pub struct FdatasyncRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
}

impl ReplayableRecord for FdatasyncRecord {
    const KIND: SyscallKind = SyscallKind::Fdatasync;

    fn decode(r: &mut ExtentReader) -> FdatasyncRecord {
        FdatasyncRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let fd = match ctx.resources.get_fd(self.common.pid, self.traced_fd)? {
            ReplayedFd::Real(fd) => fd,
            ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
        };
        Ok(ReplayOutcome::of_unit(fdatasync(fd)))
    }
}

#[cfg(test)]
mod test {
    use super::{FtruncateRecord, StatRecord, TracedStat};
    use crate::replay_unit::{ReplayConfig, ReplayContext, ReplayableRecord};
    use crate::resources::{FdFlags, ReplayedFd};
    use crate::trace::trace_frame::test_support::common;
    use std::io::Write;

    #[test]
    fn stat_verifies_size_against_the_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 10])
            .unwrap();

        let mut ctx = ReplayContext::new(ReplayConfig::default());
        let mut rec = StatRecord {
            common: common(1, 100, 0, 0),
            path: path.clone(),
            traced_stat: TracedStat {
                st_size: 10,
                st_mode: 0,
            },
            replayed: None,
        };
        let outcome = rec.apply(&mut ctx).unwrap();
        assert_eq!(outcome.ret, 0);
        // Size matches, mode does not (the traced mode here is 0).
        assert!(rec.buffer_mismatch().unwrap().contains("stat mode"));

        rec.traced_stat.st_size = 99;
        assert!(rec.buffer_mismatch().unwrap().contains("stat size"));
    }

    #[test]
    fn ftruncate_applies_through_the_fd_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 100])
            .unwrap();
        let fd = nix::fcntl::open(
            &path,
            nix::fcntl::OFlag::O_WRONLY,
            nix::sys::stat::Mode::empty(),
        )
        .unwrap();

        let mut ctx = ReplayContext::new(ReplayConfig::default());
        ctx.resources
            .add_fd(100, 3, ReplayedFd::Real(fd), FdFlags::empty());
        let mut rec = FtruncateRecord {
            common: common(1, 100, 0, 0),
            traced_fd: 3,
            length: 7,
        };
        assert_eq!(rec.apply(&mut ctx).unwrap().ret, 0);
        nix::unistd::close(fd).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 7);
    }
}
