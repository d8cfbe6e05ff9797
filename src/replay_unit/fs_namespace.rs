//! Namespace mutations: unlink, mkdir, rmdir, rename, link, symlink,
//! readlink.

use crate::replay_unit::{
    mode_after_umask, outcome_of_libc, ReplayContext, ReplayOutcome, ReplayableRecord,
};
use crate::resources::{ReplayedFd, ResourceError};
use crate::trace::extent_reader::ExtentReader;
use crate::trace::trace_frame::CommonFields;
use crate::trace::trace_stream::SyscallKind;
use libc::mode_t;
use nix::fcntl::renameat;
use nix::sys::stat::Mode;
use nix::unistd::{mkdir, unlink, unlinkat, UnlinkatFlags};
use std::ffi::{CString, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

const EINVAL_OUTCOME: ReplayOutcome = ReplayOutcome {
    ret: -1,
    errno: libc::EINVAL,
    simulated: false,
};

fn c_path(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

pub struct UnlinkRecord {
    pub common: CommonFields,
    pub path: PathBuf,
}

impl ReplayableRecord for UnlinkRecord {
    const KIND: SyscallKind = SyscallKind::Unlink;

    fn decode(r: &mut ExtentReader) -> UnlinkRecord {
        UnlinkRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        Ok(ReplayOutcome::of_unit(unlink(&self.path)))
    }
}

pub struct UnlinkAtRecord {
    pub common: CommonFields,
    pub traced_dirfd: RawFd,
    pub path: PathBuf,
    pub flags: i32,
}

impl ReplayableRecord for UnlinkAtRecord {
    const KIND: SyscallKind = SyscallKind::UnlinkAt;

    fn decode(r: &mut ExtentReader) -> UnlinkAtRecord {
        UnlinkAtRecord {
            common: CommonFields::decode(r),
            traced_dirfd: r.read_i32(),
            path: r.read_path(),
            flags: r.read_i32(),
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
        let flag = if self.flags & libc::AT_REMOVEDIR != 0 {
            UnlinkatFlags::RemoveDir
        } else {
            UnlinkatFlags::NoRemoveDir
        };
        Ok(ReplayOutcome::of_unit(unlinkat(
            Some(dirfd),
            &self.path,
            flag,
        )))
    }
}

pub struct MkdirRecord {
    pub common: CommonFields,
    pub path: PathBuf,
    pub mode: mode_t,
}

impl ReplayableRecord for MkdirRecord {
    const KIND: SyscallKind = SyscallKind::Mkdir;

    fn decode(r: &mut ExtentReader) -> MkdirRecord {
        MkdirRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
            mode: r.read_u32() as mode_t,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let mode = mode_after_umask(ctx, self.common.pid, self.mode);
        Ok(ReplayOutcome::of_unit(mkdir(
            &self.path,
            Mode::from_bits_truncate(mode),
        )))
    }
}

pub struct RmdirRecord {
    pub common: CommonFields,
    pub path: PathBuf,
}

impl ReplayableRecord for RmdirRecord {
    const KIND: SyscallKind = SyscallKind::Rmdir;

    fn decode(r: &mut ExtentReader) -> RmdirRecord {
        RmdirRecord {
            common: CommonFields::decode(r),
            path: r.read_path(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        // No rmdir wrapper in nix; go through libc.
        let path = match c_path(&self.path) {
            Some(c) => c,
            None => return Ok(EINVAL_OUTCOME),
        };
        let ret = unsafe { libc::rmdir(path.as_ptr()) };
        Ok(outcome_of_libc(ret))
    }
}

pub struct RenameRecord {
    pub common: CommonFields,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

impl ReplayableRecord for RenameRecord {
    const KIND: SyscallKind = SyscallKind::Rename;

    fn decode(r: &mut ExtentReader) -> RenameRecord {
        RenameRecord {
            common: CommonFields::decode(r),
            old_path: r.read_path(),
            new_path: r.read_path(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        Ok(ReplayOutcome::of_unit(renameat(
            None,
            &self.old_path,
            None,
            &self.new_path,
        )))
    }
}

pub struct LinkRecord {
    pub common: CommonFields,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

impl ReplayableRecord for LinkRecord {
    const KIND: SyscallKind = SyscallKind::Link;

    fn decode(r: &mut ExtentReader) -> LinkRecord {
        LinkRecord {
            common: CommonFields::decode(r),
            old_path: r.read_path(),
            new_path: r.read_path(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let (old, new) = match (c_path(&self.old_path), c_path(&self.new_path)) {
            (Some(old), Some(new)) => (old, new),
            _ => return Ok(EINVAL_OUTCOME),
        };
        let ret = unsafe { libc::link(old.as_ptr(), new.as_ptr()) };
        Ok(outcome_of_libc(ret))
    }
}

pub struct SymlinkRecord {
    pub common: CommonFields,
    pub target: PathBuf,
    pub link_path: PathBuf,
}

impl ReplayableRecord for SymlinkRecord {
    const KIND: SyscallKind = SyscallKind::Symlink;

    fn decode(r: &mut ExtentReader) -> SymlinkRecord {
        SymlinkRecord {
            common: CommonFields::decode(r),
            target: r.read_path(),
            link_path: r.read_path(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let (target, link_path) = match (c_path(&self.target), c_path(&self.link_path)) {
            (Some(target), Some(link_path)) => (target, link_path),
            _ => return Ok(EINVAL_OUTCOME),
        };
        let ret = unsafe { libc::symlink(target.as_ptr(), link_path.as_ptr()) };
        Ok(outcome_of_libc(ret))
    }
}

pub struct ReadlinkRecord {
    pub common: CommonFields,
    pub path: PathBuf,
    /// The traced link target, when captured.
    pub data: Option<Vec<u8>>,
    replayed: Option<OsString>,
}

impl ReplayableRecord for ReadlinkRecord {
    const KIND: SyscallKind = SyscallKind::Readlink;

    fn decode(r: &mut ExtentReader) -> ReadlinkRecord {
        let common = CommonFields::decode(r);
        let path = r.read_path();
        let data = if r.read_u8() != 0 {
            Some(r.read_data())
        } else {
            None
        };
        ReadlinkRecord {
            common,
            path,
            data,
            replayed: None,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let path = match c_path(&self.path) {
            Some(c) => c,
            None => return Ok(EINVAL_OUTCOME),
        };
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        let n = unsafe {
            libc::readlink(
                path.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n < 0 {
            return Ok(ReplayOutcome {
                ret: -1,
                errno: nix::errno::errno(),
                simulated: false,
            });
        }
        buf.truncate(n as usize);
        self.replayed = Some(OsString::from_vec(buf));
        Ok(ReplayOutcome::real(n as i64))
    }

    fn buffer_mismatch(&self) -> Option<String> {
        let captured = self.data.as_ref()?;
        let replayed = self.replayed.as_ref()?;
        if captured.as_slice() == replayed.as_bytes() {
            None
        } else {
            Some(format!(
                "link target: traced `{}', replayed `{}'",
                String::from_utf8_lossy(captured),
                replayed.to_string_lossy()
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use super::{MkdirRecord, RenameRecord, RmdirRecord, UnlinkRecord};
    use crate::replay_unit::{ReplayConfig, ReplayContext, ReplayableRecord};
    use crate::trace::trace_frame::test_support::common;

    #[test]
    fn mkdir_then_rmdir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d");

        let mut ctx = ReplayContext::new(ReplayConfig::default());
        ctx.resources.add_umask(100, 0o022);
        let mut mk = MkdirRecord {
            common: common(1, 100, 0, 0),
            path: path.clone(),
            mode: 0o777,
        };
        assert_eq!(mk.apply(&mut ctx).unwrap().ret, 0);
        assert!(path.is_dir());

        let mut rm = RmdirRecord {
            common: common(2, 100, 0, 0),
            path: path.clone(),
        };
        assert_eq!(rm.apply(&mut ctx).unwrap().ret, 0);
        assert!(!path.exists());
    }

    #[test]
    fn rmdir_of_a_missing_directory_reports_the_errno() {
        let mut ctx = ReplayContext::new(ReplayConfig::default());
        let mut rm = RmdirRecord {
            common: common(1, 100, -1, libc::ENOENT),
            path: "/nonexistent/retrace/test/dir".into(),
        };
        let outcome = rm.apply(&mut ctx).unwrap();
        assert_eq!(outcome.ret, -1);
        assert_eq!(outcome.errno, libc::ENOENT);
    }

    #[test]
    fn symlink_then_readlink_round_trip() {
        use super::{ReadlinkRecord, SymlinkRecord};
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("l");

        let mut ctx = ReplayContext::new(ReplayConfig::default());
        let mut ln = SymlinkRecord {
            common: common(1, 100, 0, 0),
            target: "/tmp/somewhere".into(),
            link_path: link.clone(),
        };
        assert_eq!(ln.apply(&mut ctx).unwrap().ret, 0);

        let mut rl = ReadlinkRecord {
            common: common(2, 100, 14, 0),
            path: link.clone(),
            data: Some(b"/tmp/somewhere".to_vec()),
            replayed: None,
        };
        let outcome = rl.apply(&mut ctx).unwrap();
        assert_eq!(outcome.ret, 14);
        assert!(rl.buffer_mismatch().is_none());

        rl.data = Some(b"/tmp/elsewhere".to_vec());
        assert!(rl.buffer_mismatch().unwrap().contains("link target"));
    }

    #[test]
    fn rename_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::File::create(&a).unwrap();

        let mut ctx = ReplayContext::new(ReplayConfig::default());
        let mut mv = RenameRecord {
            common: common(1, 100, 0, 0),
            old_path: a.clone(),
            new_path: b.clone(),
        };
        assert_eq!(mv.apply(&mut ctx).unwrap().ret, 0);
        assert!(!a.exists() && b.exists());

        let mut rm = UnlinkRecord {
            common: common(2, 100, 0, 0),
            path: b.clone(),
        };
        assert_eq!(rm.apply(&mut ctx).unwrap().ret, 0);
        assert!(!b.exists());
    }
}
