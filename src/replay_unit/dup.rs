//! Descriptor duplication and fcntl. Replay never reproduces traced fd
//! *numbers*, so dup2/dup3 become plain dups plus table bookkeeping; the
//! implicit close of the reused slot is carried out on the previously
//! mapped real fd.

use crate::replay_unit::{ReplayContext, ReplayOutcome, ReplayableRecord};
use crate::resources::{FdFlags, ReplayedFd, ResourceError};
use crate::trace::extent_reader::ExtentReader;
use crate::trace::extent_writer::ExtentWriter;
use crate::trace::trace_frame::CommonFields;
use crate::trace::trace_stream::SyscallKind;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{close, dup};
use std::os::unix::io::RawFd;

/// dup2-style reuse of a traced fd slot implicitly closes whatever the
/// slot held. Mirror that on the real fd before overwriting the entry.
fn close_reused_slot(ctx: &mut ReplayContext, pid: libc::pid_t, traced_fd: RawFd) {
    if let Ok(ReplayedFd::Real(prev)) = ctx.resources.get_fd(pid, traced_fd) {
        if prev > 2 {
            close(prev).unwrap_or(());
        }
    }
}

fn replay_dup(
    ctx: &mut ReplayContext,
    common: &CommonFields,
    traced_oldfd: RawFd,
    traced_newfd: RawFd,
    flags: FdFlags,
) -> Result<ReplayOutcome, ResourceError> {
    // dup2(fd, fd) is a kernel no-op; duplicating here would close the
    // very fd the entry still refers to.
    if traced_oldfd == traced_newfd {
        ctx.resources.get_fd(common.pid, traced_oldfd)?;
        return Ok(ReplayOutcome::simulated(common));
    }
    match ctx.resources.get_fd(common.pid, traced_oldfd)? {
        ReplayedFd::Simulated => {
            if common.succeeded() {
                close_reused_slot(ctx, common.pid, traced_newfd);
                ctx.resources
                    .add_fd(common.pid, traced_newfd, ReplayedFd::Simulated, flags);
            }
            Ok(ReplayOutcome::simulated(common))
        }
        ReplayedFd::Real(oldfd) => {
            let res = dup(oldfd);
            let outcome = ReplayOutcome::of(res);
            if common.succeeded() && outcome.ret >= 0 {
                close_reused_slot(ctx, common.pid, traced_newfd);
                ctx.resources.add_fd(
                    common.pid,
                    traced_newfd,
                    ReplayedFd::Real(outcome.ret as RawFd),
                    flags,
                );
            } else if outcome.ret >= 0 {
                close(outcome.ret as RawFd).unwrap_or(());
            }
            Ok(outcome)
        }
    }
}

pub struct DupRecord {
    pub common: CommonFields,
    pub traced_oldfd: RawFd,
}

impl DupRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_i32(self.traced_oldfd);
    }
}

impl ReplayableRecord for DupRecord {
    const KIND: SyscallKind = SyscallKind::Dup;

    fn decode(r: &mut ExtentReader) -> DupRecord {
        DupRecord {
            common: CommonFields::decode(r),
            traced_oldfd: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        // The duplicate lives at the traced return value; dup clears
        // close-on-exec on the new fd.
        let traced_newfd = self.common.return_value as RawFd;
        replay_dup(
            ctx,
            &self.common,
            self.traced_oldfd,
            traced_newfd,
            FdFlags::empty(),
        )
    }

    fn returns_handle(&self) -> bool {
        true
    }
}

pub struct Dup2Record {
    pub common: CommonFields,
    pub traced_oldfd: RawFd,
    pub traced_newfd: RawFd,
}

impl ReplayableRecord for Dup2Record {
    const KIND: SyscallKind = SyscallKind::Dup2;

    fn decode(r: &mut ExtentReader) -> Dup2Record {
        Dup2Record {
            common: CommonFields::decode(r),
            traced_oldfd: r.read_i32(),
            traced_newfd: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        replay_dup(
            ctx,
            &self.common,
            self.traced_oldfd,
            self.traced_newfd,
            FdFlags::empty(),
        )
    }

    fn returns_handle(&self) -> bool {
        true
    }
}

pub struct Dup3Record {
    pub common: CommonFields,
    pub traced_oldfd: RawFd,
    pub traced_newfd: RawFd,
    pub flags: i32,
}

impl ReplayableRecord for Dup3Record {
    const KIND: SyscallKind = SyscallKind::Dup3;

    fn decode(r: &mut ExtentReader) -> Dup3Record {
        Dup3Record {
            common: CommonFields::decode(r),
            traced_oldfd: r.read_i32(),
            traced_newfd: r.read_i32(),
            flags: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let fd_flags = if self.flags & libc::O_CLOEXEC != 0 {
            FdFlags::CLOEXEC
        } else {
            FdFlags::empty()
        };
        replay_dup(
            ctx,
            &self.common,
            self.traced_oldfd,
            self.traced_newfd,
            fd_flags,
        )
    }

    fn returns_handle(&self) -> bool {
        true
    }
}

pub struct FcntlRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub cmd: i32,
    pub arg: i64,
}

impl ReplayableRecord for FcntlRecord {
    const KIND: SyscallKind = SyscallKind::Fcntl;

    fn decode(r: &mut ExtentReader) -> FcntlRecord {
        FcntlRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
            cmd: r.read_i32(),
            arg: r.read_i64(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let pid = self.common.pid;
        match self.cmd {
            // Duplications: the new traced fd is the return value. The
            // close-on-exec state of the duplicate depends on the command.
            libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => {
                let fd_flags = if self.cmd == libc::F_DUPFD_CLOEXEC {
                    FdFlags::CLOEXEC
                } else {
                    FdFlags::empty()
                };
                let traced_newfd = self.common.return_value as RawFd;
                replay_dup(ctx, &self.common, self.traced_fd, traced_newfd, fd_flags)
            }
            // Close-on-exec is table state: the replayed process never
            // execs, so there is nothing to tell the kernel.
            libc::F_GETFD => {
                ctx.resources.get_flags(pid, self.traced_fd)?;
                Ok(ReplayOutcome::simulated(&self.common))
            }
            libc::F_SETFD => {
                if self.arg as i32 & libc::FD_CLOEXEC != 0 {
                    ctx.resources
                        .add_flags(pid, self.traced_fd, FdFlags::CLOEXEC)?;
                } else {
                    ctx.resources.get_flags(pid, self.traced_fd)?;
                }
                Ok(ReplayOutcome::simulated(&self.common))
            }
            libc::F_GETFL => match ctx.resources.get_fd(pid, self.traced_fd)? {
                ReplayedFd::Real(fd) => Ok(ReplayOutcome::of(fcntl(fd, FcntlArg::F_GETFL))),
                ReplayedFd::Simulated => Ok(ReplayOutcome::simulated(&self.common)),
            },
            libc::F_SETFL => match ctx.resources.get_fd(pid, self.traced_fd)? {
                ReplayedFd::Real(fd) => Ok(ReplayOutcome::of(fcntl(
                    fd,
                    FcntlArg::F_SETFL(OFlag::from_bits_truncate(self.arg as i32)),
                ))),
                ReplayedFd::Simulated => Ok(ReplayOutcome::simulated(&self.common)),
            },
            // Locks, owners, leases: nothing observable to reproduce.
            _ => {
                ctx.resources.get_fd(pid, self.traced_fd)?;
                Ok(ReplayOutcome::simulated(&self.common))
            }
        }
    }

    fn returns_handle(&self) -> bool {
        // Only true for the F_DUPFD commands, but a blanket success/failure
        // comparison is right for the others too: F_GETFL results depend on
        // flags replay does not force (O_LARGEFILE and friends).
        true
    }
}
