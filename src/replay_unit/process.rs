//! Process-lifetime records: the synthetic startup umask record every
//! trace begins with, umask changes, and process exit.

use crate::replay_unit::{ReplayContext, ReplayOutcome, ReplayableRecord};
use crate::resources::ResourceError;
use crate::trace::extent_reader::ExtentReader;
use crate::trace::extent_writer::ExtentWriter;
use crate::trace::trace_frame::CommonFields;
use crate::trace::trace_stream::SyscallKind;
use libc::mode_t;
use nix::sys::mman::munmap;
use nix::unistd::close;

/// The replay process runs with its own umask forced to zero, so the
/// traced mask is pure bookkeeping: mode-bearing units apply it by hand.
pub struct UmaskRecord {
    pub common: CommonFields,
    pub mask: mode_t,
}

impl ReplayableRecord for UmaskRecord {
    const KIND: SyscallKind = SyscallKind::Umask;

    fn decode(r: &mut ExtentReader) -> UmaskRecord {
        UmaskRecord {
            common: CommonFields::decode(r),
            mask: r.read_u32() as mode_t,
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        ctx.resources.add_umask(self.common.pid, self.mask);
        Ok(ReplayOutcome {
            ret: self.common.return_value,
            errno: self.common.errno,
            simulated: false,
        })
    }
}

impl UmaskRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_u32(self.mask as u32);
    }
}

/// Replaying exit means releasing everything replay acquired on the
/// process's behalf: its fd table, its umask entry and its mappings.
pub struct ExitRecord {
    pub common: CommonFields,
    pub status: i32,
}

impl ReplayableRecord for ExitRecord {
    const KIND: SyscallKind = SyscallKind::Exit;

    fn decode(r: &mut ExtentReader) -> ExitRecord {
        ExitRecord {
            common: CommonFields::decode(r),
            status: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let pid = self.common.pid;
        for fd in ctx.resources.remove_fd_table(pid) {
            // Errors are uninteresting: the fd is gone either way.
            close(fd).unwrap_or(());
        }
        ctx.resources.remove_umask(pid);
        if let Some(area) = ctx.vm.remove(pid) {
            for chunk in area.clear() {
                unsafe {
                    munmap(chunk.addr as *mut libc::c_void, chunk.len).unwrap_or(());
                }
            }
        }
        Ok(ReplayOutcome {
            ret: self.common.return_value,
            errno: self.common.errno,
            simulated: false,
        })
    }
}

impl ExitRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_i32(self.status);
    }
}
