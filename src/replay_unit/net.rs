//! Calls whose side effects cannot be reproduced locally: sockets, pipes,
//! epoll instances, accepted connections. None of them is really executed;
//! a successful traced call registers its resulting fd(s) as SIMULATED so
//! every later consumer short-circuits with the traced result.

use crate::replay_unit::{ReplayContext, ReplayOutcome, ReplayableRecord};
use crate::resources::{FdFlags, ReplayedFd, ResourceError};
use crate::trace::extent_reader::ExtentReader;
use crate::trace::extent_writer::ExtentWriter;
use crate::trace::trace_frame::CommonFields;
use crate::trace::trace_stream::SyscallKind;
use std::os::unix::io::RawFd;

fn register_simulated(ctx: &mut ReplayContext, common: &CommonFields, traced_fd: RawFd) {
    ctx.resources
        .add_fd(common.pid, traced_fd, ReplayedFd::Simulated, FdFlags::empty());
}

pub struct SocketRecord {
    pub common: CommonFields,
    pub domain: i32,
    pub type_: i32,
    pub protocol: i32,
}

impl SocketRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_i32(self.domain);
        w.write_i32(self.type_);
        w.write_i32(self.protocol);
    }
}

impl ReplayableRecord for SocketRecord {
    const KIND: SyscallKind = SyscallKind::Socket;

    fn decode(r: &mut ExtentReader) -> SocketRecord {
        SocketRecord {
            common: CommonFields::decode(r),
            domain: r.read_i32(),
            type_: r.read_i32(),
            protocol: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        if self.common.succeeded() {
            register_simulated(ctx, &self.common, self.common.return_value as RawFd);
        }
        Ok(ReplayOutcome::simulated(&self.common))
    }
}

pub struct PipeRecord {
    pub common: CommonFields,
    pub read_fd: RawFd,
    pub write_fd: RawFd,
}

impl ReplayableRecord for PipeRecord {
    const KIND: SyscallKind = SyscallKind::Pipe;

    fn decode(r: &mut ExtentReader) -> PipeRecord {
        PipeRecord {
            common: CommonFields::decode(r),
            read_fd: r.read_i32(),
            write_fd: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        if self.common.succeeded() {
            register_simulated(ctx, &self.common, self.read_fd);
            register_simulated(ctx, &self.common, self.write_fd);
        }
        Ok(ReplayOutcome::simulated(&self.common))
    }
}

pub struct EpollCreateRecord {
    pub common: CommonFields,
    pub size: i32,
}

impl ReplayableRecord for EpollCreateRecord {
    const KIND: SyscallKind = SyscallKind::EpollCreate;

    fn decode(r: &mut ExtentReader) -> EpollCreateRecord {
        EpollCreateRecord {
            common: CommonFields::decode(r),
            size: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        if self.common.succeeded() {
            register_simulated(ctx, &self.common, self.common.return_value as RawFd);
        }
        Ok(ReplayOutcome::simulated(&self.common))
    }
}

pub struct AcceptRecord {
    pub common: CommonFields,
    pub traced_sockfd: RawFd,
}

impl ReplayableRecord for AcceptRecord {
    const KIND: SyscallKind = SyscallKind::Accept;

    fn decode(r: &mut ExtentReader) -> AcceptRecord {
        AcceptRecord {
            common: CommonFields::decode(r),
            traced_sockfd: r.read_i32(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        // The listening socket must at least exist in the table.
        ctx.resources.get_fd(self.common.pid, self.traced_sockfd)?;
        if self.common.succeeded() {
            register_simulated(ctx, &self.common, self.common.return_value as RawFd);
        }
        Ok(ReplayOutcome::simulated(&self.common))
    }
}
