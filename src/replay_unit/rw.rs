//! Descriptor I/O: read, write, pread, pwrite, lseek. Write payloads are
//! regenerated from the configured pattern; read buffers can be checked
//! against captured data under --verify.

use crate::replay_unit::{ReplayContext, ReplayOutcome, ReplayableRecord};
use crate::resources::{ReplayedFd, ResourceError};
use crate::trace::extent_reader::ExtentReader;
use crate::trace::extent_writer::ExtentWriter;
use crate::trace::trace_frame::CommonFields;
use crate::trace::trace_stream::SyscallKind;
use crate::util::fill_pattern;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{lseek, read, write, Whence};
use std::os::unix::io::RawFd;

/// Compare a replayed buffer against captured bytes, if the trace carried
/// any.
fn compare_captured(captured: &Option<Vec<u8>>, replayed: &Option<Vec<u8>>) -> Option<String> {
    let captured = captured.as_ref()?;
    let replayed = replayed.as_ref()?;
    if captured == replayed {
        return None;
    }
    let min_len = std::cmp::min(captured.len(), replayed.len());
    let diff_at = (0..min_len)
        .find(|&i| captured[i] != replayed[i])
        .unwrap_or(min_len);
    Some(format!(
        "buffer: traced {} bytes, replayed {} bytes, first difference at offset {}",
        captured.len(),
        replayed.len(),
        diff_at
    ))
}

pub struct ReadRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub count: u64,
    /// Captured file data, when the capture tool stored it.
    pub data: Option<Vec<u8>>,
    replayed: Option<Vec<u8>>,
}

impl ReadRecord {
    pub fn new(common: CommonFields, traced_fd: RawFd, count: u64, data: Option<Vec<u8>>) -> Self {
        ReadRecord {
            common,
            traced_fd,
            count,
            data,
            replayed: None,
        }
    }

    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_i32(self.traced_fd);
        w.write_u64(self.count);
        match &self.data {
            Some(data) => {
                w.write_u8(1);
                w.write_data(data);
            }
            None => w.write_u8(0),
        }
    }
}

impl ReplayableRecord for ReadRecord {
    const KIND: SyscallKind = SyscallKind::Read;

    fn decode(r: &mut ExtentReader) -> ReadRecord {
        let common = CommonFields::decode(r);
        let traced_fd = r.read_i32();
        let count = r.read_u64();
        let data = if r.read_u8() != 0 {
            Some(r.read_data())
        } else {
            None
        };
        ReadRecord::new(common, traced_fd, count, data)
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let fd = match ctx.resources.get_fd(self.common.pid, self.traced_fd)? {
            ReplayedFd::Real(fd) => fd,
            ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
        };
        let mut buf = vec![0u8; self.count as usize];
        let res = read(fd, &mut buf);
        if let Ok(n) = res {
            buf.truncate(n);
            self.replayed = Some(buf);
        }
        Ok(ReplayOutcome::of_size(res))
    }

    fn buffer_mismatch(&self) -> Option<String> {
        compare_captured(&self.data, &self.replayed)
    }
}

pub struct WriteRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub count: u64,
}

impl WriteRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_i32(self.traced_fd);
        w.write_u64(self.count);
    }
}

impl ReplayableRecord for WriteRecord {
    const KIND: SyscallKind = SyscallKind::Write;

    fn decode(r: &mut ExtentReader) -> WriteRecord {
        WriteRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
            count: r.read_u64(),
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
        let mut buf = vec![0u8; self.count as usize];
        fill_pattern(ctx.config.pattern, &mut buf);
        Ok(ReplayOutcome::of_size(write(fd, &buf)))
    }
}

pub struct PreadRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub count: u64,
    pub offset: i64,
    pub data: Option<Vec<u8>>,
    replayed: Option<Vec<u8>>,
}

impl ReplayableRecord for PreadRecord {
    const KIND: SyscallKind = SyscallKind::Pread;

    fn decode(r: &mut ExtentReader) -> PreadRecord {
        let common = CommonFields::decode(r);
        let traced_fd = r.read_i32();
        let count = r.read_u64();
        let offset = r.read_i64();
        let data = if r.read_u8() != 0 {
            Some(r.read_data())
        } else {
            None
        };
        PreadRecord {
            common,
            traced_fd,
            count,
            offset,
            data,
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
        let mut buf = vec![0u8; self.count as usize];
        let res = pread(fd, &mut buf, self.offset);
        if let Ok(n) = res {
            buf.truncate(n);
            self.replayed = Some(buf);
        }
        Ok(ReplayOutcome::of_size(res))
    }

    fn buffer_mismatch(&self) -> Option<String> {
        compare_captured(&self.data, &self.replayed)
    }
}

pub struct PwriteRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub count: u64,
    pub offset: i64,
}

impl ReplayableRecord for PwriteRecord {
    const KIND: SyscallKind = SyscallKind::Pwrite;

    fn decode(r: &mut ExtentReader) -> PwriteRecord {
        PwriteRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
            count: r.read_u64(),
            offset: r.read_i64(),
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
        let mut buf = vec![0u8; self.count as usize];
        fill_pattern(ctx.config.pattern, &mut buf);
        Ok(ReplayOutcome::of_size(pwrite(fd, &buf, self.offset)))
    }
}

pub struct LseekRecord {
    pub common: CommonFields,
    pub traced_fd: RawFd,
    pub offset: i64,
    pub whence: i32,
}

impl LseekRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_i32(self.traced_fd);
        w.write_i64(self.offset);
        w.write_i32(self.whence);
    }
}

impl ReplayableRecord for LseekRecord {
    const KIND: SyscallKind = SyscallKind::Lseek;

    fn decode(r: &mut ExtentReader) -> LseekRecord {
        LseekRecord {
            common: CommonFields::decode(r),
            traced_fd: r.read_i32(),
            offset: r.read_i64(),
            whence: r.read_i32(),
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
        let whence = match self.whence {
            libc::SEEK_SET => Whence::SeekSet,
            libc::SEEK_CUR => Whence::SeekCur,
            libc::SEEK_END => Whence::SeekEnd,
            libc::SEEK_DATA => Whence::SeekData,
            libc::SEEK_HOLE => Whence::SeekHole,
            other => {
                fatal!("lseek record with unknown whence {}", other);
            }
        };
        Ok(ReplayOutcome::of(lseek(fd, self.offset, whence)))
    }
}
