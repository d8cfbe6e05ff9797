//! Memory-mapping records. A traced mmap is reproduced at whatever address
//! the live kernel hands out; the address-space tracker remembers the
//! correspondence so that later memory-mediated reads and writes
//! (mmappread/mmappwrite) land on the right live bytes.

use crate::address_space::memory_range::MemoryRange;
use crate::address_space::{ReplayedChunk, VmNode};
use crate::replay_unit::{ReplayContext, ReplayOutcome, ReplayableRecord};
use crate::resources::{ReplayedFd, ResourceError};
use crate::trace::extent_reader::ExtentReader;
use crate::trace::extent_writer::ExtentWriter;
use crate::trace::trace_frame::CommonFields;
use crate::trace::trace_stream::SyscallKind;
use crate::util::fill_pattern;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::os::unix::io::RawFd;
use std::ptr;

fn munmap_chunks(chunks: &[ReplayedChunk]) {
    for chunk in chunks {
        unsafe {
            munmap(chunk.addr as *mut libc::c_void, chunk.len).unwrap_or(());
        }
    }
}

pub struct MmapRecord {
    pub common: CommonFields,
    /// Address the traced process requested (hint or fixed).
    pub traced_hint: u64,
    pub length: u64,
    pub prot: i32,
    pub flags: i32,
    pub traced_fd: RawFd,
    pub offset: i64,
}

impl MmapRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_u64(self.traced_hint);
        w.write_u64(self.length);
        w.write_i32(self.prot);
        w.write_i32(self.flags);
        w.write_i32(self.traced_fd);
        w.write_i64(self.offset);
    }
}

impl ReplayableRecord for MmapRecord {
    const KIND: SyscallKind = SyscallKind::Mmap;

    fn decode(r: &mut ExtentReader) -> MmapRecord {
        MmapRecord {
            common: CommonFields::decode(r),
            traced_hint: r.read_u64(),
            length: r.read_u64(),
            prot: r.read_i32(),
            flags: r.read_i32(),
            traced_fd: r.read_i32(),
            offset: r.read_i64(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        // A traced mmap that failed left nothing mapped; replay nothing.
        if self.common.errno != 0 {
            return Ok(ReplayOutcome::simulated(&self.common));
        }

        let anonymous = self.flags & libc::MAP_ANONYMOUS != 0;
        let (fd, replayed_fd) = if anonymous {
            (-1, ReplayedFd::Real(-1))
        } else {
            match ctx.resources.get_fd(self.common.pid, self.traced_fd)? {
                ReplayedFd::Real(fd) => (fd, ReplayedFd::Real(fd)),
                ReplayedFd::Simulated => return Ok(ReplayOutcome::simulated(&self.common)),
            }
        };

        // The live kernel picks the address; MAP_FIXED at the traced
        // address would stomp on this process's own layout.
        let flags = MapFlags::from_bits_truncate(self.flags & !libc::MAP_FIXED);
        let res = unsafe {
            mmap(
                ptr::null_mut(),
                self.length as usize,
                ProtFlags::from_bits_truncate(self.prot),
                flags,
                fd,
                self.offset,
            )
        };

        match res {
            Ok(addr) => {
                // The traced return value is the address the mapping
                // actually got; that interval is what later memory
                // operations refer to.
                let traced_start = self.common.return_value as u64;
                let evicted = ctx.vm.area(self.common.pid).map(VmNode::new(
                    traced_start,
                    addr as usize,
                    self.length,
                    self.traced_fd,
                    replayed_fd,
                ));
                munmap_chunks(&evicted);
                Ok(ReplayOutcome::real(addr as i64))
            }
            Err(e) => Ok(ReplayOutcome {
                ret: -1,
                errno: crate::replay_unit::errno_of_nix(e),
                simulated: false,
            }),
        }
    }

    fn returns_handle(&self) -> bool {
        true
    }
}

pub struct MunmapRecord {
    pub common: CommonFields,
    pub addr: u64,
    pub length: u64,
}

impl MunmapRecord {
    pub fn encode(&self, w: &mut ExtentWriter) {
        w.begin_record();
        self.common.encode(w);
        w.write_u64(self.addr);
        w.write_u64(self.length);
    }
}

impl ReplayableRecord for MunmapRecord {
    const KIND: SyscallKind = SyscallKind::Munmap;

    fn decode(r: &mut ExtentReader) -> MunmapRecord {
        MunmapRecord {
            common: CommonFields::decode(r),
            addr: r.read_u64(),
            length: r.read_u64(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        if self.common.errno != 0 {
            return Ok(ReplayOutcome::simulated(&self.common));
        }
        let pid = self.common.pid;
        let cut = ctx.vm.find_area(pid)?.unmap(self.addr, self.length);
        if cut.is_empty() {
            // The traced call succeeded over a region we never produced;
            // the node set is inconsistent with the trace.
            return Err(ResourceError::NoMapping {
                pid,
                addr: self.addr,
                size: self.length,
            });
        }
        munmap_chunks(&cut);
        Ok(ReplayOutcome::real(0))
    }
}

/// Translate `[addr, addr+count)` through the node set, requiring full
/// coverage, and hand each covered piece to `visit` as (live pointer,
/// offset into the traced interval, length).
fn walk_mapped<F: FnMut(usize, usize, usize)>(
    ctx: &ReplayContext,
    pid: libc::pid_t,
    addr: u64,
    count: u64,
    mut visit: F,
) -> Result<(), ResourceError> {
    let nodes = ctx.vm.find_area(pid)?.find_nodes(addr, count);
    let request = MemoryRange::new_range(addr, count);
    let mut covered = 0u64;
    for node in &nodes {
        let cut = node.range().intersect(&request);
        covered += cut.size();
        visit(
            node.translate(cut.start()),
            (cut.start() - addr) as usize,
            cut.size() as usize,
        );
    }
    if covered != count {
        return Err(ResourceError::NoMapping {
            pid,
            addr,
            size: count,
        });
    }
    Ok(())
}

/// A read the traced program performed through a mapping rather than a
/// descriptor. Replay dereferences the corresponding live addresses.
pub struct MmapPreadRecord {
    pub common: CommonFields,
    pub addr: u64,
    pub count: u64,
    pub data: Option<Vec<u8>>,
    replayed: Option<Vec<u8>>,
}

impl MmapPreadRecord {
    pub fn new(common: CommonFields, addr: u64, count: u64, data: Option<Vec<u8>>) -> Self {
        MmapPreadRecord {
            common,
            addr,
            count,
            data,
            replayed: None,
        }
    }
}

impl ReplayableRecord for MmapPreadRecord {
    const KIND: SyscallKind = SyscallKind::MmapPread;

    fn decode(r: &mut ExtentReader) -> MmapPreadRecord {
        let common = CommonFields::decode(r);
        let addr = r.read_u64();
        let count = r.read_u64();
        let data = if r.read_u8() != 0 {
            Some(r.read_data())
        } else {
            None
        };
        MmapPreadRecord::new(common, addr, count, data)
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let mut buf = vec![0u8; self.count as usize];
        walk_mapped(
            ctx,
            self.common.pid,
            self.addr,
            self.count,
            |live, offset, len| unsafe {
                ptr::copy_nonoverlapping(live as *const u8, buf[offset..].as_mut_ptr(), len);
            },
        )?;
        self.replayed = Some(buf);
        Ok(ReplayOutcome::real(self.count as i64))
    }

    fn buffer_mismatch(&self) -> Option<String> {
        let captured = self.data.as_ref()?;
        let replayed = self.replayed.as_ref()?;
        if captured == replayed {
            None
        } else {
            Some(format!(
                "memory read: {} traced bytes differ from the mapped contents",
                captured.len()
            ))
        }
    }
}

pub struct MmapPwriteRecord {
    pub common: CommonFields,
    pub addr: u64,
    pub count: u64,
}

impl ReplayableRecord for MmapPwriteRecord {
    const KIND: SyscallKind = SyscallKind::MmapPwrite;

    fn decode(r: &mut ExtentReader) -> MmapPwriteRecord {
        MmapPwriteRecord {
            common: CommonFields::decode(r),
            addr: r.read_u64(),
            count: r.read_u64(),
        }
    }

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError> {
        let mut buf = vec![0u8; self.count as usize];
        fill_pattern(ctx.config.pattern, &mut buf);
        walk_mapped(
            ctx,
            self.common.pid,
            self.addr,
            self.count,
            |live, offset, len| unsafe {
                ptr::copy_nonoverlapping(buf[offset..].as_ptr(), live as *mut u8, len);
            },
        )?;
        Ok(ReplayOutcome::real(self.count as i64))
    }
}

#[cfg(test)]
mod test {
    use super::{MmapPreadRecord, MmapRecord, MunmapRecord};
    use crate::replay_unit::{ReplayConfig, ReplayContext, ReplayableRecord};
    use crate::resources::ResourceError;
    use crate::trace::trace_frame::test_support::common;
    use std::io::Write;

    fn file_backed_ctx() -> (tempfile::TempDir, ReplayContext, i32) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![7u8; 8192]).unwrap();
        drop(f);
        let fd = nix::fcntl::open(
            &path,
            nix::fcntl::OFlag::O_RDONLY,
            nix::sys::stat::Mode::empty(),
        )
        .unwrap();

        let mut ctx = ReplayContext::new(ReplayConfig::default());
        ctx.resources.add_fd(
            100,
            3,
            crate::resources::ReplayedFd::Real(fd),
            crate::resources::FdFlags::empty(),
        );
        (dir, ctx, fd)
    }

    #[test]
    fn mmap_then_memory_read_resolves_through_the_tracker() {
        let (_dir, mut ctx, fd) = file_backed_ctx();

        // The traced mapping sat at 0x7f0000000000.
        let mut map_rec = MmapRecord {
            common: common(1, 100, 0x7f00_0000_0000, 0),
            traced_hint: 0,
            length: 4096,
            prot: libc::PROT_READ,
            flags: libc::MAP_PRIVATE,
            traced_fd: 3,
            offset: 0,
        };
        let outcome = map_rec.apply(&mut ctx).unwrap();
        assert!(outcome.ret > 0);

        let mut read_rec =
            MmapPreadRecord::new(common(2, 100, 16, 0), 0x7f00_0000_0010, 16, None);
        let outcome = read_rec.apply(&mut ctx).unwrap();
        assert_eq!(outcome.ret, 16);
        assert_eq!(read_rec.replayed.as_ref().unwrap(), &vec![7u8; 16]);

        let mut unmap_rec = MunmapRecord {
            common: common(3, 100, 0, 0),
            addr: 0x7f00_0000_0000,
            length: 4096,
        };
        assert_eq!(unmap_rec.apply(&mut ctx).unwrap().ret, 0);

        // The region is gone: another memory read is a consistency error.
        let mut read_rec =
            MmapPreadRecord::new(common(4, 100, 16, 0), 0x7f00_0000_0010, 16, None);
        match read_rec.apply(&mut ctx) {
            Err(ResourceError::NoMapping { pid: 100, .. }) => (),
            other => panic!("expected NoMapping, got {:?}", other.map(|o| o.ret)),
        }

        nix::unistd::close(fd).unwrap();
    }

    #[test]
    fn munmap_of_an_untracked_range_is_a_consistency_error() {
        let mut ctx = ReplayContext::new(ReplayConfig::default());
        ctx.vm.area(100); // the pid exists but mapped nothing here
        let mut rec = MunmapRecord {
            common: common(5, 100, 0, 0),
            addr: 0xdead_0000,
            length: 4096,
        };
        assert!(matches!(
            rec.apply(&mut ctx),
            Err(ResourceError::NoMapping { .. })
        ));
    }

    #[test]
    fn failed_traced_mmap_is_not_replayed() {
        let mut ctx = ReplayContext::new(ReplayConfig::default());
        let mut rec = MmapRecord {
            common: common(1, 100, -1, libc::ENOMEM),
            traced_hint: 0,
            length: 4096,
            prot: libc::PROT_READ,
            flags: libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            traced_fd: -1,
            offset: 0,
        };
        let outcome = rec.apply(&mut ctx).unwrap();
        assert!(outcome.simulated);
        assert_eq!(outcome.errno, libc::ENOMEM);
        assert!(ctx.vm.find_area(100).is_err());
    }
}
