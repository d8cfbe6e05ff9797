//! Tracks, per traced process, which traced virtual address ranges are
//! currently mapped and where their replayed counterparts live, so that
//! memory-mediated reads and writes can be redirected to the right live
//! address.
//!
//! The interesting part is the overlap algebra: an munmap (or a probe for a
//! memory read) may cover several mapped regions and cover each of them
//! only partially. Every existing node falls into exactly one of four
//! relations with the requested interval and is truncated, shifted,
//! deleted or split accordingly.

pub mod memory_range;

use crate::address_space::memory_range::MemoryRange;
use crate::resources::{ReplayedFd, ResourceError};
use libc::pid_t;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// One contiguous mapped region: the traced interval and the live address
/// it was reproduced at.
#[derive(Copy, Clone, Debug)]
pub struct VmNode {
    range: MemoryRange,
    replayed_start: usize,
    traced_fd: RawFd,
    replayed_fd: ReplayedFd,
}

impl VmNode {
    pub fn new(
        traced_start: u64,
        replayed_start: usize,
        size: u64,
        traced_fd: RawFd,
        replayed_fd: ReplayedFd,
    ) -> VmNode {
        VmNode {
            range: MemoryRange::new_range(traced_start, size),
            replayed_start,
            traced_fd,
            replayed_fd,
        }
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }

    pub fn replayed_start(&self) -> usize {
        self.replayed_start
    }

    pub fn traced_fd(&self) -> RawFd {
        self.traced_fd
    }

    pub fn replayed_fd(&self) -> ReplayedFd {
        self.replayed_fd
    }

    /// Live address corresponding to `traced_addr`, which must lie inside
    /// this node's range.
    pub fn translate(&self, traced_addr: u64) -> usize {
        debug_assert!(self.range.contains_ptr(traced_addr));
        self.replayed_start + (traced_addr - self.range.start()) as usize
    }
}

/// How an existing node relates to a requested interval. The four
/// overlapping kinds are mutually exclusive for a well-formed,
/// non-overlapping node set.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Overlap {
    None,
    /// Request begins strictly inside the node and reaches its end or
    /// beyond: the node's tail is cut.
    Left,
    /// Request ends strictly inside the node and starts at its beginning
    /// or before: the node's head is cut.
    Right,
    /// Node fully inside the request: the node goes away.
    Enclosed,
    /// Request strictly inside the node: a hole is punched in the middle.
    Enclosing,
}

fn classify(node: &MemoryRange, request: &MemoryRange) -> Overlap {
    if !node.intersects(request) {
        Overlap::None
    } else if request.contains(node) {
        Overlap::Enclosed
    } else if node.start() < request.start() && request.end() < node.end() {
        Overlap::Enclosing
    } else if node.start() < request.start() {
        Overlap::Left
    } else {
        Overlap::Right
    }
}

/// A replayed chunk of memory that fell out of the node set, to be really
/// munmap'ed by the caller.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ReplayedChunk {
    pub addr: usize,
    pub len: usize,
}

/// The per-process collection of mapped regions. Nodes are owned by index
/// in a plain vector; the mutex exists because areas are created lazily on
/// first access, not because two threads ever race on one (replay is
/// single-threaded through the scheduler).
pub struct VmArea {
    nodes: Mutex<Vec<VmNode>>,
}

impl VmArea {
    pub fn new() -> VmArea {
        VmArea {
            nodes: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    /// Record a fresh mapping. The caller has already performed the real
    /// mmap; overlap with existing nodes is resolved first, mirroring the
    /// kernel's map-over semantics.
    pub fn map(&self, node: VmNode) -> Vec<ReplayedChunk> {
        let evicted = self.unmap(node.range().start(), node.range().size());
        let mut nodes = self.nodes.lock().unwrap();
        let pos = nodes
            .iter()
            .position(|n| n.range.start() > node.range.start())
            .unwrap_or(nodes.len());
        nodes.insert(pos, node);
        evicted
    }

    /// Remove `[addr, addr+size)` from the node set. Each intersecting
    /// node receives exactly one of the four overlap treatments. Returns
    /// the replayed chunks that are no longer tracked.
    pub fn unmap(&self, addr: u64, size: u64) -> Vec<ReplayedChunk> {
        let request = MemoryRange::new_range(addr, size);
        let mut cut = Vec::new();
        let mut nodes = self.nodes.lock().unwrap();
        let mut i = 0;
        while i < nodes.len() {
            match classify(&nodes[i].range, &request) {
                Overlap::None => {
                    i += 1;
                }
                Overlap::Left => {
                    let node = &mut nodes[i];
                    cut.push(ReplayedChunk {
                        addr: node.translate(request.start()),
                        len: (node.range.end() - request.start()) as usize,
                    });
                    node.range =
                        MemoryRange::from_range(node.range.start(), request.start());
                    i += 1;
                }
                Overlap::Right => {
                    let node = &mut nodes[i];
                    let delta = (request.end() - node.range.start()) as usize;
                    cut.push(ReplayedChunk {
                        addr: node.replayed_start,
                        len: delta,
                    });
                    node.range = MemoryRange::from_range(request.end(), node.range.end());
                    node.replayed_start += delta;
                    i += 1;
                }
                Overlap::Enclosed => {
                    let node = nodes.remove(i);
                    cut.push(ReplayedChunk {
                        addr: node.replayed_start,
                        len: node.range.size() as usize,
                    });
                }
                Overlap::Enclosing => {
                    let node = &mut nodes[i];
                    cut.push(ReplayedChunk {
                        addr: node.translate(request.start()),
                        len: request.size() as usize,
                    });
                    let tail = VmNode {
                        range: MemoryRange::from_range(request.end(), node.range.end()),
                        replayed_start: node.replayed_start
                            + (request.end() - node.range.start()) as usize,
                        traced_fd: node.traced_fd,
                        replayed_fd: node.replayed_fd,
                    };
                    node.range =
                        MemoryRange::from_range(node.range.start(), request.start());
                    nodes.insert(i + 1, tail);
                    i += 2;
                }
            }
        }
        cut
    }

    /// Every node whose interval intersects `[addr, addr+size)`, for
    /// translating a traced memory address into the live replayed address.
    pub fn find_nodes(&self, addr: u64, size: u64) -> Vec<VmNode> {
        let request = MemoryRange::new_range(addr, size);
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.range.intersects(&request))
            .copied()
            .collect()
    }

    /// Drop every node, handing the replayed regions back for teardown.
    pub fn clear(&self) -> Vec<ReplayedChunk> {
        let mut nodes = self.nodes.lock().unwrap();
        let cut = nodes
            .iter()
            .map(|n| ReplayedChunk {
                addr: n.replayed_start,
                len: n.range.size() as usize,
            })
            .collect();
        nodes.clear();
        cut
    }
}

/// One address-space tracker per traced process, created lazily on first
/// access and owned by the replay context for the run's duration.
pub struct VmManager {
    areas: HashMap<pid_t, VmArea>,
}

impl VmManager {
    pub fn new() -> VmManager {
        VmManager {
            areas: HashMap::new(),
        }
    }

    pub fn area(&mut self, pid: pid_t) -> &VmArea {
        self.areas.entry(pid).or_insert_with(VmArea::new)
    }

    /// Like `area` but does not create: probing a pid that never mapped
    /// anything is a consistency error for the callers that use this.
    pub fn find_area(&self, pid: pid_t) -> Result<&VmArea, ResourceError> {
        self.areas.get(&pid).ok_or(ResourceError::UnknownPid { pid })
    }

    pub fn remove(&mut self, pid: pid_t) -> Option<VmArea> {
        self.areas.remove(&pid)
    }
}

#[cfg(test)]
mod test {
    use super::{ReplayedChunk, VmArea, VmManager, VmNode};
    use crate::resources::ReplayedFd;

    fn node(traced_start: u64, replayed_start: usize, size: u64) -> VmNode {
        VmNode::new(traced_start, replayed_start, size, 3, ReplayedFd::Real(7))
    }

    fn assert_non_overlapping(area: &VmArea) {
        let nodes = area.find_nodes(0, u64::MAX);
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                assert!(
                    !a.range().intersects(&b.range()),
                    "{} overlaps {}",
                    a.range(),
                    b.range()
                );
            }
        }
    }

    #[test]
    fn left_overlap_cuts_the_tail() {
        let area = VmArea::new();
        area.map(node(0, 0x1000, 100));
        let cut = area.unmap(40, 100);
        assert_eq!(
            cut,
            vec![ReplayedChunk {
                addr: 0x1000 + 40,
                len: 60
            }]
        );

        let nodes = area.find_nodes(0, 100);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].range().start(), 0);
        assert_eq!(nodes[0].range().end(), 40);
        assert_non_overlapping(&area);
    }

    #[test]
    fn right_overlap_cuts_the_head_and_shifts_the_replayed_base() {
        let area = VmArea::new();
        area.map(node(100, 0x1000, 100));
        let cut = area.unmap(50, 100);
        assert_eq!(
            cut,
            vec![ReplayedChunk {
                addr: 0x1000,
                len: 50
            }]
        );

        let nodes = area.find_nodes(0, 1000);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].range().start(), 150);
        assert_eq!(nodes[0].range().end(), 200);
        assert_eq!(nodes[0].replayed_start(), 0x1000 + 50);
        // The traced-to-replayed offset is unchanged for surviving bytes.
        assert_eq!(nodes[0].translate(150), 0x1000 + 50);
        assert_non_overlapping(&area);
    }

    #[test]
    fn enclosed_node_is_deleted_outright() {
        let area = VmArea::new();
        area.map(node(0, 0x1000, 10));
        area.map(node(100, 0x2000, 10));
        let cut = area.unmap(0, 20);
        assert_eq!(
            cut,
            vec![ReplayedChunk {
                addr: 0x1000,
                len: 10
            }]
        );

        // The unrelated node is untouched.
        let nodes = area.find_nodes(0, 1000);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].range().start(), 100);
        assert_non_overlapping(&area);
    }

    #[test]
    fn enclosing_request_splits_the_node() {
        let area = VmArea::new();
        area.map(node(0, 0x1000, 100));
        let cut = area.unmap(40, 20);
        assert_eq!(
            cut,
            vec![ReplayedChunk {
                addr: 0x1000 + 40,
                len: 20
            }]
        );

        let nodes = area.find_nodes(0, 100);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].range().start(), 0);
        assert_eq!(nodes[0].range().end(), 40);
        assert_eq!(nodes[0].replayed_start(), 0x1000);
        assert_eq!(nodes[1].range().start(), 60);
        assert_eq!(nodes[1].range().end(), 100);
        assert_eq!(nodes[1].replayed_start(), 0x1000 + 60);
        assert_non_overlapping(&area);
    }

    #[test]
    fn one_unmap_touches_several_nodes() {
        let area = VmArea::new();
        area.map(node(0, 0x1000, 100));
        area.map(node(100, 0x2000, 100));
        area.map(node(200, 0x3000, 100));
        // Tail of the first, all of the second, head of the third.
        let cut = area.unmap(50, 200);
        assert_eq!(cut.len(), 3);

        let nodes = area.find_nodes(0, 1000);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].range().end(), 50);
        assert_eq!(nodes[1].range().start(), 250);
        assert_eq!(nodes[1].replayed_start(), 0x3000 + 50);
        assert_non_overlapping(&area);
    }

    #[test]
    fn map_over_existing_region_evicts_it_first() {
        let area = VmArea::new();
        area.map(node(0, 0x1000, 100));
        let evicted = area.map(node(50, 0x5000, 100));
        assert_eq!(
            evicted,
            vec![ReplayedChunk {
                addr: 0x1000 + 50,
                len: 50
            }]
        );

        let nodes = area.find_nodes(60, 1);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].replayed_start(), 0x5000);
        assert_non_overlapping(&area);
    }

    #[test]
    fn random_map_unmap_sequence_stays_non_overlapping() {
        let area = VmArea::new();
        // A fixed pseudo-random walk; the property is the invariant, not
        // the particular sequence.
        let mut x: u64 = 0x243f_6a88_85a3_08d3;
        for i in 0..200 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let start = (x >> 33) % 4000;
            let size = 1 + (x >> 17) % 300;
            if i % 3 == 0 {
                area.unmap(start, size);
            } else {
                area.map(node(start, 0x10_0000 + start as usize, size));
            }
            assert_non_overlapping(&area);
        }
    }

    #[test]
    fn translation_within_a_node() {
        let n = node(0x7f00, 0x2000, 0x100);
        assert_eq!(n.translate(0x7f00), 0x2000);
        assert_eq!(n.translate(0x7f80), 0x2080);
    }

    #[test]
    fn manager_creates_lazily_and_removes() {
        let mut vm = VmManager::new();
        assert!(vm.find_area(100).is_err());
        vm.area(100).map(node(0, 0x1000, 10));
        assert_eq!(vm.find_area(100).unwrap().len(), 1);
        let area = vm.remove(100).unwrap();
        assert_eq!(area.clear().len(), 1);
        assert!(vm.find_area(100).is_err());
    }
}
