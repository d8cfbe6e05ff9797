//! The single source of truth translating "what fd did the traced process
//! see" into "what fd does this replay process see", per pid. Also tracks
//! per-pid umasks and per-fd flag bits.
//!
//! Mutation is driven exclusively by the scheduler's single-threaded apply
//! path, so the tables need no locking of their own.

use libc::{mode_t, pid_t, AT_FDCWD};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::os::unix::io::RawFd;

/// A traced handle's replayed counterpart. `Simulated` marks handles whose
/// creating call was deliberately not executed (sockets, pipes, epoll
/// instances); every consumer of such a handle short-circuits and returns
/// the traced result.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReplayedFd {
    Real(RawFd),
    Simulated,
}

impl ReplayedFd {
    pub fn is_simulated(self) -> bool {
        self == ReplayedFd::Simulated
    }
}

impl Display for ReplayedFd {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayedFd::Real(fd) => write!(f, "{}", fd),
            ReplayedFd::Simulated => write!(f, "<simulated>"),
        }
    }
}

bitflags! {
    /// Per-fd flag bits we track across dup/fcntl. Only close-on-exec for
    /// now.
    pub struct FdFlags: u32 {
        const CLOEXEC = 0x1;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FdEntry {
    pub replayed: ReplayedFd,
    pub flags: FdFlags,
}

/// A resource-consistency violation: the trace references a handle or a
/// mapping that replay never produced. These are trace/programming defects,
/// reported with record context and fatal at the scheduler level.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ResourceError {
    UnknownFd { pid: pid_t, traced_fd: RawFd },
    UnknownPid { pid: pid_t },
    NoMapping { pid: pid_t, addr: u64, size: u64 },
}

impl Display for ResourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceError::UnknownFd { pid, traced_fd } => write!(
                f,
                "traced fd {} of pid {} has no replayed counterpart",
                traced_fd, pid
            ),
            ResourceError::UnknownPid { pid } => {
                write!(f, "pid {} has no resource table", pid)
            }
            ResourceError::NoMapping { pid, addr, size } => write!(
                f,
                "pid {} has no mapping intersecting [{:#x}, {:#x})",
                pid,
                addr,
                addr + size
            ),
        }
    }
}

impl Error for ResourceError {}

pub struct ResourcesManager {
    fd_tables: HashMap<pid_t, HashMap<RawFd, FdEntry>>,
    umasks: HashMap<pid_t, mode_t>,
}

impl ResourcesManager {
    pub fn new() -> ResourcesManager {
        ResourcesManager {
            fd_tables: HashMap::new(),
            umasks: HashMap::new(),
        }
    }

    /// Seed the standard descriptors and `AT_FDCWD` for `pid`. Called by
    /// the scheduler for the first observed pid before any record is
    /// applied; later pids get the same seeding on first touch (the trace
    /// format does not carry fork parentage).
    pub fn initialize(&mut self, pid: pid_t) {
        let table = self.fd_tables.entry(pid).or_insert_with(HashMap::new);
        for fd in &[0, 1, 2, AT_FDCWD] {
            table.entry(*fd).or_insert(FdEntry {
                replayed: ReplayedFd::Real(*fd),
                flags: FdFlags::empty(),
            });
        }
    }

    fn table_mut(&mut self, pid: pid_t) -> &mut HashMap<RawFd, FdEntry> {
        if !self.fd_tables.contains_key(&pid) {
            self.initialize(pid);
        }
        self.fd_tables.get_mut(&pid).unwrap()
    }

    /// Insert or overwrite a mapping. Re-adding the same traced fd is a
    /// dup2-style silent close-and-reuse and simply replaces the entry.
    pub fn add_fd(&mut self, pid: pid_t, traced_fd: RawFd, replayed: ReplayedFd, flags: FdFlags) {
        self.table_mut(pid)
            .insert(traced_fd, FdEntry { replayed, flags });
    }

    pub fn get_fd(&self, pid: pid_t, traced_fd: RawFd) -> Result<ReplayedFd, ResourceError> {
        self.fd_tables
            .get(&pid)
            .and_then(|t| t.get(&traced_fd))
            .map(|e| e.replayed)
            .ok_or(ResourceError::UnknownFd { pid, traced_fd })
    }

    /// Remove and return the mapping so the caller can decide whether to
    /// issue a real close() (skipped for `Simulated`).
    pub fn remove_fd(&mut self, pid: pid_t, traced_fd: RawFd) -> Result<ReplayedFd, ResourceError> {
        self.fd_tables
            .get_mut(&pid)
            .and_then(|t| t.remove(&traced_fd))
            .map(|e| e.replayed)
            .ok_or(ResourceError::UnknownFd { pid, traced_fd })
    }

    /// Drop the whole table for `pid`, returning every real fd replay
    /// opened on its behalf so the exit path can close them. The standard
    /// descriptors and `AT_FDCWD` belong to the replay process itself and
    /// are not handed out.
    pub fn remove_fd_table(&mut self, pid: pid_t) -> Vec<RawFd> {
        let table = match self.fd_tables.remove(&pid) {
            Some(table) => table,
            None => return Vec::new(),
        };
        let mut fds: Vec<RawFd> = table
            .iter()
            .filter(|(traced_fd, _)| **traced_fd > 2 && **traced_fd != AT_FDCWD)
            .filter_map(|(_, entry)| match entry.replayed {
                ReplayedFd::Real(fd) => Some(fd),
                ReplayedFd::Simulated => None,
            })
            .collect();
        fds.sort_unstable();
        fds.dedup();
        fds
    }

    pub fn get_flags(&self, pid: pid_t, traced_fd: RawFd) -> Result<FdFlags, ResourceError> {
        self.fd_tables
            .get(&pid)
            .and_then(|t| t.get(&traced_fd))
            .map(|e| e.flags)
            .ok_or(ResourceError::UnknownFd { pid, traced_fd })
    }

    pub fn add_flags(
        &mut self,
        pid: pid_t,
        traced_fd: RawFd,
        flags: FdFlags,
    ) -> Result<(), ResourceError> {
        self.fd_tables
            .get_mut(&pid)
            .and_then(|t| t.get_mut(&traced_fd))
            .map(|e| e.flags.insert(flags))
            .ok_or(ResourceError::UnknownFd { pid, traced_fd })
    }

    pub fn add_umask(&mut self, pid: pid_t, mask: mode_t) {
        self.umasks.insert(pid, mask);
    }

    pub fn get_umask(&self, pid: pid_t) -> Result<mode_t, ResourceError> {
        self.umasks
            .get(&pid)
            .copied()
            .ok_or(ResourceError::UnknownPid { pid })
    }

    pub fn remove_umask(&mut self, pid: pid_t) {
        self.umasks.remove(&pid);
    }
}

#[cfg(test)]
mod test {
    use super::{FdFlags, ReplayedFd, ResourceError, ResourcesManager};
    use libc::AT_FDCWD;

    #[test]
    fn initialize_seeds_standard_fds() {
        let mut rm = ResourcesManager::new();
        rm.initialize(100);
        assert_eq!(rm.get_fd(100, 0).unwrap(), ReplayedFd::Real(0));
        assert_eq!(rm.get_fd(100, 2).unwrap(), ReplayedFd::Real(2));
        assert_eq!(rm.get_fd(100, AT_FDCWD).unwrap(), ReplayedFd::Real(AT_FDCWD));
    }

    #[test]
    fn latest_add_wins() {
        let mut rm = ResourcesManager::new();
        rm.add_fd(100, 3, ReplayedFd::Real(17), FdFlags::empty());
        rm.add_fd(100, 3, ReplayedFd::Real(23), FdFlags::CLOEXEC);
        assert_eq!(rm.get_fd(100, 3).unwrap(), ReplayedFd::Real(23));
        assert_eq!(rm.get_flags(100, 3).unwrap(), FdFlags::CLOEXEC);
    }

    #[test]
    fn remove_then_get_is_an_error() {
        let mut rm = ResourcesManager::new();
        rm.add_fd(100, 3, ReplayedFd::Real(17), FdFlags::empty());
        assert_eq!(rm.remove_fd(100, 3).unwrap(), ReplayedFd::Real(17));
        assert_eq!(
            rm.get_fd(100, 3),
            Err(ResourceError::UnknownFd {
                pid: 100,
                traced_fd: 3
            })
        );
    }

    #[test]
    fn unknown_pid_lookup_is_an_error() {
        let rm = ResourcesManager::new();
        assert!(rm.get_fd(999, 0).is_err());
        assert!(rm.get_umask(999).is_err());
    }

    #[test]
    fn fd_table_teardown_returns_only_real_private_fds() {
        let mut rm = ResourcesManager::new();
        rm.initialize(100);
        rm.add_fd(100, 3, ReplayedFd::Real(17), FdFlags::empty());
        rm.add_fd(100, 4, ReplayedFd::Simulated, FdFlags::empty());
        rm.add_fd(100, 5, ReplayedFd::Real(19), FdFlags::empty());

        let mut fds = rm.remove_fd_table(100);
        fds.sort_unstable();
        assert_eq!(fds, vec![17, 19]);
        // The table is gone afterwards.
        assert!(rm.get_fd(100, 3).is_err());
        assert!(rm.remove_fd_table(100).is_empty());
    }

    #[test]
    fn umask_lifecycle() {
        let mut rm = ResourcesManager::new();
        rm.add_umask(100, 0o022);
        assert_eq!(rm.get_umask(100).unwrap(), 0o022);
        rm.add_umask(100, 0o077);
        assert_eq!(rm.get_umask(100).unwrap(), 0o077);
        rm.remove_umask(100);
        assert!(rm.get_umask(100).is_err());
    }

    #[test]
    fn simulated_fd_round_trip() {
        let mut rm = ResourcesManager::new();
        rm.add_fd(100, 7, ReplayedFd::Simulated, FdFlags::empty());
        let got = rm.get_fd(100, 7).unwrap();
        assert!(got.is_simulated());
        assert_eq!(rm.remove_fd(100, 7).unwrap(), ReplayedFd::Simulated);
    }
}
