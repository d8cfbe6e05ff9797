//! The shared state machine every syscall adapter runs through, and the
//! verification scaffolding they all report into.
//!
//! A unit owns exactly one extent stream (one syscall type) and at most one
//! decoded record at a time. Lifecycle per record:
//! `Idle/Advanced -> RecordLoaded -> Applied -> Verified|Skipped -> Advanced`,
//! then back to `RecordLoaded` until the stream is exhausted (`Done`).
//! The scheduler is the only driver of these transitions.

pub mod dup;
pub mod fs_meta;
pub mod fs_namespace;
pub mod mmap;
pub mod net;
pub mod open;
pub mod process;
pub mod rw;

use crate::address_space::VmManager;
use crate::flags::{Flags, PatternKind, WarnLevel};
use crate::log::{LogError, LogInfo, LogWarn};
use crate::resources::{ResourceError, ResourcesManager};
use crate::trace::extent_reader::ExtentReader;
use crate::trace::trace_frame::{CommonFields, UniqueId};
use crate::trace::trace_stream::SyscallKind;
use libc::pid_t;

/// Run configuration distilled from the CLI flags. Carried in the context
/// so the core stays testable without global state.
#[derive(Clone)]
pub struct ReplayConfig {
    pub verbose: bool,
    pub verify: bool,
    pub warn: WarnLevel,
    pub pattern: PatternKind,
}

impl ReplayConfig {
    pub fn from_flags() -> ReplayConfig {
        let f = Flags::get();
        ReplayConfig {
            verbose: f.verbose,
            verify: f.verify,
            warn: f.warn,
            pattern: f.pattern,
        }
    }

    /// Are replayed results compared against traced ones at all?
    pub fn compare_results(&self) -> bool {
        self.verify || self.warn != WarnLevel::Ignore
    }
}

impl Default for ReplayConfig {
    fn default() -> ReplayConfig {
        ReplayConfig {
            verbose: false,
            verify: false,
            warn: WarnLevel::Ignore,
            pattern: PatternKind::Fixed(0),
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct Statistics {
    pub applied: u64,
    pub simulated: u64,
    pub mismatches: u64,
}

/// Everything `apply` needs: the fd/umask tables, the address-space
/// tracker and the run configuration.
pub struct ReplayContext {
    pub resources: ResourcesManager,
    pub vm: VmManager,
    pub config: ReplayConfig,
    pub stats: Statistics,
}

impl ReplayContext {
    pub fn new(config: ReplayConfig) -> ReplayContext {
        ReplayContext {
            resources: ResourcesManager::new(),
            vm: VmManager::new(),
            config,
            stats: Statistics::default(),
        }
    }
}

/// What applying one record produced.
#[derive(Copy, Clone, Debug)]
pub struct ReplayOutcome {
    pub ret: i64,
    pub errno: i32,
    pub simulated: bool,
}

impl ReplayOutcome {
    /// Fold a nix result into the traced representation: the returned
    /// value, or -1 with the errno. Syscall failures are data here, not
    /// errors.
    pub fn of<T: Into<i64>>(res: nix::Result<T>) -> ReplayOutcome {
        match res {
            Ok(v) => ReplayOutcome {
                ret: v.into(),
                errno: 0,
                simulated: false,
            },
            Err(e) => ReplayOutcome {
                ret: -1,
                errno: errno_of_nix(e),
                simulated: false,
            },
        }
    }

    pub fn of_unit(res: nix::Result<()>) -> ReplayOutcome {
        ReplayOutcome::of(res.map(|_| 0i64))
    }

    pub fn of_size(res: nix::Result<usize>) -> ReplayOutcome {
        ReplayOutcome::of(res.map(|n| n as i64))
    }

    pub fn real(ret: i64) -> ReplayOutcome {
        ReplayOutcome {
            ret,
            errno: 0,
            simulated: false,
        }
    }

    /// The short-circuit outcome for a `SIMULATED` handle: the traced
    /// result verbatim, no syscall issued.
    pub fn simulated(common: &CommonFields) -> ReplayOutcome {
        ReplayOutcome {
            ret: common.return_value,
            errno: common.errno,
            simulated: true,
        }
    }
}

pub fn errno_of_nix(e: nix::Error) -> i32 {
    match e {
        nix::errno::Errno::UnknownErrno => libc::EINVAL,
        errno => errno as i32,
    }
}

/// Outcome of a raw libc call that follows the -1/errno convention.
pub(crate) fn outcome_of_libc(ret: libc::c_int) -> ReplayOutcome {
    if ret < 0 {
        ReplayOutcome {
            ret: -1,
            errno: nix::errno::errno(),
            simulated: false,
        }
    } else {
        ReplayOutcome::real(ret as i64)
    }
}

/// The mode a mode-bearing create should pass to the real syscall. The
/// replay process runs with umask 0, so the traced process's mask is
/// applied by hand here.
pub(crate) fn mode_after_umask(ctx: &ReplayContext, pid: pid_t, mode: libc::mode_t) -> libc::mode_t {
    mode & !ctx.resources.get_umask(pid).unwrap_or(0)
}

/// One concrete record type: how to decode it and how to re-execute it.
pub trait ReplayableRecord: Sized {
    const KIND: SyscallKind;

    fn decode(r: &mut ExtentReader) -> Self;

    fn common(&self) -> &CommonFields;

    /// Perform the real syscall (or short-circuit on a simulated handle).
    /// Only resource-consistency violations are errors.
    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<ReplayOutcome, ResourceError>;

    /// Deep verification beyond the return value, e.g. comparing a
    /// replayed read buffer against captured data. Returns a description
    /// of the mismatch, if any. Only consulted under `--verify`.
    fn buffer_mismatch(&self) -> Option<String> {
        None
    }

    /// True for calls whose return value is a handle (an fd, a mapped
    /// address) that replay cannot reproduce numerically; verification
    /// then compares success/failure rather than the exact value.
    fn returns_handle(&self) -> bool {
        false
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UnitState {
    Idle,
    RecordLoaded,
    Applied,
    Verified,
    Skipped,
    Advanced,
    Done,
}

/// The capability set the scheduler drives. It never sees concrete record
/// types, only this interface.
pub trait ReplayUnit {
    fn kind(&self) -> SyscallKind;

    /// unique_id of the decoded, not yet applied record.
    fn pending_unique_id(&self) -> Option<UniqueId>;

    fn pending_pid(&self) -> Option<pid_t>;

    /// Decode the next record. Returns false when the stream is exhausted.
    fn load_record(&mut self) -> bool;

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<(), ResourceError>;

    fn verify(&mut self, ctx: &mut ReplayContext);

    /// Release per-record scratch state.
    fn advance(&mut self);
}

/// The one ReplayUnit implementation: a typed record stream behind the
/// shared state machine.
pub struct SyscallUnit<R: ReplayableRecord> {
    reader: ExtentReader,
    records_remaining: u64,
    current: Option<R>,
    outcome: Option<ReplayOutcome>,
    state: UnitState,
}

impl<R: ReplayableRecord> SyscallUnit<R> {
    pub fn new(reader: ExtentReader, record_count: u64) -> SyscallUnit<R> {
        SyscallUnit {
            reader,
            records_remaining: record_count,
            current: None,
            outcome: None,
            state: UnitState::Idle,
        }
    }
}

impl<R: ReplayableRecord> ReplayUnit for SyscallUnit<R> {
    fn kind(&self) -> SyscallKind {
        R::KIND
    }

    fn pending_unique_id(&self) -> Option<UniqueId> {
        self.current.as_ref().map(|r| r.common().unique_id)
    }

    fn pending_pid(&self) -> Option<pid_t> {
        self.current.as_ref().map(|r| r.common().pid)
    }

    fn load_record(&mut self) -> bool {
        debug_assert!(matches!(
            self.state,
            UnitState::Idle | UnitState::Advanced | UnitState::Done
        ));
        if self.records_remaining == 0 {
            self.state = UnitState::Done;
            return false;
        }
        self.current = Some(R::decode(&mut self.reader));
        self.records_remaining -= 1;
        self.state = UnitState::RecordLoaded;
        true
    }

    fn apply(&mut self, ctx: &mut ReplayContext) -> Result<(), ResourceError> {
        debug_assert_eq!(self.state, UnitState::RecordLoaded);
        let record = self.current.as_mut().unwrap();
        let outcome = record.apply(ctx)?;

        ctx.stats.applied += 1;
        if outcome.simulated {
            ctx.stats.simulated += 1;
        }
        log!(
            LogInfo,
            "{} unique_id:{} pid:{} traced ret:{} -> replayed ret:{}{}",
            R::KIND.name(),
            record.common().unique_id,
            record.common().pid,
            record.common().return_value,
            outcome.ret,
            if outcome.simulated { " (simulated)" } else { "" }
        );

        self.outcome = Some(outcome);
        self.state = UnitState::Applied;
        Ok(())
    }

    fn verify(&mut self, ctx: &mut ReplayContext) {
        debug_assert_eq!(self.state, UnitState::Applied);
        let outcome = self.outcome.unwrap();
        let record = self.current.as_ref().unwrap();

        // A short-circuited record reproduces the traced result by
        // construction; nothing to compare.
        if outcome.simulated || !ctx.config.compare_results() {
            self.state = UnitState::Skipped;
            return;
        }

        let common = record.common();
        let ret_matches = if record.returns_handle() {
            (outcome.ret < 0) == (common.return_value < 0)
        } else {
            outcome.ret == common.return_value
        };
        if !ret_matches || outcome.errno != common.errno {
            report_mismatch(
                ctx,
                R::KIND,
                common,
                &format!(
                    "return value: traced ({}, errno {}), replayed ({}, errno {})",
                    common.return_value, common.errno, outcome.ret, outcome.errno
                ),
            );
        }
        if ctx.config.verify {
            if let Some(what) = record.buffer_mismatch() {
                report_mismatch(ctx, R::KIND, common, &what);
            }
        }
        self.state = UnitState::Verified;
    }

    fn advance(&mut self) {
        debug_assert!(matches!(
            self.state,
            UnitState::Verified | UnitState::Skipped
        ));
        self.current = None;
        self.outcome = None;
        self.state = UnitState::Advanced;
    }
}

/// Build the unit for one extent stream. The scheduler only ever sees the
/// trait object.
pub fn unit_for(
    kind: SyscallKind,
    reader: ExtentReader,
    record_count: u64,
) -> Box<dyn ReplayUnit> {
    use crate::replay_unit::dup::{Dup2Record, Dup3Record, DupRecord, FcntlRecord};
    use crate::replay_unit::fs_meta::{
        AccessRecord, ChmodRecord, FchmodRecord, FdatasyncRecord, FstatRecord, FstatfsRecord,
        FsyncRecord, FtruncateRecord, LstatRecord, StatRecord, StatfsRecord,
    };
    use crate::replay_unit::fs_namespace::{
        LinkRecord, MkdirRecord, ReadlinkRecord, RenameRecord, RmdirRecord, SymlinkRecord,
        UnlinkAtRecord, UnlinkRecord,
    };
    use crate::replay_unit::mmap::{MmapPreadRecord, MmapPwriteRecord, MmapRecord, MunmapRecord};
    use crate::replay_unit::net::{AcceptRecord, EpollCreateRecord, PipeRecord, SocketRecord};
    use crate::replay_unit::open::{CloseRecord, CreatRecord, OpenAtRecord, OpenRecord};
    use crate::replay_unit::process::{ExitRecord, UmaskRecord};
    use crate::replay_unit::rw::{LseekRecord, PreadRecord, PwriteRecord, ReadRecord, WriteRecord};

    match kind {
        SyscallKind::Umask => Box::new(SyscallUnit::<UmaskRecord>::new(reader, record_count)),
        SyscallKind::Exit => Box::new(SyscallUnit::<ExitRecord>::new(reader, record_count)),
        SyscallKind::Open => Box::new(SyscallUnit::<OpenRecord>::new(reader, record_count)),
        SyscallKind::OpenAt => Box::new(SyscallUnit::<OpenAtRecord>::new(reader, record_count)),
        SyscallKind::Creat => Box::new(SyscallUnit::<CreatRecord>::new(reader, record_count)),
        SyscallKind::Close => Box::new(SyscallUnit::<CloseRecord>::new(reader, record_count)),
        SyscallKind::Read => Box::new(SyscallUnit::<ReadRecord>::new(reader, record_count)),
        SyscallKind::Write => Box::new(SyscallUnit::<WriteRecord>::new(reader, record_count)),
        SyscallKind::Pread => Box::new(SyscallUnit::<PreadRecord>::new(reader, record_count)),
        SyscallKind::Pwrite => Box::new(SyscallUnit::<PwriteRecord>::new(reader, record_count)),
        SyscallKind::Lseek => Box::new(SyscallUnit::<LseekRecord>::new(reader, record_count)),
        SyscallKind::Mmap => Box::new(SyscallUnit::<MmapRecord>::new(reader, record_count)),
        SyscallKind::Munmap => Box::new(SyscallUnit::<MunmapRecord>::new(reader, record_count)),
        SyscallKind::MmapPread => {
            Box::new(SyscallUnit::<MmapPreadRecord>::new(reader, record_count))
        }
        SyscallKind::MmapPwrite => {
            Box::new(SyscallUnit::<MmapPwriteRecord>::new(reader, record_count))
        }
        SyscallKind::Dup => Box::new(SyscallUnit::<DupRecord>::new(reader, record_count)),
        SyscallKind::Dup2 => Box::new(SyscallUnit::<Dup2Record>::new(reader, record_count)),
        SyscallKind::Dup3 => Box::new(SyscallUnit::<Dup3Record>::new(reader, record_count)),
        SyscallKind::Fcntl => Box::new(SyscallUnit::<FcntlRecord>::new(reader, record_count)),
        SyscallKind::Stat => Box::new(SyscallUnit::<StatRecord>::new(reader, record_count)),
        SyscallKind::Fstat => Box::new(SyscallUnit::<FstatRecord>::new(reader, record_count)),
        SyscallKind::Lstat => Box::new(SyscallUnit::<LstatRecord>::new(reader, record_count)),
        SyscallKind::Statfs => Box::new(SyscallUnit::<StatfsRecord>::new(reader, record_count)),
        SyscallKind::Fstatfs => Box::new(SyscallUnit::<FstatfsRecord>::new(reader, record_count)),
        SyscallKind::Access => Box::new(SyscallUnit::<AccessRecord>::new(reader, record_count)),
        SyscallKind::Chmod => Box::new(SyscallUnit::<ChmodRecord>::new(reader, record_count)),
        SyscallKind::Fchmod => Box::new(SyscallUnit::<FchmodRecord>::new(reader, record_count)),
        SyscallKind::Ftruncate => {
            Box::new(SyscallUnit::<FtruncateRecord>::new(reader, record_count))
        }
        SyscallKind::Fsync => Box::new(SyscallUnit::<FsyncRecord>::new(reader, record_count)),
        SyscallKind::Fdatasync => {
            Box::new(SyscallUnit::<FdatasyncRecord>::new(reader, record_count))
        }
        SyscallKind::Unlink => Box::new(SyscallUnit::<UnlinkRecord>::new(reader, record_count)),
        SyscallKind::UnlinkAt => {
            Box::new(SyscallUnit::<UnlinkAtRecord>::new(reader, record_count))
        }
        SyscallKind::Mkdir => Box::new(SyscallUnit::<MkdirRecord>::new(reader, record_count)),
        SyscallKind::Rmdir => Box::new(SyscallUnit::<RmdirRecord>::new(reader, record_count)),
        SyscallKind::Rename => Box::new(SyscallUnit::<RenameRecord>::new(reader, record_count)),
        SyscallKind::Link => Box::new(SyscallUnit::<LinkRecord>::new(reader, record_count)),
        SyscallKind::Symlink => Box::new(SyscallUnit::<SymlinkRecord>::new(reader, record_count)),
        SyscallKind::Readlink => {
            Box::new(SyscallUnit::<ReadlinkRecord>::new(reader, record_count))
        }
        SyscallKind::Socket => Box::new(SyscallUnit::<SocketRecord>::new(reader, record_count)),
        SyscallKind::Pipe => Box::new(SyscallUnit::<PipeRecord>::new(reader, record_count)),
        SyscallKind::EpollCreate => {
            Box::new(SyscallUnit::<EpollCreateRecord>::new(reader, record_count))
        }
        SyscallKind::Accept => Box::new(SyscallUnit::<AcceptRecord>::new(reader, record_count)),
    }
}

/// Severity is the warn level's business: log and keep going, or log and
/// terminate the run. (Reaching this with comparisons disabled cannot
/// happen; verify() bails out earlier.)
fn report_mismatch(ctx: &mut ReplayContext, kind: SyscallKind, common: &CommonFields, what: &str) {
    ctx.stats.mismatches += 1;
    match ctx.config.warn {
        WarnLevel::Abort => {
            log!(
                LogError,
                "{} unique_id:{} pid:{} mismatch: {}",
                kind.name(),
                common.unique_id,
                common.pid,
                what
            );
            eprintln!(
                "retrace: aborting on verification mismatch at unique_id {}",
                common.unique_id
            );
            std::process::exit(1);
        }
        _ => {
            log!(
                LogWarn,
                "{} unique_id:{} pid:{} mismatch: {}",
                kind.name(),
                common.unique_id,
                common.pid,
                what
            );
        }
    }
}
