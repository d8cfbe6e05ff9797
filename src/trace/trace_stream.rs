use crate::scoped_fd::ScopedFd;
use crate::trace::extent_reader::ExtentReader;
use nix::fcntl::OFlag;
use nix::sys::uio::pread;
use std::convert::TryInto;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// First bytes of every trace file.
pub const TRACE_MAGIC: [u8; 4] = *b"RTRC";

/// Compatibility gate: the major version must match exactly, the minor
/// version of the file must not exceed ours.
pub const TRACE_MAJOR_VERSION: u16 = 2;
pub const TRACE_MINOR_VERSION: u16 = 3;

pub const FILE_HEADER_SIZE: usize = 12;
pub const EXTENT_DIR_ENTRY_SIZE: usize = 32;

// magic + major + minor + extent_count
const_assert_eq!(FILE_HEADER_SIZE, 4 + 2 + 2 + 4);
// kind + reserved + record_count + offset + byte_len + crc32 + pad
const_assert_eq!(EXTENT_DIR_ENTRY_SIZE, 2 + 2 + 8 + 8 + 8 + 4);

/// Identifies one extent stream, i.e. one recorded syscall type. Closed
/// set; the scheduler and the replay units never dispatch on anything else.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u16)]
pub enum SyscallKind {
    Umask = 0,
    Exit = 1,
    Open = 2,
    OpenAt = 3,
    Creat = 4,
    Close = 5,
    Read = 6,
    Write = 7,
    Pread = 8,
    Pwrite = 9,
    Lseek = 10,
    Mmap = 11,
    Munmap = 12,
    MmapPread = 13,
    MmapPwrite = 14,
    Dup = 15,
    Dup2 = 16,
    Dup3 = 17,
    Fcntl = 18,
    Stat = 19,
    Fstat = 20,
    Lstat = 21,
    Statfs = 22,
    Fstatfs = 23,
    Access = 24,
    Chmod = 25,
    Fchmod = 26,
    Ftruncate = 27,
    Fsync = 28,
    Fdatasync = 29,
    Unlink = 30,
    UnlinkAt = 31,
    Mkdir = 32,
    Rmdir = 33,
    Rename = 34,
    Link = 35,
    Symlink = 36,
    Readlink = 37,
    Socket = 38,
    Pipe = 39,
    EpollCreate = 40,
    Accept = 41,
}

impl SyscallKind {
    pub fn from_raw(raw: u16) -> Option<SyscallKind> {
        use SyscallKind::*;
        const ALL: [SyscallKind; 42] = [
            Umask, Exit, Open, OpenAt, Creat, Close, Read, Write, Pread, Pwrite, Lseek, Mmap,
            Munmap, MmapPread, MmapPwrite, Dup, Dup2, Dup3, Fcntl, Stat, Fstat, Lstat, Statfs,
            Fstatfs, Access, Chmod, Fchmod, Ftruncate, Fsync, Fdatasync, Unlink, UnlinkAt, Mkdir,
            Rmdir, Rename, Link, Symlink, Readlink, Socket, Pipe, EpollCreate, Accept,
        ];
        ALL.get(raw as usize).copied()
    }

    pub fn name(self) -> &'static str {
        use SyscallKind::*;
        match self {
            Umask => "umask",
            Exit => "exit",
            Open => "open",
            OpenAt => "openat",
            Creat => "creat",
            Close => "close",
            Read => "read",
            Write => "write",
            Pread => "pread",
            Pwrite => "pwrite",
            Lseek => "lseek",
            Mmap => "mmap",
            Munmap => "munmap",
            MmapPread => "mmappread",
            MmapPwrite => "mmappwrite",
            Dup => "dup",
            Dup2 => "dup2",
            Dup3 => "dup3",
            Fcntl => "fcntl",
            Stat => "stat",
            Fstat => "fstat",
            Lstat => "lstat",
            Statfs => "statfs",
            Fstatfs => "fstatfs",
            Access => "access",
            Chmod => "chmod",
            Fchmod => "fchmod",
            Ftruncate => "ftruncate",
            Fsync => "fsync",
            Fdatasync => "fdatasync",
            Unlink => "unlink",
            UnlinkAt => "unlinkat",
            Mkdir => "mkdir",
            Rmdir => "rmdir",
            Rename => "rename",
            Link => "link",
            Symlink => "symlink",
            Readlink => "readlink",
            Socket => "socket",
            Pipe => "pipe",
            EpollCreate => "epoll_create",
            Accept => "accept",
        }
    }
}

/// One entry of the extent directory: where one syscall type's records
/// live inside the file.
#[derive(Clone, Debug)]
pub struct ExtentEntry {
    pub kind: SyscallKind,
    pub record_count: u64,
    pub offset: u64,
    pub byte_len: u64,
    pub crc32: u32,
}

/// An opened trace container: header validated, extent directory loaded.
/// The fd is shared with every `ExtentReader` spawned from this stream;
/// all of them read via pread and never touch the shared file position.
#[derive(Debug)]
pub struct TraceStream {
    path: PathBuf,
    fd: Rc<ScopedFd>,
    major: u16,
    minor: u16,
    extents: Vec<ExtentEntry>,
}

impl TraceStream {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<TraceStream> {
        let path = path.as_ref().to_path_buf();
        let fd = ScopedFd::open_path(&path, OFlag::O_RDONLY);
        if !fd.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Could not open trace file `{}'", path.display()),
            ));
        }

        let mut header = [0u8; FILE_HEADER_SIZE];
        read_exact_at(&fd, &mut header, 0, &path)?;
        if header[0..4] != TRACE_MAGIC {
            return Err(invalid(&path, "not a trace file (bad magic)"));
        }
        let major = u16::from_le_bytes(header[4..6].try_into().unwrap());
        let minor = u16::from_le_bytes(header[6..8].try_into().unwrap());
        if major != TRACE_MAJOR_VERSION || minor > TRACE_MINOR_VERSION {
            return Err(invalid(
                &path,
                &format!(
                    "trace version {}.{} is not supported (need {}.x with x <= {})",
                    major, minor, TRACE_MAJOR_VERSION, TRACE_MINOR_VERSION
                ),
            ));
        }
        let extent_count = u32::from_le_bytes(header[8..12].try_into().unwrap());

        let mut dir = vec![0u8; extent_count as usize * EXTENT_DIR_ENTRY_SIZE];
        read_exact_at(&fd, &mut dir, FILE_HEADER_SIZE as u64, &path)?;

        let mut extents = Vec::with_capacity(extent_count as usize);
        for chunk in dir.chunks_exact(EXTENT_DIR_ENTRY_SIZE) {
            let raw_kind = u16::from_le_bytes(chunk[0..2].try_into().unwrap());
            let kind = match SyscallKind::from_raw(raw_kind) {
                Some(kind) => kind,
                None => {
                    return Err(invalid(
                        &path,
                        &format!("unknown syscall kind {} in extent directory", raw_kind),
                    ))
                }
            };
            extents.push(ExtentEntry {
                kind,
                record_count: u64::from_le_bytes(chunk[4..12].try_into().unwrap()),
                offset: u64::from_le_bytes(chunk[12..20].try_into().unwrap()),
                byte_len: u64::from_le_bytes(chunk[20..28].try_into().unwrap()),
                crc32: u32::from_le_bytes(chunk[28..32].try_into().unwrap()),
            });
        }

        Ok(TraceStream {
            path,
            fd: Rc::new(fd),
            major,
            minor,
            extents,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn major(&self) -> u16 {
        self.major
    }

    pub fn minor(&self) -> u16 {
        self.minor
    }

    pub fn extents(&self) -> &[ExtentEntry] {
        &self.extents
    }

    pub fn total_records(&self) -> u64 {
        self.extents.iter().map(|e| e.record_count).sum()
    }

    pub fn extent_reader(&self, entry: &ExtentEntry) -> ExtentReader {
        ExtentReader::new(self.fd.clone(), entry.offset, entry.byte_len, entry.crc32)
    }
}

fn invalid(path: &Path, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("`{}': {}", path.display(), what),
    )
}

fn read_exact_at(fd: &ScopedFd, buf: &mut [u8], offset: u64, path: &Path) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match pread(fd.as_raw(), &mut buf[done..], (offset + done as u64) as i64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("`{}': truncated trace file", path.display()),
                ))
            }
            Ok(n) => done += n,
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("`{}': read error: {}", path.display(), e),
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{SyscallKind, TraceStream, FILE_HEADER_SIZE, TRACE_MAGIC, TRACE_MAJOR_VERSION};
    use std::io::Write;

    #[test]
    fn kind_round_trip() {
        for raw in 0..42u16 {
            let kind = SyscallKind::from_raw(raw).unwrap();
            assert_eq!(kind as u16, raw);
        }
        assert!(SyscallKind::from_raw(42).is_none());
        assert!(SyscallKind::from_raw(u16::MAX).is_none());
    }

    #[test]
    fn rejects_wrong_major_version() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut header = Vec::new();
        header.extend_from_slice(&TRACE_MAGIC);
        header.extend_from_slice(&(TRACE_MAJOR_VERSION + 1).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(header.len(), FILE_HEADER_SIZE);
        file.write_all(&header).unwrap();
        file.flush().unwrap();

        let err = TraceStream::open(file.path()).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"XXXX\x02\x00\x00\x00\x00\x00\x00\x00").unwrap();
        file.flush().unwrap();

        let err = TraceStream::open(file.path()).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }
}
