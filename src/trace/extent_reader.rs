use crate::scoped_fd::ScopedFd;
use nix::sys::uio::pread;
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::rc::Rc;

const BUFFER_CAPACITY: usize = 64 * 1024;

/// One extent stream being decoded. The fd is shared with the owning
/// `TraceStream` and with sibling extents, so we never rely on its file
/// position: the current position lives in `fd_offset` and reads go
/// through pread.
///
/// The extent's crc32 accumulates as the stream drains and is checked when
/// the last byte has been consumed. A truncated or corrupted extent is an
/// unrecoverable trace defect and aborts the replay.
pub struct ExtentReader {
    fd: Rc<ScopedFd>,
    fd_offset: u64,
    end_offset: u64,
    eof: bool,
    buffer: Vec<u8>,
    buffer_read_pos: usize,
    hasher: crc32fast::Hasher,
    expected_crc: u32,
    crc_checked: bool,
}

impl ExtentReader {
    pub(super) fn new(fd: Rc<ScopedFd>, offset: u64, byte_len: u64, crc32: u32) -> ExtentReader {
        ExtentReader {
            fd,
            fd_offset: offset,
            end_offset: offset + byte_len,
            eof: byte_len == 0,
            buffer: Vec::new(),
            buffer_read_pos: 0,
            hasher: crc32fast::Hasher::new(),
            expected_crc: crc32,
            crc_checked: false,
        }
    }

    pub fn at_end(&self) -> bool {
        self.eof && self.buffer_read_pos == self.buffer.len()
    }

    fn refill_buffer(&mut self) {
        debug_assert!(self.buffer_read_pos == self.buffer.len());
        let want = std::cmp::min(BUFFER_CAPACITY as u64, self.end_offset - self.fd_offset);
        self.buffer.resize(want as usize, 0);
        self.buffer_read_pos = 0;

        let mut done = 0;
        while done < self.buffer.len() {
            match pread(
                self.fd.as_raw(),
                &mut self.buffer[done..],
                (self.fd_offset + done as u64) as i64,
            ) {
                Ok(0) => fatal!("Trace extent truncated at offset {}", self.fd_offset),
                Ok(n) => done += n,
                Err(e) => fatal!("Trace read error at offset {}: {}", self.fd_offset, e),
            }
        }
        self.fd_offset += done as u64;
        self.hasher.update(&self.buffer);
        if self.fd_offset == self.end_offset {
            self.eof = true;
        }
    }

    /// Consume exactly `data.len()` bytes. Runs the crc check once the
    /// extent is fully drained.
    pub fn read(&mut self, data: &mut [u8]) {
        let mut done = 0;
        while done < data.len() {
            if self.buffer_read_pos == self.buffer.len() {
                if self.eof {
                    fatal!("Trace extent exhausted mid-record");
                }
                self.refill_buffer();
            }
            let available = self.buffer.len() - self.buffer_read_pos;
            let take = std::cmp::min(available, data.len() - done);
            data[done..done + take]
                .copy_from_slice(&self.buffer[self.buffer_read_pos..self.buffer_read_pos + take]);
            self.buffer_read_pos += take;
            done += take;
        }
        if self.at_end() && !self.crc_checked {
            self.crc_checked = true;
            let actual = self.hasher.clone().finalize();
            if actual != self.expected_crc {
                fatal!(
                    "Trace extent checksum mismatch: expected {:#010x}, got {:#010x}",
                    self.expected_crc,
                    actual
                );
            }
        }
    }

    pub fn read_u8(&mut self) -> u8 {
        let mut buf = [0u8; 1];
        self.read(&mut buf);
        buf[0]
    }

    pub fn read_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.read(&mut buf);
        u16::from_le_bytes(buf)
    }

    pub fn read_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.read(&mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn read_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.read(&mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn read_i32(&mut self) -> i32 {
        let mut buf = [0u8; 4];
        self.read(&mut buf);
        i32::from_le_bytes(buf)
    }

    pub fn read_i64(&mut self) -> i64 {
        let mut buf = [0u8; 8];
        self.read(&mut buf);
        i64::from_le_bytes(buf)
    }

    /// u32-length-prefixed byte column.
    pub fn read_data(&mut self) -> Vec<u8> {
        let len = self.read_u32() as usize;
        let mut buf = vec![0u8; len];
        self.read(&mut buf);
        buf
    }

    /// Path column: length-prefixed raw bytes, no unicode assumption.
    pub fn read_path(&mut self) -> PathBuf {
        let bytes = self.read_data();
        PathBuf::from(OsString::from_vec(bytes))
    }
}

#[cfg(test)]
mod test {
    use crate::scoped_fd::ScopedFd;
    use crate::trace::extent_reader::ExtentReader;
    use nix::fcntl::OFlag;
    use std::io::Write;
    use std::rc::Rc;

    fn reader_over(bytes: &[u8]) -> (tempfile::NamedTempFile, ExtentReader) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        let fd = ScopedFd::open_path(file.path(), OFlag::O_RDONLY);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytes);
        let crc = hasher.finalize();
        let reader = ExtentReader::new(Rc::new(fd), 0, bytes.len() as u64, crc);
        (file, reader)
    }

    #[test]
    fn typed_column_reads() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x1122u16.to_le_bytes());
        bytes.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        bytes.extend_from_slice(&(-77i64).to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"abc");

        let (_file, mut r) = reader_over(&bytes);
        assert!(!r.at_end());
        assert_eq!(r.read_u16(), 0x1122);
        assert_eq!(r.read_u32(), 0xdead_beef);
        assert_eq!(r.read_i64(), -77);
        assert_eq!(r.read_data(), b"abc");
        assert!(r.at_end());
    }

    #[test]
    fn empty_extent_is_at_end() {
        let (_file, r) = reader_over(&[]);
        assert!(r.at_end());
    }
}
