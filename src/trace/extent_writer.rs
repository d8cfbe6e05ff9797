use crate::trace::trace_stream::{
    SyscallKind, EXTENT_DIR_ENTRY_SIZE, FILE_HEADER_SIZE, TRACE_MAGIC, TRACE_MAJOR_VERSION,
    TRACE_MINOR_VERSION,
};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Accumulates the encoded records of one syscall type. Column layout must
/// mirror `ExtentReader`'s typed reads exactly.
pub struct ExtentWriter {
    kind: SyscallKind,
    buf: Vec<u8>,
    record_count: u64,
}

impl ExtentWriter {
    pub fn new(kind: SyscallKind) -> ExtentWriter {
        ExtentWriter {
            kind,
            buf: Vec::new(),
            record_count: 0,
        }
    }

    pub fn kind(&self) -> SyscallKind {
        self.kind
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Call once per record, before its columns.
    pub fn begin_record(&mut self) {
        self.record_count += 1;
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_data(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn write_path<P: AsRef<Path>>(&mut self, path: P) {
        use std::os::unix::ffi::OsStrExt;
        self.write_data(path.as_ref().as_os_str().as_bytes());
    }
}

/// Assembles a whole trace container from per-kind extents. Used by the
/// conversion tooling and by tests that need a trace to replay.
pub struct TraceWriter {
    extents: Vec<ExtentWriter>,
}

impl TraceWriter {
    pub fn new() -> TraceWriter {
        TraceWriter {
            extents: Vec::new(),
        }
    }

    /// The extent for `kind`, created on first use.
    pub fn extent(&mut self, kind: SyscallKind) -> &mut ExtentWriter {
        if let Some(pos) = self.extents.iter().position(|e| e.kind == kind) {
            return &mut self.extents[pos];
        }
        self.extents.push(ExtentWriter::new(kind));
        self.extents.last_mut().unwrap()
    }

    pub fn close<P: AsRef<Path>>(self, path: P) -> io::Result<()> {
        let mut f = File::create(path)?;

        let mut header = Vec::with_capacity(FILE_HEADER_SIZE);
        header.extend_from_slice(&TRACE_MAGIC);
        header.extend_from_slice(&TRACE_MAJOR_VERSION.to_le_bytes());
        header.extend_from_slice(&TRACE_MINOR_VERSION.to_le_bytes());
        header.extend_from_slice(&(self.extents.len() as u32).to_le_bytes());
        f.write_all(&header)?;

        let mut offset =
            (FILE_HEADER_SIZE + self.extents.len() * EXTENT_DIR_ENTRY_SIZE) as u64;
        for e in &self.extents {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&e.buf);

            let mut entry = Vec::with_capacity(EXTENT_DIR_ENTRY_SIZE);
            entry.extend_from_slice(&(e.kind as u16).to_le_bytes());
            entry.extend_from_slice(&0u16.to_le_bytes());
            entry.extend_from_slice(&e.record_count.to_le_bytes());
            entry.extend_from_slice(&offset.to_le_bytes());
            entry.extend_from_slice(&(e.buf.len() as u64).to_le_bytes());
            entry.extend_from_slice(&hasher.finalize().to_le_bytes());
            f.write_all(&entry)?;

            offset += e.buf.len() as u64;
        }

        for e in &self.extents {
            f.write_all(&e.buf)?;
        }
        f.flush()
    }
}

#[cfg(test)]
mod test {
    use super::TraceWriter;
    use crate::trace::trace_stream::{SyscallKind, TraceStream};

    #[test]
    fn container_directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.trace");

        let mut w = TraceWriter::new();
        let ext = w.extent(SyscallKind::Open);
        ext.begin_record();
        ext.write_u64(1);
        ext.write_path("/tmp/f");
        let ext = w.extent(SyscallKind::Close);
        ext.begin_record();
        ext.write_u64(2);
        ext.begin_record();
        ext.write_u64(3);
        w.close(&path).unwrap();

        let stream = TraceStream::open(&path).unwrap();
        assert_eq!(stream.extents().len(), 2);
        assert_eq!(stream.total_records(), 3);

        let open_entry = stream
            .extents()
            .iter()
            .find(|e| e.kind == SyscallKind::Open)
            .unwrap();
        assert_eq!(open_entry.record_count, 1);
        let mut r = stream.extent_reader(open_entry);
        assert_eq!(r.read_u64(), 1);
        assert_eq!(r.read_path(), std::path::PathBuf::from("/tmp/f"));
        assert!(r.at_end());
    }
}
