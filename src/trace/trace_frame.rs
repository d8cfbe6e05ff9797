use crate::trace::extent_reader::ExtentReader;
use crate::trace::extent_writer::ExtentWriter;
use crate::trace::tfrac::Tfrac;
use libc::pid_t;

/// Globally unique, strictly increasing sequence number assigned at
/// capture time across all syscall types. The sole ordering key for
/// replay.
pub type UniqueId = u64;

/// The columns every record carries, whatever its syscall type.
#[derive(Clone, Debug)]
pub struct CommonFields {
    pub unique_id: UniqueId,
    pub pid: pid_t,
    pub time_called: Tfrac,
    pub time_returned: Tfrac,
    pub time_recorded: Tfrac,
    pub errno: i32,
    pub return_value: i64,
}

impl CommonFields {
    pub fn decode(r: &mut ExtentReader) -> CommonFields {
        CommonFields {
            unique_id: r.read_u64(),
            pid: r.read_i32(),
            time_called: Tfrac::from_raw(r.read_u64()),
            time_returned: Tfrac::from_raw(r.read_u64()),
            time_recorded: Tfrac::from_raw(r.read_u64()),
            errno: r.read_i32(),
            return_value: r.read_i64(),
        }
    }

    pub fn encode(&self, w: &mut ExtentWriter) {
        w.write_u64(self.unique_id);
        w.write_i32(self.pid);
        w.write_u64(self.time_called.raw());
        w.write_u64(self.time_returned.raw());
        w.write_u64(self.time_recorded.raw());
        w.write_i32(self.errno);
        w.write_i64(self.return_value);
    }

    /// The traced call did not fail.
    pub fn succeeded(&self) -> bool {
        self.errno == 0 && self.return_value >= 0
    }
}

#[cfg(test)]
pub mod test_support {
    use super::CommonFields;
    use crate::trace::tfrac::Tfrac;
    use libc::pid_t;

    /// Common columns with zeroed timestamps, for tests that only care
    /// about ordering and results.
    pub fn common(unique_id: u64, pid: pid_t, return_value: i64, errno: i32) -> CommonFields {
        CommonFields {
            unique_id,
            pid,
            time_called: Tfrac::from_raw(0),
            time_returned: Tfrac::from_raw(0),
            time_recorded: Tfrac::from_raw(0),
            errno,
            return_value,
        }
    }
}
