use crate::flags::PatternKind;
use nix::errno::Errno;
use rand::RngCore;
use std::fs::File;
use std::io::Read;

/// Symbolic name for an errno value, e.g. `ENOENT`.
pub fn errno_name(err: i32) -> String {
    format!("{:?}", Errno::from_i32(err))
}

/// Fill `buf` with the payload bytes a write-family record should carry
/// during replay. The trace only records lengths for outgoing data; the
/// actual bytes come from the `-p/--pattern` setting.
pub fn fill_pattern(pattern: PatternKind, buf: &mut [u8]) {
    match pattern {
        PatternKind::Fixed(byte) => {
            for b in buf.iter_mut() {
                *b = byte;
            }
        }
        PatternKind::Random => {
            rand::thread_rng().fill_bytes(buf);
        }
        PatternKind::Urandom => {
            let mut f = match File::open("/dev/urandom") {
                Ok(f) => f,
                Err(e) => fatal!("Could not open /dev/urandom: {}", e),
            };
            if let Err(e) = f.read_exact(buf) {
                fatal!("Short read from /dev/urandom: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{errno_name, fill_pattern};
    use crate::flags::PatternKind;

    #[test]
    fn fixed_pattern_fill() {
        let mut buf = vec![0u8; 16];
        fill_pattern(PatternKind::Fixed(0x5a), &mut buf);
        assert!(buf.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn urandom_pattern_fills_the_whole_buffer() {
        // 64 zero bytes from /dev/urandom would be quite the coincidence.
        let mut buf = vec![0u8; 64];
        fill_pattern(PatternKind::Urandom, &mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn errno_names() {
        assert_eq!(errno_name(libc::ENOENT), "ENOENT");
        assert_eq!(errno_name(libc::EBADF), "EBADF");
    }
}
