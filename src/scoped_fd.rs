use nix::fcntl::open;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::os::unix::io::RawFd;

// We DON'T want this to be Copy or Clone because of the Drop.
#[derive(Debug)]
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> Self {
        let rawfd = open(path, oflag, Mode::empty()).unwrap_or(-1);
        ScopedFd { fd: rawfd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close
            close(self.fd).unwrap_or(());
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}
