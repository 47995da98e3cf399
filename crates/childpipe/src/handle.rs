//! RAII ownership of raw platform handles.
//!
//! Platform APIs disagree on what "no handle" looks like - some return -1,
//! others 0, and 0 can be a live descriptor. The sentinel is therefore a
//! const parameter of the wrapper rather than a universal constant.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::error::ChannelError;

/// Move-only owner of one raw file descriptor.
///
/// At most one live `ResourceHandle` owns a given descriptor: the type is
/// neither `Copy` nor `Clone`, and [`take`](Self::take) leaves the sentinel
/// behind. Drop releases the descriptor exactly once; a handle holding the
/// sentinel releases nothing.
#[derive(Debug)]
pub struct ResourceHandle<const INVALID: RawFd = -1> {
    fd: RawFd,
}

impl<const INVALID: RawFd> ResourceHandle<INVALID> {
    /// Take ownership of `fd`. Fails if `fd` is the sentinel value.
    pub fn from_raw(fd: RawFd) -> Result<Self, ChannelError> {
        if fd == INVALID {
            return Err(ChannelError::InvalidHandle);
        }
        Ok(Self { fd })
    }

    /// An empty handle holding the sentinel. Drop performs no release.
    pub const fn invalid() -> Self {
        Self { fd: INVALID }
    }

    /// Borrow the raw descriptor. Fails if the handle was moved out of.
    pub fn get(&self) -> Result<RawFd, ChannelError> {
        if self.fd == INVALID {
            return Err(ChannelError::InvalidHandle);
        }
        Ok(self.fd)
    }

    /// Transfer the raw descriptor out, resetting this handle to the
    /// sentinel. The caller becomes responsible for closing it.
    pub fn take(&mut self) -> Result<RawFd, ChannelError> {
        if self.fd == INVALID {
            return Err(ChannelError::InvalidHandle);
        }
        let fd = self.fd;
        self.fd = INVALID;
        Ok(fd)
    }

    /// Transfer ownership into the std I/O-safety world.
    pub fn into_owned_fd(mut self) -> Result<OwnedFd, ChannelError> {
        let fd = self.take()?;
        // Safety: we held sole ownership of fd and have just given it up.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl<const INVALID: RawFd> Drop for ResourceHandle<INVALID> {
    fn drop(&mut self) {
        // The handle can hold the sentinel after a take().
        if self.fd == INVALID {
            return;
        }
        if let Err(e) = nix::unistd::close(self.fd) {
            // Drop cannot fail; release failures are diagnostic-only.
            tracing::warn!(fd = self.fd, error = %e, "failed to close resource handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::BorrowedFd;

    use nix::fcntl::{FcntlArg, fcntl};

    use super::*;

    fn open_scratch_fd() -> RawFd {
        use std::os::fd::IntoRawFd;
        std::fs::File::open("/dev/null").unwrap().into_raw_fd()
    }

    fn fd_is_open(fd: RawFd) -> bool {
        // Safety: probe only; the fd is never used through this borrow.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        fcntl(borrowed, FcntlArg::F_GETFD).is_ok()
    }

    #[test]
    fn rejects_sentinel_value() {
        assert!(matches!(
            ResourceHandle::<-1>::from_raw(-1),
            Err(ChannelError::InvalidHandle)
        ));
    }

    #[test]
    fn sentinel_is_per_instantiation() {
        // 0 is a valid descriptor for a handle whose sentinel is -1, but not
        // for one whose sentinel is 0.
        assert!(matches!(
            ResourceHandle::<0>::from_raw(0),
            Err(ChannelError::InvalidHandle)
        ));
        let h = ResourceHandle::<-1>::from_raw(0).unwrap();
        // Don't close stdin under the test harness.
        std::mem::forget(h);
    }

    #[test]
    fn invalid_handle_reports_invalid_and_releases_nothing() {
        let h = ResourceHandle::<-1>::invalid();
        assert!(matches!(h.get(), Err(ChannelError::InvalidHandle)));
        drop(h); // must not close fd -1
    }

    #[test]
    fn take_leaves_sentinel_behind() {
        let fd = open_scratch_fd();
        let mut h = ResourceHandle::<-1>::from_raw(fd).unwrap();

        let raw = h.take().unwrap();
        assert_eq!(raw, fd);
        assert!(matches!(h.get(), Err(ChannelError::InvalidHandle)));
        assert!(matches!(h.take(), Err(ChannelError::InvalidHandle)));

        // The source handle must not release the transferred descriptor.
        drop(h);
        assert!(fd_is_open(raw));

        nix::unistd::close(raw).unwrap();
    }

    #[test]
    fn drop_releases_exactly_once() {
        let fd = open_scratch_fd();
        {
            let h = ResourceHandle::<-1>::from_raw(fd).unwrap();
            assert_eq!(h.get().unwrap(), fd);
        }
        assert!(!fd_is_open(fd));
    }

    #[test]
    fn into_owned_fd_transfers_ownership() {
        let fd = open_scratch_fd();
        let h = ResourceHandle::<-1>::from_raw(fd).unwrap();
        let owned = h.into_owned_fd().unwrap();
        assert!(fd_is_open(fd));
        drop(owned);
        assert!(!fd_is_open(fd));
    }
}
