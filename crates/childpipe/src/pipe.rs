//! Named-FIFO duplex transport between a parent and child role.
//!
//! Two one-directional byte pipes give full duplex capability: one carries
//! child-to-parent bytes (inbound), the other parent-to-child (outbound).
//! FIFO path format: `{temp_dir}/childpipe-{pid}/{seq}-{in|out}.pipe`.
//!
//! FIFOs have no connect call; ordering stands in for it. The read end of
//! each pipe is opened before the write end, so the second open is the
//! attach point and can never block or race a missing peer.

use std::fs::OpenOptions;
use std::os::fd::{BorrowedFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::stat::Mode;

use crate::error::ChannelError;
use crate::handle::ResourceHandle;

/// OS-level buffer capacity requested for each direction.
pub const PIPE_CAPACITY: usize = 8192;

/// Process-wide sequence for unique pipe names.
static PIPE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// Child-to-parent bytes; the parent owns the read end.
    Inbound,
    /// Parent-to-child bytes; the parent owns the write end.
    Outbound,
}

/// Both endpoints of one connected pipe.
pub struct PipeEndpoints {
    /// Non-blocking endpoint retained by the parent.
    pub parent: ResourceHandle,
    /// Blocking endpoint destined for the child's standard streams.
    pub child: ResourceHandle,
}

/// A FIFO node on disk, one direction of the duplex pair.
#[derive(Debug)]
pub struct NamedPipe {
    direction: PipeDirection,
    path: PathBuf,
}

impl NamedPipe {
    /// Create a uniquely named FIFO for `direction`.
    pub fn create(direction: PipeDirection) -> Result<Self, ChannelError> {
        let dir = std::env::temp_dir().join(format!("childpipe-{}", std::process::id()));
        std::fs::create_dir_all(&dir).map_err(|source| ChannelError::PipeCreationFailed {
            path: dir.clone(),
            source,
        })?;

        let seq = PIPE_SEQ.fetch_add(1, Ordering::Relaxed);
        let suffix = match direction {
            PipeDirection::Inbound => "in",
            PipeDirection::Outbound => "out",
        };
        let path = dir.join(format!("{seq}-{suffix}.pipe"));

        nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o600)).map_err(|errno| {
            ChannelError::PipeCreationFailed {
                path: path.clone(),
                source: std::io::Error::from(errno),
            }
        })?;

        tracing::trace!(path = %path.display(), ?direction, "created pipe");
        Ok(Self { direction, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open both endpoints, read end first.
    ///
    /// The parent endpoint stays non-blocking for submit-only I/O. A child
    /// read endpoint is opened non-blocking (so the open cannot hang) and
    /// the flag is cleared afterwards - non-blocking semantics must not leak
    /// into the child's stdin.
    pub fn connect(&self) -> Result<PipeEndpoints, ChannelError> {
        let endpoints = match self.direction {
            PipeDirection::Inbound => {
                let parent = self.open_read_end(true)?;
                let child = self.open_write_end(false)?;
                PipeEndpoints { parent, child }
            }
            PipeDirection::Outbound => {
                let child = self.open_read_end(false)?;
                let parent = self.open_write_end(true)?;
                PipeEndpoints { parent, child }
            }
        };

        self.request_capacity(&endpoints.parent);
        tracing::trace!(path = %self.path.display(), "pipe connected");
        Ok(endpoints)
    }

    fn open_read_end(&self, keep_nonblocking: bool) -> Result<ResourceHandle, ChannelError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|source| self.connect_failed(source))?;
        let handle = ResourceHandle::from_raw(file.into_raw_fd())?;

        if !keep_nonblocking {
            let fd = handle.get()?;
            // Safety: handle keeps fd open for the duration of the borrow.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            fcntl(borrowed, FcntlArg::F_SETFL(OFlag::empty()))
                .map_err(|errno| self.connect_failed(std::io::Error::from(errno)))?;
        }
        Ok(handle)
    }

    fn open_write_end(&self, nonblocking: bool) -> Result<ResourceHandle, ChannelError> {
        let mut options = OpenOptions::new();
        options.write(true);
        if nonblocking {
            // Safe only because the read end is already open.
            options.custom_flags(nix::libc::O_NONBLOCK);
        }
        let file = options
            .open(&self.path)
            .map_err(|source| self.connect_failed(source))?;
        ResourceHandle::from_raw(file.into_raw_fd())
    }

    /// Ask the kernel for the advertised per-direction capacity. Best
    /// effort; the default is larger on most systems anyway.
    fn request_capacity(&self, endpoint: &ResourceHandle) {
        #[cfg(target_os = "linux")]
        if let Ok(fd) = endpoint.get() {
            // Safety: endpoint keeps fd open for the duration of the borrow.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(errno) = fcntl(borrowed, FcntlArg::F_SETPIPE_SZ(PIPE_CAPACITY as i32)) {
                tracing::debug!(path = %self.path.display(), error = %errno, "could not size pipe buffer");
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = endpoint;
    }

    fn connect_failed(&self, source: std::io::Error) -> ChannelError {
        ChannelError::PipeConnectFailed {
            path: self.path.clone(),
            source,
        }
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove pipe node");
        }
        // The per-process directory is shared between pipes; it stays.
    }
}

/// The four endpoints of a connected duplex pair.
///
/// All four are created before the child process exists. The child-side
/// handles are consumed by process creation; the parent's copies of them are
/// closed at spawn (the child holds its own references). Parent-side handles
/// never reach the child.
pub struct DuplexPipePair {
    parent_read: ResourceHandle,
    child_write: ResourceHandle,
    parent_write: ResourceHandle,
    child_read: ResourceHandle,
    // Retained for path cleanup on drop.
    inbound: NamedPipe,
    outbound: NamedPipe,
}

impl DuplexPipePair {
    pub fn create() -> Result<Self, ChannelError> {
        let inbound = NamedPipe::create(PipeDirection::Inbound)?;
        let outbound = NamedPipe::create(PipeDirection::Outbound)?;

        let inbound_ends = inbound.connect()?;
        let outbound_ends = outbound.connect()?;

        tracing::debug!(
            inbound = %inbound.path().display(),
            outbound = %outbound.path().display(),
            "duplex pipe pair ready"
        );

        Ok(Self {
            parent_read: inbound_ends.parent,
            child_write: inbound_ends.child,
            parent_write: outbound_ends.parent,
            child_read: outbound_ends.child,
            inbound,
            outbound,
        })
    }

    /// Path of the child-to-parent FIFO.
    pub fn inbound_path(&self) -> &Path {
        self.inbound.path()
    }

    /// Path of the parent-to-child FIFO.
    pub fn outbound_path(&self) -> &Path {
        self.outbound.path()
    }

    /// Move the parent's non-blocking read endpoint out.
    pub fn take_parent_read(&mut self) -> ResourceHandle {
        std::mem::replace(&mut self.parent_read, ResourceHandle::invalid())
    }

    /// Move the parent's non-blocking write endpoint out.
    pub fn take_parent_write(&mut self) -> ResourceHandle {
        std::mem::replace(&mut self.parent_write, ResourceHandle::invalid())
    }

    /// Move the child's stdout/stderr endpoint out.
    pub fn take_child_write(&mut self) -> ResourceHandle {
        std::mem::replace(&mut self.child_write, ResourceHandle::invalid())
    }

    /// Move the child's stdin endpoint out.
    pub fn take_child_read(&mut self) -> ResourceHandle {
        std::mem::replace(&mut self.child_read, ResourceHandle::invalid())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::mem::ManuallyDrop;
    use std::os::fd::FromRawFd;

    use super::*;

    /// Borrow a raw fd as a File without taking ownership.
    fn borrow_file(handle: &ResourceHandle) -> ManuallyDrop<std::fs::File> {
        let fd = handle.get().unwrap();
        // Safety: the handle outlives the ManuallyDrop, which never closes.
        ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) })
    }

    #[test]
    fn pipe_names_are_unique() {
        let a = NamedPipe::create(PipeDirection::Inbound).unwrap();
        let b = NamedPipe::create(PipeDirection::Inbound).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn pipe_node_removed_on_drop() {
        let pipe = NamedPipe::create(PipeDirection::Outbound).unwrap();
        let path = pipe.path().to_path_buf();
        assert!(path.exists());
        drop(pipe);
        assert!(!path.exists());
    }

    #[test]
    fn inbound_carries_child_to_parent_bytes() {
        let mut pair = DuplexPipePair::create().unwrap();

        let child_write = pair.take_child_write();
        borrow_file(&child_write).write_all(b"from child").unwrap();

        let parent_read = pair.take_parent_read();
        let mut buf = [0u8; 64];
        let n = borrow_file(&parent_read).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"from child");
    }

    #[test]
    fn outbound_carries_parent_to_child_bytes() {
        let mut pair = DuplexPipePair::create().unwrap();

        let parent_write = pair.take_parent_write();
        borrow_file(&parent_write).write_all(b"to child").unwrap();

        let child_read = pair.take_child_read();
        let mut buf = [0u8; 64];
        let n = borrow_file(&child_read).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"to child");
    }

    #[test]
    fn parent_read_end_is_nonblocking() {
        let mut pair = DuplexPipePair::create().unwrap();
        let parent_read = pair.take_parent_read();

        // Nothing written; a blocking endpoint would hang here.
        let mut buf = [0u8; 8];
        let err = borrow_file(&parent_read).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn taken_endpoint_leaves_sentinel_behind() {
        let mut pair = DuplexPipePair::create().unwrap();
        let _taken = pair.take_child_read();
        let again = pair.take_child_read();
        assert!(matches!(again.get(), Err(ChannelError::InvalidHandle)));
    }
}
