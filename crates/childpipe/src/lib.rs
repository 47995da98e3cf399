//! childpipe: asynchronous duplex byte channel to a supervised child process.
//!
//! The channel spawns exactly one child process with its standard streams
//! wired to a pair of named one-directional pipes, submits non-blocking
//! reads and writes against the parent endpoints, and delivers read
//! completions through a caller-supplied callback. At most one operation per
//! direction is in flight at a time; refusing further submissions instead of
//! queuing pushes flow control to the caller. Shutdown cancels outstanding
//! I/O, grants the child a grace period to exit, and kills it otherwise.
//!
//! The channel carries raw, unframed bytes only. Message delimiting and any
//! application protocol belong to the caller.

#[cfg(unix)]
mod channel;
#[cfg(unix)]
mod context;
#[cfg(unix)]
mod error;
#[cfg(unix)]
mod handle;
#[cfg(unix)]
mod pipe;

#[cfg(unix)]
pub use channel::{ChildProcess, MAX_COMMAND_LINE, READ_BUFFER_SIZE, ShutdownOutcome};
#[cfg(unix)]
pub use error::ChannelError;
#[cfg(unix)]
pub use handle::ResourceHandle;
#[cfg(unix)]
pub use pipe::{DuplexPipePair, NamedPipe, PIPE_CAPACITY, PipeDirection, PipeEndpoints};
