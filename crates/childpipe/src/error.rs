//! Channel error taxonomy.

use std::io;
use std::path::PathBuf;

use crate::channel::MAX_COMMAND_LINE;

/// Errors produced while building or driving a child channel.
///
/// Construction failures are fatal to channel creation - no partially usable
/// channel is ever returned. Submission failures are fatal to the channel
/// instance; retry policy, if any, belongs to the caller. Backpressure (an
/// operation already in flight) is not an error and is signalled in-band.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// A raw handle equal to the sentinel "invalid" value was encountered.
    #[error("invalid resource handle")]
    InvalidHandle,

    #[error("failed to create pipe {path}: {source}")]
    PipeCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect pipe {path}: {source}")]
    PipeConnectFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Spawn failed; carries the attempted command line.
    #[error("failed to spawn child process `{command}`: {source}")]
    ProcessSpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command line is {length} bytes, limit is {MAX_COMMAND_LINE}")]
    CommandLineTooLong { length: usize },

    #[error("failed to submit read: {0}")]
    ReadSubmissionFailed(String),

    #[error("failed to submit write: {0}")]
    WriteSubmissionFailed(String),
}
