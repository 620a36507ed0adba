//! Error types for the plexus runtime substrate.

use thiserror::Error;

/// Errors that can occur anywhere in the communication substrate.
///
/// Transport-level variants (`Io`, `ConnectionClosed`, `Timeout`) surface
/// from the connection layer; the remaining variants are protocol or
/// addressing errors raised at the point of detection.
#[derive(Error, Debug)]
pub enum CommError {
    /// Transport-level I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end shut down the stream (zero-byte read).
    ///
    /// Kept distinct from [`CommError::Io`] so reader loops can tell a
    /// clean peer departure from a broken transport.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A bounded-wait read expired.
    #[error("read timed out after {0}ms")]
    Timeout(u64),

    /// Frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared frame payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A decode ran past the end of the buffer or met malformed data.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A message part was consumed past the end of the part list.
    #[error("message part overflow")]
    PartOverflow,

    /// No command is registered under this name.
    #[error("no such command: {0}")]
    UnknownCommand(String),

    /// A frame carried a command id outside the registry.
    #[error("unknown command id {0}")]
    UnknownCommandId(i32),

    /// No group with this name exists in the active topology.
    #[error("no such group: {0}")]
    UnknownGroup(String),

    /// A node id referenced a group id outside the active topology.
    #[error("group id {0} out of range")]
    GroupIdOutOfRange(u32),

    /// A node index did not resolve against the locally resident nodes.
    #[error("node index {index} out of range for group {group} (local count {local})")]
    NodeIndexOverflow {
        /// Group name.
        group: String,
        /// Offending index.
        index: u64,
        /// Locally resident node count.
        local: u64,
    },

    /// No machine with this name is declared in the placement directory.
    #[error("no such machine: {0}")]
    UnknownMachine(String),

    /// A machine was declared twice.
    #[error("machine already declared: {0}")]
    DuplicateMachine(String),

    /// The data channel to a machine is not established.
    #[error("machine not connected: {0}")]
    MachineNotConnected(String),

    /// A placement named a scheduler thread the machine does not have.
    #[error("thread {thread} out of range ({available} schedulers)")]
    ThreadOutOfRange {
        /// Requested thread index.
        thread: usize,
        /// Schedulers actually available.
        available: usize,
    },

    /// No factory is registered for this node type.
    #[error("no node type registered under {0}")]
    UnknownNodeType(String),

    /// A group name was declared twice in one topology.
    #[error("group already declared: {0}")]
    DuplicateGroup(String),

    /// Topology description parse error.
    #[error("parse error at line {line}: {reason}")]
    Parse {
        /// 1-based line number in the description.
        line: usize,
        /// Human-readable reason.
        reason: String,
    },

    /// An operation needed an active topology but none is loaded.
    #[error("no topology loaded")]
    NoTopology,

    /// An operation needed a root reference but none is established.
    #[error("not connected to a root host")]
    NoRoot,

    /// A reply could not be interpreted.
    #[error("invalid reply: {0}")]
    InvalidReply(String),
}

/// Convenience result type for substrate operations.
pub type Result<T> = std::result::Result<T, CommError>;

impl CommError {
    /// True for errors caused by the remote end going away, as opposed to
    /// local logic errors.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
