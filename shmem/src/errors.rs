use std::time::Duration;
use std::{fmt, io};

use shared_memory::ShmemError;

pub type Result<T> = std::result::Result<T, IpcError>;

#[derive(Debug)]
pub enum IpcError {
    /// Message admission refused: the channel reached its capacity or the
    /// message region has no free slot left.
    ChannelFull { channel: String },
    /// The group region has no free slot left.
    GroupStoreFull { group: String },
    LockTimedOut { region: String, timeout: Duration },
    LockUnrecoverable { region: String },
    Lock(Box<dyn std::error::Error + Send + Sync + 'static>),
    SharedMemory(ShmemError),
    LayoutMismatch(String),
    MessageTooLarge { size: usize, max: usize },
    InvalidName(String),
    Config(String),
    Io(io::Error),
}

impl IpcError {
    /// True for the capacity conditions a caller is expected to back off on.
    pub fn is_full(&self) -> bool {
        matches!(self, IpcError::ChannelFull { .. } | IpcError::GroupStoreFull { .. })
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::ChannelFull { channel } => write!(f, "Channel {} is full", channel),
            IpcError::GroupStoreFull { group } => {
                write!(f, "Group store is full, cannot add a member to {}", group)
            }
            IpcError::LockTimedOut { region, timeout } => write!(
                f,
                "Lock on {} not acquired within {:?}. Kill all processes using it and remove {} from /dev/shm",
                region, timeout, region
            ),
            IpcError::LockUnrecoverable { region } => {
                write!(f, "Lock on {} is no longer recoverable", region)
            }
            IpcError::Lock(e) => write!(f, "Lock error: {}", e),
            IpcError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            IpcError::LayoutMismatch(s) => write!(f, "Region layout mismatch: {}", s),
            IpcError::MessageTooLarge { size, max } => {
                write!(f, "Record of {} bytes exceeds the slot capacity of {} bytes", size, max)
            }
            IpcError::InvalidName(s) => write!(f, "Invalid name: {}", s),
            IpcError::Config(s) => write!(f, "Config error: {}", s),
            IpcError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::SharedMemory(e) => Some(e),
            IpcError::Lock(e) => Some(e.as_ref()),
            IpcError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmemError> for IpcError {
    fn from(err: ShmemError) -> Self {
        IpcError::SharedMemory(err)
    }
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        IpcError::Io(err)
    }
}

impl From<confy::ConfyError> for IpcError {
    fn from(err: confy::ConfyError) -> Self {
        IpcError::Config(err.to_string())
    }
}
