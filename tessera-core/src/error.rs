use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("no route to any replica")]
    NoRoute,

    #[error("operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch, record was modified since it was read")]
    CasMismatch,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("resource exhausted: {0}")]
    Exhausted(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error classification shared between in-process code and the wire.
///
/// On the wire every failure is a small negative integer in the frame
/// status field; these are stable across peers and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NoRoute,
    Timeout,
    Io,
    CasMismatch,
    InvalidArgument,
    Unsupported,
    Exhausted,
}

impl ErrorKind {
    pub fn wire_code(self) -> i32 {
        match self {
            ErrorKind::NotFound => -2,
            ErrorKind::NoRoute => -6,
            ErrorKind::Timeout => -110,
            ErrorKind::Io => -5,
            ErrorKind::CasMismatch => -77,
            ErrorKind::InvalidArgument => -22,
            ErrorKind::Unsupported => -95,
            ErrorKind::Exhausted => -12,
        }
    }

    pub fn from_wire_code(code: i32) -> ErrorKind {
        match code {
            -2 => ErrorKind::NotFound,
            -6 => ErrorKind::NoRoute,
            -110 => ErrorKind::Timeout,
            -77 => ErrorKind::CasMismatch,
            -22 => ErrorKind::InvalidArgument,
            -95 => ErrorKind::Unsupported,
            -12 => ErrorKind::Exhausted,
            _ => ErrorKind::Io,
        }
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound => ErrorKind::NotFound,
            StoreError::NoRoute => ErrorKind::NoRoute,
            StoreError::Timeout => ErrorKind::Timeout,
            StoreError::Io(_) => ErrorKind::Io,
            StoreError::CasMismatch => ErrorKind::CasMismatch,
            StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StoreError::Unsupported(_) => ErrorKind::Unsupported,
            StoreError::Exhausted(_) => ErrorKind::Exhausted,
            StoreError::Serialization(_) => ErrorKind::InvalidArgument,
        }
    }

    pub fn wire_code(&self) -> i32 {
        self.kind().wire_code()
    }

    /// Rebuild an error from a negative response status received off the wire.
    pub fn from_wire_code(code: i32) -> StoreError {
        match ErrorKind::from_wire_code(code) {
            ErrorKind::NotFound => StoreError::NotFound,
            ErrorKind::NoRoute => StoreError::NoRoute,
            ErrorKind::Timeout => StoreError::Timeout,
            ErrorKind::CasMismatch => StoreError::CasMismatch,
            ErrorKind::InvalidArgument => {
                StoreError::InvalidArgument(format!("peer reported status {}", code))
            }
            ErrorKind::Unsupported => {
                StoreError::Unsupported(format!("peer reported status {}", code))
            }
            ErrorKind::Exhausted => {
                StoreError::Exhausted(format!("peer reported status {}", code))
            }
            ErrorKind::Io => StoreError::Io(std::io::Error::other(format!(
                "peer reported status {}",
                code
            ))),
        }
    }
}
