//! Error types for RamFS Core

/// Core filesystem error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("name already exists")]
    NameExists,
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid mount option: {0}")]
    InvalidOption(String),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name too long")]
    NameTooLong,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("stale filesystem")]
    Stale,
    #[error("filesystem type already registered: {0}")]
    AlreadyRegistered(String),
    #[error("busy")]
    Busy,
}

impl FsError {
    /// POSIX errno equivalent, for host glue that speaks errno.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::OutOfMemory => 12,          // ENOMEM
            FsError::NameExists => 17,           // EEXIST
            FsError::NotFound => 2,              // ENOENT
            FsError::NotADirectory => 20,        // ENOTDIR
            FsError::IsADirectory => 21,         // EISDIR
            FsError::NotEmpty => 39,             // ENOTEMPTY
            FsError::InvalidOption(_) => 22,     // EINVAL
            FsError::InvalidArgument => 22,      // EINVAL
            FsError::NameTooLong => 36,          // ENAMETOOLONG
            FsError::InvalidHandle => 9,         // EBADF
            FsError::Stale => 116,               // ESTALE
            FsError::AlreadyRegistered(_) => 16, // EBUSY
            FsError::Busy => 16,                 // EBUSY
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
