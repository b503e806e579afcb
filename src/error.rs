//! Error types for pmemvm.

use thiserror::Error;

/// Result type alias using pmemvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing persistent-memory regions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Argument errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Region table errors
    #[error("frames 0x{start:x}-0x{end:x} overlap an existing region")]
    Overlap { start: u64, end: u64 },

    #[error("frames 0x{start:x}-0x{end:x} conflict with a {kind} region")]
    Conflict {
        start: u64,
        end: u64,
        kind: &'static str,
    },

    #[error("frames 0x{start:x}-0x{end:x} are not covered by usable regions")]
    NotCovered { start: u64, end: u64 },

    #[error("insufficient management frames: {required} required, {available} available")]
    NoSpace { required: u64, available: u64 },

    #[error("no management region contains frames 0x{start:x}-0x{end:x}")]
    NoSuchManagementRegion { start: u64, end: u64 },

    #[error("out of memory allocating a region record")]
    OutOfMemory,

    // Page assignment errors
    #[error("frame 0x{0:x} is not free")]
    Busy(u64),

    #[error("invalid target VM {vm}: {reason}")]
    InvalidTarget { vm: u32, reason: String },

    #[error("frame 0x{mfn:x} ownership mismatch in VM {vm}: {detail}")]
    OwnershipMismatch { vm: u32, mfn: u64, detail: String },

    #[error("guest physmap error: {0}")]
    Physmap(String),

    // Platform errors
    #[error("platform backend error: {0}")]
    Backend(String),
}

/// errno values reported through the administrative surface.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

impl Error {
    /// Create a backend error from a message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Error::Backend(msg.into())
    }

    /// Create an invalid-argument error from a message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Positive errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_)
            | Error::InvalidConfig(_)
            | Error::InvalidTarget { .. } => errno::EINVAL,
            Error::Overlap { .. } | Error::Conflict { .. } => errno::EEXIST,
            Error::NotCovered { .. } | Error::NoSuchManagementRegion { .. } => errno::ENXIO,
            Error::NoSpace { .. } => errno::ENOSPC,
            Error::OutOfMemory => errno::ENOMEM,
            Error::Busy(_) => errno::EBUSY,
            Error::OwnershipMismatch { .. } | Error::Physmap(_) | Error::Backend(_) => errno::EIO,
        }
    }
}
