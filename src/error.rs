use thiserror::Error;

/// Errors reported by the UBI core.
///
/// Variants correspond to the POSIX-style codes the on-device implementation
/// would return; the MTD's transport errors are carried inside [`UbiError::Io`].
#[derive(Error, Debug)]
pub enum UbiError {
    /// Bad argument: malformed geometry, empty or over-long volume name,
    /// zero LEB count.
    #[error("invalid argument")]
    InvalidArgument,

    /// No such volume, or the LEB is not mapped.
    #[error("not found")]
    NotFound,

    /// No free PEBs, or no room left in the partition or volume table.
    #[error("no space left on device")]
    NoSpace,

    /// LEB number out of range for the volume.
    #[error("out of range")]
    OutOfRange,

    /// Flash I/O failure, as reported by the MTD.
    #[error("flash I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A header failed magic, version or CRC validation.
    #[error("header magic or CRC mismatch")]
    BadHeader,

    /// The operation does not apply to this volume: resizing a static
    /// volume, or a same-size resize.
    #[error("operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, UbiError>;
