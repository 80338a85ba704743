use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for VHDX image and backend operations.
///
/// Structural problems found while decoding the on-disk format are grouped under
/// [`DiskError::Format`]; everything else describes the request or the backend.
///
/// Note: [`DiskError::Io`] stores a human-readable `String` rather than `std::io::Error` so
/// non-OS backends can surface failures without a platform-specific error type.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("unaligned buffer length {len} (expected multiple of {alignment})")]
    UnalignedLength { len: usize, alignment: usize },

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("invalid vhdx image: {0}")]
    Format(#[from] FormatError),

    #[error("unsupported vhdx feature: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    #[error("image is opened read-only")]
    ReadOnly,

    #[error("image contains a metadata log that must be replayed before use")]
    LogReplayRequired,

    /// Generic I/O failure reported by the backend. Never interpreted by the image layer.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DiskError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Structural violations of the VHDX on-disk format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad signature: {0}")]
    InvalidSignature(&'static str),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(&'static str),

    #[error("neither header slot holds a valid header")]
    NoValidHeader,

    #[error("region [{start:#x}, +{len:#x}) overlaps a registered region")]
    OverlappingRegions { start: u64, len: u64 },

    #[error("duplicate entry: {0}")]
    DuplicateRequiredEntry(&'static str),

    #[error("unknown entry marked required: {0}")]
    UnsupportedRequiredFeature(&'static str),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(&'static str),

    #[error("bat entry {index} is out of bounds: {reason}")]
    BatOutOfBounds { index: u64, reason: &'static str },

    #[error("bat entry {index} offset overflows")]
    BatOffsetOverflow { index: u64 },

    #[error("differencing images are not supported")]
    DifferencingUnsupported,

    #[error("corrupt image: {0}")]
    Corrupt(&'static str),
}
