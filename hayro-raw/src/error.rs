//! Error types for raw image decoding.

use core::fmt;

use crate::util::fourcc_to_string;

/// The main error type for raw decoding operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Low-level out-of-bounds access. Never escapes [`crate::decode`].
    Io(IoError),
    /// Structural corruption of a container or directory.
    Format(FormatError),
    /// Errors raised while decompressing pixel data.
    Decoding(DecodingError),
    /// Recognized data that this crate cannot handle.
    Unsupported(UnsupportedError),
}

/// Errors related to buffer access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// A read or view request exceeded the buffer bounds.
    BufferOverflow {
        /// The requested offset.
        offset: u64,
        /// The requested number of bytes.
        count: u64,
        /// The size of the buffer.
        size: u64,
    },
    /// A bit reader ran past its input and the padding margin.
    BitStreamOverrun,
    /// A string had no terminator within bounds.
    UnterminatedString,
    /// An element count multiplied by its size overflowed.
    SizeOverflow,
    /// The input is larger than the 32-bit addressing limit.
    InputTooLarge,
    /// Tried to create an empty buffer.
    EmptyBuffer,
}

/// Errors related to the structure of containers and directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    /// A magic value did not match.
    InvalidSignature(&'static str),
    /// Two regions that must be disjoint overlap.
    Overlap(&'static str),
    /// Sub-directories are nested too deeply.
    NestingTooDeep {
        /// The depth that was reached.
        depth: u32,
    },
    /// A node has too many direct sub-directories.
    TooManyChildren {
        /// The number of children that was reached.
        count: u32,
    },
    /// A node has too many sub-directories in total.
    TooManyDescendants {
        /// The number of descendants that was reached.
        count: u32,
    },
    /// A TIFF entry has a type outside of the known range.
    UnknownEntryType {
        /// The tag of the entry.
        tag: u16,
        /// The type value.
        ty: u16,
    },
    /// A TIFF entry's byte size does not fit into 32 bits.
    EntrySizeOverflow {
        /// The tag of the entry.
        tag: u16,
    },
    /// A required entry is missing.
    MissingEntry {
        /// The tag of the entry.
        tag: u16,
    },
    /// An entry has a type that cannot be read as requested.
    WrongEntryType {
        /// The tag of the entry.
        tag: u16,
        /// The type value.
        ty: u16,
    },
    /// A multi-byte value was read before the byte order was known.
    UnknownByteOrder,
    /// A CIFF entry has an unknown data location.
    UnknownDataLocation(u16),
    /// A box was found where a different one was required.
    UnexpectedBox {
        /// The expected box type.
        expected: u32,
        /// The box type found.
        found: u32,
    },
    /// A box appears more than once although it may appear only once.
    DuplicateBox(u32),
    /// A mandatory box is missing.
    MissingBox(u32),
    /// A box header declares an invalid size.
    InvalidBoxSize,
    /// A fixed-layout record did not end where it should.
    LayoutMismatch {
        /// The expected position.
        expected: u32,
        /// The actual position.
        found: u32,
    },
    /// A generic structural inconsistency.
    Corrupt(&'static str),
}

/// Errors raised by the codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodingError {
    /// The input ended before decoding finished.
    Truncated(IoError),
    /// A bit sequence matched no prefix code.
    InvalidHuffmanCode,
    /// A prefix-code table is malformed.
    InvalidHuffmanTable(&'static str),
    /// The image or tile has invalid dimensions.
    InvalidDimensions {
        /// The width.
        width: u32,
        /// The height.
        height: u32,
    },
    /// Pixel data was allocated twice.
    AlreadyAllocated,
    /// Pixel data was accessed before allocation.
    NotAllocated,
    /// A JPEG marker was missing or unexpected.
    Marker(&'static str),
    /// The number of components does not match.
    ComponentMismatch {
        /// The expected count.
        expected: u32,
        /// The actual count.
        found: u32,
    },
    /// The inflate step of a deflate-compressed tile failed.
    Inflate,
    /// The embedded JPEG could not be decoded.
    Jpeg,
    /// A decoded value is outside of its valid range.
    ValueOutOfRange,
    /// The worker pool could not be created.
    ThreadPool,
    /// A generic codec-level inconsistency.
    Corrupt(&'static str),
}

/// Errors for recognized but unhandled data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedError {
    /// No parser recognized the input.
    UnknownFormat,
    /// The compression scheme is not supported.
    Compression(u32),
    /// The predictor is not supported.
    Predictor(u32),
    /// The bit depth is not supported.
    BitsPerSample(u32),
    /// A codec variant or feature is not supported.
    Feature(&'static str),
    /// The CR3 codec version string is not known.
    CodecVersion,
    /// The camera is explicitly not supported.
    Camera,
    /// The camera is unknown and guessing is disabled.
    UnknownCamera {
        /// The camera make.
        make: String,
        /// The camera model.
        model: String,
        /// The camera mode.
        mode: String,
    },
    /// The camera needs a newer decoder.
    DecoderVersion {
        /// The version the camera requires.
        required: u32,
    },
}

impl DecodeError {
    /// Map a low-level error into the decoding category, keeping all other kinds.
    pub(crate) fn normalize(self) -> Self {
        match self {
            Self::Io(e) => Self::Decoding(DecodingError::Truncated(e)),
            e => e,
        }
    }

    /// Whether the error is a nesting limit or overlap violation. Directory parsers never
    /// swallow these.
    pub(crate) fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Format(
                FormatError::NestingTooDeep { .. }
                    | FormatError::TooManyChildren { .. }
                    | FormatError::TooManyDescendants { .. }
                    | FormatError::Overlap(_)
            )
        )
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::Format(e) => write!(f, "{e}"),
            Self::Decoding(e) => write!(f, "{e}"),
            Self::Unsupported(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferOverflow {
                offset,
                count,
                size,
            } => write!(
                f,
                "buffer overflow: {count} bytes at offset {offset} exceed size {size}"
            ),
            Self::BitStreamOverrun => write!(f, "bit stream read past the end of its input"),
            Self::UnterminatedString => write!(f, "string is not terminated"),
            Self::SizeOverflow => write!(f, "integer overflow when calculating a size"),
            Self::InputTooLarge => write!(f, "input exceeds the 32-bit size limit"),
            Self::EmptyBuffer => write!(f, "buffer is empty"),
        }
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSignature(what) => write!(f, "invalid {what} signature"),
            Self::Overlap(what) => write!(f, "two {what} overlap, file is corrupt"),
            Self::NestingTooDeep { depth } => {
                write!(f, "sub-directories nested too deeply (depth {depth})")
            }
            Self::TooManyChildren { count } => {
                write!(f, "directory has too many sub-directories ({count})")
            }
            Self::TooManyDescendants { count } => {
                write!(f, "directory tree has too many sub-directories ({count})")
            }
            Self::UnknownEntryType { tag, ty } => {
                write!(f, "entry 0x{tag:x} has unknown type 0x{ty:x}")
            }
            Self::EntrySizeOverflow { tag } => {
                write!(f, "integer overflow in size of entry 0x{tag:x}")
            }
            Self::MissingEntry { tag } => write!(f, "entry 0x{tag:x} not found"),
            Self::WrongEntryType { tag, ty } => {
                write!(f, "wrong type 0x{ty:x} encountered on entry 0x{tag:x}")
            }
            Self::UnknownByteOrder => write!(f, "byte order is unknown"),
            Self::UnknownDataLocation(loc) => write!(f, "unknown data location 0x{loc:x}"),
            Self::UnexpectedBox { expected, found } => write!(
                f,
                "expected box '{}', found '{}'",
                fourcc_to_string(*expected),
                fourcc_to_string(*found)
            ),
            Self::DuplicateBox(ty) => write!(f, "duplicate '{}' box", fourcc_to_string(*ty)),
            Self::MissingBox(ty) => write!(f, "missing '{}' box", fourcc_to_string(*ty)),
            Self::InvalidBoxSize => write!(f, "invalid box size"),
            Self::LayoutMismatch { expected, found } => {
                write!(f, "record layout mismatch: at {found}, expected {expected}")
            }
            Self::Corrupt(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for DecodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(e) => write!(f, "input truncated: {e}"),
            Self::InvalidHuffmanCode => write!(f, "invalid prefix code"),
            Self::InvalidHuffmanTable(msg) => write!(f, "invalid prefix-code table: {msg}"),
            Self::InvalidDimensions { width, height } => {
                write!(f, "unexpected image dimensions ({width}; {height})")
            }
            Self::AlreadyAllocated => write!(f, "duplicate data allocation"),
            Self::NotAllocated => write!(f, "pixel data is not allocated"),
            Self::Marker(msg) => write!(f, "{msg}"),
            Self::ComponentMismatch { expected, found } => {
                write!(f, "component count mismatch: expected {expected}, found {found}")
            }
            Self::Inflate => write!(f, "failed to inflate tile"),
            Self::Jpeg => write!(f, "failed to decode embedded JPEG"),
            Self::ValueOutOfRange => write!(f, "decoded value out of range"),
            Self::ThreadPool => write!(f, "failed to create worker pool"),
            Self::Corrupt(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for UnsupportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFormat => write!(f, "no decoder found for this file"),
            Self::Compression(c) => write!(f, "unsupported compression {c}"),
            Self::Predictor(p) => write!(f, "unsupported predictor {p}"),
            Self::BitsPerSample(b) => write!(f, "unsupported bits per sample {b}"),
            Self::Feature(what) => write!(f, "unsupported {what}"),
            Self::CodecVersion => write!(f, "unsupported CR3 codec version"),
            Self::Camera => write!(f, "camera not supported (explicit)"),
            Self::UnknownCamera { make, model, mode } => write!(
                f,
                "camera '{make}' '{model}', mode '{mode}' not supported, and not allowed to guess"
            ),
            Self::DecoderVersion { required } => {
                write!(f, "camera requires decoder version {required}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}
impl std::error::Error for IoError {}
impl std::error::Error for FormatError {}
impl std::error::Error for DecodingError {}
impl std::error::Error for UnsupportedError {}

impl From<IoError> for DecodeError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<FormatError> for DecodeError {
    fn from(e: FormatError) -> Self {
        Self::Format(e)
    }
}

impl From<DecodingError> for DecodeError {
    fn from(e: DecodingError) -> Self {
        Self::Decoding(e)
    }
}

impl From<UnsupportedError> for DecodeError {
    fn from(e: UnsupportedError) -> Self {
        Self::Unsupported(e)
    }
}

/// Result type for raw decoding operations.
pub type Result<T> = core::result::Result<T, DecodeError>;

macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

macro_rules! err {
    ($err:expr) => {
        Err($err.into())
    };
}

pub(crate) use bail;
pub(crate) use err;
