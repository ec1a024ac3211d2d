use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while reading or inspecting a class file.
///
/// `Corrupt` always means the input bytes are malformed; `InvalidIndex` means
/// an accessor was called with a constant pool index that does not hold the
/// expected kind of entry, which is a bug in the caller rather than in the
/// class file.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("corrupt class file: {0}")]
    Corrupt(CorruptKind),

    #[error("expected {expected} constant at pool index {index}")]
    InvalidIndex { index: u16, expected: &'static str },

    #[error("unsupported construct: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<CorruptKind> for Error {
    fn from(kind: CorruptKind) -> Self {
        Error::Corrupt(kind)
    }
}

/// The ways a class file can be malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CorruptKind {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid magic number {0:#010x}")]
    BadMagic(u32),
    #[error("invalid constant pool tag {0}")]
    BadTag(u8),
    #[error("invalid constant pool index {0}")]
    BadIndex(u16),
    #[error("malformed type descriptor")]
    BadDescriptor,
    #[error("Utf8 constant is not valid modified UTF-8")]
    BadUtf8,
    #[error("invalid newarray type operand {0}")]
    BadNewArrayType(u8),
    #[error("attribute length does not match its payload")]
    AttributeLengthMismatch,
    #[error("missing superclass for a class other than java.lang.Object")]
    InvalidSuperclass,
    #[error("invalid verification type tag {0}")]
    InvalidVerificationTag(u8),
    #[error("reserved stack map frame type {0}")]
    ReservedStackMapTag(u8),
    #[error("chop frame drops more locals than exist")]
    ChopUnderflow,
    #[error("method handle reference kind {0} out of range")]
    MethodHandleKind(u8),
    #[error("declared length exceeds the allocation ceiling")]
    OversizedAllocation,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

impl Error {
    /// Returns the corruption subkind if this error reports malformed input.
    pub fn corruption(&self) -> Option<CorruptKind> {
        match self {
            Error::Corrupt(kind) => Some(*kind),
            _ => None,
        }
    }
}
