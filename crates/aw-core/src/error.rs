// ── Error ─────────────────────────────────────────────────────────────────────

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Fatal engine errors. Recoverable conditions (missing resource id in a
/// LOAD, over-complex polygons) are logged at their subsystem and never
/// surface here.
#[derive(Debug)]
pub enum Error {
    /// Decompression/parse failure in an asset; per-part loads are atomic.
    CorruptAsset { resource: u16, reason: String },
    /// Unknown opcode, bad jump target or call-stack misuse.
    InvalidInstruction { pc: u16, opcode: u8, reason: &'static str },
    /// Part id outside 0x3E80..=0x3E89.
    BadPart(u16),
    /// Data directory or bank file unusable.
    MissingData(PathBuf),
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CorruptAsset { resource, reason } => {
                write!(f, "corrupt asset {resource:#06x}: {reason}")
            }
            Error::InvalidInstruction { pc, opcode, reason } => {
                write!(f, "invalid instruction {opcode:#04x} at pc={pc:#06x}: {reason}")
            }
            Error::BadPart(id) => write!(f, "unknown game part {id:#06x}"),
            Error::MissingData(path) => write!(f, "missing data file: {}", path.display()),
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
