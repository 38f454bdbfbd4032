//! Error types for flat-file store operations

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::TileAddr;

#[derive(Error, Debug)]
pub enum FfError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error(
        "corrupt record {record} in {path}: level={level} x={x} y={y} len={len} vers={vers}"
    )]
    CorruptRecord {
        path: PathBuf,
        record: u64,
        level: u32,
        x: u32,
        y: u32,
        len: u32,
        vers: u32,
    },

    #[error("truncated flat file {path}: record {record} at offset {offset} needs {needed} bytes, file has {file_size}")]
    TruncatedFile {
        path: PathBuf,
        record: u64,
        offset: u64,
        needed: u64,
        file_size: u64,
    },

    #[error("invalid index format in {path}: {detail}")]
    InvalidIndexFormat { path: PathBuf, detail: String },

    #[error("unsupported index format version {version} in {path}")]
    UnsupportedIndexVersion { path: PathBuf, version: u8 },

    #[error("invalid presence format in {path}: {detail}")]
    InvalidPresenceFormat { path: PathBuf, detail: String },

    #[error("misordered levels in index {path}")]
    MisorderedLevels { path: PathBuf },

    #[error("tile {0} outside declared coverage")]
    TileOutsideCoverage(TileAddr),

    #[error("zero-length tile {0}")]
    ZeroLengthTile(TileAddr),

    #[error("level {0} not present in coverage")]
    LevelNotCovered(u32),

    #[error("invalid coverage: {0}")]
    InvalidCoverage(String),

    #[error("payload for tile {addr} is {len} bytes, too large for one record")]
    PayloadTooLarge { addr: TileAddr, len: usize },

    #[error("tile {0} not found")]
    TileNotFound(TileAddr),
}

impl FfError {
    /// Attach a path to a raw OS error.
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, FfError>;
