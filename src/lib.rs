//! Write-once, quadtree-addressed flat-file tile storage
//!
//! A build writes tiles through a [`GridIndexedWriter`], which appends
//! padded records to size-split `pack.NN` data files while maintaining a
//! random-access index (`pack.idx`) and a presence bitmask
//! (`pack.presence`). Once closed, the directory is immutable; a
//! [`Reader`] locates any tile by its (level, row, col) address without
//! scanning data, and the [`scanner`] streams whole flat files for bulk
//! processing.

pub mod coverage;
pub mod error;
pub mod grid_writer;
pub mod index;
pub mod presence;
pub mod reader;
pub mod record;
pub mod scanner;
pub mod types;
pub mod util;
pub mod writer;

pub use coverage::{InsetCoverage, LevelCoverage, TileExtents};
pub use error::{FfError, Result};
pub use grid_writer::GridIndexedWriter;
pub use index::{IndexReader, IndexWriter};
pub use presence::{PresenceMask, PresenceMaskWriter};
pub use reader::{FileInfo, Reader, TileLocation};
pub use record::{RecordHeader, padded_len};
pub use scanner::{FlatFileScanner, ScanControl, estimate_tile_count, scan};
pub use types::{FfType, MAX_FUSION_LEVEL, TileAddr};
pub use writer::Writer;
