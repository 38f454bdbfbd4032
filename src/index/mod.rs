//! Random-access index mapping tile addresses to flat-file byte ranges

pub mod reader;
pub mod storage;
pub mod writer;

pub use reader::IndexReader;
pub use storage::{Header, LevelRecord, TileRecord, TYPE_DATA_SIZE};
pub use writer::IndexWriter;
