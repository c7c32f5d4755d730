//! Random-access reads and writes of entry contents.

mod blocks;
pub mod file;

pub use file::{FileContext, FileError, OpenMode, OpenedFile, checked_end, checked_offset};
