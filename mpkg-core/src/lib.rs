//! On-disk formats and archive I/O for the mpkg package manager.
//!
//! This crate knows how bytes are laid out: layered byte streams, the
//! tape-archive codec, the package-description text format and the MD5
//! content digest. It never touches an install root or the package
//! database; that is `mpkg`'s job.

pub use crate::descr::{DescrEntry, PackageDescr};
pub use crate::error::Error;
pub use crate::md5::{file_matches_md5, file_md5, Md5Writer, HASH_LEN};
pub use crate::stream::{Compression, ReadStream, WriteStream};
pub use crate::tar::{EntryType, FileInfo, FileReader, FileWriter, TarReader, TarWriter, BLOCK_SIZE};

pub mod descr;
mod error;
pub mod md5;
pub mod path;
pub mod stream;
pub mod tar;

/// Buffer size for streamed copies and hashing.
pub const READ_WRITE_BUF_SIZE: usize = 64 * 1024;
