use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("unexpected end of archive inside a member")]
    UnexpectedEof,

    #[error("member payload was {actual} bytes, header declared {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("path does not fit in a tape header: {path:?}")]
    NameTooLong { path: PathBuf },

    #[error("symlink target does not fit in a tape header: {target:?}")]
    TargetTooLong { target: PathBuf },

    #[error("value {value:#o} does not fit in a {len}-byte octal field")]
    OctalOverflow { value: u64, len: usize },

    #[error("malformed package description at line {line}: {reason}")]
    MalformedDescr { line: usize, reason: String },

    #[error("description entry path is not absolute and canonical: {path:?}")]
    BadEntryPath { path: PathBuf },

    #[error("duplicate description entry path: {path:?}")]
    DuplicateEntry { path: PathBuf },

    #[error("invalid {field} in description entry: {value:?}")]
    BadEntryField { field: &'static str, value: String },

    #[error("invalid package name: {name:?}")]
    BadPackageName { name: String },
}

impl Error {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Error {
        Error::MalformedDescr {
            line,
            reason: reason.into(),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(err) => err,
            Error::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}
