mod bin;
mod config;
mod db;
mod emit;
mod fsutil;
mod install;
mod package;
mod remove;

pub use bin::*;
pub use config::*;
pub use db::*;
pub use emit::*;
pub use install::*;
pub use package::*;
pub use remove::*;

pub use mpkg_core as core;

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error at {path:?}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("out of disk space at {path:?}")]
    OutOfDisk {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Format(#[from] mpkg_core::Error),

    #[error("database backend error")]
    Sled(#[from] sled::Error),

    #[error("could not recognize {path:?} as a package file")]
    UnknownFormat { path: PathBuf },

    #[error("package has no package-description member")]
    MissingDescription,

    #[error("package has no package-content member")]
    MissingContent,

    #[error("package payload missing for {path:?}")]
    MissingPayload { path: PathBuf },

    #[error("MD5 mismatch for {path:?}")]
    HashMismatch { path: PathBuf },

    #[error("malformed database line {line} in {path:?}")]
    DbMalformed { path: PathBuf, line: usize },

    #[error("no package database in {dir:?}; run `mpkg createdb` first")]
    DbMissing { dir: PathBuf },

    #[error("a package database already exists at {path:?}")]
    DbExists { path: PathBuf },

    #[error("existing package description {path:?} is not a regular file")]
    DescrNotFile { path: PathBuf },

    #[error("{path:?} exists and is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("package {name} is not installed")]
    NotInstalled { name: String },
}

impl Error {
    /// Out-of-disk aborts a whole batch install; everything else only
    /// fails the package at hand.
    pub fn is_out_of_disk(&self) -> bool {
        matches!(self, Error::OutOfDisk { .. })
    }

    /// Attach path context to an I/O error, separating out `ENOSPC`.
    pub(crate) fn io(source: io::Error, path: impl AsRef<Path>) -> Error {
        let path = path.as_ref().to_path_buf();
        if source.raw_os_error() == Some(libc::ENOSPC) {
            Error::OutOfDisk { path, source }
        } else {
            Error::Io { source, path }
        }
    }
}
