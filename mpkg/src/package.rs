//! Opening package files: format dispatch, unpacking and verification.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tempfile::TempDir;

use mpkg_core::path as corepath;
use mpkg_core::{
    file_matches_md5, Compression, DescrEntry, EntryType, PackageDescr, ReadStream, TarReader,
    READ_WRITE_BUF_SIZE,
};

use crate::{Config, Error};

pub const DESCRIPTION_NAME: &str = "package-description";
pub const CONTENT_STEM: &str = "package-content.tar";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PkgVersion {
    /// A single tape archive, optionally compressed, carrying the
    /// description as one of its members.
    V1,
    /// An uncompressed outer archive holding the description and a
    /// compressed inner content archive.
    V2,
}

/// An opened package: parsed description plus payload staged in a scratch
/// directory. The scratch tree is removed when the handle drops.
#[derive(Debug)]
pub struct PackageHandle {
    descr: PackageDescr,
    version: PkgVersion,
    scratch: TempDir,
}

impl PackageHandle {
    /// Open a package file, guessing the format from the filename suffix
    /// and falling through to the other format if the guess fails.
    pub fn open(path: impl AsRef<Path>, cfg: &Config) -> Result<PackageHandle, Error> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let v2_first = name.ends_with(".mpkg") || name.ends_with(".pkg");
        let (first, second): (OpenFn, OpenFn) = if v2_first {
            (open_v2, open_v1)
        } else {
            (open_v1, open_v2)
        };

        match first(path, cfg) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                debug!(
                    "{}: preferred format failed ({}), trying the other",
                    path.display(),
                    err
                );
                match second(path, cfg) {
                    Ok(handle) => Ok(handle),
                    Err(other) => {
                        debug!("{}: fallback format failed too ({})", path.display(), other);
                        // The suffix-guessed attempt carries the useful
                        // diagnostics.
                        Err(err)
                    }
                }
            }
        }
    }

    pub fn descr(&self) -> &PackageDescr {
        &self.descr
    }

    pub fn version(&self) -> PkgVersion {
        self.version
    }

    /// Where a payload entry was unpacked to.
    pub fn staged_path(&self, entry_path: &Path) -> PathBuf {
        let rel = entry_path.strip_prefix("/").unwrap_or(entry_path);
        self.scratch.path().join("tree").join(rel)
    }

    /// Remove the scratch directory now rather than at drop time.
    pub fn close(self) -> Result<(), Error> {
        let path = self.scratch.path().to_path_buf();
        self.scratch.close().map_err(|err| Error::io(err, path))
    }

    /// Recompute the MD5 of every file the description records and compare.
    fn verify(&self) -> Result<(), Error> {
        for entry in self.descr.files() {
            let DescrEntry::File { path, md5, .. } = entry else {
                continue;
            };
            let staged = self.staged_path(path);
            if !staged.is_file() {
                return Err(Error::MissingPayload { path: path.clone() });
            }
            let matches =
                file_matches_md5(&staged, md5).map_err(|err| Error::io(err, &staged))?;
            if !matches {
                return Err(Error::HashMismatch { path: path.clone() });
            }
        }
        Ok(())
    }
}

type OpenFn = fn(&Path, &Config) -> Result<PackageHandle, Error>;

fn new_scratch(cfg: &Config) -> Result<TempDir, Error> {
    let scratch = tempfile::Builder::new()
        .prefix("mpkg.")
        .tempdir_in(&cfg.temp_dir)
        .map_err(|err| Error::io(err, &cfg.temp_dir))?;
    fs::create_dir(scratch.path().join("tree"))
        .map_err(|err| Error::io(err, scratch.path()))?;
    Ok(scratch)
}

/// Extract every regular member into `tree`, returning the bytes of the
/// `package-description` member if one was captured instead of extracted.
fn extract_members<R: Read>(
    tar: &mut TarReader<R>,
    tree: &Path,
    capture_descr: bool,
) -> Result<Option<Vec<u8>>, Error> {
    let mut descr_bytes = None;
    while let Some(info) = tar.next_file()? {
        if info.kind != EntryType::Regular {
            continue;
        }
        let Some(mut reader) = tar.file_reader() else {
            continue;
        };

        if capture_descr && info.name == Path::new(DESCRIPTION_NAME) {
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .map_err(mpkg_core::Error::Io)?;
            descr_bytes = Some(data);
            continue;
        }

        let rel = corepath::canonicalize(info.name.strip_prefix("/").unwrap_or(&info.name));
        if rel.starts_with("..") || rel == Path::new(".") {
            warn!("skipping archive member with unusable path {:?}", info.name);
            continue;
        }

        let dest = tree.join(&rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(err, parent))?;
        }
        let mut out =
            BufWriter::new(File::create(&dest).map_err(|err| Error::io(err, &dest))?);
        copy_stream(&mut reader, &mut out, &dest)?;
        out.flush().map_err(|err| Error::io(err, &dest))?;
    }
    Ok(descr_bytes)
}

fn copy_stream<R: Read, W: Write>(src: &mut R, dst: &mut W, context: &Path) -> Result<(), Error> {
    let mut buf = vec![0; READ_WRITE_BUF_SIZE];
    loop {
        let count = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(mpkg_core::Error::UnexpectedEof.into())
            }
            Err(err) => return Err(Error::io(err, context)),
        };
        dst.write_all(&buf[..count])
            .map_err(|err| Error::io(err, context))?;
    }
    Ok(())
}

fn open_v1(path: &Path, cfg: &Config) -> Result<PackageHandle, Error> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // Suffix-guessed layer first, then the remaining layers.
    let guessed = Compression::from_name(&name);
    let mut layers = vec![guessed];
    for layer in [Compression::None, Compression::Gzip, Compression::Bzip2] {
        if layer != guessed {
            layers.push(layer);
        }
    }

    let mut first_err = None;
    for layer in layers {
        match open_v1_layer(path, cfg, layer) {
            Ok(handle) => return Ok(handle),
            Err(err) => {
                debug!(
                    "{}: not a v1 archive with {:?} ({})",
                    path.display(),
                    layer,
                    err
                );
                first_err.get_or_insert(err);
            }
        }
    }
    Err(first_err.unwrap_or(Error::UnknownFormat {
        path: path.to_path_buf(),
    }))
}

fn open_v1_layer(
    path: &Path,
    cfg: &Config,
    layer: Compression,
) -> Result<PackageHandle, Error> {
    let stream = ReadStream::open_with(path, layer).map_err(|err| Error::io(err, path))?;
    let scratch = new_scratch(cfg)?;
    let tree = scratch.path().join("tree");

    let mut tar = TarReader::new(stream);
    let descr_bytes = extract_members(&mut tar, &tree, true)?;
    let descr_bytes = descr_bytes.ok_or(Error::MissingDescription)?;
    let descr = PackageDescr::parse(&descr_bytes[..])?;

    let handle = PackageHandle {
        descr,
        version: PkgVersion::V1,
        scratch,
    };
    if cfg.check_md5 {
        handle.verify()?;
    }
    Ok(handle)
}

fn open_v2(path: &Path, cfg: &Config) -> Result<PackageHandle, Error> {
    let stream = ReadStream::open(path).map_err(|err| Error::io(err, path))?;
    let scratch = new_scratch(cfg)?;
    let tree = scratch.path().join("tree");

    let mut outer = TarReader::new(stream);
    let mut descr = None;
    let mut content: Option<(PathBuf, Compression)> = None;

    while let Some(info) = outer.next_file()? {
        if info.kind != EntryType::Regular {
            continue;
        }
        let Some(mut reader) = outer.file_reader() else {
            continue;
        };
        let member = info.name.to_string_lossy().into_owned();

        if member == DESCRIPTION_NAME {
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .map_err(mpkg_core::Error::Io)?;
            descr = Some(PackageDescr::parse(&data[..])?);
        } else if member.starts_with(CONTENT_STEM) {
            let staged = scratch.path().join(&member);
            let mut out =
                BufWriter::new(File::create(&staged).map_err(|err| Error::io(err, &staged))?);
            copy_stream(&mut reader, &mut out, &staged)?;
            out.flush().map_err(|err| Error::io(err, &staged))?;
            content = Some((staged, Compression::from_name(&member)));
        } else {
            debug!("ignoring unexpected outer member {:?}", info.name);
        }
    }

    let descr = descr.ok_or(Error::MissingDescription)?;
    let (content_path, layer) = content.ok_or(Error::MissingContent)?;

    let inner = ReadStream::layer_over(
        ReadStream::open(&content_path).map_err(|err| Error::io(err, &content_path))?,
        layer,
    );
    let mut tar = TarReader::new(inner);
    extract_members(&mut tar, &tree, false)?;
    let _ = fs::remove_file(&content_path);

    let handle = PackageHandle {
        descr,
        version: PkgVersion::V2,
        scratch,
    };
    if cfg.check_md5 {
        handle.verify()?;
    }
    Ok(handle)
}
