//! Building package files from a directory tree.
//!
//! The scan walks the input tree in sorted order so the same inputs always
//! produce the same description. Emission drives the tape writer over a
//! layered sink: for v1 the archive itself may be compressed; for v2 the
//! outer archive stays raw and only the inner content archive is layered.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use mpkg_core::path::concat_paths;
use mpkg_core::{
    file_md5, Compression, DescrEntry, FileInfo, PackageDescr, TarWriter, WriteStream,
    READ_WRITE_BUF_SIZE,
};

use crate::fsutil::{group_name, owner_name};
use crate::package::{CONTENT_STEM, DESCRIPTION_NAME};
use crate::{Config, Error, PkgVersion};

/// Options for building one package file.
#[derive(Clone, Debug)]
pub struct EmitOpts {
    pub version: PkgVersion,
    pub compression: Compression,
    /// Header mtime, also applied to every emitted member.
    pub mtime: i64,
    /// Record directory entries (off by default; shared directories are
    /// usually better left to the filesystem).
    pub include_dirs: bool,
    pub include_files: bool,
    pub include_symlinks: bool,
}

impl Default for EmitOpts {
    fn default() -> EmitOpts {
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        EmitOpts {
            version: PkgVersion::V2,
            compression: Compression::Bzip2,
            mtime,
            include_dirs: false,
            include_files: true,
            include_symlinks: true,
        }
    }
}

impl EmitOpts {
    /// Derive version and compression from an output filename, keeping the
    /// defaults when the suffix says nothing.
    pub fn guess_from_name(mut self, name: &str) -> EmitOpts {
        if name.ends_with(".tar") {
            self.version = PkgVersion::V1;
            self.compression = Compression::None;
        } else if name.ends_with(".tar.gz") {
            self.version = PkgVersion::V1;
            self.compression = Compression::Gzip;
        } else if name.ends_with(".tar.bz2") {
            self.version = PkgVersion::V1;
            self.compression = Compression::Bzip2;
        } else if name.ends_with(".mpkg") || name.ends_with(".pkg") {
            self.version = PkgVersion::V2;
        }
        self
    }
}

struct PayloadFile {
    /// Absolute package path (description key).
    path: PathBuf,
    /// Where the bytes live on the build system.
    src: PathBuf,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
}

/// Scan `input_dir` and build a package file at `output`.
pub fn create_pkg(
    name: &str,
    input_dir: &Path,
    output: &Path,
    opts: &EmitOpts,
    cfg: &Config,
) -> Result<(), Error> {
    let mut descr = PackageDescr::new(name, opts.mtime)?;
    let mut payload = Vec::new();
    scan_dir(input_dir, Path::new("/"), opts, &mut descr, &mut payload)?;

    let mut descr_text = Vec::new();
    descr.write_to(&mut descr_text)?;

    match opts.version {
        PkgVersion::V1 => emit_v1(output, opts, &descr_text, &payload),
        PkgVersion::V2 => emit_v2(output, opts, &descr_text, &payload, cfg),
    }
}

fn scan_dir(
    dir: &Path,
    prefix: &Path,
    opts: &EmitOpts,
    descr: &mut PackageDescr,
    payload: &mut Vec<PayloadFile>,
) -> Result<(), Error> {
    // Sorted so the same tree always yields the same archive.
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| Error::io(err, dir))? {
        entries.push(entry.map_err(|err| Error::io(err, dir))?);
    }
    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    for entry in entries {
        let src = entry.path();
        let pkg_path = concat_paths(prefix, entry.file_name());
        let meta = fs::symlink_metadata(&src).map_err(|err| Error::io(err, &src))?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            if opts.include_dirs {
                descr.add_entry(DescrEntry::Directory {
                    path: pkg_path.clone(),
                    owner: owner_name(meta.uid()),
                    group: group_name(meta.gid()),
                    mode: meta.mode() & 0o7777,
                })?;
            }
            scan_dir(&src, &pkg_path, opts, descr, payload)?;
        } else if file_type.is_file() {
            if !opts.include_files {
                continue;
            }
            let md5 = file_md5(&src).map_err(|err| Error::io(err, &src))?;
            descr.add_entry(DescrEntry::File {
                path: pkg_path.clone(),
                owner: owner_name(meta.uid()),
                group: group_name(meta.gid()),
                mode: meta.mode() & 0o7777,
                md5,
            })?;
            payload.push(PayloadFile {
                path: pkg_path,
                src,
                size: meta.len(),
                mode: meta.mode() & 0o7777,
                uid: meta.uid(),
                gid: meta.gid(),
            });
        } else if file_type.is_symlink() {
            if !opts.include_symlinks {
                continue;
            }
            let target = fs::read_link(&src).map_err(|err| Error::io(err, &src))?;
            descr.add_entry(DescrEntry::Symlink {
                path: pkg_path,
                owner: owner_name(meta.uid()),
                group: group_name(meta.gid()),
                target,
            })?;
        } else {
            warn!(
                "{} is not a regular file, directory or symlink; skipped",
                src.display()
            );
        }
    }
    Ok(())
}

fn descr_member(len: u64, mtime: i64) -> FileInfo {
    FileInfo::regular(DESCRIPTION_NAME, len, 0o644, mtime)
}

fn put_payload<W: Write>(
    tar: &mut TarWriter<W>,
    files: &[PayloadFile],
    mtime: i64,
) -> Result<(), Error> {
    let mut buf = vec![0; READ_WRITE_BUF_SIZE];
    for file in files {
        let rel = file.path.strip_prefix("/").unwrap_or(&file.path);
        let mut info = FileInfo::regular(rel, file.size, file.mode, mtime);
        info.uid = file.uid;
        info.gid = file.gid;

        let mut member = tar.put_next_file(&info)?;
        let mut src = File::open(&file.src).map_err(|err| Error::io(err, &file.src))?;
        loop {
            let count = src.read(&mut buf).map_err(|err| Error::io(err, &file.src))?;
            if count == 0 {
                break;
            }
            member
                .write_all(&buf[..count])
                .map_err(|err| Error::io(err, &file.src))?;
        }
        member.finish()?;
    }
    Ok(())
}

fn finish_sink(sink: WriteStream, output: &Path) -> Result<(), Error> {
    let mut layer = Some(sink);
    while let Some(stream) = layer {
        layer = stream.finish().map_err(|err| Error::io(err, output))?;
    }
    Ok(())
}

fn emit_v1(
    output: &Path,
    opts: &EmitOpts,
    descr_text: &[u8],
    payload: &[PayloadFile],
) -> Result<(), Error> {
    let sink =
        WriteStream::create_with(output, opts.compression).map_err(|err| Error::io(err, output))?;
    let mut tar = TarWriter::new(sink);

    let mut member = tar.put_next_file(&descr_member(descr_text.len() as u64, opts.mtime))?;
    member
        .write_all(descr_text)
        .map_err(|err| Error::io(err, output))?;
    member.finish()?;

    put_payload(&mut tar, payload, opts.mtime)?;

    finish_sink(tar.finish()?, output)
}

fn emit_v2(
    output: &Path,
    opts: &EmitOpts,
    descr_text: &[u8],
    payload: &[PayloadFile],
    cfg: &Config,
) -> Result<(), Error> {
    // The outer header needs the content archive's size up front, so the
    // inner archive is staged to a scratch file first.
    let staging = tempfile::Builder::new()
        .prefix("mpkg-content.")
        .tempfile_in(&cfg.temp_dir)
        .map_err(|err| Error::io(err, &cfg.temp_dir))?;

    let inner = WriteStream::layer_over(
        WriteStream::create(staging.path()).map_err(|err| Error::io(err, staging.path()))?,
        opts.compression,
    );
    let mut tar = TarWriter::new(inner);
    put_payload(&mut tar, payload, opts.mtime)?;
    finish_sink(tar.finish()?, staging.path())?;

    let content_size = fs::metadata(staging.path())
        .map_err(|err| Error::io(err, staging.path()))?
        .len();
    let content_name = format!("{}{}", CONTENT_STEM, opts.compression.suffix());

    let sink = WriteStream::create(output).map_err(|err| Error::io(err, output))?;
    let mut tar = TarWriter::new(sink);

    let mut member = tar.put_next_file(&descr_member(descr_text.len() as u64, opts.mtime))?;
    member
        .write_all(descr_text)
        .map_err(|err| Error::io(err, output))?;
    member.finish()?;

    let mut member = tar.put_next_file(&FileInfo::regular(
        content_name,
        content_size,
        0o644,
        opts.mtime,
    ))?;
    let mut src = File::open(staging.path()).map_err(|err| Error::io(err, staging.path()))?;
    let mut buf = vec![0; READ_WRITE_BUF_SIZE];
    loop {
        let count = src
            .read(&mut buf)
            .map_err(|err| Error::io(err, staging.path()))?;
        if count == 0 {
            break;
        }
        member
            .write_all(&buf[..count])
            .map_err(|err| Error::io(err, output))?;
    }
    member.finish()?;

    finish_sink(tar.finish()?, output)
}
