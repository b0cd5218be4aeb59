//! The transactional package installer.
//!
//! An install must either fully succeed or leave the install root, the
//! metadata directory and the ownership database untouched, even when the
//! disk fills up halfway through. To get there it runs in eight passes:
//!
//! 1. Install the new description, moving any previous one aside.
//! 2. Create the directories the description names, mode `0700`.
//! 3. Copy file content into temporary names inside the final directories.
//! 4. Create symlinks, renaming aside anything in the way.
//!
//! After pass four every new byte is on disk, so nothing that follows can
//! fail for lack of space. Any error up to this point unwinds passes
//! 4 → 3 → 2 → 1 and reports failure.
//!
//! 5. Fix up directory ownership and modes, claim them in the database.
//! 6. Link each temporary to its final name, clear whatever was there.
//! 7. Drop the renamed-aside symlink victims, claim the new links.
//! 8. Reap paths owned by the previous generation of this package that the
//!    new description no longer mentions.
//!
//! Passes 5–8 only rename, relabel or delete; their errors are logged and
//! skipped because the manifest is already committed.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use mpkg_core::path::{cmp_post_order, components, PreOrderPath};
use mpkg_core::{DescrEntry, PackageDescr};

use crate::db::PackageDb;
use crate::fsutil::{self, recrm, remove_existing, rename_to_temp, stage_copy};
use crate::package::PackageHandle;
use crate::{Config, Error};

#[derive(Clone, Copy, Debug)]
struct DirRecord {
    uid: u32,
    gid: u32,
    mode: u32,
    /// The package asserts ownership of this directory in pass 5.
    claim: bool,
    /// This install created the directory, so rollback removes it.
    unroll: bool,
}

#[derive(Debug)]
struct FileRecord {
    temp: PathBuf,
    uid: u32,
    gid: u32,
    mode: u32,
    mtime: i64,
}

/// Everything that must be undone if the install fails before the point of
/// no return. Keys are package paths; the install root is re-applied on
/// every filesystem touch.
#[derive(Default)]
struct InstallState {
    old_descr: Option<PathBuf>,
    new_descr: Option<PathBuf>,
    pass_two_dirs: BTreeMap<PreOrderPath, DirRecord>,
    pass_three_dirs: BTreeMap<PreOrderPath, DirRecord>,
    pass_three_files: BTreeMap<PathBuf, FileRecord>,
    new_symlinks: Vec<PathBuf>,
    /// `(package path, temporary location)` of displaced originals.
    displaced: Vec<(PathBuf, PathBuf)>,
}

#[derive(Clone, Copy)]
enum BookSel {
    PassTwo,
    PassThree,
}

#[cfg(test)]
#[derive(Clone, Debug)]
pub(crate) enum Fault {
    /// Fail the staging of this file entry with ENOSPC.
    StageFile(PathBuf),
}

struct Install<'a> {
    db: &'a mut PackageDb,
    pkg: &'a PackageHandle,
    cfg: &'a Config,
    state: InstallState,
    #[cfg(test)]
    fault: Option<Fault>,
}

/// Install one opened package against the ownership database.
pub fn install_pkg(db: &mut PackageDb, pkg: &PackageHandle, cfg: &Config) -> Result<(), Error> {
    Install {
        db,
        pkg,
        cfg,
        state: InstallState::default(),
        #[cfg(test)]
        fault: None,
    }
    .run()
}

#[cfg(test)]
pub(crate) fn install_pkg_with_fault(
    db: &mut PackageDb,
    pkg: &PackageHandle,
    cfg: &Config,
    fault: Fault,
) -> Result<(), Error> {
    Install {
        db,
        pkg,
        cfg,
        state: InstallState::default(),
        fault: Some(fault),
    }
    .run()
}

impl Install<'_> {
    fn run(mut self) -> Result<(), Error> {
        let staged = self.stage_all();
        if let Err(err) = staged {
            self.rollback();
            return Err(err);
        }

        // Point of no return: all new content is on disk under temporary
        // names.
        self.finalize_dirs();
        self.finalize_files();
        self.finalize_symlinks();
        self.reap_old_generation();
        Ok(())
    }

    /// Passes 1–4, the rollback window.
    fn stage_all(&mut self) -> Result<(), Error> {
        self.install_descr()?;
        self.prepare_dirs()?;
        self.stage_files()?;
        self.stage_symlinks()
    }

    /// Pass 1: install the description into the metadata directory.
    fn install_descr(&mut self) -> Result<(), Error> {
        let descr_path = self.cfg.descr_path(self.pkg.descr().name());
        match fs::symlink_metadata(&descr_path) {
            Ok(meta) if meta.is_file() => {
                self.state.old_descr = Some(rename_to_temp(&descr_path)?);
            }
            Ok(_) => return Err(Error::DescrNotFile { path: descr_path }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::io(err, &descr_path)),
        }

        // A failed write here means either no permission to the metadata
        // directory or no disk; both stop the whole batch.
        self.pkg.descr().to_file(&descr_path).map_err(|err| {
            let source = match err {
                mpkg_core::Error::Io(io_err) => io_err,
                other => io::Error::other(other.to_string()),
            };
            Error::OutOfDisk {
                path: descr_path.clone(),
                source,
            }
        })?;
        self.state.new_descr = Some(descr_path);
        Ok(())
    }

    /// Pass 2: make every directory the description names exist.
    fn prepare_dirs(&mut self) -> Result<(), Error> {
        let pkg = self.pkg;
        for entry in pkg.descr().dirs() {
            let DescrEntry::Directory {
                path,
                owner,
                group,
                mode,
            } = entry
            else {
                continue;
            };
            let uid = fsutil::resolve_owner(owner);
            let gid = fsutil::resolve_group(group);
            self.walk_parents(path, BookSel::PassTwo)?;
            self.claim_dir(path, uid, gid, *mode)?;
        }
        Ok(())
    }

    /// Pass 3: copy file content to temporaries in the final directories.
    fn stage_files(&mut self) -> Result<(), Error> {
        let pkg = self.pkg;
        for entry in pkg.descr().files() {
            let DescrEntry::File {
                path, owner, group, mode, ..
            } = entry
            else {
                continue;
            };
            self.walk_parents(path, BookSel::PassThree)?;

            #[cfg(test)]
            if let Some(Fault::StageFile(target)) = &self.fault {
                if target == path {
                    return Err(Error::OutOfDisk {
                        path: path.clone(),
                        source: io::Error::from_raw_os_error(libc::ENOSPC),
                    });
                }
            }

            let staged_src = pkg.staged_path(path);
            if !staged_src.is_file() {
                return Err(Error::MissingPayload { path: path.clone() });
            }

            let real = self.cfg.real_path(path);
            let dir = real.parent().unwrap_or(Path::new("/")).to_path_buf();
            let base = path.file_name().unwrap_or_default();
            let temp = stage_copy(&staged_src, &dir, base)?;

            self.state.pass_three_files.insert(
                path.clone(),
                FileRecord {
                    temp,
                    uid: fsutil::resolve_owner(owner),
                    gid: fsutil::resolve_group(group),
                    mode: *mode,
                    mtime: pkg.descr().mtime(),
                },
            );
        }
        Ok(())
    }

    /// Pass 4: create symlinks, renaming aside whatever is in the way.
    fn stage_symlinks(&mut self) -> Result<(), Error> {
        let pkg = self.pkg;
        for entry in pkg.descr().symlinks() {
            let DescrEntry::Symlink { path, target, .. } = entry else {
                continue;
            };
            self.walk_parents(path, BookSel::PassThree)?;

            let real = self.cfg.real_path(path);
            match fs::symlink_metadata(&real) {
                Ok(_) => {
                    let temp = rename_to_temp(&real)?;
                    self.state.displaced.push((path.clone(), temp));
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(Error::io(err, &real)),
            }
            std::os::unix::fs::symlink(target, &real).map_err(|err| Error::io(err, &real))?;
            self.state.new_symlinks.push(path.clone());
        }
        Ok(())
    }

    /// Create missing parents of `path` with mode 0700, recording each one
    /// in the selected book so rollback can unroll it.
    fn walk_parents(&mut self, path: &Path, book: BookSel) -> Result<(), Error> {
        let comps: Vec<_> = components(path).collect();
        if comps.len() <= 1 {
            return Ok(());
        }
        let mut partial = PathBuf::from("/");
        for comp in &comps[..comps.len() - 1] {
            partial.push(comp);
            self.ensure_dir(&partial, book)?;
        }
        Ok(())
    }

    fn ensure_dir(&mut self, path: &Path, book: BookSel) -> Result<(), Error> {
        let real = self.cfg.real_path(path);
        match fs::symlink_metadata(&real) {
            // A pre-existing directory belongs to the filesystem, not to
            // this install.
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::NotADirectory { path: real }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                mkdir_private(&real)?;
                let record = DirRecord {
                    uid: 0,
                    gid: 0,
                    mode: 0o755,
                    claim: false,
                    unroll: true,
                };
                let book = match book {
                    BookSel::PassTwo => &mut self.state.pass_two_dirs,
                    BookSel::PassThree => &mut self.state.pass_three_dirs,
                };
                book.entry(PreOrderPath::from(path)).or_insert(record);
                Ok(())
            }
            Err(err) => Err(Error::io(err, &real)),
        }
    }

    /// Handle the final component of a pass-2 directory entry.
    fn claim_dir(&mut self, path: &Path, uid: u32, gid: u32, mode: u32) -> Result<(), Error> {
        let real = self.cfg.real_path(path);
        let created = match fs::symlink_metadata(&real) {
            Ok(meta) if meta.is_dir() => false,
            Ok(_) => return Err(Error::NotADirectory { path: real }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                mkdir_private(&real)?;
                true
            }
            Err(err) => return Err(Error::io(err, &real)),
        };

        match self.state.pass_two_dirs.entry(PreOrderPath::from(path)) {
            MapEntry::Occupied(mut slot) => {
                // Already walked as an intermediate; upgrade to a claim but
                // keep the unroll decision made at creation time.
                let record = slot.get_mut();
                record.claim = true;
                record.uid = uid;
                record.gid = gid;
                record.mode = mode;
                record.unroll |= created;
            }
            MapEntry::Vacant(slot) => {
                slot.insert(DirRecord {
                    uid,
                    gid,
                    mode,
                    claim: true,
                    unroll: created,
                });
            }
        }
        Ok(())
    }

    /// Unwind passes 4 → 3 → 2 → 1. Rollback itself is best-effort: a step
    /// that fails is logged and the rest still runs.
    fn rollback(&mut self) {
        for path in self.state.new_symlinks.iter().rev() {
            let real = self.cfg.real_path(path);
            if let Err(err) = remove_existing(&real) {
                warn!("rollback: couldn't remove symlink {}: {}", real.display(), err);
            }
        }
        for (path, temp) in self.state.displaced.iter().rev() {
            let real = self.cfg.real_path(path);
            if let Err(err) = fs::rename(temp, &real) {
                warn!("rollback: couldn't restore {}: {}", real.display(), err);
            }
        }

        for record in self.state.pass_three_files.values() {
            if let Err(err) = remove_existing(&record.temp) {
                warn!(
                    "rollback: couldn't remove temporary {}: {}",
                    record.temp.display(),
                    err
                );
            }
        }
        // Children before parents; reverse pre-order gives post-order
        // removal, and recrm tolerates paths a parent unroll already swept.
        for (key, record) in self.state.pass_three_dirs.iter().rev() {
            if record.unroll {
                if let Err(err) = recrm(self.cfg.real_path(key.as_path())) {
                    warn!("rollback: {}", err);
                }
            }
        }
        for (key, record) in self.state.pass_two_dirs.iter().rev() {
            if record.unroll {
                if let Err(err) = recrm(self.cfg.real_path(key.as_path())) {
                    warn!("rollback: {}", err);
                }
            }
        }

        if let Some(descr_path) = &self.state.new_descr {
            if let Err(err) = remove_existing(descr_path) {
                warn!(
                    "rollback: couldn't remove description {}: {}",
                    descr_path.display(),
                    err
                );
            }
        }
        if let Some(old) = &self.state.old_descr {
            let descr_path = self.cfg.descr_path(self.pkg.descr().name());
            match fs::hard_link(old, &descr_path) {
                Ok(()) => {
                    if let Err(err) = remove_existing(old) {
                        warn!("rollback: couldn't drop {}: {}", old.display(), err);
                    }
                }
                Err(err) => warn!(
                    "rollback: couldn't restore description {}: {}",
                    descr_path.display(),
                    err
                ),
            }
        }
    }

    /// Pass 5: directory metadata and claims, parents first.
    fn finalize_dirs(&mut self) {
        let pkg = self.pkg;
        let name = pkg.descr().name();
        for (key, record) in &self.state.pass_two_dirs {
            if !record.claim {
                continue;
            }
            let path = key.as_path();
            let real = self.cfg.real_path(path);
            if let Err(err) =
                fsutil::apply_meta(&real, record.uid, record.gid, record.mode, None)
            {
                warn!("couldn't set metadata on {}: {}", real.display(), err);
            }
            if let Err(err) = self.db.insert(path, name) {
                warn!("couldn't record claim for {}: {}", path.display(), err);
            }
        }
    }

    /// Pass 6: link temporaries to their final names.
    fn finalize_files(&mut self) {
        let pkg = self.pkg;
        let name = pkg.descr().name();
        for (path, record) in &self.state.pass_three_files {
            let real = self.cfg.real_path(path);

            match fs::symlink_metadata(&real) {
                Ok(meta) if meta.is_dir() => {
                    remove_tree_and_claims(self.db, self.cfg, path);
                }
                Ok(_) => {
                    if let Err(err) = fs::remove_file(&real) {
                        warn!("couldn't clear {}: {}", real.display(), err);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("couldn't stat {}: {}", real.display(), err),
            }

            if let Err(err) = fs::hard_link(&record.temp, &real) {
                warn!("couldn't install {}: {}", real.display(), err);
                continue;
            }
            if let Err(err) = remove_existing(&record.temp) {
                warn!(
                    "couldn't remove temporary {}: {}",
                    record.temp.display(),
                    err
                );
            }
            if let Err(err) = fsutil::apply_meta(
                &real,
                record.uid,
                record.gid,
                record.mode,
                Some(record.mtime),
            ) {
                warn!("couldn't set metadata on {}: {}", real.display(), err);
            }
            if let Err(err) = self.db.insert(path, name) {
                warn!("couldn't record claim for {}: {}", path.display(), err);
            }
        }
    }

    /// Pass 7: retire displaced originals, claim the new symlinks.
    fn finalize_symlinks(&mut self) {
        let name = self.pkg.descr().name();
        for (path, temp) in &self.state.displaced {
            if let Err(err) = recrm(temp) {
                warn!("couldn't remove displaced {}: {}", temp.display(), err);
            }
            if let Err(err) = self.db.remove(path) {
                warn!("couldn't drop claim for {}: {}", path.display(), err);
            }
        }
        for path in &self.state.new_symlinks {
            if let Err(err) = self.db.insert(path, name) {
                warn!("couldn't record claim for {}: {}", path.display(), err);
            }
        }
    }

    /// Pass 8: remove paths the prior generation owned that the new
    /// description no longer mentions, then drop the old description.
    fn reap_old_generation(&mut self) {
        let Some(old) = self.state.old_descr.clone() else {
            return;
        };
        let pkg = self.pkg;
        let name = pkg.descr().name();

        let old_descr = match PackageDescr::from_file(&old) {
            Ok(descr) => descr,
            Err(err) => {
                warn!("couldn't read prior description: {}", err);
                let _ = remove_existing(&old);
                return;
            }
        };

        for entry in old_descr.files().chain(old_descr.symlinks()) {
            let path = entry.path();
            if pkg.descr().contains_path(path) {
                continue;
            }
            if !self.owned_by(path, name) {
                continue;
            }
            let real = self.cfg.real_path(path);
            if let Err(err) = remove_existing(&real) {
                warn!("couldn't reap {}: {}", real.display(), err);
            }
            if let Err(err) = self.db.remove(path) {
                warn!("couldn't drop claim for {}: {}", path.display(), err);
            }
        }

        let mut dirs: Vec<&Path> = old_descr.dirs().map(|entry| entry.path()).collect();
        dirs.sort_by(|a, b| cmp_post_order(a, b));
        for path in dirs {
            if pkg.descr().contains_path(path) {
                continue;
            }
            if !self.owned_by(path, name) {
                continue;
            }
            let real = self.cfg.real_path(path);
            match fs::remove_dir(&real) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => debug!("leaving {}: {}", real.display(), err),
            }
            if let Err(err) = self.db.remove(path) {
                warn!("couldn't drop claim for {}: {}", path.display(), err);
            }
        }

        if let Err(err) = remove_existing(&old) {
            warn!("couldn't remove prior description {}: {}", old.display(), err);
        }
    }

    fn owned_by(&self, path: &Path, name: &str) -> bool {
        match self.db.query(path) {
            Ok(owner) => owner.as_deref() == Some(name),
            Err(err) => {
                warn!("couldn't query {}: {}", path.display(), err);
                false
            }
        }
    }
}

fn mkdir_private(path: &Path) -> Result<(), Error> {
    fs::DirBuilder::new()
        .mode(0o700)
        .create(path)
        .map_err(|err| Error::io(err, path))
}

/// Remove a directory tree that a file is about to replace, dropping the
/// database claim of everything swept away.
fn remove_tree_and_claims(db: &mut PackageDb, cfg: &Config, path: &Path) {
    let real = cfg.real_path(path);
    let entries = match fs::read_dir(&real) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("couldn't read {}: {}", real.display(), err);
            return;
        }
    };
    for entry in entries.flatten() {
        let child = path.join(entry.file_name());
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            remove_tree_and_claims(db, cfg, &child);
        } else {
            if let Err(err) = remove_existing(&cfg.real_path(&child)) {
                warn!("couldn't remove {}: {}", child.display(), err);
            }
            if let Err(err) = db.remove(&child) {
                warn!("couldn't drop claim for {}: {}", child.display(), err);
            }
        }
    }
    match fs::remove_dir(&real) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("couldn't remove {}: {}", real.display(), err),
    }
    if let Err(err) = db.remove(path) {
        warn!("couldn't drop claim for {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{create_pkg, EmitOpts};
    use crate::package::PkgVersion;
    use mpkg_core::Compression;

    struct Fixture {
        _tmp: tempfile::TempDir,
        cfg: Config,
        pkg_file: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config {
            inst_root: tmp.path().join("ir"),
            pkg_dir: tmp.path().join("md"),
            temp_dir: tmp.path().join("tmp"),
            check_md5: true,
        };
        fs::create_dir_all(&cfg.inst_root).unwrap();
        fs::create_dir_all(&cfg.temp_dir).unwrap();

        let build = tmp.path().join("build");
        fs::create_dir_all(build.join("usr/bin")).unwrap();
        fs::write(build.join("usr/bin/hello"), b"#!/bin/sh\necho hello\n").unwrap();

        let pkg_file = tmp.path().join("hello-1.tar.gz");
        let opts = EmitOpts {
            version: PkgVersion::V1,
            compression: Compression::Gzip,
            mtime: 1_700_000_000,
            include_dirs: true,
            ..EmitOpts::default()
        };
        create_pkg("hello", &build, &pkg_file, &opts, &cfg).unwrap();

        Fixture {
            _tmp: tmp,
            cfg,
            pkg_file,
        }
    }

    #[test]
    fn staging_failure_rolls_everything_back() {
        let fx = fixture();
        let mut db = PackageDb::create_text(&fx.cfg).unwrap();
        let pkg = PackageHandle::open(&fx.pkg_file, &fx.cfg).unwrap();

        let err = install_pkg_with_fault(
            &mut db,
            &pkg,
            &fx.cfg,
            Fault::StageFile(PathBuf::from("/usr/bin/hello")),
        )
        .unwrap_err();
        assert!(err.is_out_of_disk());

        // The install root, metadata directory and database look untouched.
        assert!(!fx.cfg.real_path("/usr").exists());
        assert!(!fx.cfg.descr_path("hello").exists());
        assert_eq!(db.entry_count(), 0);
    }

    #[test]
    fn staging_failure_restores_previous_generation() {
        let fx = fixture();
        let mut db = PackageDb::create_text(&fx.cfg).unwrap();
        let pkg = PackageHandle::open(&fx.pkg_file, &fx.cfg).unwrap();

        install_pkg(&mut db, &pkg, &fx.cfg).unwrap();
        let descr_before = fs::read(fx.cfg.descr_path("hello")).unwrap();
        let claims_before = db.entries().unwrap();

        let pkg = PackageHandle::open(&fx.pkg_file, &fx.cfg).unwrap();
        let err = install_pkg_with_fault(
            &mut db,
            &pkg,
            &fx.cfg,
            Fault::StageFile(PathBuf::from("/usr/bin/hello")),
        )
        .unwrap_err();
        assert!(err.is_out_of_disk());

        // The prior description came back and the installed tree survived.
        assert_eq!(fs::read(fx.cfg.descr_path("hello")).unwrap(), descr_before);
        assert!(fx.cfg.real_path("/usr/bin/hello").is_file());
        assert_eq!(db.entries().unwrap(), claims_before);
    }
}
