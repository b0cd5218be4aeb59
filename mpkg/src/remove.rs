//! Removing an installed package.

use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};

use mpkg_core::path::PostOrderPath;
use mpkg_core::{DescrEntry, PackageDescr};

use crate::db::PackageDb;
use crate::fsutil::remove_existing;
use crate::{Config, Error};

/// Remove `name` from the install root, guided by its installed
/// description. Only paths the database still attributes to this package
/// are touched; directories go children-first and only when empty.
pub fn remove_pkg(db: &mut PackageDb, name: &str, cfg: &Config) -> Result<(), Error> {
    let descr_path = cfg.descr_path(name);
    let descr = match PackageDescr::from_file(&descr_path) {
        Ok(descr) => descr,
        Err(mpkg_core::Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NotInstalled {
                name: name.to_string(),
            });
        }
        Err(err) => return Err(err.into()),
    };
    let owner = descr.name();

    // Symlinks and files first so directories can empty out.
    for entry in descr.symlinks().chain(descr.files()) {
        let path = entry.path();
        if !owned_by(db, path, owner) {
            continue;
        }
        let real = cfg.real_path(path);
        if let Err(err) = remove_existing(&real) {
            warn!("couldn't remove {}: {}", real.display(), err);
            continue;
        }
        if let Err(err) = db.remove(path) {
            warn!("couldn't drop claim for {}: {}", path.display(), err);
        }
    }

    let mut dirs: Vec<PostOrderPath> = descr
        .dirs()
        .filter_map(|entry| match entry {
            DescrEntry::Directory { path, .. } => Some(PostOrderPath::from(path.as_path())),
            _ => None,
        })
        .collect();
    dirs.sort();
    for key in dirs {
        let path = key.as_path();
        if !owned_by(db, path, owner) {
            continue;
        }
        let real = cfg.real_path(path);
        match fs::remove_dir(&real) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                debug!("leaving {}: {}", real.display(), err);
                continue;
            }
        }
        if let Err(err) = db.remove(path) {
            warn!("couldn't drop claim for {}: {}", path.display(), err);
        }
    }

    remove_existing(&descr_path).map_err(|err| Error::io(err, &descr_path))?;
    Ok(())
}

fn owned_by(db: &PackageDb, path: &Path, name: &str) -> bool {
    match db.query(path) {
        Ok(owner) => owner.as_deref() == Some(name),
        Err(err) => {
            warn!("couldn't query {}: {}", path.display(), err);
            false
        }
    }
}
