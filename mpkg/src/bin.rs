//! Command entry points shared by the CLI and tests.

use std::path::Path;

use log::{error, info};

use crate::db::PackageDb;
use crate::emit::{create_pkg, EmitOpts};
use crate::install::install_pkg;
use crate::package::PackageHandle;
use crate::remove::remove_pkg;
use crate::{Config, Error};

/// Install a batch of package files. A package that fails to open or
/// install is reported and skipped; running out of disk aborts the whole
/// batch, since every later package would hit the same wall.
pub fn install(cfg: &Config, packages: &[impl AsRef<Path>]) -> Result<(), Error> {
    let mut db = PackageDb::open(cfg)?;
    let mut result = Ok(());

    for package in packages {
        let path = package.as_ref();
        let pkg = match PackageHandle::open(path, cfg) {
            Ok(pkg) => pkg,
            Err(err) => {
                error!("couldn't open {} to install: {}", path.display(), err);
                continue;
            }
        };
        match install_pkg(&mut db, &pkg, cfg) {
            Ok(()) => info!("installed {}", pkg.descr().name()),
            Err(err) if err.is_out_of_disk() => {
                error!(
                    "out of disk space trying to install {}, stopping",
                    path.display()
                );
                result = Err(err);
                break;
            }
            Err(err) => error!("failed to install {}: {}", path.display(), err),
        }
    }

    result.and(db.close())
}

/// Remove a batch of installed packages by name.
pub fn remove(cfg: &Config, names: &[impl AsRef<str>]) -> Result<(), Error> {
    let mut db = PackageDb::open(cfg)?;
    for name in names {
        let name = name.as_ref();
        match remove_pkg(&mut db, name, cfg) {
            Ok(()) => info!("removed {}", name),
            Err(err) => error!("failed to remove {}: {}", name, err),
        }
    }
    db.close()
}

/// Build a package file from a directory tree.
pub fn create(
    cfg: &Config,
    name: &str,
    input_dir: impl AsRef<Path>,
    output: impl AsRef<Path>,
    opts: &EmitOpts,
) -> Result<(), Error> {
    create_pkg(name, input_dir.as_ref(), output.as_ref(), opts, cfg)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DbBackend {
    Text,
    Sled,
}

/// Create an empty ownership database of the chosen backend.
pub fn createdb(cfg: &Config, backend: DbBackend) -> Result<(), Error> {
    let db = match backend {
        DbBackend::Text => PackageDb::create_text(cfg)?,
        DbBackend::Sled => PackageDb::create_sled(cfg)?,
    };
    db.close()
}

/// Print every `PATH PACKAGE` pair in the database.
pub fn dumpdb(cfg: &Config) -> Result<(), Error> {
    let db = PackageDb::open(cfg)?;
    for (path, package) in db.entries()? {
        println!("{} {}", path.display(), package);
    }
    db.close()
}
