//! The ownership database: a persistent map from path to owning package.
//!
//! Two backends share one interface. The text backend is a line-oriented
//! `PATH SP PACKAGE` file, loaded whole on open and written back on close.
//! The sled backend delegates to an embedded B-tree key-value store; values
//! read out of the store are copied into caller-owned strings.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use log::warn;

use crate::{Config, Error};

enum Backend {
    Text {
        path: PathBuf,
        map: BTreeMap<PathBuf, String>,
        dirty: bool,
    },
    Sled(sled::Db),
}

pub struct PackageDb {
    backend: Backend,
    closed: bool,
}

impl PackageDb {
    /// Open whichever backend lives in the metadata directory, probing the
    /// text file first.
    pub fn open(cfg: &Config) -> Result<PackageDb, Error> {
        let text = cfg.db_text_path();
        if text.is_file() {
            return PackageDb::open_text(&text);
        }
        let tree = cfg.db_sled_path();
        if tree.is_dir() {
            return Ok(PackageDb {
                backend: Backend::Sled(sled::open(tree)?),
                closed: false,
            });
        }
        Err(Error::DbMissing {
            dir: cfg.pkg_dir.clone(),
        })
    }

    /// Create an empty text database. The metadata directory is created if
    /// needed; an existing database of either backend is refused.
    pub fn create_text(cfg: &Config) -> Result<PackageDb, Error> {
        PackageDb::check_absent(cfg)?;
        fs::create_dir_all(&cfg.pkg_dir).map_err(|err| Error::io(err, &cfg.pkg_dir))?;
        let path = cfg.db_text_path();
        File::create(&path).map_err(|err| Error::io(err, &path))?;
        Ok(PackageDb {
            backend: Backend::Text {
                path,
                map: BTreeMap::new(),
                dirty: false,
            },
            closed: false,
        })
    }

    /// Create an empty sled database.
    pub fn create_sled(cfg: &Config) -> Result<PackageDb, Error> {
        PackageDb::check_absent(cfg)?;
        fs::create_dir_all(&cfg.pkg_dir).map_err(|err| Error::io(err, &cfg.pkg_dir))?;
        Ok(PackageDb {
            backend: Backend::Sled(sled::open(cfg.db_sled_path())?),
            closed: false,
        })
    }

    fn check_absent(cfg: &Config) -> Result<(), Error> {
        for path in [cfg.db_text_path(), cfg.db_sled_path()] {
            if path.exists() {
                return Err(Error::DbExists { path });
            }
        }
        Ok(())
    }

    fn open_text(path: &Path) -> Result<PackageDb, Error> {
        let data = fs::read(path).map_err(|err| Error::io(err, path))?;
        let mut map = BTreeMap::new();
        for (idx, line) in data.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            let split = line.iter().position(|b| *b == b' ');
            let (key, value) = match split {
                Some(at) => (&line[..at], &line[at + 1..]),
                None => {
                    return Err(Error::DbMalformed {
                        path: path.to_path_buf(),
                        line: idx + 1,
                    })
                }
            };
            let value = std::str::from_utf8(value)
                .ok()
                .filter(|v| !v.is_empty() && !v.contains(char::is_whitespace));
            let Some(value) = value else {
                return Err(Error::DbMalformed {
                    path: path.to_path_buf(),
                    line: idx + 1,
                });
            };
            if key.is_empty() {
                return Err(Error::DbMalformed {
                    path: path.to_path_buf(),
                    line: idx + 1,
                });
            }
            map.insert(
                PathBuf::from(OsStr::from_bytes(key)),
                value.to_string(),
            );
        }
        Ok(PackageDb {
            backend: Backend::Text {
                path: path.to_path_buf(),
                map,
                dirty: false,
            },
            closed: false,
        })
    }

    /// Assert that `path` is owned by `pkg` (upsert).
    pub fn insert(&mut self, path: &Path, pkg: &str) -> Result<(), Error> {
        match &mut self.backend {
            Backend::Text { map, dirty, .. } => {
                map.insert(path.to_path_buf(), pkg.to_string());
                *dirty = true;
            }
            Backend::Sled(db) => {
                db.insert(path.as_os_str().as_bytes(), pkg.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Drop the claim on `path`. Returns whether an entry existed.
    pub fn remove(&mut self, path: &Path) -> Result<bool, Error> {
        match &mut self.backend {
            Backend::Text { map, dirty, .. } => {
                let removed = map.remove(path).is_some();
                *dirty |= removed;
                Ok(removed)
            }
            Backend::Sled(db) => Ok(db.remove(path.as_os_str().as_bytes())?.is_some()),
        }
    }

    /// The package owning `path`, if any. The returned string is a fresh
    /// copy, valid across later database operations.
    pub fn query(&self, path: &Path) -> Result<Option<String>, Error> {
        match &self.backend {
            Backend::Text { map, .. } => Ok(map.get(path).cloned()),
            Backend::Sled(db) => Ok(db
                .get(path.as_os_str().as_bytes())?
                .map(|value| String::from_utf8_lossy(&value).into_owned())),
        }
    }

    pub fn entry_count(&self) -> u64 {
        match &self.backend {
            Backend::Text { map, .. } => map.len() as u64,
            Backend::Sled(db) => db.len() as u64,
        }
    }

    /// Every `(path, package)` pair exactly once, in key order.
    pub fn entries(&self) -> Result<Vec<(PathBuf, String)>, Error> {
        match &self.backend {
            Backend::Text { map, .. } => Ok(map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            Backend::Sled(db) => {
                let mut out = Vec::new();
                for item in db.iter() {
                    let (key, value) = item?;
                    out.push((
                        PathBuf::from(OsStr::from_bytes(&key)),
                        String::from_utf8_lossy(&value).into_owned(),
                    ));
                }
                Ok(out)
            }
        }
    }

    /// Persist pending changes without closing.
    pub fn sync(&mut self) -> Result<(), Error> {
        match &mut self.backend {
            Backend::Text { path, map, dirty } => {
                if !*dirty {
                    return Ok(());
                }
                let file = File::create(&*path).map_err(|err| Error::io(err, &*path))?;
                let mut out = BufWriter::new(file);
                for (key, value) in map.iter() {
                    out.write_all(key.as_os_str().as_bytes())
                        .and_then(|_| out.write_all(b" "))
                        .and_then(|_| out.write_all(value.as_bytes()))
                        .and_then(|_| out.write_all(b"\n"))
                        .map_err(|err| Error::io(err, &*path))?;
                }
                out.flush().map_err(|err| Error::io(err, &*path))?;
                *dirty = false;
                Ok(())
            }
            Backend::Sled(db) => {
                db.flush()?;
                Ok(())
            }
        }
    }

    pub fn close(mut self) -> Result<(), Error> {
        let result = self.sync();
        self.closed = true;
        result
    }
}

impl Drop for PackageDb {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.sync() {
                warn!("package database not saved cleanly: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        Config {
            inst_root: dir.join("root"),
            pkg_dir: dir.join("meta"),
            temp_dir: dir.to_path_buf(),
            check_md5: true,
        }
    }

    #[test]
    fn text_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let mut db = PackageDb::create_text(&cfg).unwrap();
        db.insert(Path::new("/usr/bin/hello"), "hello").unwrap();
        db.insert(Path::new("/usr"), "hello").unwrap();
        db.close().unwrap();

        let mut db = PackageDb::open(&cfg).unwrap();
        assert_eq!(db.entry_count(), 2);
        assert_eq!(
            db.query(Path::new("/usr/bin/hello")).unwrap().as_deref(),
            Some("hello")
        );
        assert!(db.remove(Path::new("/usr")).unwrap());
        assert!(!db.remove(Path::new("/usr")).unwrap());
        db.close().unwrap();

        let db = PackageDb::open(&cfg).unwrap();
        assert_eq!(db.entry_count(), 1);
    }

    #[test]
    fn text_backend_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        fs::create_dir_all(&cfg.pkg_dir).unwrap();
        fs::write(cfg.db_text_path(), b"/usr/bin/x pkg\nnopackage\n").unwrap();

        assert!(matches!(
            PackageDb::open(&cfg),
            Err(Error::DbMalformed { line: 2, .. })
        ));
    }

    #[test]
    fn text_backend_tolerates_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        fs::create_dir_all(&cfg.pkg_dir).unwrap();
        fs::write(cfg.db_text_path(), b"/usr pkg\n\n/var pkg2\n").unwrap();

        let db = PackageDb::open(&cfg).unwrap();
        assert_eq!(db.entry_count(), 2);
        let entries = db.entries().unwrap();
        assert_eq!(entries[0].0, PathBuf::from("/usr"));
    }

    #[test]
    fn sled_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let mut db = PackageDb::create_sled(&cfg).unwrap();
        db.insert(Path::new("/usr/bin/hello"), "hello").unwrap();
        db.close().unwrap();

        let db = PackageDb::open(&cfg).unwrap();
        assert_eq!(
            db.query(Path::new("/usr/bin/hello")).unwrap().as_deref(),
            Some("hello")
        );
        assert_eq!(db.entries().unwrap().len(), 1);
    }

    #[test]
    fn creating_over_an_existing_db_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        PackageDb::create_text(&cfg).unwrap().close().unwrap();
        assert!(matches!(
            PackageDb::create_sled(&cfg),
            Err(Error::DbExists { .. })
        ));
    }
}
