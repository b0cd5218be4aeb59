use std::env;
use std::path::{Path, PathBuf};

/// Process configuration, threaded explicitly through every operation.
///
/// The defaults realize packages under `/` with metadata in `/var/pkg`;
/// tests point all three directories somewhere disposable.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory under which all package paths are realized.
    pub inst_root: PathBuf,
    /// Directory holding per-package descriptions and the ownership
    /// database.
    pub pkg_dir: PathBuf,
    /// Parent for scratch directories.
    pub temp_dir: PathBuf,
    /// Verify MD5s after unpacking a package.
    pub check_md5: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            inst_root: PathBuf::from("/"),
            pkg_dir: PathBuf::from("/var/pkg"),
            temp_dir: env::temp_dir(),
            check_md5: true,
        }
    }
}

impl Config {
    /// Filesystem location of an absolute package path under the install
    /// root.
    pub fn real_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match path.strip_prefix("/") {
            Ok(rel) if rel.as_os_str().is_empty() => self.inst_root.clone(),
            Ok(rel) => self.inst_root.join(rel),
            Err(_) => self.inst_root.join(path),
        }
    }

    /// The canonical description file for an installed package.
    pub fn descr_path(&self, name: &str) -> PathBuf {
        self.pkg_dir.join(name)
    }

    pub(crate) fn db_text_path(&self) -> PathBuf {
        self.pkg_dir.join("pkgdb")
    }

    pub(crate) fn db_sled_path(&self) -> PathBuf {
        self.pkg_dir.join("pkgdb.sled")
    }
}
