use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use mpkg::core::Compression;
use mpkg::{install_pkg, Config, EmitOpts, PackageDb, PackageHandle, PkgVersion};

struct TestEnv {
    tmpdir: tempfile::TempDir,
    cfg: Config,
}

impl TestEnv {
    fn new() -> TestEnv {
        let tmpdir = tempfile::tempdir().unwrap();
        let cfg = Config {
            inst_root: tmpdir.path().join("ir"),
            pkg_dir: tmpdir.path().join("md"),
            temp_dir: tmpdir.path().join("tmp"),
            check_md5: true,
        };
        fs::create_dir_all(&cfg.inst_root).unwrap();
        fs::create_dir_all(&cfg.temp_dir).unwrap();
        PackageDb::create_text(&cfg).unwrap().close().unwrap();
        TestEnv { tmpdir, cfg }
    }

    fn path(&self, p: &str) -> PathBuf {
        self.tmpdir.path().join(p)
    }

    /// A build tree with usr/bin/hello, mode 0755.
    fn hello_tree(&self, dir: &str, contents: &[u8]) -> PathBuf {
        let build = self.path(dir);
        fs::create_dir_all(build.join("usr/bin")).unwrap();
        let exe = build.join("usr/bin/hello");
        fs::write(&exe, contents).unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        build
    }

    fn emit(
        &self,
        name: &str,
        build: &Path,
        out_name: &str,
        version: PkgVersion,
        compression: Compression,
    ) -> PathBuf {
        let out = self.path(out_name);
        let opts = EmitOpts {
            version,
            compression,
            mtime: 1_700_000_000,
            include_dirs: true,
            ..EmitOpts::default()
        };
        mpkg::create(&self.cfg, name, build, &out, &opts).unwrap();
        out
    }

    fn owner_of(&self, path: &str) -> Option<String> {
        let db = PackageDb::open(&self.cfg).unwrap();
        db.query(Path::new(path)).unwrap()
    }

    /// Names of stray staging temporaries anywhere under the install root.
    fn stray_temps(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            for entry in fs::read_dir(dir).unwrap().flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.contains(".mpkg.") || name.contains(".save.") {
                    out.push(path.clone());
                }
                if path.is_dir() {
                    walk(&path, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.cfg.inst_root, &mut out);
        walk(&self.cfg.pkg_dir, &mut out);
        out
    }
}

#[test]
fn fresh_install_v1_gzip() {
    let env = TestEnv::new();
    let build = env.hello_tree("build", b"#!/bin/sh\necho hello\n");
    let pkg_file = env.emit(
        "hello",
        &build,
        "hello-1.tar.gz",
        PkgVersion::V1,
        Compression::Gzip,
    );

    let mut db = PackageDb::open(&env.cfg).unwrap();
    let pkg = PackageHandle::open(&pkg_file, &env.cfg).unwrap();
    assert_eq!(pkg.version(), PkgVersion::V1);
    install_pkg(&mut db, &pkg, &env.cfg).unwrap();
    db.close().unwrap();

    let hello = env.cfg.real_path("/usr/bin/hello");
    let meta = fs::metadata(&hello).unwrap();
    assert!(meta.is_file());
    assert_eq!(meta.permissions().mode() & 0o7777, 0o755);
    assert_eq!(meta.mtime(), 1_700_000_000);
    assert_eq!(
        fs::read(&hello).unwrap(),
        b"#!/bin/sh\necho hello\n"
    );

    // The metadata directory holds the description under the package name.
    let descr = mpkg::core::PackageDescr::from_file(env.cfg.descr_path("hello")).unwrap();
    assert_eq!(descr.name(), "hello");
    assert_eq!(descr.mtime(), 1_700_000_000);

    assert_eq!(env.owner_of("/usr").as_deref(), Some("hello"));
    assert_eq!(env.owner_of("/usr/bin").as_deref(), Some("hello"));
    assert_eq!(env.owner_of("/usr/bin/hello").as_deref(), Some("hello"));
    assert!(env.stray_temps().is_empty());
}

#[test]
fn reinstall_is_idempotent() {
    let env = TestEnv::new();
    let build = env.hello_tree("build", b"#!/bin/sh\necho hello\n");
    let pkg_file = env.emit(
        "hello",
        &build,
        "hello-1.tar.gz",
        PkgVersion::V1,
        Compression::Gzip,
    );

    let mut db = PackageDb::open(&env.cfg).unwrap();
    let pkg = PackageHandle::open(&pkg_file, &env.cfg).unwrap();
    install_pkg(&mut db, &pkg, &env.cfg).unwrap();

    let descr_first = fs::read(env.cfg.descr_path("hello")).unwrap();

    let pkg = PackageHandle::open(&pkg_file, &env.cfg).unwrap();
    install_pkg(&mut db, &pkg, &env.cfg).unwrap();
    let claims = db.entries().unwrap();
    db.close().unwrap();

    assert!(env.cfg.real_path("/usr/bin/hello").is_file());
    assert_eq!(fs::read(env.cfg.descr_path("hello")).unwrap(), descr_first);
    assert_eq!(claims.len(), 3);
    assert!(env.stray_temps().is_empty());
}

#[test]
fn upgrade_drops_stale_paths() {
    let env = TestEnv::new();
    let build = env.hello_tree("build1", b"#!/bin/sh\necho hello\n");
    let first = env.emit(
        "hello",
        &build,
        "hello-1.tar.gz",
        PkgVersion::V1,
        Compression::Gzip,
    );

    let mut db = PackageDb::open(&env.cfg).unwrap();
    let pkg = PackageHandle::open(&first, &env.cfg).unwrap();
    install_pkg(&mut db, &pkg, &env.cfg).unwrap();

    // Second generation renames the binary.
    let build2 = env.path("build2");
    copy_dir::copy_dir(&build, &build2).unwrap();
    fs::remove_file(build2.join("usr/bin/hello")).unwrap();
    fs::write(build2.join("usr/bin/hello2"), b"#!/bin/sh\necho hello2\n").unwrap();
    let second = env.emit(
        "hello",
        &build2,
        "hello-2.mpkg",
        PkgVersion::V2,
        Compression::Gzip,
    );

    let pkg = PackageHandle::open(&second, &env.cfg).unwrap();
    assert_eq!(pkg.version(), PkgVersion::V2);
    install_pkg(&mut db, &pkg, &env.cfg).unwrap();
    db.close().unwrap();

    assert!(!env.cfg.real_path("/usr/bin/hello").exists());
    assert!(env.cfg.real_path("/usr/bin/hello2").is_file());
    assert_eq!(env.owner_of("/usr/bin/hello"), None);
    assert_eq!(env.owner_of("/usr/bin/hello2").as_deref(), Some("hello"));
    assert!(env.stray_temps().is_empty());
}

#[test]
fn collision_with_non_directory_fails_cleanly() {
    let env = TestEnv::new();
    let build = env.hello_tree("build", b"#!/bin/sh\necho hello\n");
    let pkg_file = env.emit(
        "hello",
        &build,
        "hello-1.tar.gz",
        PkgVersion::V1,
        Compression::Gzip,
    );

    // /usr exists as a regular file in the install root.
    fs::write(env.cfg.real_path("/usr"), b"not a directory").unwrap();

    let mut db = PackageDb::open(&env.cfg).unwrap();
    let pkg = PackageHandle::open(&pkg_file, &env.cfg).unwrap();
    let err = install_pkg(&mut db, &pkg, &env.cfg).unwrap_err();
    assert!(!err.is_out_of_disk());
    db.close().unwrap();

    // Nothing changed: the file is still there, no description, no claims.
    assert_eq!(
        fs::read(env.cfg.real_path("/usr")).unwrap(),
        b"not a directory"
    );
    assert!(!env.cfg.descr_path("hello").exists());
    let db = PackageDb::open(&env.cfg).unwrap();
    assert_eq!(db.entry_count(), 0);
    assert!(env.stray_temps().is_empty());
}

#[test]
fn symlink_entries_install_and_displace() {
    let env = TestEnv::new();
    let build = env.hello_tree("build", b"#!/bin/sh\necho hello\n");
    std::os::unix::fs::symlink("hello", build.join("usr/bin/hi")).unwrap();
    let pkg_file = env.emit(
        "hello",
        &build,
        "hello-1.tar.bz2",
        PkgVersion::V1,
        Compression::Bzip2,
    );

    // Something squats on the link path already.
    fs::create_dir_all(env.cfg.real_path("/usr/bin")).unwrap();
    fs::write(env.cfg.real_path("/usr/bin/hi"), b"squatter").unwrap();

    let mut db = PackageDb::open(&env.cfg).unwrap();
    let pkg = PackageHandle::open(&pkg_file, &env.cfg).unwrap();
    install_pkg(&mut db, &pkg, &env.cfg).unwrap();
    db.close().unwrap();

    let link = env.cfg.real_path("/usr/bin/hi");
    let meta = fs::symlink_metadata(&link).unwrap();
    assert!(meta.file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("hello"));
    assert_eq!(env.owner_of("/usr/bin/hi").as_deref(), Some("hello"));
    assert!(env.stray_temps().is_empty());
}

#[test]
fn end_to_end_v2_install_and_remove() {
    let env = TestEnv::new();
    let build = env.hello_tree("build", b"#!/bin/sh\necho hello\n");
    let pkg_file = env.emit(
        "hello",
        &build,
        "hello-1.mpkg",
        PkgVersion::V2,
        Compression::Bzip2,
    );

    mpkg::install(&env.cfg, &[&pkg_file]).unwrap();
    assert!(env.cfg.real_path("/usr/bin/hello").is_file());

    mpkg::remove(&env.cfg, &["hello"]).unwrap();

    assert!(!env.cfg.real_path("/usr/bin/hello").exists());
    assert!(!env.cfg.real_path("/usr/bin").exists());
    assert!(!env.cfg.real_path("/usr").exists());
    assert!(!env.cfg.descr_path("hello").exists());
    let db = PackageDb::open(&env.cfg).unwrap();
    assert_eq!(db.entry_count(), 0);
}
