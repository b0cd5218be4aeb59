//! Filesystem helpers shared by the installer, remover and emitter.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;
use nix::unistd::{chown, Gid, Group, Uid, User};

use mpkg_core::READ_WRITE_BUF_SIZE;

use crate::Error;

/// Depth-first removal of a tree, tolerant of paths that have already
/// vanished (a parent unroll may have swept a recorded child).
pub fn recrm(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::io(err, path)),
    };

    if meta.is_dir() {
        let entries = fs::read_dir(path).map_err(|err| Error::io(err, path))?;
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(err, path))?;
            recrm(entry.path())?;
        }
        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(err, path)),
        }
    } else {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(err, path)),
        }
    }
}

/// Remove a file, treating an already-absent path as success.
pub(crate) fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Move `path` aside to a unique sibling temporary and return the new
/// location.
pub fn rename_to_temp(path: &Path) -> Result<PathBuf, Error> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("tmp"));

    let placeholder = tempfile::Builder::new()
        .prefix(&format!(".{}.save.{}.", base, std::process::id()))
        .rand_bytes(6)
        .tempfile_in(parent)
        .map_err(|err| Error::io(err, parent))?;
    let temp = placeholder
        .into_temp_path()
        .keep()
        .map_err(|err| Error::io(err.error, parent))?;

    // rename replaces the placeholder atomically
    fs::rename(path, &temp).map_err(|err| Error::io(err, path))?;
    Ok(temp)
}

/// Hard-link `src` to `dst`, falling back to a streamed byte copy when the
/// two sit on different filesystems.
pub fn link_or_copy(src: &Path, dst: &Path) -> Result<(), Error> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => copy_contents(src, dst),
        Err(err) => Err(Error::io(err, dst)),
    }
}

fn copy_contents(src: &Path, dst: &Path) -> Result<(), Error> {
    let mut from = File::open(src).map_err(|err| Error::io(err, src))?;
    let mut to = File::create(dst).map_err(|err| Error::io(err, dst))?;
    let mut buf = vec![0; READ_WRITE_BUF_SIZE];
    loop {
        let count = from.read(&mut buf).map_err(|err| Error::io(err, src))?;
        if count == 0 {
            break;
        }
        to.write_all(&buf[..count])
            .map_err(|err| Error::io(err, dst))?;
    }
    to.flush().map_err(|err| Error::io(err, dst))?;
    Ok(())
}

/// Place a copy of `src` into `dir` under a staging name of the form
/// `.BASENAME.mpkg.PID.XXXXXX` and return the staged path. On failure no
/// temporary is left behind.
pub(crate) fn stage_copy(src: &Path, dir: &Path, base: &OsStr) -> Result<PathBuf, Error> {
    let placeholder = tempfile::Builder::new()
        .prefix(&format!(
            ".{}.mpkg.{}.",
            base.to_string_lossy(),
            std::process::id()
        ))
        .rand_bytes(6)
        .tempfile_in(dir)
        .map_err(|err| Error::io(err, dir))?;
    let temp = placeholder
        .into_temp_path()
        .keep()
        .map_err(|err| Error::io(err.error, dir))?;

    // the placeholder must not exist for the hard link to land
    if let Err(err) = remove_existing(&temp) {
        return Err(Error::io(err, &temp));
    }
    if let Err(err) = link_or_copy(src, &temp) {
        let _ = remove_existing(&temp);
        return Err(err);
    }
    Ok(temp)
}

/// Resolve a user name to a uid; unknown names fall back to 0.
pub(crate) fn resolve_owner(name: &str) -> u32 {
    match User::from_name(name) {
        Ok(Some(user)) => user.uid.as_raw(),
        _ => 0,
    }
}

/// Resolve a group name to a gid; unknown names fall back to 0.
pub(crate) fn resolve_group(name: &str) -> u32 {
    match Group::from_name(name) {
        Ok(Some(group)) => group.gid.as_raw(),
        _ => 0,
    }
}

/// Reverse lookup for package creation; unknown ids come out as `root`.
pub(crate) fn owner_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => String::from("root"),
    }
}

pub(crate) fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => String::from("root"),
    }
}

/// Set owner, group, permissions and optionally the mtime of a committed
/// path.
pub(crate) fn apply_meta(
    path: &Path,
    uid: u32,
    gid: u32,
    mode: u32,
    mtime: Option<i64>,
) -> Result<(), Error> {
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|errno| Error::io(errno.into(), path))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| Error::io(err, path))?;
    if let Some(seconds) = mtime {
        let stamp = TimeVal::new(seconds, 0);
        utimes(path, &stamp, &stamp).map_err(|errno| Error::io(errno.into(), path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recrm_tolerates_missing_and_removes_trees() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/file"), b"x").unwrap();

        recrm(&root).unwrap();
        assert!(!root.exists());
        recrm(&root).unwrap();
    }

    #[test]
    fn rename_to_temp_moves_aside() {
        let dir = tempfile::tempdir().unwrap();
        let orig = dir.path().join("victim");
        fs::write(&orig, b"contents").unwrap();

        let temp = rename_to_temp(&orig).unwrap();
        assert!(!orig.exists());
        assert_eq!(fs::read(&temp).unwrap(), b"contents");
        assert!(temp
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".victim.save."));
    }

    #[test]
    fn stage_copy_links_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"payload").unwrap();
        let dest_dir = dir.path().join("dest");
        fs::create_dir(&dest_dir).unwrap();

        let temp = stage_copy(&src, &dest_dir, OsStr::new("hello")).unwrap();
        assert_eq!(fs::read(&temp).unwrap(), b"payload");
        assert!(temp
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".hello.mpkg."));
    }
}
