//! The in-memory package description and its text serialization.
//!
//! One entry per line:
//!
//! ```text
//! PKGNAME MTIME /
//! d PATH OWNER GROUP MODE4
//! f PATH HEX16 OWNER GROUP MODE4
//! s PATH TARGET OWNER GROUP
//! ```
//!
//! Paths are opaque byte sequences without NUL or whitespace; they must be
//! absolute and canonical and are unique across the entry set.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::md5::HASH_LEN;
use crate::path::{cmp_lexical, cmp_pre_order, is_canonical_absolute};
use crate::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DescrEntry {
    File {
        path: PathBuf,
        owner: String,
        group: String,
        mode: u32,
        md5: [u8; HASH_LEN],
    },
    Directory {
        path: PathBuf,
        owner: String,
        group: String,
        mode: u32,
    },
    Symlink {
        path: PathBuf,
        owner: String,
        group: String,
        target: PathBuf,
    },
}

impl DescrEntry {
    pub fn path(&self) -> &Path {
        match self {
            DescrEntry::File { path, .. }
            | DescrEntry::Directory { path, .. }
            | DescrEntry::Symlink { path, .. } => path,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            DescrEntry::File { owner, .. }
            | DescrEntry::Directory { owner, .. }
            | DescrEntry::Symlink { owner, .. } => owner,
        }
    }

    pub fn group(&self) -> &str {
        match self {
            DescrEntry::File { group, .. }
            | DescrEntry::Directory { group, .. }
            | DescrEntry::Symlink { group, .. } => group,
        }
    }
}

/// A package's manifest: header plus entry set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageDescr {
    name: String,
    mtime: i64,
    entries: Vec<DescrEntry>,
    paths: BTreeSet<PathBuf>,
}

fn has_forbidden_bytes(bytes: &[u8]) -> bool {
    bytes.iter().any(|b| b.is_ascii_whitespace() || *b == 0)
}

fn check_name_field(field: &'static str, value: &str) -> Result<(), Error> {
    if value.is_empty() || has_forbidden_bytes(value.as_bytes()) {
        return Err(Error::BadEntryField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

impl PackageDescr {
    pub fn new(name: impl Into<String>, mtime: i64) -> Result<PackageDescr, Error> {
        let name = name.into();
        if name.is_empty() || name.contains('/') || has_forbidden_bytes(name.as_bytes()) {
            return Err(Error::BadPackageName { name });
        }
        Ok(PackageDescr {
            name,
            mtime,
            entries: Vec::new(),
            paths: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn entries(&self) -> &[DescrEntry] {
        &self.entries
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &DescrEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e, DescrEntry::Directory { .. }))
    }

    pub fn files(&self) -> impl Iterator<Item = &DescrEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e, DescrEntry::File { .. }))
    }

    pub fn symlinks(&self) -> impl Iterator<Item = &DescrEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e, DescrEntry::Symlink { .. }))
    }

    pub fn add_entry(&mut self, entry: DescrEntry) -> Result<(), Error> {
        let path = entry.path();
        if !is_canonical_absolute(path) || has_forbidden_bytes(path.as_os_str().as_bytes()) {
            return Err(Error::BadEntryPath {
                path: path.to_path_buf(),
            });
        }
        // Only a directory entry may name the root.
        if path == Path::new("/") && !matches!(entry, DescrEntry::Directory { .. }) {
            return Err(Error::BadEntryPath {
                path: path.to_path_buf(),
            });
        }
        if self.paths.contains(path) {
            return Err(Error::DuplicateEntry {
                path: path.to_path_buf(),
            });
        }

        check_name_field("owner", entry.owner())?;
        check_name_field("group", entry.group())?;
        match &entry {
            DescrEntry::File { mode, .. } | DescrEntry::Directory { mode, .. } => {
                if *mode > 0o7777 {
                    return Err(Error::BadEntryField {
                        field: "mode",
                        value: format!("{:o}", mode),
                    });
                }
            }
            DescrEntry::Symlink { target, .. } => {
                let bytes = target.as_os_str().as_bytes();
                if bytes.is_empty() || has_forbidden_bytes(bytes) {
                    return Err(Error::BadEntryField {
                        field: "target",
                        value: target.to_string_lossy().into_owned(),
                    });
                }
            }
        }

        self.paths.insert(path.to_path_buf());
        self.entries.push(entry);
        Ok(())
    }

    /// Serialize, grouped directories first (componentwise pre-order, so
    /// parents precede children), then files, then symlinks, the latter
    /// two in lexicographic path order.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        writeln!(w, "{} {} /", self.name, self.mtime)?;

        let mut group: Vec<&DescrEntry> = self.dirs().collect();
        group.sort_by(|a, b| cmp_pre_order(a.path(), b.path()));
        for entry in group {
            if let DescrEntry::Directory {
                path,
                owner,
                group,
                mode,
            } = entry
            {
                w.write_all(b"d ")?;
                w.write_all(path.as_os_str().as_bytes())?;
                writeln!(w, " {} {} {:04o}", owner, group, mode)?;
            }
        }

        let mut group: Vec<&DescrEntry> = self.files().collect();
        group.sort_by(|a, b| cmp_lexical(a.path(), b.path()));
        for entry in group {
            if let DescrEntry::File {
                path,
                owner,
                group,
                mode,
                md5,
            } = entry
            {
                w.write_all(b"f ")?;
                w.write_all(path.as_os_str().as_bytes())?;
                writeln!(w, " {} {} {} {:04o}", hex::encode(md5), owner, group, mode)?;
            }
        }

        let mut group: Vec<&DescrEntry> = self.symlinks().collect();
        group.sort_by(|a, b| cmp_lexical(a.path(), b.path()));
        for entry in group {
            if let DescrEntry::Symlink {
                path,
                owner,
                group,
                target,
            } = entry
            {
                w.write_all(b"s ")?;
                w.write_all(path.as_os_str().as_bytes())?;
                w.write_all(b" ")?;
                w.write_all(target.as_os_str().as_bytes())?;
                writeln!(w, " {} {}", owner, group)?;
            }
        }

        Ok(())
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }

    /// Load a description, aborting on the first malformed line. Any amount
    /// of inter-field whitespace is accepted.
    pub fn parse<R: Read>(mut src: R) -> Result<PackageDescr, Error> {
        let mut data = Vec::new();
        src.read_to_end(&mut data)?;

        let mut descr: Option<PackageDescr> = None;
        for (idx, line) in data.split(|b| *b == b'\n').enumerate() {
            let line_no = idx + 1;
            let fields: Vec<&[u8]> = line
                .split(|b| b.is_ascii_whitespace())
                .filter(|f| !f.is_empty())
                .collect();
            if fields.is_empty() {
                continue;
            }

            let descr = match descr {
                None => {
                    // Header line
                    if fields.len() != 3 || fields[2] != b"/".as_slice() {
                        return Err(Error::malformed(line_no, "expected `NAME MTIME /` header"));
                    }
                    let name = utf8_field(fields[0], line_no, "package name")?;
                    let mtime: i64 = utf8_field(fields[1], line_no, "mtime")?
                        .parse()
                        .map_err(|_| Error::malformed(line_no, "mtime is not a decimal count"))?;
                    descr = Some(
                        PackageDescr::new(name, mtime)
                            .map_err(|err| Error::malformed(line_no, err.to_string()))?,
                    );
                    continue;
                }
                Some(ref mut descr) => descr,
            };

            let entry = match fields[0] {
                [b'f'] => {
                    if fields.len() != 6 {
                        return Err(Error::malformed(line_no, "file entry needs 5 fields"));
                    }
                    let mut md5 = [0u8; HASH_LEN];
                    hex::decode_to_slice(fields[2], &mut md5)
                        .map_err(|_| Error::malformed(line_no, "bad MD5 field"))?;
                    DescrEntry::File {
                        path: path_field(fields[1]),
                        md5,
                        owner: utf8_field(fields[3], line_no, "owner")?.to_string(),
                        group: utf8_field(fields[4], line_no, "group")?.to_string(),
                        mode: mode_field(fields[5], line_no)?,
                    }
                }
                [b'd'] => {
                    if fields.len() != 5 {
                        return Err(Error::malformed(line_no, "directory entry needs 4 fields"));
                    }
                    DescrEntry::Directory {
                        path: path_field(fields[1]),
                        owner: utf8_field(fields[2], line_no, "owner")?.to_string(),
                        group: utf8_field(fields[3], line_no, "group")?.to_string(),
                        mode: mode_field(fields[4], line_no)?,
                    }
                }
                [b's'] => {
                    if fields.len() != 5 {
                        return Err(Error::malformed(line_no, "symlink entry needs 4 fields"));
                    }
                    DescrEntry::Symlink {
                        path: path_field(fields[1]),
                        target: path_field(fields[2]),
                        owner: utf8_field(fields[3], line_no, "owner")?.to_string(),
                        group: utf8_field(fields[4], line_no, "group")?.to_string(),
                    }
                }
                other => {
                    return Err(Error::malformed(
                        line_no,
                        format!("unknown entry type {:?}", String::from_utf8_lossy(other)),
                    ));
                }
            };

            descr
                .add_entry(entry)
                .map_err(|err| Error::malformed(line_no, err.to_string()))?;
        }

        descr.ok_or_else(|| Error::malformed(1, "empty description"))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<PackageDescr, Error> {
        PackageDescr::parse(File::open(path)?)
    }
}

fn path_field(field: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(field))
}

fn utf8_field<'a>(field: &'a [u8], line_no: usize, what: &str) -> Result<&'a str, Error> {
    std::str::from_utf8(field)
        .map_err(|_| Error::malformed(line_no, format!("{} is not valid UTF-8", what)))
}

fn mode_field(field: &[u8], line_no: usize) -> Result<u32, Error> {
    let text = utf8_field(field, line_no, "mode")?;
    u32::from_str_radix(text, 8).map_err(|_| Error::malformed(line_no, "mode is not octal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PackageDescr {
        let mut descr = PackageDescr::new("hello", 1_700_000_000).unwrap();
        descr
            .add_entry(DescrEntry::File {
                path: PathBuf::from("/usr/bin/hello"),
                owner: "root".into(),
                group: "root".into(),
                mode: 0o755,
                md5: [0x9f; HASH_LEN],
            })
            .unwrap();
        descr
            .add_entry(DescrEntry::Directory {
                path: PathBuf::from("/usr/bin"),
                owner: "root".into(),
                group: "wheel".into(),
                mode: 0o755,
            })
            .unwrap();
        descr
            .add_entry(DescrEntry::Directory {
                path: PathBuf::from("/usr"),
                owner: "root".into(),
                group: "root".into(),
                mode: 0o755,
            })
            .unwrap();
        descr
            .add_entry(DescrEntry::Symlink {
                path: PathBuf::from("/usr/bin/hi"),
                owner: "root".into(),
                group: "root".into(),
                target: PathBuf::from("hello"),
            })
            .unwrap();
        descr
    }

    fn serialize(descr: &PackageDescr) -> Vec<u8> {
        let mut out = Vec::new();
        descr.write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn roundtrip_is_stable() {
        let descr = sample();
        let first = serialize(&descr);

        let parsed = PackageDescr::parse(&first[..]).unwrap();
        assert_eq!(parsed.name(), "hello");
        assert_eq!(parsed.mtime(), 1_700_000_000);
        assert_eq!(parsed.entries().len(), 4);
        assert!(parsed.contains_path(Path::new("/usr/bin/hello")));

        // Parsing then serializing reproduces the bytes.
        assert_eq!(serialize(&parsed), first);
    }

    #[test]
    fn groups_are_ordered() {
        let text = String::from_utf8(serialize(&sample())).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "hello 1700000000 /");
        assert_eq!(lines[1], "d /usr root root 0755");
        assert_eq!(lines[2], "d /usr/bin root wheel 0755");
        assert!(lines[3].starts_with("f /usr/bin/hello 9f9f"));
        assert_eq!(lines[4], "s /usr/bin/hi hello root root");
    }

    #[test]
    fn file_group_is_lexicographic() {
        let mut descr = PackageDescr::new("x", 1).unwrap();
        for path in ["/usr/bin/hello", "/usr-local"] {
            descr
                .add_entry(DescrEntry::File {
                    path: PathBuf::from(path),
                    owner: "root".into(),
                    group: "root".into(),
                    mode: 0o644,
                    md5: [0; HASH_LEN],
                })
                .unwrap();
        }
        let text = String::from_utf8(serialize(&descr)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // Bytewise, not componentwise: "/usr-local" comes first.
        assert!(lines[1].starts_with("f /usr-local "));
        assert!(lines[2].starts_with("f /usr/bin/hello "));
    }

    #[test]
    fn extra_whitespace_is_tolerated() {
        let text = b"hello  1700000000   /\n\n  d   /usr  root root  0755  \n";
        let descr = PackageDescr::parse(&text[..]).unwrap();
        assert_eq!(descr.entries().len(), 1);
    }

    #[test]
    fn malformed_lines_abort() {
        let cases: &[&[u8]] = &[
            b"hello notanumber /\n",
            b"hello 1 /\nq /usr root root 0755\n",
            b"hello 1 /\nd usr root root 0755\n",
            b"hello 1 /\nd /usr root root\n",
            b"hello 1 /\nf /x zz root root 0644\n",
            b"hello 1 /\nd /usr root root 0755\nd /usr root root 0755\n",
        ];
        for case in cases {
            assert!(
                matches!(
                    PackageDescr::parse(&case[..]),
                    Err(Error::MalformedDescr { .. })
                ),
                "accepted: {}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn root_directory_entry_is_allowed() {
        let mut descr = PackageDescr::new("base", 1).unwrap();
        descr
            .add_entry(DescrEntry::Directory {
                path: PathBuf::from("/"),
                owner: "root".into(),
                group: "root".into(),
                mode: 0o755,
            })
            .unwrap();
        assert!(matches!(
            descr.add_entry(DescrEntry::File {
                path: PathBuf::from("/"),
                owner: "root".into(),
                group: "root".into(),
                mode: 0o644,
                md5: [0; HASH_LEN],
            }),
            Err(Error::BadEntryPath { .. })
        ));
    }

    #[test]
    fn non_canonical_paths_are_rejected() {
        let mut descr = PackageDescr::new("x", 1).unwrap();
        for bad in ["relative/path", "/a/../b", "/a//b", "/a/b/"] {
            assert!(
                descr
                    .add_entry(DescrEntry::Directory {
                        path: PathBuf::from(bad),
                        owner: "root".into(),
                        group: "root".into(),
                        mode: 0o755,
                    })
                    .is_err(),
                "accepted {:?}",
                bad
            );
        }
    }
}
