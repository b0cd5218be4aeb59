//! MD5 content digests exposed as a write sink.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use md5::{Digest, Md5};

use crate::READ_WRITE_BUF_SIZE;

pub const HASH_LEN: usize = 16;

/// A write sink that accumulates an MD5 digest of everything passing
/// through it on the way to `inner`.
pub struct Md5Writer<W> {
    inner: W,
    hasher: Md5,
}

impl<W: Write> Md5Writer<W> {
    pub fn new(inner: W) -> Md5Writer<W> {
        Md5Writer {
            inner,
            hasher: Md5::new(),
        }
    }

    /// Finalize the digest, returning the inner writer and the 16-byte sum.
    pub fn finish(self) -> (W, [u8; HASH_LEN]) {
        (self.inner, self.hasher.finalize().into())
    }
}

impl Md5Writer<io::Sink> {
    /// A sink that discards the data and keeps only the digest.
    pub fn sink() -> Md5Writer<io::Sink> {
        Md5Writer::new(io::sink())
    }
}

impl<W: Write> Write for Md5Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream a file through the MD5 sink and return its digest.
pub fn file_md5(path: impl AsRef<Path>) -> io::Result<[u8; HASH_LEN]> {
    let mut file = File::open(path)?;
    let mut sink = Md5Writer::sink();
    let mut buf = vec![0; READ_WRITE_BUF_SIZE];
    loop {
        let count = file.read(&mut buf)?;
        if count == 0 {
            break;
        }
        sink.write_all(&buf[..count])?;
    }
    let (_, digest) = sink.finish();
    Ok(digest)
}

/// True when the file at `path` hashes to `expected`.
pub fn file_matches_md5(path: impl AsRef<Path>, expected: &[u8; HASH_LEN]) -> io::Result<bool> {
    Ok(file_md5(path)? == *expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md5_of(data: &[u8]) -> String {
        let mut sink = Md5Writer::sink();
        sink.write_all(data).unwrap();
        let (_, digest) = sink.finish();
        hex::encode(digest)
    }

    #[test]
    fn rfc1321_vectors() {
        assert_eq!(md5_of(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_of(b"a"), "0cc175b9c0f1b6a831c399e269772661");
        assert_eq!(md5_of(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            md5_of(b"message digest"),
            "f96b697d7cb7938d525a2f31aaf161d0"
        );
    }

    #[test]
    fn file_digest_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"abc").unwrap();

        let digest = file_md5(&path).unwrap();
        assert_eq!(hex::encode(digest), "900150983cd24fb0d6963f7d28e17f72");
        assert!(file_matches_md5(&path, &digest).unwrap());
        assert!(!file_matches_md5(&path, &[0; HASH_LEN]).unwrap());
    }
}
