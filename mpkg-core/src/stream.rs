//! Layered byte streams over files and other streams.
//!
//! Archive I/O is written against [`ReadStream`] and [`WriteStream`] so that
//! a tape archive never needs to know whether it is talking to a bare file or
//! to a compressor wrapped around one. A layer over another stream finalizes
//! only itself; the inner stream is handed back to the caller un-closed. A
//! layer over a file owns the file and closes it.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Compression layers understood by the package pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    /// Pick a layer from a filename suffix (`.gz`, `.bz2`, anything else is
    /// uncompressed).
    pub fn from_name(name: &str) -> Compression {
        if name.ends_with(".gz") {
            Compression::Gzip
        } else if name.ends_with(".bz2") {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    /// Suffix appended to archive member names using this layer.
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Bzip2 => ".bz2",
        }
    }
}

enum ReadKind {
    File(BufReader<File>),
    GzipFile(GzDecoder<BufReader<File>>),
    Bzip2File(BzDecoder<BufReader<File>>),
    GzipStream(GzDecoder<Box<ReadStream>>),
    Bzip2Stream(BzDecoder<Box<ReadStream>>),
}

/// A readable stream with an optional decompression layer.
pub struct ReadStream {
    inner: ReadKind,
}

impl ReadStream {
    pub fn open(path: impl AsRef<Path>) -> io::Result<ReadStream> {
        let file = BufReader::new(File::open(path)?);
        Ok(ReadStream {
            inner: ReadKind::File(file),
        })
    }

    pub fn open_gzip(path: impl AsRef<Path>) -> io::Result<ReadStream> {
        let file = BufReader::new(File::open(path)?);
        Ok(ReadStream {
            inner: ReadKind::GzipFile(GzDecoder::new(file)),
        })
    }

    pub fn open_bzip2(path: impl AsRef<Path>) -> io::Result<ReadStream> {
        let file = BufReader::new(File::open(path)?);
        Ok(ReadStream {
            inner: ReadKind::Bzip2File(BzDecoder::new(file)),
        })
    }

    pub fn open_with(path: impl AsRef<Path>, compression: Compression) -> io::Result<ReadStream> {
        match compression {
            Compression::None => ReadStream::open(path),
            Compression::Gzip => ReadStream::open_gzip(path),
            Compression::Bzip2 => ReadStream::open_bzip2(path),
        }
    }

    pub fn gzip_over(inner: ReadStream) -> ReadStream {
        ReadStream {
            inner: ReadKind::GzipStream(GzDecoder::new(Box::new(inner))),
        }
    }

    pub fn bzip2_over(inner: ReadStream) -> ReadStream {
        ReadStream {
            inner: ReadKind::Bzip2Stream(BzDecoder::new(Box::new(inner))),
        }
    }

    pub fn layer_over(inner: ReadStream, compression: Compression) -> ReadStream {
        match compression {
            Compression::None => inner,
            Compression::Gzip => ReadStream::gzip_over(inner),
            Compression::Bzip2 => ReadStream::bzip2_over(inner),
        }
    }

    /// Tear down this layer. A stream over another stream returns the inner
    /// stream, still open; a stream over a file closes the file and returns
    /// `None`.
    pub fn into_inner(self) -> Option<ReadStream> {
        match self.inner {
            ReadKind::File(_) | ReadKind::GzipFile(_) | ReadKind::Bzip2File(_) => None,
            ReadKind::GzipStream(dec) => Some(*dec.into_inner()),
            ReadKind::Bzip2Stream(dec) => Some(*dec.into_inner()),
        }
    }
}

impl Read for ReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ReadKind::File(r) => r.read(buf),
            ReadKind::GzipFile(r) => r.read(buf),
            ReadKind::Bzip2File(r) => r.read(buf),
            ReadKind::GzipStream(r) => r.read(buf),
            ReadKind::Bzip2Stream(r) => r.read(buf),
        }
    }
}

enum WriteKind {
    File(BufWriter<File>),
    GzipFile(GzEncoder<BufWriter<File>>),
    Bzip2File(BzEncoder<BufWriter<File>>),
    GzipStream(GzEncoder<Box<WriteStream>>),
    Bzip2Stream(BzEncoder<Box<WriteStream>>),
}

/// A writable stream with an optional compression layer.
///
/// Writers must be closed through [`WriteStream::finish`]; compressors hold
/// back trailer bytes that only a finalizing flush emits.
pub struct WriteStream {
    inner: WriteKind,
}

impl WriteStream {
    pub fn create(path: impl AsRef<Path>) -> io::Result<WriteStream> {
        let file = BufWriter::new(File::create(path)?);
        Ok(WriteStream {
            inner: WriteKind::File(file),
        })
    }

    pub fn create_gzip(path: impl AsRef<Path>) -> io::Result<WriteStream> {
        let file = BufWriter::new(File::create(path)?);
        Ok(WriteStream {
            inner: WriteKind::GzipFile(GzEncoder::new(file, flate2::Compression::default())),
        })
    }

    pub fn create_bzip2(path: impl AsRef<Path>) -> io::Result<WriteStream> {
        let file = BufWriter::new(File::create(path)?);
        Ok(WriteStream {
            inner: WriteKind::Bzip2File(BzEncoder::new(file, bzip2::Compression::default())),
        })
    }

    pub fn create_with(path: impl AsRef<Path>, compression: Compression) -> io::Result<WriteStream> {
        match compression {
            Compression::None => WriteStream::create(path),
            Compression::Gzip => WriteStream::create_gzip(path),
            Compression::Bzip2 => WriteStream::create_bzip2(path),
        }
    }

    pub fn gzip_over(inner: WriteStream) -> WriteStream {
        WriteStream {
            inner: WriteKind::GzipStream(GzEncoder::new(
                Box::new(inner),
                flate2::Compression::default(),
            )),
        }
    }

    pub fn bzip2_over(inner: WriteStream) -> WriteStream {
        WriteStream {
            inner: WriteKind::Bzip2Stream(BzEncoder::new(
                Box::new(inner),
                bzip2::Compression::default(),
            )),
        }
    }

    pub fn layer_over(inner: WriteStream, compression: Compression) -> WriteStream {
        match compression {
            Compression::None => inner,
            Compression::Gzip => WriteStream::gzip_over(inner),
            Compression::Bzip2 => WriteStream::bzip2_over(inner),
        }
    }

    /// Flush and finalize this layer, innermost data first. A stream over
    /// another stream returns the inner stream, still open; a stream over a
    /// file flushes and closes it, returning `None`.
    pub fn finish(self) -> io::Result<Option<WriteStream>> {
        match self.inner {
            WriteKind::File(mut w) => {
                w.flush()?;
                Ok(None)
            }
            WriteKind::GzipFile(enc) => {
                let mut file = enc.finish()?;
                file.flush()?;
                Ok(None)
            }
            WriteKind::Bzip2File(enc) => {
                let mut file = enc.finish()?;
                file.flush()?;
                Ok(None)
            }
            WriteKind::GzipStream(enc) => Ok(Some(*enc.finish()?)),
            WriteKind::Bzip2Stream(enc) => Ok(Some(*enc.finish()?)),
        }
    }
}

impl Write for WriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            WriteKind::File(w) => w.write(buf),
            WriteKind::GzipFile(w) => w.write(buf),
            WriteKind::Bzip2File(w) => w.write(buf),
            WriteKind::GzipStream(w) => w.write(buf),
            WriteKind::Bzip2Stream(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            WriteKind::File(w) => w.flush(),
            WriteKind::GzipFile(w) => w.flush(),
            WriteKind::Bzip2File(w) => w.flush(),
            WriteKind::GzipStream(w) => w.flush(),
            WriteKind::Bzip2Stream(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn roundtrip_file(compression: Compression) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut ws = WriteStream::create_with(&path, compression).unwrap();
        ws.write_all(&payload).unwrap();
        assert!(ws.finish().unwrap().is_none());

        let mut rs = ReadStream::open_with(&path, compression).unwrap();
        let mut back = Vec::new();
        rs.read_to_end(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn plain_roundtrip() {
        roundtrip_file(Compression::None);
    }

    #[test]
    fn gzip_roundtrip() {
        roundtrip_file(Compression::Gzip);
    }

    #[test]
    fn bzip2_roundtrip() {
        roundtrip_file(Compression::Bzip2);
    }

    #[test]
    fn layer_over_stream_leaves_inner_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.gz");

        let file_ws = WriteStream::create(&path).unwrap();
        let mut gz = WriteStream::gzip_over(file_ws);
        gz.write_all(b"layered payload").unwrap();
        let inner = gz.finish().unwrap().expect("inner stream comes back");
        assert!(inner.finish().unwrap().is_none());

        let file_rs = ReadStream::open(&path).unwrap();
        let mut gz = ReadStream::gzip_over(file_rs);
        let mut back = Vec::new();
        gz.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"layered payload");
        assert!(gz.into_inner().is_some());
    }

    #[test]
    fn suffix_guessing() {
        assert_eq!(Compression::from_name("pkg.tar.gz"), Compression::Gzip);
        assert_eq!(Compression::from_name("pkg.tar.bz2"), Compression::Bzip2);
        assert_eq!(Compression::from_name("pkg.tar"), Compression::None);
    }
}
