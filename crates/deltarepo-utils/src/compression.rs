//! Compression detection and codecs for metadata files.
//!
//! Repository metadata is usually shipped gzip or xz compressed; zstd shows up in newer
//! repositories. bzip2 is recognized so it can be reported, but not decoded.

use std::{
    fmt,
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
    str::FromStr,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use xz2::{read::XzDecoder, write::XzEncoder};

use crate::error::{CompressionError, CompressionResult};

const GZ_MAGIC_BYTES: [u8; 2] = [0x1f, 0x8b];
const BZ2_MAGIC_BYTES: [u8; 3] = [0x42, 0x5a, 0x68];
const XZ_MAGIC_BYTES: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZSTD_MAGIC_BYTES: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Suffixes of files that are already compressed and must not be compressed again.
pub const COMPRESSED_SUFFIXES: &[&str] = &[
    ".bz2", ".gz", ".lz", ".lzma", ".lzo", ".xz", ".7z", ".s7z", ".apk", ".rar", ".sfx", ".tgz",
    ".tbz2", ".tlz", ".zip", ".zipx", ".zz", ".zst",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None,
    Gz,
    Bz2,
    #[default]
    Xz,
    Zstd,
}

impl CompressionType {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gz => "gz",
            CompressionType::Bz2 => "bz2",
            CompressionType::Xz => "xz",
            CompressionType::Zstd => "zstd",
        }
    }

    /// File suffix including the leading dot, empty for [`CompressionType::None`].
    pub fn suffix(&self) -> &'static str {
        match self {
            CompressionType::None => "",
            CompressionType::Gz => ".gz",
            CompressionType::Bz2 => ".bz2",
            CompressionType::Xz => ".xz",
            CompressionType::Zstd => ".zst",
        }
    }

    /// Detects the compression from a file name suffix.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let name = path.as_ref().to_string_lossy();
        if name.ends_with(".gz") || name.ends_with(".tgz") {
            CompressionType::Gz
        } else if name.ends_with(".bz2") {
            CompressionType::Bz2
        } else if name.ends_with(".xz") {
            CompressionType::Xz
        } else if name.ends_with(".zst") || name.ends_with(".zstd") {
            CompressionType::Zstd
        } else {
            CompressionType::None
        }
    }

    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&GZ_MAGIC_BYTES) {
            CompressionType::Gz
        } else if data.starts_with(&XZ_MAGIC_BYTES) {
            CompressionType::Xz
        } else if data.starts_with(&ZSTD_MAGIC_BYTES) {
            CompressionType::Zstd
        } else if data.starts_with(&BZ2_MAGIC_BYTES) {
            CompressionType::Bz2
        } else {
            CompressionType::None
        }
    }

    /// Sniffs the first bytes of a file.
    pub fn detect_file<P: AsRef<Path>>(path: P) -> CompressionResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|err| codec_error(path, "open", err))?;
        let mut magic = [0u8; 6];
        let mut read = 0;
        while read < magic.len() {
            let n = file
                .read(&mut magic[read..])
                .map_err(|err| codec_error(path, "read", err))?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(Self::from_magic_bytes(&magic[..read]))
    }
}

impl FromStr for CompressionType {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(CompressionType::None),
            "gz" | "gzip" => Ok(CompressionType::Gz),
            "bz2" | "bzip2" => Ok(CompressionType::Bz2),
            "xz" => Ok(CompressionType::Xz),
            "zst" | "zstd" => Ok(CompressionType::Zstd),
            _ => {
                Err(CompressionError::UnknownType {
                    name: s.to_string(),
                })
            }
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn codec_error(path: &Path, action: &'static str, source: io::Error) -> CompressionError {
    CompressionError::Codec {
        path: path.to_path_buf(),
        action,
        source,
    }
}

/// Returns true if the file name carries a suffix of an already compressed format.
pub fn is_compressed_name(name: &str) -> bool {
    COMPRESSED_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// Wraps a reader with the decoder for `compression`.
pub fn create_decoder<'a, R: Read + 'a>(
    reader: R,
    compression: CompressionType,
) -> io::Result<Box<dyn Read + 'a>> {
    match compression {
        CompressionType::None => Ok(Box::new(reader)),
        CompressionType::Gz => Ok(Box::new(GzDecoder::new(reader))),
        CompressionType::Xz => Ok(Box::new(XzDecoder::new(reader))),
        CompressionType::Zstd => Ok(Box::new(zstd::Decoder::new(reader)?)),
        CompressionType::Bz2 => {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "bzip2 decoding is not supported",
            ))
        }
    }
}

/// Opens a file for reading its decompressed content, detecting the format by magic bytes.
///
/// # Errors
///
/// * [`CompressionError::Unsupported`] for bzip2 input.
/// * [`CompressionError::Codec`] if the file cannot be opened.
pub fn open_reader<P: AsRef<Path>>(path: P) -> CompressionResult<Box<dyn Read>> {
    let path = path.as_ref();
    let compression = CompressionType::detect_file(path)?;
    if compression == CompressionType::Bz2 {
        return Err(CompressionError::Unsupported {
            name: compression.name(),
        });
    }
    let file = File::open(path).map_err(|err| codec_error(path, "open", err))?;
    create_decoder(BufReader::new(file), compression)
        .map_err(|err| codec_error(path, "decompress", err))
}

/// A compressing writer that must be [`finish`](Encoder::finish)ed to flush trailers.
pub enum Encoder<W: Write> {
    Plain(W),
    Gz(GzEncoder<W>),
    Xz(XzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(writer: W, compression: CompressionType) -> CompressionResult<Self> {
        Ok(match compression {
            CompressionType::None => Encoder::Plain(writer),
            CompressionType::Gz => Encoder::Gz(GzEncoder::new(writer, Compression::default())),
            CompressionType::Xz => Encoder::Xz(XzEncoder::new(writer, 6)),
            CompressionType::Zstd => {
                Encoder::Zstd(zstd::Encoder::new(writer, 0).map_err(|err| {
                    CompressionError::Codec {
                        path: Default::default(),
                        action: "create zstd encoder for",
                        source: err,
                    }
                })?)
            }
            CompressionType::Bz2 => {
                return Err(CompressionError::Unsupported {
                    name: compression.name(),
                })
            }
        })
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Encoder::Gz(e) => e.finish(),
            Encoder::Xz(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Gz(e) => e.write(buf),
            Encoder::Xz(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gz(e) => e.flush(),
            Encoder::Xz(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

/// Creates `path` and returns an encoder writing into it.
pub fn create_writer<P: AsRef<Path>>(
    path: P,
    compression: CompressionType,
) -> CompressionResult<Encoder<BufWriter<File>>> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| codec_error(path, "create", err))?;
    Encoder::new(BufWriter::new(file), compression)
}

/// Compresses `src` into `dst`.
pub fn compress_file<P: AsRef<Path>, Q: AsRef<Path>>(
    src: P,
    dst: Q,
    compression: CompressionType,
) -> CompressionResult<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    let mut input = File::open(src).map_err(|err| codec_error(src, "open", err))?;
    let mut encoder = create_writer(dst, compression)?;
    io::copy(&mut input, &mut encoder).map_err(|err| codec_error(dst, "compress into", err))?;
    encoder
        .finish()
        .and_then(|mut w| w.flush())
        .map_err(|err| codec_error(dst, "finish", err))
}

/// Decompresses `src` into `dst`, detecting the input format.
pub fn decompress_file<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> CompressionResult<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    let mut reader = open_reader(src)?;
    let mut output = File::create(dst).map_err(|err| codec_error(dst, "create", err))?;
    io::copy(&mut reader, &mut output).map_err(|err| codec_error(src, "decompress", err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_from_path() {
        assert_eq!(CompressionType::from_path("primary.xml.gz"), CompressionType::Gz);
        assert_eq!(CompressionType::from_path("primary.xml.xz"), CompressionType::Xz);
        assert_eq!(CompressionType::from_path("primary.xml.zst"), CompressionType::Zstd);
        assert_eq!(CompressionType::from_path("comps.xml.bz2"), CompressionType::Bz2);
        assert_eq!(CompressionType::from_path("comps.xml"), CompressionType::None);
    }

    #[test]
    fn test_from_magic_bytes() {
        assert_eq!(
            CompressionType::from_magic_bytes(&[0x1f, 0x8b, 0x08]),
            CompressionType::Gz
        );
        assert_eq!(
            CompressionType::from_magic_bytes(&XZ_MAGIC_BYTES),
            CompressionType::Xz
        );
        assert_eq!(
            CompressionType::from_magic_bytes(b"BZh91AY"),
            CompressionType::Bz2
        );
        assert_eq!(
            CompressionType::from_magic_bytes(b"<?xml"),
            CompressionType::None
        );
        assert_eq!(CompressionType::from_magic_bytes(&[]), CompressionType::None);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("gzip".parse::<CompressionType>().unwrap(), CompressionType::Gz);
        assert_eq!("XZ".parse::<CompressionType>().unwrap(), CompressionType::Xz);
        assert!(matches!(
            "lzfoo".parse::<CompressionType>(),
            Err(CompressionError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_is_compressed_name() {
        assert!(is_compressed_name("comps.xml.gz"));
        assert!(is_compressed_name("updateinfo.xml.zst"));
        assert!(!is_compressed_name("comps.xml"));
    }

    #[test]
    fn test_compress_and_decompress_every_codec() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain.xml");
        fs::write(&plain, b"<metadata packages=\"0\"/>\n").unwrap();

        for compression in [
            CompressionType::None,
            CompressionType::Gz,
            CompressionType::Xz,
            CompressionType::Zstd,
        ] {
            let packed = dir.path().join(format!("packed.xml{}", compression.suffix()));
            compress_file(&plain, &packed, compression).unwrap();
            assert_eq!(CompressionType::detect_file(&packed).unwrap(), compression);

            let unpacked = dir.path().join("unpacked.xml");
            decompress_file(&packed, &unpacked).unwrap();
            assert_eq!(fs::read(&unpacked).unwrap(), fs::read(&plain).unwrap());
        }
    }

    #[test]
    fn test_gzip_output_is_deterministic() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("comps.xml");
        fs::write(&plain, b"<comps/>").unwrap();

        compress_file(&plain, dir.path().join("a.gz"), CompressionType::Gz).unwrap();
        compress_file(&plain, dir.path().join("b.gz"), CompressionType::Gz).unwrap();
        assert_eq!(
            fs::read(dir.path().join("a.gz")).unwrap(),
            fs::read(dir.path().join("b.gz")).unwrap()
        );
    }

    #[test]
    fn test_bz2_is_unsupported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comps.xml.bz2");
        fs::write(&path, b"BZh91AY&SY").unwrap();
        assert!(matches!(
            open_reader(&path),
            Err(CompressionError::Unsupported { name: "bz2" })
        ));
    }
}
