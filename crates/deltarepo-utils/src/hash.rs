use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    path::Path,
    str::FromStr,
};

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{HashError, HashResult};

/// Checksum algorithms understood by repository metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumType {
    pub const ALL: [ChecksumType; 6] = [
        ChecksumType::Md5,
        ChecksumType::Sha1,
        ChecksumType::Sha224,
        ChecksumType::Sha256,
        ChecksumType::Sha384,
        ChecksumType::Sha512,
    ];

    /// Name as written in `type` attributes of repomd and primary.
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha224 => "sha224",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::Sha384 => "sha384",
            ChecksumType::Sha512 => "sha512",
        }
    }

    /// Length of the hex digest.
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumType::Md5 => 32,
            ChecksumType::Sha1 => 40,
            ChecksumType::Sha224 => 56,
            ChecksumType::Sha256 => 64,
            ChecksumType::Sha384 => 96,
            ChecksumType::Sha512 => 128,
        }
    }
}

impl FromStr for ChecksumType {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumType::Md5),
            "sha" | "sha1" => Ok(ChecksumType::Sha1),
            "sha224" => Ok(ChecksumType::Sha224),
            "sha256" => Ok(ChecksumType::Sha256),
            "sha384" => Ok(ChecksumType::Sha384),
            "sha512" => Ok(ChecksumType::Sha512),
            _ => {
                Err(HashError::UnknownType {
                    name: s.to_string(),
                })
            }
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental hasher over any [`ChecksumType`].
///
/// Implements [`Write`] so it can be the sink of [`std::io::copy`].
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(checksum_type: ChecksumType) -> Self {
        match checksum_type {
            ChecksumType::Md5 => Hasher::Md5(Md5::new()),
            ChecksumType::Sha1 => Hasher::Sha1(Sha1::new()),
            ChecksumType::Sha224 => Hasher::Sha224(Sha224::new()),
            ChecksumType::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumType::Sha384 => Hasher::Sha384(Sha384::new()),
            ChecksumType::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha224(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha384(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hashes an in-memory buffer and returns the hex digest.
pub fn checksum_bytes(data: &[u8], checksum_type: ChecksumType) -> String {
    let mut hasher = Hasher::new(checksum_type);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Hashes everything readable from `reader`.
///
/// Returns the hex digest together with the number of bytes consumed, which
/// is what repomd needs for `open-checksum` and `open-size`.
pub fn checksum_reader<R: Read>(
    mut reader: R,
    checksum_type: ChecksumType,
) -> io::Result<(String, u64)> {
    let mut hasher = Hasher::new(checksum_type);
    let size = io::copy(&mut reader, &mut hasher)?;
    Ok((hasher.finalize_hex(), size))
}

/// Calculates the checksum of a file.
///
/// The file is streamed through the selected algorithm and the digest is returned as a
/// lowercase hex string.
///
/// # Arguments
///
/// * `file_path` - The path to the file to calculate the checksum for.
/// * `checksum_type` - The algorithm to use.
///
/// # Errors
///
/// * [`HashError::ReadFailed`] if the file cannot be read.
///
/// # Example
///
/// ```no_run
/// use deltarepo_utils::error::HashResult;
/// use deltarepo_utils::hash::{calculate_checksum, ChecksumType};
///
/// fn main() -> HashResult<()> {
///     let checksum = calculate_checksum("repodata/repomd.xml", ChecksumType::Sha256)?;
///     println!("Checksum is {}", checksum);
///     Ok(())
/// }
/// ```
pub fn calculate_checksum<P: AsRef<Path>>(
    file_path: P,
    checksum_type: ChecksumType,
) -> HashResult<String> {
    let file_path = file_path.as_ref();
    let read_failed = |err| {
        HashError::ReadFailed {
            path: file_path.to_path_buf(),
            source: err,
        }
    };
    let file = File::open(file_path).map_err(read_failed)?;
    let (digest, _) = checksum_reader(file, checksum_type).map_err(read_failed)?;
    Ok(digest)
}

/// Verifies the checksum of a file against an expected value.
///
/// The comparison is case-insensitive.
///
/// # Errors
///
/// * [`HashError::ReadFailed`] if the file cannot be read.
pub fn verify_checksum<P: AsRef<Path>>(
    file_path: P,
    checksum_type: ChecksumType,
    expected: &str,
) -> HashResult<bool> {
    let actual = calculate_checksum(file_path, checksum_type)?;
    Ok(actual.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const HELLO_SHA256: &str = "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";

    #[test]
    fn test_checksum_type_from_str() {
        assert_eq!("sha256".parse::<ChecksumType>().unwrap(), ChecksumType::Sha256);
        assert_eq!("SHA512".parse::<ChecksumType>().unwrap(), ChecksumType::Sha512);
        assert_eq!("sha".parse::<ChecksumType>().unwrap(), ChecksumType::Sha1);
        assert!(matches!(
            "crc32".parse::<ChecksumType>(),
            Err(HashError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_checksum_type_names_round_trip() {
        for checksum_type in ChecksumType::ALL {
            assert_eq!(
                checksum_type.name().parse::<ChecksumType>().unwrap(),
                checksum_type
            );
            assert_eq!(
                checksum_bytes(b"", checksum_type).len(),
                checksum_type.hex_len()
            );
        }
    }

    #[test]
    fn test_checksum_bytes_known_values() {
        assert_eq!(
            checksum_bytes(b"", ChecksumType::Sha256),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            checksum_bytes(b"hello world\n", ChecksumType::Md5),
            "6f5902ac237024bdd0c176cb93063dc4"
        );
        assert_eq!(
            checksum_bytes(b"hello world\n", ChecksumType::Sha256),
            HELLO_SHA256
        );
    }

    #[test]
    fn test_incremental_update_matches_one_shot() {
        let mut hasher = Hasher::new(ChecksumType::Sha256);
        hasher.update(b"hello ");
        hasher.update(b"world\n");
        assert_eq!(hasher.finalize_hex(), HELLO_SHA256);
    }

    #[test]
    fn test_checksum_reader_counts_bytes() {
        let (digest, size) = checksum_reader(&b"hello world\n"[..], ChecksumType::Sha256).unwrap();
        assert_eq!(digest, HELLO_SHA256);
        assert_eq!(size, 12);
    }

    #[test]
    fn test_calculate_checksum() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world\n").unwrap();

        let checksum = calculate_checksum(file.path(), ChecksumType::Sha256).unwrap();
        assert_eq!(checksum, HELLO_SHA256);
    }

    #[test]
    fn test_verify_checksum() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world\n").unwrap();

        assert!(verify_checksum(
            file.path(),
            ChecksumType::Sha256,
            &HELLO_SHA256.to_uppercase()
        )
        .unwrap());
        assert!(!verify_checksum(file.path(), ChecksumType::Sha256, "invalid").unwrap());
    }

    #[test]
    fn test_calculate_checksum_file_not_found() {
        let result = calculate_checksum("/path/to/nonexistent/file", ChecksumType::Sha256);
        assert!(matches!(result, Err(HashError::ReadFailed { .. })));
    }

    #[test]
    fn test_calculate_checksum_on_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = calculate_checksum(dir.path(), ChecksumType::Sha256);
        assert!(result.is_err());
    }
}
