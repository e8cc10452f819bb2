//! Content hashing.
//!
//! This module provides:
//! - The content-hash algorithms a manifest can be bound to
//! - `ContentHasher`, a streaming hasher the copy path feeds as it writes
//! - Whole-file hashing for the verifier
//! - Checksum listing generation for reports
//!
//! A manifest is bound to exactly one algorithm for its whole lifetime; values
//! produced by different algorithms never compare equal.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Read buffer shared by hashing and copying.
pub(crate) const BUFFER_SIZE: usize = 64 * 1024;

/// Content-hash algorithm of a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// IEEE CRC-32; fast, catches corruption but not tampering
    Crc32,
    Md5,
    Sha256,
    #[default]
    Blake3,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 4] = [
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Md5,
        ChecksumAlgorithm::Sha256,
        ChecksumAlgorithm::Blake3,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }

    /// Length of the hex digest.
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Crc32 => 8,
            ChecksumAlgorithm::Md5 => 32,
            ChecksumAlgorithm::Sha256 | ChecksumAlgorithm::Blake3 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ChecksumAlgorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.name() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown hash algorithm '{}'; expected crc32, md5, sha256 or blake3",
                    s
                )
            })
    }
}

/// A digest tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// `algo:hex`, unambiguous across algorithms.
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

const CRC32_POLY: u32 = 0xedb8_8320;

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ CRC32_POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

/// Streaming hasher over one algorithm.
pub enum ContentHasher {
    Crc32(u32),
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => ContentHasher::Crc32(0xffff_ffff),
            ChecksumAlgorithm::Md5 => ContentHasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => ContentHasher::Sha256(sha2::Sha256::default()),
            ChecksumAlgorithm::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            ContentHasher::Crc32(_) => ChecksumAlgorithm::Crc32,
            ContentHasher::Md5(_) => ChecksumAlgorithm::Md5,
            ContentHasher::Sha256(_) => ChecksumAlgorithm::Sha256,
            ContentHasher::Blake3(_) => ChecksumAlgorithm::Blake3,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Crc32(crc) => {
                for &byte in data {
                    let index = ((*crc ^ u32::from(byte)) & 0xff) as usize;
                    *crc = (*crc >> 8) ^ CRC32_TABLE[index];
                }
            }
            ContentHasher::Md5(context) => context.consume(data),
            ContentHasher::Sha256(hasher) => sha2::Digest::update(hasher, data),
            ContentHasher::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    pub fn finalize(self) -> ChecksumValue {
        let algorithm = self.algorithm();
        let hex = match self {
            ContentHasher::Crc32(crc) => format!("{:08x}", crc ^ 0xffff_ffff),
            ContentHasher::Md5(context) => format!("{:x}", context.compute()),
            ContentHasher::Sha256(hasher) => format!("{:x}", sha2::Digest::finalize(hasher)),
            ContentHasher::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        };
        ChecksumValue::new(algorithm, hex)
    }
}

/// Hash everything a reader yields.
pub fn hash_reader<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> io::Result<ChecksumValue> {
    let mut hasher = ContentHasher::new(algorithm);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => return Ok(hasher.finalize()),
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Hash a whole file.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    File::open(path)
        .and_then(|mut file| hash_reader(&mut file, algorithm))
        .map_err(|source| EngineError::ReadError {
            path: path.to_path_buf(),
            source,
        })
}

/// Render a checksum listing.
///
/// Two `;` comment lines name the tool and algorithm, then one
/// `<hex> <relative path>` line per entry.
pub fn generate_checksum_file(
    entries: &[(String, ChecksumValue)],
    algorithm: ChecksumAlgorithm,
) -> String {
    let header = format!(
        "; Checksum file generated by carryover\n; Algorithm: {}\n\n",
        algorithm
    );
    entries.iter().fold(header, |mut listing, (relative, checksum)| {
        listing.push_str(checksum.hex());
        listing.push(' ');
        listing.push_str(relative);
        listing.push('\n');
        listing
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
        let mut hasher = ContentHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize().hex().to_string()
    }

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in ChecksumAlgorithm::ALL {
            assert_eq!(algorithm.to_string().parse(), Ok(algorithm));
        }
        assert_eq!(" MD5 ".parse(), Ok(ChecksumAlgorithm::Md5));
        assert!("sha1".parse::<ChecksumAlgorithm>().is_err());
        assert_eq!(ChecksumAlgorithm::default(), ChecksumAlgorithm::Blake3);
    }

    #[test]
    fn test_known_digests() {
        // Standard CRC-32 check value
        assert_eq!(digest(ChecksumAlgorithm::Crc32, b"123456789"), "cbf43926");
        assert_eq!(
            digest(ChecksumAlgorithm::Md5, b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            digest(ChecksumAlgorithm::Sha256, b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            digest(ChecksumAlgorithm::Blake3, b"hello"),
            blake3::hash(b"hello").to_hex().as_str()
        );
    }

    #[test]
    fn test_digest_lengths() {
        for algorithm in ChecksumAlgorithm::ALL {
            assert_eq!(digest(algorithm, b"x").len(), algorithm.hex_len(), "{}", algorithm);
        }
    }

    #[test]
    fn test_chunked_updates_match_single_update() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        for algorithm in ChecksumAlgorithm::ALL {
            let mut hasher = ContentHasher::new(algorithm);
            for chunk in data.chunks(333) {
                hasher.update(chunk);
            }
            assert_eq!(hasher.finalize().hex(), digest(algorithm, &data));
        }
    }

    #[test]
    fn test_value_display() {
        let value = ChecksumValue::new(ChecksumAlgorithm::Sha256, "abc123".to_string());
        assert_eq!(value.to_string(), "abc123");
        assert_eq!(value.to_string_with_algo(), "sha256:abc123");
        assert_ne!(
            value,
            ChecksumValue::new(ChecksumAlgorithm::Blake3, "abc123".to_string())
        );
    }

    #[test]
    fn test_file_checksum_spans_buffers() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).expect("Failed to write file");

        let from_file = compute_file_checksum(&path, ChecksumAlgorithm::Sha256)
            .expect("Checksum should succeed");
        assert_eq!(from_file.hex(), digest(ChecksumAlgorithm::Sha256, &content));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result =
            compute_file_checksum(&temp_dir.path().join("missing"), ChecksumAlgorithm::Md5);
        assert!(matches!(result, Err(EngineError::ReadError { .. })));
    }

    #[test]
    fn test_listing_format() {
        let entries = vec![
            (
                "a/file1.txt".to_string(),
                ChecksumValue::new(ChecksumAlgorithm::Crc32, "0000abcd".to_string()),
            ),
            (
                "file2.txt".to_string(),
                ChecksumValue::new(ChecksumAlgorithm::Crc32, "ffff0000".to_string()),
            ),
        ];

        let listing = generate_checksum_file(&entries, ChecksumAlgorithm::Crc32);
        assert_eq!(
            listing,
            "; Checksum file generated by carryover\n; Algorithm: crc32\n\n0000abcd a/file1.txt\nffff0000 file2.txt\n"
        );
    }
}
