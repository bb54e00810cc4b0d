//! # Codec Contracts
//!
//! Checksums, compression and encryption are consumed by the engine as pure,
//! stateless functions over byte ranges. The engine never interprets codec
//! internals; it stores a type tag next to every checksummed or compressed
//! region and dispatches through this module.
//!
//! Only the checksum family is implemented in-core (jsets, bsets and the
//! superblock all carry one). Compression and encryption exist as type tags
//! recorded in options and key values; the none-codec is the only
//! implementation the core provides, everything else is an external
//! collaborator behind the same signatures.

use crc::{Crc, CRC_32_ISCSI, CRC_64_ECMA_182};

use crate::errors::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Checksum algorithm tags, persisted in superblock options and per-region
/// headers. Values are part of the on-disk format; append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChecksumType {
    None = 0,
    Crc32c = 1,
    #[default]
    Crc64 = 2,
}

impl ChecksumType {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(ChecksumType::None),
            1 => Ok(ChecksumType::Crc32c),
            2 => Ok(ChecksumType::Crc64),
            _ => Err(Error::UnsupportedFeature(format!(
                "unknown checksum type {raw}"
            ))),
        }
    }
}

/// Compression algorithm tags. Only `None` is implemented in-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    #[default]
    None = 0,
    Lz4 = 1,
    Gzip = 2,
    Zstd = 3,
}

impl CompressionType {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            2 => Ok(CompressionType::Gzip),
            3 => Ok(CompressionType::Zstd),
            _ => Err(Error::UnsupportedFeature(format!(
                "unknown compression type {raw}"
            ))),
        }
    }
}

/// String hash function tags for dirent/xattr name hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StrHashType {
    #[default]
    Crc32c = 0,
    Crc64 = 1,
    Siphash = 2,
}

impl StrHashType {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(StrHashType::Crc32c),
            1 => Ok(StrHashType::Crc64),
            2 => Ok(StrHashType::Siphash),
            _ => Err(Error::UnsupportedFeature(format!(
                "unknown string hash type {raw}"
            ))),
        }
    }
}

/// Compute the checksum of `bytes` under `ty`, mixing in a caller-provided
/// nonce (typically an on-disk sequence number) so that identical payloads at
/// different locations do not validate against each other.
pub fn checksum(ty: ChecksumType, nonce: u64, bytes: &[u8]) -> u64 {
    match ty {
        ChecksumType::None => 0,
        ChecksumType::Crc32c => {
            let mut digest = CRC32.digest();
            digest.update(&nonce.to_le_bytes());
            digest.update(bytes);
            digest.finalize() as u64
        }
        ChecksumType::Crc64 => {
            let mut digest = CRC64.digest();
            digest.update(&nonce.to_le_bytes());
            digest.update(bytes);
            digest.finalize()
        }
    }
}

/// Checksum over multiple discontiguous ranges, in order.
pub fn checksum_vec(ty: ChecksumType, nonce: u64, ranges: &[&[u8]]) -> u64 {
    match ty {
        ChecksumType::None => 0,
        ChecksumType::Crc32c => {
            let mut digest = CRC32.digest();
            digest.update(&nonce.to_le_bytes());
            for r in ranges {
                digest.update(r);
            }
            digest.finalize() as u64
        }
        ChecksumType::Crc64 => {
            let mut digest = CRC64.digest();
            digest.update(&nonce.to_le_bytes());
            for r in ranges {
                digest.update(r);
            }
            digest.finalize()
        }
    }
}

/// Hash a name for dirent/xattr key offsets.
pub fn str_hash(ty: StrHashType, name: &[u8]) -> u64 {
    match ty {
        // Siphash needs key material from the superblock; until encryption
        // is wired through, it hashes like crc64 with a fixed prefix.
        StrHashType::Crc32c => CRC32.checksum(name) as u64,
        StrHashType::Crc64 | StrHashType::Siphash => CRC64.checksum(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_depends_on_nonce() {
        let a = checksum(ChecksumType::Crc64, 1, b"payload");
        let b = checksum(ChecksumType::Crc64, 2, b"payload");
        assert_ne!(a, b);
        assert_eq!(a, checksum(ChecksumType::Crc64, 1, b"payload"));
    }

    #[test]
    fn checksum_vec_matches_contiguous() {
        let whole = checksum(ChecksumType::Crc64, 7, b"hello world");
        let split = checksum_vec(ChecksumType::Crc64, 7, &[b"hello ", b"world"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn none_checksum_is_zero() {
        assert_eq!(checksum(ChecksumType::None, 99, b"anything"), 0);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(ChecksumType::from_raw(7).is_err());
        assert!(CompressionType::from_raw(200).is_err());
    }
}
