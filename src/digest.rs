//! Streaming digests and their textual encodings.
//!
//! A [`Digester`] accumulates bytes and finalizes once.  Encodings
//! follow the object store's conventions: lowercase hex, padded
//! base64, and unpadded lowercase base32hex (RFC 4648 §7) as the
//! default key-friendly form.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use md5::Md5;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};

use crate::errors::StreamError;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum DigestAlgorithm {
    Md5,
    #[default]
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 3] = [
        DigestAlgorithm::Md5,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha512,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Raw digest length in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Length of the hex rendering.
    pub fn hex_size(&self) -> usize {
        self.byte_size() * 2
    }

    pub fn digester(&self) -> Digester {
        Digester::new(*self)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = StreamError;

    /// Accepts `md5`, `sha256`, `sha-256`, `SHA512`, ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(StreamError::UnknownDigest(s.to_string())),
        }
    }
}

impl TryFrom<String> for DigestAlgorithm {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Running digest state.
#[derive(Clone)]
pub enum Digester {
    Md5(Md5),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Digester::Md5(Md5::new()),
            DigestAlgorithm::Sha256 => Digester::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Digester::Sha512(Sha512::new()),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Digester::Md5(_) => DigestAlgorithm::Md5,
            Digester::Sha256(_) => DigestAlgorithm::Sha256,
            Digester::Sha512(_) => DigestAlgorithm::Sha512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Md5(h) => h.update(data),
            Digester::Sha256(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Digester::Md5(h) => h.finalize().to_vec(),
            Digester::Sha256(h) => h.finalize().to_vec(),
            Digester::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digester").field(&self.algorithm()).finish()
    }
}

/// One-shot digest of a byte slice.
pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> Vec<u8> {
    let mut digester = algorithm.digester();
    digester.update(data);
    digester.finalize()
}

// -- Encodings -----------------------------------------------------------------

pub fn to_hex(raw: &[u8]) -> String {
    hex::encode(raw)
}

/// Standard base64 with padding.
pub fn to_base64(raw: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Base32 with the extended hex alphabet, lowercase, no padding.
/// Sort order of the output matches sort order of the input.
pub fn to_base32(raw: &[u8]) -> String {
    data_encoding::BASE32HEX_NOPAD
        .encode(raw)
        .to_ascii_lowercase()
}
