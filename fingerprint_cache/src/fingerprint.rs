// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// A collision-resistant digest of a serialized value, and the identity used
/// by [`crate::FingerprintValueCache`].
///
/// Rendered as lowercase hex, the conventional shape for a
/// content-addressed digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const EMPTY: Fingerprint = Fingerprint([
        0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
        0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
        0xb8, 0x55,
    ]);

    /// Digests `bytes` with SHA-256 to produce a Fingerprint.
    pub fn from_bytes(bytes: &[u8]) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Fingerprint(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidFingerprint;

impl fmt::Display for InvalidFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid fingerprint: expected 64 hex characters")
    }
}

impl std::error::Error for InvalidFingerprint {}

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Fingerprint, InvalidFingerprint> {
        let bytes = hex::decode(s).map_err(|_| InvalidFingerprint)?;
        if bytes.len() != 32 {
            return Err(InvalidFingerprint);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Fingerprint(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_matches_known_sha256() {
        assert_eq!(Fingerprint::from_bytes(b""), Fingerprint::EMPTY);
    }

    #[test]
    fn display_and_parse_round_trip() {
        let fp = Fingerprint::from_bytes(b"hello world");
        let rendered = fp.to_string();
        assert_eq!(rendered.len(), 64);
        assert_eq!(rendered.parse::<Fingerprint>().unwrap(), fp);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!("abcd".parse::<Fingerprint>().is_err());
    }
}
