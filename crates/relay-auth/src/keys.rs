//! Public key material exchanged during pairing
//!
//! Keys travel as base64-encoded DER (`SubjectPublicKeyInfo`). The relay
//! never uses them for cryptography itself; it checks they are well formed
//! and remembers a fingerprint so a re-pairing with a different key is
//! detectable.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use relay_core::{Error, Result};
use sha2::{Digest, Sha256};

/// Smallest DER structure we accept as a public key
const MIN_DER_LEN: usize = 32;

/// ASN.1 SEQUENCE tag
const DER_SEQUENCE: u8 = 0x30;

/// A validated public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    encoded: String,
    der: Vec<u8>,
}

impl PublicKey {
    /// Parse a base64 DER public key
    pub fn parse(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        let der = BASE64
            .decode(encoded)
            .map_err(|e| Error::InvalidPublicKey(format!("not valid base64: {}", e)))?;

        if der.len() < MIN_DER_LEN {
            return Err(Error::InvalidPublicKey(format!(
                "key is too short ({} bytes)",
                der.len()
            )));
        }
        if der[0] != DER_SEQUENCE {
            return Err(Error::InvalidPublicKey("key is not a DER sequence".into()));
        }
        let declared = der_sequence_len(&der)
            .ok_or_else(|| Error::InvalidPublicKey("malformed DER length".into()))?;
        if declared != der.len() {
            return Err(Error::InvalidPublicKey(format!(
                "DER length mismatch: header says {} bytes, got {}",
                declared,
                der.len()
            )));
        }

        Ok(Self {
            encoded: encoded.to_string(),
            der,
        })
    }

    /// The key as it was submitted (trimmed)
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// SHA-256 fingerprint of the DER bytes, base64 encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.der);
        BASE64.encode(hasher.finalize())
    }

    /// Whether two encodings describe the same key
    pub fn same_key(&self, other: &str) -> bool {
        PublicKey::parse(other)
            .map(|k| k.der == self.der)
            .unwrap_or(false)
    }
}

/// Total length (header included) of the outer DER sequence
fn der_sequence_len(der: &[u8]) -> Option<usize> {
    let first = *der.get(1)?;
    if first & 0x80 == 0 {
        return Some(2 + first as usize);
    }
    let count = (first & 0x7f) as usize;
    if count == 0 || count > 4 {
        return None;
    }
    let bytes = der.get(2..2 + count)?;
    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Some(2 + count + len)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a syntactically valid DER sequence of `body_len` payload bytes
    pub(crate) fn sample_key(seed: u8, body_len: usize) -> String {
        let mut der = vec![DER_SEQUENCE];
        if body_len < 0x80 {
            der.push(body_len as u8);
        } else {
            der.push(0x82);
            der.push((body_len >> 8) as u8);
            der.push((body_len & 0xff) as u8);
        }
        der.extend((0..body_len).map(|i| seed.wrapping_add(i as u8)));
        BASE64.encode(der)
    }

    #[test]
    fn test_valid_keys() {
        let short_form = PublicKey::parse(&sample_key(1, 64)).unwrap();
        let long_form = PublicKey::parse(&sample_key(1, 290)).unwrap();
        assert_ne!(short_form.fingerprint(), long_form.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let encoded = sample_key(7, 100);
        let a = PublicKey::parse(&encoded).unwrap();
        let b = PublicKey::parse(&format!("  {}\n", encoded)).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.same_key(&encoded));
        assert!(!a.same_key(&sample_key(8, 100)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            PublicKey::parse("not base64!!"),
            Err(Error::InvalidPublicKey(_))
        ));
        assert!(PublicKey::parse(&BASE64.encode([0x30, 0x02, 0x01, 0x02])).is_err());
        let mut not_sequence = BASE64.decode(sample_key(1, 64)).unwrap();
        not_sequence[0] = 0x04;
        assert!(PublicKey::parse(&BASE64.encode(not_sequence)).is_err());
    }

    #[test]
    fn test_rejects_truncated_key() {
        let mut der = BASE64.decode(sample_key(3, 200)).unwrap();
        der.truncate(150);
        assert!(PublicKey::parse(&BASE64.encode(der)).is_err());
    }
}
