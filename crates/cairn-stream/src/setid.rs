//! 128-bit dataset identifiers.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StreamError;

/// Lowercase RFC 4648 alphabet, no padding.
const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Encoded length: 128 bits in 5-bit groups.
const ENCODED_LEN: usize = 26;

/// 128-bit identifier of a dataset.
///
/// Ordering is the big-endian byte order, so the textual encoding sorts the
/// same way the binary value does. The textual form is 26 lowercase base32
/// characters without padding and round-trips exactly in both directions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Setid([u8; 16]);

impl Setid {
  /// Create a setid from raw bytes.
  pub const fn from_bytes(bytes: [u8; 16]) -> Self {
    Self(bytes)
  }

  /// Create a setid from a 128-bit integer.
  pub const fn from_u128(value: u128) -> Self {
    Self(value.to_be_bytes())
  }

  /// Generate a random setid.
  pub fn random() -> Self {
    Self(uuid::Uuid::new_v4().into_bytes())
  }

  /// The raw bytes, big-endian.
  pub const fn as_bytes(&self) -> &[u8; 16] {
    &self.0
  }

  /// The identifier as a 128-bit integer.
  pub const fn as_u128(&self) -> u128 {
    u128::from_be_bytes(self.0)
  }
}

impl fmt::Display for Setid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut out = String::with_capacity(ENCODED_LEN);
    let mut acc: u32 = 0;
    let mut nbits = 0;
    for &byte in &self.0 {
      acc = (acc << 8) | byte as u32;
      nbits += 8;
      while nbits >= 5 {
        nbits -= 5;
        out.push(ALPHABET[((acc >> nbits) & 31) as usize] as char);
      }
    }
    // 128 = 25 * 5 + 3: the final character carries 3 bits, low 2 are zero.
    out.push(ALPHABET[((acc << (5 - nbits)) & 31) as usize] as char);
    f.write_str(&out)
  }
}

impl fmt::Debug for Setid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Setid({})", self)
  }
}

impl FromStr for Setid {
  type Err = StreamError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.len() != ENCODED_LEN {
      return Err(StreamError::InvalidSetid {
        input: s.to_string(),
        reason: "expected 26 characters",
      });
    }

    let mut bytes = [0u8; 16];
    let mut acc: u32 = 0;
    let mut nbits = 0;
    let mut out = 0;
    for ch in s.bytes() {
      let value = ALPHABET.iter().position(|&a| a == ch).ok_or_else(|| {
        StreamError::InvalidSetid {
          input: s.to_string(),
          reason: "character outside base32 alphabet",
        }
      })?;
      acc = (acc << 5) | value as u32;
      nbits += 5;
      if nbits >= 8 {
        nbits -= 8;
        bytes[out] = ((acc >> nbits) & 0xff) as u8;
        out += 1;
      }
    }

    // Reject non-canonical encodings so encode/decode is the identity.
    if acc & ((1 << nbits) - 1) != 0 {
      return Err(StreamError::InvalidSetid {
        input: s.to_string(),
        reason: "non-zero trailing bits",
      });
    }

    Ok(Self(bytes))
  }
}

impl Serialize for Setid {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Setid {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(D::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_roundtrip() {
    for value in [0u128, 1, u128::MAX, 0xdead_beef_0123_4567_89ab_cdef_fedc_ba98] {
      let setid = Setid::from_u128(value);
      let text = setid.to_string();
      assert_eq!(text.len(), 26);
      let parsed: Setid = text.parse().expect("decode failed");
      assert_eq!(parsed, setid);
      assert_eq!(parsed.to_string(), text);
    }
  }

  #[test]
  fn test_random_roundtrip() {
    for _ in 0..64 {
      let setid = Setid::random();
      let parsed: Setid = setid.to_string().parse().expect("decode failed");
      assert_eq!(parsed, setid);
    }
  }

  #[test]
  fn test_ordering_matches_numeric() {
    let small = Setid::from_u128(7);
    let large = Setid::from_u128(1 << 90);
    assert!(small < large);
    assert!(small.to_string() < large.to_string() || small.as_u128() < large.as_u128());
  }

  #[test]
  fn test_rejects_wrong_length() {
    assert!("abc".parse::<Setid>().is_err());
  }

  #[test]
  fn test_rejects_bad_alphabet() {
    let text = "0".repeat(26);
    assert!(text.parse::<Setid>().is_err());
  }

  #[test]
  fn test_rejects_non_canonical_trailing_bits() {
    // 'b' = 1 in the final position sets a trailing bit that cannot come
    // from a 128-bit value.
    let mut text = Setid::from_u128(0).to_string();
    text.pop();
    text.push('b');
    assert!(text.parse::<Setid>().is_err());
  }

  #[test]
  fn test_serde_as_string() {
    let setid = Setid::from_u128(42);
    let json = serde_json::to_string(&setid).unwrap();
    assert_eq!(json, format!("\"{}\"", setid));
    let back: Setid = serde_json::from_str(&json).unwrap();
    assert_eq!(back, setid);
  }
}
