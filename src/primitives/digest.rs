use {
  serde::{Deserialize, Serialize},
  sha2::{Digest as Sha2Digest, Sha256},
  std::fmt::{Debug, Display, Formatter},
};

/// A SHA-256 digest over some canonical byte encoding.
///
/// Block hashes, vote targets and USIG bindings are all values of
/// this type. The bytes that go into the hasher are pinned by the
/// encoding modules, never by this type.
#[derive(
  Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Digest([u8; 32]);

impl Digest {
  pub fn compute(bytes: &[u8]) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Self(hasher.finalize().into())
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl From<[u8; 32]> for Digest {
  fn from(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }
}

impl Display for Digest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", hex::encode(&self.0[..4]))
  }
}

impl Debug for Digest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Digest({})", self.to_hex())
  }
}

#[cfg(test)]
mod test {
  use super::Digest;

  #[test]
  fn digest_is_stable() {
    let a = Digest::compute(b"streamlet");
    let b = Digest::compute(b"streamlet");
    assert_eq!(a, b);
    assert_ne!(a, Digest::compute(b"streamlet!"));
  }

  #[test]
  fn hex_roundtrip() {
    let d = Digest::compute(b"abc");
    assert_eq!(d.to_hex().len(), 64);
    assert_eq!(
      d.to_hex(),
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
  }
}
