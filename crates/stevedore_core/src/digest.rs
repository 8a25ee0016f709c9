use digest::Digest as _;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha2::Sha512;

use crate::errors::{Error, Result};

/// Content address in canonical `<algorithm>:<hex>` form.
///
/// Equality is byte-exact on both the algorithm and the hex encoding; parsing
/// rejects anything that is not lowercase hex of the length the algorithm
/// produces.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    encoded: String,
}

impl Digest {
    pub fn new(algorithm: Algorithm, encoded: String) -> Result<Self> {
        if encoded.len() != algorithm.hex_len()
            || !encoded.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(Error::InvalidDigest(format!("{algorithm}:{encoded}")));
        }
        Ok(Self { algorithm, encoded })
    }

    /// Digest of an in-memory byte slice using the default algorithm.
    pub fn from_bytes(bs: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        sha2::Digest::update(&mut hasher, bs);
        Self {
            algorithm: Algorithm::Sha256,
            encoded: hex::encode(hasher.finalize()),
        }
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex-encoded hash, without the algorithm prefix.
    #[inline]
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// First two hex characters, used to shard content-addressed storage paths.
    #[inline]
    pub fn split_prefix(&self) -> &str {
        &self.encoded[..2]
    }

    /// Raw hash bytes, for binary storage at SQL boundaries.
    pub fn bytes(&self) -> Vec<u8> {
        hex::decode(&self.encoded).expect("parsed digests only contain valid hex")
    }

    pub fn from_parts(algorithm: Algorithm, bytes: &[u8]) -> Result<Self> {
        Self::new(algorithm, hex::encode(bytes))
    }

    pub fn digester(&self) -> Digester {
        Digester::new(self.algorithm)
    }
}

impl TryFrom<&str> for Digest {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        let (algo, encoded) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(s.to_string()))?;
        let algorithm: Algorithm = algo.try_into()?;
        Self::new(algorithm, encoded.to_string()).map_err(|_| Error::InvalidDigest(s.to_string()))
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.as_str().try_into()
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.try_into()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        format!("{d}")
    }
}

impl From<&Digest> for String {
    fn from(d: &Digest) -> String {
        format!("{d}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Stable numeric id for relational storage.
    pub fn id(&self) -> i16 {
        match self {
            Algorithm::Sha256 => 1,
            Algorithm::Sha512 => 2,
        }
    }

    pub fn from_id(id: i16) -> Result<Self> {
        match id {
            1 => Ok(Algorithm::Sha256),
            2 => Ok(Algorithm::Sha512),
            other => Err(Error::UnsupportedDigestAlgorithm(other.to_string())),
        }
    }
}

impl TryFrom<&str> for Algorithm {
    type Error = Error;

    fn try_from(a: &str) -> Result<Self> {
        match a {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            s => Err(Error::UnsupportedDigestAlgorithm(String::from(s))),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Incremental digest computation over a byte stream.
///
/// Tracks the byte count alongside the hash so upload finalization can verify
/// both the digest and the content length in one pass. Cloning snapshots the
/// hash state, which lets an upload probe its digest without ending the
/// stream.
#[derive(Clone)]
pub struct Digester {
    hasher: Hasher,
    bytes: u64,
}

#[derive(Clone)]
enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn new(algorithm: Algorithm) -> Self {
        let hasher = match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self { hasher, bytes: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
        self.bytes += data.len() as u64;
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn algorithm(&self) -> Algorithm {
        match self.hasher {
            Hasher::Sha256(_) => Algorithm::Sha256,
            Hasher::Sha512(_) => Algorithm::Sha512,
        }
    }

    pub fn finalize(self) -> Digest {
        let (algorithm, encoded) = match self.hasher {
            Hasher::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            Hasher::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, encoded }
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new(Algorithm::Sha256)
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[rstest]
    #[case::valid_sha256(
        &format!("sha256:{EMPTY_SHA256}"),
        Ok((Algorithm::Sha256, EMPTY_SHA256))
    )]
    #[case::unknown_algorithm("sha666:abcd", Err(()))]
    #[case::no_separator("sha256abcd", Err(()))]
    #[case::empty_hex("sha256:", Err(()))]
    #[case::empty_algorithm(&format!(":{EMPTY_SHA256}"), Err(()))]
    #[case::short_hex("sha256:abcd", Err(()))]
    #[case::uppercase_hex(&format!("sha256:{}", EMPTY_SHA256.to_uppercase()), Err(()))]
    #[case::nonhex(&format!("sha256:{}", "z".repeat(64)), Err(()))]
    fn parse(#[case] input: &str, #[case] expected: std::result::Result<(Algorithm, &str), ()>) {
        let actual: Result<Digest> = input.try_into();
        match (expected, actual) {
            (Ok((algorithm, encoded)), Ok(act)) => {
                assert_eq!(act.algorithm(), algorithm);
                assert_eq!(act.encoded(), encoded);
                assert_eq!(String::from(&act), input);
            }
            (Ok(_), Err(e)) => panic!("expected Ok, got Err( {e:?} )"),
            (Err(()), Ok(d)) => panic!("expected Err, got Ok( {d:?} )"),
            (Err(()), Err(_)) => {}
        }
    }

    #[test]
    fn sha512_roundtrip() {
        let s = format!("sha512:{}", "ab".repeat(64));
        let d: Digest = s.as_str().try_into().unwrap();
        assert_eq!(d.algorithm(), Algorithm::Sha512);
        assert_eq!(String::from(&d), s);
    }

    #[test]
    fn digester_matches_from_bytes() {
        let mut digester = Digester::default();
        digester.update(b"hello ");
        digester.update(b"world");
        assert_eq!(digester.bytes(), 11);
        assert_eq!(digester.finalize(), Digest::from_bytes(b"hello world"));
    }

    #[test]
    fn empty_digest_known_vector() {
        assert_eq!(Digest::from_bytes(b"").encoded(), EMPTY_SHA256);
    }

    #[test]
    fn split_prefix_and_bytes() {
        let d = Digest::from_bytes(b"layer");
        assert_eq!(d.split_prefix(), &d.encoded()[..2]);
        assert_eq!(hex::encode(d.bytes()), d.encoded());
        assert_eq!(
            Digest::from_parts(d.algorithm(), &d.bytes()).unwrap(),
            d
        );
    }
}
