use super::hash::{hash, Hash};
use rsa::{traits::PublicKeyParts, BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::{
    fmt::{Display, Error as FmtError, Formatter},
    str::FromStr,
};

// An account is identified by the digest of its public key, so the
// address is a commitment to the key that must sign its transactions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(Hash);

impl Address {
    pub fn as_hash(&self) -> &Hash {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Address(Hash::from_str(s)?))
    }
}

// PKCS#1 v1.5 signature bytes, hex on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(#[serde(with = "hex")] Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// RSA public key, serialized as its N/E components in lower hex.
#[derive(Clone, Debug, PartialEq)]
pub struct PublicKey(RsaPublicKey);

#[derive(Serialize, Deserialize)]
struct RawPublicKey {
    #[serde(rename = "N")]
    n: String,
    #[serde(rename = "E")]
    e: String,
}

impl PublicKey {
    pub fn new(key: RsaPublicKey) -> Self {
        PublicKey(key)
    }

    // The sender address committed to by this key: the SHA-256 digest
    // of "{N_hex}||{E_hex}".
    pub fn address(&self) -> Address {
        let preimage = format!("{:x}||{:x}", self.0.n(), self.0.e());
        Address(hash(preimage.as_bytes()))
    }

    // Verify a PKCS#1 v1.5 signature over a SHA-256 digest
    pub fn verify(&self, digest: &Hash, signature: &Signature) -> bool {
        self.0
            .verify(
                Pkcs1v15Sign::new::<Sha256>(),
                digest.as_bytes(),
                signature.as_bytes(),
            )
            .is_ok()
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let parts = RawPublicKey {
            n: format!("{:x}", self.0.n()),
            e: format!("{:x}", self.0.e()),
        };
        parts.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts = RawPublicKey::deserialize(deserializer)?;
        let n = BigUint::parse_bytes(parts.n.as_bytes(), 16)
            .ok_or_else(|| SerdeError::custom("invalid modulus"))?;
        let e = BigUint::parse_bytes(parts.e.as_bytes(), 16)
            .ok_or_else(|| SerdeError::custom("invalid exponent"))?;
        let key = RsaPublicKey::new(n, e).map_err(SerdeError::custom)?;
        Ok(PublicKey(key))
    }
}

pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair with the default key length.
    pub fn new() -> Result<Self, rsa::Error> {
        Self::with_bits(crate::config::DEFAULT_RSA_KEY_BITS)
    }

    /// Generate a fresh keypair with an explicit key length.
    /// Short keys are only suitable for tests.
    pub fn with_bits(bits: usize) -> Result<Self, rsa::Error> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)?;
        let public_key = PublicKey::new(private_key.to_public_key());
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }

    pub fn get_public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn address(&self) -> Address {
        self.public_key.address()
    }

    // Sign a SHA-256 digest with PKCS#1 v1.5
    pub fn sign(&self, digest: &Hash) -> Result<Signature, rsa::Error> {
        let bytes = self
            .private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest.as_bytes())?;
        Ok(Signature(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> KeyPair {
        KeyPair::with_bits(512).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = test_keypair();
        let digest = hash(b"payload");

        let sig = keys.sign(&digest).unwrap();
        assert!(keys.get_public_key().verify(&digest, &sig));

        // A different digest must not verify
        let other = hash(b"other payload");
        assert!(!keys.get_public_key().verify(&other, &sig));
    }

    #[test]
    fn test_signature_rejected_under_wrong_key() {
        let keys = test_keypair();
        let stranger = test_keypair();
        let digest = hash(b"payload");

        let sig = keys.sign(&digest).unwrap();
        assert!(!stranger.get_public_key().verify(&digest, &sig));
    }

    #[test]
    fn test_address_is_stable() {
        let keys = test_keypair();
        assert_eq!(keys.address(), keys.get_public_key().address());
    }

    #[test]
    fn test_public_key_serde_roundtrip() {
        let keys = test_keypair();
        let json = serde_json::to_string(keys.get_public_key()).unwrap();
        assert!(json.contains("\"N\""));
        assert!(json.contains("\"E\""));

        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, *keys.get_public_key());
        assert_eq!(back.address(), keys.address());
    }
}
