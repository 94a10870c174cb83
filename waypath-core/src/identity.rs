//! Peer identity and crypto: ed25519 identity keys, purpose-tagged signatures,
//! ephemeral x25519 keys and the DV-box cipher suite.
//!
//! A peer identity is its ed25519 public key. The same key material is used
//! for Diffie-Hellman by mapping it onto Curve25519, so a sender can encrypt
//! to any peer whose identity it knows.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

/// Peer identity (32 bytes, ed25519 public key). Key of every per-peer map.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod bytes_64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

impl PeerIdentity {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerIdentity(bytes)
    }

    /// Curve25519 form of this identity, for Diffie-Hellman.
    fn to_x25519(self) -> Result<X25519PublicKey, CryptoError> {
        let vk = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::BadPublicKey)?;
        Ok(X25519PublicKey::from(vk.to_montgomery().to_bytes()))
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", self)
    }
}

/// Ed25519 signature, serialized as 64 raw bytes.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "bytes_64")] [u8; 64]);

impl Signature {
    /// All-zero placeholder; never verifies.
    pub const EMPTY: Signature = Signature([0u8; 64]);

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..4]))
    }
}

/// Domain separation tag mixed into every signed blob. A signature made for
/// one purpose never verifies for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignaturePurpose {
    DvLearnInitiator,
    DvLearnHop,
    EphemeralConfirmation,
    AddressValidation,
    OwnAddress,
}

impl SignaturePurpose {
    fn tag(self) -> &'static [u8] {
        match self {
            SignaturePurpose::DvLearnInitiator => b"waypath-dv-learn-init-v1",
            SignaturePurpose::DvLearnHop => b"waypath-dv-learn-hop-v1",
            SignaturePurpose::EphemeralConfirmation => b"waypath-ephemeral-v1",
            SignaturePurpose::AddressValidation => b"waypath-address-validation-v1",
            SignaturePurpose::OwnAddress => b"waypath-own-address-v1",
        }
    }
}

fn tagged(purpose: SignaturePurpose, data: &[u8]) -> Vec<u8> {
    let tag = purpose.tag();
    let mut out = Vec::with_capacity(tag.len() + 1 + data.len());
    out.extend_from_slice(tag);
    out.push(0);
    out.extend_from_slice(data);
    out
}

/// Long-term identity keypair. Keep the secret private; expose only the identity.
pub struct Keypair {
    signing: SigningKey,
    identity: PeerIdentity,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    /// Generate from a caller-supplied RNG (seeded in tests).
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing = SigningKey::generate(rng);
        Self::from_signing_key(signing)
    }

    /// Restore from the 32-byte secret seed.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&secret))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let identity = PeerIdentity(signing.verifying_key().to_bytes());
        Self { signing, identity }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    pub fn sign(&self, purpose: SignaturePurpose, data: &[u8]) -> Signature {
        Signature(self.signing.sign(&tagged(purpose, data)).to_bytes())
    }

    /// Shared secret with the sender of an ephemeral public key.
    pub fn dh_with_ephemeral(&self, ephemeral: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.signing.to_scalar_bytes());
        secret
            .diffie_hellman(&X25519PublicKey::from(*ephemeral))
            .to_bytes()
    }
}

/// Verify a purpose-tagged signature by `signer`.
pub fn verify(
    signer: &PeerIdentity,
    purpose: SignaturePurpose,
    data: &[u8],
    sig: &Signature,
) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(&signer.0) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
    vk.verify(&tagged(purpose, data), &sig).is_ok()
}

/// Ephemeral x25519 key used to encrypt DV boxes towards one target.
pub struct EphemeralKey {
    secret: StaticSecret,
    public: [u8; 32],
}

impl EphemeralKey {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    /// Shared secret with the long-term key of `target`.
    pub fn dh_with_peer(&self, target: &PeerIdentity) -> Result<[u8; 32], CryptoError> {
        let their = target.to_x25519()?;
        Ok(self.secret.diffie_hellman(&their).to_bytes())
    }
}

const BOX_KEY_INFO: &[u8] = b"waypath-dv-box-v1";

/// Per-box key material expanded from a DH secret and the box IV.
pub struct BoxKeys {
    cipher_key: [u8; 32],
    nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl BoxKeys {
    pub fn derive(dh: &[u8; 32], iv: &[u8; 16]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(iv), dh);
        let mut okm = [0u8; 76];
        hk.expand(BOX_KEY_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        let mut cipher_key = [0u8; 32];
        let mut nonce = [0u8; 12];
        let mut hmac_key = [0u8; 32];
        cipher_key.copy_from_slice(&okm[..32]);
        nonce.copy_from_slice(&okm[32..44]);
        hmac_key.copy_from_slice(&okm[44..]);
        Ok(Self {
            cipher_key,
            nonce,
            hmac_key,
        })
    }

    /// Encrypt and authenticate. Returns (ciphertext, hmac over ciphertext).
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.cipher_key).map_err(|_| CryptoError::Key)?;
        let nonce = chacha20poly1305::Nonce::from_slice(&self.nonce);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let hmac = self.hmac(&ciphertext)?;
        Ok((ciphertext, hmac))
    }

    /// Check the HMAC first; only then attempt decryption.
    pub fn open(&self, ciphertext: &[u8], hmac: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.hmac_key).map_err(|_| CryptoError::Key)?;
        mac.update(ciphertext);
        mac.verify_slice(hmac).map_err(|_| CryptoError::BadHmac)?;
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.cipher_key).map_err(|_| CryptoError::Key)?;
        let nonce = chacha20poly1305::Nonce::from_slice(&self.nonce);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    fn hmac(&self, data: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.hmac_key).map_err(|_| CryptoError::Key)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("peer identity is not a valid curve point")]
    BadPublicKey,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encrypt,
    #[error("hmac mismatch")]
    BadHmac,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_is_purpose_bound() {
        let kp = Keypair::generate();
        let sig = kp.sign(SignaturePurpose::DvLearnHop, b"challenge");
        assert!(verify(&kp.identity(), SignaturePurpose::DvLearnHop, b"challenge", &sig));
        assert!(!verify(&kp.identity(), SignaturePurpose::DvLearnInitiator, b"challenge", &sig));
        assert!(!verify(&kp.identity(), SignaturePurpose::DvLearnHop, b"other", &sig));
        let other = Keypair::generate();
        assert!(!verify(&other.identity(), SignaturePurpose::DvLearnHop, b"challenge", &sig));
    }

    #[test]
    fn secret_bytes_restore_identity() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(kp.secret_bytes());
        assert_eq!(kp.identity(), restored.identity());
    }

    #[test]
    fn ephemeral_dh_matches_identity_dh() {
        let target = Keypair::generate();
        let eph = EphemeralKey::generate(&mut OsRng);
        let sender_side = eph.dh_with_peer(&target.identity()).unwrap();
        let target_side = target.dh_with_ephemeral(eph.public());
        assert_eq!(sender_side, target_side);
    }

    #[test]
    fn box_seal_open() {
        let dh = [7u8; 32];
        let iv = [3u8; 16];
        let keys = BoxKeys::derive(&dh, &iv).unwrap();
        let (ct, mac) = keys.seal(b"inner frame").unwrap();
        assert_eq!(keys.open(&ct, &mac).unwrap(), b"inner frame");

        let mut bad = ct.clone();
        bad[0] ^= 1;
        assert!(matches!(keys.open(&bad, &mac), Err(CryptoError::BadHmac)));

        let other = BoxKeys::derive(&dh, &[4u8; 16]).unwrap();
        assert!(other.open(&ct, &mac).is_err());
    }

    #[test]
    fn display_is_short_hex() {
        let id = PeerIdentity::from_bytes([0xab; 32]);
        assert_eq!(id.to_string(), "abababab");
    }
}
