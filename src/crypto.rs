//! Hashing and identity-key helpers.
//!
//! The wire protocol hashes everything with double-SHA256; identity keys
//! for the authenticated transport are compressed secp256k1 points.

use crate::types::Hash;
use ripemd::Ripemd160;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Compressed secp256k1 public key.
pub const PUBKEY_SIZE: usize = 33;
/// Compact ECDSA signature.
pub const SIG_SIZE: usize = 64;

/// Version prefix for identity addresses: 0x0f ‖ 0xff 0x01.
const IDENTITY_PREFIX: [u8; 3] = [0x0f, 0xff, 0x01];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid signature")]
    InvalidSignature,
}

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Double-SHA256, the protocol's message digest.
pub fn sha256d(data: &[u8]) -> Hash {
    sha256(&sha256(data))
}

/// First four bytes of the double-SHA256, used as the frame checksum.
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let h = sha256d(data);
    [h[0], h[1], h[2], h[3]]
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(sha256(data)).into()
}

/// Identity keypair for the authenticated transport.
pub struct Identity {
    secp: Secp256k1<All>,
    secret: SecretKey,
    public: PublicKey,
}

impl Identity {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        Self { secp, secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(Self { secp, secret, public })
    }

    pub fn public_key(&self) -> [u8; PUBKEY_SIZE] {
        self.public.serialize()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    /// Compact ECDSA signature over a 32-byte digest.
    pub fn sign(&self, digest: &Hash) -> Result<[u8; SIG_SIZE], CryptoError> {
        let msg =
            Message::from_digest_slice(digest).map_err(|_| CryptoError::InvalidSignature)?;
        let sig = self.secp.sign_ecdsa(&msg, &self.secret);
        Ok(sig.serialize_compact())
    }

    /// ECDH against a compressed peer public key.
    pub fn ecdh(&self, peer: &[u8; PUBKEY_SIZE]) -> Result<Hash, CryptoError> {
        let pk = PublicKey::from_slice(peer).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(SharedSecret::new(&pk, &self.secret).secret_bytes())
    }
}

/// Verify a compact signature against a compressed public key.
pub fn verify(
    pubkey: &[u8; PUBKEY_SIZE],
    digest: &Hash,
    signature: &[u8; SIG_SIZE],
) -> Result<(), CryptoError> {
    let secp = Secp256k1::verification_only();
    let pk = PublicKey::from_slice(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let msg = Message::from_digest_slice(digest).map_err(|_| CryptoError::InvalidSignature)?;
    let sig = secp256k1::ecdsa::Signature::from_compact(signature)
        .map_err(|_| CryptoError::InvalidSignature)?;
    secp.verify_ecdsa(&msg, &sig, &pk)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Base58Check address for an identity key:
/// `base58(prefix ‖ hash160(pubkey) ‖ checksum4)`.
pub fn identity_address(pubkey: &[u8; PUBKEY_SIZE]) -> String {
    let mut data = Vec::with_capacity(3 + 20 + 4);
    data.extend_from_slice(&IDENTITY_PREFIX);
    data.extend_from_slice(&hash160(pubkey));
    let check = checksum(&data);
    data.extend_from_slice(&check);
    bs58::encode(data).into_string()
}

/// Decode an identity address back into its key hash; checks the checksum.
pub fn decode_identity_address(addr: &str) -> Option<[u8; 20]> {
    let data = bs58::decode(addr).into_vec().ok()?;
    if data.len() != 3 + 20 + 4 || data[..3] != IDENTITY_PREFIX {
        return None;
    }
    let (body, check) = data.split_at(3 + 20);
    if checksum(body) != check[..4] {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&body[3..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_known_vector() {
        // sha256d("hello")
        let h = sha256d(b"hello");
        assert_eq!(
            hex::encode(h),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn sign_verify_round_trip() {
        let id = Identity::generate();
        let digest = sha256d(b"challenge");
        let sig = id.sign(&digest).unwrap();
        assert!(verify(&id.public_key(), &digest, &sig).is_ok());

        let mut bad = sig;
        bad[10] ^= 0x40;
        assert!(verify(&id.public_key(), &digest, &bad).is_err());
    }

    #[test]
    fn ecdh_agrees() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_eq!(a.ecdh(&b.public_key()).unwrap(), b.ecdh(&a.public_key()).unwrap());
    }

    #[test]
    fn identity_address_round_trip() {
        let id = Identity::generate();
        let pubkey = id.public_key();
        let addr = identity_address(&pubkey);
        assert_eq!(decode_identity_address(&addr), Some(hash160(&pubkey)));

        // Corrupt one character: checksum must catch it.
        let mut chars: Vec<char> = addr.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let bad: String = chars.into_iter().collect();
        assert_eq!(decode_identity_address(&bad), None);
    }
}
