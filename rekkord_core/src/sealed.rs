//! Anonymous sealed boxes to the repository public key.
//!
//! A fresh X25519 key pair is generated per seal; the shared secret with the
//! recipient key is stretched into an XChaCha20-Poly1305 key and nonce, and
//! the ephemeral public key is prepended to the ciphertext. Anyone holding
//! the public key can seal, only the secret key holder can open.
//!
//! Wire layout: `epk[32] ‖ cipher(payload) ‖ mac[16]`.

use chacha20poly1305::{
    Key, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, OsRng},
};
use x25519_dalek::{PublicKey, StaticSecret};

/// Bytes added on top of the payload: ephemeral public key plus MAC.
pub const SEAL_OVERHEAD: usize = 32 + 16;

const SEAL_KEY_CONTEXT: &str = "rekkord v7 sealed box key";
const SEAL_NONCE_CONTEXT: &str = "rekkord v7 sealed box nonce";

#[derive(thiserror::Error, Debug)]
pub enum SealError {
    #[error("malformed sealed box")]
    Malformed,
    #[error("failed to seal payload")]
    Seal,
    #[error("failed to open sealed box (wrong key?)")]
    Open,
}

/// Generates a fresh repository key pair, returned as `(skey, pkey)`.
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(&mut OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), *public.as_bytes())
}

/// Derives the public half from a secret key.
pub fn derive_public_key(secret: &[u8; 32]) -> [u8; 32] {
    *PublicKey::from(&StaticSecret::from(*secret)).as_bytes()
}

fn session_material(shared: &[u8; 32], epk: &[u8; 32], rpk: &[u8; 32]) -> ([u8; 32], [u8; 24]) {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(epk);
    material[64..].copy_from_slice(rpk);

    let key = blake3::derive_key(SEAL_KEY_CONTEXT, &material);
    let long_nonce = blake3::derive_key(SEAL_NONCE_CONTEXT, &material);

    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&long_nonce[..24]);

    (key, nonce)
}

pub fn seal(recipient: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>, SealError> {
    let ephemeral = StaticSecret::random_from_rng(&mut OsRng);
    let epk = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));

    let (key, nonce) = session_material(shared.as_bytes(), epk.as_bytes(), recipient);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), payload)
        .map_err(|_| SealError::Seal)?;

    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(epk.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn open(secret: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(SealError::Malformed);
    }

    let mut epk = [0u8; 32];
    epk.copy_from_slice(&sealed[..32]);

    let secret = StaticSecret::from(*secret);
    let rpk = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&PublicKey::from(epk));

    let (key, nonce) = session_material(shared.as_bytes(), &epk, rpk.as_bytes());
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

    cipher
        .decrypt(XNonce::from_slice(&nonce), &sealed[32..])
        .map_err(|_| SealError::Open)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let (skey, pkey) = generate_keypair();
        let payload = [0x5au8; 32];

        let sealed = seal(&pkey, &payload).unwrap();
        assert_eq!(sealed.len(), payload.len() + SEAL_OVERHEAD);

        let opened = open(&skey, &sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn wrong_key_fails() {
        let (_, pkey) = generate_keypair();
        let (other_skey, _) = generate_keypair();

        let sealed = seal(&pkey, b"payload").unwrap();
        assert!(matches!(open(&other_skey, &sealed), Err(SealError::Open)));
    }

    #[test]
    fn tampered_box_fails() {
        let (skey, pkey) = generate_keypair();

        let mut sealed = seal(&pkey, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(open(&skey, &sealed).is_err());
    }

    #[test]
    fn public_key_derivation_matches_keypair() {
        let (skey, pkey) = generate_keypair();
        assert_eq!(derive_public_key(&skey), pkey);
    }
}
