//! Password-wrapped key records and sealed repository secrets.
//!
//! A key record wraps one 32-byte asymmetric key half under a password:
//! `salt[16] ‖ nonce[24] ‖ cipher[32 + 16]`, with the symmetric key derived
//! by Argon2id. Secrets are small versioned objects encrypted under the
//! repository public key bytes used as a symmetric key:
//! `version(i8) ‖ nonce[24] ‖ cipher`.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    Key, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, OsRng},
};

pub const KEY_RECORD_SIZE: usize = 16 + 24 + 32 + 16;
pub const SECRET_VERSION: i8 = 1;

const SECRET_HEAD_SIZE: usize = 1 + 24;

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("malformed key record")]
    MalformedRecord,
    #[error("malformed secret object")]
    MalformedSecret,
    #[error("unexpected secret version {0} (expected {SECRET_VERSION})")]
    UnknownSecretVersion(i8),
    #[error("failed to derive key from password")]
    Derive,
    #[error("wrong password")]
    WrongPassword,
    #[error("failed to decrypt secret")]
    Decrypt,
    #[error("failed to encrypt payload")]
    Encrypt,
}

/// Argon2id with libsodium's interactive cost parameters.
fn derive_password_key(password: &str, salt: &[u8; 16]) -> Result<[u8; 32], KeyError> {
    let params = Params::new(64 * 1024, 2, 1, Some(32)).map_err(|_| KeyError::Derive)?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|_| KeyError::Derive)?;
    Ok(key)
}

/// Wraps one asymmetric key half under a password.
pub fn wrap_key(password: &str, payload: &[u8; 32]) -> Result<Vec<u8>, KeyError> {
    let salt: [u8; 16] = {
        let long: [u8; 24] = XChaCha20Poly1305::generate_nonce(&mut OsRng).into();
        long[..16].try_into().unwrap()
    };
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let key = derive_password_key(password, &salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let sealed = cipher
        .encrypt(&nonce, payload.as_slice())
        .map_err(|_| KeyError::Encrypt)?;

    let mut record = Vec::with_capacity(KEY_RECORD_SIZE);
    record.extend_from_slice(&salt);
    record.extend_from_slice(&nonce);
    record.extend_from_slice(&sealed);
    debug_assert_eq!(record.len(), KEY_RECORD_SIZE);

    Ok(record)
}

/// Unwraps a key record. Fails with [`KeyError::WrongPassword`] when the
/// password does not match, which callers use to probe write vs full records.
pub fn unwrap_key(password: &str, record: &[u8]) -> Result<[u8; 32], KeyError> {
    if record.len() != KEY_RECORD_SIZE {
        return Err(KeyError::MalformedRecord);
    }

    let salt: [u8; 16] = record[..16].try_into().unwrap();
    let nonce = XNonce::from_slice(&record[16..40]);

    let key = derive_password_key(password, &salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let payload = cipher
        .decrypt(nonce, &record[40..])
        .map_err(|_| KeyError::WrongPassword)?;

    payload.try_into().map_err(|_| KeyError::MalformedRecord)
}

/// Encrypts a small secret object under a 32-byte symmetric key.
pub fn seal_secret(key: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>, KeyError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let sealed = cipher
        .encrypt(&nonce, payload)
        .map_err(|_| KeyError::Encrypt)?;

    let mut out = Vec::with_capacity(SECRET_HEAD_SIZE + sealed.len());
    out.push(SECRET_VERSION as u8);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);

    Ok(out)
}

pub fn open_secret(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, KeyError> {
    if data.len() < SECRET_HEAD_SIZE {
        return Err(KeyError::MalformedSecret);
    }

    let version = data[0] as i8;
    if version != SECRET_VERSION {
        return Err(KeyError::UnknownSecretVersion(version));
    }
    let nonce = XNonce::from_slice(&data[1..SECRET_HEAD_SIZE]);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(nonce, &data[SECRET_HEAD_SIZE..])
        .map_err(|_| KeyError::Decrypt)
}
