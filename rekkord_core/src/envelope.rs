//! The per-blob encryption envelope.
//!
//! On disk a blob is an intro followed by a stream of authenticated cipher
//! segments:
//!
//! ```text
//! intro   : version(i8) type(i8) ekey[80] header[24]          = 106 bytes
//! segment : cipher(plain ≤ 32768 ‖ tag(1)) mac[16]
//! ```
//!
//! `ekey` is a sealed box carrying a random 32-byte session key for the
//! repository public key. `header` seeds per-segment nonces: the first 16
//! bytes are used as-is, the last 8 are XOR-ed with the segment counter.
//! Each segment carries a trailing tag byte inside the ciphertext; the last
//! segment is marked FINAL, so truncation is always detected. The plaintext
//! fed to the cipher is the LZ4-framed blob body.

use chacha20poly1305::{
    Key, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, OsRng},
};

use crate::compress::{compress, decompress};
use crate::format::{BLOB_VERSION, BlobType, FormatError};
use crate::sealed::{self, SealError};

/// Upper bound on the plaintext carried by one cipher segment.
pub const BLOB_SPLIT: usize = 32 * 1024;

/// Size of the blob intro: version, type, sealed session key, stream header.
pub const INTRO_SIZE: usize = 2 + EKEY_SIZE + HEADER_SIZE;

const EKEY_SIZE: usize = 32 + sealed::SEAL_OVERHEAD;
const HEADER_SIZE: usize = 24;
const SEGMENT_MAC: usize = 16;
const SEGMENT_OVERHEAD: usize = 1 + SEGMENT_MAC;

const TAG_MESSAGE: u8 = 0;
const TAG_FINAL: u8 = 3;

#[derive(thiserror::Error, Debug)]
pub enum EnvelopeError {
    #[error("unexpected blob version {0} (expected {BLOB_VERSION})")]
    UnknownVersion(i8),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("failed to unseal blob (wrong key?)")]
    Unseal(#[source] SealError),
    #[error("failed to seal blob")]
    Seal(#[source] SealError),
    #[error("failed during symmetric decryption (corrupt blob?)")]
    Decrypt,
    #[error("failed during symmetric encryption")]
    Encrypt,
    #[error("truncated blob")]
    Truncated,
    #[error("blob compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

fn segment_nonce(header: &[u8; HEADER_SIZE], index: u64) -> XNonce {
    let mut nonce = [0u8; HEADER_SIZE];
    nonce[..16].copy_from_slice(&header[..16]);

    let counter = u64::from_le_bytes(header[16..].try_into().unwrap()) ^ index;
    nonce[16..].copy_from_slice(&counter.to_le_bytes());

    XNonce::from(nonce)
}

/// Compresses and encrypts a blob body for the repository public key.
pub fn seal_blob(pkey: &[u8; 32], ty: BlobType, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let compressed = compress(plaintext)?;

    let session = XChaCha20Poly1305::generate_key(&mut OsRng);
    let header: [u8; HEADER_SIZE] = XChaCha20Poly1305::generate_nonce(&mut OsRng).into();

    let ekey = sealed::seal(pkey, session.as_slice()).map_err(EnvelopeError::Seal)?;
    debug_assert_eq!(ekey.len(), EKEY_SIZE);

    let segments = compressed.len() / BLOB_SPLIT + 1;
    let mut out =
        Vec::with_capacity(INTRO_SIZE + compressed.len() + segments * SEGMENT_OVERHEAD);

    out.push(BLOB_VERSION as u8);
    out.push(ty.tag() as u8);
    out.extend_from_slice(&ekey);
    out.extend_from_slice(&header);

    let cipher = XChaCha20Poly1305::new(&session);

    let mut index = 0u64;
    let mut offset = 0;
    loop {
        let end = (offset + BLOB_SPLIT).min(compressed.len());
        let last = end == compressed.len();

        let mut segment = Vec::with_capacity(end - offset + 1);
        segment.extend_from_slice(&compressed[offset..end]);
        segment.push(if last { TAG_FINAL } else { TAG_MESSAGE });

        let sealed = cipher
            .encrypt(&segment_nonce(&header, index), segment.as_slice())
            .map_err(|_| EnvelopeError::Encrypt)?;
        out.extend_from_slice(&sealed);

        if last {
            break;
        }
        offset = end;
        index += 1;
    }

    Ok(out)
}

/// Decrypts and decompresses a blob, returning its type and body.
///
/// The caller still has to verify that the body hashes back to the blob name.
pub fn open_blob(skey: &[u8; 32], data: &[u8]) -> Result<(BlobType, Vec<u8>), EnvelopeError> {
    if data.len() < INTRO_SIZE {
        return Err(EnvelopeError::Truncated);
    }

    let version = data[0] as i8;
    if version != BLOB_VERSION {
        return Err(EnvelopeError::UnknownVersion(version));
    }
    let ty = BlobType::from_tag(data[1] as i8)?;

    let ekey = &data[2..2 + EKEY_SIZE];
    let header: [u8; HEADER_SIZE] = data[2 + EKEY_SIZE..INTRO_SIZE].try_into().unwrap();

    let session = sealed::open(skey, ekey).map_err(EnvelopeError::Unseal)?;
    if session.len() != 32 {
        return Err(EnvelopeError::Decrypt);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&session));

    let mut compressed = Vec::with_capacity(data.len().saturating_sub(INTRO_SIZE));
    let mut remain = &data[INTRO_SIZE..];
    let mut index = 0u64;
    loop {
        if remain.len() < SEGMENT_OVERHEAD {
            return Err(EnvelopeError::Truncated);
        }

        let take = remain.len().min(BLOB_SPLIT + SEGMENT_OVERHEAD);
        let mut segment = cipher
            .decrypt(&segment_nonce(&header, index), &remain[..take])
            .map_err(|_| EnvelopeError::Decrypt)?;

        let tag = segment.pop().ok_or(EnvelopeError::Decrypt)?;
        compressed.extend_from_slice(&segment);

        remain = &remain[take..];
        index += 1;

        match tag {
            TAG_FINAL if remain.is_empty() => break,
            TAG_FINAL => return Err(EnvelopeError::Decrypt),
            TAG_MESSAGE if remain.is_empty() => return Err(EnvelopeError::Truncated),
            TAG_MESSAGE => {}
            _ => return Err(EnvelopeError::Decrypt),
        }
    }

    let plaintext = decompress(&compressed)?;
    Ok((ty, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealed::generate_keypair;
    use rand::{RngCore, SeedableRng, rngs::StdRng};

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    #[test]
    fn round_trip_small() {
        let (skey, pkey) = generate_keypair();

        let sealed = seal_blob(&pkey, BlobType::Chunk, b"hello, world\n").unwrap();
        let (ty, body) = open_blob(&skey, &sealed).unwrap();

        assert_eq!(ty, BlobType::Chunk);
        assert_eq!(body, b"hello, world\n");
    }

    #[test]
    fn round_trip_empty() {
        let (skey, pkey) = generate_keypair();

        let sealed = seal_blob(&pkey, BlobType::File, &[]).unwrap();
        let (ty, body) = open_blob(&skey, &sealed).unwrap();

        assert_eq!(ty, BlobType::File);
        assert!(body.is_empty());
    }

    #[test]
    fn round_trip_multi_segment() {
        let (skey, pkey) = generate_keypair();
        let data = random_bytes(500 * 1024, 11);

        let sealed = seal_blob(&pkey, BlobType::Chunk, &data).unwrap();
        assert!(
            sealed.len() > INTRO_SIZE + BLOB_SPLIT + SEGMENT_OVERHEAD,
            "incompressible data must span several segments"
        );

        let (_, body) = open_blob(&skey, &sealed).unwrap();
        assert_eq!(body, data);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (_, pkey) = generate_keypair();
        let (other_skey, _) = generate_keypair();

        let sealed = seal_blob(&pkey, BlobType::Chunk, b"secret").unwrap();
        assert!(matches!(
            open_blob(&other_skey, &sealed),
            Err(EnvelopeError::Unseal(_))
        ));
    }

    #[test]
    fn bit_flips_are_rejected() {
        let (skey, pkey) = generate_keypair();
        let data = random_bytes(100 * 1024, 23);
        let sealed = seal_blob(&pkey, BlobType::Chunk, &data).unwrap();

        for position in [2, INTRO_SIZE + 10, sealed.len() - 1] {
            let mut corrupt = sealed.clone();
            corrupt[position] ^= 0x40;
            assert!(
                open_blob(&skey, &corrupt).is_err(),
                "flip at {position} must fail"
            );
        }
    }

    #[test]
    fn truncation_is_rejected() {
        let (skey, pkey) = generate_keypair();
        let data = random_bytes(200 * 1024, 37);
        let sealed = seal_blob(&pkey, BlobType::Chunk, &data).unwrap();

        // Cut off the last segment entirely: every earlier tag reads MESSAGE.
        let cut = INTRO_SIZE + BLOB_SPLIT + SEGMENT_OVERHEAD;
        assert!(matches!(
            open_blob(&skey, &sealed[..cut]),
            Err(EnvelopeError::Truncated)
        ));
    }

    #[test]
    fn legacy_snapshot_tag_is_rejected() {
        let (skey, pkey) = generate_keypair();

        let mut sealed = seal_blob(&pkey, BlobType::Snapshot, b"body").unwrap();
        sealed[1] = 3;

        assert!(matches!(
            open_blob(&skey, &sealed),
            Err(EnvelopeError::Format(FormatError::LegacySnapshot))
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let (skey, pkey) = generate_keypair();

        let mut sealed = seal_blob(&pkey, BlobType::Chunk, b"body").unwrap();
        sealed[0] = (BLOB_VERSION + 1) as u8;

        assert!(matches!(
            open_blob(&skey, &sealed),
            Err(EnvelopeError::UnknownVersion(_))
        ));
    }
}
