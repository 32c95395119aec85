//! LZ4 frame compression around blob bodies.
//!
//! Compression runs on plaintext only, before the cipher layer sees it.

use std::io::{self, Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = FrameEncoder::new(Vec::with_capacity(data.len() / 2 + 64));
    encoder.write_all(data)?;
    encoder.finish().map_err(io::Error::other)
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    FrameDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data: Vec<u8> = (0..100_000u32).flat_map(|i| (i % 251) .to_le_bytes()).collect();

        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len(), "repetitive data must shrink");

        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn empty_round_trip() {
        let packed = compress(&[]).unwrap();
        assert_eq!(decompress(&packed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decompress(b"definitely not an lz4 frame").is_err());
    }
}
