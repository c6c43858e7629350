//! Magic-prefixed compression for stored parameter blobs.
//!
//! Compressed payloads are written as `MAGIC || gzip(data)`. `decompress`
//! recognizes the prefix and falls back to treating the input as
//! uncompressed legacy data when it's absent, so rows written before
//! compression was enabled keep reading back correctly.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

pub const MAGIC: &[u8; 4] = b"FTZ$";

pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    // An in-memory Vec writer never fails.
    encoder.write_all(data).expect("in-memory gzip write cannot fail");
    let body = encoder.finish().expect("in-memory gzip finish cannot fail");
    let mut out = Vec::with_capacity(MAGIC.len() + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&body);
    out
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    if let Some(body) = data.strip_prefix(MAGIC) {
        let mut decoder = GzDecoder::new(body);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let original = b"{\"hello\":\"world\",\"n\":42}".to_vec();
        let compressed = compress(&original);
        assert!(compressed.starts_with(MAGIC));
        let restored = decompress(&compressed).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn legacy_uncompressed_data_passes_through() {
        let legacy = b"{\"already\":\"plain\"}".to_vec();
        let restored = decompress(&legacy).unwrap();
        assert_eq!(restored, legacy);
    }

    #[test]
    fn empty_input_round_trips() {
        let compressed = compress(&[]);
        let restored = decompress(&compressed).unwrap();
        assert!(restored.is_empty());
    }
}
