//! The weight-delta blob codec.
//!
//! Workers submit per-round weight deltas as a compact blob:
//!
//! ```text
//! magic: u8 = 0x01
//! original_size: u32 LE            // decompressed f16 payload size
//! lz4 block (raw, no framing) of the f16 layered payload
//! ```
//!
//! The f16 payload mirrors the [`WeightBank`] layout with 2-byte values:
//!
//! ```text
//! layer_count: u32 LE
//! for each layer, in canonical order:
//!     name_len:   u32 LE
//!     name_utf8:  [u8; name_len]
//!     elem_count: u32 LE
//!     values:     [f16 LE; elem_count]
//! ```
//!
//! A `0x00` magic byte marks the fallback path: the same layered payload,
//! uncompressed and in f32. Decoding always widens to f32.

use std::convert::TryInto;

use anyhow::{anyhow, Context};
use half::f16;

use crate::{
    bank::{Layer, Reader, WeightBank},
    DecodeError,
};

/// Magic byte of the compressed, f16-quantized encoding.
pub const MAGIC_F16_LZ4: u8 = 0x01;
/// Magic byte of the uncompressed f32 fallback encoding.
pub const MAGIC_F32_RAW: u8 = 0x00;

/// Encodes a delta bank into the compressed f16 + LZ4 form.
pub fn encode(bank: &WeightBank) -> Vec<u8> {
    let payload = to_f16_payload(bank);
    let compressed = lz4_flex::block::compress(&payload);
    let mut out = Vec::with_capacity(5 + compressed.len());
    out.push(MAGIC_F16_LZ4);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    out
}

/// Encodes a delta bank into the uncompressed f32 fallback form.
pub fn encode_uncompressed(bank: &WeightBank) -> Vec<u8> {
    let payload = bank.to_bytes();
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(MAGIC_F32_RAW);
    out.extend_from_slice(&payload);
    out
}

/// Decodes a delta blob into an f32 bank.
///
/// # Errors
/// Fails on an unknown magic byte, an LZ4 block that does not decompress to
/// exactly `original_size` bytes, or a malformed layered payload.
pub fn decode(data: &[u8]) -> Result<WeightBank, DecodeError> {
    let (magic, rest) = data
        .split_first()
        .ok_or_else(|| anyhow!("empty delta blob"))?;
    match *magic {
        MAGIC_F32_RAW => WeightBank::from_bytes(rest).context("invalid f32 delta payload"),
        MAGIC_F16_LZ4 => {
            if rest.len() < 4 {
                return Err(anyhow!("delta blob header truncated"));
            }
            let original_size = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
            let payload = lz4_flex::block::decompress(&rest[4..], original_size)
                .map_err(|err| anyhow!("LZ4 block decompression failed: {}", err))?;
            if payload.len() != original_size {
                return Err(anyhow!(
                    "decompressed size mismatch: header says {}, got {}",
                    original_size,
                    payload.len()
                ));
            }
            from_f16_payload(&payload).context("invalid f16 delta payload")
        }
        other => Err(anyhow!("unknown delta blob magic byte 0x{:02x}", other)),
    }
}

fn to_f16_payload(bank: &WeightBank) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bank.total_elements() * 2);
    out.extend_from_slice(&(bank.layers.len() as u32).to_le_bytes());
    for layer in &bank.layers {
        out.extend_from_slice(&(layer.name.len() as u32).to_le_bytes());
        out.extend_from_slice(layer.name.as_bytes());
        out.extend_from_slice(&(layer.values.len() as u32).to_le_bytes());
        for value in &layer.values {
            out.extend_from_slice(&f16::from_f32(*value).to_le_bytes());
        }
    }
    out
}

fn from_f16_payload(data: &[u8]) -> Result<WeightBank, DecodeError> {
    let mut reader = Reader::new(data);
    let layer_count = reader.u32().context("layer count")?;
    let mut layers = Vec::with_capacity(layer_count as usize);
    for index in 0..layer_count {
        let name_len = reader
            .u32()
            .with_context(|| format!("layer {} name length", index))?;
        let name = reader
            .bytes(name_len as usize)
            .with_context(|| format!("layer {} name", index))?;
        let name = std::str::from_utf8(name)
            .with_context(|| format!("layer {} name is not UTF-8", index))?
            .to_string();
        let elem_count = reader
            .u32()
            .with_context(|| format!("layer `{}` element count", name))?;
        let raw = reader
            .bytes(elem_count as usize * 2)
            .with_context(|| format!("layer `{}` values", name))?;
        let values = raw
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes(c.try_into().unwrap()).to_f32())
            .collect();
        layers.push(Layer { name, values });
    }
    reader.finish()?;
    Ok(WeightBank { layers })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WeightBank {
        WeightBank {
            layers: vec![
                Layer {
                    name: "hidden_weight".into(),
                    values: (0..512).map(|i| (i as f32 - 256.0) * 0.003).collect(),
                },
                Layer { name: "hidden_bias".into(), values: vec![0.25, -0.5, 0.0625, 1.0] },
            ],
        }
    }

    /// f16 has a 10-bit mantissa, so the round-trip error per layer is
    /// bounded by `2^-10 * max|v|`.
    #[test]
    fn test_f16_roundtrip_tolerance() {
        let bank = sample();
        let decoded = decode(&encode(&bank)).unwrap();
        for (layer, original) in decoded.layers.iter().zip(bank.layers.iter()) {
            let max = original.values.iter().fold(0f32, |m, v| m.max(v.abs()));
            let bound = max / 1024.0;
            for (got, want) in layer.values.iter().zip(original.values.iter()) {
                assert!(
                    (got - want).abs() <= bound,
                    "layer `{}`: |{} - {}| > {}",
                    layer.name,
                    got,
                    want,
                    bound
                );
            }
        }
    }

    #[test]
    fn test_uncompressed_roundtrip_is_exact() {
        let bank = sample();
        assert_eq!(decode(&encode_uncompressed(&bank)).unwrap(), bank);
    }

    #[test]
    fn test_unknown_magic_rejected() {
        let mut blob = encode(&sample());
        blob[0] = 0x7f;
        assert!(decode(&blob).is_err());
    }

    #[test]
    fn test_empty_blob_rejected() {
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_size_header_mismatch_rejected() {
        let mut blob = encode(&sample());
        // Inflate the declared decompressed size.
        let declared = u32::from_le_bytes([blob[1], blob[2], blob[3], blob[4]]);
        blob[1..5].copy_from_slice(&(declared + 2).to_le_bytes());
        assert!(decode(&blob).is_err());
    }

    #[test]
    fn test_truncated_block_rejected() {
        let blob = encode(&sample());
        assert!(decode(&blob[..blob.len() - 3]).is_err());
    }
}
