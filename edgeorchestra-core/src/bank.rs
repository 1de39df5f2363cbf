//! The layered weight bank and its binary layout.
//!
//! A [`WeightBank`] is an ordered set of named f32 tensors, flattened. It is
//! the in-memory form of both a model artifact and a decoded weight delta.
//!
//! Binary layout (all integers little endian):
//!
//! ```text
//! layer_count: u32
//! for each layer, in canonical order:
//!     name_len:   u32
//!     name_utf8:  [u8; name_len]
//!     elem_count: u32
//!     values:     [f32 LE; elem_count]
//! ```

use std::convert::TryInto;

use anyhow::{anyhow, Context};

use crate::{architecture::Architecture, DecodeError};

/// A single named, flattened tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub values: Vec<f32>,
}

/// An ordered set of named f32 tensors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeightBank {
    pub layers: Vec<Layer>,
}

/// An error raised when two banks or a bank and an architecture disagree on
/// the layer set.
#[derive(thiserror::Error, Debug)]
pub enum LayerMismatch {
    #[error("expected {expected} layers, got {actual}")]
    Count { expected: usize, actual: usize },
    #[error("layer {index}: expected `{expected}`, got `{actual}`")]
    Name {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("layer `{name}`: expected {expected} elements, got {actual}")]
    Elements {
        name: String,
        expected: usize,
        actual: usize,
    },
}

impl WeightBank {
    /// The total number of elements across all layers.
    pub fn total_elements(&self) -> usize {
        self.layers.iter().map(|l| l.values.len()).sum()
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Checks that this bank carries exactly the architecture's canonical
    /// layers, in order and with the declared element counts.
    pub fn check_architecture(&self, arch: &Architecture) -> Result<(), LayerMismatch> {
        if self.layers.len() != arch.layers.len() {
            return Err(LayerMismatch::Count {
                expected: arch.layers.len(),
                actual: self.layers.len(),
            });
        }
        for (index, (layer, spec)) in self.layers.iter().zip(arch.layers.iter()).enumerate() {
            if layer.name != spec.name {
                return Err(LayerMismatch::Name {
                    index,
                    expected: spec.name.to_string(),
                    actual: layer.name.clone(),
                });
            }
            if layer.values.len() != spec.elements {
                return Err(LayerMismatch::Elements {
                    name: layer.name.clone(),
                    expected: spec.elements,
                    actual: layer.values.len(),
                });
            }
        }
        Ok(())
    }

    /// Adds `delta` to this bank element-wise. Both banks must agree on the
    /// layer set and element counts.
    pub fn add_assign(&mut self, delta: &WeightBank) -> Result<(), LayerMismatch> {
        if self.layers.len() != delta.layers.len() {
            return Err(LayerMismatch::Count {
                expected: self.layers.len(),
                actual: delta.layers.len(),
            });
        }
        for (index, (layer, other)) in self.layers.iter_mut().zip(delta.layers.iter()).enumerate() {
            if layer.name != other.name {
                return Err(LayerMismatch::Name {
                    index,
                    expected: layer.name.clone(),
                    actual: other.name.clone(),
                });
            }
            if layer.values.len() != other.values.len() {
                return Err(LayerMismatch::Elements {
                    name: layer.name.clone(),
                    expected: layer.values.len(),
                    actual: other.values.len(),
                });
            }
            for (value, delta) in layer.values.iter_mut().zip(other.values.iter()) {
                *value += delta;
            }
        }
        Ok(())
    }

    /// Serializes this bank into the layered f32 layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.total_elements() * 4);
        out.extend_from_slice(&(self.layers.len() as u32).to_le_bytes());
        for layer in &self.layers {
            out.extend_from_slice(&(layer.name.len() as u32).to_le_bytes());
            out.extend_from_slice(layer.name.as_bytes());
            out.extend_from_slice(&(layer.values.len() as u32).to_le_bytes());
            for value in &layer.values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }

    /// Deserializes a bank from the layered f32 layout.
    ///
    /// # Errors
    /// Fails if any length field points past the end of the buffer, a layer
    /// name is not UTF-8, or trailing bytes remain.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data);
        let layer_count = reader.u32().context("invalid weight bank: layer count")?;
        let mut layers = Vec::with_capacity(layer_count as usize);
        for index in 0..layer_count {
            let name_len = reader
                .u32()
                .with_context(|| format!("invalid weight bank: layer {} name length", index))?;
            let name = reader
                .bytes(name_len as usize)
                .with_context(|| format!("invalid weight bank: layer {} name", index))?;
            let name = std::str::from_utf8(name)
                .with_context(|| format!("invalid weight bank: layer {} name is not UTF-8", index))?
                .to_string();
            let elem_count = reader
                .u32()
                .with_context(|| format!("invalid weight bank: layer `{}` element count", name))?;
            let raw = reader
                .bytes(elem_count as usize * 4)
                .with_context(|| format!("invalid weight bank: layer `{}` values", name))?;
            let values = raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            layers.push(Layer { name, values });
        }
        reader.finish().context("invalid weight bank")?;
        Ok(Self { layers })
    }

    /// Creates a zero-initialized bank with the architecture's canonical
    /// layers.
    pub fn zeroed(arch: &Architecture) -> Self {
        Self {
            layers: arch
                .layers
                .iter()
                .map(|spec| Layer {
                    name: spec.name.to_string(),
                    values: vec![0.0; spec.elements],
                })
                .collect(),
        }
    }
}

/// A bounds-checked little-endian reader.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| anyhow!("length overflow"))?;
        if end > self.data.len() {
            return Err(anyhow!(
                "truncated: need {} bytes at offset {}, buffer has {}",
                len,
                self.offset,
                self.data.len()
            ));
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        if self.offset != self.data.len() {
            return Err(anyhow!(
                "{} trailing bytes after payload",
                self.data.len() - self.offset
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture;

    fn sample() -> WeightBank {
        WeightBank {
            layers: vec![
                Layer { name: "w".into(), values: vec![0.5, -1.25, 3.0] },
                Layer { name: "b".into(), values: vec![0.125] },
            ],
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let bank = sample();
        assert_eq!(WeightBank::from_bytes(&bank.to_bytes()).unwrap(), bank);
    }

    #[test]
    fn test_truncated_rejected() {
        let mut bytes = sample().to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(WeightBank::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_trailing_rejected() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert!(WeightBank::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_add_assign() {
        let mut bank = sample();
        let delta = sample();
        bank.add_assign(&delta).unwrap();
        assert_eq!(bank.layers[0].values, vec![1.0, -2.5, 6.0]);
        assert_eq!(bank.layers[1].values, vec![0.25]);
    }

    #[test]
    fn test_add_assign_mismatch() {
        let mut bank = sample();
        let mut delta = sample();
        delta.layers[1].values.push(1.0);
        assert!(matches!(
            bank.add_assign(&delta),
            Err(LayerMismatch::Elements { .. })
        ));
    }

    #[test]
    fn test_check_architecture() {
        let arch = architecture::get("mnist").unwrap();
        let bank = WeightBank::zeroed(arch);
        assert!(bank.check_architecture(arch).is_ok());

        let mut wrong = bank.clone();
        wrong.layers[0].values.pop();
        assert!(wrong.check_architecture(arch).is_err());

        let mut renamed = bank;
        renamed.layers[0].name = "first_weight".into();
        assert!(renamed.check_architecture(arch).is_err());
    }
}
