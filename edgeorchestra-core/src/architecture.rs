//! Registry of supported model architectures.
//!
//! The canonical layer order of an architecture fixes the layout of every
//! weight bank and delta blob exchanged for it: layer `i` of a payload must be
//! layer `i` of the architecture, with exactly the declared element count.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use thiserror::Error;

/// A single trainable layer: its canonical name and flattened element count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub name: &'static str,
    pub elements: usize,
}

/// A supported model architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Architecture {
    /// Stable key used in job specs and `start_training` commands.
    pub key: &'static str,
    pub display_name: &'static str,
    pub input_shape: &'static [usize],
    pub num_classes: usize,
    /// Layers in canonical order.
    pub layers: Vec<LayerSpec>,
}

impl Architecture {
    /// The total number of trainable elements across all layers.
    pub fn total_elements(&self) -> usize {
        self.layers.iter().map(|l| l.elements).sum()
    }
}

#[derive(Error, Debug)]
#[error("unknown architecture `{0}`")]
pub struct UnknownArchitecture(pub String);

static REGISTRY: Lazy<HashMap<&'static str, Architecture>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "mnist",
        Architecture {
            key: "mnist",
            display_name: "MNIST classifier (784-128-10)",
            input_shape: &[1, 28, 28],
            num_classes: 10,
            layers: vec![
                LayerSpec { name: "hidden_weight", elements: 128 * 784 },
                LayerSpec { name: "hidden_bias", elements: 128 },
                LayerSpec { name: "output_weight", elements: 10 * 128 },
                LayerSpec { name: "output_bias", elements: 10 },
            ],
        },
    );
    map.insert(
        "cifar10",
        Architecture {
            key: "cifar10",
            display_name: "CIFAR-10 classifier (3072-256-128-10)",
            input_shape: &[3, 32, 32],
            num_classes: 10,
            layers: vec![
                LayerSpec { name: "hidden1_weight", elements: 256 * 3072 },
                LayerSpec { name: "hidden1_bias", elements: 256 },
                LayerSpec { name: "hidden2_weight", elements: 128 * 256 },
                LayerSpec { name: "hidden2_bias", elements: 128 },
                LayerSpec { name: "output_weight", elements: 10 * 128 },
                LayerSpec { name: "output_bias", elements: 10 },
            ],
        },
    );
    map
});

/// Looks up an architecture by key.
pub fn get(key: &str) -> Result<&'static Architecture, UnknownArchitecture> {
    REGISTRY
        .get(key)
        .ok_or_else(|| UnknownArchitecture(key.to_string()))
}

/// All registered architectures.
pub fn list() -> impl Iterator<Item = &'static Architecture> {
    REGISTRY.values()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_architectures() {
        assert_eq!(get("mnist").unwrap().layers.len(), 4);
        assert_eq!(get("cifar10").unwrap().layers.len(), 6);
        assert!(get("resnet50").is_err());
    }

    #[test]
    fn test_canonical_order_is_stable() {
        let names: Vec<_> = get("mnist").unwrap().layers.iter().map(|l| l.name).collect();
        assert_eq!(
            names,
            vec!["hidden_weight", "hidden_bias", "output_weight", "output_bias"]
        );
    }

    #[test]
    fn test_total_elements() {
        assert_eq!(get("mnist").unwrap().total_elements(), 128 * 784 + 128 + 10 * 128 + 10);
    }
}
