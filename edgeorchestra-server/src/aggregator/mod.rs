//! Sample-weighted federated averaging of submitted weight deltas.
//!
//! Every accepted submission carries an encoded delta blob (post − pre
//! weights, quantized and compressed). The aggregator decodes each blob,
//! rejects any whose layer set disagrees with the job's architecture,
//! computes the per-layer weighted mean
//! `Δ̄_l = Σ_i n_i · Δ_{i,l} / Σ_i n_i`, and applies it flat onto the round's
//! global model. Accumulation happens in f64; the produced bank is f32.
//!
//! Summation order is fixed by device id so that replicas aggregating the
//! same round produce bit-identical results.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use edgeorchestra_core::{
    architecture::Architecture,
    bank::{Layer, LayerMismatch, WeightBank},
    delta,
    DeviceId,
};

use crate::coordinator::job::Submission;

/// Metric keys the aggregator folds into round telemetry.
const LOSS_KEY: &str = "loss";
const ACCURACY_KEY: &str = "accuracy";

/// An error that aborts the round.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("no submission carried any training samples")]
    ZeroSamples,
    #[error("the global model does not match the job architecture: {0}")]
    GlobalModelMismatch(#[from] LayerMismatch),
    #[error("the global model artifact could not be decoded: {0}")]
    GlobalModelUndecodable(edgeorchestra_core::DecodeError),
}

/// The product of a successful aggregation.
#[derive(Debug)]
pub struct AggregateOutcome {
    /// The next global model.
    pub bank: WeightBank,
    /// Sample-weighted mean of submitted `loss` metrics.
    pub avg_loss: Option<f64>,
    /// Sample-weighted mean of submitted `accuracy` metrics.
    pub avg_accuracy: Option<f64>,
    /// L2 norm of the concatenated mean delta.
    pub delta_norm: f64,
    pub accepted: Vec<DeviceId>,
    /// Submissions dropped because their blob was undecodable or did not
    /// match the architecture.
    pub rejected: Vec<DeviceId>,
    pub total_samples: u64,
}

/// A sample-weighted running mean over one metric key.
#[derive(Default)]
struct WeightedMean {
    sum: f64,
    weight: f64,
}

impl WeightedMean {
    fn add(&mut self, value: f64, weight: f64) {
        self.sum += value * weight;
        self.weight += weight;
    }

    fn mean(&self) -> Option<f64> {
        if self.weight > 0.0 {
            Some(self.sum / self.weight)
        } else {
            None
        }
    }
}

/// Aggregates one round of submissions onto `global_bytes`, the encoded
/// current global model.
///
/// CPU-bound; callers run it on a blocking worker.
pub fn aggregate(
    global_bytes: &[u8],
    arch: &Architecture,
    submissions: &[Submission],
) -> Result<AggregateOutcome, AggregationError> {
    let global =
        WeightBank::from_bytes(global_bytes).map_err(AggregationError::GlobalModelUndecodable)?;
    global.check_architecture(arch)?;

    // Deterministic summation order across replicas.
    let ordered: BTreeMap<DeviceId, &Submission> =
        submissions.iter().map(|s| (s.device_id, s)).collect();

    let mut acc: Vec<Vec<f64>> = arch.layers.iter().map(|l| vec![0.0; l.elements]).collect();
    let mut total_samples: u64 = 0;
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut loss = WeightedMean::default();
    let mut accuracy = WeightedMean::default();

    for (device_id, submission) in ordered {
        let deltas = match delta::decode(&submission.blob) {
            Ok(deltas) => deltas,
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "rejecting undecodable delta blob");
                rejected.push(device_id);
                continue;
            }
        };
        if let Err(err) = deltas.check_architecture(arch) {
            warn!(device_id = %device_id, error = %err, "rejecting delta blob with mismatched layers");
            rejected.push(device_id);
            continue;
        }
        if submission.num_samples == 0 {
            warn!(device_id = %device_id, "rejecting submission without training samples");
            rejected.push(device_id);
            continue;
        }

        let weight = f64::from(submission.num_samples);
        for (layer_acc, layer) in acc.iter_mut().zip(deltas.layers.iter()) {
            for (slot, value) in layer_acc.iter_mut().zip(layer.values.iter()) {
                *slot += weight * f64::from(*value);
            }
        }
        total_samples += u64::from(submission.num_samples);
        if let Some(value) = submission.metrics.get(LOSS_KEY) {
            loss.add(*value, weight);
        }
        if let Some(value) = submission.metrics.get(ACCURACY_KEY) {
            accuracy.add(*value, weight);
        }
        accepted.push(device_id);
        debug!(device_id = %device_id, num_samples = submission.num_samples, "delta accepted");
    }

    if total_samples == 0 {
        return Err(AggregationError::ZeroSamples);
    }

    let total = total_samples as f64;
    let mut delta_norm_sq = 0.0;
    let mean = WeightBank {
        layers: arch
            .layers
            .iter()
            .zip(acc.into_iter())
            .map(|(spec, sums)| Layer {
                name: spec.name.to_string(),
                values: sums
                    .into_iter()
                    .map(|sum| {
                        let mean = sum / total;
                        delta_norm_sq += mean * mean;
                        mean as f32
                    })
                    .collect(),
            })
            .collect(),
    };

    let mut bank = global;
    bank.add_assign(&mean)?;

    info!(
        accepted = accepted.len(),
        rejected = rejected.len(),
        total_samples,
        "round aggregated"
    );

    Ok(AggregateOutcome {
        bank,
        avg_loss: loss.mean(),
        avg_accuracy: accuracy.mean(),
        delta_norm: delta_norm_sq.sqrt(),
        accepted,
        rejected,
        total_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgeorchestra_core::{architecture, JobId};

    fn tiny_arch() -> Architecture {
        Architecture {
            key: "tiny",
            display_name: "tiny",
            input_shape: &[2],
            num_classes: 2,
            layers: vec![
                edgeorchestra_core::architecture::LayerSpec { name: "w", elements: 2 },
                edgeorchestra_core::architecture::LayerSpec { name: "b", elements: 1 },
            ],
        }
    }

    fn bank(w: [f32; 2], b: f32) -> WeightBank {
        WeightBank {
            layers: vec![
                Layer { name: "w".into(), values: w.to_vec() },
                Layer { name: "b".into(), values: vec![b] },
            ],
        }
    }

    fn submission(job_id: JobId, bank: &WeightBank, num_samples: u32) -> Submission {
        Submission {
            device_id: DeviceId::generate(),
            job_id,
            round: 1,
            blob: delta::encode_uncompressed(bank),
            num_samples,
            metrics: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_single_participant_adds_its_delta() {
        let arch = tiny_arch();
        let global = bank([1.0, 2.0], 3.0);
        let delta = bank([0.5, -0.5], 0.25);
        let subs = vec![submission(JobId::generate(), &delta, 10)];

        let outcome = aggregate(&global.to_bytes(), &arch, &subs).unwrap();
        assert_eq!(outcome.bank, bank([1.5, 1.5], 3.25));
        assert_eq!(outcome.total_samples, 10);
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[test]
    fn test_sample_weighted_mean() {
        let arch = tiny_arch();
        let global = bank([0.0, 0.0], 0.0);
        let job = JobId::generate();
        // 3 samples of +1.0 and 1 sample of -1.0: mean delta = 0.5.
        let subs = vec![
            submission(job, &bank([1.0, 1.0], 1.0), 3),
            submission(job, &bank([-1.0, -1.0], -1.0), 1),
        ];

        let outcome = aggregate(&global.to_bytes(), &arch, &subs).unwrap();
        assert_eq!(outcome.bank, bank([0.5, 0.5], 0.5));
        assert_eq!(outcome.total_samples, 4);
        let expected_norm = (3.0 * 0.25f64).sqrt();
        assert!((outcome.delta_norm - expected_norm).abs() < 1e-9);
    }

    #[test]
    fn test_mismatched_blob_is_rejected_round_continues() {
        let arch = tiny_arch();
        let global = bank([0.0, 0.0], 0.0);
        let job = JobId::generate();

        let mut wrong = bank([1.0, 1.0], 1.0);
        wrong.layers[0].values.push(7.0);

        let subs = vec![
            submission(job, &bank([1.0, 1.0], 1.0), 2),
            submission(job, &wrong, 2),
        ];
        let outcome = aggregate(&global.to_bytes(), &arch, &subs).unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.bank, bank([1.0, 1.0], 1.0));
    }

    #[test]
    fn test_zero_samples_aborts() {
        let arch = tiny_arch();
        let global = bank([0.0, 0.0], 0.0);
        let subs = vec![submission(JobId::generate(), &bank([1.0, 1.0], 1.0), 0)];
        assert!(matches!(
            aggregate(&global.to_bytes(), &arch, &subs),
            Err(AggregationError::ZeroSamples)
        ));
        assert!(matches!(
            aggregate(&global.to_bytes(), &arch, &[]),
            Err(AggregationError::ZeroSamples)
        ));
    }

    #[test]
    fn test_weighted_metrics() {
        let arch = tiny_arch();
        let global = bank([0.0, 0.0], 0.0);
        let job = JobId::generate();

        let mut first = submission(job, &bank([0.0, 0.0], 0.0), 3);
        first.metrics.insert("loss".into(), 1.0);
        first.metrics.insert("accuracy".into(), 0.9);
        let mut second = submission(job, &bank([0.0, 0.0], 0.0), 1);
        second.metrics.insert("loss".into(), 2.0);

        let outcome = aggregate(&global.to_bytes(), &arch, &[first, second]).unwrap();
        assert!((outcome.avg_loss.unwrap() - 1.25).abs() < 1e-9);
        // Only one submission reported accuracy; its value carries through.
        assert!((outcome.avg_accuracy.unwrap() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_global_model_must_match_architecture() {
        let arch = architecture::get("mnist").unwrap();
        let global = bank([0.0, 0.0], 0.0);
        let subs = vec![submission(JobId::generate(), &bank([1.0, 1.0], 1.0), 1)];
        assert!(matches!(
            aggregate(&global.to_bytes(), arch, &subs),
            Err(AggregationError::GlobalModelMismatch(_))
        ));
    }

    /// Single participant with the compressed encoding: the produced global
    /// equals `prev + delta` within f16 round-trip tolerance.
    #[test]
    fn test_single_participant_f16_tolerance() {
        let arch = tiny_arch();
        let global = bank([1.0, -1.0], 0.5);
        let delta = bank([0.123, -0.456], 0.789);
        let mut sub = submission(JobId::generate(), &delta, 5);
        sub.blob = edgeorchestra_core::delta::encode(&delta);

        let outcome = aggregate(&global.to_bytes(), &arch, &[sub]).unwrap();
        let expected = bank([1.123, -1.456], 1.289);
        for (got, want) in outcome.bank.layers.iter().zip(expected.layers.iter()) {
            for (g, w) in got.values.iter().zip(want.values.iter()) {
                assert!((g - w).abs() <= w.abs() / 1024.0 + 1e-6);
            }
        }
    }
}
