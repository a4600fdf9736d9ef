use std::collections::HashMap;

use comms::specs::{job::JobId, worker::WorkerId};
use log::warn;
use rayon::prelude::*;

/// One worker's partial result for a round.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub sample_count: u64,
    pub delta: Vec<f32>,
}

/// The merged update produced by one aggregation.
#[derive(Debug, Clone)]
pub struct Merged {
    pub delta: Vec<f32>,
    pub contributors: Vec<WorkerId>,
    pub total_samples: u64,
}

/// Sample-weighted federated averaging over the contributed deltas.
///
/// Malformed contributions (empty or odd-length deltas, zero samples,
/// non-finite values) are dropped and the merge proceeds with the rest.
/// Returns `None` when nothing valid remains, which the caller must treat as
/// a failed round.
pub fn aggregate(contributions: &[Contribution]) -> Option<Merged> {
    // The coordinator never learns the model's parameter count, so the
    // reference length is the most common one among the candidates.
    let mut length_votes: HashMap<usize, usize> = HashMap::new();
    for contribution in contributions {
        if contribution.sample_count > 0 && !contribution.delta.is_empty() {
            *length_votes.entry(contribution.delta.len()).or_default() += 1;
        }
    }
    let reference_len = length_votes
        .into_iter()
        .max_by_key(|&(_, votes)| votes)
        .map(|(len, _)| len)?;

    let valid: Vec<&Contribution> = contributions
        .iter()
        .filter(|c| {
            if c.sample_count == 0 {
                warn!(worker_id = c.worker_id.to_string(); "dropping zero-sample contribution");
                return false;
            }
            if c.delta.len() != reference_len {
                warn!(
                    worker_id = c.worker_id.to_string(), got = c.delta.len(), expected = reference_len;
                    "dropping contribution with mismatched delta length"
                );
                return false;
            }
            if c.delta.iter().any(|v| !v.is_finite()) {
                warn!(worker_id = c.worker_id.to_string(); "dropping non-finite contribution");
                return false;
            }
            true
        })
        .collect();

    if valid.is_empty() {
        return None;
    }

    let total_samples: u64 = valid.iter().map(|c| c.sample_count).sum();
    let mut merged = vec![0.0f32; reference_len];

    for contribution in &valid {
        let weight = contribution.sample_count as f32 / total_samples as f32;

        merged
            .par_iter_mut()
            .zip(contribution.delta.par_iter())
            .for_each(|(acc, value)| *acc += value * weight);
    }

    Some(Merged {
        delta: merged,
        contributors: valid.iter().map(|c| c.worker_id).collect(),
        total_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(samples: u64, delta: Vec<f32>) -> Contribution {
        Contribution {
            worker_id: WorkerId::new(),
            job_id: JobId::new(),
            sample_count: samples,
            delta,
        }
    }

    #[test]
    fn merge_is_sample_weighted() {
        let merged = aggregate(&[
            contribution(1, vec![1.0, 0.0]),
            contribution(3, vec![5.0, 4.0]),
        ])
        .unwrap();

        // (1*1 + 5*3) / 4 = 4.0, (0*1 + 4*3) / 4 = 3.0
        assert_eq!(merged.delta, vec![4.0, 3.0]);
        assert_eq!(merged.total_samples, 4);
        assert_eq!(merged.contributors.len(), 2);
    }

    #[test]
    fn malformed_contributions_are_dropped() {
        let good_a = contribution(2, vec![2.0, 2.0]);
        let good_b = contribution(2, vec![4.0, 4.0]);
        let wrong_len = contribution(10, vec![1.0, 1.0, 1.0]);
        let nan = contribution(10, vec![f32::NAN, 1.0]);
        let empty_samples = contribution(0, vec![9.0, 9.0]);

        let merged =
            aggregate(&[good_a.clone(), wrong_len, nan, empty_samples, good_b.clone()]).unwrap();

        assert_eq!(merged.delta, vec![3.0, 3.0]);
        assert_eq!(
            merged.contributors,
            vec![good_a.worker_id, good_b.worker_id]
        );
    }

    #[test]
    fn nothing_valid_means_no_merge() {
        assert!(aggregate(&[]).is_none());
        assert!(aggregate(&[contribution(0, vec![1.0])]).is_none());
        assert!(aggregate(&[contribution(5, vec![f32::INFINITY])]).is_none());
    }

    #[test]
    fn single_contributor_passes_through() {
        let merged = aggregate(&[contribution(7, vec![0.5, -0.5])]).unwrap();
        assert_eq!(merged.delta, vec![0.5, -0.5]);
        assert_eq!(merged.total_samples, 7);
    }
}
