use crate::models::Sample;

/// Combine independent samples into one score: the mean of the scored
/// samples, rounded half away from zero.
///
/// Samples whose reply could not be parsed carry no score and are left out of
/// the mean. Returns `None` when no sample carries a score.
pub fn aggregate(samples: &[Sample]) -> Option<i64> {
    let scores: Vec<i64> = samples.iter().filter_map(|s| s.score).collect();

    if scores.is_empty() {
        return None;
    }

    let sum: i64 = scores.iter().sum();
    let mean = sum as f64 / scores.len() as f64;

    Some(mean.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(scores: &[Option<i64>]) -> Vec<Sample> {
        scores
            .iter()
            .map(|&score| Sample {
                score,
                reasoning: score.map(|s| format!("score {}", s)),
            })
            .collect()
    }

    #[test]
    fn test_mean_rounds_to_nearest() {
        assert_eq!(aggregate(&samples(&[Some(0), Some(2), Some(1)])), Some(1));
        assert_eq!(aggregate(&samples(&[Some(2), Some(2), Some(2)])), Some(2));
        assert_eq!(aggregate(&samples(&[Some(3), Some(3), Some(2)])), Some(3));
        assert_eq!(aggregate(&samples(&[Some(0), Some(0), Some(1)])), Some(0));
    }

    #[test]
    fn test_half_rounds_up() {
        assert_eq!(aggregate(&samples(&[Some(0), Some(1)])), Some(1));
        assert_eq!(aggregate(&samples(&[Some(1), Some(2)])), Some(2));
        assert_eq!(aggregate(&samples(&[Some(2), Some(3)])), Some(3));
    }

    #[test]
    fn test_unscored_samples_are_excluded() {
        // mean over {2, 2}, not {2, 2, 0}
        assert_eq!(aggregate(&samples(&[Some(2), None, Some(2)])), Some(2));
        assert_eq!(aggregate(&samples(&[None, Some(0)])), Some(0));
    }

    #[test]
    fn test_no_scored_samples() {
        assert_eq!(aggregate(&samples(&[None, None])), None);
        assert_eq!(aggregate(&[]), None);
    }
}
