//! Age decoding
//!
//! The models classify into four contiguous five-year groups. The predicted
//! age is the midpoint of the arg-max group; the uncertainty is the absolute
//! value of the first uncertainty output. The second uncertainty output is
//! produced by the network but not consumed here.

use serde::Serialize;

use crate::error::{BoneAgeError, Result};
use crate::utils::math::{argmax, softmax};

/// Half-open age range `[start, end)` in years
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AgeRange {
    pub start: f32,
    pub end: f32,
}

impl AgeRange {
    pub const fn new(start: f32, end: f32) -> Self {
        Self { start, end }
    }

    pub fn midpoint(&self) -> f32 {
        (self.start + self.end) / 2.0
    }

    pub fn contains(&self, age: f32) -> bool {
        age >= self.start && age < self.end
    }
}

/// Group index to age range; contiguous and covering [0, 20)
pub const AGE_GROUPS: [AgeRange; 4] = [
    AgeRange::new(0.0, 5.0),
    AgeRange::new(5.0, 10.0),
    AgeRange::new(10.0, 15.0),
    AgeRange::new(15.0, 20.0),
];

/// Decoded model output
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AgeEstimate {
    /// Midpoint of the predicted group, in years
    pub age: f32,
    /// Always >= 0
    pub uncertainty_sigma: f32,
    pub group: usize,
    pub range: AgeRange,
    /// Softmax probability of the predicted group
    pub confidence: f32,
}

/// Arg-max group of a logit vector, lowest index on ties
pub fn predicted_group(group_logits: &[f32]) -> Result<usize> {
    if group_logits.len() != AGE_GROUPS.len() {
        return Err(BoneAgeError::shape_mismatch(
            "age decoder",
            vec![AGE_GROUPS.len()],
            vec![group_logits.len()],
        ));
    }
    argmax(group_logits)
        .ok_or_else(|| BoneAgeError::Invariant("group logits are all NaN".to_string()))
}

/// Map raw head outputs to an age estimate
pub fn decode(group_logits: &[f32], uncertainty_logits: &[f32]) -> Result<AgeEstimate> {
    let group = predicted_group(group_logits)?;
    let first = uncertainty_logits.first().ok_or_else(|| {
        BoneAgeError::shape_mismatch("uncertainty decoder", vec![2], vec![0])
    })?;

    let range = AGE_GROUPS[group];
    let confidence = softmax(group_logits)[group];

    Ok(AgeEstimate {
        age: range.midpoint(),
        uncertainty_sigma: first.abs(),
        group,
        range,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_contiguous() {
        assert_eq!(AGE_GROUPS[0].start, 0.0);
        assert_eq!(AGE_GROUPS[AGE_GROUPS.len() - 1].end, 20.0);
        for pair in AGE_GROUPS.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_decode_midpoint() {
        let estimate = decode(&[0.1, 0.2, 3.0, -1.0], &[-0.7, 5.0]).unwrap();
        assert_eq!(estimate.group, 2);
        assert_eq!(estimate.age, 12.5);
        assert!((estimate.uncertainty_sigma - 0.7).abs() < 1e-6);
        assert!(estimate.range.contains(estimate.age));
        assert!(estimate.confidence > 0.5);
    }

    #[test]
    fn test_decode_tie_prefers_lowest_group() {
        let estimate = decode(&[1.0, 4.0, 4.0, 4.0], &[0.0, 0.0]).unwrap();
        assert_eq!(estimate.group, 1);
        assert_eq!(estimate.age, 7.5);

        let estimate = decode(&[0.0; 4], &[0.0, 0.0]).unwrap();
        assert_eq!(estimate.group, 0);
        assert_eq!(estimate.age, 2.5);
        assert_eq!(estimate.uncertainty_sigma, 0.0);
    }

    #[test]
    fn test_age_is_always_a_midpoint() {
        let midpoints: Vec<f32> = AGE_GROUPS.iter().map(AgeRange::midpoint).collect();
        for i in 0..4 {
            let mut logits = [0.0f32; 4];
            logits[i] = 1.0;
            let estimate = decode(&logits, &[-3.0, 1.0]).unwrap();
            assert_eq!(midpoints.iter().filter(|m| **m == estimate.age).count(), 1);
            assert!(estimate.uncertainty_sigma >= 0.0);
        }
    }

    #[test]
    fn test_decode_rejects_wrong_lengths() {
        assert!(matches!(
            decode(&[1.0, 2.0, 3.0], &[0.0, 0.0]),
            Err(BoneAgeError::ShapeMismatch { .. })
        ));
        assert!(decode(&[1.0, 2.0, 3.0, 4.0], &[]).is_err());
    }
}
