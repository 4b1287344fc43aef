//! Partial-credit scoring of planned resources against an expected manifest.

use std::collections::BTreeMap;

use itertools::Itertools;

/// Penalty per resource type that was planned but never expected.
const UNEXPECTED_TYPE_PENALTY: f64 = 0.1;

/// Upper bound on the total penalty for unexpected resource types.
const MAX_UNEXPECTED_PENALTY: f64 = 0.3;

/// Score planned resource counts against expected resource counts.
///
/// Each expected type with a nonzero count earns
/// `min(planned, expected) / max(planned, expected)`; the score is the mean of
/// those ratios minus `0.1` per unexpected planned type (capped at `0.3`),
/// floored at `0.0`. Types expected with a count of zero earn no credit and
/// are not counted as unexpected.
///
/// Only counts are compared: two plans with the same counts score the same
/// regardless of how their resources are configured.
pub fn score_plan(
    planned: &BTreeMap<String, u32>,
    expected: &BTreeMap<String, u32>,
) -> (f64, String) {
    if expected.is_empty() {
        return if planned.is_empty() {
            (1.0, String::from("No expected resources to check"))
        } else {
            (0.5, String::from("No expectations defined"))
        };
    }

    let mut ratios = Vec::new();
    let mut messages = Vec::new();
    for (kind, &want) in expected.iter().filter(|(_, count)| **count > 0) {
        let got = planned.get(kind).copied().unwrap_or(0);
        ratios.push(f64::from(got.min(want)) / f64::from(got.max(want)));
        if got != want {
            messages.push(format!("{kind}: expected {want}, got {got}"));
        }
    }

    let unexpected = planned
        .keys()
        .filter(|kind| !expected.contains_key(*kind))
        .collect::<Vec<_>>();
    let penalty = (UNEXPECTED_TYPE_PENALTY * unexpected.len() as f64).min(MAX_UNEXPECTED_PENALTY);

    let average = if ratios.is_empty() {
        0.0
    } else {
        ratios.iter().sum::<f64>() / ratios.len() as f64
    };
    let score = (average - penalty).max(0.0);

    if !unexpected.is_empty() {
        messages.push(format!("Unexpected types: {}", unexpected.iter().join(", ")));
    }

    let message = if messages.is_empty() {
        String::from("All resources match expected counts")
    } else {
        messages.join("; ")
    };

    (score, message)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    use super::*;

    fn counts(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
        entries
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect()
    }

    #[test]
    fn empty_expectation_and_empty_plan() {
        pretty_assert_eq!(
            score_plan(&counts(&[]), &counts(&[])),
            (1.0, String::from("No expected resources to check"))
        );
    }

    #[test]
    fn empty_expectation_with_resources() {
        pretty_assert_eq!(
            score_plan(&counts(&[("aws_s3_bucket", 1)]), &counts(&[])),
            (0.5, String::from("No expectations defined"))
        );
    }

    #[test]
    fn exact_match() {
        let manifest = counts(&[("aws_s3_bucket", 1), ("aws_dynamodb_table", 1)]);
        pretty_assert_eq!(
            score_plan(&manifest, &manifest),
            (1.0, String::from("All resources match expected counts"))
        );
    }

    #[test]
    fn nothing_planned() {
        pretty_assert_eq!(
            score_plan(&counts(&[]), &counts(&[("aws_lambda_function", 1)])),
            (0.0, String::from("aws_lambda_function: expected 1, got 0"))
        );
    }

    #[test_case(&[("aws_subnet", 1)], &[("aws_subnet", 2)], 0.5; "under by half")]
    #[test_case(&[("aws_subnet", 4)], &[("aws_subnet", 2)], 0.5; "over by double")]
    #[test_case(&[("aws_subnet", 2), ("aws_vpc", 1)], &[("aws_subnet", 2), ("aws_vpc", 2)], 0.75; "averaged")]
    #[test]
    fn proportional_credit(planned: &[(&str, u32)], expected: &[(&str, u32)], score: f64) {
        let (actual, _) = score_plan(&counts(planned), &counts(expected));
        assert!((actual - score).abs() < 1e-12, "expected {score}, got {actual}");
    }

    #[test]
    fn unexpected_types_are_penalized() {
        let (score, message) = score_plan(
            &counts(&[("aws_s3_bucket", 1), ("aws_iam_role", 1)]),
            &counts(&[("aws_s3_bucket", 1)]),
        );
        assert!((score - 0.9).abs() < 1e-12, "got {score}");
        pretty_assert_eq!(message, "Unexpected types: aws_iam_role");
    }

    #[test]
    fn unexpected_penalty_is_capped() {
        let expected = counts(&[("aws_s3_bucket", 2)]);
        let mut planned = counts(&[("aws_s3_bucket", 1)]);
        for i in 0..25 {
            planned.insert(format!("aws_extra_{i}"), 1);
        }

        let (score, _) = score_plan(&planned, &expected);
        assert!((score - 0.2).abs() < 1e-12, "got {score}");
    }

    #[test]
    fn penalty_floors_at_zero() {
        let (score, message) = score_plan(
            &counts(&[("aws_a", 1), ("aws_b", 1), ("aws_c", 1)]),
            &counts(&[("aws_lambda_function", 1)]),
        );
        pretty_assert_eq!(score, 0.0);
        pretty_assert_eq!(
            message,
            "aws_lambda_function: expected 1, got 0; Unexpected types: aws_a, aws_b, aws_c"
        );
    }

    #[test]
    fn zero_count_types_are_ignored() {
        let (score, message) = score_plan(
            &counts(&[("aws_s3_bucket", 1), ("aws_kms_key", 1)]),
            &counts(&[("aws_s3_bucket", 1), ("aws_kms_key", 0)]),
        );
        pretty_assert_eq!(score, 1.0);
        pretty_assert_eq!(message, "All resources match expected counts");
    }

    #[test]
    fn score_stays_in_bounds() {
        let kinds = ["aws_a", "aws_b", "aws_c", "aws_d"];
        for planned_mask in 0..16u32 {
            for expected_mask in 0..16u32 {
                let pick = |mask: u32, count: u32| {
                    kinds
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| mask & (1 << i) != 0)
                        .map(|(i, kind)| (kind.to_string(), count + i as u32))
                        .collect::<BTreeMap<_, _>>()
                };
                let (score, _) = score_plan(&pick(planned_mask, 1), &pick(expected_mask, 2));
                assert!(
                    (0.0..=1.0).contains(&score),
                    "score {score} out of bounds for masks {planned_mask}/{expected_mask}"
                );
            }
        }
    }
}
