use serde::Serialize;
use std::collections::BTreeMap;

/// Lowest and highest grade on the school scale.
pub const GRADE_MIN: i64 = 1;
pub const GRADE_MAX: i64 = 5;

/// One mark as seen by the aggregator: its value, the weight inherited from
/// the column's grade type, and the grade type label used for grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkEntry {
    pub value: i64,
    pub weight: f64,
    pub label: String,
}

impl MarkEntry {
    pub fn new(value: i64, weight: f64, label: impl Into<String>) -> Self {
        Self {
            value,
            weight,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeBreakdown {
    pub label: String,
    pub count: usize,
    pub sum: i64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub entry_count: usize,
    pub total_weight: f64,
    pub weighted_sum: f64,
    pub weighted_average: Option<f64>,
    pub suggested_grade: Option<i64>,
    pub by_type: Vec<TypeBreakdown>,
}

pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Round half up: 2.5 -> 3, 2.49 -> 2. Grades are never negative, so
/// "up" and "away from zero" coincide.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

/// Drops the float noise a weighted division leaves behind, so that two
/// 1.2-weight marks of 3 and 4 land on 3.5 rather than 3.4999999999999996.
/// Real fractions such as 3.4975 are untouched.
fn snap_noise(x: f64) -> f64 {
    (x * 1e9).round() / 1e9
}

/// Suggested grade for an unrounded average.
pub fn suggest_grade(average: f64) -> i64 {
    if average >= 4.5 {
        5
    } else if average >= 3.5 {
        4
    } else if average >= 2.5 {
        3
    } else if average >= 1.5 {
        2
    } else {
        1
    }
}

pub fn is_valid_grade(value: i64) -> bool {
    (GRADE_MIN..=GRADE_MAX).contains(&value)
}

/// Weighted average of a set of marks plus a per-type breakdown.
///
/// An empty set and a set whose weights sum to zero both produce no average
/// and no suggestion; that is the "no marks yet" state, not an error.
pub fn aggregate(entries: &[MarkEntry]) -> Aggregate {
    let mut weighted_sum = 0.0_f64;
    let mut total_weight = 0.0_f64;
    let mut groups: BTreeMap<&str, TypeBreakdown> = BTreeMap::new();

    for e in entries {
        let weight = e.weight.max(0.0);
        weighted_sum += e.value as f64 * weight;
        total_weight += weight;

        let g = groups.entry(e.label.as_str()).or_insert_with(|| TypeBreakdown {
            label: e.label.clone(),
            count: 0,
            sum: 0,
            weight: 0.0,
        });
        g.count += 1;
        g.sum += e.value;
        g.weight += weight;
    }

    let raw_average = if total_weight > 0.0 {
        Some(weighted_sum / total_weight)
    } else {
        None
    };

    Aggregate {
        entry_count: entries.len(),
        total_weight: round_2_decimals(total_weight),
        weighted_sum: round_2_decimals(weighted_sum),
        weighted_average: raw_average.map(round_2_decimals),
        suggested_grade: raw_average.map(|a| suggest_grade(snap_noise(a))),
        by_type: groups.into_values().collect(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuarterInput {
    pub number: i64,
    pub quarterly_grade_id: String,
    pub grade: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarterSlot {
    pub quarter: i64,
    pub quarterly_grade_id: String,
    pub grade: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearlyAggregate {
    pub quarters_used: usize,
    pub average: Option<f64>,
    pub suggested_grade: Option<i64>,
    pub by_quarter: Vec<QuarterSlot>,
}

/// Arithmetic mean of the graded quarters. Quarters without a grade are
/// listed in the breakdown but left out of the mean.
pub fn yearly_from_quarters(quarters: &[QuarterInput]) -> YearlyAggregate {
    let graded: Vec<i64> = quarters.iter().filter_map(|q| q.grade).collect();

    let mean = if graded.is_empty() {
        None
    } else {
        Some(graded.iter().sum::<i64>() as f64 / graded.len() as f64)
    };

    YearlyAggregate {
        quarters_used: graded.len(),
        average: mean.map(round_2_decimals),
        suggested_grade: mean.map(|m| round_half_up(m).clamp(GRADE_MIN, GRADE_MAX)),
        by_quarter: quarters
            .iter()
            .map(|q| QuarterSlot {
                quarter: q.number,
                quarterly_grade_id: q.quarterly_grade_id.clone(),
                grade: q.grade,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(i64, f64)]) -> Vec<MarkEntry> {
        pairs
            .iter()
            .map(|(v, w)| MarkEntry::new(*v, *w, "Oral response"))
            .collect()
    }

    fn quarters(grades: &[Option<i64>]) -> Vec<QuarterInput> {
        grades
            .iter()
            .enumerate()
            .map(|(i, g)| QuarterInput {
                number: i as i64 + 1,
                quarterly_grade_id: format!("qg-{}", i + 1),
                grade: *g,
            })
            .collect()
    }

    #[test]
    fn empty_set_has_no_average() {
        let agg = aggregate(&[]);
        assert_eq!(agg.entry_count, 0);
        assert_eq!(agg.weighted_average, None);
        assert_eq!(agg.suggested_grade, None);
        assert!(agg.by_type.is_empty());
    }

    #[test]
    fn zero_total_weight_behaves_like_empty() {
        let agg = aggregate(&entries(&[(5, 0.0), (2, 0.0)]));
        assert_eq!(agg.entry_count, 2);
        assert_eq!(agg.weighted_average, None);
        assert_eq!(agg.suggested_grade, None);
        assert_eq!(agg.by_type[0].count, 2);
    }

    #[test]
    fn single_five() {
        let agg = aggregate(&entries(&[(5, 1.0)]));
        assert_eq!(agg.weighted_average, Some(5.0));
        assert_eq!(agg.suggested_grade, Some(5));
    }

    #[test]
    fn three_threes() {
        let agg = aggregate(&entries(&[(3, 1.0), (3, 1.0), (3, 1.0)]));
        assert_eq!(agg.weighted_average, Some(3.0));
        assert_eq!(agg.suggested_grade, Some(3));
    }

    #[test]
    fn weights_pull_the_average() {
        let agg = aggregate(&entries(&[(4, 2.0), (2, 1.0)]));
        assert_eq!(agg.weighted_average, Some(3.33));
        assert_eq!(agg.suggested_grade, Some(3));
        assert_eq!(agg.total_weight, 3.0);
        assert_eq!(agg.weighted_sum, 10.0);
    }

    #[test]
    fn threshold_boundaries() {
        assert_eq!(suggest_grade(4.5), 5);
        assert_eq!(suggest_grade(4.49), 4);
        assert_eq!(suggest_grade(3.5), 4);
        assert_eq!(suggest_grade(3.49), 3);
        assert_eq!(suggest_grade(2.5), 3);
        assert_eq!(suggest_grade(1.5), 2);
        assert_eq!(suggest_grade(1.49), 1);
        assert_eq!(suggest_grade(1.0), 1);
    }

    #[test]
    fn suggestion_uses_unrounded_average() {
        // 3.4975 rounds to 3.5 for display but must still suggest a 3.
        let agg = aggregate(&entries(&[(4, 199.0), (3, 201.0)]));
        assert_eq!(agg.weighted_average, Some(3.5));
        assert_eq!(agg.suggested_grade, Some(3));
    }

    #[test]
    fn equal_weights_on_a_threshold_round_up() {
        for weight in [1.2, 1.3, 1.5] {
            let agg = aggregate(&entries(&[(3, weight), (4, weight)]));
            assert_eq!(agg.weighted_average, Some(3.5), "weight {}", weight);
            assert_eq!(agg.suggested_grade, Some(4), "weight {}", weight);

            let agg = aggregate(&entries(&[(2, weight), (5, weight)]));
            assert_eq!(agg.suggested_grade, Some(4), "weight {}", weight);

            let agg = aggregate(&entries(&[(4, weight), (5, weight)]));
            assert_eq!(agg.weighted_average, Some(4.5), "weight {}", weight);
            assert_eq!(agg.suggested_grade, Some(5), "weight {}", weight);

            let agg = aggregate(&entries(&[(2, weight), (3, weight)]));
            assert_eq!(agg.suggested_grade, Some(3), "weight {}", weight);
        }
    }

    #[test]
    fn mixed_seeded_weights_on_a_threshold_round_up() {
        // (3 * 1.2 + 4 * 1.2 + 3 * 1.3 + 4 * 1.3) / 5.0 = 3.5
        let agg = aggregate(&entries(&[(3, 1.2), (4, 1.2), (3, 1.3), (4, 1.3)]));
        assert_eq!(agg.suggested_grade, Some(4));
        // (5 * 1.5 + 4 * 1.5 + 5 * 1.2 + 4 * 1.2) / 5.4 = 4.5
        let agg = aggregate(&entries(&[(5, 1.5), (4, 1.5), (5, 1.2), (4, 1.2)]));
        assert_eq!(agg.suggested_grade, Some(5));
    }

    #[test]
    fn average_stays_within_value_range() {
        let sets: Vec<Vec<(i64, f64)>> = vec![
            vec![(1, 1.5), (5, 0.2)],
            vec![(2, 1.0), (2, 3.0), (4, 1.2)],
            vec![(5, 1.3), (4, 1.0), (3, 1.5), (1, 1.2)],
            vec![(3, 0.0), (4, 1.0)],
        ];
        for set in sets {
            let agg = aggregate(&entries(&set));
            let min = set.iter().map(|(v, _)| *v).min().unwrap() as f64;
            let max = set.iter().map(|(v, _)| *v).max().unwrap() as f64;
            let avg = agg.weighted_average.unwrap();
            assert!(avg >= min && avg <= max, "{avg} outside [{min}, {max}]");
        }
    }

    #[test]
    fn equal_weights_match_plain_mean() {
        let set = entries(&[(5, 1.2), (4, 1.2), (2, 1.2), (4, 1.2)]);
        let agg = aggregate(&set);
        assert_eq!(agg.weighted_average, Some(3.75));
    }

    #[test]
    fn breakdown_groups_by_label_in_stable_order() {
        let set = vec![
            MarkEntry::new(5, 1.5, "Test"),
            MarkEntry::new(4, 1.0, "Homework"),
            MarkEntry::new(3, 1.5, "Test"),
        ];
        let agg = aggregate(&set);
        assert_eq!(agg.by_type.len(), 2);
        assert_eq!(agg.by_type[0].label, "Homework");
        assert_eq!(agg.by_type[1].label, "Test");
        assert_eq!(agg.by_type[1].count, 2);
        assert_eq!(agg.by_type[1].sum, 8);
        assert_eq!(agg.by_type[1].weight, 3.0);
    }

    #[test]
    fn yearly_half_rounds_up() {
        let y = yearly_from_quarters(&quarters(&[Some(2), Some(3)]));
        assert_eq!(y.average, Some(2.5));
        assert_eq!(y.suggested_grade, Some(3));
    }

    #[test]
    fn yearly_whole_mean() {
        let y = yearly_from_quarters(&quarters(&[Some(3), Some(4), Some(4), Some(5)]));
        assert_eq!(y.average, Some(4.0));
        assert_eq!(y.suggested_grade, Some(4));
        assert_eq!(y.quarters_used, 4);
    }

    #[test]
    fn yearly_skips_ungraded_quarters() {
        let y = yearly_from_quarters(&quarters(&[None, Some(4), Some(5)]));
        assert_eq!(y.average, Some(4.5));
        assert_eq!(y.suggested_grade, Some(5));
        assert_eq!(y.quarters_used, 2);
        assert_eq!(y.by_quarter.len(), 3);
        assert_eq!(y.by_quarter[0].grade, None);
    }

    #[test]
    fn yearly_without_grades_is_empty() {
        let y = yearly_from_quarters(&quarters(&[None, None]));
        assert_eq!(y.quarters_used, 0);
        assert_eq!(y.average, None);
        assert_eq!(y.suggested_grade, None);
    }

    #[test]
    fn round_helpers() {
        assert_eq!(round_2_decimals(10.0 / 3.0), 3.33);
        assert_eq!(round_2_decimals(4.005_1), 4.01);
        assert_eq!(round_half_up(2.5), 3);
        assert_eq!(round_half_up(2.49), 2);
        assert_eq!(round_half_up(4.0), 4);
    }
}
