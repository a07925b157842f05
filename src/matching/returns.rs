use std::collections::BTreeSet;

use crate::billing::models::{ReturnSubmission, Season};

/// A return counts as summer only when it is flagged summer AND at least one
/// of its purposes is billed by a summer charge element. A summer flag with
/// no matching purpose falls through to winter/all-year.
pub fn return_season(ret: &ReturnSubmission, summer_purposes: &BTreeSet<String>) -> Season {
    let purpose_matches = ret
        .purpose_uses
        .iter()
        .any(|purpose| summer_purposes.contains(purpose));
    if ret.is_summer && purpose_matches {
        Season::Summer
    } else {
        Season::WinterAllYear
    }
}

/// The returns eligible for matching in one season. Void returns and returns
/// not flagged for two-part tariff are dropped; `source_count` remembers how
/// many returns the licence had before filtering so callers can tell "none
/// submitted" apart from "none eligible".
#[derive(Debug, Clone)]
pub struct ReturnGroup {
    pub season: Season,
    pub returns: Vec<ReturnSubmission>,
    pub source_count: usize,
}

impl ReturnGroup {
    pub fn build(
        season: Season,
        all_returns: &[ReturnSubmission],
        summer_purposes: &BTreeSet<String>,
    ) -> ReturnGroup {
        let source_count = all_returns.len();
        let returns = all_returns
            .iter()
            .filter(|ret| ret.is_two_part_tariff && !ret.is_void())
            .filter(|ret| return_season(ret, summer_purposes) == season)
            .cloned()
            .collect();
        ReturnGroup {
            season,
            returns,
            source_count,
        }
    }

    pub fn any_due(&self) -> bool {
        self.returns.iter().any(ReturnSubmission::is_due)
    }

    pub fn any_under_query(&self) -> bool {
        self.returns.iter().any(|ret| ret.under_query)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use uuid::Uuid;

    use super::*;

    fn submission(status: &str, is_summer: bool, purposes: &[&str]) -> ReturnSubmission {
        ReturnSubmission {
            id: Uuid::new_v4(),
            licence_ref: "01/234".into(),
            status: status.into(),
            is_summer,
            is_two_part_tariff: true,
            under_query: false,
            purpose_uses: purposes.iter().map(|p| p.to_string()).collect(),
            start_date: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
            due_date: None,
            received_date: None,
            lines: Vec::new(),
        }
    }

    fn summer_purposes() -> BTreeSet<String> {
        ["spray irrigation".to_string()].into_iter().collect()
    }

    #[test]
    fn summer_flag_alone_is_not_enough() {
        let ret = submission("completed", true, &["vegetable washing"]);
        assert_eq!(return_season(&ret, &summer_purposes()), Season::WinterAllYear);
    }

    #[test]
    fn summer_flag_with_matching_purpose_is_summer() {
        let ret = submission("completed", true, &["spray irrigation"]);
        assert_eq!(return_season(&ret, &summer_purposes()), Season::Summer);
    }

    #[test]
    fn winter_flag_stays_winter_even_with_summer_purpose() {
        let ret = submission("completed", false, &["spray irrigation"]);
        assert_eq!(return_season(&ret, &summer_purposes()), Season::WinterAllYear);
    }

    #[test]
    fn void_and_non_tariff_returns_are_dropped() {
        let mut non_tariff = submission("completed", true, &["spray irrigation"]);
        non_tariff.is_two_part_tariff = false;
        let void = submission("void", true, &["spray irrigation"]);
        let kept = submission("completed", true, &["spray irrigation"]);

        let group = ReturnGroup::build(
            Season::Summer,
            &[non_tariff, void, kept],
            &summer_purposes(),
        );
        assert_eq!(group.returns.len(), 1);
        assert_eq!(group.source_count, 3);
    }

    #[test]
    fn due_and_under_query_are_visible_on_the_group() {
        let due = submission("due", false, &["spray irrigation"]);
        let mut queried = submission("completed", false, &["spray irrigation"]);
        queried.under_query = true;

        let group = ReturnGroup::build(
            Season::WinterAllYear,
            &[due, queried],
            &summer_purposes(),
        );
        assert!(group.any_due());
        assert!(group.any_under_query());
    }
}
