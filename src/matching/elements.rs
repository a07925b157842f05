use std::collections::BTreeSet;

use crate::billing::models::{ChargeElement, Season};

// Summer abstraction window, as (month, day) pairs.
const SUMMER_START: (u32, u32) = (4, 1);
const SUMMER_END: (u32, u32) = (10, 31);

/// Season a charge element is billed under. An explicit season on the element
/// wins; otherwise the element is summer only when its abstraction period
/// lies wholly inside 1 April to 31 October without wrapping the year end.
pub fn element_season(element: &ChargeElement) -> Season {
    if let Some(season) = element.season {
        return season;
    }
    let start = (element.abstraction_period.start_month, element.abstraction_period.start_day);
    let end = (element.abstraction_period.end_month, element.abstraction_period.end_day);
    let inside_window = start >= SUMMER_START && end <= SUMMER_END && start <= end;
    if inside_window {
        Season::Summer
    } else {
        Season::WinterAllYear
    }
}

/// The two-part-tariff elements of one charge version, queryable by season.
/// Elements not flagged for two-part tariff never take part in matching.
#[derive(Debug, Clone)]
pub struct ChargeElementGroup {
    elements: Vec<ChargeElement>,
}

impl ChargeElementGroup {
    pub fn new(elements: impl IntoIterator<Item = ChargeElement>) -> Self {
        Self {
            elements: elements
                .into_iter()
                .filter(|element| element.is_two_part_tariff)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn for_season(&self, season: Season) -> Vec<&ChargeElement> {
        self.elements
            .iter()
            .filter(|element| element_season(element) == season)
            .collect()
    }

    /// Purpose uses billed in the given season, used to classify returns.
    pub fn purpose_uses(&self, season: Season) -> BTreeSet<String> {
        self.for_season(season)
            .into_iter()
            .map(|element| element.purpose_use.clone())
            .collect()
    }
}
