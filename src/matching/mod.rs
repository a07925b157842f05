//! Two-part-tariff volume matching. Pure calculation over in-memory charge
//! data and returns; persistence of the matched volumes stays with the
//! billing services.

pub mod allocator;
pub mod charge_period;
pub mod elements;
pub mod returns;

pub use allocator::{AllocationStrategy, ProRataAllocation, TwoPartTariffStatus, VolumeAllocation};
pub use charge_period::ChargePeriod;
pub use elements::{element_season, ChargeElementGroup};
pub use returns::{return_season, ReturnGroup};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::billing::models::{
    ChargeElement, ChargeVersion, FinancialYear, ReturnSubmission, Season,
};

/// One element's matched volume for a season of a financial year, ready to
/// be written to `billing_volumes`.
#[derive(Debug, Clone)]
pub struct MatchedVolume {
    pub charge_element_id: Uuid,
    pub financial_year_ending: i32,
    pub is_summer: bool,
    pub calculated_volume: Option<Decimal>,
    pub two_part_tariff_status: Option<i32>,
    pub two_part_tariff_error: bool,
}

/// Matches abstraction returns against the charge elements of one charge
/// version for one financial year. Seasons are matched independently;
/// seasons with no eligible elements produce no rows. Returns `None` when
/// the charge version was not in force during the year at all.
pub fn match_charge_version(
    charge_version: &ChargeVersion,
    financial_year: FinancialYear,
    elements: Vec<ChargeElement>,
    returns: &[ReturnSubmission],
    strategy: &dyn AllocationStrategy,
) -> Option<Vec<MatchedVolume>> {
    let period = ChargePeriod::for_financial_year(
        financial_year,
        charge_version.start_date,
        charge_version.end_date,
    )?;
    let group = ChargeElementGroup::new(elements);
    if group.is_empty() {
        return Some(Vec::new());
    }

    let summer_purposes = group.purpose_uses(Season::Summer);
    let mut matched = Vec::new();
    for season in [Season::Summer, Season::WinterAllYear] {
        let season_elements = group.for_season(season);
        if season_elements.is_empty() {
            continue;
        }
        let return_group = ReturnGroup::build(season, returns, &summer_purposes);
        for allocation in strategy.allocate(&period, &season_elements, &return_group) {
            matched.push(MatchedVolume {
                charge_element_id: allocation.charge_element_id,
                financial_year_ending: financial_year.0,
                is_summer: season == Season::Summer,
                calculated_volume: allocation.calculated_volume,
                two_part_tariff_status: allocation.status.map(|s| s.code()),
                two_part_tariff_error: allocation.error,
            });
        }
    }
    Some(matched)
}
