use rust_decimal::Decimal;
use uuid::Uuid;

use super::charge_period::ChargePeriod;
use super::returns::ReturnGroup;
use crate::billing::models::ChargeElement;

/// Outcome codes recorded against a matched volume when the returns data
/// could not support a clean allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoPartTariffStatus {
    NoReturnsSubmitted,
    UnderQuery,
    SomeReturnsDue,
    OverAbstraction,
    NoReturnsForMatching,
}

impl TwoPartTariffStatus {
    pub fn code(&self) -> i32 {
        match self {
            TwoPartTariffStatus::NoReturnsSubmitted => 10,
            TwoPartTariffStatus::UnderQuery => 20,
            TwoPartTariffStatus::SomeReturnsDue => 40,
            TwoPartTariffStatus::OverAbstraction => 60,
            TwoPartTariffStatus::NoReturnsForMatching => 70,
        }
    }
}

/// One element's share of the abstracted volume for a season and year.
#[derive(Debug, Clone)]
pub struct VolumeAllocation {
    pub charge_element_id: Uuid,
    pub calculated_volume: Option<Decimal>,
    pub status: Option<TwoPartTariffStatus>,
    pub error: bool,
}

/// How abstracted volume is split across the elements of one charge version.
/// The pipeline only ever calls this through the trait so an alternative
/// split (e.g. proportional to billable share) can be swapped in per region.
pub trait AllocationStrategy: Send + Sync {
    fn allocate(
        &self,
        period: &ChargePeriod,
        elements: &[&ChargeElement],
        returns: &ReturnGroup,
    ) -> Vec<VolumeAllocation>;
}

/// Default strategy: fill elements in descending billable-quantity order,
/// capping each at its authorised quantity. Whatever the returns could not
/// cover is flagged as over-abstraction on the last element filled.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProRataAllocation;

impl AllocationStrategy for ProRataAllocation {
    fn allocate(
        &self,
        period: &ChargePeriod,
        elements: &[&ChargeElement],
        returns: &ReturnGroup,
    ) -> Vec<VolumeAllocation> {
        if elements.is_empty() {
            return Vec::new();
        }
        if returns.returns.is_empty() {
            let status = if returns.source_count == 0 {
                TwoPartTariffStatus::NoReturnsSubmitted
            } else {
                TwoPartTariffStatus::NoReturnsForMatching
            };
            return elements
                .iter()
                .map(|element| VolumeAllocation {
                    charge_element_id: element.id,
                    calculated_volume: None,
                    status: Some(status),
                    error: true,
                })
                .collect();
        }
        if returns.any_due() {
            return billable_defaults(elements, TwoPartTariffStatus::SomeReturnsDue);
        }
        if returns.any_under_query() {
            return billable_defaults(elements, TwoPartTariffStatus::UnderQuery);
        }

        let mut remaining: Decimal = returns
            .returns
            .iter()
            .flat_map(|ret| ret.lines.iter())
            .filter(|line| period.overlaps(line.start_date, line.end_date))
            .map(|line| line.quantity)
            .sum();

        let mut ordered: Vec<&ChargeElement> = elements.to_vec();
        ordered.sort_by(|a, b| {
            b.billable_quantity()
                .cmp(&a.billable_quantity())
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut allocations = Vec::with_capacity(ordered.len());
        for element in &ordered {
            let take = remaining.clamp(Decimal::ZERO, element.authorised_annual_quantity);
            remaining -= take;
            allocations.push(VolumeAllocation {
                charge_element_id: element.id,
                calculated_volume: Some(take),
                status: None,
                error: false,
            });
        }
        if remaining > Decimal::ZERO {
            if let Some(last) = allocations.last_mut() {
                last.status = Some(TwoPartTariffStatus::OverAbstraction);
                last.error = true;
            }
        }
        allocations
    }
}

fn billable_defaults(
    elements: &[&ChargeElement],
    status: TwoPartTariffStatus,
) -> Vec<VolumeAllocation> {
    elements
        .iter()
        .map(|element| VolumeAllocation {
            charge_element_id: element.id,
            calculated_volume: Some(element.billable_quantity()),
            status: Some(status),
            error: true,
        })
        .collect()
}
