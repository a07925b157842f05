use chrono::NaiveDate;

use crate::billing::models::FinancialYear;

/// Overlap of one financial year with a charge version's validity window.
/// Transactions and matched volumes are bounded by this period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargePeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ChargePeriod {
    /// Returns `None` when the charge version was not in force at any point
    /// during the financial year; the year is then skipped entirely.
    pub fn for_financial_year(
        financial_year: FinancialYear,
        version_start: NaiveDate,
        version_end: Option<NaiveDate>,
    ) -> Option<ChargePeriod> {
        let start_date = financial_year.start().max(version_start);
        let end_date = match version_end {
            Some(end) => financial_year.end().min(end),
            None => financial_year.end(),
        };
        (start_date <= end_date).then_some(ChargePeriod {
            start_date,
            end_date,
        })
    }

    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        start <= self.end_date && end >= self.start_date
    }
}
