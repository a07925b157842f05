pub mod api;
pub mod batches;
pub mod charge_data;
pub mod charge_version_years;
pub mod jobs;
pub mod models;
pub mod supplementary;
pub mod transactions;
pub mod volumes;

pub use batches::{BatchService, NewBatch};
pub use charge_data::ChargeDataService;
pub use charge_version_years::{ChargeVersionYearService, StatusCounts};
pub use models::{
    Batch, BatchErrorCode, BatchStatus, BatchType, BillingVolume, ChargeVersionYear,
    ChargeVersionYearStatus, FinancialYear, Invoice, InvoiceLicence, Season, Transaction,
    TransactionStatus,
};
pub use supplementary::{ReconciliationOutcome, SupplementaryService};
pub use transactions::{TransactionCounts, TransactionService};
pub use volumes::VolumeService;
