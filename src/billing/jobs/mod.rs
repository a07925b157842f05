//! One module per pipeline stage. Handlers only read persisted state, write
//! persisted state, and enqueue the next stage; a handler never calls
//! another handler, so a crash between stages loses nothing but time.

pub mod create_bill_run;
pub mod create_charge;
pub mod populate_charge_versions;
pub mod prepare_transactions;
pub mod process_charge_version_year;
pub mod refresh_totals;
pub mod update_invoice_references;
