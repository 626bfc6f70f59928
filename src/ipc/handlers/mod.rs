pub mod core;
pub mod fees;
pub mod ledger;
pub mod masters;
pub mod sync;
