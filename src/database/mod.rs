pub mod connection;
pub mod ledger;
pub mod mongo_ledger;
pub mod reconciliation_store;
