//! Infrastructure layer: storage, ledger posting, outbox delivery, reports
//! and configuration.

pub mod catalog;
pub mod config;
pub mod ledger;
pub mod outbox;
pub mod reports;
pub mod store;
pub mod workflow;

#[cfg(test)]
mod integration_tests;
