pub mod audit;
pub mod ledger;
pub mod overdue;
pub mod reports;
pub mod schedule;
pub mod scheduler;
