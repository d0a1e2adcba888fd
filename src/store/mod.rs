//! Persistence for accounts, invoices and extraction results.
//!
//! Every query that takes an `account_id` is scoped to that account; rows owned
//! by someone else behave as if they did not exist.

pub mod accounts;
pub mod extracted;
pub mod invoices;
