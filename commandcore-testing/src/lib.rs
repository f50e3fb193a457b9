//! Test utilities for `CommandCore` adapters
//!
//! The [`contract`] module holds behavioural scenarios every
//! [`EventStore`](commandcore::event_store::EventStore) implementation must
//! pass. Adapter crates run them through the
//! [`event_store_contract_tests!`](crate::event_store_contract_tests) macro.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod contract;
