//! # vantage-watch
//!
//! Index-based blocking queries served directly against a local indexed
//! store — the non-streaming sibling of `vantage-core`'s materialized
//! views.
//!
//! A caller supplies a query function that reads the store, reports the
//! index its answer is consistent at, and registers [`watch_set`]
//! wait-handles for the data it touched. [`query::blocking_query`] re-runs
//! the function until the index passes the caller's watermark, blocking on
//! the handles in between and suppressing the wakeups that watches over
//! sparse data are prone to. [`notify::notify`] layers a background
//! change-notification task on top, paced on failure by the engine's
//! shared backoff waiter.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod notify;
pub mod query;
pub mod watch_set;

pub use notify::{notify, NotifyError, NotifyHandle, NotifyUpdate};
pub use query::{blocking_query, QueryError, QueryOptions, QueryResponse, StateStore};
pub use watch_set::{Trigger, WakeReason, WatchHandle, WatchSet};
