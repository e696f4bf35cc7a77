//! Resumable batch processing of ATL24 granules.
//!
//! A run lists the catalog, diffs it against the checkpoint ledger, and
//! drains the remaining granules through a worker pool. Every outcome lands
//! in the summary table or the error log, so an interrupted run picks up
//! where it stopped.

pub mod catalog;
pub mod dispatch;
pub mod error;
pub mod granule;
pub mod job;
pub mod ledger;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod source;
pub mod stats;
pub mod validate;

pub use error::{Error, Result};
