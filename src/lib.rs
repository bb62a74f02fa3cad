//! # reconciler
//!
//! Event-driven reconciliation controller.
//!
//! An event source reports `(key, action)` changes; the controller
//! deduplicates them in a rate-limited work queue, waits for the object
//! cache to sync, and runs a pool of workers that call a user handler with
//! the latest cached object. Failed keys are retried with exponential
//! backoff and dropped after a bounded number of attempts.

pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod model;
pub mod queue;
pub mod shutdown;
pub mod source;
pub mod telemetry;

pub use controller::{Controller, ControllerState};
pub use error::{Error, Result};
pub use handler::{Handler, handler_fn};
pub use model::{Action, Event};
