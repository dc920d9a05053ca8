//! Render controller for MachineConfigPools
//!
//! Watches pools and MachineConfigs, merges the MachineConfigs each pool
//! selects into one content-addressed rendered config, and points the pool
//! at it.
//!
//! # Modules
//!
//! - [`selector`] - Label selector parsing and matching
//! - [`validate`] - Per-fragment validation
//! - [`render`] - Version gate and merge engine
//! - [`splice`] - Allow-listed changes for paused pools
//! - [`store`] - Cache reads and API writes
//! - [`queue`] - Deduplicating, rate-limited work queue
//! - [`controller`] - Pool reconciler and workers
//! - [`handlers`] - Watch events to queue keys
//! - [`bootstrap`] - Offline render from manifests
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod render;
pub mod selector;
pub mod splice;
pub mod store;
pub mod validate;

pub use controller::{run_workers, sync_pool, Context, RenderControllerConfig, SyncOutcome};
pub use error::{ReconcileError, RenderError};
pub use handlers::Handlers;
pub use queue::WorkQueue;
