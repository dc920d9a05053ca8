//! Node-side decisions for applying a rendered config
//!
//! # Modules
//!
//! - [`actions`] - What a config change needs to take effect
//! - [`drain`] - Drain decision and drain requests
//! - [`registries`] - registries.conf comparison
//! - [`extensions`] - Supported OS extensions

#![deny(missing_docs)]

pub mod actions;
pub mod drain;
pub mod extensions;
pub mod registries;

pub use actions::{calculate_post_config_change_actions, PostConfigChangeAction};
pub use drain::{
    drain_if_required, is_drain_required, perform_drain, DrainActuator, DrainError, DrainOptions, DrainOutcome,
};
pub use registries::{is_safe_registries_change, RegistriesConf, RegistriesError};
