#![deny(unsafe_code)]
#![warn(missing_docs)]
//! amebo-core
//!
//! Domain types, error taxonomy, and configuration shared by every other
//! Amebo crate. If you only take one dependency, take this one.

/// Runtime configuration loaded from the environment.
pub mod config;
/// Error taxonomy mapped at the HTTP edge by `amebo-daemon`.
pub mod error;
/// Domain entities: applications, actions, subscriptions, events, gists.
pub mod model;

pub use config::{AmeboConfig, Engine};
pub use error::Error;
pub use model::{Action, Application, Event, Gist, Subscription};

/// Result alias used throughout the Amebo workspace.
pub type Result<T> = std::result::Result<T, Error>;
