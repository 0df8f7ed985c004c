//! switchyard - rate-limit aware request routing for chat-completion APIs
//!
//! This library provides the core functionality for the switchyard
//! dispatcher: configuration, target selection and admission control,
//! and the HTTP front end that delivers requests to backend targets.

pub mod config;
pub mod error;
pub mod proxy;
pub mod router;

pub use config::Config;
pub use error::{Error, Result};
pub use proxy::Dispatcher;
