//! HTTP front end of the authorization service.
//!
//! The proxy forwards each original request here; the response status is
//! the verdict (200 allow, 403 deny).

pub mod cli;
pub mod config;
pub mod observability;
pub mod server;

pub use config::{AppConfig, ConfigOverrides};
pub use server::{AppState, AuthzServer, ServerBuilder, build_app};
