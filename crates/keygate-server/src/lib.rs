// crates/keygate-server/src/lib.rs
// Keygate - credential and tool gateway for AI agents

#![allow(clippy::collapsible_if)]
#![allow(clippy::too_many_arguments)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod audit;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod meter;
pub mod objectstore;
pub mod proxy;
pub mod secrets;
pub mod server;
pub mod tools;
pub mod web;

pub use error::{GatewayError, Result};
