// crates/keygate-server/src/secrets/mod.rs
// Secret-store client and composite resolution

pub mod client;
pub mod resolver;

pub use client::SecretClient;
pub use resolver::Resolver;
