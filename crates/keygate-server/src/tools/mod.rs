// crates/keygate-server/src/tools/mod.rs
// Thin clients for the downstream services behind gateway-native tools

pub mod campaign;
pub mod github;
pub mod llm_usage;

pub use campaign::CampaignClient;
pub use github::{GithubClient, TokenProvider};
pub use llm_usage::ApertureUsage;
