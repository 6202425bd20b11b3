pub mod ca;
pub mod config;
pub mod error;
pub mod escrow;
pub mod keystore;
pub mod persist;
pub mod retry;
pub mod unlock;
pub mod vault;

pub use config::AppConfig;
pub use error::{TrustError, TrustResult};
