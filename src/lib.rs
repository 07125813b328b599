pub mod config;
pub mod error;
pub mod db;
pub mod tx;
pub mod serialization;
pub mod token_store;
pub mod snapshot;
pub mod wiring;

pub use config::Config;
pub use error::{ConfigError, ErrorKind, InfraError, PersistenceError};
pub use token_store::TokenStore;
pub use wiring::{Component, Infrastructure, InfrastructureBuilder};
