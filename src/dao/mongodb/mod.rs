//! Shared MongoDB plumbing: configuration, connection bootstrap and error classification.

mod config;
mod connection;
mod error;

pub use config::MongoConfig;
pub use connection::MongoConnection;
pub use error::{MongoDaoError, MongoResult};
