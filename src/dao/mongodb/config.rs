use mongodb::options::ClientOptions;

use super::error::{MongoDaoError, MongoResult};

const DEFAULT_URI: &str = "mongodb://localhost:27017";
const DEFAULT_DB: &str = "realm";
const DEFAULT_KV_COLLECTION: &str = "kvdb";
const DEFAULT_CONNECT_ATTEMPTS: u32 = 1;

/// Runtime configuration describing how to reach MongoDB.
#[derive(Clone, Debug)]
pub struct MongoConfig {
    pub options: ClientOptions,
    pub database_name: String,
    /// Collection backing the key-value engine.
    pub kv_collection: String,
    /// Pings attempted before connecting gives up. Anything above 1 retries with backoff.
    pub connect_attempts: u32,
}

impl MongoConfig {
    /// Parse a connection string; `db_name` falls back to the default database.
    pub async fn from_uri(uri: &str, db_name: Option<&str>) -> MongoResult<Self> {
        let database_name = match db_name {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => DEFAULT_DB.to_owned(),
        };
        let options =
            ClientOptions::parse(uri)
                .await
                .map_err(|source| MongoDaoError::InvalidUri {
                    uri: uri.to_owned(),
                    source,
                })?;

        Ok(Self {
            options,
            database_name,
            kv_collection: DEFAULT_KV_COLLECTION.to_owned(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
        })
    }

    /// Build a configuration from `MONGO_URI`, `MONGO_DB`, `MONGO_KV_COLLECTION` and
    /// `MONGO_CONNECT_ATTEMPTS`.
    pub async fn from_env() -> MongoResult<Self> {
        let uri = std::env::var("MONGO_URI").unwrap_or_else(|_| DEFAULT_URI.into());
        let db = std::env::var("MONGO_DB").ok();
        let mut config = Self::from_uri(&uri, db.as_deref()).await?;

        if let Ok(collection) = std::env::var("MONGO_KV_COLLECTION")
            && !collection.is_empty()
        {
            config = config.with_kv_collection(collection);
        }
        if let Some(attempts) = std::env::var("MONGO_CONNECT_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse().ok())
        {
            config = config.with_connect_attempts(attempts);
        }
        Ok(config)
    }

    pub fn with_kv_collection(mut self, collection: impl Into<String>) -> Self {
        self.kv_collection = collection.into();
        self
    }

    /// Retry the bootstrap ping up to `attempts` times; zero is treated as one.
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_database_name_falls_back_to_default() {
        let config = MongoConfig::from_uri("mongodb://localhost:27017", Some(""))
            .await
            .unwrap();
        assert_eq!(config.database_name, DEFAULT_DB);
        assert_eq!(config.kv_collection, DEFAULT_KV_COLLECTION);
        assert_eq!(config.connect_attempts, 1);
    }

    #[tokio::test]
    async fn connect_retries_are_opt_in() {
        let config = MongoConfig::from_uri("mongodb://localhost:27017", None)
            .await
            .unwrap();
        assert_eq!(config.clone().with_connect_attempts(5).connect_attempts, 5);
        assert_eq!(config.with_connect_attempts(0).connect_attempts, 1);
    }

    #[tokio::test]
    async fn explicit_names_are_kept() {
        let config = MongoConfig::from_uri("mongodb://localhost:27017", Some("game"))
            .await
            .unwrap()
            .with_kv_collection("kv");
        assert_eq!(config.database_name, "game");
        assert_eq!(config.kv_collection, "kv");
    }

    #[tokio::test]
    async fn invalid_uri_is_reported_with_the_uri() {
        let err = MongoConfig::from_uri("not-a-mongo-uri", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MongoDaoError::InvalidUri { ref uri, .. } if uri == "not-a-mongo-uri"));
    }
}
