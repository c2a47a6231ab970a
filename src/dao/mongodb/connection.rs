use std::time::Duration;

use mongodb::{Client, Collection, Database, bson::Document, bson::doc, options::ClientOptions};
use tokio::time::sleep;
use tracing::{info, warn};

use super::{
    config::MongoConfig,
    error::{MongoDaoError, MongoResult},
};

struct RetryPolicy;

impl RetryPolicy {
    const INITIAL_DELAY_MS: u64 = 250;

    fn initial_delay() -> Duration {
        Duration::from_millis(Self::INITIAL_DELAY_MS)
    }

    fn next_delay(current: Duration) -> Duration {
        (current * 2).min(Duration::from_secs(5))
    }
}

/// Owned client/database pair shared by the MongoDB-backed engines.
///
/// Both handles are reference counted by the driver, so clones are cheap and all share the
/// same connection pool.
#[derive(Clone, Debug)]
pub struct MongoConnection {
    client: Client,
    database: Database,
}

impl MongoConnection {
    /// Connect using `config` and verify the server answers a ping.
    ///
    /// The ping is tried `config.connect_attempts` times, once unless configured otherwise.
    pub async fn connect(config: &MongoConfig) -> MongoResult<Self> {
        let (client, database) = establish_connection(
            &config.options,
            &config.database_name,
            config.connect_attempts,
        )
        .await?;
        info!(database = %config.database_name, "connected to MongoDB");
        Ok(Self { client, database })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Switch to another database on the same client.
    pub fn with_database(&self, name: &str) -> Self {
        Self {
            client: self.client.clone(),
            database: self.client.database(name),
        }
    }

    pub fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection::<Document>(name)
    }

    pub async fn ping(&self) -> MongoResult<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    /// Shut the client down. Waits for outstanding cursors and sessions to be dropped.
    pub async fn close(&self) {
        self.client.clone().shutdown().await;
        info!(database = %self.database.name(), "MongoDB connection closed");
    }
}

async fn establish_connection(
    options: &ClientOptions,
    database_name: &str,
    max_attempts: u32,
) -> MongoResult<(Client, Database)> {
    let client = Client::with_options(options.clone())
        .map_err(|source| MongoDaoError::ClientConstruction { source })?;
    let database = client.database(database_name);

    let mut attempts = 0;
    let mut delay = RetryPolicy::initial_delay();

    loop {
        match database.run_command(doc! { "ping": 1 }).await {
            Ok(_) => break,
            Err(err) => {
                attempts += 1;
                if attempts >= max_attempts.max(1) {
                    return Err(MongoDaoError::InitialPing {
                        attempts,
                        source: err,
                    });
                }
                warn!(
                    attempts,
                    wait_ms = delay.as_millis(),
                    error = %err,
                    "MongoDB ping failed during initial connection; retrying"
                );
                sleep(delay).await;
                delay = RetryPolicy::next_delay(delay);
            }
        }
    }

    Ok((client, database))
}
