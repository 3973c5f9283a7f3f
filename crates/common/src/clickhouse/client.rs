use anyhow::{Context, Result};
use clickhouse::Client;
use tracing::{debug, info};

/// Connection settings for a ClickHouse HTTP endpoint
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// Shared handle to ClickHouse; cheap to clone, safe to use from many tasks
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    database: String,
}

impl ClickHouseClient {
    pub fn new(config: &ClickHouseConfig) -> Self {
        info!(
            url = %config.url,
            database = %config.database,
            "creating ClickHouse client"
        );

        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_user(&config.username)
            .with_password(&config.password)
            .with_compression(clickhouse::Compression::Lz4);

        Self {
            client,
            database: config.database.clone(),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .context("ClickHouse ping failed")?;
        Ok(())
    }

    /// Run a statement that returns no rows (DDL and the like)
    pub async fn execute(&self, statement: &str) -> Result<()> {
        debug!(database = %self.database, "executing ClickHouse statement");
        self.client
            .query(statement)
            .execute()
            .await
            .context("failed to execute ClickHouse statement")?;
        Ok(())
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }
}
