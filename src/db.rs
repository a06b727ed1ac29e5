use std::collections::BTreeMap;
use std::io;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::series::floor_to_hour;
use crate::traits::ObservationStore;

/// One hourly Wi-Fi client count for a location.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Observation {
    pub location: String,
    pub ts: DateTime<Utc>,
    pub wifi_clients: i32,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    ts: DateTime<Utc>,
    wifi_clients: i32,
}

/// Read `ts,wifi_clients` rows, flooring timestamps to the hour and keeping
/// the highest count per hour.
pub fn read_observations_csv<R: io::Read>(reader: R, location: &str) -> Result<Vec<Observation>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut hourly: BTreeMap<DateTime<Utc>, i32> = BTreeMap::new();

    for (line, row) in rdr.deserialize::<CsvRow>().enumerate() {
        let row = row.with_context(|| format!("Invalid CSV row {}", line + 1))?;
        if row.wifi_clients < 0 {
            anyhow::bail!("Negative wifi_clients on row {}", line + 1);
        }
        let slot = hourly.entry(floor_to_hour(row.ts)).or_default();
        *slot = (*slot).max(row.wifi_clients);
    }

    Ok(hourly
        .into_iter()
        .map(|(ts, wifi_clients)| Observation {
            location: location.to_string(),
            ts,
            wifi_clients,
        })
        .collect())
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    /// Insert or replace the count for (location, ts).
    pub async fn insert_observation(
        &self,
        location: &str,
        ts: DateTime<Utc>,
        wifi_clients: i32,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO signals (location, ts, wifi_clients)
            VALUES ($1, $2, $3)
            ON CONFLICT (location, ts) DO UPDATE SET wifi_clients = EXCLUDED.wifi_clients
            RETURNING id
            "#,
        )
        .bind(location)
        .bind(ts)
        .bind(wifi_clients)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert observation")?;

        Ok(id)
    }

    pub async fn batch_insert(&self, location: &str, rows: &[(DateTime<Utc>, i32)]) -> Result<()> {
        for (ts, clients) in rows {
            self.insert_observation(location, *ts, *clients).await?;
        }
        Ok(())
    }

    /// Distinct locations that have at least one observation.
    pub async fn locations(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>("SELECT DISTINCT location FROM signals ORDER BY location")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch locations")
    }

    pub async fn delete_location(&self, location: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM signals WHERE location = $1")
            .bind(location)
            .execute(&self.pool)
            .await
            .context("Failed to delete observations")?;
        Ok(result.rows_affected())
    }
}

impl ObservationStore for Database {
    async fn observations(
        &self,
        location: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        sqlx::query_as::<_, Observation>(
            r#"
            SELECT location, ts, wifi_clients
            FROM signals
            WHERE location = $1 AND ts >= $2 AND ts <= $3
            ORDER BY ts ASC
            "#,
        )
        .bind(location)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch observations for range")
    }

    async fn latest_timestamp(&self, location: &str) -> Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT ts FROM signals WHERE location = $1 ORDER BY ts DESC LIMIT 1",
        )
        .bind(location)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest observation")
    }
}
