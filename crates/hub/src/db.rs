//! SQLite persistence: the device directory and the reading store.
//!
//! Workers only see the two read/append seams ([`DeviceDirectory`],
//! [`ReadingStore`]); provisioning (upsert, frequency edits, removal) goes
//! through the inherent [`Db`] methods used by config seeding and the
//! operator API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Smallest polling frequency the directory accepts.
pub const MIN_POLL_FREQUENCY_SEC: i64 = 5;

pub type DeviceId = i64;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub url: String,
    pub hostname: String,

    pub poll_frequency_sec: i64,

    pub humidity_control: bool,
    pub humidity_threshold: f64,
    pub humidity_on_sec: i64,
    pub humidity_cooldown_sec: i64,
}

/// A device as provisioned, before the directory assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub name: String,
    pub url: String,
    pub hostname: String,
    pub poll_frequency_sec: i64,
    pub humidity_control: bool,
    pub humidity_threshold: f64,
    pub humidity_on_sec: i64,
    pub humidity_cooldown_sec: i64,
}

/// Humidity-threshold control parameters, present only when the policy is
/// enabled for the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HumiditySettings {
    pub threshold: f64,
    pub on_duration: Duration,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Reading {
    pub ts: i64,
    pub device_id: DeviceId,
    pub temperature: f64,
    pub humidity: f64,
}

impl Device {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_frequency_sec.max(MIN_POLL_FREQUENCY_SEC) as u64)
    }

    pub fn humidity_settings(&self) -> Option<HumiditySettings> {
        if !self.humidity_control {
            return None;
        }
        Some(HumiditySettings {
            threshold: self.humidity_threshold,
            on_duration: Duration::from_secs(self.humidity_on_sec.max(0) as u64),
            cooldown: Duration::from_secs(self.humidity_cooldown_sec.max(0) as u64),
        })
    }
}

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Read side of the device directory, as seen by the supervisor and workers.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>>;
    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>>;
}

/// Append-only sink for sensor samples.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn append(
        &self,
        device_id: DeviceId,
        ts: OffsetDateTime,
        temperature: f64,
        humidity: f64,
    ) -> Result<()>;
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/relay/relay.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Shared-cache memory databases lock whole tables, so keep a single
        // connection there.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device directory
    // ----------------------------

    /// Insert a device, or update every setting of the device with the same
    /// name. Returns the device id.
    pub async fn upsert_device(&self, d: &NewDevice) -> Result<DeviceId> {
        let (id,): (DeviceId,) = sqlx::query_as(
            r#"
            INSERT INTO devices (
              name, url, hostname,
              poll_frequency_sec,
              humidity_control, humidity_threshold, humidity_on_sec, humidity_cooldown_sec
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              url=excluded.url,
              hostname=excluded.hostname,
              poll_frequency_sec=excluded.poll_frequency_sec,
              humidity_control=excluded.humidity_control,
              humidity_threshold=excluded.humidity_threshold,
              humidity_on_sec=excluded.humidity_on_sec,
              humidity_cooldown_sec=excluded.humidity_cooldown_sec
            RETURNING id
            "#,
        )
        .bind(&d.name)
        .bind(&d.url)
        .bind(&d.hostname)
        .bind(d.poll_frequency_sec)
        .bind(d.humidity_control)
        .bind(d.humidity_threshold)
        .bind(d.humidity_on_sec)
        .bind(d.humidity_cooldown_sec)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert_device failed for '{}'", d.name))?;
        Ok(id)
    }

    pub async fn load_devices(&self) -> Result<Vec<Device>> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT id, name, url, hostname, poll_frequency_sec,
                   humidity_control, humidity_threshold, humidity_on_sec, humidity_cooldown_sec
            FROM devices
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_devices failed")
    }

    pub async fn find_device(&self, id: DeviceId) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT id, name, url, hostname, poll_frequency_sec,
                   humidity_control, humidity_threshold, humidity_on_sec, humidity_cooldown_sec
            FROM devices
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("find_device failed")
    }

    /// Returns false when no such device exists.
    pub async fn update_poll_frequency(&self, id: DeviceId, seconds: i64) -> Result<bool> {
        anyhow::ensure!(
            seconds >= MIN_POLL_FREQUENCY_SEC,
            "poll frequency must be at least {MIN_POLL_FREQUENCY_SEC}s, got {seconds}"
        );
        let res = sqlx::query("UPDATE devices SET poll_frequency_sec = ? WHERE id = ?")
            .bind(seconds)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("update_poll_frequency failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn update_humidity_control(
        &self,
        id: DeviceId,
        enabled: bool,
        threshold: f64,
        on_sec: i64,
        cooldown_sec: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE devices
            SET humidity_control = ?, humidity_threshold = ?,
                humidity_on_sec = ?, humidity_cooldown_sec = ?
            WHERE id = ?
            "#,
        )
        .bind(enabled)
        .bind(threshold)
        .bind(on_sec)
        .bind(cooldown_sec)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("update_humidity_control failed")?;
        Ok(res.rows_affected() > 0)
    }

    /// Remove a device together with all of its readings.
    pub async fn remove_device(&self, id: DeviceId) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("remove_device: begin")?;
        sqlx::query("DELETE FROM readings WHERE device_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("remove_device: delete readings")?;
        let res = sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("remove_device: delete device")?;
        tx.commit().await.context("remove_device: commit")?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(
        &self,
        ts: i64,
        device_id: DeviceId,
        temperature: f64,
        humidity: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (ts, device_id, temperature, humidity)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(device_id)
        .bind(temperature)
        .bind(humidity)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Readings with `from <= ts <= to` (unix seconds), oldest first.
    pub async fn readings_between(
        &self,
        device_id: DeviceId,
        from: i64,
        to: i64,
    ) -> Result<Vec<Reading>> {
        sqlx::query_as::<_, Reading>(
            r#"
            SELECT ts, device_id, temperature, humidity
            FROM readings
            WHERE device_id = ? AND ts >= ? AND ts <= ?
            ORDER BY ts
            "#,
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("readings_between failed")
    }

    pub async fn readings_since_hours(&self, device_id: DeviceId, hours: i64) -> Result<Vec<Reading>> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.readings_between(device_id, now - hours * 3600, now).await
    }
}

#[async_trait]
impl DeviceDirectory for Db {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.load_devices().await
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>> {
        self.find_device(id).await
    }
}

#[async_trait]
impl ReadingStore for Db {
    async fn append(
        &self,
        device_id: DeviceId,
        ts: OffsetDateTime,
        temperature: f64,
        humidity: f64,
    ) -> Result<()> {
        self.insert_reading(ts.unix_timestamp(), device_id, temperature, humidity)
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
