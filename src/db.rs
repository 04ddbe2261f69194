//! SQLite persistence for threshold configuration and schedule entries.
//! The newest thresholds row is authoritative; a default row is created on
//! first read so `current_thresholds` is idempotent.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// The active watering thresholds. Administered through the control plane,
/// cached by the controller for up to a minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub moisture_low: f64,
    pub moisture_high: f64,
    pub watering_sec: i64,
    pub soak_min: i64,
    pub daily_budget_min: i64,
    pub window_start_hour: u8,
    pub window_end_hour: u8,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            moisture_low: 0.38,
            moisture_high: 0.45,
            watering_sec: 90,
            soak_min: 8,
            daily_budget_min: 20,
            window_start_hour: 3,
            window_end_hour: 6,
        }
    }
}

impl ThresholdSet {
    pub fn daily_budget_sec(&self) -> i64 {
        self.daily_budget_min * 60
    }

    /// Validate invariants. Returns `Ok(())` or an error describing every
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !(0.0..=1.0).contains(&self.moisture_low) {
            errors.push(format!(
                "moisture_low {} out of range [0.0, 1.0]",
                self.moisture_low
            ));
        }
        if !(0.0..=1.0).contains(&self.moisture_high) {
            errors.push(format!(
                "moisture_high {} out of range [0.0, 1.0]",
                self.moisture_high
            ));
        }
        if self.moisture_low >= self.moisture_high {
            errors.push(format!(
                "moisture_high ({}) must be greater than moisture_low ({})",
                self.moisture_high, self.moisture_low
            ));
        }
        if self.watering_sec <= 0 {
            errors.push(format!(
                "watering_sec must be positive, got {}",
                self.watering_sec
            ));
        }
        if self.soak_min <= 0 {
            errors.push(format!("soak_min must be positive, got {}", self.soak_min));
        }
        if self.daily_budget_min <= 0 {
            errors.push(format!(
                "daily_budget_min must be positive, got {}",
                self.daily_budget_min
            ));
        }
        if self.window_start_hour >= 24 {
            errors.push(format!(
                "window_start_hour {} out of range [0, 24)",
                self.window_start_hour
            ));
        }
        if self.window_end_hour >= 24 {
            errors.push(format!(
                "window_end_hour {} out of range [0, 24)",
                self.window_end_hour
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "invalid thresholds ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

/// Partial threshold update from the control plane; unset fields keep their
/// current values.
#[derive(Debug, Default, Deserialize)]
pub struct ThresholdPatch {
    pub moisture_low: Option<f64>,
    pub moisture_high: Option<f64>,
    pub watering_sec: Option<i64>,
    pub soak_min: Option<i64>,
    pub daily_budget_min: Option<i64>,
    pub window_start_hour: Option<u8>,
    pub window_end_hour: Option<u8>,
}

impl ThresholdPatch {
    pub fn apply(&self, t: &mut ThresholdSet) {
        if let Some(v) = self.moisture_low {
            t.moisture_low = v;
        }
        if let Some(v) = self.moisture_high {
            t.moisture_high = v;
        }
        if let Some(v) = self.watering_sec {
            t.watering_sec = v;
        }
        if let Some(v) = self.soak_min {
            t.soak_min = v;
        }
        if let Some(v) = self.daily_budget_min {
            t.daily_budget_min = v;
        }
        if let Some(v) = self.window_start_hour {
            t.window_start_hour = v;
        }
        if let Some(v) = self.window_end_hour {
            t.window_end_hour = v;
        }
    }
}

/// A calendar watering event. Matched against "now" by exact hour and
/// minute on the entry's date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub id: i64,
    pub name: String,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub hour: u8,
    pub minute: u8,
    pub duration_sec: i64,
    pub enabled: bool,
}

impl ScheduleEntry {
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name is empty".to_string());
        }
        if self.hour >= 24 {
            errors.push(format!("hour {} out of range [0, 24)", self.hour));
        }
        if self.minute >= 60 {
            errors.push(format!("minute {} out of range [0, 60)", self.minute));
        }
        if self.duration_sec <= 0 {
            errors.push(format!(
                "duration_sec must be positive, got {}",
                self.duration_sec
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "invalid schedule ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub hour: u8,
    pub minute: u8,
    pub duration_sec: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial schedule update; unset fields keep their current values.
#[derive(Debug, Default, Deserialize)]
pub struct SchedulePatch {
    pub name: Option<String>,
    #[serde(default, with = "iso_date::option")]
    pub date: Option<Date>,
    pub hour: Option<u8>,
    pub minute: Option<u8>,
    pub duration_sec: Option<i64>,
    pub enabled: Option<bool>,
}

impl SchedulePatch {
    pub fn apply(&self, e: &mut ScheduleEntry) {
        if let Some(v) = &self.name {
            e.name = v.clone();
        }
        if let Some(v) = self.date {
            e.date = v;
        }
        if let Some(v) = self.hour {
            e.hour = v;
        }
        if let Some(v) = self.minute {
            e.minute = v;
        }
        if let Some(v) = self.duration_sec {
            e.duration_sec = v;
        }
        if let Some(v) = self.enabled {
            e.enabled = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Date column helpers
// ---------------------------------------------------------------------------

pub(crate) fn format_date(d: Date) -> String {
    d.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_default()
}

pub(crate) fn parse_date(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("invalid date string: {s}"))
}

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
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
    // Thresholds
    // ----------------------------

    /// Return the active threshold set, creating and persisting the default
    /// one if none exists yet.
    pub async fn current_thresholds(&self) -> Result<ThresholdSet> {
        let row = sqlx::query(
            "SELECT moisture_low, moisture_high, watering_sec, soak_min, \
             daily_budget_min, window_start_hour, window_end_hour \
             FROM thresholds ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load thresholds")?;

        match row {
            Some(row) => threshold_from_row(&row),
            None => {
                let defaults = ThresholdSet::default();
                self.insert_thresholds(&defaults).await?;
                Ok(defaults)
            }
        }
    }

    /// Overwrite the active threshold set. Creates the row first if the
    /// table is still empty.
    pub async fn store_thresholds(&self, t: &ThresholdSet) -> Result<()> {
        // Guarantees at least one row exists.
        self.current_thresholds().await?;

        sqlx::query(
            "UPDATE thresholds SET \
             moisture_low = ?, moisture_high = ?, watering_sec = ?, soak_min = ?, \
             daily_budget_min = ?, window_start_hour = ?, window_end_hour = ?, \
             updated_at = ? \
             WHERE id = (SELECT MAX(id) FROM thresholds)",
        )
        .bind(t.moisture_low)
        .bind(t.moisture_high)
        .bind(t.watering_sec)
        .bind(t.soak_min)
        .bind(t.daily_budget_min)
        .bind(t.window_start_hour as i64)
        .bind(t.window_end_hour as i64)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to store thresholds")?;

        Ok(())
    }

    async fn insert_thresholds(&self, t: &ThresholdSet) -> Result<()> {
        sqlx::query(
            "INSERT INTO thresholds (moisture_low, moisture_high, watering_sec, \
             soak_min, daily_budget_min, window_start_hour, window_end_hour, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(t.moisture_low)
        .bind(t.moisture_high)
        .bind(t.watering_sec)
        .bind(t.soak_min)
        .bind(t.daily_budget_min)
        .bind(t.window_start_hour as i64)
        .bind(t.window_end_hour as i64)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert thresholds")?;
        Ok(())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn create_schedule(&self, s: &NewSchedule) -> Result<ScheduleEntry> {
        let result = sqlx::query(
            "INSERT INTO schedules (name, date, hour, minute, duration_sec, enabled) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&s.name)
        .bind(format_date(s.date))
        .bind(s.hour as i64)
        .bind(s.minute as i64)
        .bind(s.duration_sec)
        .bind(s.enabled)
        .execute(&self.pool)
        .await
        .context("failed to create schedule")?;

        Ok(ScheduleEntry {
            id: result.last_insert_rowid(),
            name: s.name.clone(),
            date: s.date,
            hour: s.hour,
            minute: s.minute,
            duration_sec: s.duration_sec,
            enabled: s.enabled,
        })
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        let rows = sqlx::query(
            "SELECT id, name, date, hour, minute, duration_sec, enabled \
             FROM schedules ORDER BY date, hour, minute",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list schedules")?;

        rows.iter().map(schedule_from_row).collect()
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Option<ScheduleEntry>> {
        let row = sqlx::query(
            "SELECT id, name, date, hour, minute, duration_sec, enabled \
             FROM schedules WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load schedule")?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    pub async fn replace_schedule(&self, e: &ScheduleEntry) -> Result<()> {
        sqlx::query(
            "UPDATE schedules SET name = ?, date = ?, hour = ?, minute = ?, \
             duration_sec = ?, enabled = ? WHERE id = ?",
        )
        .bind(&e.name)
        .bind(format_date(e.date))
        .bind(e.hour as i64)
        .bind(e.minute as i64)
        .bind(e.duration_sec)
        .bind(e.enabled)
        .bind(e.id)
        .execute(&self.pool)
        .await
        .context("failed to update schedule")?;
        Ok(())
    }

    /// Returns true if a row was actually deleted.
    pub async fn delete_schedule(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete schedule")?;
        Ok(result.rows_affected() > 0)
    }

    /// All enabled entries for a given date, in no particular order.
    pub async fn enabled_schedules_for(&self, date: Date) -> Result<Vec<ScheduleEntry>> {
        let rows = sqlx::query(
            "SELECT id, name, date, hour, minute, duration_sec, enabled \
             FROM schedules WHERE date = ? AND enabled = 1",
        )
        .bind(format_date(date))
        .fetch_all(&self.pool)
        .await
        .context("failed to load schedules for date")?;

        rows.iter().map(schedule_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn threshold_from_row(row: &SqliteRow) -> Result<ThresholdSet> {
    Ok(ThresholdSet {
        moisture_low: row.try_get("moisture_low")?,
        moisture_high: row.try_get("moisture_high")?,
        watering_sec: row.try_get("watering_sec")?,
        soak_min: row.try_get("soak_min")?,
        daily_budget_min: row.try_get("daily_budget_min")?,
        window_start_hour: row.try_get::<i64, _>("window_start_hour")? as u8,
        window_end_hour: row.try_get::<i64, _>("window_end_hour")? as u8,
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<ScheduleEntry> {
    let date_str: String = row.try_get("date")?;
    Ok(ScheduleEntry {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        date: parse_date(&date_str)?,
        hour: row.try_get::<i64, _>("hour")? as u8,
        minute: row.try_get::<i64, _>("minute")? as u8,
        duration_sec: row.try_get("duration_sec")?,
        enabled: row.try_get("enabled")?,
    })
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

// ===========================================================================
// Tests
// ===========================================================================
