//! Threshold and schedule lookups for the control loop, with the bounded
//! timeout enforced here rather than in the controller: a stalled fetch
//! must not stall the whole periodic loop.

use std::time::Duration;
use thiserror::Error;
use time::Date;

use crate::db::{Db, ScheduleEntry, ThresholdSet};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("fetch timed out after {0}ms")]
    TimedOut(u64),
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ThresholdProvider {
    db: Db,
    timeout: Duration,
}

impl ThresholdProvider {
    pub fn new(db: Db, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    /// Idempotent: creates and persists the default set if none exists.
    pub async fn get_current(&self) -> Result<ThresholdSet, ProviderError> {
        match tokio::time::timeout(self.timeout, self.db.current_thresholds()).await {
            Ok(Ok(set)) => Ok(set),
            Ok(Err(e)) => Err(ProviderError::Unavailable(format!("{e:#}"))),
            Err(_) => Err(ProviderError::TimedOut(self.timeout.as_millis() as u64)),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ScheduleProvider {
    db: Db,
    timeout: Duration,
}

impl ScheduleProvider {
    pub fn new(db: Db, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    /// All enabled entries for `date`. The caller does the minute matching.
    pub async fn get_enabled_for(&self, date: Date) -> Result<Vec<ScheduleEntry>, ProviderError> {
        match tokio::time::timeout(self.timeout, self.db.enabled_schedules_for(date)).await {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(e)) => Err(ProviderError::Unavailable(format!("{e:#}"))),
            Err(_) => Err(ProviderError::TimedOut(self.timeout.as_millis() as u64)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewSchedule;
    use time::macros::date;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn mem_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn thresholds_created_on_first_fetch() {
        let db = mem_db().await;
        let provider = ThresholdProvider::new(db, TIMEOUT);
        let t = provider.get_current().await.unwrap();
        assert_eq!(t, ThresholdSet::default());
    }

    #[tokio::test]
    async fn thresholds_unavailable_when_pool_closed() {
        let db = mem_db().await;
        db.pool().close().await;

        let provider = ThresholdProvider::new(db, TIMEOUT);
        let err = provider.get_current().await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)), "{err}");
    }

    #[tokio::test]
    async fn schedules_returned_for_matching_date() {
        let db = mem_db().await;
        db.create_schedule(&NewSchedule {
            name: "noon".into(),
            date: date!(2024 - 05 - 10),
            hour: 12,
            minute: 0,
            duration_sec: 60,
            enabled: true,
        })
        .await
        .unwrap();

        let provider = ScheduleProvider::new(db, TIMEOUT);
        let hits = provider.get_enabled_for(date!(2024 - 05 - 10)).await.unwrap();
        assert_eq!(hits.len(), 1);

        let misses = provider.get_enabled_for(date!(2024 - 05 - 11)).await.unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn schedules_unavailable_when_pool_closed() {
        let db = mem_db().await;
        db.pool().close().await;

        let provider = ScheduleProvider::new(db, TIMEOUT);
        let err = provider
            .get_enabled_for(date!(2024 - 05 - 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)), "{err}");
    }

    #[test]
    fn error_messages_distinguish_causes() {
        let unavailable = ProviderError::Unavailable("boom".into());
        assert!(unavailable.to_string().contains("unavailable"));

        let timed_out = ProviderError::TimedOut(2000);
        assert!(timed_out.to_string().contains("timed out after 2000ms"));
    }
}
