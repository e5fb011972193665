use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use cardstall_storage::Database;

const BATCH_LIMIT: i64 = 500;

/// Background worker that reclaims dead reservation rows and keeps the WAL
/// in shape.
///
/// Read paths ignore expired unconfirmed reservations on their own; this
/// worker only bounds storage growth from abandoned carts. The grace period
/// keeps a just-expired order inspectable while the buyer is still being
/// told to restart checkout.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
    grace: ChronoDuration,
}

impl MaintenanceWorker {
    /// Creates a worker with the given cadence and post-expiry grace.
    pub fn new(database: Database, interval: Duration, grace_minutes: i64) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
            interval,
            grace: ChronoDuration::minutes(grace_minutes),
        }
    }

    /// Overrides the clock used for determining sweep thresholds.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle (reservation sweep + checkpoint).
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let now = (self.clock)();
        let threshold = now - self.grace;

        let (deleted, busy) = self.sweep_reservations(threshold).await?;
        info!(
            stage = "storage",
            table = "stock_reservations",
            deleted,
            busy,
            threshold = %threshold.to_rfc3339(),
            "expired reservation sweep completed"
        );

        self.run_checkpoint().await?;

        Ok(())
    }

    async fn sweep_reservations(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<(u64, bool), MaintenanceError> {
        let repo = self.database.reservations();
        let mut total_deleted = 0u64;
        let mut busy = false;

        loop {
            match repo.delete_expired_batch(threshold, BATCH_LIMIT).await {
                Ok(0) => break,
                Ok(batch_deleted) => {
                    total_deleted += batch_deleted;
                    counter!("db_ttl_deleted_total", "table" => "stock_reservations")
                        .increment(batch_deleted);
                }
                Err(err) => {
                    if is_sqlite_busy(&err) {
                        busy = true;
                        counter!("db_busy_total", "op" => "ttl").increment(1);
                        warn!(stage = "storage", error = %err, "reservation sweep hit busy timeout");
                        break;
                    }

                    return Err(MaintenanceError::Sweep { source: err });
                }
            }
        }

        Ok((total_deleted, busy))
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        let checkpoint_result = self.database.wal_checkpoint_truncate().await;

        match checkpoint_result {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                if stats.busy_frames > 0 {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
            }
            Err(err) => {
                if is_sqlite_busy(&err) {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                    return Ok(());
                }

                return Err(MaintenanceError::Checkpoint { source: err });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired reservation rows")]
    Sweep {
        #[source]
        source: SqlxError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry;
    use tempfile::TempDir;

    async fn setup_db() -> (Database, TempDir) {
        telemetry::init_metrics().expect("metrics");
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("cardstall.db").display()
        );
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        sqlx::query(
            "INSERT INTO products (id, name, price_cents, stock, track_stock, created_at, updated_at) \
             VALUES ('card-1', 'Charizard Holo', 1500, 5, 1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .expect("insert product");
        (db, dir)
    }

    async fn insert_reservation(
        db: &Database,
        order_number: &str,
        expires_at: DateTime<Utc>,
        confirmed: bool,
    ) {
        sqlx::query(
            "INSERT INTO stock_reservations \
             (id, product_id, order_number, quantity, expires_at, confirmed, created_at) \
             VALUES (?, 'card-1', ?, 1, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(order_number)
        .bind(expires_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .bind(confirmed as i64)
        .bind(expires_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .execute(db.pool())
        .await
        .expect("insert reservation");
    }

    #[tokio::test]
    async fn run_once_deletes_only_long_expired_unconfirmed_rows() {
        let (db, _dir) = setup_db().await;
        let now = Utc::now();

        // Past the one-hour grace: swept.
        insert_reservation(&db, "ORD-STALE", now - ChronoDuration::hours(2), false).await;
        // Expired but inside the grace window: kept.
        insert_reservation(&db, "ORD-RECENT", now - ChronoDuration::minutes(10), false).await;
        // Active window: kept.
        insert_reservation(&db, "ORD-LIVE", now + ChronoDuration::minutes(20), false).await;
        // Confirmed rows are never swept, however old.
        insert_reservation(&db, "ORD-PAID", now - ChronoDuration::hours(8), true).await;

        let clock = Arc::new(move || now);
        let worker = MaintenanceWorker::new(db.clone(), Duration::from_secs(60), 60)
            .with_clock(clock);
        worker.run_once().await.expect("run_once");

        let survivors: Vec<(String,)> = sqlx::query_as(
            "SELECT order_number FROM stock_reservations ORDER BY order_number",
        )
        .fetch_all(db.pool())
        .await
        .expect("survivors");
        let names: Vec<&str> = survivors.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["ORD-LIVE", "ORD-PAID", "ORD-RECENT"]);
    }

    #[tokio::test]
    async fn run_once_is_a_noop_on_an_empty_table() {
        let (db, _dir) = setup_db().await;
        let worker = MaintenanceWorker::new(db.clone(), Duration::from_secs(60), 60);

        worker.run_once().await.expect("run_once");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stock_reservations")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count.0, 0);
    }
}
