use rusqlite::Connection;

use super::{JobAction, JobPayload, RawJob};
use crate::error::Result;
use crate::storage::{repository, Database};

/// Append a job on an open connection. Used inside the transaction that
/// applies the matching local change.
pub fn enqueue_in(
    conn: &Connection,
    action: JobAction,
    payload: &JobPayload,
    created_at_ms: i64,
) -> std::result::Result<i64, rusqlite::Error> {
    let json = serde_json::to_string(payload)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    repository::insert_job(conn, action.as_str(), &json, created_at_ms)
}

/// Handle to the `jobs` table.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn enqueue(&self, action: JobAction, payload: JobPayload) -> Result<i64> {
        let json = serde_json::to_string(&payload)?;
        let created_at_ms = chrono::Utc::now().timestamp_millis();
        let job_id = self
            .db
            .writer()
            .call(move |conn| repository::insert_job(conn, action.as_str(), &json, created_at_ms))
            .await?;
        log::debug!("Queued job {job_id} ({})", action.as_str());
        Ok(job_id)
    }

    /// Every queued job, oldest first.
    pub async fn peek_all(&self) -> Result<Vec<RawJob>> {
        let rows = self
            .db
            .reader()
            .call(|conn| repository::list_jobs(conn))
            .await?;
        Ok(rows
            .into_iter()
            .map(|(job_id, action, payload, created_at_ms)| RawJob {
                job_id,
                action,
                payload,
                created_at_ms,
            })
            .collect())
    }

    pub async fn remove(&self, job_id: i64) -> Result<bool> {
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::delete_job(conn, job_id))
            .await?)
    }

    pub async fn clear(&self) -> Result<usize> {
        Ok(self
            .db
            .writer()
            .call(|conn| repository::clear_jobs(conn))
            .await?)
    }

    pub async fn len(&self) -> Result<i64> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::count_jobs(conn))
            .await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
