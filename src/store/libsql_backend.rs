//! libSQL backend: async `MessageStore` implementation.
//!
//! Supports a local file and an in-memory database (tests).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{InboundMessage, Priority, RouteDecision};
use crate::store::migrations;
use crate::store::traits::{
    InboundRecord, MessageStore, NewWorkUnit, OutcomeRecord, PendingRecord, RecordStatus,
    WorkUnit,
};

/// libSQL-backed store.
///
/// Holds one connection reused for all operations; `libsql::Connection`
/// is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Current status of a record, if the message was ever recorded.
    pub async fn record_status(
        &self,
        message_id: &str,
    ) -> Result<Option<RecordStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM inbound_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(RecordStatus::parse(&status)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("record_status: {e}"))),
        }
    }

    /// Number of outcomes appended for a message.
    pub async fn outcome_count(&self, message_id: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM batch_outcomes WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("outcome_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("outcome_count: {e}"))),
        }
    }

    async fn set_status(
        &self,
        message_id: &str,
        status: RecordStatus,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                "UPDATE inbound_messages SET status = ?1, status_reason = ?2, updated_at = ?3
                 WHERE message_id = ?4",
                params![status.as_str(), reason, now, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "inbound_message".into(),
                id: message_id.to_string(),
            });
        }
        debug!(message_id, status = status.as_str(), "Record status updated");
        Ok(())
    }

    async fn query_work_unit(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Option<WorkUnit>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_work_unit(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn str_to_priority(s: &str) -> Priority {
    match s {
        "low" => Priority::Low,
        "high" => Priority::High,
        "urgent" => Priority::Urgent,
        _ => Priority::Normal,
    }
}

const WORK_UNIT_COLUMNS: &str = "id, thread_id, subject, submitter, tenant_id, lane, created_at";

/// Column order matches `WORK_UNIT_COLUMNS`.
fn row_to_work_unit(row: &libsql::Row) -> Result<WorkUnit, libsql::Error> {
    let created: String = row.get(6)?;
    Ok(WorkUnit {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        subject: row.get(2)?,
        submitter: row.get(3)?,
        tenant_id: row.get(4)?,
        lane: row.get(5)?,
        created_at: parse_datetime(&created),
    })
}

fn row_to_pending(row: &libsql::Row) -> Result<PendingRecord, libsql::Error> {
    let priority: String = row.get(6)?;
    let received: String = row.get(7)?;
    Ok(PendingRecord {
        record_id: row.get(0)?,
        message_id: row.get(1)?,
        sender: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        tenant_id: row.get(5)?,
        priority: str_to_priority(&priority),
        received_at: parse_datetime(&received),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MessageStore for LibSqlStore {
    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .record_status(message_id)
            .await?
            .is_some_and(|s| s.is_terminal()))
    }

    async fn record_inbound(
        &self,
        msg: &InboundMessage,
        lane: RouteDecision,
        tenant_id: &str,
    ) -> Result<InboundRecord, DatabaseError> {
        let status = match lane {
            RouteDecision::BatchedIntelligence => RecordStatus::Queued,
            _ => RecordStatus::Received,
        };
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        // Re-recording a message keeps its original id, tenant and lane.
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO inbound_messages (id, message_id, sender, subject, body, thread_id,
                    tenant_id, lane, priority, status, received_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                 ON CONFLICT(message_id) DO UPDATE SET updated_at = excluded.updated_at
                 RETURNING id, tenant_id, lane",
                params![
                    id.as_str(),
                    msg.message_id.as_str(),
                    msg.sender.as_str(),
                    msg.subject.as_str(),
                    msg.body.as_str(),
                    msg.thread_id.as_str(),
                    tenant_id,
                    lane.label(),
                    msg.priority.as_str(),
                    status.as_str(),
                    msg.received_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_inbound: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Err(DatabaseError::Query("record_inbound: no id returned".into())),
            Err(e) => return Err(DatabaseError::Query(format!("record_inbound: {e}"))),
        };
        let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
        let record_id: String = row.get(0).map_err(parse)?;
        let stored_lane: String = row.get(2).map_err(parse)?;
        let record = InboundRecord {
            created: record_id == id,
            record_id,
            tenant_id: row.get(1).map_err(parse)?,
            lane: RouteDecision::parse(&stored_lane),
        };

        debug!(
            record_id = %record.record_id,
            message_id = %msg.message_id,
            lane = record.lane.label(),
            tenant_id = %record.tenant_id,
            created = record.created,
            "Inbound message recorded"
        );
        Ok(record)
    }

    async fn mark_processed(&self, message_id: &str, reason: &str) -> Result<(), DatabaseError> {
        self.set_status(message_id, RecordStatus::Processed, reason)
            .await
    }

    async fn mark_failed(&self, message_id: &str, error: &str) -> Result<(), DatabaseError> {
        self.set_status(message_id, RecordStatus::Failed, error).await
    }

    async fn find_work_unit_by_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<WorkUnit>, DatabaseError> {
        self.query_work_unit(
            &format!(
                "SELECT {WORK_UNIT_COLUMNS} FROM work_units
                 WHERE thread_id = ?1
                    OR id IN (SELECT work_unit_id FROM work_unit_messages WHERE message_id = ?1)
                 ORDER BY id ASC LIMIT 1"
            ),
            params![thread_id],
            "find_work_unit_by_thread",
        )
        .await
    }

    async fn find_work_unit_by_reference(
        &self,
        reference: i64,
    ) -> Result<Option<WorkUnit>, DatabaseError> {
        self.query_work_unit(
            &format!("SELECT {WORK_UNIT_COLUMNS} FROM work_units WHERE id = ?1"),
            params![reference],
            "find_work_unit_by_reference",
        )
        .await
    }

    async fn append_outcome(&self, outcome: &OutcomeRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO batch_outcomes (message_id, tenant_id, path, insight_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    outcome.message_id.as_str(),
                    outcome.tenant_id.as_str(),
                    outcome.path.as_str(),
                    outcome.insight_count as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_outcome: {e}")))?;
        Ok(())
    }

    async fn tenant_for_sender(&self, sender: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tenant_id FROM tenant_senders WHERE sender = ?1",
                params![sender.to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("tenant_for_sender: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("tenant_for_sender: {e}"))),
        }
    }

    async fn assign_sender_tenant(
        &self,
        sender: &str,
        tenant_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenant_senders (sender, tenant_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(sender) DO UPDATE SET tenant_id = excluded.tenant_id,
                    updated_at = excluded.updated_at",
                params![sender.to_lowercase(), tenant_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("assign_sender_tenant: {e}")))?;
        Ok(())
    }

    async fn pending_intelligence(&self) -> Result<Vec<PendingRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, message_id, sender, subject, body, tenant_id, priority, received_at
                 FROM inbound_messages WHERE status = 'queued' ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_intelligence: {e}")))?;

        let mut pending = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_pending(&row) {
                Ok(record) => pending.push(record),
                Err(e) => tracing::warn!("Skipping pending row: {e}"),
            }
        }
        Ok(pending)
    }

    async fn create_work_unit(&self, unit: &NewWorkUnit<'_>) -> Result<WorkUnit, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let created = self
            .query_work_unit(
                &format!(
                    "INSERT INTO work_units (thread_id, subject, submitter, tenant_id, lane,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     RETURNING {WORK_UNIT_COLUMNS}"
                ),
                params![
                    unit.thread_id,
                    unit.subject,
                    unit.submitter,
                    unit.tenant_id,
                    unit.lane.label(),
                    now,
                ],
                "create_work_unit",
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("create_work_unit: no row returned".into()))?;

        self.attach_to_work_unit(created.id, unit.message_id, unit.submitter, unit.body)
            .await?;

        info!(
            work_unit_id = created.id,
            tenant_id = %created.tenant_id,
            lane = %created.lane,
            "Work unit created"
        );
        Ok(created)
    }

    async fn attach_to_work_unit(
        &self,
        work_unit_id: i64,
        message_id: &str,
        sender: &str,
        body: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO work_unit_messages (work_unit_id, message_id, sender, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![work_unit_id, message_id, sender, body, now.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("attach_to_work_unit: {e}")))?;

        self.conn()
            .execute(
                "UPDATE work_units SET updated_at = ?1 WHERE id = ?2",
                params![now, work_unit_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("attach_to_work_unit: {e}")))?;

        debug!(work_unit_id, message_id, "Message attached to work unit");
        Ok(())
    }

    async fn record_unsubscribe(
        &self,
        sender: &str,
        message_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO unsubscribes (sender, message_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![sender.to_lowercase(), message_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_unsubscribe: {e}")))?;
        info!(sender, "Unsubscribe recorded");
        Ok(())
    }
}
