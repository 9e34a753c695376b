//! SQLite-backed lifecycle store
//!
//! Timestamps are stored as unix milliseconds. Subscription metadata is a JSON
//! text column; its `gracePeriodEnd` and `expirationWarning` keys are queried
//! with SQLite's JSON functions. All database work runs on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::*;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS contracts (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    plan_id TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    status TEXT NOT NULL,
    start_date INTEGER NOT NULL,
    end_date INTEGER,
    freeze_start_date INTEGER,
    freeze_end_date INTEGER,
    renewal_of TEXT,
    final_amount REAL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_contracts_status_end ON contracts(status, end_date);
CREATE INDEX IF NOT EXISTS idx_contracts_renewal_of ON contracts(renewal_of);

CREATE TABLE IF NOT EXISTS subscription_organizations (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    status TEXT NOT NULL,
    start_date INTEGER NOT NULL,
    end_date INTEGER NOT NULL,
    is_active INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_status_end ON subscription_organizations(status, end_date);
";

const CONTRACT_COLUMNS: &str = "id, client_id, plan_id, organization_id, status, start_date, end_date, \
     freeze_start_date, freeze_end_date, renewal_of, final_amount, created_at, updated_at, deleted_at";

const SUBSCRIPTION_COLUMNS: &str =
    "id, organization_id, status, start_date, end_date, is_active, metadata, created_at, updated_at, deleted_at";

/// Lifecycle store over a single SQLite connection
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("creating {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;

        // WAL lets stats readers run alongside a reconciliation pass
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::init(conn)?;

        info!(path = %path.display(), "Lifecycle store opened");
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            f(&mut *conn)
        })
        .await?
    }

    pub async fn insert_contract(&self, contract: Contract) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO contracts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    CONTRACT_COLUMNS
                ),
                params![
                    contract.id,
                    contract.client_id,
                    contract.plan_id,
                    contract.organization_id,
                    contract.status.as_str(),
                    millis(contract.start_date),
                    contract.end_date.map(millis),
                    contract.freeze_start_date.map(millis),
                    contract.freeze_end_date.map(millis),
                    contract.renewal_of,
                    contract.final_amount,
                    millis(contract.created_at),
                    millis(contract.updated_at),
                    contract.deleted_at.map(millis),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_subscription(&self, subscription: SubscriptionOrganization) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let metadata = serde_json::to_string(&subscription.metadata)?;
            conn.execute(
                &format!(
                    "INSERT INTO subscription_organizations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    SUBSCRIPTION_COLUMNS
                ),
                params![
                    subscription.id,
                    subscription.organization_id,
                    subscription.status.as_str(),
                    millis(subscription.start_date),
                    millis(subscription.end_date),
                    subscription.is_active,
                    metadata,
                    millis(subscription.created_at),
                    millis(subscription.updated_at),
                    subscription.deleted_at.map(millis),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn contract(&self, id: &str) -> Result<Option<Contract>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_contract(conn, &id)).await
    }

    pub async fn subscription(&self, id: &str) -> Result<Option<SubscriptionOrganization>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_subscription(conn, &id)).await
    }
}

#[async_trait::async_trait]
impl LifecycleStore for SqliteStore {
    async fn find_contracts(&self, filter: &ContractFilter) -> Result<Vec<ContractCandidate>, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let (clause, mut args) = contract_clause(&filter);
            let mut sql = format!(
                "SELECT id, organization_id, status, end_date, freeze_end_date FROM contracts WHERE {} ORDER BY id",
                clause
            );
            push_limit(&mut sql, &mut args, filter.limit);

            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params_from_iter(args))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                out.push(ContractCandidate {
                    status: parse_status(&id, &row.get::<_, String>(2)?)?,
                    organization_id: row.get(1)?,
                    end_date: opt_ts(&id, row.get(3)?)?,
                    freeze_end_date: opt_ts(&id, row.get(4)?)?,
                    id,
                });
            }
            debug!(rows = out.len(), "Contract scan");
            Ok(out)
        })
        .await
    }

    async fn count_contracts(&self, filter: &ContractFilter) -> Result<u64, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let (clause, args) = contract_clause(&filter);
            let sql = format!("SELECT COUNT(*) FROM contracts WHERE {}", clause);
            let count: i64 = conn.query_row(&sql, params_from_iter(args), |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn find_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<SubscriptionCandidate>, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let (clause, mut args) = subscription_clause(&filter);
            let mut sql = format!(
                "SELECT id, organization_id, status, end_date, {} \
                 FROM subscription_organizations WHERE {} ORDER BY id",
                metadata_field("gracePeriodEnd"),
                clause
            );
            push_limit(&mut sql, &mut args, filter.limit);

            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params_from_iter(args))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let grace_end: Value = row.get(4)?;
                out.push(SubscriptionCandidate {
                    status: parse_status(&id, &row.get::<_, String>(2)?)?,
                    organization_id: row.get(1)?,
                    end_date: ts(&id, row.get(3)?)?,
                    grace_period_end: candidate_grace_end(&id, grace_end),
                    id,
                });
            }
            debug!(rows = out.len(), "Subscription scan");
            Ok(out)
        })
        .await
    }

    async fn count_subscriptions(&self, filter: &SubscriptionFilter) -> Result<u64, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let (clause, args) = subscription_clause(&filter);
            let sql = format!("SELECT COUNT(*) FROM subscription_organizations WHERE {}", clause);
            let count: i64 = conn.query_row(&sql, params_from_iter(args), |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn run_in_transaction(&self, work: TxWork) -> Result<TransitionOutcome, ProcessingError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<TransitionOutcome, ProcessingError> {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction().map_err(StoreError::from)?;

            let outcome = work(&mut SqliteTx { conn: &tx })?;

            tx.commit().map_err(StoreError::from)?;
            Ok(outcome)
        })
        .await
        .map_err(StoreError::from)?
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl LifecycleTx for SqliteTx<'_> {
    fn contract(&mut self, id: &str) -> Result<Option<Contract>, StoreError> {
        load_contract(self.conn, id)
    }

    fn latest_renewal(&mut self, parent_id: &str) -> Result<Option<Contract>, StoreError> {
        let sql = format!(
            "SELECT {} FROM contracts WHERE renewal_of = ?1 AND deleted_at IS NULL \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            CONTRACT_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([parent_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(contract_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn save_contract(&mut self, contract: &Contract) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE contracts SET client_id = ?2, plan_id = ?3, organization_id = ?4, status = ?5, \
             start_date = ?6, end_date = ?7, freeze_start_date = ?8, freeze_end_date = ?9, \
             renewal_of = ?10, final_amount = ?11, updated_at = ?12, deleted_at = ?13 WHERE id = ?1",
            params![
                contract.id,
                contract.client_id,
                contract.plan_id,
                contract.organization_id,
                contract.status.as_str(),
                millis(contract.start_date),
                contract.end_date.map(millis),
                contract.freeze_start_date.map(millis),
                contract.freeze_end_date.map(millis),
                contract.renewal_of,
                contract.final_amount,
                millis(contract.updated_at),
                contract.deleted_at.map(millis),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Backend(format!("contract {} does not exist", contract.id)));
        }
        Ok(())
    }

    fn subscription(&mut self, id: &str) -> Result<Option<SubscriptionOrganization>, StoreError> {
        load_subscription(self.conn, id)
    }

    fn save_subscription(&mut self, subscription: &SubscriptionOrganization) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&subscription.metadata)?;
        let changed = self.conn.execute(
            "UPDATE subscription_organizations SET organization_id = ?2, status = ?3, start_date = ?4, \
             end_date = ?5, is_active = ?6, metadata = ?7, updated_at = ?8, deleted_at = ?9 WHERE id = ?1",
            params![
                subscription.id,
                subscription.organization_id,
                subscription.status.as_str(),
                millis(subscription.start_date),
                millis(subscription.end_date),
                subscription.is_active,
                metadata,
                millis(subscription.updated_at),
                subscription.deleted_at.map(millis),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Backend(format!(
                "subscription {} does not exist",
                subscription.id
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Query building
// =============================================================================

fn contract_clause(filter: &ContractFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if !filter.include_deleted {
        clauses.push("deleted_at IS NULL".to_string());
    }
    if !filter.statuses.is_empty() {
        clauses.push(in_clause("status", filter.statuses.len()));
        args.extend(filter.statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
    }
    if let Some(from) = filter.end_date_from {
        clauses.push("end_date >= ?".to_string());
        args.push(Value::Integer(millis(from)));
    }
    if let Some(to) = filter.end_date_to {
        clauses.push("end_date <= ?".to_string());
        args.push(Value::Integer(millis(to)));
    }
    if let Some(to) = filter.freeze_end_to {
        clauses.push("freeze_end_date <= ?".to_string());
        args.push(Value::Integer(millis(to)));
    }
    if let Some(org) = &filter.organization_id {
        clauses.push("organization_id = ?".to_string());
        args.push(Value::Text(org.clone()));
    }
    if let Some(after) = &filter.after_id {
        clauses.push("id > ?".to_string());
        args.push(Value::Text(after.clone()));
    }

    (join_clauses(clauses), args)
}

fn subscription_clause(filter: &SubscriptionFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if !filter.include_deleted {
        clauses.push("deleted_at IS NULL".to_string());
    }
    if !filter.statuses.is_empty() {
        clauses.push(in_clause("status", filter.statuses.len()));
        args.extend(filter.statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
    }
    if let Some(from) = filter.end_date_from {
        clauses.push("end_date >= ?".to_string());
        args.push(Value::Integer(millis(from)));
    }
    if let Some(to) = filter.end_date_to {
        clauses.push("end_date <= ?".to_string());
        args.push(Value::Integer(millis(to)));
    }
    if let Some(to) = filter.grace_period_end_to {
        clauses.push(format!("julianday({}) <= julianday(?)", metadata_field("gracePeriodEnd")));
        args.push(Value::Text(to.to_rfc3339()));
    }
    if let Some(sent) = filter.warning_sent {
        clauses.push(format!("COALESCE({}, 0) = ?", metadata_field("expirationWarning")));
        args.push(Value::Integer(i64::from(sent)));
    }
    if let Some(org) = &filter.organization_id {
        clauses.push("organization_id = ?".to_string());
        args.push(Value::Text(org.clone()));
    }
    if let Some(after) = &filter.after_id {
        clauses.push("id > ?".to_string());
        args.push(Value::Text(after.clone()));
    }

    (join_clauses(clauses), args)
}

/// `metadata.<key>`, or NULL when the row's metadata is not valid JSON.
/// An unguarded `json_extract` over a corrupt row fails the whole statement.
fn metadata_field(key: &str) -> String {
    format!(
        "(CASE WHEN json_valid(metadata) THEN json_extract(metadata, '$.{}') END)",
        key
    )
}

fn in_clause(column: &str, n: usize) -> String {
    format!("{} IN ({})", column, vec!["?"; n].join(", "))
}

fn join_clauses(clauses: Vec<String>) -> String {
    if clauses.is_empty() {
        "1 = 1".to_string()
    } else {
        clauses.join(" AND ")
    }
}

fn push_limit(sql: &mut String, args: &mut Vec<Value>, limit: Option<usize>) {
    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        args.push(Value::Integer(limit as i64));
    }
}

// =============================================================================
// Row decoding
// =============================================================================

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
}

fn load_contract(conn: &Connection, id: &str) -> Result<Option<Contract>, StoreError> {
    let sql = format!("SELECT {} FROM contracts WHERE id = ?1", CONTRACT_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(contract_from_row(row)?)),
        None => Ok(None),
    }
}

fn load_subscription(conn: &Connection, id: &str) -> Result<Option<SubscriptionOrganization>, StoreError> {
    let sql = format!("SELECT {} FROM subscription_organizations WHERE id = ?1", SUBSCRIPTION_COLUMNS);
    let row = conn
        .query_row(&sql, [id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, Option<i64>>(9)?,
            ))
        })
        .optional()?;

    let Some((id, organization_id, status, start, end, is_active, metadata, created, updated, deleted)) = row
    else {
        return Ok(None);
    };

    Ok(Some(SubscriptionOrganization {
        status: parse_status(&id, &status)?,
        organization_id,
        start_date: ts(&id, start)?,
        end_date: ts(&id, end)?,
        is_active,
        metadata: serde_json::from_str(&metadata).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: format!("metadata: {}", e),
        })?,
        created_at: ts(&id, created)?,
        updated_at: ts(&id, updated)?,
        deleted_at: opt_ts(&id, deleted)?,
        id,
    }))
}

fn contract_from_row(row: &Row<'_>) -> Result<Contract, StoreError> {
    let id: String = row.get(0)?;
    Ok(Contract {
        client_id: row.get(1)?,
        plan_id: row.get(2)?,
        organization_id: row.get(3)?,
        status: parse_status(&id, &row.get::<_, String>(4)?)?,
        start_date: ts(&id, row.get(5)?)?,
        end_date: opt_ts(&id, row.get(6)?)?,
        freeze_start_date: opt_ts(&id, row.get(7)?)?,
        freeze_end_date: opt_ts(&id, row.get(8)?)?,
        renewal_of: row.get(9)?,
        final_amount: row.get(10)?,
        created_at: ts(&id, row.get(11)?)?,
        updated_at: ts(&id, row.get(12)?)?,
        deleted_at: opt_ts(&id, row.get(13)?)?,
        id,
    })
}

fn parse_status<S: std::str::FromStr<Err = String>>(id: &str, raw: &str) -> Result<S, StoreError> {
    raw.parse().map_err(|reason| StoreError::Corrupt {
        id: id.to_string(),
        reason,
    })
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn ts(id: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("timestamp {} out of range", ms),
    })
}

fn opt_ts(id: &str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(|ms| ts(id, ms)).transpose()
}

/// Grace end as seen by a scan. A malformed value is left for the entity's own
/// transaction to reject as corrupt.
fn candidate_grace_end(id: &str, raw: Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Text(raw) => match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                warn!(entity_id = %id, value = %raw, error = %e, "Unreadable gracePeriodEnd in scan");
                None
            }
        },
        Value::Null => None,
        other => {
            warn!(entity_id = %id, value = ?other, "Non-text gracePeriodEnd in scan");
            None
        }
    }
}
