//! SQLite-backed forensic store.
//!
//! Key properties:
//! - WAL mode for concurrent reads during writes
//! - One guarded connection per handle; atomic multi-row commits via
//!   explicit transactions
//! - Unique constraints on project codes and access grants
//! - Indexes on transaction sender/receiver/timestamp/risk and alert severity

use crate::errors::{EngineError, EngineResult};
use crate::models::*;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    code TEXT NOT NULL UNIQUE,
    contract_value REAL NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT,
    contractor_name TEXT NOT NULL,
    status TEXT NOT NULL,
    site_location TEXT,
    latitude REAL,
    longitude REAL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    risk_score REAL NOT NULL DEFAULT 0,
    is_watchlisted INTEGER NOT NULL DEFAULT 0,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    embedding_json TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name);
CREATE INDEX IF NOT EXISTS idx_entities_risk ON entities(risk_score DESC);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    project_id TEXT REFERENCES projects(id) ON DELETE RESTRICT,
    proposed_amount REAL NOT NULL DEFAULT 0,
    actual_amount REAL NOT NULL DEFAULT 0,
    currency TEXT NOT NULL DEFAULT 'IDR',
    sender TEXT NOT NULL,
    receiver TEXT NOT NULL,
    sender_entity_id TEXT,
    receiver_entity_id TEXT,
    description TEXT,
    category TEXT NOT NULL DEFAULT 'P',
    account_label TEXT,
    timestamp TEXT NOT NULL,
    transaction_date TEXT,
    risk_score REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    verification_status TEXT NOT NULL DEFAULT 'UNVERIFIED',
    aml_stage TEXT,
    batch_reference TEXT,
    audit_comment TEXT,
    investigator_note_enc TEXT,
    is_redacted INTEGER NOT NULL DEFAULT 0,
    potential_misappropriation INTEGER NOT NULL DEFAULT 0,
    is_circular INTEGER NOT NULL DEFAULT 0,
    needs_proof INTEGER NOT NULL DEFAULT 0,
    is_inferred INTEGER NOT NULL DEFAULT 0,
    delta_inflation REAL NOT NULL DEFAULT 0,
    latitude REAL,
    longitude REAL,
    mens_rea_description TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    embedding_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_tx_sender ON transactions(sender);
CREATE INDEX IF NOT EXISTS idx_tx_receiver ON transactions(receiver);
CREATE INDEX IF NOT EXISTS idx_tx_timestamp ON transactions(timestamp);
CREATE INDEX IF NOT EXISTS idx_tx_risk ON transactions(risk_score DESC);
CREATE INDEX IF NOT EXISTS idx_tx_project_status ON transactions(project_id, status);

CREATE TABLE IF NOT EXISTS bank_transactions (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    amount REAL NOT NULL,
    currency TEXT NOT NULL DEFAULT 'IDR',
    bank_name TEXT NOT NULL,
    description TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    booking_date TEXT,
    batch_reference TEXT,
    embedding_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_bank_tx_project ON bank_transactions(project_id, timestamp);

CREATE TABLE IF NOT EXISTS reconciliation_matches (
    id TEXT PRIMARY KEY,
    internal_tx_id TEXT NOT NULL,
    bank_tx_id TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    confirmed INTEGER NOT NULL DEFAULT 0,
    matched_at TEXT NOT NULL,
    match_type TEXT NOT NULL DEFAULT 'direct',
    ai_reasoning TEXT,
    UNIQUE(internal_tx_id, bank_tx_id, match_type)
);
CREATE INDEX IF NOT EXISTS idx_matches_internal ON reconciliation_matches(internal_tx_id);
CREATE INDEX IF NOT EXISTS idx_matches_bank ON reconciliation_matches(bank_tx_id);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    field_name TEXT,
    old_value TEXT,
    new_value TEXT,
    changed_by_user_id TEXT,
    change_reason TEXT,
    previous_hash TEXT,
    hash_signature TEXT,
    timestamp TEXT NOT NULL,
    seq INTEGER
);
CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_id, seq);

CREATE TABLE IF NOT EXISTS cases (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new',
    risk_score REAL NOT NULL DEFAULT 0,
    final_report_hash TEXT,
    sealed_at TEXT,
    sealed_by_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cases_project ON cases(project_id, status);

CREATE TABLE IF NOT EXISTS case_exhibits (
    id TEXT PRIMARY KEY,
    case_id TEXT NOT NULL REFERENCES cases(id) ON DELETE RESTRICT,
    evidence_type TEXT NOT NULL,
    evidence_id TEXT NOT NULL,
    label TEXT NOT NULL,
    verdict TEXT NOT NULL DEFAULT 'PENDING',
    adjudicated_at TEXT,
    adjudicated_by_id TEXT,
    ai_contradiction_note TEXT,
    hash_signature TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exhibits_case ON case_exhibits(case_id);

CREATE TABLE IF NOT EXISTS processing_jobs (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    data_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    total_items INTEGER NOT NULL,
    total_batches INTEGER NOT NULL,
    batches_completed INTEGER NOT NULL DEFAULT 0,
    items_processed INTEGER NOT NULL DEFAULT 0,
    items_failed INTEGER NOT NULL DEFAULT 0,
    batch_config_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    worker_task_ids_json TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_jobs_project ON processing_jobs(project_id, created_at);

CREATE TABLE IF NOT EXISTS fraud_alerts (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    transaction_id TEXT,
    alert_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    risk_score REAL NOT NULL DEFAULT 0,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_severity ON fraud_alerts(severity, created_at);

CREATE TABLE IF NOT EXISTS integrity_registry (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    anchor_id TEXT,
    sealed_at TEXT NOT NULL,
    sealed_by_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_registry_hash ON integrity_registry(file_hash);
CREATE INDEX IF NOT EXISTS idx_registry_project ON integrity_registry(project_id, sealed_at);

CREATE TABLE IF NOT EXISTS corporate_relationships (
    id TEXT PRIMARY KEY,
    parent_entity_id TEXT NOT NULL,
    child_entity_id TEXT NOT NULL,
    relationship_type TEXT NOT NULL DEFAULT 'SHAREHOLDER',
    stake_percentage REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_rel_child ON corporate_relationships(child_entity_id);
CREATE INDEX IF NOT EXISTS idx_rel_parent ON corporate_relationships(parent_entity_id);

CREATE TABLE IF NOT EXISTS assets (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    name TEXT NOT NULL,
    asset_type TEXT NOT NULL,
    estimated_value REAL NOT NULL DEFAULT 0,
    purchase_date TEXT,
    owner_entity_id TEXT NOT NULL,
    is_frozen INTEGER NOT NULL DEFAULT 0,
    location TEXT
);
CREATE INDEX IF NOT EXISTS idx_assets_owner ON assets(owner_entity_id);

CREATE TABLE IF NOT EXISTS copilot_insights (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    insight_type TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    embedding_json TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_insights_project ON copilot_insights(project_id, created_at);

CREATE TABLE IF NOT EXISTS ingestions (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_type TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    records_processed INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'completed',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reconciliation_settings (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL UNIQUE,
    clearing_window_days INTEGER NOT NULL DEFAULT 7,
    amount_tolerance_percent REAL NOT NULL DEFAULT 0.5,
    batch_window_days INTEGER NOT NULL DEFAULT 10,
    auto_confirm_threshold REAL NOT NULL DEFAULT 0.98
);

CREATE TABLE IF NOT EXISTS user_query_patterns (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    project_id TEXT,
    query_text TEXT NOT NULL,
    intent_type TEXT NOT NULL,
    was_successful INTEGER NOT NULL DEFAULT 1,
    query_frequency INTEGER NOT NULL DEFAULT 1,
    page_context TEXT,
    created_at TEXT NOT NULL,
    last_executed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_query_patterns_user ON user_query_patterns(user_id, project_id);

CREATE TABLE IF NOT EXISTS user_project_access (
    user_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'analyst',
    granted_at TEXT NOT NULL,
    PRIMARY KEY (user_id, project_id)
);
"#;

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_ts_to_sql(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(ts_to_sql)
}

fn opt_ts_from_sql(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| ts_from_sql(&v))
}

fn json_map_to_sql(map: &HashMap<String, Value>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

fn json_map_from_sql(s: &str) -> HashMap<String, Value> {
    serde_json::from_str(s).unwrap_or_default()
}

fn embedding_to_sql(v: &Option<Vec<f64>>) -> Option<String> {
    v.as_ref().and_then(|e| serde_json::to_string(e).ok())
}

fn embedding_from_sql(s: Option<String>) -> Option<Vec<f64>> {
    s.and_then(|v| serde_json::from_str(&v).ok())
}

/// Filter for transaction range queries.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub project_id: Option<String>,
    pub statuses: Vec<TransactionStatus>,
    pub receiver: Option<String>,
    pub min_risk: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub with_coordinates: bool,
    pub limit: Option<usize>,
}

/// Shared handle to the engine store. Cloning is cheap and shares the
/// underlying connection.
#[derive(Clone)]
pub struct ForensicStore {
    conn: Arc<Mutex<Connection>>,
}

impl ForensicStore {
    pub fn open(db_path: &str) -> EngineResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, db_path)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> EngineResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = label, "📦 Forensic store initialized");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run `f` inside a single SQLite transaction. Errors roll back the whole
    /// unit of work.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                conn.execute_batch("ROLLBACK").ok();
                Err(err)
            }
        }
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub fn insert_project(&self, project: &Project) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (id, name, code, contract_value, start_date, end_date,
                    contractor_name, status, site_location, latitude, longitude, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    project.id,
                    project.name,
                    project.code,
                    project.contract_value,
                    ts_to_sql(&project.start_date),
                    opt_ts_to_sql(&project.end_date),
                    project.contractor_name,
                    project.status.as_str(),
                    project.site_location,
                    project.latitude,
                    project.longitude,
                    ts_to_sql(&project.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
        Ok(Project {
            id: row.get(0)?,
            name: row.get(1)?,
            code: row.get(2)?,
            contract_value: row.get(3)?,
            start_date: ts_from_sql(&row.get::<_, String>(4)?),
            end_date: opt_ts_from_sql(row.get(5)?),
            contractor_name: row.get(6)?,
            status: ProjectStatus::parse(&row.get::<_, String>(7)?)
                .unwrap_or(ProjectStatus::AuditMode),
            site_location: row.get(8)?,
            latitude: row.get(9)?,
            longitude: row.get(10)?,
            created_at: ts_from_sql(&row.get::<_, String>(11)?),
        })
    }

    const PROJECT_COLS: &'static str = "id, name, code, contract_value, start_date, end_date,
        contractor_name, status, site_location, latitude, longitude, created_at";

    pub fn get_project(&self, id: &str) -> EngineResult<Project> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM projects WHERE id = ?1", Self::PROJECT_COLS);
            conn.query_row(&sql, params![id], Self::project_from_row)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        EngineError::NotFound(format!("project {id}"))
                    }
                    other => other.into(),
                })
        })
    }

    pub fn list_projects(&self) -> EngineResult<Vec<Project>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM projects ORDER BY created_at", Self::PROJECT_COLS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], Self::project_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    const ENTITY_COLS: &'static str = "id, project_id, name, entity_type, risk_score,
        is_watchlisted, metadata_json, embedding_json, created_at";

    fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
        Ok(Entity {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            entity_type: EntityType::parse(&row.get::<_, String>(3)?)
                .unwrap_or(EntityType::Unknown),
            risk_score: row.get(4)?,
            is_watchlisted: row.get::<_, i64>(5)? != 0,
            metadata: json_map_from_sql(&row.get::<_, String>(6)?),
            embedding: embedding_from_sql(row.get(7)?),
            created_at: ts_from_sql(&row.get::<_, String>(8)?),
        })
    }

    pub fn insert_entity(&self, entity: &Entity) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO entities (id, project_id, name, entity_type, risk_score,
                    is_watchlisted, metadata_json, embedding_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entity.id,
                    entity.project_id,
                    entity.name,
                    entity.entity_type.as_str(),
                    entity.risk_score,
                    entity.is_watchlisted as i64,
                    json_map_to_sql(&entity.metadata),
                    embedding_to_sql(&entity.embedding),
                    ts_to_sql(&entity.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_entity(&self, entity: &Entity) -> EngineResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE entities SET name = ?2, entity_type = ?3, risk_score = ?4,
                    is_watchlisted = ?5, metadata_json = ?6, embedding_json = ?7
                 WHERE id = ?1",
                params![
                    entity.id,
                    entity.name,
                    entity.entity_type.as_str(),
                    entity.risk_score,
                    entity.is_watchlisted as i64,
                    json_map_to_sql(&entity.metadata),
                    embedding_to_sql(&entity.embedding),
                ],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(format!("entity {}", entity.id)));
            }
            Ok(())
        })
    }

    pub fn get_entity(&self, id: &str) -> EngineResult<Entity> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM entities WHERE id = ?1", Self::ENTITY_COLS);
            conn.query_row(&sql, params![id], Self::entity_from_row)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        EngineError::NotFound(format!("entity {id}"))
                    }
                    other => other.into(),
                })
        })
    }

    pub fn find_entity_exact(&self, name: &str) -> EngineResult<Option<Entity>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM entities WHERE name = ?1 LIMIT 1", Self::ENTITY_COLS);
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map(params![name], Self::entity_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn find_entity_case_insensitive(&self, name: &str) -> EngineResult<Option<Entity>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM entities WHERE name = ?1 COLLATE NOCASE LIMIT 1",
                Self::ENTITY_COLS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map(params![name], Self::entity_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// LIKE-narrowed candidate list for fuzzy resolution. Never a full table
    /// scan: capped at `limit` rows.
    pub fn find_entities_like(&self, needle: &str, limit: usize) -> EngineResult<Vec<Entity>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM entities WHERE name LIKE ?1 LIMIT ?2",
                Self::ENTITY_COLS
            );
            let mut stmt = conn.prepare(&sql)?;
            let pattern = format!("%{}%", needle);
            let rows = stmt.query_map(params![pattern, limit as i64], Self::entity_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn list_entities(&self, limit: usize) -> EngineResult<Vec<Entity>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM entities LIMIT ?1", Self::ENTITY_COLS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], Self::entity_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn entities_by_names(&self, names: &[String]) -> EngineResult<Vec<Entity>> {
        let mut found = Vec::new();
        for name in names {
            if let Some(ent) = self.find_entity_exact(name)? {
                found.push(ent);
            }
        }
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub(crate) const TX_COLS: &'static str = "id, project_id, proposed_amount, actual_amount, currency,
        sender, receiver, sender_entity_id, receiver_entity_id, description, category,
        account_label, timestamp, transaction_date, risk_score, status, verification_status,
        aml_stage, batch_reference, audit_comment, investigator_note_enc, is_redacted,
        potential_misappropriation, is_circular, needs_proof, is_inferred, delta_inflation,
        latitude, longitude, mens_rea_description, metadata_json, embedding_json";

    pub(crate) fn tx_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
        Ok(Transaction {
            id: row.get(0)?,
            project_id: row.get(1)?,
            proposed_amount: row.get(2)?,
            actual_amount: row.get(3)?,
            currency: row.get(4)?,
            sender: row.get(5)?,
            receiver: row.get(6)?,
            sender_entity_id: row.get(7)?,
            receiver_entity_id: row.get(8)?,
            description: row.get(9)?,
            category: TransactionCategory::parse(&row.get::<_, String>(10)?)
                .unwrap_or(TransactionCategory::P),
            account_label: row.get(11)?,
            timestamp: ts_from_sql(&row.get::<_, String>(12)?),
            transaction_date: opt_ts_from_sql(row.get(13)?),
            risk_score: row.get(14)?,
            status: TransactionStatus::parse(&row.get::<_, String>(15)?)
                .unwrap_or(TransactionStatus::Pending),
            verification_status: VerificationStatus::parse(&row.get::<_, String>(16)?)
                .unwrap_or(VerificationStatus::Unverified),
            aml_stage: row.get::<_, Option<String>>(17)?.and_then(|s| AmlStage::parse(&s)),
            batch_reference: row.get(18)?,
            audit_comment: row.get(19)?,
            investigator_note_enc: row.get(20)?,
            is_redacted: row.get::<_, i64>(21)? != 0,
            potential_misappropriation: row.get::<_, i64>(22)? != 0,
            is_circular: row.get::<_, i64>(23)? != 0,
            needs_proof: row.get::<_, i64>(24)? != 0,
            is_inferred: row.get::<_, i64>(25)? != 0,
            delta_inflation: row.get(26)?,
            latitude: row.get(27)?,
            longitude: row.get(28)?,
            mens_rea_description: row.get(29)?,
            metadata: json_map_from_sql(&row.get::<_, String>(30)?),
            embedding: embedding_from_sql(row.get(31)?),
        })
    }

    pub(crate) fn insert_transaction_on(conn: &Connection, tx: &Transaction) -> EngineResult<()> {
        conn.execute(
            "INSERT INTO transactions (id, project_id, proposed_amount, actual_amount, currency,
                sender, receiver, sender_entity_id, receiver_entity_id, description, category,
                account_label, timestamp, transaction_date, risk_score, status,
                verification_status, aml_stage, batch_reference, audit_comment,
                investigator_note_enc, is_redacted, potential_misappropriation, is_circular,
                needs_proof, is_inferred, delta_inflation, latitude, longitude,
                mens_rea_description, metadata_json, embedding_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32)",
            params![
                tx.id,
                tx.project_id,
                tx.proposed_amount,
                tx.actual_amount,
                tx.currency,
                tx.sender,
                tx.receiver,
                tx.sender_entity_id,
                tx.receiver_entity_id,
                tx.description,
                tx.category.as_str(),
                tx.account_label,
                ts_to_sql(&tx.timestamp),
                opt_ts_to_sql(&tx.transaction_date),
                tx.risk_score,
                tx.status.as_str(),
                tx.verification_status.as_str(),
                tx.aml_stage.map(|s| s.as_str()),
                tx.batch_reference,
                tx.audit_comment,
                tx.investigator_note_enc,
                tx.is_redacted as i64,
                tx.potential_misappropriation as i64,
                tx.is_circular as i64,
                tx.needs_proof as i64,
                tx.is_inferred as i64,
                tx.delta_inflation,
                tx.latitude,
                tx.longitude,
                tx.mens_rea_description,
                json_map_to_sql(&tx.metadata),
                embedding_to_sql(&tx.embedding),
            ],
        )?;
        Ok(())
    }

    pub fn insert_transaction(&self, tx: &Transaction) -> EngineResult<()> {
        self.with_conn(|conn| Self::insert_transaction_on(conn, tx))
    }

    pub(crate) fn update_transaction_on(conn: &Connection, tx: &Transaction) -> EngineResult<()> {
        let changed = conn.execute(
            "UPDATE transactions SET proposed_amount = ?2, actual_amount = ?3, currency = ?4,
                sender = ?5, receiver = ?6, sender_entity_id = ?7, receiver_entity_id = ?8,
                description = ?9, category = ?10, account_label = ?11, timestamp = ?12,
                transaction_date = ?13, risk_score = ?14, status = ?15,
                verification_status = ?16, aml_stage = ?17, batch_reference = ?18,
                audit_comment = ?19, investigator_note_enc = ?20, is_redacted = ?21,
                potential_misappropriation = ?22, is_circular = ?23, needs_proof = ?24,
                is_inferred = ?25, delta_inflation = ?26, latitude = ?27, longitude = ?28,
                mens_rea_description = ?29, metadata_json = ?30, embedding_json = ?31
             WHERE id = ?1",
            params![
                tx.id,
                tx.proposed_amount,
                tx.actual_amount,
                tx.currency,
                tx.sender,
                tx.receiver,
                tx.sender_entity_id,
                tx.receiver_entity_id,
                tx.description,
                tx.category.as_str(),
                tx.account_label,
                ts_to_sql(&tx.timestamp),
                opt_ts_to_sql(&tx.transaction_date),
                tx.risk_score,
                tx.status.as_str(),
                tx.verification_status.as_str(),
                tx.aml_stage.map(|s| s.as_str()),
                tx.batch_reference,
                tx.audit_comment,
                tx.investigator_note_enc,
                tx.is_redacted as i64,
                tx.potential_misappropriation as i64,
                tx.is_circular as i64,
                tx.needs_proof as i64,
                tx.is_inferred as i64,
                tx.delta_inflation,
                tx.latitude,
                tx.longitude,
                tx.mens_rea_description,
                json_map_to_sql(&tx.metadata),
                embedding_to_sql(&tx.embedding),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("transaction {}", tx.id)));
        }
        Ok(())
    }

    pub fn update_transaction(&self, tx: &Transaction) -> EngineResult<()> {
        self.with_conn(|conn| Self::update_transaction_on(conn, tx))
    }

    pub fn get_transaction(&self, id: &str) -> EngineResult<Transaction> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM transactions WHERE id = ?1", Self::TX_COLS);
            conn.query_row(&sql, params![id], Self::tx_from_row).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("transaction {id}"))
                }
                other => other.into(),
            })
        })
    }

    pub fn query_transactions(&self, filter: &TransactionFilter) -> EngineResult<Vec<Transaction>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {} FROM transactions WHERE 1=1", Self::TX_COLS);
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(project_id) = &filter.project_id {
                sql.push_str(&format!(" AND project_id = ?{}", args.len() + 1));
                args.push(Box::new(project_id.clone()));
            }
            if !filter.statuses.is_empty() {
                let placeholders: Vec<String> = filter
                    .statuses
                    .iter()
                    .enumerate()
                    .map(|(i, _)| format!("?{}", args.len() + i + 1))
                    .collect();
                sql.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
                for status in &filter.statuses {
                    args.push(Box::new(status.as_str().to_string()));
                }
            }
            if let Some(receiver) = &filter.receiver {
                sql.push_str(&format!(" AND receiver = ?{}", args.len() + 1));
                args.push(Box::new(receiver.clone()));
            }
            if let Some(min_risk) = filter.min_risk {
                sql.push_str(&format!(" AND risk_score > ?{}", args.len() + 1));
                args.push(Box::new(min_risk));
            }
            if let Some(since) = &filter.since {
                sql.push_str(&format!(" AND timestamp > ?{}", args.len() + 1));
                args.push(Box::new(ts_to_sql(since)));
            }
            if filter.with_coordinates {
                sql.push_str(" AND latitude IS NOT NULL AND longitude IS NOT NULL");
            }
            sql.push_str(" ORDER BY timestamp");
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params_ref.as_slice(), Self::tx_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn list_transactions(&self, project_id: &str) -> EngineResult<Vec<Transaction>> {
        self.query_transactions(&TransactionFilter {
            project_id: Some(project_id.to_string()),
            ..Default::default()
        })
    }

    /// Transactions within `window_hours` of `center`, excluding `exclude_id`.
    pub fn transactions_in_window(
        &self,
        center: DateTime<Utc>,
        window_hours: i64,
        exclude_id: &str,
    ) -> EngineResult<Vec<Transaction>> {
        self.with_conn(|conn| {
            let lo = center - chrono::Duration::hours(window_hours);
            let hi = center + chrono::Duration::hours(window_hours);
            let sql = format!(
                "SELECT {} FROM transactions
                 WHERE timestamp >= ?1 AND timestamp <= ?2 AND id != ?3",
                Self::TX_COLS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![ts_to_sql(&lo), ts_to_sql(&hi), exclude_id],
                Self::tx_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Transfers to the same receiver within `window_hours` of `center`,
    /// excluding `exclude_id`. Velocity rule input.
    pub fn transactions_to_receiver_in_window(
        &self,
        receiver: &str,
        center: DateTime<Utc>,
        window_hours: i64,
        exclude_id: &str,
    ) -> EngineResult<Vec<Transaction>> {
        self.with_conn(|conn| {
            let lo = center - chrono::Duration::hours(window_hours);
            let hi = center + chrono::Duration::hours(window_hours);
            let sql = format!(
                "SELECT {} FROM transactions
                 WHERE receiver = ?1 AND timestamp >= ?2 AND timestamp <= ?3 AND id != ?4",
                Self::TX_COLS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![receiver, ts_to_sql(&lo), ts_to_sql(&hi), exclude_id],
                Self::tx_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Other projects where this receiver was flagged with risk above the
    /// threshold. Global recidivism memory.
    pub fn recidivist_projects(
        &self,
        receiver: &str,
        exclude_project: &str,
        min_risk: f64,
    ) -> EngineResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT project_id FROM transactions
                 WHERE receiver = ?1 AND risk_score > ?2
                   AND project_id IS NOT NULL AND project_id != ?3",
            )?;
            let rows = stmt.query_map(params![receiver, min_risk, exclude_project], |row| {
                row.get::<_, String>(0)
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ------------------------------------------------------------------
    // Bank transactions
    // ------------------------------------------------------------------

    const BANK_COLS: &'static str = "id, project_id, amount, currency, bank_name, description,
        timestamp, booking_date, batch_reference, embedding_json";

    fn bank_tx_from_row(row: &Row<'_>) -> rusqlite::Result<BankTransaction> {
        Ok(BankTransaction {
            id: row.get(0)?,
            project_id: row.get(1)?,
            amount: row.get(2)?,
            currency: row.get(3)?,
            bank_name: row.get(4)?,
            description: row.get(5)?,
            timestamp: ts_from_sql(&row.get::<_, String>(6)?),
            booking_date: opt_ts_from_sql(row.get(7)?),
            batch_reference: row.get(8)?,
            embedding: embedding_from_sql(row.get(9)?),
        })
    }

    pub(crate) fn insert_bank_transaction_on(
        conn: &Connection,
        tx: &BankTransaction,
    ) -> EngineResult<()> {
        conn.execute(
            "INSERT INTO bank_transactions (id, project_id, amount, currency, bank_name,
                description, timestamp, booking_date, batch_reference, embedding_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                tx.id,
                tx.project_id,
                tx.amount,
                tx.currency,
                tx.bank_name,
                tx.description,
                ts_to_sql(&tx.timestamp),
                opt_ts_to_sql(&tx.booking_date),
                tx.batch_reference,
                embedding_to_sql(&tx.embedding),
            ],
        )?;
        Ok(())
    }

    pub fn insert_bank_transaction(&self, tx: &BankTransaction) -> EngineResult<()> {
        self.with_conn(|conn| Self::insert_bank_transaction_on(conn, tx))
    }

    pub fn get_bank_transaction(&self, id: &str) -> EngineResult<BankTransaction> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM bank_transactions WHERE id = ?1", Self::BANK_COLS);
            conn.query_row(&sql, params![id], Self::bank_tx_from_row).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("bank transaction {id}"))
                }
                other => other.into(),
            })
        })
    }

    pub fn list_bank_transactions(&self, project_id: &str) -> EngineResult<Vec<BankTransaction>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM bank_transactions WHERE project_id = ?1 ORDER BY timestamp",
                Self::BANK_COLS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![project_id], Self::bank_tx_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ------------------------------------------------------------------
    // Reconciliation matches
    // ------------------------------------------------------------------

    const MATCH_COLS: &'static str = "id, internal_tx_id, bank_tx_id, confidence_score,
        confirmed, matched_at, match_type, ai_reasoning";

    fn match_from_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationMatch> {
        Ok(ReconciliationMatch {
            id: row.get(0)?,
            internal_tx_id: row.get(1)?,
            bank_tx_id: row.get(2)?,
            confidence_score: row.get(3)?,
            confirmed: row.get::<_, i64>(4)? != 0,
            matched_at: ts_from_sql(&row.get::<_, String>(5)?),
            match_type: MatchType::parse(&row.get::<_, String>(6)?).unwrap_or(MatchType::Direct),
            ai_reasoning: row.get(7)?,
        })
    }

    /// Insert a suggested match; re-suggesting the same pairing refreshes the
    /// score and reasoning instead of duplicating the row.
    pub fn upsert_match(&self, m: &ReconciliationMatch) -> EngineResult<ReconciliationMatch> {
        self.with_conn(|conn| {
            let existing: Option<ReconciliationMatch> = {
                let sql = format!(
                    "SELECT {} FROM reconciliation_matches
                     WHERE internal_tx_id = ?1 AND bank_tx_id = ?2 AND match_type = ?3",
                    Self::MATCH_COLS
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query_map(
                    params![m.internal_tx_id, m.bank_tx_id, m.match_type.as_str()],
                    Self::match_from_row,
                )?;
                rows.next().transpose()?
            };
            match existing {
                Some(mut found) => {
                    if !found.confirmed {
                        conn.execute(
                            "UPDATE reconciliation_matches
                             SET confidence_score = ?2, ai_reasoning = ?3, matched_at = ?4
                             WHERE id = ?1",
                            params![
                                found.id,
                                m.confidence_score,
                                m.ai_reasoning,
                                ts_to_sql(&m.matched_at)
                            ],
                        )?;
                        found.confidence_score = m.confidence_score;
                        found.ai_reasoning = m.ai_reasoning.clone();
                    }
                    Ok(found)
                }
                None => {
                    conn.execute(
                        "INSERT INTO reconciliation_matches (id, internal_tx_id, bank_tx_id,
                            confidence_score, confirmed, matched_at, match_type, ai_reasoning)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            m.id,
                            m.internal_tx_id,
                            m.bank_tx_id,
                            m.confidence_score,
                            m.confirmed as i64,
                            ts_to_sql(&m.matched_at),
                            m.match_type.as_str(),
                            m.ai_reasoning,
                        ],
                    )?;
                    Ok(m.clone())
                }
            }
        })
    }

    pub fn get_match(&self, id: &str) -> EngineResult<ReconciliationMatch> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM reconciliation_matches WHERE id = ?1", Self::MATCH_COLS);
            conn.query_row(&sql, params![id], Self::match_from_row).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("match {id}"))
                }
                other => other.into(),
            })
        })
    }

    pub fn list_matches_for_project(&self, project_id: &str) -> EngineResult<Vec<ReconciliationMatch>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM reconciliation_matches m
                 WHERE EXISTS (SELECT 1 FROM transactions t
                               WHERE t.id = m.internal_tx_id AND t.project_id = ?1)
                 ORDER BY m.matched_at",
                Self::MATCH_COLS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![project_id], Self::match_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn matches_with_reasoning(
        &self,
        project_id: &str,
        token: &str,
    ) -> EngineResult<Vec<ReconciliationMatch>> {
        Ok(self
            .list_matches_for_project(project_id)?
            .into_iter()
            .filter(|m| m.ai_reasoning.as_deref().map(|r| r.contains(token)).unwrap_or(false))
            .collect())
    }

    pub fn has_internal_match(&self, internal_tx_id: &str) -> EngineResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM reconciliation_matches WHERE internal_tx_id = ?1",
                params![internal_tx_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub(crate) fn set_match_confirmed_on(conn: &Connection, match_id: &str) -> EngineResult<()> {
        conn.execute(
            "UPDATE reconciliation_matches SET confirmed = 1 WHERE id = ?1",
            params![match_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processing jobs
    // ------------------------------------------------------------------

    const JOB_COLS: &'static str = "id, project_id, data_type, status, total_items, total_batches,
        batches_completed, items_processed, items_failed, batch_config_json, created_at,
        started_at, completed_at, error_message, retry_count, worker_task_ids_json";

    fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessingJob> {
        let config: BatchConfig = serde_json::from_str(&row.get::<_, String>(9)?)
            .unwrap_or(BatchConfig { size: 250, concurrency: 1, inter_batch_delay_ms: 200 });
        let worker_ids: HashMap<String, String> =
            serde_json::from_str(&row.get::<_, String>(15)?).unwrap_or_default();
        Ok(ProcessingJob {
            id: row.get(0)?,
            project_id: row.get(1)?,
            data_type: row.get(2)?,
            status: JobStatus::parse(&row.get::<_, String>(3)?).unwrap_or(JobStatus::Pending),
            total_items: row.get::<_, i64>(4)? as usize,
            total_batches: row.get::<_, i64>(5)? as usize,
            batches_completed: row.get::<_, i64>(6)? as usize,
            items_processed: row.get::<_, i64>(7)? as usize,
            items_failed: row.get::<_, i64>(8)? as usize,
            batch_config: config,
            created_at: ts_from_sql(&row.get::<_, String>(10)?),
            started_at: opt_ts_from_sql(row.get(11)?),
            completed_at: opt_ts_from_sql(row.get(12)?),
            error_message: row.get(13)?,
            retry_count: row.get::<_, i64>(14)? as u32,
            worker_task_ids: worker_ids,
        })
    }

    pub fn insert_job(&self, job: &ProcessingJob) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO processing_jobs (id, project_id, data_type, status, total_items,
                    total_batches, batches_completed, items_processed, items_failed,
                    batch_config_json, created_at, started_at, completed_at, error_message,
                    retry_count, worker_task_ids_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    job.id,
                    job.project_id,
                    job.data_type,
                    job.status.as_str(),
                    job.total_items as i64,
                    job.total_batches as i64,
                    job.batches_completed as i64,
                    job.items_processed as i64,
                    job.items_failed as i64,
                    serde_json::to_string(&job.batch_config)?,
                    ts_to_sql(&job.created_at),
                    opt_ts_to_sql(&job.started_at),
                    opt_ts_to_sql(&job.completed_at),
                    job.error_message,
                    job.retry_count as i64,
                    serde_json::to_string(&job.worker_task_ids)?,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_job(&self, id: &str) -> EngineResult<ProcessingJob> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM processing_jobs WHERE id = ?1", Self::JOB_COLS);
            conn.query_row(&sql, params![id], Self::job_from_row).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(format!("job {id}")),
                other => other.into(),
            })
        })
    }

    pub fn list_jobs(&self, project_id: Option<&str>) -> EngineResult<Vec<ProcessingJob>> {
        self.with_conn(|conn| {
            let (sql, args): (String, Vec<String>) = match project_id {
                Some(pid) => (
                    format!(
                        "SELECT {} FROM processing_jobs WHERE project_id = ?1
                         ORDER BY created_at DESC",
                        Self::JOB_COLS
                    ),
                    vec![pid.to_string()],
                ),
                None => (
                    format!("SELECT {} FROM processing_jobs ORDER BY created_at DESC", Self::JOB_COLS),
                    Vec::new(),
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> =
                args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
            let rows = stmt.query_map(params_ref.as_slice(), Self::job_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Transition a pending job to processing; returns false when some other
    /// worker won the race.
    pub fn mark_job_started(&self, job_id: &str, at: DateTime<Utc>) -> EngineResult<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE processing_jobs SET status = 'processing', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![job_id, ts_to_sql(&at)],
            )?;
            Ok(changed > 0)
        })
    }

    /// Atomic progress increment for one completed batch.
    pub fn record_batch_completion(
        &self,
        job_id: &str,
        processed: usize,
        failed: usize,
    ) -> EngineResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE processing_jobs SET
                    batches_completed = batches_completed + 1,
                    items_processed = items_processed + ?2,
                    items_failed = items_failed + ?3
                 WHERE id = ?1",
                params![job_id, processed as i64, failed as i64],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(format!("job {job_id}")));
            }
            Ok(())
        })
    }

    pub fn set_job_counts(
        &self,
        job_id: &str,
        items_processed: usize,
        items_failed: usize,
    ) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE processing_jobs SET items_processed = ?2, items_failed = ?3 WHERE id = ?1",
                params![job_id, items_processed as i64, items_failed as i64],
            )?;
            Ok(())
        })
    }

    pub fn set_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE processing_jobs SET status = ?2, error_message = ?3, completed_at = ?4
                 WHERE id = ?1",
                params![
                    job_id,
                    status.as_str(),
                    error_message,
                    completed_at.map(|t| ts_to_sql(&t))
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_worker_task(
        &self,
        job_id: &str,
        batch_index: usize,
        task_id: &str,
    ) -> EngineResult<()> {
        self.with_conn(|conn| {
            let current: String = conn.query_row(
                "SELECT worker_task_ids_json FROM processing_jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )?;
            let mut map: HashMap<String, String> =
                serde_json::from_str(&current).unwrap_or_default();
            map.insert(batch_index.to_string(), task_id.to_string());
            conn.execute(
                "UPDATE processing_jobs SET worker_task_ids_json = ?2 WHERE id = ?1",
                params![job_id, serde_json::to_string(&map)?],
            )?;
            Ok(())
        })
    }

    pub fn bump_job_retry_count(&self, job_id: &str) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE processing_jobs SET retry_count = retry_count + 1 WHERE id = ?1",
                params![job_id],
            )?;
            Ok(())
        })
    }

    /// Drop terminal jobs older than `cutoff`. Returns the pruned count.
    pub fn prune_terminal_jobs(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM processing_jobs
                 WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < ?1",
                params![ts_to_sql(&cutoff)],
            )?;
            if deleted > 0 {
                debug!(count = deleted, "🧹 Pruned terminal jobs");
            }
            Ok(deleted)
        })
    }

    // ------------------------------------------------------------------
    // Fraud alerts
    // ------------------------------------------------------------------

    pub fn insert_fraud_alert(&self, alert: &FraudAlert) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fraud_alerts (id, project_id, transaction_id, alert_type, severity,
                    risk_score, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    alert.id,
                    alert.project_id,
                    alert.transaction_id,
                    alert.alert_type,
                    alert.severity.as_str(),
                    alert.risk_score,
                    alert.description,
                    ts_to_sql(&alert.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn recent_fraud_alerts(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<FraudAlert>> {
        self.with_conn(|conn| {
            let sql = match project_id {
                Some(_) => {
                    "SELECT id, project_id, transaction_id, alert_type, severity, risk_score,
                        description, created_at
                     FROM fraud_alerts WHERE project_id = ?1
                     ORDER BY created_at DESC LIMIT ?2"
                }
                None => {
                    "SELECT id, project_id, transaction_id, alert_type, severity, risk_score,
                        description, created_at
                     FROM fraud_alerts WHERE ?1 IS NULL
                     ORDER BY created_at DESC LIMIT ?2"
                }
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![project_id, limit as i64], |row| {
                Ok(FraudAlert {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    transaction_id: row.get(2)?,
                    alert_type: row.get(3)?,
                    severity: AlertSeverity::parse(&row.get::<_, String>(4)?)
                        .unwrap_or(AlertSeverity::Low),
                    risk_score: row.get(5)?,
                    description: row.get(6)?,
                    created_at: ts_from_sql(&row.get::<_, String>(7)?),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ------------------------------------------------------------------
    // Cases & exhibits
    // ------------------------------------------------------------------

    const CASE_COLS: &'static str = "id, project_id, title, description, status, risk_score,
        final_report_hash, sealed_at, sealed_by_id, created_at, updated_at";

    fn case_from_row(row: &Row<'_>) -> rusqlite::Result<Case> {
        Ok(Case {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            status: CaseStatus::parse(&row.get::<_, String>(4)?).unwrap_or(CaseStatus::New),
            risk_score: row.get(5)?,
            final_report_hash: row.get(6)?,
            sealed_at: opt_ts_from_sql(row.get(7)?),
            sealed_by_id: row.get(8)?,
            created_at: ts_from_sql(&row.get::<_, String>(9)?),
            updated_at: ts_from_sql(&row.get::<_, String>(10)?),
        })
    }

    pub fn insert_case(&self, case: &Case) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cases (id, project_id, title, description, status, risk_score,
                    final_report_hash, sealed_at, sealed_by_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    case.id,
                    case.project_id,
                    case.title,
                    case.description,
                    case.status.as_str(),
                    case.risk_score,
                    case.final_report_hash,
                    opt_ts_to_sql(&case.sealed_at),
                    case.sealed_by_id,
                    ts_to_sql(&case.created_at),
                    ts_to_sql(&case.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_case(&self, id: &str) -> EngineResult<Case> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM cases WHERE id = ?1", Self::CASE_COLS);
            conn.query_row(&sql, params![id], Self::case_from_row).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(format!("case {id}")),
                other => other.into(),
            })
        })
    }

    pub fn update_case(&self, case: &Case) -> EngineResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE cases SET title = ?2, description = ?3, status = ?4, risk_score = ?5,
                    final_report_hash = ?6, sealed_at = ?7, sealed_by_id = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    case.id,
                    case.title,
                    case.description,
                    case.status.as_str(),
                    case.risk_score,
                    case.final_report_hash,
                    opt_ts_to_sql(&case.sealed_at),
                    case.sealed_by_id,
                    ts_to_sql(&case.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(format!("case {}", case.id)));
            }
            Ok(())
        })
    }

    const EXHIBIT_COLS: &'static str = "id, case_id, evidence_type, evidence_id, label, verdict,
        adjudicated_at, adjudicated_by_id, ai_contradiction_note, hash_signature, metadata_json,
        created_at";

    fn exhibit_from_row(row: &Row<'_>) -> rusqlite::Result<CaseExhibit> {
        Ok(CaseExhibit {
            id: row.get(0)?,
            case_id: row.get(1)?,
            evidence_type: row.get(2)?,
            evidence_id: row.get(3)?,
            label: row.get(4)?,
            verdict: ExhibitVerdict::parse(&row.get::<_, String>(5)?)
                .unwrap_or(ExhibitVerdict::Pending),
            adjudicated_at: opt_ts_from_sql(row.get(6)?),
            adjudicated_by_id: row.get(7)?,
            ai_contradiction_note: row.get(8)?,
            hash_signature: row.get(9)?,
            metadata: json_map_from_sql(&row.get::<_, String>(10)?),
            created_at: ts_from_sql(&row.get::<_, String>(11)?),
        })
    }

    fn assert_case_mutable(conn: &Connection, case_id: &str) -> EngineResult<()> {
        let status: String = conn
            .query_row("SELECT status FROM cases WHERE id = ?1", params![case_id], |row| {
                row.get(0)
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("case {case_id}"))
                }
                other => other.into(),
            })?;
        if status == "sealed" {
            return Err(EngineError::Permanent(format!(
                "case {case_id} is sealed; exhibits are immutable"
            )));
        }
        Ok(())
    }

    pub fn insert_exhibit(&self, exhibit: &CaseExhibit) -> EngineResult<()> {
        self.with_conn(|conn| {
            Self::assert_case_mutable(conn, &exhibit.case_id)?;
            conn.execute(
                "INSERT INTO case_exhibits (id, case_id, evidence_type, evidence_id, label,
                    verdict, adjudicated_at, adjudicated_by_id, ai_contradiction_note,
                    hash_signature, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    exhibit.id,
                    exhibit.case_id,
                    exhibit.evidence_type,
                    exhibit.evidence_id,
                    exhibit.label,
                    exhibit.verdict.as_str(),
                    opt_ts_to_sql(&exhibit.adjudicated_at),
                    exhibit.adjudicated_by_id,
                    exhibit.ai_contradiction_note,
                    exhibit.hash_signature,
                    json_map_to_sql(&exhibit.metadata),
                    ts_to_sql(&exhibit.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_exhibit(&self, id: &str) -> EngineResult<CaseExhibit> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM case_exhibits WHERE id = ?1", Self::EXHIBIT_COLS);
            conn.query_row(&sql, params![id], Self::exhibit_from_row).map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("exhibit {id}"))
                }
                other => other.into(),
            })
        })
    }

    pub fn update_exhibit(&self, exhibit: &CaseExhibit) -> EngineResult<()> {
        self.with_conn(|conn| {
            Self::assert_case_mutable(conn, &exhibit.case_id)?;
            let changed = conn.execute(
                "UPDATE case_exhibits SET verdict = ?2, adjudicated_at = ?3,
                    adjudicated_by_id = ?4, ai_contradiction_note = ?5, hash_signature = ?6,
                    metadata_json = ?7
                 WHERE id = ?1",
                params![
                    exhibit.id,
                    exhibit.verdict.as_str(),
                    opt_ts_to_sql(&exhibit.adjudicated_at),
                    exhibit.adjudicated_by_id,
                    exhibit.ai_contradiction_note,
                    exhibit.hash_signature,
                    json_map_to_sql(&exhibit.metadata),
                ],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(format!("exhibit {}", exhibit.id)));
            }
            Ok(())
        })
    }

    pub fn list_exhibits(&self, case_id: &str) -> EngineResult<Vec<CaseExhibit>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM case_exhibits WHERE case_id = ?1 ORDER BY created_at",
                Self::EXHIBIT_COLS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![case_id], Self::exhibit_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ------------------------------------------------------------------
    // Integrity registry
    // ------------------------------------------------------------------

    pub fn insert_registry_entry(&self, entry: &RegistryEntry) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO integrity_registry (id, project_id, entity_type, entity_id,
                    file_hash, anchor_id, sealed_at, sealed_by_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id,
                    entry.project_id,
                    entry.entity_type.as_str(),
                    entry.entity_id,
                    entry.file_hash,
                    entry.anchor_id,
                    ts_to_sql(&entry.sealed_at),
                    entry.sealed_by_id,
                ],
            )?;
            Ok(())
        })
    }

    fn registry_from_row(row: &Row<'_>) -> rusqlite::Result<RegistryEntry> {
        Ok(RegistryEntry {
            id: row.get(0)?,
            project_id: row.get(1)?,
            entity_type: SealedEntityType::parse(&row.get::<_, String>(2)?)
                .unwrap_or(SealedEntityType::Dossier),
            entity_id: row.get(3)?,
            file_hash: row.get(4)?,
            anchor_id: row.get(5)?,
            sealed_at: ts_from_sql(&row.get::<_, String>(6)?),
            sealed_by_id: row.get(7)?,
        })
    }

    pub fn find_registry_entry_by_hash(&self, hash: &str) -> EngineResult<Option<RegistryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, entity_type, entity_id, file_hash, anchor_id, sealed_at,
                    sealed_by_id
                 FROM integrity_registry WHERE file_hash = ?1 LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![hash], Self::registry_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn last_registry_entry(&self, project_id: &str) -> EngineResult<Option<RegistryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, entity_type, entity_id, file_hash, anchor_id, sealed_at,
                    sealed_by_id
                 FROM integrity_registry WHERE project_id = ?1
                 ORDER BY sealed_at DESC, id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![project_id], Self::registry_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    // ------------------------------------------------------------------
    // Ownership graph & assets
    // ------------------------------------------------------------------

    pub fn insert_relationship(&self, rel: &CorporateRelationship) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO corporate_relationships (id, parent_entity_id, child_entity_id,
                    relationship_type, stake_percentage)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rel.id,
                    rel.parent_entity_id,
                    rel.child_entity_id,
                    rel.relationship_type,
                    rel.stake_percentage,
                ],
            )?;
            Ok(())
        })
    }

    fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<CorporateRelationship> {
        Ok(CorporateRelationship {
            id: row.get(0)?,
            parent_entity_id: row.get(1)?,
            child_entity_id: row.get(2)?,
            relationship_type: row.get(3)?,
            stake_percentage: row.get(4)?,
        })
    }

    pub fn parents_of(&self, child_entity_id: &str) -> EngineResult<Vec<CorporateRelationship>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, parent_entity_id, child_entity_id, relationship_type, stake_percentage
                 FROM corporate_relationships WHERE child_entity_id = ?1",
            )?;
            let rows = stmt.query_map(params![child_entity_id], Self::relationship_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn children_of(&self, parent_entity_id: &str) -> EngineResult<Vec<CorporateRelationship>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, parent_entity_id, child_entity_id, relationship_type, stake_percentage
                 FROM corporate_relationships WHERE parent_entity_id = ?1",
            )?;
            let rows = stmt.query_map(params![parent_entity_id], Self::relationship_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn insert_asset(&self, asset: &Asset) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO assets (id, project_id, name, asset_type, estimated_value,
                    purchase_date, owner_entity_id, is_frozen, location)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    asset.id,
                    asset.project_id,
                    asset.name,
                    asset.asset_type,
                    asset.estimated_value,
                    opt_ts_to_sql(&asset.purchase_date),
                    asset.owner_entity_id,
                    asset.is_frozen as i64,
                    asset.location,
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_assets(&self) -> EngineResult<Vec<Asset>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, name, asset_type, estimated_value, purchase_date,
                    owner_entity_id, is_frozen, location
                 FROM assets",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Asset {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    name: row.get(2)?,
                    asset_type: row.get(3)?,
                    estimated_value: row.get(4)?,
                    purchase_date: opt_ts_from_sql(row.get(5)?),
                    owner_entity_id: row.get(6)?,
                    is_frozen: row.get::<_, i64>(7)? != 0,
                    location: row.get(8)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn assets_owned_by(&self, owner_ids: &[String]) -> EngineResult<Vec<Asset>> {
        let mut out = Vec::new();
        for owner_id in owner_ids {
            self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, name, asset_type, estimated_value, purchase_date,
                        owner_entity_id, is_frozen, location
                     FROM assets WHERE owner_entity_id = ?1",
                )?;
                let rows = stmt.query_map(params![owner_id], |row| {
                    Ok(Asset {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        name: row.get(2)?,
                        asset_type: row.get(3)?,
                        estimated_value: row.get(4)?,
                        purchase_date: opt_ts_from_sql(row.get(5)?),
                        owner_entity_id: row.get(6)?,
                        is_frozen: row.get::<_, i64>(7)? != 0,
                        location: row.get(8)?,
                    })
                })?;
                out.extend(rows.collect::<rusqlite::Result<Vec<_>>>()?);
                Ok(())
            })?;
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Insights, ingestions, settings, query patterns, access
    // ------------------------------------------------------------------

    pub fn insert_insight(&self, insight: &CopilotInsight) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO copilot_insights (id, project_id, insight_type, title, content,
                    confidence, metadata_json, embedding_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    insight.id,
                    insight.project_id,
                    insight.insight_type,
                    insight.title,
                    insight.content,
                    insight.confidence,
                    json_map_to_sql(&insight.metadata),
                    embedding_to_sql(&insight.embedding),
                    ts_to_sql(&insight.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_insights(&self, project_id: &str) -> EngineResult<Vec<CopilotInsight>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, insight_type, title, content, confidence, metadata_json,
                    embedding_json, created_at
                 FROM copilot_insights WHERE project_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![project_id], |row| {
                Ok(CopilotInsight {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    insight_type: row.get(2)?,
                    title: row.get(3)?,
                    content: row.get(4)?,
                    confidence: row.get(5)?,
                    metadata: json_map_from_sql(&row.get::<_, String>(6)?),
                    embedding: embedding_from_sql(row.get(7)?),
                    created_at: ts_from_sql(&row.get::<_, String>(8)?),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn insert_ingestion(&self, record: &IngestionRecord) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ingestions (id, project_id, file_name, file_type, file_hash,
                    records_processed, status, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.project_id,
                    record.file_name,
                    record.file_type,
                    record.file_hash,
                    record.records_processed as i64,
                    record.status,
                    json_map_to_sql(&record.metadata),
                    ts_to_sql(&record.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_ingestion(&self, record: &IngestionRecord) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ingestions SET records_processed = ?2, status = ?3, metadata_json = ?4
                 WHERE id = ?1",
                params![
                    record.id,
                    record.records_processed as i64,
                    record.status,
                    json_map_to_sql(&record.metadata),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_ingestion(&self, id: &str) -> EngineResult<IngestionRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, project_id, file_name, file_type, file_hash, records_processed,
                    status, metadata_json, created_at
                 FROM ingestions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(IngestionRecord {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        file_name: row.get(2)?,
                        file_type: row.get(3)?,
                        file_hash: row.get(4)?,
                        records_processed: row.get::<_, i64>(5)? as usize,
                        status: row.get(6)?,
                        metadata: json_map_from_sql(&row.get::<_, String>(7)?),
                        created_at: ts_from_sql(&row.get::<_, String>(8)?),
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("ingestion {id}"))
                }
                other => other.into(),
            })
        })
    }

    pub fn settings_for(&self, project_id: &str) -> EngineResult<ReconciliationSettings> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, clearing_window_days, amount_tolerance_percent,
                    batch_window_days, auto_confirm_threshold
                 FROM reconciliation_settings WHERE project_id = ?1",
            )?;
            let mut rows = stmt.query_map(params![project_id], |row| {
                Ok(ReconciliationSettings {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    clearing_window_days: row.get(2)?,
                    amount_tolerance_percent: row.get(3)?,
                    batch_window_days: row.get(4)?,
                    auto_confirm_threshold: row.get(5)?,
                })
            })?;
            match rows.next().transpose()? {
                Some(settings) => Ok(settings),
                None => Ok(ReconciliationSettings::defaults(project_id)),
            }
        })
    }

    pub fn upsert_settings(&self, settings: &ReconciliationSettings) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reconciliation_settings (id, project_id, clearing_window_days,
                    amount_tolerance_percent, batch_window_days, auto_confirm_threshold)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(project_id) DO UPDATE SET
                    clearing_window_days = excluded.clearing_window_days,
                    amount_tolerance_percent = excluded.amount_tolerance_percent,
                    batch_window_days = excluded.batch_window_days,
                    auto_confirm_threshold = excluded.auto_confirm_threshold",
                params![
                    settings.id,
                    settings.project_id,
                    settings.clearing_window_days,
                    settings.amount_tolerance_percent,
                    settings.batch_window_days,
                    settings.auto_confirm_threshold,
                ],
            )?;
            Ok(())
        })
    }

    /// Record an operator query; duplicate text for the same user increments
    /// the frequency counter instead of inserting a new row.
    pub fn record_query_pattern(&self, pattern: &UserQueryPattern) -> EngineResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE user_query_patterns
                 SET query_frequency = query_frequency + 1, last_executed_at = ?3,
                     was_successful = ?4
                 WHERE user_id = ?1 AND query_text = ?2",
                params![
                    pattern.user_id,
                    pattern.query_text,
                    ts_to_sql(&pattern.last_executed_at),
                    pattern.was_successful as i64,
                ],
            )?;
            if updated == 0 {
                conn.execute(
                    "INSERT INTO user_query_patterns (id, user_id, project_id, query_text,
                        intent_type, was_successful, query_frequency, page_context, created_at,
                        last_executed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9)",
                    params![
                        pattern.id,
                        pattern.user_id,
                        pattern.project_id,
                        pattern.query_text,
                        pattern.intent_type,
                        pattern.was_successful as i64,
                        pattern.page_context,
                        ts_to_sql(&pattern.created_at),
                        ts_to_sql(&pattern.last_executed_at),
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn top_query_patterns(
        &self,
        user_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<UserQueryPattern>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, project_id, query_text, intent_type, was_successful,
                    query_frequency, page_context, created_at, last_executed_at
                 FROM user_query_patterns WHERE user_id = ?1
                 ORDER BY query_frequency DESC, last_executed_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok(UserQueryPattern {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    project_id: row.get(2)?,
                    query_text: row.get(3)?,
                    intent_type: row.get(4)?,
                    was_successful: row.get::<_, i64>(5)? != 0,
                    query_frequency: row.get::<_, i64>(6)? as u32,
                    page_context: row.get(7)?,
                    created_at: ts_from_sql(&row.get::<_, String>(8)?),
                    last_executed_at: ts_from_sql(&row.get::<_, String>(9)?),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn grant_project_access(&self, access: &UserProjectAccess) -> EngineResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_project_access (user_id, project_id, role, granted_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    access.user_id,
                    access.project_id,
                    access.role,
                    ts_to_sql(&access.granted_at)
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ForensicStore {
        ForensicStore::open_in_memory().unwrap()
    }

    fn seeded_project(store: &ForensicStore) -> Project {
        let project = Project::new("Test Audit", "CTR-001", 1_000_000_000.0, "PT Kontraktor");
        store.insert_project(&project).unwrap();
        project
    }

    #[test]
    fn project_code_is_unique() {
        let store = store();
        seeded_project(&store);
        let dup = Project::new("Second", "CTR-001", 1.0, "X");
        let err = store.insert_project(&dup).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn transaction_round_trips() {
        let store = store();
        let project = seeded_project(&store);
        let mut tx = Transaction::new(&project.id, 7_550_000.0, 5_250_000.0, "Kontraktor", "Bapa Banda")
            .with_description("Bapa Banda")
            .with_category(TransactionCategory::V);
        tx.aml_stage = Some(AmlStage::Placement);
        tx.delta_inflation = 2_300_000.0;
        store.insert_transaction(&tx).unwrap();

        let loaded = store.get_transaction(&tx.id).unwrap();
        assert_eq!(loaded.receiver, "Bapa Banda");
        assert_eq!(loaded.aml_stage, Some(AmlStage::Placement));
        assert!((loaded.delta_inflation - 2_300_000.0).abs() < 1e-9);
        assert_eq!(loaded.category, TransactionCategory::V);
    }

    #[test]
    fn status_filter_queries() {
        let store = store();
        let project = seeded_project(&store);
        let mut flagged = Transaction::new(&project.id, 0.0, 100.0, "A", "B");
        flagged.status = TransactionStatus::Flagged;
        store.insert_transaction(&flagged).unwrap();
        let pending = Transaction::new(&project.id, 0.0, 200.0, "A", "C");
        store.insert_transaction(&pending).unwrap();

        let hits = store
            .query_transactions(&TransactionFilter {
                project_id: Some(project.id.clone()),
                statuses: vec![TransactionStatus::Pending, TransactionStatus::Flagged],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 2);

        let only_flagged = store
            .query_transactions(&TransactionFilter {
                project_id: Some(project.id.clone()),
                statuses: vec![TransactionStatus::Flagged],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(only_flagged.len(), 1);
    }

    #[test]
    fn match_upsert_is_idempotent_per_pairing() {
        let store = store();
        let m = ReconciliationMatch::new("tx1", "bank1", 0.8, MatchType::Direct);
        let first = store.upsert_match(&m).unwrap();
        let again = ReconciliationMatch::new("tx1", "bank1", 0.95, MatchType::Direct);
        let second = store.upsert_match(&again).unwrap();
        assert_eq!(first.id, second.id);
        assert!((second.confidence_score - 0.95).abs() < 1e-9);
    }

    #[test]
    fn batch_completion_increments_atomically() {
        let store = store();
        let job = ProcessingJob {
            id: new_id(),
            project_id: None,
            data_type: "transaction".into(),
            status: JobStatus::Pending,
            total_items: 100,
            total_batches: 2,
            batches_completed: 0,
            items_processed: 0,
            items_failed: 0,
            batch_config: BatchConfig { size: 50, concurrency: 2, inter_batch_delay_ms: 0 },
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            worker_task_ids: HashMap::new(),
        };
        store.insert_job(&job).unwrap();
        store.record_batch_completion(&job.id, 48, 2).unwrap();
        store.record_batch_completion(&job.id, 50, 0).unwrap();
        let loaded = store.get_job(&job.id).unwrap();
        assert_eq!(loaded.batches_completed, 2);
        assert_eq!(loaded.items_processed, 98);
        assert_eq!(loaded.items_failed, 2);
    }

    #[test]
    fn sealed_case_rejects_exhibit_mutation() {
        let store = store();
        let project = seeded_project(&store);
        let mut case = Case::new(&project.id, "Leakage", "Funneling probe");
        store.insert_case(&case).unwrap();
        let mut exhibit = CaseExhibit::new(&case.id, "transaction", "tx-9", "Inflated invoice");
        exhibit.hash_signature = "abc".into();
        store.insert_exhibit(&exhibit).unwrap();

        case.status = CaseStatus::Sealed;
        case.sealed_at = Some(Utc::now());
        store.update_case(&case).unwrap();

        exhibit.verdict = ExhibitVerdict::Admitted;
        let err = store.update_exhibit(&exhibit).unwrap_err();
        assert!(matches!(err, EngineError::Permanent(_)), "got {err:?}");

        let late = CaseExhibit::new(&case.id, "entity", "ent-1", "Shell");
        let err = store.insert_exhibit(&late).unwrap_err();
        assert!(matches!(err, EngineError::Permanent(_)));
    }

    #[test]
    fn query_pattern_frequency_increments() {
        let store = store();
        let pattern = UserQueryPattern {
            id: new_id(),
            user_id: "u1".into(),
            project_id: None,
            query_text: "show flagged".into(),
            intent_type: "sql_query".into(),
            was_successful: true,
            query_frequency: 1,
            page_context: None,
            created_at: Utc::now(),
            last_executed_at: Utc::now(),
        };
        store.record_query_pattern(&pattern).unwrap();
        store.record_query_pattern(&pattern).unwrap();
        let top = store.top_query_patterns("u1", 5).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].query_frequency, 2);
    }

    #[test]
    fn access_grant_unique_per_user_project() {
        let store = store();
        let project = seeded_project(&store);
        let access = UserProjectAccess {
            user_id: "u1".into(),
            project_id: project.id.clone(),
            role: "analyst".into(),
            granted_at: Utc::now(),
        };
        store.grant_project_access(&access).unwrap();
        let err = store.grant_project_access(&access).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }
}
