//! Canonical data model for the forensic analytics engine.
//!
//! Every entity carries an opaque UUID-shaped string id. Timestamps are UTC.
//! Monetary amounts are f64 with two-decimal display semantics; `IDR` is the
//! default currency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Default currency for all amounts unless a row says otherwise.
pub const DEFAULT_CURRENCY: &str = "IDR";

/// Ledger row category codes.
///
/// `MAT` is kept distinct from `P`: the cross-project capital detector relies
/// on it as the capital-inflow marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionCategory {
    /// Personal leakage
    XP,
    /// Vendor
    V,
    /// Project
    P,
    /// Field
    F,
    /// Bank-specific / unverified
    U,
    /// Materials / capital
    MAT,
}

impl TransactionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionCategory::XP => "XP",
            TransactionCategory::V => "V",
            TransactionCategory::P => "P",
            TransactionCategory::F => "F",
            TransactionCategory::U => "U",
            TransactionCategory::MAT => "MAT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "XP" => Some(TransactionCategory::XP),
            "V" => Some(TransactionCategory::V),
            "P" => Some(TransactionCategory::P),
            "F" => Some(TransactionCategory::F),
            "U" => Some(TransactionCategory::U),
            "MAT" => Some(TransactionCategory::MAT),
            _ => None,
        }
    }
}

/// Transaction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Flagged,
    Matched,
    Locked,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Flagged => "flagged",
            TransactionStatus::Matched => "matched",
            TransactionStatus::Locked => "locked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "flagged" => Some(TransactionStatus::Flagged),
            "matched" => Some(TransactionStatus::Matched),
            "locked" => Some(TransactionStatus::Locked),
            _ => None,
        }
    }
}

/// Investigator verification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    #[serde(rename = "UNVERIFIED")]
    Unverified,
    #[serde(rename = "VERIFIED")]
    Verified,
    #[serde(rename = "EXCLUDED")]
    Excluded,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "UNVERIFIED",
            VerificationStatus::Verified => "VERIFIED",
            VerificationStatus::Excluded => "EXCLUDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNVERIFIED" => Some(VerificationStatus::Unverified),
            "VERIFIED" => Some(VerificationStatus::Verified),
            "EXCLUDED" => Some(VerificationStatus::Excluded),
            _ => None,
        }
    }
}

/// Anti-money-laundering stage classification.
///
/// Ordered by specificity: a trigger may only raise the stage, never lower it
/// (`PLACEMENT < LAYERING < INTEGRATION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AmlStage {
    #[serde(rename = "PLACEMENT")]
    Placement,
    #[serde(rename = "LAYERING")]
    Layering,
    #[serde(rename = "INTEGRATION")]
    Integration,
}

impl AmlStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmlStage::Placement => "PLACEMENT",
            AmlStage::Layering => "LAYERING",
            AmlStage::Integration => "INTEGRATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PLACEMENT" => Some(AmlStage::Placement),
            "LAYERING" => Some(AmlStage::Layering),
            "INTEGRATION" => Some(AmlStage::Integration),
            _ => None,
        }
    }

    /// Raise `current` to `candidate` only when the candidate is more specific.
    pub fn escalate(current: Option<AmlStage>, candidate: AmlStage) -> Option<AmlStage> {
        match current {
            None => Some(candidate),
            Some(existing) if candidate > existing => Some(candidate),
            Some(existing) => Some(existing),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Company,
    BankAccount,
    Unknown,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Company => "company",
            EntityType::BankAccount => "bank_account",
            EntityType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(EntityType::Person),
            "company" => Some(EntityType::Company),
            "bank_account" => Some(EntityType::BankAccount),
            "unknown" => Some(EntityType::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    AuditMode,
    Active,
    Stalled,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::AuditMode => "audit_mode",
            ProjectStatus::Active => "active",
            ProjectStatus::Stalled => "stalled",
            ProjectStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audit_mode" => Some(ProjectStatus::AuditMode),
            "active" => Some(ProjectStatus::Active),
            "stalled" => Some(ProjectStatus::Stalled),
            "completed" => Some(ProjectStatus::Completed),
            _ => None,
        }
    }
}

/// An audit engagement. The `code` is immutable and unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub code: String,
    pub contract_value: f64,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub contractor_name: String,
    pub status: ProjectStatus,
    pub site_location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: &str, code: &str, contract_value: f64, contractor: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            code: code.to_string(),
            contract_value,
            start_date: Utc::now(),
            end_date: None,
            contractor_name: contractor.to_string(),
            status: ProjectStatus::AuditMode,
            site_location: None,
            latitude: None,
            longitude: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_site(mut self, label: &str, lat: f64, lon: f64) -> Self {
        self.site_location = Some(label.to_string());
        self.latitude = Some(lat);
        self.longitude = Some(lon);
        self
    }
}

/// A party in the forensic graph (person, company, bank account).
///
/// Created only by the entity resolver; mutated only via resolver upserts and
/// risk propagation. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub project_id: Option<String>,
    pub name: String,
    pub entity_type: EntityType,
    pub risk_score: f64,
    pub is_watchlisted: bool,
    /// Known keys: `aliases: [string]`, `account_number`, `alias_id`.
    /// Unknown keys are preserved verbatim.
    pub metadata: HashMap<String, Value>,
    pub embedding: Option<Vec<f64>>,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: &str, entity_type: EntityType) -> Self {
        Self {
            id: new_id(),
            project_id: None,
            name: name.to_string(),
            entity_type,
            risk_score: 0.0,
            is_watchlisted: false,
            metadata: HashMap::new(),
            embedding: None,
            created_at: Utc::now(),
        }
    }

    pub fn aliases(&self) -> Vec<String> {
        self.metadata
            .get("aliases")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn push_alias(&mut self, alias: &str) -> bool {
        let mut aliases = self.aliases();
        if aliases.iter().any(|a| a == alias) {
            return false;
        }
        aliases.push(alias.to_string());
        self.metadata.insert(
            "aliases".to_string(),
            Value::Array(aliases.into_iter().map(Value::String).collect()),
        );
        true
    }
}

/// A ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub project_id: Option<String>,
    pub proposed_amount: f64,
    pub actual_amount: f64,
    pub currency: String,
    pub sender: String,
    pub receiver: String,
    pub sender_entity_id: Option<String>,
    pub receiver_entity_id: Option<String>,
    pub description: Option<String>,
    pub category: TransactionCategory,
    /// Account label from the source ledger (e.g. "921", "Main").
    pub account_label: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Actual date on the document, when it differs from `timestamp`.
    pub transaction_date: Option<DateTime<Utc>>,
    pub risk_score: f64,
    pub status: TransactionStatus,
    pub verification_status: VerificationStatus,
    pub aml_stage: Option<AmlStage>,
    pub batch_reference: Option<String>,
    pub audit_comment: Option<String>,
    /// Encrypted at rest by the field-encryption collaborator; the engine
    /// only carries the ciphertext.
    pub investigator_note_enc: Option<String>,
    pub is_redacted: bool,
    pub potential_misappropriation: bool,
    pub is_circular: bool,
    pub needs_proof: bool,
    pub is_inferred: bool,
    /// Derived: `max(0, proposed_amount - actual_amount)`.
    pub delta_inflation: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Accumulated trigger text, deduped, joined by "; ".
    pub mens_rea_description: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub embedding: Option<Vec<f64>>,
}

impl Transaction {
    pub fn new(project_id: &str, proposed: f64, actual: f64, sender: &str, receiver: &str) -> Self {
        Self {
            id: new_id(),
            project_id: Some(project_id.to_string()),
            proposed_amount: proposed,
            actual_amount: actual,
            currency: DEFAULT_CURRENCY.to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            sender_entity_id: None,
            receiver_entity_id: None,
            description: None,
            category: TransactionCategory::P,
            account_label: None,
            timestamp: Utc::now(),
            transaction_date: None,
            risk_score: 0.0,
            status: TransactionStatus::Pending,
            verification_status: VerificationStatus::Unverified,
            aml_stage: None,
            batch_reference: None,
            audit_comment: None,
            investigator_note_enc: None,
            is_redacted: false,
            potential_misappropriation: false,
            is_circular: false,
            needs_proof: false,
            is_inferred: false,
            delta_inflation: 0.0,
            latitude: None,
            longitude: None,
            mens_rea_description: None,
            metadata: HashMap::new(),
            embedding: None,
        }
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = Some(desc.to_string());
        self
    }

    pub fn with_category(mut self, category: TransactionCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_audit_comment(mut self, comment: &str) -> Self {
        self.audit_comment = Some(comment.to_string());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_coordinates(mut self, lat: f64, lon: f64) -> Self {
        self.latitude = Some(lat);
        self.longitude = Some(lon);
        self
    }

    /// Effective document date: explicit `transaction_date` wins over the
    /// ingestion timestamp.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.transaction_date.unwrap_or(self.timestamp)
    }

    /// Append a trigger description to `mens_rea_description`, deduped.
    pub fn append_mens_rea(&mut self, note: &str) {
        match &mut self.mens_rea_description {
            Some(existing) => {
                if !existing.split("; ").any(|part| part == note) {
                    existing.push_str("; ");
                    existing.push_str(note);
                }
            }
            None => self.mens_rea_description = Some(note.to_string()),
        }
    }
}

/// A bank statement row. Immutable post-ingestion; the match pointer is
/// maintained by the reconciliation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: String,
    pub project_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub bank_name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub booking_date: Option<DateTime<Utc>>,
    pub batch_reference: Option<String>,
    pub embedding: Option<Vec<f64>>,
}

impl BankTransaction {
    pub fn new(project_id: &str, amount: f64, bank_name: &str, description: &str) -> Self {
        Self {
            id: new_id(),
            project_id: Some(project_id.to_string()),
            amount,
            currency: DEFAULT_CURRENCY.to_string(),
            bank_name: bank_name.to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
            booking_date: None,
            batch_reference: None,
            embedding: None,
        }
    }

    pub fn effective_date(&self) -> DateTime<Utc> {
        self.booking_date.unwrap_or(self.timestamp)
    }
}

/// Match production mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Direct,
    Aggregate,
    FuzzyVector,
    Proportional,
    Semantic,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Direct => "direct",
            MatchType::Aggregate => "aggregate",
            MatchType::FuzzyVector => "fuzzy_vector",
            MatchType::Proportional => "proportional",
            MatchType::Semantic => "semantic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(MatchType::Direct),
            "aggregate" => Some(MatchType::Aggregate),
            "fuzzy_vector" => Some(MatchType::FuzzyVector),
            "proportional" => Some(MatchType::Proportional),
            "semantic" => Some(MatchType::Semantic),
            _ => None,
        }
    }
}

/// A proposed or confirmed ledger-to-bank pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationMatch {
    pub id: String,
    pub internal_tx_id: String,
    pub bank_tx_id: String,
    pub confidence_score: f64,
    pub confirmed: bool,
    pub matched_at: DateTime<Utc>,
    pub match_type: MatchType,
    /// Structured factor string: `"AmtΔN | Dd (Window:Wd) | Channel:X ... | TIER_k | GATE"`.
    pub ai_reasoning: Option<String>,
}

impl ReconciliationMatch {
    pub fn new(internal_tx_id: &str, bank_tx_id: &str, confidence: f64, match_type: MatchType) -> Self {
        Self {
            id: new_id(),
            internal_tx_id: internal_tx_id.to_string(),
            bank_tx_id: bank_tx_id.to_string(),
            confidence_score: confidence,
            confirmed: false,
            matched_at: Utc::now(),
            match_type,
            ai_reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: String) -> Self {
        self.ai_reasoning = Some(reasoning);
        self
    }
}

/// Append-only change record, chained with `previous_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by_user_id: Option<String>,
    pub change_reason: Option<String>,
    pub previous_hash: Option<String>,
    pub hash_signature: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    New,
    Investigating,
    Resolved,
    Closed,
    Sealed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::New => "new",
            CaseStatus::Investigating => "investigating",
            CaseStatus::Resolved => "resolved",
            CaseStatus::Closed => "closed",
            CaseStatus::Sealed => "sealed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(CaseStatus::New),
            "investigating" => Some(CaseStatus::Investigating),
            "resolved" => Some(CaseStatus::Resolved),
            "closed" => Some(CaseStatus::Closed),
            "sealed" => Some(CaseStatus::Sealed),
            _ => None,
        }
    }
}

/// An investigation container. Once `Sealed`, exhibits and the final report
/// hash are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub description: String,
    pub status: CaseStatus,
    pub risk_score: f64,
    pub final_report_hash: Option<String>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub sealed_by_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    pub fn new(project_id: &str, title: &str, description: &str) -> Self {
        Self {
            id: new_id(),
            project_id: Some(project_id.to_string()),
            title: title.to_string(),
            description: description.to_string(),
            status: CaseStatus::New,
            risk_score: 0.0,
            final_report_hash: None,
            sealed_at: None,
            sealed_by_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExhibitVerdict {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ADMITTED")]
    Admitted,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl ExhibitVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhibitVerdict::Pending => "PENDING",
            ExhibitVerdict::Admitted => "ADMITTED",
            ExhibitVerdict::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ExhibitVerdict::Pending),
            "ADMITTED" => Some(ExhibitVerdict::Admitted),
            "REJECTED" => Some(ExhibitVerdict::Rejected),
            _ => None,
        }
    }
}

/// Formalized evidence entry within a case. Hash-signed at admission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseExhibit {
    pub id: String,
    pub case_id: String,
    pub evidence_type: String,
    pub evidence_id: String,
    pub label: String,
    pub verdict: ExhibitVerdict,
    pub adjudicated_at: Option<DateTime<Utc>>,
    pub adjudicated_by_id: Option<String>,
    pub ai_contradiction_note: Option<String>,
    pub hash_signature: String,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl CaseExhibit {
    pub fn new(case_id: &str, evidence_type: &str, evidence_id: &str, label: &str) -> Self {
        Self {
            id: format!("EXE-{}", Uuid::new_v4().simple().to_string()[..8].to_uppercase()),
            case_id: case_id.to_string(),
            evidence_type: evidence_type.to_string(),
            evidence_id: evidence_id.to_string(),
            label: label.to_string(),
            verdict: ExhibitVerdict::Pending,
            adjudicated_at: None,
            adjudicated_by_id: None,
            ai_contradiction_note: None,
            hash_signature: String::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Background job processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Batch worker parameters chosen by the optimizer at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub size: usize,
    pub concurrency: usize,
    pub inter_batch_delay_ms: u64,
}

/// A batch run over a large input.
///
/// `progress_percent` and `success_rate` are derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: String,
    pub project_id: Option<String>,
    pub data_type: String,
    pub status: JobStatus,
    pub total_items: usize,
    pub total_batches: usize,
    pub batches_completed: usize,
    pub items_processed: usize,
    pub items_failed: usize,
    pub batch_config: BatchConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// batch_index -> opaque worker task id
    pub worker_task_ids: HashMap<String, String>,
}

impl ProcessingJob {
    pub fn progress_percent(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.items_processed as f64 / self.total_items as f64) * 100.0
    }

    pub fn success_rate(&self) -> f64 {
        let attempted = self.items_processed + self.items_failed;
        if attempted == 0 {
            return 0.0;
        }
        (self.items_processed as f64 / attempted as f64) * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "Low",
            AlertSeverity::Medium => "Medium",
            AlertSeverity::High => "High",
            AlertSeverity::Critical => "Critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Low" => Some(AlertSeverity::Low),
            "Medium" => Some(AlertSeverity::Medium),
            "High" => Some(AlertSeverity::High),
            "Critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

/// Persisted alert derived from triggers or monitor checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudAlert {
    pub id: String,
    pub project_id: Option<String>,
    pub transaction_id: Option<String>,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub risk_score: f64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl FraudAlert {
    pub fn new(alert_type: &str, severity: AlertSeverity, description: &str) -> Self {
        Self {
            id: new_id(),
            project_id: None,
            transaction_id: None,
            alert_type: alert_type.to_string(),
            severity,
            risk_score: 0.0,
            description: description.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Sealed artifact kind in the integrity registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealedEntityType {
    #[serde(rename = "DOSSIER")]
    Dossier,
    #[serde(rename = "EXHIBIT")]
    Exhibit,
    #[serde(rename = "TRANSACTION_SET")]
    TransactionSet,
}

impl SealedEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealedEntityType::Dossier => "DOSSIER",
            SealedEntityType::Exhibit => "EXHIBIT",
            SealedEntityType::TransactionSet => "TRANSACTION_SET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DOSSIER" => Some(SealedEntityType::Dossier),
            "EXHIBIT" => Some(SealedEntityType::Exhibit),
            "TRANSACTION_SET" => Some(SealedEntityType::TransactionSet),
            _ => None,
        }
    }
}

/// Sealed-artifact ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub project_id: String,
    pub entity_type: SealedEntityType,
    pub entity_id: String,
    pub file_hash: String,
    pub anchor_id: Option<String>,
    pub sealed_at: DateTime<Utc>,
    pub sealed_by_id: String,
}

/// Ownership / control edge for UBO resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorporateRelationship {
    pub id: String,
    pub parent_entity_id: String,
    pub child_entity_id: String,
    /// SHAREHOLDER, DIRECTOR, BENEFICIAL_OWNER
    pub relationship_type: String,
    pub stake_percentage: f64,
}

impl CorporateRelationship {
    pub fn new(parent: &str, child: &str, relationship_type: &str, stake: f64) -> Self {
        Self {
            id: new_id(),
            parent_entity_id: parent.to_string(),
            child_entity_id: child.to_string(),
            relationship_type: relationship_type.to_string(),
            stake_percentage: stake,
        }
    }
}

/// A trackable asset linked to an investigated entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub project_id: Option<String>,
    pub name: String,
    pub asset_type: String,
    pub estimated_value: f64,
    pub purchase_date: Option<DateTime<Utc>>,
    pub owner_entity_id: String,
    pub is_frozen: bool,
    pub location: Option<String>,
}

impl Asset {
    pub fn new(name: &str, asset_type: &str, value: f64, owner_entity_id: &str) -> Self {
        Self {
            id: new_id(),
            project_id: None,
            name: name.to_string(),
            asset_type: asset_type.to_string(),
            estimated_value: value,
            purchase_date: None,
            owner_entity_id: owner_entity_id.to_string(),
            is_frozen: false,
            location: None,
        }
    }
}

/// High-level analytic finding (Benford violations, smurfing bursts,
/// cross-project loops). Stored with an optional embedding for retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotInsight {
    pub id: String,
    pub project_id: String,
    /// PATTERN, ANOMALY, SMURFING, CIRCULAR
    pub insight_type: String,
    pub title: String,
    pub content: String,
    pub confidence: f64,
    pub metadata: HashMap<String, Value>,
    pub embedding: Option<Vec<f64>>,
    pub created_at: DateTime<Utc>,
}

impl CopilotInsight {
    pub fn new(project_id: &str, insight_type: &str, title: &str, content: &str) -> Self {
        Self {
            id: new_id(),
            project_id: project_id.to_string(),
            insight_type: insight_type.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            confidence: 0.0,
            metadata: HashMap::new(),
            embedding: None,
            created_at: Utc::now(),
        }
    }
}

/// Tracks a specific file import session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub id: String,
    pub project_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_hash: String,
    pub records_processed: usize,
    /// completed, failed, warning
    pub status: String,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Per-project reconciliation sensitivity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSettings {
    pub id: String,
    pub project_id: String,
    pub clearing_window_days: i64,
    pub amount_tolerance_percent: f64,
    pub batch_window_days: i64,
    pub auto_confirm_threshold: f64,
}

impl ReconciliationSettings {
    pub fn defaults(project_id: &str) -> Self {
        Self {
            id: new_id(),
            project_id: project_id.to_string(),
            clearing_window_days: 7,
            amount_tolerance_percent: 0.5,
            batch_window_days: 10,
            auto_confirm_threshold: 0.98,
        }
    }
}

/// Operator query telemetry for personalized suggestions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQueryPattern {
    pub id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub query_text: String,
    pub intent_type: String,
    pub was_successful: bool,
    pub query_frequency: u32,
    pub page_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_executed_at: DateTime<Utc>,
}

/// Project-access grant. A single model; role granularity is the caller's
/// concern (authz itself lives outside the core).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProjectAccess {
    pub user_id: String,
    pub project_id: String,
    pub role: String,
    pub granted_at: DateTime<Utc>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub monitor_interval_secs: u64,
    pub balance_gap_threshold: f64,
    pub max_job_items: usize,
    pub worker_pool_cap: usize,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub batch_soft_timeout_secs: u64,
    pub batch_hard_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "./ledgerhawk.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let monitor_interval_secs = std::env::var("MONITOR_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let balance_gap_threshold = std::env::var("BALANCE_GAP_THRESHOLD")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000.0);

        let max_job_items = std::env::var("MAX_JOB_ITEMS")
            .unwrap_or_else(|_| "1000000".to_string())
            .parse()
            .unwrap_or(1_000_000);

        let worker_pool_cap = std::env::var("WORKER_POOL_CAP")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .unwrap_or(8);

        let retry_base_delay_secs = std::env::var("RETRY_BASE_DELAY_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let retry_max_delay_secs = std::env::var("RETRY_MAX_DELAY_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .unwrap_or(600);

        let batch_soft_timeout_secs = std::env::var("BATCH_SOFT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "240".to_string())
            .parse()
            .unwrap_or(240);

        let batch_hard_timeout_secs = std::env::var("BATCH_HARD_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        Ok(Self {
            database_path,
            port,
            monitor_interval_secs,
            balance_gap_threshold,
            max_job_items,
            worker_pool_cap,
            retry_base_delay_secs,
            retry_max_delay_secs,
            batch_soft_timeout_secs,
            batch_hard_timeout_secs,
        })
    }
}
