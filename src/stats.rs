//! War-room aggregates: global leakage, threat volume, recovery potential and
//! geographic hotspots across all engagements.

use crate::errors::EngineResult;
use crate::models::{AlertSeverity, TransactionCategory};
use crate::store::ForensicStore;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

pub struct AuditStatsService {
    store: ForensicStore,
}

impl AuditStatsService {
    pub fn new(store: ForensicStore) -> Self {
        Self { store }
    }

    /// Cross-project dashboard aggregates.
    pub fn global_stats(&self) -> EngineResult<Value> {
        let projects = self.store.list_projects()?;
        let mut total_leakage = 0.0f64;
        let mut personal_leakage = 0.0f64;
        let mut hotspots: Vec<Value> = Vec::new();

        for project in &projects {
            let transactions = self.store.list_transactions(&project.id)?;
            let project_leakage: f64 = transactions
                .iter()
                .filter(|t| t.delta_inflation > 0.0)
                .map(|t| t.delta_inflation)
                .sum();
            total_leakage += project_leakage;
            personal_leakage += transactions
                .iter()
                .filter(|t| t.category == TransactionCategory::XP)
                .map(|t| t.actual_amount)
                .sum::<f64>();

            if let (Some(lat), Some(lon)) = (project.latitude, project.longitude) {
                if project_leakage > 0.0 {
                    let severity = if project.contract_value > 0.0 {
                        (project_leakage / (project.contract_value * 0.1)).min(1.0)
                    } else {
                        0.0
                    };
                    hotspots.push(json!({
                        "id": project.id,
                        "location": {
                            "lat": lat,
                            "lng": lon,
                            "name": project.site_location.clone().unwrap_or_else(|| project.name.clone()),
                        },
                        "severity": (severity * 100.0).round() / 100.0,
                        "value": project_leakage,
                        "root_cause": "Inflation Detected",
                    }));
                }
            }
        }

        let alerts = self.store.recent_fraud_alerts(None, 500)?;
        let day_ago = Utc::now() - Duration::hours(24);
        let threats_24h = alerts.iter().filter(|a| a.created_at > day_ago).count();
        let critical_open = alerts
            .iter()
            .filter(|a| a.severity == AlertSeverity::Critical)
            .count();

        let assets = self.store.list_assets()?;
        let recovery_value: f64 = assets.iter().map(|a| a.estimated_value).sum();
        let frozen_value: f64 =
            assets.iter().filter(|a| a.is_frozen).map(|a| a.estimated_value).sum();

        Ok(json!({
            "total_leakage_identified": total_leakage + personal_leakage,
            "inflation_leakage": total_leakage,
            "personal_leakage": personal_leakage,
            "active_investigations": projects.len(),
            "threat_alerts_24h": threats_24h,
            "critical_alerts": critical_open,
            "recovery_potential_value": recovery_value,
            "frozen_assets_value": frozen_value,
            "hotspots": hotspots,
        }))
    }
}
