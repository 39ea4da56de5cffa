//! Beneficial-ownership resolution and asset-temporal nexus.
//!
//! UBO resolution walks ownership edges upward from a target entity with a
//! visited-set cycle guard and a depth cap of 10. Person parents are
//! candidates when their stake reaches 25% or the relationship is a
//! non-shareholder control edge; company parents recurse with effective
//! stakes multiplied down the chain.

use crate::errors::EngineResult;
use crate::events::{EventBus, EventKind};
use crate::models::{Asset, EntityType, Transaction};
use crate::store::{ForensicStore, TransactionFilter};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const MAX_UBO_DEPTH: usize = 10;
const UBO_STAKE_THRESHOLD: f64 = 25.0;
const SUSPECT_RISK_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct UboCandidate {
    pub entity_id: String,
    pub name: String,
    /// Effective stake through the chain; 0 for control-only relationships.
    pub stake: f64,
    pub control_type: String,
    pub is_ubo_candidate: bool,
    pub path_depth: usize,
    pub intermediate_company: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssetNexusFinding {
    pub asset_id: String,
    pub asset_name: String,
    pub owner_entity_id: String,
    pub estimated_value: f64,
    pub is_frozen: bool,
    /// 0.9 within 30 days of a suspect transaction, 0.5 within 90, else 0.
    pub temporal_proximity: f64,
}

pub struct OwnershipEngine {
    store: ForensicStore,
    bus: Arc<EventBus>,
}

impl OwnershipEngine {
    pub fn new(store: ForensicStore, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Resolve the individuals who own or control `entity_id` through any
    /// number of corporate layers. Publishes `correlation.found` per UBO
    /// candidate.
    pub fn resolve_ubo(&self, entity_id: &str) -> EngineResult<Vec<UboCandidate>> {
        let mut visited = HashSet::new();
        let owners = self.walk_owners(entity_id, 0, &mut visited)?;
        for owner in owners.iter().filter(|o| o.is_ubo_candidate) {
            self.bus.publish(
                EventKind::CorrelationFound,
                json!({
                    "correlation_type": "BeneficialOwnership",
                    "entity_id": owner.entity_id,
                    "details": {
                        "name": owner.name,
                        "stake": owner.stake,
                        "control_type": owner.control_type,
                        "path_depth": owner.path_depth,
                        "intermediate_company": owner.intermediate_company,
                    },
                }),
            );
        }
        Ok(owners)
    }

    fn walk_owners(
        &self,
        entity_id: &str,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> EngineResult<Vec<UboCandidate>> {
        if depth > MAX_UBO_DEPTH || !visited.insert(entity_id.to_string()) {
            return Ok(Vec::new());
        }
        let mut owners = Vec::new();
        for rel in self.store.parents_of(entity_id)? {
            let parent = match self.store.get_entity(&rel.parent_entity_id) {
                Ok(parent) => parent,
                Err(_) => continue,
            };
            let control_only = rel.relationship_type != "SHAREHOLDER";
            if parent.entity_type == EntityType::Person {
                let stake = if control_only { 0.0 } else { rel.stake_percentage };
                owners.push(UboCandidate {
                    entity_id: parent.id.clone(),
                    name: parent.name.clone(),
                    stake,
                    control_type: rel.relationship_type.clone(),
                    is_ubo_candidate: rel.stake_percentage >= UBO_STAKE_THRESHOLD || control_only,
                    path_depth: depth,
                    intermediate_company: None,
                });
            } else {
                // Company parent: recurse and multiply stakes down the chain.
                let sub_owners = self.walk_owners(&parent.id, depth + 1, visited)?;
                for sub in sub_owners {
                    let effective = (sub.stake * rel.stake_percentage) / 100.0;
                    owners.push(UboCandidate {
                        is_ubo_candidate: effective >= UBO_STAKE_THRESHOLD
                            || sub.is_ubo_candidate,
                        stake: effective,
                        intermediate_company: Some(parent.name.clone()),
                        ..sub
                    });
                }
            }
        }
        Ok(owners)
    }

    /// Suspect entities of a project: receivers of transactions with risk at
    /// or above the suspect threshold.
    fn suspect_entities(&self, project_id: &str) -> EngineResult<(Vec<String>, Vec<Transaction>)> {
        let suspect_txs = self.store.query_transactions(&TransactionFilter {
            project_id: Some(project_id.to_string()),
            min_risk: Some(SUSPECT_RISK_THRESHOLD - f64::EPSILON),
            ..Default::default()
        })?;
        let mut names: Vec<String> = suspect_txs.iter().map(|t| t.receiver.clone()).collect();
        names.sort();
        names.dedup();
        let ids = self
            .store
            .entities_by_names(&names)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        Ok((ids, suspect_txs))
    }

    /// Asset-temporal nexus: expand the suspect set one ownership hop up and
    /// down (plus grandparents), then score each owned asset by purchase-date
    /// proximity to suspect disbursements.
    pub fn asset_temporal_nexus(&self, project_id: &str) -> EngineResult<Vec<AssetNexusFinding>> {
        let (suspect_ids, suspect_txs) = self.suspect_entities(project_id)?;
        if suspect_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut linked: HashSet<String> = suspect_ids.iter().cloned().collect();
        for suspect in &suspect_ids {
            for rel in self.store.children_of(suspect)? {
                linked.insert(rel.child_entity_id);
            }
            let owners = self.store.parents_of(suspect)?;
            for rel in &owners {
                linked.insert(rel.parent_entity_id.clone());
            }
            for rel in owners {
                for grand in self.store.parents_of(&rel.parent_entity_id)? {
                    linked.insert(grand.parent_entity_id);
                }
            }
        }

        let mut owner_ids: Vec<String> = linked.into_iter().collect();
        owner_ids.sort();
        let assets = self.store.assets_owned_by(&owner_ids)?;

        let mut findings = Vec::new();
        for asset in assets {
            let proximity = Self::temporal_proximity(&asset, &suspect_txs);
            let finding = AssetNexusFinding {
                asset_id: asset.id.clone(),
                asset_name: asset.name.clone(),
                owner_entity_id: asset.owner_entity_id.clone(),
                estimated_value: asset.estimated_value,
                is_frozen: asset.is_frozen,
                temporal_proximity: proximity,
            };
            if proximity > 0.5 {
                self.bus.publish_with(
                    EventKind::CorrelationFound,
                    json!({
                        "correlation_type": "AssetTemporalNexus",
                        "asset_id": finding.asset_id,
                        "project_id": project_id,
                        "details": {
                            "asset": finding.asset_name,
                            "value": finding.estimated_value,
                            "temporal_nexus": finding.temporal_proximity,
                        },
                    }),
                    None,
                    Some(project_id.to_string()),
                );
            }
            findings.push(finding);
        }
        debug!(project = project_id, assets = findings.len(), "Asset nexus scan complete");
        Ok(findings)
    }

    fn temporal_proximity(asset: &Asset, suspect_txs: &[Transaction]) -> f64 {
        let purchase = match asset.purchase_date {
            Some(date) => date,
            None => return 0.0,
        };
        let mut proximity: f64 = 0.0;
        for tx in suspect_txs {
            let delta_days = (purchase - tx.effective_date()).num_days().abs();
            if delta_days <= 30 {
                proximity = proximity.max(0.9);
            } else if delta_days <= 90 {
                proximity = proximity.max(0.5);
            }
        }
        proximity
    }
}
