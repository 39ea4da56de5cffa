//! Ownership-graph resolution tests.

use crate::events::{EventBus, EventKind};
use crate::graph::ubo::OwnershipEngine;
use crate::models::*;
use crate::store::ForensicStore;
use chrono::{Duration, Utc};
use std::sync::Arc;

fn setup() -> (OwnershipEngine, ForensicStore, Arc<EventBus>) {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    (OwnershipEngine::new(store.clone(), bus.clone()), store, bus)
}

fn entity(store: &ForensicStore, name: &str, entity_type: EntityType) -> Entity {
    let e = Entity::new(name, entity_type);
    store.insert_entity(&e).unwrap();
    e
}

#[test]
fn direct_person_shareholder_above_25_is_candidate() {
    let (engine, store, bus) = setup();
    let company = entity(&store, "PT Operasi", EntityType::Company);
    let person = entity(&store, "Budi", EntityType::Person);
    store
        .insert_relationship(&CorporateRelationship::new(&person.id, &company.id, "SHAREHOLDER", 40.0))
        .unwrap();

    let owners = engine.resolve_ubo(&company.id).unwrap();
    assert_eq!(owners.len(), 1);
    assert!(owners[0].is_ubo_candidate);
    assert_eq!(owners[0].stake, 40.0);
    assert_eq!(owners[0].path_depth, 0);

    let events = bus.recent(Some(EventKind::CorrelationFound), None, 10);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["correlation_type"], "BeneficialOwnership");
}

#[test]
fn small_shareholder_is_not_a_candidate() {
    let (engine, store, _) = setup();
    let company = entity(&store, "PT Operasi", EntityType::Company);
    let person = entity(&store, "Kecil", EntityType::Person);
    store
        .insert_relationship(&CorporateRelationship::new(&person.id, &company.id, "SHAREHOLDER", 10.0))
        .unwrap();
    let owners = engine.resolve_ubo(&company.id).unwrap();
    assert_eq!(owners.len(), 1);
    assert!(!owners[0].is_ubo_candidate);
}

#[test]
fn director_control_edge_is_candidate_with_zero_stake() {
    let (engine, store, _) = setup();
    let company = entity(&store, "PT Operasi", EntityType::Company);
    let person = entity(&store, "Direktur X", EntityType::Person);
    store
        .insert_relationship(&CorporateRelationship::new(&person.id, &company.id, "DIRECTOR", 0.0))
        .unwrap();
    let owners = engine.resolve_ubo(&company.id).unwrap();
    assert_eq!(owners.len(), 1);
    assert!(owners[0].is_ubo_candidate);
    assert_eq!(owners[0].stake, 0.0);
    assert_eq!(owners[0].control_type, "DIRECTOR");
}

#[test]
fn layered_ownership_multiplies_effective_stake() {
    let (engine, store, _) = setup();
    // Person -> 80% of Holding -> 50% of Operating = 40% effective
    let operating = entity(&store, "PT Operasi", EntityType::Company);
    let holding = entity(&store, "PT Holding", EntityType::Company);
    let person = entity(&store, "Pemilik Akhir", EntityType::Person);
    store
        .insert_relationship(&CorporateRelationship::new(&holding.id, &operating.id, "SHAREHOLDER", 50.0))
        .unwrap();
    store
        .insert_relationship(&CorporateRelationship::new(&person.id, &holding.id, "SHAREHOLDER", 80.0))
        .unwrap();

    let owners = engine.resolve_ubo(&operating.id).unwrap();
    assert_eq!(owners.len(), 1);
    let ubo = &owners[0];
    assert!((ubo.stake - 40.0).abs() < 1e-9);
    assert!(ubo.is_ubo_candidate);
    assert_eq!(ubo.intermediate_company.as_deref(), Some("PT Holding"));
    assert_eq!(ubo.path_depth, 1);
}

#[test]
fn ownership_cycles_terminate() {
    let (engine, store, _) = setup();
    let a = entity(&store, "PT A", EntityType::Company);
    let b = entity(&store, "PT B", EntityType::Company);
    store
        .insert_relationship(&CorporateRelationship::new(&a.id, &b.id, "SHAREHOLDER", 50.0))
        .unwrap();
    store
        .insert_relationship(&CorporateRelationship::new(&b.id, &a.id, "SHAREHOLDER", 50.0))
        .unwrap();
    let owners = engine.resolve_ubo(&a.id).unwrap();
    assert!(owners.is_empty());
}

#[test]
fn asset_nexus_scores_by_purchase_proximity() {
    let (engine, store, bus) = setup();
    let project = Project::new("Audit", "CTR-500", 1.0, "PT X");
    store.insert_project(&project).unwrap();

    let suspect = entity(&store, "CV Nakal", EntityType::Company);
    let now = Utc::now();
    let mut tx = Transaction::new(&project.id, 0.0, 500_000_000.0, "Kontraktor", "CV Nakal");
    tx.risk_score = 0.9;
    tx.timestamp = now;
    store.insert_transaction(&tx).unwrap();

    let mut near_asset = Asset::new("Hilux Baru", "Vehicle", 600_000_000.0, &suspect.id);
    near_asset.purchase_date = Some(now + Duration::days(10));
    store.insert_asset(&near_asset).unwrap();

    let mut far_asset = Asset::new("Tanah Lama", "Real Estate", 900_000_000.0, &suspect.id);
    far_asset.purchase_date = Some(now - Duration::days(400));
    store.insert_asset(&far_asset).unwrap();

    let findings = engine.asset_temporal_nexus(&project.id).unwrap();
    assert_eq!(findings.len(), 2);
    let near = findings.iter().find(|f| f.asset_name == "Hilux Baru").unwrap();
    let far = findings.iter().find(|f| f.asset_name == "Tanah Lama").unwrap();
    assert!((near.temporal_proximity - 0.9).abs() < 1e-9);
    assert_eq!(far.temporal_proximity, 0.0);

    let events = bus.recent(Some(EventKind::CorrelationFound), None, 10);
    assert!(events
        .iter()
        .any(|e| e.data["correlation_type"] == "AssetTemporalNexus"));
}

#[test]
fn nexus_includes_one_hop_owned_companies() {
    let (engine, store, _) = setup();
    let project = Project::new("Audit", "CTR-501", 1.0, "PT X");
    store.insert_project(&project).unwrap();

    let suspect = entity(&store, "CV Nakal", EntityType::Company);
    let shell = entity(&store, "PT Shell", EntityType::Company);
    store
        .insert_relationship(&CorporateRelationship::new(&suspect.id, &shell.id, "SHAREHOLDER", 100.0))
        .unwrap();

    let now = Utc::now();
    let mut tx = Transaction::new(&project.id, 0.0, 100_000_000.0, "Kontraktor", "CV Nakal");
    tx.risk_score = 0.8;
    tx.timestamp = now;
    store.insert_transaction(&tx).unwrap();

    let mut asset = Asset::new("Apartemen", "Real Estate", 2_000_000_000.0, &shell.id);
    asset.purchase_date = Some(now + Duration::days(45));
    store.insert_asset(&asset).unwrap();

    let findings = engine.asset_temporal_nexus(&project.id).unwrap();
    assert_eq!(findings.len(), 1);
    assert!((findings[0].temporal_proximity - 0.5).abs() < 1e-9);
}
