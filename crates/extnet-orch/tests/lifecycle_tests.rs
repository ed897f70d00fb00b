//! Network implement/shutdown against a recording driver.

mod common;

use common::{source_nat_address, Failure, Harness, ZONE_NAME};
use extnet_orch::store::{MappingStore, NetworkCatalog, PlaceholderStore};
use extnet_orch::transport::Command;
use extnet_orch::types::{ApplianceKind, NetworkMapping, NetworkState};
use extnet_orch::OrchError;
use pretty_assertions::assert_eq;
use std::time::Duration;

fn ip_assocs(commands: &[Command]) -> Vec<(bool, Option<std::net::IpAddr>)> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::IpAssoc(assoc) => Some((assoc.add, assoc.self_ip)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_implement_firewall_sends_assoc_and_persists() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 5).await;
    h.add_network(1, 7, false);

    let served_by = h.plane.implement_network(1, ApplianceKind::Firewall).await.unwrap();
    assert_eq!(served_by.id, fw.id);

    let sent = h.driver.sent_to(fw.id);
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Command::IpAssoc(assoc) => {
            assert!(assoc.add);
            assert_eq!(assoc.account_id, 7);
            assert_eq!(assoc.source_nat_ip, Some(source_nat_address(1)));
            assert_eq!(assoc.vlan_tag, 101);
            assert_eq!(assoc.cidr, "10.1.0.0/24");
            assert_eq!(assoc.network_rate_mbps, Some(200));
        }
        other => panic!("unexpected command {:?}", other),
    }

    let mapping = h.store.find_mapping(1, ApplianceKind::Firewall).unwrap().unwrap();
    assert_eq!(mapping.appliance_id, fw.id);
    let reservations = h.store.list_placeholders(1).unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].ip.to_string(), "10.1.0.1");
    assert_eq!(h.store.network(1).unwrap().unwrap().state, NetworkState::Implemented);
    assert_eq!(h.plane.network_phase(1, ApplianceKind::Firewall), NetworkState::Implemented);
}

#[tokio::test]
async fn test_implement_twice_keeps_one_reservation() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 5).await;
    h.add_network(1, 7, false);

    h.plane.implement_network(1, ApplianceKind::Firewall).await.unwrap();
    let again = h.plane.implement_network(1, ApplianceKind::Firewall).await.unwrap();

    assert_eq!(again.id, fw.id);
    assert_eq!(h.store.placeholder_count(), 1);
    assert_eq!(h.store.mapping_count(), 1);
    assert_eq!(h.plane.list_mappings(fw.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_implement_leaves_no_mapping() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 1).await;
    h.add_network(1, 7, false);
    h.driver.fail(fw.id, Failure::Negative("vlan 101 already in use".to_string()));

    match h.plane.implement_network(1, ApplianceKind::Firewall).await {
        Err(OrchError::ResourceUnavailable { zone, appliance, details }) => {
            assert_eq!(zone, ZONE_NAME);
            assert_eq!(appliance, Some(fw.id));
            assert_eq!(details, "vlan 101 already in use");
        }
        other => panic!("unexpected result {:?}", other),
    }

    assert_eq!(h.store.mapping_count(), 0);
    assert_eq!(h.store.placeholder_count(), 0);
    assert_eq!(h.store.network(1).unwrap().unwrap().state, NetworkState::Allocated);
    assert_eq!(h.plane.network_phase(1, ApplianceKind::Firewall), NetworkState::Allocated);
    assert_eq!(h.plane.tracked_phases(), 0);

    // The slot was never consumed.
    h.driver.heal(fw.id);
    h.add_network(2, 8, false);
    assert_eq!(h.plane.implement_network(2, ApplianceKind::Firewall).await.unwrap().id, fw.id);
}

#[tokio::test]
async fn test_implement_without_source_nat_ip_is_rejected() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 5).await;
    h.add_network(1, 7, false);
    h.store.add_public_ip(extnet_orch::types::PublicIp {
        id: 10,
        address: source_nat_address(1),
        vlan_tag: 50,
        account_id: 7,
        network_id: None,
        source_nat: true,
    });

    assert!(matches!(
        h.plane.implement_network(1, ApplianceKind::Firewall).await,
        Err(OrchError::InvalidParameter { .. })
    ));
    assert!(h.driver.sent_to(fw.id).is_empty());
}

#[tokio::test]
async fn test_shared_source_nat_sends_no_source_ip() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 5).await;
    h.add_network(1, 7, true);

    h.plane.implement_network(1, ApplianceKind::Firewall).await.unwrap();
    match &h.driver.sent_to(fw.id)[0] {
        Command::IpAssoc(assoc) => {
            assert!(assoc.shared_source_nat);
            assert_eq!(assoc.source_nat_ip, None);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[tokio::test]
async fn test_balancer_reserves_self_ip_once() {
    let h = Harness::new();
    let lb = h.register_balancer("192.0.2.20", 5, false).await;
    h.add_network(1, 7, false);

    h.plane.implement_network(1, ApplianceKind::LoadBalancer).await.unwrap();
    h.plane.implement_network(1, ApplianceKind::LoadBalancer).await.unwrap();

    let reservations = h.store.list_placeholders(1).unwrap();
    assert_eq!(reservations.len(), 1);
    let self_ip = reservations[0].ip;
    assert_ne!(self_ip.to_string(), "10.1.0.1");

    let assocs = ip_assocs(&h.driver.sent_to(lb.id));
    assert_eq!(assocs, vec![(true, Some(self_ip)), (true, Some(self_ip))]);

    h.plane.shutdown_network(1, ApplianceKind::LoadBalancer).await.unwrap();
    assert_eq!(ip_assocs(&h.driver.sent_to(lb.id))[2], (false, Some(self_ip)));
    assert_eq!(h.store.placeholder_count(), 0);
}

#[tokio::test]
async fn test_shutdown_twice_is_idempotent() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 5).await;
    h.add_network(1, 7, false);
    h.plane.implement_network(1, ApplianceKind::Firewall).await.unwrap();

    h.plane.shutdown_network(1, ApplianceKind::Firewall).await.unwrap();
    h.plane.shutdown_network(1, ApplianceKind::Firewall).await.unwrap();

    assert_eq!(ip_assocs(&h.driver.sent_to(fw.id)), vec![(true, None), (false, None)]);
    assert_eq!(h.store.mapping_count(), 0);
    assert_eq!(h.store.placeholder_count(), 0);
    assert_eq!(h.store.network(1).unwrap().unwrap().state, NetworkState::Shutdown);
}

#[tokio::test]
async fn test_shutdown_of_unmapped_network_sends_nothing() {
    let h = Harness::new();
    h.register_firewall("192.0.2.10", 5).await;
    h.add_network(1, 7, false);

    h.plane.manage_network(1, ApplianceKind::Firewall, false).await.unwrap();
    assert!(h.driver.sent().is_empty());
}

#[tokio::test]
async fn test_shutdown_forgets_phase() {
    let h = Harness::new();
    h.register_firewall("192.0.2.10", 5).await;
    for id in 1..=3 {
        h.add_network(id, 7, false);
        h.plane.implement_network(id, ApplianceKind::Firewall).await.unwrap();
    }
    assert_eq!(h.plane.tracked_phases(), 3);

    for id in 1..=3 {
        h.plane.shutdown_network(id, ApplianceKind::Firewall).await.unwrap();
    }
    assert_eq!(h.plane.tracked_phases(), 0);
    assert_eq!(h.plane.network_phase(2, ApplianceKind::Firewall), NetworkState::Allocated);
    assert_eq!(h.store.network(2).unwrap().unwrap().state, NetworkState::Shutdown);
}

#[tokio::test]
async fn test_shutdown_failure_with_reservation_propagates() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 5).await;
    h.add_network(1, 7, false);
    h.plane.implement_network(1, ApplianceKind::Firewall).await.unwrap();
    h.driver.fail(fw.id, Failure::Unreachable);

    assert!(matches!(
        h.plane.shutdown_network(1, ApplianceKind::Firewall).await,
        Err(OrchError::ResourceUnavailable { .. })
    ));
    assert_eq!(h.store.mapping_count(), 1);
    assert_eq!(h.store.placeholder_count(), 1);
    assert_eq!(h.plane.network_phase(1, ApplianceKind::Firewall), NetworkState::Implemented);
}

#[tokio::test]
async fn test_shutdown_failure_without_reservation_is_swallowed() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 5).await;
    h.add_network(1, 7, false);
    // Half-allocated: mapped but never confirmed on the appliance.
    h.store
        .insert_mapping(NetworkMapping {
            network_id: 1,
            appliance_id: fw.id,
            kind: ApplianceKind::Firewall,
        })
        .unwrap();
    h.driver.fail(fw.id, Failure::Negative("unknown vlan".to_string()));

    h.plane.shutdown_network(1, ApplianceKind::Firewall).await.unwrap();
    assert_eq!(h.store.mapping_count(), 0);
    assert_eq!(h.driver.count("ip_assoc"), 1);
}

#[tokio::test]
async fn test_shutdown_keeps_network_state_while_other_kind_mapped() {
    let h = Harness::new();
    h.register_firewall("192.0.2.10", 5).await;
    h.register_balancer("192.0.2.20", 5, false).await;
    h.add_network(1, 7, false);
    h.plane.implement_network(1, ApplianceKind::Firewall).await.unwrap();
    h.plane.implement_network(1, ApplianceKind::LoadBalancer).await.unwrap();

    h.plane.shutdown_network(1, ApplianceKind::Firewall).await.unwrap();
    assert_eq!(h.store.network(1).unwrap().unwrap().state, NetworkState::Implemented);
    assert!(h.plane.find_assigned(1, ApplianceKind::LoadBalancer).unwrap().is_some());
    assert!(h.plane.find_assigned(1, ApplianceKind::Firewall).unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_implement_with_one_free_slot() {
    let h = Harness::new();
    let fw = h.register_firewall("192.0.2.10", 1).await;
    h.add_network(1, 7, false);
    h.add_network(2, 8, false);
    h.driver.set_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(
        h.plane.implement_network(1, ApplianceKind::Firewall),
        h.plane.implement_network(2, ApplianceKind::Firewall),
    );

    let results = [first, second];
    let won = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(OrchError::InsufficientCapacity { .. })))
        .count();
    assert_eq!((won, refused), (1, 1));
    assert_eq!(h.plane.list_mappings(fw.id).unwrap().len(), 1);
    assert_eq!(h.driver.count("ip_assoc"), 1);
}
