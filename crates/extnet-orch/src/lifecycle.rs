//! Guest network implement/shutdown on external appliances.
//!
//! Lifecycle per (network, appliance kind):
//!
//! ```text
//! Allocated -> Implementing -> Implemented -> ShuttingDown -> Shutdown
//!     ^                                                         |
//!     +---------------------------------------------------------+
//! ```
//!
//! Both directions run entirely under the device-map lock, including the
//! remote round-trip. A mapping is persisted only after the appliance has
//! confirmed the association, so a failed implement never consumes capacity.
//! Placeholder reservations make a repeated implement a no-op for IP
//! bookkeeping, and let shutdown tell a network that was really implemented
//! on the appliance from one that was only half-allocated.

use crate::allocation::AllocationPolicy;
use crate::audit::{audit_log, AuditCategory, AuditRecord};
use crate::error::{OrchError, OrchResult};
use crate::store::Stores;
use crate::transport::{Command, DriverSet, IpAssocCommand};
use crate::types::{
    Appliance, ApplianceKind, GuestNetwork, NetworkId, NetworkMapping, NetworkState,
    PlaceholderReservation,
};
use chrono::Utc;
use dashmap::DashMap;
use extnet_common::LockProvider;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Lock serializing every change to network/appliance mappings.
pub const DEVICE_MAP_LOCK: &str = "device-map-mutation";

/// Drives guest networks through their lifecycle on appliances.
pub struct NetworkOrchestrator {
    stores: Stores,
    allocation: Arc<AllocationPolicy>,
    drivers: Arc<DriverSet>,
    locks: Arc<dyn LockProvider>,
    lock_wait: Duration,
    phases: DashMap<(NetworkId, ApplianceKind), NetworkState>,
}

impl NetworkOrchestrator {
    pub fn new(
        stores: Stores,
        allocation: Arc<AllocationPolicy>,
        drivers: Arc<DriverSet>,
        locks: Arc<dyn LockProvider>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            stores,
            allocation,
            drivers,
            locks,
            lock_wait,
            phases: DashMap::new(),
        }
    }

    /// Current lifecycle phase of a network for one appliance kind.
    pub fn phase(&self, network_id: NetworkId, kind: ApplianceKind) -> NetworkState {
        self.phases
            .get(&(network_id, kind))
            .map(|p| *p)
            .unwrap_or(NetworkState::Allocated)
    }

    /// Number of (network, kind) pairs with a tracked phase.
    pub fn tracked_phases(&self) -> usize {
        self.phases.len()
    }

    /// Puts back the phase seen before a failed transition.
    fn restore_phase(&self, network_id: NetworkId, kind: ApplianceKind, previous: NetworkState) {
        if previous == NetworkState::Allocated {
            self.phases.remove(&(network_id, kind));
        } else {
            self.phases.insert((network_id, kind), previous);
        }
    }

    /// Implements (`add = true`) or shuts down (`add = false`) a network.
    pub async fn manage_network(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
        add: bool,
    ) -> OrchResult<()> {
        if add {
            self.implement_network(network_id, kind).await.map(|_| ())
        } else {
            self.shutdown_network(network_id, kind).await
        }
    }

    /// Implements a network on its assigned appliance, selecting one first
    /// if the network has none of this kind.
    #[instrument(skip(self))]
    pub async fn implement_network(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
    ) -> OrchResult<Appliance> {
        let result = self.implement_inner(network_id, kind).await;

        let mut record = AuditRecord::new(AuditCategory::NetworkLifecycle, "NetworkOrchestrator", "implement")
            .with_object_id(network_id.to_string())
            .with_object_type("guest_network")
            .with_result(&result);
        if let Ok(appliance) = &result {
            record = record.with_details(serde_json::json!({
                "kind": kind,
                "appliance": appliance.id,
            }));
        }
        audit_log!(record);

        result
    }

    async fn implement_inner(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
    ) -> OrchResult<Appliance> {
        let network = self.stores.require_network(network_id)?;
        let zone = self.stores.zone_label(network.zone_id);

        let _guard = self
            .locks
            .acquire(DEVICE_MAP_LOCK, self.lock_wait)
            .await
            .map_err(|e| OrchError::from_lock(zone.clone(), e))?;

        let previous = self.phase(network_id, kind);
        self.phases
            .insert((network_id, kind), NetworkState::Implementing);

        match self.implement_on_appliance(&network, kind, &zone).await {
            Ok(appliance) => {
                self.phases
                    .insert((network_id, kind), NetworkState::Implemented);
                Ok(appliance)
            }
            Err(e) => {
                self.restore_phase(network_id, kind, previous);
                Err(e)
            }
        }
    }

    async fn implement_on_appliance(
        &self,
        network: &GuestNetwork,
        kind: ApplianceKind,
        zone: &str,
    ) -> OrchResult<Appliance> {
        let existing = self.stores.mappings.find_mapping(network.id, kind)?;
        let appliance = match existing {
            Some(mapping) => self.mapped_appliance(&mapping)?,
            None => self.allocation.select_appliance(network, kind)?,
        };

        let source_nat_ip = match kind {
            ApplianceKind::Firewall if !network.shared_source_nat => Some(
                self.stores
                    .catalog
                    .source_nat_ip(network.id)?
                    .map(|ip| ip.address)
                    .ok_or_else(|| {
                        OrchError::invalid_parameter(
                            "source_nat_ip",
                            format!(
                                "no source NAT address allocated for account {}",
                                network.account_id
                            ),
                        )
                    })?,
            ),
            _ => None,
        };
        let reserved_ip = self.reserved_ip(network, &appliance)?;

        let command = Command::IpAssoc(IpAssocCommand {
            account_id: network.account_id,
            source_nat_ip,
            add: true,
            shared_source_nat: network.shared_source_nat,
            vlan_tag: network.vlan_tag,
            gateway: network.gateway,
            cidr: network.cidr.to_string(),
            self_ip: (kind == ApplianceKind::LoadBalancer).then_some(reserved_ip),
            network_rate_mbps: network.network_rate_mbps,
        });
        self.drivers.send_checked(zone, &appliance, &command).await?;

        if existing.is_none() {
            self.stores.mappings.insert_mapping(NetworkMapping {
                network_id: network.id,
                appliance_id: appliance.id,
                kind,
            })?;
        }
        if self
            .stores
            .placeholders
            .find_placeholder(network.id, reserved_ip)?
            .is_none()
        {
            self.stores
                .placeholders
                .create_placeholder(PlaceholderReservation {
                    network_id: network.id,
                    ip: reserved_ip,
                    appliance_id: appliance.id,
                    created_at: Utc::now(),
                })?;
        }
        self.stores
            .catalog
            .set_network_state(network.id, NetworkState::Implemented)?;

        info!(
            zone = %zone,
            network = network.id,
            appliance = appliance.id,
            kind = %kind,
            "Implemented network"
        );
        Ok(appliance)
    }

    /// IP consumed on the appliance: the gateway for a firewall, a self IP
    /// for a load balancer (reused if already reserved).
    fn reserved_ip(&self, network: &GuestNetwork, appliance: &Appliance) -> OrchResult<IpAddr> {
        if appliance.kind() == ApplianceKind::Firewall {
            return Ok(network.gateway);
        }

        let held = self
            .stores
            .placeholders
            .list_placeholders(network.id)?
            .into_iter()
            .find(|r| r.appliance_id == appliance.id);
        if let Some(reservation) = held {
            return Ok(reservation.ip);
        }

        self.stores
            .catalog
            .allocate_guest_ip(network.id)?
            .ok_or_else(|| {
                OrchError::conflict(format!(
                    "no free address in {} for the load balancer self IP",
                    network.cidr
                ))
            })
    }

    fn mapped_appliance(&self, mapping: &NetworkMapping) -> OrchResult<Appliance> {
        self.stores
            .appliances
            .get_appliance(mapping.appliance_id)?
            .ok_or_else(|| {
                OrchError::store(
                    "get_appliance",
                    format!(
                        "network {} is mapped to missing appliance {}",
                        mapping.network_id, mapping.appliance_id
                    ),
                )
            })
    }

    /// Tears a network down on its appliance of `kind`.
    ///
    /// Succeeds without side effects if the network is not mapped.
    #[instrument(skip(self))]
    pub async fn shutdown_network(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
    ) -> OrchResult<()> {
        let result = self.shutdown_inner(network_id, kind).await;

        let record = AuditRecord::new(AuditCategory::NetworkLifecycle, "NetworkOrchestrator", "shutdown")
            .with_object_id(network_id.to_string())
            .with_object_type("guest_network")
            .with_details(serde_json::json!({ "kind": kind }))
            .with_result(&result);
        audit_log!(record);

        result
    }

    async fn shutdown_inner(&self, network_id: NetworkId, kind: ApplianceKind) -> OrchResult<()> {
        let network = self.stores.require_network(network_id)?;
        let zone = self.stores.zone_label(network.zone_id);

        let _guard = self
            .locks
            .acquire(DEVICE_MAP_LOCK, self.lock_wait)
            .await
            .map_err(|e| OrchError::from_lock(zone.clone(), e))?;

        let mapping = match self.stores.mappings.find_mapping(network_id, kind)? {
            Some(mapping) => mapping,
            None => {
                info!(network = network_id, kind = %kind, "Network is not implemented, nothing to shut down");
                return Ok(());
            }
        };

        let previous = self.phase(network_id, kind);
        self.phases
            .insert((network_id, kind), NetworkState::ShuttingDown);

        match self.shutdown_on_appliance(&network, &mapping, &zone).await {
            Ok(()) => {
                self.phases.remove(&(network_id, kind));
                Ok(())
            }
            Err(e) => {
                self.restore_phase(network_id, kind, previous);
                Err(e)
            }
        }
    }

    async fn shutdown_on_appliance(
        &self,
        network: &GuestNetwork,
        mapping: &NetworkMapping,
        zone: &str,
    ) -> OrchResult<()> {
        let reservations: Vec<PlaceholderReservation> = self
            .stores
            .placeholders
            .list_placeholders(network.id)?
            .into_iter()
            .filter(|r| r.appliance_id == mapping.appliance_id)
            .collect();

        match self.stores.appliances.get_appliance(mapping.appliance_id)? {
            Some(appliance) => {
                let source_nat_ip = match mapping.kind {
                    ApplianceKind::Firewall if !network.shared_source_nat => self
                        .stores
                        .catalog
                        .source_nat_ip(network.id)?
                        .map(|ip| ip.address),
                    _ => None,
                };
                let self_ip = match mapping.kind {
                    ApplianceKind::LoadBalancer => reservations.first().map(|r| r.ip),
                    ApplianceKind::Firewall => None,
                };

                let command = Command::IpAssoc(IpAssocCommand {
                    account_id: network.account_id,
                    source_nat_ip,
                    add: false,
                    shared_source_nat: network.shared_source_nat,
                    vlan_tag: network.vlan_tag,
                    gateway: network.gateway,
                    cidr: network.cidr.to_string(),
                    self_ip,
                    network_rate_mbps: network.network_rate_mbps,
                });

                match self.drivers.send_checked(zone, &appliance, &command).await {
                    Ok(_) => {}
                    Err(e) if reservations.is_empty() => {
                        warn!(
                            zone = %zone,
                            network = network.id,
                            appliance = appliance.id,
                            error = %e,
                            "Release failed on an appliance that never held the network, continuing cleanup"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                warn!(
                    network = network.id,
                    appliance = mapping.appliance_id,
                    "Mapped appliance no longer exists, cleaning up mapping"
                );
            }
        }

        for reservation in &reservations {
            self.stores
                .placeholders
                .remove_placeholder(network.id, reservation.ip)?;
        }
        self.stores
            .mappings
            .remove_mapping(network.id, mapping.kind)?;
        if self
            .stores
            .mappings
            .mappings_for_network(network.id)?
            .is_empty()
        {
            self.stores
                .catalog
                .set_network_state(network.id, NetworkState::Shutdown)?;
        }

        info!(
            zone = %zone,
            network = network.id,
            appliance = mapping.appliance_id,
            kind = %mapping.kind,
            "Shut down network"
        );
        Ok(())
    }
}
