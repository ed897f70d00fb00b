//! Collaborator interfaces for persisted state.
//!
//! The control plane reads and writes its records through these traits.
//! Persistence schema is owned by the implementor; [`MemoryStore`] keeps
//! everything in process and backs the tests and the simulation mode.
//!
//! Listing methods are lock-free and may return stale data. Mutations of
//! mappings and reservations are only issued while the caller holds the
//! device-map lock.

mod memory;

pub use memory::MemoryStore;

use crate::error::{OrchError, OrchResult};
use crate::types::{
    Appliance, ApplianceId, ApplianceKind, GuestNetwork, NetworkId, NetworkMapping,
    NetworkState, PhysicalNetwork, PhysicalNetworkId, PlaceholderReservation, PublicIp,
    PublicIpId, Rule, RuleId, UsageKey, UsageStatsRow, Zone, ZoneId,
};
use std::net::IpAddr;
use std::sync::Arc;

/// Appliance records.
pub trait ApplianceStore: Send + Sync {
    /// Persists a new appliance, assigning its id.
    fn insert_appliance(&self, appliance: Appliance) -> OrchResult<Appliance>;

    fn get_appliance(&self, id: ApplianceId) -> OrchResult<Option<Appliance>>;

    fn find_by_identity(&self, identity: &str) -> OrchResult<Option<Appliance>>;

    /// Appliances of a physical network in registration order.
    fn list_appliances(&self, physical_network_id: PhysicalNetworkId) -> OrchResult<Vec<Appliance>>;

    fn update_appliance(&self, appliance: &Appliance) -> OrchResult<()>;

    fn remove_appliance(&self, id: ApplianceId) -> OrchResult<bool>;
}

/// Network to appliance mappings.
pub trait MappingStore: Send + Sync {
    fn find_mapping(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
    ) -> OrchResult<Option<NetworkMapping>>;

    fn list_mappings(&self, appliance_id: ApplianceId) -> OrchResult<Vec<NetworkMapping>>;

    fn count_mappings(&self, appliance_id: ApplianceId) -> OrchResult<usize> {
        Ok(self.list_mappings(appliance_id)?.len())
    }

    /// Mappings of a network across appliance kinds.
    fn mappings_for_network(&self, network_id: NetworkId) -> OrchResult<Vec<NetworkMapping>>;

    fn insert_mapping(&self, mapping: NetworkMapping) -> OrchResult<()>;

    fn remove_mapping(&self, network_id: NetworkId, kind: ApplianceKind) -> OrchResult<bool>;
}

/// Placeholder IP reservations.
pub trait PlaceholderStore: Send + Sync {
    fn find_placeholder(
        &self,
        network_id: NetworkId,
        ip: IpAddr,
    ) -> OrchResult<Option<PlaceholderReservation>>;

    fn list_placeholders(&self, network_id: NetworkId) -> OrchResult<Vec<PlaceholderReservation>>;

    /// Creates a reservation; fails if one already exists for (network, ip).
    fn create_placeholder(&self, reservation: PlaceholderReservation) -> OrchResult<()>;

    fn remove_placeholder(&self, network_id: NetworkId, ip: IpAddr) -> OrchResult<bool>;
}

/// Usage statistics rows.
pub trait UsageStatsStore: Send + Sync {
    fn get_row(&self, key: &UsageKey) -> OrchResult<Option<UsageStatsRow>>;

    fn list_rows(&self, zone_id: ZoneId) -> OrchResult<Vec<UsageStatsRow>>;

    /// Runs `work` on the row for `key` while holding that row's lock.
    ///
    /// A missing row is created with zero counters. Changes made by `work`
    /// are committed only if it returns `Ok`.
    fn update_row(
        &self,
        key: &UsageKey,
        work: &mut dyn FnMut(&mut UsageStatsRow) -> OrchResult<()>,
    ) -> OrchResult<UsageStatsRow>;
}

/// Read access to zones, networks, addresses and rules.
pub trait NetworkCatalog: Send + Sync {
    fn zone(&self, id: ZoneId) -> OrchResult<Option<Zone>>;

    fn zones(&self) -> OrchResult<Vec<Zone>>;

    fn physical_network(&self, id: PhysicalNetworkId) -> OrchResult<Option<PhysicalNetwork>>;

    fn physical_networks(&self, zone_id: ZoneId) -> OrchResult<Vec<PhysicalNetwork>>;

    fn network(&self, id: NetworkId) -> OrchResult<Option<GuestNetwork>>;

    fn set_network_state(&self, id: NetworkId, state: NetworkState) -> OrchResult<()>;

    fn public_ip(&self, id: PublicIpId) -> OrchResult<Option<PublicIp>>;

    /// Source NAT address of a network's account, if allocated.
    fn source_nat_ip(&self, network_id: NetworkId) -> OrchResult<Option<PublicIp>>;

    /// Addresses with an active static NAT on the network.
    fn static_nat_ips(&self, network_id: NetworkId) -> OrchResult<Vec<PublicIp>>;

    /// Source addresses of active port-forwarding rules.
    fn port_forwarding_ips(&self, network_id: NetworkId) -> OrchResult<Vec<PublicIp>>;

    /// Source addresses of active load-balancing rules.
    fn load_balancer_ips(&self, network_id: NetworkId) -> OrchResult<Vec<PublicIp>>;

    /// Internal NIC address a public IP is mapped to behind an inline balancer.
    fn inline_nic_ip(&self, network_id: NetworkId, public_ip: IpAddr) -> OrchResult<Option<IpAddr>>;

    /// Picks a free guest address for an appliance self IP.
    fn allocate_guest_ip(&self, network_id: NetworkId) -> OrchResult<Option<IpAddr>>;

    fn rule(&self, id: RuleId) -> OrchResult<Option<Rule>>;
}

/// Handles to every store a component may need.
#[derive(Clone)]
pub struct Stores {
    pub appliances: Arc<dyn ApplianceStore>,
    pub mappings: Arc<dyn MappingStore>,
    pub placeholders: Arc<dyn PlaceholderStore>,
    pub usage: Arc<dyn UsageStatsStore>,
    pub catalog: Arc<dyn NetworkCatalog>,
}

impl Stores {
    /// Uses one [`MemoryStore`] for every role.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            appliances: store.clone(),
            mappings: store.clone(),
            placeholders: store.clone(),
            usage: store.clone(),
            catalog: store,
        }
    }

    /// Zone name for messages, falling back to the id.
    pub fn zone_label(&self, zone_id: ZoneId) -> String {
        match self.catalog.zone(zone_id) {
            Ok(Some(zone)) => zone.name,
            _ => format!("zone-{}", zone_id),
        }
    }

    /// Looks up a guest network, failing with InvalidParameter if unknown.
    pub fn require_network(&self, network_id: NetworkId) -> OrchResult<GuestNetwork> {
        self.catalog.network(network_id)?.ok_or_else(|| {
            OrchError::invalid_parameter("network_id", format!("unknown network {}", network_id))
        })
    }
}
