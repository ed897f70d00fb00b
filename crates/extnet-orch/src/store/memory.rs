//! In-process implementation of every store trait.

use super::{ApplianceStore, MappingStore, NetworkCatalog, PlaceholderStore, UsageStatsStore};
use crate::error::{OrchError, OrchResult};
use crate::types::{
    Appliance, ApplianceId, ApplianceKind, GuestNetwork, NetworkId, NetworkMapping, NetworkState,
    PhysicalNetwork, PhysicalNetworkId, PlaceholderReservation, PublicIp, PublicIpId, Rule,
    RuleId, RuleKind, RuleState, UsageKey, UsageStatsRow, Zone, ZoneId,
};
use dashmap::DashMap;
use extnet_common::run_in_transaction;
use ipnetwork::IpNetwork;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type RowSlot = Arc<Mutex<Option<UsageStatsRow>>>;

/// Memory-backed store.
///
/// Appliances are kept in a `BTreeMap` keyed by their monotonically assigned
/// id so listings come back in registration order. Each usage row has its
/// own mutex, held for the whole unit of work of an update.
pub struct MemoryStore {
    next_appliance_id: AtomicU64,
    appliances: RwLock<BTreeMap<ApplianceId, Appliance>>,
    mappings: DashMap<(NetworkId, ApplianceKind), NetworkMapping>,
    placeholders: DashMap<(NetworkId, IpAddr), PlaceholderReservation>,
    usage: DashMap<UsageKey, RowSlot>,
    zones: RwLock<BTreeMap<ZoneId, Zone>>,
    physical_networks: RwLock<BTreeMap<PhysicalNetworkId, PhysicalNetwork>>,
    networks: RwLock<BTreeMap<NetworkId, GuestNetwork>>,
    public_ips: RwLock<BTreeMap<PublicIpId, PublicIp>>,
    rules: RwLock<BTreeMap<RuleId, Rule>>,
    inline_nics: DashMap<(NetworkId, IpAddr), IpAddr>,
    guest_ips_in_use: Mutex<HashSet<(NetworkId, IpAddr)>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            next_appliance_id: AtomicU64::new(1),
            appliances: RwLock::new(BTreeMap::new()),
            mappings: DashMap::new(),
            placeholders: DashMap::new(),
            usage: DashMap::new(),
            zones: RwLock::new(BTreeMap::new()),
            physical_networks: RwLock::new(BTreeMap::new()),
            networks: RwLock::new(BTreeMap::new()),
            public_ips: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(BTreeMap::new()),
            inline_nics: DashMap::new(),
            guest_ips_in_use: Mutex::new(HashSet::new()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_zone(&self, zone: Zone) {
        self.zones.write().insert(zone.id, zone);
    }

    pub fn add_physical_network(&self, physical_network: PhysicalNetwork) {
        self.physical_networks
            .write()
            .insert(physical_network.id, physical_network);
    }

    pub fn add_network(&self, network: GuestNetwork) {
        self.networks.write().insert(network.id, network);
    }

    pub fn add_public_ip(&self, ip: PublicIp) {
        self.public_ips.write().insert(ip.id, ip);
    }

    /// Adds or replaces a rule.
    pub fn add_rule(&self, rule: Rule) {
        self.rules.write().insert(rule.id(), rule);
    }

    pub fn remove_rule(&self, id: RuleId) -> bool {
        self.rules.write().remove(&id).is_some()
    }

    /// Records the internal NIC address behind an inline balancer.
    pub fn set_inline_nic_ip(&self, network_id: NetworkId, public_ip: IpAddr, internal: IpAddr) {
        self.inline_nics.insert((network_id, public_ip), internal);
    }

    /// Marks a guest address as used by a VM.
    pub fn mark_guest_ip_in_use(&self, network_id: NetworkId, ip: IpAddr) {
        self.guest_ips_in_use.lock().insert((network_id, ip));
    }

    /// Number of mapping records, across all appliances.
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Number of reservation records, across all networks.
    pub fn placeholder_count(&self) -> usize {
        self.placeholders.len()
    }

    fn rule_ips(&self, network_id: NetworkId, kind: RuleKind) -> Vec<PublicIp> {
        let rules = self.rules.read();
        let public_ips = self.public_ips.read();

        let mut found: BTreeMap<PublicIpId, PublicIp> = BTreeMap::new();
        for rule in rules.values() {
            if rule.kind() != kind || rule.state() != RuleState::Active {
                continue;
            }
            if let Some(ip) = public_ips.get(&rule.source_ip_id()) {
                if ip.network_id == Some(network_id) {
                    found.insert(ip.id, ip.clone());
                }
            }
        }
        found.into_values().collect()
    }
}

impl ApplianceStore for MemoryStore {
    fn insert_appliance(&self, mut appliance: Appliance) -> OrchResult<Appliance> {
        let mut appliances = self.appliances.write();
        if appliances
            .values()
            .any(|existing| existing.identity == appliance.identity)
        {
            return Err(OrchError::conflict(format!(
                "device {} already exists",
                appliance.identity
            )));
        }
        appliance.id = self.next_appliance_id.fetch_add(1, Ordering::SeqCst);
        appliances.insert(appliance.id, appliance.clone());
        Ok(appliance)
    }

    fn get_appliance(&self, id: ApplianceId) -> OrchResult<Option<Appliance>> {
        Ok(self.appliances.read().get(&id).cloned())
    }

    fn find_by_identity(&self, identity: &str) -> OrchResult<Option<Appliance>> {
        Ok(self
            .appliances
            .read()
            .values()
            .find(|a| a.identity == identity)
            .cloned())
    }

    fn list_appliances(&self, physical_network_id: PhysicalNetworkId) -> OrchResult<Vec<Appliance>> {
        Ok(self
            .appliances
            .read()
            .values()
            .filter(|a| a.physical_network_id == physical_network_id)
            .cloned()
            .collect())
    }

    fn update_appliance(&self, appliance: &Appliance) -> OrchResult<()> {
        match self.appliances.write().get_mut(&appliance.id) {
            Some(slot) => {
                *slot = appliance.clone();
                Ok(())
            }
            None => Err(OrchError::store(
                "update_appliance",
                format!("appliance {} not found", appliance.id),
            )),
        }
    }

    fn remove_appliance(&self, id: ApplianceId) -> OrchResult<bool> {
        Ok(self.appliances.write().remove(&id).is_some())
    }
}

impl MappingStore for MemoryStore {
    fn find_mapping(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
    ) -> OrchResult<Option<NetworkMapping>> {
        Ok(self.mappings.get(&(network_id, kind)).map(|m| *m))
    }

    fn list_mappings(&self, appliance_id: ApplianceId) -> OrchResult<Vec<NetworkMapping>> {
        let mut found: Vec<NetworkMapping> = self
            .mappings
            .iter()
            .filter(|m| m.appliance_id == appliance_id)
            .map(|m| *m)
            .collect();
        found.sort_by_key(|m| (m.network_id, m.kind));
        Ok(found)
    }

    fn mappings_for_network(&self, network_id: NetworkId) -> OrchResult<Vec<NetworkMapping>> {
        let mut found: Vec<NetworkMapping> = self
            .mappings
            .iter()
            .filter(|m| m.network_id == network_id)
            .map(|m| *m)
            .collect();
        found.sort_by_key(|m| m.kind);
        Ok(found)
    }

    fn insert_mapping(&self, mapping: NetworkMapping) -> OrchResult<()> {
        let key = (mapping.network_id, mapping.kind);
        if let Some(existing) = self.mappings.get(&key) {
            return Err(OrchError::conflict(format!(
                "network {} already mapped to {} appliance {}",
                mapping.network_id, mapping.kind, existing.appliance_id
            )));
        }
        self.mappings.insert(key, mapping);
        Ok(())
    }

    fn remove_mapping(&self, network_id: NetworkId, kind: ApplianceKind) -> OrchResult<bool> {
        Ok(self.mappings.remove(&(network_id, kind)).is_some())
    }
}

impl PlaceholderStore for MemoryStore {
    fn find_placeholder(
        &self,
        network_id: NetworkId,
        ip: IpAddr,
    ) -> OrchResult<Option<PlaceholderReservation>> {
        Ok(self
            .placeholders
            .get(&(network_id, ip))
            .map(|r| r.value().clone()))
    }

    fn list_placeholders(&self, network_id: NetworkId) -> OrchResult<Vec<PlaceholderReservation>> {
        let mut found: Vec<PlaceholderReservation> = self
            .placeholders
            .iter()
            .filter(|r| r.network_id == network_id)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by_key(|r| r.ip);
        Ok(found)
    }

    fn create_placeholder(&self, reservation: PlaceholderReservation) -> OrchResult<()> {
        use dashmap::mapref::entry::Entry;

        match self
            .placeholders
            .entry((reservation.network_id, reservation.ip))
        {
            Entry::Occupied(_) => Err(OrchError::conflict(format!(
                "ip {} already reserved on network {}",
                reservation.ip, reservation.network_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(reservation);
                Ok(())
            }
        }
    }

    fn remove_placeholder(&self, network_id: NetworkId, ip: IpAddr) -> OrchResult<bool> {
        Ok(self.placeholders.remove(&(network_id, ip)).is_some())
    }
}

impl UsageStatsStore for MemoryStore {
    fn get_row(&self, key: &UsageKey) -> OrchResult<Option<UsageStatsRow>> {
        let slot = match self.usage.get(key) {
            Some(slot) => Arc::clone(slot.value()),
            None => return Ok(None),
        };
        let row = slot.lock().clone();
        Ok(row)
    }

    fn list_rows(&self, zone_id: ZoneId) -> OrchResult<Vec<UsageStatsRow>> {
        let slots: Vec<RowSlot> = self
            .usage
            .iter()
            .filter(|entry| entry.key().zone_id == zone_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut rows: Vec<UsageStatsRow> = slots
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    fn update_row(
        &self,
        key: &UsageKey,
        work: &mut dyn FnMut(&mut UsageStatsRow) -> OrchResult<()>,
    ) -> OrchResult<UsageStatsRow> {
        let slot = Arc::clone(
            self.usage
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        );

        let mut row_lock = slot.lock();
        run_in_transaction(&mut *row_lock, |staged| {
            let row = staged.get_or_insert_with(|| UsageStatsRow::new(key.clone()));
            work(row)?;
            Ok(row.clone())
        })
    }
}

impl NetworkCatalog for MemoryStore {
    fn zone(&self, id: ZoneId) -> OrchResult<Option<Zone>> {
        Ok(self.zones.read().get(&id).cloned())
    }

    fn zones(&self) -> OrchResult<Vec<Zone>> {
        Ok(self.zones.read().values().cloned().collect())
    }

    fn physical_network(&self, id: PhysicalNetworkId) -> OrchResult<Option<PhysicalNetwork>> {
        Ok(self.physical_networks.read().get(&id).cloned())
    }

    fn physical_networks(&self, zone_id: ZoneId) -> OrchResult<Vec<PhysicalNetwork>> {
        Ok(self
            .physical_networks
            .read()
            .values()
            .filter(|p| p.zone_id == zone_id)
            .cloned()
            .collect())
    }

    fn network(&self, id: NetworkId) -> OrchResult<Option<GuestNetwork>> {
        Ok(self.networks.read().get(&id).cloned())
    }

    fn set_network_state(&self, id: NetworkId, state: NetworkState) -> OrchResult<()> {
        match self.networks.write().get_mut(&id) {
            Some(network) => {
                network.state = state;
                Ok(())
            }
            None => Err(OrchError::store(
                "set_network_state",
                format!("network {} not found", id),
            )),
        }
    }

    fn public_ip(&self, id: PublicIpId) -> OrchResult<Option<PublicIp>> {
        Ok(self.public_ips.read().get(&id).cloned())
    }

    fn source_nat_ip(&self, network_id: NetworkId) -> OrchResult<Option<PublicIp>> {
        Ok(self
            .public_ips
            .read()
            .values()
            .find(|ip| ip.source_nat && ip.network_id == Some(network_id))
            .cloned())
    }

    fn static_nat_ips(&self, network_id: NetworkId) -> OrchResult<Vec<PublicIp>> {
        Ok(self.rule_ips(network_id, RuleKind::StaticNat))
    }

    fn port_forwarding_ips(&self, network_id: NetworkId) -> OrchResult<Vec<PublicIp>> {
        Ok(self.rule_ips(network_id, RuleKind::PortForwarding))
    }

    fn load_balancer_ips(&self, network_id: NetworkId) -> OrchResult<Vec<PublicIp>> {
        Ok(self.rule_ips(network_id, RuleKind::LoadBalancing))
    }

    fn inline_nic_ip(&self, network_id: NetworkId, public_ip: IpAddr) -> OrchResult<Option<IpAddr>> {
        Ok(self.inline_nics.get(&(network_id, public_ip)).map(|ip| *ip))
    }

    fn allocate_guest_ip(&self, network_id: NetworkId) -> OrchResult<Option<IpAddr>> {
        let network = match self.network(network_id)? {
            Some(network) => network,
            None => return Ok(None),
        };
        let in_use = self.guest_ips_in_use.lock();
        let free = |ip: &IpAddr| {
            *ip != network.gateway
                && !in_use.contains(&(network_id, *ip))
                && !self.placeholders.contains_key(&(network_id, *ip))
        };
        let candidate = match network.cidr {
            IpNetwork::V4(v4) => v4
                .iter()
                .filter(|ip| *ip != v4.network() && *ip != v4.broadcast())
                .map(IpAddr::V4)
                .find(|ip| free(ip)),
            IpNetwork::V6(v6) => v6.iter().skip(1).map(IpAddr::V6).find(|ip| free(ip)),
        };
        Ok(candidate)
    }

    fn rule(&self, id: RuleId) -> OrchResult<Option<Rule>> {
        Ok(self.rules.read().get(&id).cloned())
    }
}
