//! Single entry point wiring the registry, allocator, lifecycle, rule and
//! usage components over one set of stores and drivers.

use crate::allocation::AllocationPolicy;
use crate::config::Config;
use crate::error::OrchResult;
use crate::lifecycle::NetworkOrchestrator;
use crate::registry::ApplianceRegistry;
use crate::rules::{ApplyOutcome, RuleApplier};
use crate::store::Stores;
use crate::transport::{DriverSet, HostRegistry};
use crate::types::{
    Appliance, ApplianceId, ApplianceKind, ApplianceState, FirewallRule, GuestNetwork,
    LoadBalancingRule, NetworkId, NetworkMapping, NetworkState, PhysicalNetworkId, PortForwardingRule,
    RegisterAppliance, Rule, RuleId, RuleKind, StaticNatRule, UsageStatsRow, ZoneId,
};
use crate::usage::UsageCollector;
use extnet_common::{LockProvider, TickReport};
use std::sync::Arc;

pub struct ControlPlane {
    stores: Stores,
    registry: ApplianceRegistry,
    allocation: Arc<AllocationPolicy>,
    orchestrator: NetworkOrchestrator,
    rules: RuleApplier,
    usage: Arc<UsageCollector>,
}

impl ControlPlane {
    pub fn new(
        config: &Config,
        stores: Stores,
        drivers: Arc<DriverSet>,
        hosts: Arc<dyn HostRegistry>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        let allocation = Arc::new(AllocationPolicy::new(stores.clone(), config.capacity.clone()));
        let registry = ApplianceRegistry::new(
            stores.clone(),
            Arc::clone(&drivers),
            hosts,
            Arc::clone(&locks),
            config.capacity.clone(),
            config.mapping_lock_wait(),
        );
        let orchestrator = NetworkOrchestrator::new(
            stores.clone(),
            Arc::clone(&allocation),
            Arc::clone(&drivers),
            Arc::clone(&locks),
            config.mapping_lock_wait(),
        );
        let rules = RuleApplier::new(stores.clone(), Arc::clone(&drivers));
        let usage = Arc::new(UsageCollector::new(stores.clone(), drivers, locks, config));

        Self {
            stores,
            registry,
            allocation,
            orchestrator,
            rules,
            usage,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// The usage collector, for registration with the daemon.
    pub fn usage_collector(&self) -> Arc<UsageCollector> {
        Arc::clone(&self.usage)
    }

    // Registry

    pub async fn register_appliance(&self, request: RegisterAppliance) -> OrchResult<Appliance> {
        self.registry.register(request).await
    }

    pub async fn deregister_appliance(&self, appliance_id: ApplianceId) -> OrchResult<bool> {
        self.registry.deregister(appliance_id).await
    }

    pub fn list_appliances(
        &self,
        physical_network_id: PhysicalNetworkId,
        provider_name: Option<&str>,
    ) -> OrchResult<Vec<Appliance>> {
        self.registry
            .list_by_physical_network(physical_network_id, provider_name)
    }

    pub fn find_assigned(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
    ) -> OrchResult<Option<Appliance>> {
        self.registry.find_assigned(network_id, kind)
    }

    pub fn list_mappings(&self, appliance_id: ApplianceId) -> OrchResult<Vec<NetworkMapping>> {
        self.registry.list_mappings(appliance_id)
    }

    pub async fn update_capacity(
        &self,
        appliance_id: ApplianceId,
        capacity: u32,
    ) -> OrchResult<Appliance> {
        self.registry.update_capacity(appliance_id, capacity).await
    }

    pub async fn update_state(
        &self,
        appliance_id: ApplianceId,
        state: ApplianceState,
    ) -> OrchResult<Appliance> {
        self.registry.update_state(appliance_id, state).await
    }

    // Allocation and lifecycle

    /// Appliance that would serve `network` if it were implemented now.
    ///
    /// Nothing is reserved; the answer may be stale by the time it is used.
    pub fn select_appliance(
        &self,
        network: &GuestNetwork,
        kind: ApplianceKind,
    ) -> OrchResult<Appliance> {
        self.allocation.select_appliance(network, kind)
    }

    pub async fn implement_network(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
    ) -> OrchResult<Appliance> {
        self.orchestrator.implement_network(network_id, kind).await
    }

    pub async fn shutdown_network(&self, network_id: NetworkId, kind: ApplianceKind) -> OrchResult<()> {
        self.orchestrator.shutdown_network(network_id, kind).await
    }

    pub async fn manage_network(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
        add: bool,
    ) -> OrchResult<()> {
        self.orchestrator.manage_network(network_id, kind, add).await
    }

    pub fn network_phase(&self, network_id: NetworkId, kind: ApplianceKind) -> NetworkState {
        self.orchestrator.phase(network_id, kind)
    }

    pub fn tracked_phases(&self) -> usize {
        self.orchestrator.tracked_phases()
    }

    // Rules

    pub async fn apply_firewall_rules(
        &self,
        network_id: NetworkId,
        rules: &[FirewallRule],
    ) -> OrchResult<ApplyOutcome> {
        self.rules.apply_firewall_rules(network_id, rules).await
    }

    pub async fn apply_port_forwarding_rules(
        &self,
        network_id: NetworkId,
        rules: &[PortForwardingRule],
    ) -> OrchResult<ApplyOutcome> {
        self.rules.apply_port_forwarding_rules(network_id, rules).await
    }

    pub async fn apply_static_nat_rules(
        &self,
        network_id: NetworkId,
        rules: &[StaticNatRule],
    ) -> OrchResult<ApplyOutcome> {
        self.rules.apply_static_nat_rules(network_id, rules).await
    }

    pub async fn apply_load_balancer_rules(
        &self,
        network_id: NetworkId,
        rules: &[LoadBalancingRule],
    ) -> OrchResult<ApplyOutcome> {
        self.rules.apply_load_balancer_rules(network_id, rules).await
    }

    pub async fn apply_rules(
        &self,
        network_id: NetworkId,
        rules: &[Rule],
    ) -> OrchResult<Vec<(RuleKind, ApplyOutcome)>> {
        self.rules.apply_rules(network_id, rules).await
    }

    // Usage

    pub async fn collect_zone_usage(&self, zone_id: ZoneId) -> OrchResult<TickReport> {
        self.usage.collect_zone_usage(zone_id).await
    }

    pub async fn collect_all_zones(&self) -> TickReport {
        self.usage.collect_all_zones().await
    }

    pub async fn update_usage_for_rule(&self, rule_id: RuleId) -> OrchResult<Option<UsageStatsRow>> {
        self.usage.update_usage_for_rule(rule_id).await
    }
}
