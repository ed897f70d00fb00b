//! Appliance registry.
//!
//! Tracks firewall and load-balancer records per physical network, and owns
//! the admin operations (capacity and state changes) on them. Removing an
//! appliance or lowering its capacity takes the device-map lock so that it
//! cannot race an allocation.

use crate::audit::{audit_log, AuditCategory, AuditRecord};
use crate::config::CapacityConfig;
use crate::error::{OrchError, OrchResult};
use crate::lifecycle::DEVICE_MAP_LOCK;
use crate::store::Stores;
use crate::transport::{DriverSet, HostRegistry};
use crate::types::{
    Appliance, ApplianceId, ApplianceKind, ApplianceState, NetworkId, NetworkMapping,
    PhysicalNetworkId, RegisterAppliance,
};
use extnet_common::{LockGuard, LockProvider};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Management port assumed when the endpoint carries none.
pub const DEFAULT_MANAGEMENT_PORT: u16 = 443;

/// Parses `ip`, `ip:port` or `scheme://ip[:port][/]` into a socket address.
pub fn parse_endpoint(endpoint: &str) -> OrchResult<SocketAddr> {
    let trimmed = endpoint.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let host = without_scheme.trim_end_matches('/');

    if host.is_empty() {
        return Err(OrchError::invalid_parameter("endpoint", "must not be empty"));
    }

    if let Ok(addr) = host.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(OrchError::invalid_parameter("endpoint", "port must be > 0"));
        }
        return Ok(addr);
    }

    // Bare IPv6 addresses may come bracketed without a port
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_MANAGEMENT_PORT))
        .map_err(|_| {
            OrchError::invalid_parameter("endpoint", format!("'{}' is not an IP address", endpoint))
        })
}

/// Registry of external appliances.
pub struct ApplianceRegistry {
    stores: Stores,
    drivers: Arc<DriverSet>,
    hosts: Arc<dyn HostRegistry>,
    locks: Arc<dyn LockProvider>,
    capacity: CapacityConfig,
    lock_wait: Duration,
}

impl ApplianceRegistry {
    pub fn new(
        stores: Stores,
        drivers: Arc<DriverSet>,
        hosts: Arc<dyn HostRegistry>,
        locks: Arc<dyn LockProvider>,
        capacity: CapacityConfig,
        lock_wait: Duration,
    ) -> Self {
        Self {
            stores,
            drivers,
            hosts,
            locks,
            capacity,
            lock_wait,
        }
    }

    /// Registers a new appliance and attaches its transport connection.
    #[instrument(skip(self, request), fields(provider = %request.provider_name, physical_network = request.physical_network_id))]
    pub async fn register(&self, request: RegisterAppliance) -> OrchResult<Appliance> {
        let endpoint = request.endpoint.clone();
        let result = self.register_inner(request).await;

        let mut record = AuditRecord::new(AuditCategory::ApplianceRegistry, "ApplianceRegistry", "register")
            .with_object_type("appliance")
            .with_result(&result);
        if let Ok(appliance) = &result {
            record = record.with_object_id(appliance.id.to_string()).with_details(serde_json::json!({
                "identity": appliance.identity,
                "kind": appliance.kind(),
                "capacity": appliance.capacity,
                "dedicated": appliance.dedicated,
            }));
        } else {
            record = record.with_details(serde_json::json!({ "endpoint": endpoint }));
        }
        audit_log!(record);

        result
    }

    async fn register_inner(&self, request: RegisterAppliance) -> OrchResult<Appliance> {
        let physical_network = self
            .stores
            .catalog
            .physical_network(request.physical_network_id)?
            .ok_or_else(|| {
                OrchError::invalid_parameter(
                    "physical_network_id",
                    format!("unknown physical network {}", request.physical_network_id),
                )
            })?;

        if request.provider_name.trim().is_empty() {
            return Err(OrchError::invalid_parameter("provider_name", "must not be empty"));
        }
        let driver = self.drivers.driver(&request.provider_name)?;

        let address = parse_endpoint(&request.endpoint)?;
        driver.configure(&request.config, &request.credentials)?;

        let identity =
            Appliance::device_identity(physical_network.id, &request.provider_name, address.ip());
        if self.stores.appliances.find_by_identity(&identity)?.is_some() {
            return Err(OrchError::conflict(format!(
                "device {} already exists",
                identity
            )));
        }

        let kind = request.config.kind();
        let capacity = match request.capacity {
            Some(capacity) => capacity,
            None => self.capacity.default_for(kind)?,
        };

        let transport = self
            .hosts
            .attach(&identity, address, &request.credentials)
            .await?;

        let appliance = Appliance {
            id: 0,
            physical_network_id: physical_network.id,
            zone_id: physical_network.zone_id,
            provider_name: request.provider_name,
            capacity,
            dedicated: request.dedicated.unwrap_or(false),
            state: ApplianceState::Enabled,
            address,
            identity,
            config: request.config,
            transport,
        };

        match self.stores.appliances.insert_appliance(appliance) {
            Ok(appliance) => {
                info!(
                    appliance = appliance.id,
                    identity = %appliance.identity,
                    kind = %kind,
                    capacity = appliance.capacity,
                    "Registered appliance"
                );
                Ok(appliance)
            }
            Err(e) => {
                if let Err(detach_err) = self.hosts.detach(transport).await {
                    warn!(error = %detach_err, "Failed to release connection of rejected appliance");
                }
                Err(e)
            }
        }
    }

    /// Removes an appliance that no network is mapped to.
    ///
    /// Returns `false` if the appliance does not exist.
    #[instrument(skip(self))]
    pub async fn deregister(&self, appliance_id: ApplianceId) -> OrchResult<bool> {
        let result = self.deregister_inner(appliance_id).await;

        let record = AuditRecord::new(AuditCategory::ApplianceRegistry, "ApplianceRegistry", "deregister")
            .with_object_id(appliance_id.to_string())
            .with_object_type("appliance")
            .with_result(&result);
        audit_log!(record);

        result
    }

    async fn deregister_inner(&self, appliance_id: ApplianceId) -> OrchResult<bool> {
        let appliance = match self.stores.appliances.get_appliance(appliance_id)? {
            Some(appliance) => appliance,
            None => return Ok(false),
        };

        let _guard = self.lock_device_map(appliance.zone_id).await?;

        let in_use = self.stores.mappings.count_mappings(appliance_id)?;
        if in_use > 0 {
            return Err(OrchError::conflict(format!(
                "device {} in use by {} network(s)",
                appliance_id, in_use
            )));
        }

        self.hosts.detach(appliance.transport).await?;
        let removed = self.stores.appliances.remove_appliance(appliance_id)?;
        info!(appliance = appliance_id, "Deregistered appliance");
        Ok(removed)
    }

    /// Appliances of a physical network in registration order.
    pub fn list_by_physical_network(
        &self,
        physical_network_id: PhysicalNetworkId,
        provider_name: Option<&str>,
    ) -> OrchResult<Vec<Appliance>> {
        let appliances = self.stores.appliances.list_appliances(physical_network_id)?;
        Ok(match provider_name {
            Some(provider) => appliances
                .into_iter()
                .filter(|a| a.provider_name == provider)
                .collect(),
            None => appliances,
        })
    }

    /// Appliance of `kind` the network is mapped to, if any.
    pub fn find_assigned(
        &self,
        network_id: NetworkId,
        kind: ApplianceKind,
    ) -> OrchResult<Option<Appliance>> {
        match self.stores.mappings.find_mapping(network_id, kind)? {
            Some(mapping) => self.stores.appliances.get_appliance(mapping.appliance_id),
            None => Ok(None),
        }
    }

    /// Mappings currently held by an appliance.
    pub fn list_mappings(&self, appliance_id: ApplianceId) -> OrchResult<Vec<NetworkMapping>> {
        self.stores.mappings.list_mappings(appliance_id)
    }

    /// Changes the capacity of an appliance.
    ///
    /// A non-zero capacity below the current mapping count is rejected.
    #[instrument(skip(self))]
    pub async fn update_capacity(
        &self,
        appliance_id: ApplianceId,
        capacity: u32,
    ) -> OrchResult<Appliance> {
        let result = self.update_capacity_inner(appliance_id, capacity).await;

        let record = AuditRecord::new(AuditCategory::AdminAction, "ApplianceRegistry", "update_capacity")
            .with_object_id(appliance_id.to_string())
            .with_object_type("appliance")
            .with_details(serde_json::json!({ "capacity": capacity }))
            .with_result(&result);
        audit_log!(record);

        result
    }

    async fn update_capacity_inner(
        &self,
        appliance_id: ApplianceId,
        capacity: u32,
    ) -> OrchResult<Appliance> {
        let mut appliance = self.require_appliance(appliance_id)?;
        let _guard = self.lock_device_map(appliance.zone_id).await?;

        let used = self.stores.mappings.count_mappings(appliance_id)?;
        if capacity != 0 && (capacity as usize) < used {
            return Err(OrchError::conflict(format!(
                "capacity {} is below the {} network(s) mapped to device {}",
                capacity, used, appliance_id
            )));
        }

        appliance.capacity = capacity;
        self.stores.appliances.update_appliance(&appliance)?;
        info!(appliance = appliance_id, capacity, "Updated appliance capacity");
        Ok(appliance)
    }

    /// Changes the administrative state of an appliance.
    #[instrument(skip(self))]
    pub async fn update_state(
        &self,
        appliance_id: ApplianceId,
        state: ApplianceState,
    ) -> OrchResult<Appliance> {
        let result = self.update_state_inner(appliance_id, state);

        let record = AuditRecord::new(AuditCategory::AdminAction, "ApplianceRegistry", "update_state")
            .with_object_id(appliance_id.to_string())
            .with_object_type("appliance")
            .with_details(serde_json::json!({ "state": state }))
            .with_result(&result);
        audit_log!(record);

        result
    }

    fn update_state_inner(
        &self,
        appliance_id: ApplianceId,
        state: ApplianceState,
    ) -> OrchResult<Appliance> {
        if state == ApplianceState::Removed {
            return Err(OrchError::invalid_parameter(
                "state",
                "appliances are removed through deregister",
            ));
        }
        let mut appliance = self.require_appliance(appliance_id)?;
        appliance.state = state;
        self.stores.appliances.update_appliance(&appliance)?;
        info!(appliance = appliance_id, state = %state, "Updated appliance state");
        Ok(appliance)
    }

    fn require_appliance(&self, appliance_id: ApplianceId) -> OrchResult<Appliance> {
        self.stores
            .appliances
            .get_appliance(appliance_id)?
            .ok_or_else(|| {
                OrchError::invalid_parameter(
                    "appliance_id",
                    format!("unknown appliance {}", appliance_id),
                )
            })
    }

    async fn lock_device_map(&self, zone_id: u64) -> OrchResult<LockGuard> {
        self.locks
            .acquire(DEVICE_MAP_LOCK, self.lock_wait)
            .await
            .map_err(|e| OrchError::from_lock(self.stores.zone_label(zone_id), e))
    }
}
