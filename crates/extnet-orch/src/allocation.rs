//! First-fit allocation of guest networks to appliances.

use crate::config::CapacityConfig;
use crate::error::{OrchError, OrchResult};
use crate::store::Stores;
use crate::types::{Appliance, ApplianceKind, ApplianceState, GuestNetwork};
use tracing::{debug, instrument};

/// Picks the appliance that serves a network.
///
/// Capacity consumption is the count of mappings pointing at an appliance;
/// nothing else is stored. Callers that intend to persist a mapping for the
/// returned appliance must hold the device-map lock across selection and
/// persistence.
pub struct AllocationPolicy {
    stores: Stores,
    capacity: CapacityConfig,
}

impl AllocationPolicy {
    pub fn new(stores: Stores, capacity: CapacityConfig) -> Self {
        Self { stores, capacity }
    }

    /// Capacity of `appliance`, substituting the configured default for 0.
    pub fn effective_capacity(&self, appliance: &Appliance) -> OrchResult<u32> {
        match appliance.capacity {
            0 => self.capacity.default_for(appliance.kind()),
            capacity => Ok(capacity),
        }
    }

    /// Whether `appliance` can take one more network given `used` mappings.
    ///
    /// A dedicated appliance with any mapping is full.
    pub fn has_free_slot(&self, appliance: &Appliance, used: usize) -> OrchResult<bool> {
        if appliance.dedicated && used > 0 {
            return Ok(false);
        }
        Ok(used < self.effective_capacity(appliance)? as usize)
    }

    /// Returns the first enabled appliance of `kind`, in registration order,
    /// that has a free slot.
    #[instrument(skip(self, network), fields(network = network.id, zone = network.zone_id))]
    pub fn select_appliance(
        &self,
        network: &GuestNetwork,
        kind: ApplianceKind,
    ) -> OrchResult<Appliance> {
        let mut candidates = self
            .stores
            .appliances
            .list_appliances(network.physical_network_id)?;
        candidates.sort_by_key(|a| a.id);

        for appliance in candidates
            .into_iter()
            .filter(|a| a.kind() == kind && a.state == ApplianceState::Enabled)
        {
            let used = self.stores.mappings.count_mappings(appliance.id)?;
            if self.has_free_slot(&appliance, used)? {
                debug!(appliance = appliance.id, used, "Selected appliance");
                return Ok(appliance);
            }
            debug!(appliance = appliance.id, used, "Appliance is full");
        }

        Err(OrchError::insufficient_capacity(
            self.stores.zone_label(network.zone_id),
            kind,
        ))
    }
}
