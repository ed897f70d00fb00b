//! In-process appliance simulation for development runs.
//!
//! [`SimulatedDriver`] accepts every command, remembers which addresses and
//! VLANs it was told about, and reports counters that grow on every usage
//! query. [`SimulatedHostRegistry`] hands out connection handles without
//! opening anything.

use crate::error::OrchResult;
use crate::transport::{Answer, ApplianceDriver, Command, CounterMap, HostRegistry, TransportError, UsageReport};
use crate::types::{Appliance, ApplianceId, Credentials, TransportHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub const SIMULATED_PROVIDER: &str = "simulated";

/// Bytes added to each counter per usage query.
const GROWTH_PER_QUERY: u64 = 1_500;

#[derive(Debug, Default)]
struct SimulatedAppliance {
    ip_bytes: CounterMap,
    guest_vlan_bytes: CounterMap,
}

impl SimulatedAppliance {
    fn track_ip(&mut self, ip: impl ToString) {
        self.ip_bytes.entry(ip.to_string()).or_insert([0, 0]);
    }

    fn apply(&mut self, command: &Command) {
        match command {
            Command::IpAssoc(assoc) => {
                let vlan = assoc.vlan_tag.to_string();
                if assoc.add {
                    if assoc.shared_source_nat {
                        self.guest_vlan_bytes.entry(vlan).or_insert([0, 0]);
                    }
                    if let Some(ip) = assoc.source_nat_ip {
                        self.track_ip(ip);
                    }
                } else {
                    self.guest_vlan_bytes.remove(&vlan);
                    if let Some(ip) = assoc.source_nat_ip {
                        self.ip_bytes.remove(&ip.to_string());
                    }
                }
            }
            Command::SetFirewallRules(rules) => {
                rules.iter().filter(|r| !r.revoked).for_each(|r| self.track_ip(r.source_ip));
            }
            Command::SetPortForwardingRules(rules) => {
                rules.iter().filter(|r| !r.revoked).for_each(|r| self.track_ip(r.source_ip));
            }
            Command::SetStaticNatRules(rules) => {
                rules.iter().filter(|r| !r.revoked).for_each(|r| self.track_ip(r.source_ip));
            }
            Command::LoadBalancerConfig(rules) => {
                rules.iter().filter(|r| !r.revoked).for_each(|r| self.track_ip(r.source_ip));
            }
            Command::UsageQuery => {}
        }
    }

    fn report(&mut self) -> UsageReport {
        for counters in self
            .ip_bytes
            .values_mut()
            .chain(self.guest_vlan_bytes.values_mut())
        {
            counters[0] += GROWTH_PER_QUERY;
            counters[1] += GROWTH_PER_QUERY * 2;
        }
        UsageReport {
            ip_bytes: self.ip_bytes.clone(),
            guest_vlan_bytes: self.guest_vlan_bytes.clone(),
        }
    }
}

/// Driver that answers every command positively.
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    appliances: DashMap<ApplianceId, SimulatedAppliance>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApplianceDriver for SimulatedDriver {
    fn provider(&self) -> &str {
        SIMULATED_PROVIDER
    }

    async fn send(&self, appliance: &Appliance, command: &Command) -> Result<Answer, TransportError> {
        debug!(appliance = appliance.id, command = %command, "Simulated command");
        let mut state = self.appliances.entry(appliance.id).or_default();
        state.apply(command);
        Ok(match command {
            Command::UsageQuery => Answer::with_usage(state.report()),
            _ => Answer::success(),
        })
    }
}

/// Host registry that only counts connections.
#[derive(Debug)]
pub struct SimulatedHostRegistry {
    next_handle: AtomicU64,
}

impl Default for SimulatedHostRegistry {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
        }
    }
}

impl SimulatedHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostRegistry for SimulatedHostRegistry {
    async fn attach(
        &self,
        identity: &str,
        address: SocketAddr,
        _credentials: &Credentials,
    ) -> OrchResult<TransportHandle> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        debug!(identity, address = %address, handle, "Simulated attach");
        Ok(handle)
    }

    async fn detach(&self, handle: TransportHandle) -> OrchResult<()> {
        debug!(handle, "Simulated detach");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::IpAssocCommand;

    fn assoc(add: bool) -> Command {
        Command::IpAssoc(IpAssocCommand {
            account_id: 7,
            source_nat_ip: Some("203.0.113.7".parse().unwrap()),
            add,
            shared_source_nat: false,
            vlan_tag: 100,
            gateway: "10.1.1.1".parse().unwrap(),
            cidr: "10.1.1.0/24".to_string(),
            self_ip: None,
            network_rate_mbps: None,
        })
    }

    #[test]
    fn test_counters_grow_per_query() {
        let mut state = SimulatedAppliance::default();
        state.apply(&assoc(true));
        assert_eq!(state.report().ip_bytes["203.0.113.7"], [1_500, 3_000]);
        assert_eq!(state.report().ip_bytes["203.0.113.7"], [3_000, 6_000]);

        state.apply(&assoc(false));
        assert!(state.report().ip_bytes.is_empty());
    }
}
