//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use extnet_common::InProcessLocks;
use extnet_orch::config::Config;
use extnet_orch::sim::SimulatedHostRegistry;
use extnet_orch::store::{MemoryStore, NetworkCatalog, Stores};
use extnet_orch::transport::{
    Answer, ApplianceDriver, Command, DriverSet, TransportError, UsageReport,
};
use extnet_orch::types::{
    Appliance, ApplianceConfig, ApplianceId, Credentials, FirewallConfig, GuestNetwork,
    LoadBalancerConfig, NetworkId, NetworkState, PhysicalNetwork, PublicIp, PublicIpId,
    RegisterAppliance, Zone,
};
use extnet_orch::ControlPlane;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub const PROVIDER: &str = "recording";
pub const ZONE_ID: u64 = 1;
pub const ZONE_NAME: &str = "zone-east";
pub const PHYSICAL_NETWORK_ID: u64 = 10;

/// How the driver answers commands for one appliance.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Negative answer with these details
    Negative(String),
    /// Transport error
    Unreachable,
}

/// Driver that records every command and answers from configured state.
#[derive(Default)]
pub struct RecordingDriver {
    sent: Mutex<Vec<(ApplianceId, Command)>>,
    failures: Mutex<HashMap<ApplianceId, Failure>>,
    usage: Mutex<HashMap<ApplianceId, UsageReport>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingDriver {
    pub fn sent(&self) -> Vec<(ApplianceId, Command)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, appliance_id: ApplianceId) -> Vec<Command> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| *id == appliance_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.sent.lock().iter().filter(|(_, c)| c.name() == name).count()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn fail(&self, appliance_id: ApplianceId, failure: Failure) {
        self.failures.lock().insert(appliance_id, failure);
    }

    pub fn heal(&self, appliance_id: ApplianceId) {
        self.failures.lock().remove(&appliance_id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Sets `ip_bytes[key] = [sent, received]` for an appliance.
    pub fn report_ip(&self, appliance_id: ApplianceId, key: &str, sent: u64, received: u64) {
        self.usage
            .lock()
            .entry(appliance_id)
            .or_default()
            .ip_bytes
            .insert(key.to_string(), [sent, received]);
    }

    /// Drops `ip_bytes[key]` from an appliance's report.
    pub fn forget_ip(&self, appliance_id: ApplianceId, key: &str) {
        if let Some(report) = self.usage.lock().get_mut(&appliance_id) {
            report.ip_bytes.remove(key);
        }
    }

    /// Sets `guest_vlan_bytes[tag] = [sent, received]` for an appliance.
    pub fn report_vlan(&self, appliance_id: ApplianceId, tag: u16, sent: u64, received: u64) {
        self.usage
            .lock()
            .entry(appliance_id)
            .or_default()
            .guest_vlan_bytes
            .insert(tag.to_string(), [sent, received]);
    }
}

#[async_trait]
impl ApplianceDriver for RecordingDriver {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, appliance: &Appliance, command: &Command) -> Result<Answer, TransportError> {
        self.sent.lock().push((appliance.id, command.clone()));

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().get(&appliance.id).cloned();
        match failure {
            Some(Failure::Negative(details)) => return Ok(Answer::failure(details)),
            Some(Failure::Unreachable) => {
                return Err(TransportError::Unreachable("connection refused".to_string()))
            }
            None => {}
        }

        Ok(match command {
            Command::UsageQuery => {
                let report = self.usage.lock().get(&appliance.id).cloned().unwrap_or_default();
                Answer::with_usage(report)
            }
            _ => Answer::success(),
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub driver: Arc<RecordingDriver>,
    pub locks: Arc<InProcessLocks>,
    pub plane: ControlPlane,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.add_zone(Zone {
            id: ZONE_ID,
            name: ZONE_NAME.to_string(),
        });
        store.add_physical_network(PhysicalNetwork {
            id: PHYSICAL_NETWORK_ID,
            zone_id: ZONE_ID,
            name: "physnet-public".to_string(),
        });

        let driver = Arc::new(RecordingDriver::default());
        let locks = Arc::new(InProcessLocks::new());
        let drivers = Arc::new(DriverSet::new(config.command_timeout()).with_driver(driver.clone()));
        let plane = ControlPlane::new(
            &config,
            Stores::memory(store.clone()),
            drivers,
            Arc::new(SimulatedHostRegistry::new()),
            locks.clone(),
        );

        Self {
            store,
            driver,
            locks,
            plane,
        }
    }

    pub async fn register_firewall(&self, ip: &str, capacity: u32) -> Appliance {
        self.plane
            .register_appliance(firewall_request(ip, Some(capacity)))
            .await
            .unwrap()
    }

    pub async fn register_balancer(&self, ip: &str, capacity: u32, inline: bool) -> Appliance {
        self.plane
            .register_appliance(RegisterAppliance {
                physical_network_id: PHYSICAL_NETWORK_ID,
                endpoint: format!("https://{}", ip),
                credentials: credentials(),
                provider_name: PROVIDER.to_string(),
                config: ApplianceConfig::LoadBalancer(LoadBalancerConfig {
                    public_interface: "1.1".to_string(),
                    private_interface: "1.2".to_string(),
                    inline,
                }),
                capacity: Some(capacity),
                dedicated: None,
            })
            .await
            .unwrap()
    }

    /// Adds network `id` (1..=250) for `account_id`.
    ///
    /// The network is `10.<id>.0.0/24` on VLAN `100 + id` with gateway
    /// `10.<id>.0.1`. Unless `shared_source_nat`, it also gets the source NAT
    /// address `203.0.113.<id>` as public IP `id * 10`.
    pub fn add_network(&self, id: NetworkId, account_id: u64, shared_source_nat: bool) -> GuestNetwork {
        let network = GuestNetwork {
            id,
            zone_id: ZONE_ID,
            physical_network_id: PHYSICAL_NETWORK_ID,
            account_id,
            vlan_tag: 100 + id as u16,
            gateway: format!("10.{}.0.1", id).parse().unwrap(),
            cidr: format!("10.{}.0.0/24", id).parse().unwrap(),
            state: NetworkState::Allocated,
            shared_source_nat,
            network_rate_mbps: Some(200),
        };
        self.store.add_network(network.clone());
        if !shared_source_nat {
            self.store.add_public_ip(PublicIp {
                id: id * 10,
                address: source_nat_address(id),
                vlan_tag: 50,
                account_id,
                network_id: Some(id),
                source_nat: true,
            });
        }
        network
    }

    /// Current record of a network, as the store sees it.
    pub fn store_network(&self, id: NetworkId) -> GuestNetwork {
        self.store.network(id).unwrap().unwrap()
    }

    pub fn add_public_ip(&self, id: PublicIpId, address: &str, network: &GuestNetwork) -> PublicIp {
        let ip = PublicIp {
            id,
            address: address.parse().unwrap(),
            vlan_tag: 50,
            account_id: network.account_id,
            network_id: Some(network.id),
            source_nat: false,
        };
        self.store.add_public_ip(ip.clone());
        ip
    }
}

pub fn source_nat_address(network_id: NetworkId) -> IpAddr {
    format!("203.0.113.{}", network_id).parse().unwrap()
}

pub fn credentials() -> Credentials {
    Credentials {
        username: "admin".to_string(),
        password: "secret".to_string(),
    }
}

pub fn firewall_request(ip: &str, capacity: Option<u32>) -> RegisterAppliance {
    RegisterAppliance {
        physical_network_id: PHYSICAL_NETWORK_ID,
        endpoint: ip.to_string(),
        credentials: credentials(),
        provider_name: PROVIDER.to_string(),
        config: ApplianceConfig::Firewall(FirewallConfig {
            public_interface: "ethernet1/1".to_string(),
            private_interface: "ethernet1/2".to_string(),
            public_zone: Some("untrust".to_string()),
            private_zone: Some("trust".to_string()),
        }),
        capacity,
        dedicated: None,
    }
}
