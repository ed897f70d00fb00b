//! Data model of the appliance control plane.
//!
//! Identifiers are plain integers assigned by the owning store. Appliances
//! get monotonically increasing ids, so ordering by id is registration order.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub type ZoneId = u64;
pub type PhysicalNetworkId = u64;
pub type ApplianceId = u64;
pub type NetworkId = u64;
pub type AccountId = u64;
pub type PublicIpId = u64;
pub type RuleId = u64;

/// Handle of a live transport connection, issued by the host registry.
pub type TransportHandle = u64;

/// Availability zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
}

/// Zone-scoped L2 domain that owns appliances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalNetwork {
    pub id: PhysicalNetworkId,
    pub zone_id: ZoneId,
    pub name: String,
}

/// Kind of external appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplianceKind {
    Firewall,
    LoadBalancer,
}

impl fmt::Display for ApplianceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplianceKind::Firewall => write!(f, "firewall"),
            ApplianceKind::LoadBalancer => write!(f, "load_balancer"),
        }
    }
}

/// Administrative state of an appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplianceState {
    Enabled,
    Disabled,
    Maintenance,
    Removed,
}

impl fmt::Display for ApplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplianceState::Enabled => write!(f, "enabled"),
            ApplianceState::Disabled => write!(f, "disabled"),
            ApplianceState::Maintenance => write!(f, "maintenance"),
            ApplianceState::Removed => write!(f, "removed"),
        }
    }
}

/// Login credentials for an appliance's management interface.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connection settings of an external firewall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Interface facing the public network
    pub public_interface: String,
    /// Interface facing the guest networks
    pub private_interface: String,
    /// Zone the public interface belongs to on the device
    #[serde(default)]
    pub public_zone: Option<String>,
    /// Zone the private interface belongs to on the device
    #[serde(default)]
    pub private_zone: Option<String>,
}

/// Connection settings of an external load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub public_interface: String,
    pub private_interface: String,
    /// Whether the balancer sits in the traffic path behind a firewall
    #[serde(default)]
    pub inline: bool,
}

/// Typed per-kind appliance configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplianceConfig {
    Firewall(FirewallConfig),
    LoadBalancer(LoadBalancerConfig),
}

impl ApplianceConfig {
    pub fn kind(&self) -> ApplianceKind {
        match self {
            ApplianceConfig::Firewall(_) => ApplianceKind::Firewall,
            ApplianceConfig::LoadBalancer(_) => ApplianceKind::LoadBalancer,
        }
    }

    /// Returns true for a load balancer deployed inline.
    pub fn is_inline(&self) -> bool {
        matches!(self, ApplianceConfig::LoadBalancer(lb) if lb.inline)
    }

    /// Returns the name of the first interface field that is empty.
    pub fn missing_interface(&self) -> Option<&'static str> {
        let (public, private) = match self {
            ApplianceConfig::Firewall(fw) => (&fw.public_interface, &fw.private_interface),
            ApplianceConfig::LoadBalancer(lb) => (&lb.public_interface, &lb.private_interface),
        };
        if public.trim().is_empty() {
            Some("public_interface")
        } else if private.trim().is_empty() {
            Some("private_interface")
        } else {
            None
        }
    }
}

/// Request to register an appliance.
#[derive(Debug, Clone)]
pub struct RegisterAppliance {
    pub physical_network_id: PhysicalNetworkId,
    /// Management address, `ip` or `ip:port`
    pub endpoint: String,
    pub credentials: Credentials,
    pub provider_name: String,
    pub config: ApplianceConfig,
    pub capacity: Option<u32>,
    pub dedicated: Option<bool>,
}

/// An external firewall or load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appliance {
    pub id: ApplianceId,
    pub physical_network_id: PhysicalNetworkId,
    pub zone_id: ZoneId,
    pub provider_name: String,
    /// Max concurrently mapped networks; 0 means the configured default
    pub capacity: u32,
    pub dedicated: bool,
    pub state: ApplianceState,
    pub address: SocketAddr,
    /// Transport-level device identity
    pub identity: String,
    pub config: ApplianceConfig,
    pub transport: TransportHandle,
}

impl Appliance {
    pub fn kind(&self) -> ApplianceKind {
        self.config.kind()
    }

    pub fn is_inline(&self) -> bool {
        self.config.is_inline()
    }

    /// Identity used by the host registry to deduplicate devices.
    pub fn device_identity(
        physical_network_id: PhysicalNetworkId,
        provider_name: &str,
        ip: IpAddr,
    ) -> String {
        format!("{}-{}-{}", physical_network_id, provider_name, ip)
    }
}

/// Network to appliance assignment; one per (network, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkMapping {
    pub network_id: NetworkId,
    pub appliance_id: ApplianceId,
    pub kind: ApplianceKind,
}

/// Implement/shutdown status of a guest network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Allocated,
    Implementing,
    Implemented,
    ShuttingDown,
    Shutdown,
}

impl NetworkState {
    /// `Allocated` and `Shutdown` both allow a fresh implement.
    pub fn is_idle(&self) -> bool {
        matches!(self, NetworkState::Allocated | NetworkState::Shutdown)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkState::Allocated => "allocated",
            NetworkState::Implementing => "implementing",
            NetworkState::Implemented => "implemented",
            NetworkState::ShuttingDown => "shutting_down",
            NetworkState::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Tenant-owned L3 network segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNetwork {
    pub id: NetworkId,
    pub zone_id: ZoneId,
    pub physical_network_id: PhysicalNetworkId,
    pub account_id: AccountId,
    pub vlan_tag: u16,
    pub gateway: IpAddr,
    pub cidr: IpNetwork,
    pub state: NetworkState,
    /// Offering flag: outbound traffic uses a zone-shared source NAT
    pub shared_source_nat: bool,
    /// Offering rate limit in Mbps
    pub network_rate_mbps: Option<u32>,
}

/// Public IP address allocated to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIp {
    pub id: PublicIpId,
    pub address: IpAddr,
    pub vlan_tag: u16,
    pub account_id: AccountId,
    /// Guest network the address is associated with
    pub network_id: Option<NetworkId>,
    pub source_nat: bool,
}

/// Marker that an IP is consumed on an appliance for a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderReservation {
    pub network_id: NetworkId,
    pub ip: IpAddr,
    pub appliance_id: ApplianceId,
    pub created_at: DateTime<Utc>,
}

/// Key of a usage statistics row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub account_id: AccountId,
    pub zone_id: ZoneId,
    pub network_id: NetworkId,
    /// `None` for a shared source NAT row keyed by guest VLAN
    pub public_ip: Option<IpAddr>,
    pub appliance_id: ApplianceId,
}

/// Cumulative byte counters for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageStatsRow {
    pub key: UsageKey,
    pub net_bytes_sent: u64,
    pub net_bytes_received: u64,
    pub current_bytes_sent: u64,
    pub current_bytes_received: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UsageStatsRow {
    pub fn new(key: UsageKey) -> Self {
        Self {
            key,
            net_bytes_sent: 0,
            net_bytes_received: 0,
            current_bytes_sent: 0,
            current_bytes_received: 0,
            updated_at: None,
        }
    }

    /// Total bytes sent so far, including the current period.
    pub fn total_sent(&self) -> u64 {
        self.net_bytes_sent.saturating_add(self.current_bytes_sent)
    }

    /// Total bytes received so far, including the current period.
    pub fn total_received(&self) -> u64 {
        self.net_bytes_received
            .saturating_add(self.current_bytes_received)
    }
}

/// Transport protocol of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

/// Lifecycle of a rule as seen by this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Active,
    Revoke,
}

impl RuleState {
    pub fn is_revoked(&self) -> bool {
        matches!(self, RuleState::Revoke)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallPurpose {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbAlgorithm {
    RoundRobin,
    LeastConn,
    Source,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub id: RuleId,
    pub source_ip_id: PublicIpId,
    pub ports: Option<PortRange>,
    pub protocol: Protocol,
    pub purpose: FirewallPurpose,
    pub source_cidrs: Vec<IpNetwork>,
    pub state: RuleState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardingRule {
    pub id: RuleId,
    pub source_ip_id: PublicIpId,
    pub public_ports: PortRange,
    pub private_ports: PortRange,
    pub protocol: Protocol,
    /// Guest VM address traffic is forwarded to
    pub destination_ip: IpAddr,
    pub state: RuleState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticNatRule {
    pub id: RuleId,
    pub source_ip_id: PublicIpId,
    pub destination_ip: IpAddr,
    pub state: RuleState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbDestination {
    pub ip: IpAddr,
    pub port: u16,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancingRule {
    pub id: RuleId,
    pub source_ip_id: PublicIpId,
    pub source_port: u16,
    pub protocol: Protocol,
    pub algorithm: LbAlgorithm,
    pub destinations: Vec<LbDestination>,
    pub state: RuleState,
}

/// Kind of rule, used to pick the command and the appliance kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleKind {
    Firewall,
    PortForwarding,
    StaticNat,
    LoadBalancing,
}

impl RuleKind {
    /// Kind of appliance that enforces this rule kind.
    pub fn appliance_kind(&self) -> ApplianceKind {
        match self {
            RuleKind::LoadBalancing => ApplianceKind::LoadBalancer,
            _ => ApplianceKind::Firewall,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::Firewall => "firewall",
            RuleKind::PortForwarding => "port_forwarding",
            RuleKind::StaticNat => "static_nat",
            RuleKind::LoadBalancing => "load_balancing",
        };
        write!(f, "{}", s)
    }
}

/// Any rule this core can push to an appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Firewall(FirewallRule),
    PortForwarding(PortForwardingRule),
    StaticNat(StaticNatRule),
    LoadBalancing(LoadBalancingRule),
}

impl Rule {
    pub fn id(&self) -> RuleId {
        match self {
            Rule::Firewall(r) => r.id,
            Rule::PortForwarding(r) => r.id,
            Rule::StaticNat(r) => r.id,
            Rule::LoadBalancing(r) => r.id,
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            Rule::Firewall(_) => RuleKind::Firewall,
            Rule::PortForwarding(_) => RuleKind::PortForwarding,
            Rule::StaticNat(_) => RuleKind::StaticNat,
            Rule::LoadBalancing(_) => RuleKind::LoadBalancing,
        }
    }

    pub fn source_ip_id(&self) -> PublicIpId {
        match self {
            Rule::Firewall(r) => r.source_ip_id,
            Rule::PortForwarding(r) => r.source_ip_id,
            Rule::StaticNat(r) => r.source_ip_id,
            Rule::LoadBalancing(r) => r.source_ip_id,
        }
    }

    pub fn state(&self) -> RuleState {
        match self {
            Rule::Firewall(r) => r.state,
            Rule::PortForwarding(r) => r.state,
            Rule::StaticNat(r) => r.state,
            Rule::LoadBalancing(r) => r.state,
        }
    }
}
