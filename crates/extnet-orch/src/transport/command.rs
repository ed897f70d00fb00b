//! Command and answer types exchanged with appliances.

use crate::types::{FirewallPurpose, LbAlgorithm, PortRange, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Associates (or releases) a guest network on an appliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAssocCommand {
    pub account_id: u64,
    /// `None` when the network uses a zone-shared source NAT
    pub source_nat_ip: Option<IpAddr>,
    pub add: bool,
    pub shared_source_nat: bool,
    pub vlan_tag: u16,
    pub gateway: IpAddr,
    pub cidr: String,
    /// Address the appliance takes inside the guest network, if not the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_rate_mbps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleTo {
    pub source_ip: IpAddr,
    pub ports: Option<PortRange>,
    pub protocol: Protocol,
    pub purpose: FirewallPurpose,
    pub source_cidrs: Vec<String>,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardingRuleTo {
    pub source_ip: IpAddr,
    pub public_port: PortRange,
    pub private_port: PortRange,
    pub protocol: Protocol,
    pub destination_ip: IpAddr,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticNatRuleTo {
    pub vlan_tag: u16,
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbDestinationTo {
    pub ip: IpAddr,
    pub port: u16,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerTo {
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub protocol: Protocol,
    pub algorithm: LbAlgorithm,
    pub revoked: bool,
    pub destinations: Vec<LbDestinationTo>,
}

/// A command sent to an appliance agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Command {
    IpAssoc(IpAssocCommand),
    SetFirewallRules(Vec<FirewallRuleTo>),
    SetPortForwardingRules(Vec<PortForwardingRuleTo>),
    SetStaticNatRules(Vec<StaticNatRuleTo>),
    LoadBalancerConfig(Vec<LoadBalancerTo>),
    UsageQuery,
}

impl Command {
    /// Short name used in logs and audit records.
    pub fn name(&self) -> &'static str {
        match self {
            Command::IpAssoc(_) => "ip_assoc",
            Command::SetFirewallRules(_) => "set_firewall_rules",
            Command::SetPortForwardingRules(_) => "set_port_forwarding_rules",
            Command::SetStaticNatRules(_) => "set_static_nat_rules",
            Command::LoadBalancerConfig(_) => "load_balancer_config",
            Command::UsageQuery => "usage_query",
        }
    }

    /// Number of rule descriptors carried, 0 for non-rule commands.
    pub fn descriptor_count(&self) -> usize {
        match self {
            Command::SetFirewallRules(r) => r.len(),
            Command::SetPortForwardingRules(r) => r.len(),
            Command::SetStaticNatRules(r) => r.len(),
            Command::LoadBalancerConfig(r) => r.len(),
            Command::IpAssoc(_) | Command::UsageQuery => 0,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Raw `[sent, received]` byte counters keyed by address or VLAN tag.
pub type CounterMap = HashMap<String, [u64; 2]>;

/// Counters returned by a usage query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    #[serde(default)]
    pub ip_bytes: CounterMap,
    #[serde(default)]
    pub guest_vlan_bytes: CounterMap,
}

/// Reply of an appliance agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub result: bool,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageReport>,
}

impl Answer {
    pub fn success() -> Self {
        Self {
            result: true,
            details: String::new(),
            usage: None,
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: details.into(),
            usage: None,
        }
    }

    pub fn with_usage(report: UsageReport) -> Self {
        Self {
            result: true,
            details: String::new(),
            usage: Some(report),
        }
    }
}
