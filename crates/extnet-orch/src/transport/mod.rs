//! Command/answer transport towards appliance agents.

mod command;
mod driver;

pub use command::{
    Answer, Command, CounterMap, FirewallRuleTo, IpAssocCommand, LbDestinationTo, LoadBalancerTo,
    PortForwardingRuleTo, StaticNatRuleTo, UsageReport,
};
pub use driver::{ApplianceDriver, DriverSet, HostRegistry, TransportError};
