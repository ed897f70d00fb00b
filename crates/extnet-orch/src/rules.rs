//! Pushes firewall, NAT, port-forwarding and load-balancing rules to the
//! appliance assigned to a network.
//!
//! Rules of one kind travel in a single command. Revoked rules are sent with
//! `revoked = true` rather than left out, so the appliance never has to infer
//! a removal from absence.

use crate::audit::{audit_log, AuditCategory, AuditRecord};
use crate::error::{OrchError, OrchResult};
use crate::store::Stores;
use crate::transport::{
    Command, DriverSet, FirewallRuleTo, LbDestinationTo, LoadBalancerTo, PortForwardingRuleTo,
    StaticNatRuleTo,
};
use crate::types::{
    ApplianceId, FirewallRule, LoadBalancingRule, NetworkId, NetworkState, PortForwardingRule,
    PublicIp, PublicIpId, Rule, RuleKind, StaticNatRule,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of a successful apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// One command was sent and confirmed.
    Applied {
        appliance: ApplianceId,
        descriptors: usize,
    },
    /// Nothing to send.
    Empty,
    /// No appliance of the required kind serves the network.
    NotAssigned,
    /// The network was never implemented.
    NotImplemented,
}

impl ApplyOutcome {
    /// Whether a command went out.
    pub fn was_sent(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Translates rule sets into appliance commands.
pub struct RuleApplier {
    stores: Stores,
    drivers: Arc<DriverSet>,
}

impl RuleApplier {
    pub fn new(stores: Stores, drivers: Arc<DriverSet>) -> Self {
        Self { stores, drivers }
    }

    pub async fn apply_firewall_rules(
        &self,
        network_id: NetworkId,
        rules: &[FirewallRule],
    ) -> OrchResult<ApplyOutcome> {
        let rules: Vec<Rule> = rules.iter().cloned().map(Rule::Firewall).collect();
        self.apply(network_id, RuleKind::Firewall, &rules).await
    }

    pub async fn apply_port_forwarding_rules(
        &self,
        network_id: NetworkId,
        rules: &[PortForwardingRule],
    ) -> OrchResult<ApplyOutcome> {
        let rules: Vec<Rule> = rules.iter().cloned().map(Rule::PortForwarding).collect();
        self.apply(network_id, RuleKind::PortForwarding, &rules).await
    }

    pub async fn apply_static_nat_rules(
        &self,
        network_id: NetworkId,
        rules: &[StaticNatRule],
    ) -> OrchResult<ApplyOutcome> {
        let rules: Vec<Rule> = rules.iter().cloned().map(Rule::StaticNat).collect();
        self.apply(network_id, RuleKind::StaticNat, &rules).await
    }

    pub async fn apply_load_balancer_rules(
        &self,
        network_id: NetworkId,
        rules: &[LoadBalancingRule],
    ) -> OrchResult<ApplyOutcome> {
        let rules: Vec<Rule> = rules.iter().cloned().map(Rule::LoadBalancing).collect();
        self.apply(network_id, RuleKind::LoadBalancing, &rules).await
    }

    /// Applies a mixed rule list, one command per kind present.
    ///
    /// Kinds are dispatched in a fixed order; the first failure aborts the
    /// remaining kinds.
    pub async fn apply_rules(
        &self,
        network_id: NetworkId,
        rules: &[Rule],
    ) -> OrchResult<Vec<(RuleKind, ApplyOutcome)>> {
        let mut by_kind: BTreeMap<RuleKind, Vec<Rule>> = BTreeMap::new();
        for rule in rules {
            by_kind.entry(rule.kind()).or_default().push(rule.clone());
        }

        let mut outcomes = Vec::with_capacity(by_kind.len());
        for (kind, batch) in by_kind {
            let outcome = self.apply(network_id, kind, &batch).await?;
            outcomes.push((kind, outcome));
        }
        Ok(outcomes)
    }

    /// Applies rules that are all of `kind`.
    #[instrument(skip(self, rules), fields(rules = rules.len()))]
    pub async fn apply(
        &self,
        network_id: NetworkId,
        kind: RuleKind,
        rules: &[Rule],
    ) -> OrchResult<ApplyOutcome> {
        if let Some(stray) = rules.iter().find(|r| r.kind() != kind) {
            return Err(OrchError::invalid_parameter(
                "rules",
                format!("rule {} is {} but the batch is {}", stray.id(), stray.kind(), kind),
            ));
        }

        let network = self.stores.require_network(network_id)?;
        let appliance_kind = kind.appliance_kind();
        let appliance = match self.stores.mappings.find_mapping(network_id, appliance_kind)? {
            Some(mapping) => self.stores.appliances.get_appliance(mapping.appliance_id)?,
            None => None,
        };
        let appliance = match appliance {
            Some(appliance) => appliance,
            None => {
                debug!(network = network_id, kind = %kind, "No appliance assigned, skipping rules");
                return Ok(ApplyOutcome::NotAssigned);
            }
        };
        if network.state == NetworkState::Allocated {
            debug!(network = network_id, kind = %kind, "Network never implemented, skipping rules");
            return Ok(ApplyOutcome::NotImplemented);
        }
        if rules.is_empty() {
            return Ok(ApplyOutcome::Empty);
        }

        let zone = self.stores.zone_label(network.zone_id);
        let command = self.build_command(kind, rules)?;
        let descriptors = command.descriptor_count();
        let result = self
            .drivers
            .send_checked(&zone, &appliance, &command)
            .await
            .map(|_| ApplyOutcome::Applied {
                appliance: appliance.id,
                descriptors,
            });

        let record = AuditRecord::new(AuditCategory::RuleApplication, "RuleApplier", command.name())
            .with_object_id(network_id.to_string())
            .with_object_type("rule_batch")
            .with_details(serde_json::json!({
                "appliance": appliance.id,
                "kind": kind.to_string(),
                "descriptors": descriptors,
            }))
            .with_result(&result);
        audit_log!(record);

        if result.is_ok() {
            info!(
                zone = %zone,
                network = network_id,
                appliance = appliance.id,
                kind = %kind,
                descriptors,
                "Applied rules"
            );
        }
        result
    }

    fn source_ip(&self, id: PublicIpId) -> OrchResult<PublicIp> {
        self.stores.catalog.public_ip(id)?.ok_or_else(|| {
            OrchError::invalid_parameter("source_ip_id", format!("unknown public IP {}", id))
        })
    }

    fn build_command(&self, kind: RuleKind, rules: &[Rule]) -> OrchResult<Command> {
        Ok(match kind {
            RuleKind::Firewall => {
                let mut out = Vec::with_capacity(rules.len());
                for rule in rules.iter().filter_map(|r| match r {
                    Rule::Firewall(fw) => Some(fw),
                    _ => None,
                }) {
                    out.push(FirewallRuleTo {
                        source_ip: self.source_ip(rule.source_ip_id)?.address,
                        ports: rule.ports,
                        protocol: rule.protocol,
                        purpose: rule.purpose,
                        source_cidrs: rule.source_cidrs.iter().map(|c| c.to_string()).collect(),
                        revoked: rule.state.is_revoked(),
                    });
                }
                Command::SetFirewallRules(out)
            }
            RuleKind::PortForwarding => {
                let mut out = Vec::with_capacity(rules.len());
                for rule in rules.iter().filter_map(|r| match r {
                    Rule::PortForwarding(pf) => Some(pf),
                    _ => None,
                }) {
                    out.push(PortForwardingRuleTo {
                        source_ip: self.source_ip(rule.source_ip_id)?.address,
                        public_port: rule.public_ports,
                        private_port: rule.private_ports,
                        protocol: rule.protocol,
                        destination_ip: rule.destination_ip,
                        revoked: rule.state.is_revoked(),
                    });
                }
                Command::SetPortForwardingRules(out)
            }
            RuleKind::StaticNat => {
                let mut out = Vec::with_capacity(rules.len());
                for rule in rules.iter().filter_map(|r| match r {
                    Rule::StaticNat(nat) => Some(nat),
                    _ => None,
                }) {
                    let ip = self.source_ip(rule.source_ip_id)?;
                    out.push(StaticNatRuleTo {
                        vlan_tag: ip.vlan_tag,
                        source_ip: ip.address,
                        dest_ip: rule.destination_ip,
                        revoked: rule.state.is_revoked(),
                    });
                }
                Command::SetStaticNatRules(out)
            }
            RuleKind::LoadBalancing => {
                let mut out = Vec::with_capacity(rules.len());
                for rule in rules.iter().filter_map(|r| match r {
                    Rule::LoadBalancing(lb) => Some(lb),
                    _ => None,
                }) {
                    out.push(LoadBalancerTo {
                        source_ip: self.source_ip(rule.source_ip_id)?.address,
                        source_port: rule.source_port,
                        protocol: rule.protocol,
                        algorithm: rule.algorithm,
                        revoked: rule.state.is_revoked(),
                        destinations: rule
                            .destinations
                            .iter()
                            .map(|d| LbDestinationTo {
                                ip: d.ip,
                                port: d.port,
                                revoked: d.revoked,
                            })
                            .collect(),
                    });
                }
                Command::LoadBalancerConfig(out)
            }
        })
    }
}
