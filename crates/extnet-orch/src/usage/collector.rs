//! Zone-by-zone collection of appliance byte counters.

use super::reconcile::{apply_reading, ByteCounters};
use crate::audit::{audit_log, AuditCategory, AuditOutcome, AuditRecord};
use crate::config::{AccountDedup, Config};
use crate::error::{OrchError, OrchResult};
use crate::store::Stores;
use crate::transport::{Command, DriverSet, UsageReport};
use crate::types::{
    AccountId, Appliance, ApplianceId, ApplianceKind, ApplianceState, GuestNetwork,
    NetworkState, RuleId, UsageKey, UsageStatsRow, ZoneId,
};
use async_trait::async_trait;
use chrono::Utc;
use extnet_common::{LockProvider, PeriodicTask, TaskResult, TaskStatus, TickReport};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Name of the lock guarding one zone's collection.
pub fn usage_lock_name(zone_id: ZoneId) -> String {
    format!("usage-collection:zone:{}", zone_id)
}

/// Where a row's counters are read from in a usage answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterSource {
    /// `ip_bytes[address]`
    Ip(IpAddr),
    /// `guest_vlan_bytes[tag]`, for a shared source NAT network
    GuestVlan(u16),
    /// `ip_bytes[internal]` behind an inline balancer, with sent forced to 0
    InlineNic(IpAddr),
}

impl CounterSource {
    fn read(&self, report: &UsageReport) -> Option<ByteCounters> {
        match self {
            CounterSource::Ip(ip) => report.ip_bytes.get(&ip.to_string()).map(|c| (*c).into()),
            CounterSource::GuestVlan(tag) => report
                .guest_vlan_bytes
                .get(&tag.to_string())
                .map(|c| (*c).into()),
            CounterSource::InlineNic(internal) => report
                .ip_bytes
                .get(&internal.to_string())
                .map(|c| ByteCounters::new(0, c[1])),
        }
    }
}

#[derive(Debug, Clone)]
struct UsageTarget {
    key: UsageKey,
    source: CounterSource,
}

/// State carried across one zone pass.
#[derive(Default)]
struct ZonePass {
    /// One answer per appliance; `None` records a failed query
    answers: HashMap<ApplianceId, Option<Arc<UsageReport>>>,
    seen_accounts: HashSet<AccountId>,
    report: TickReport,
}

/// Polls appliances for counters and reconciles them into usage rows.
pub struct UsageCollector {
    stores: Stores,
    drivers: Arc<DriverSet>,
    locks: Arc<dyn LockProvider>,
    zone_lock_wait: Duration,
    interval: Option<Duration>,
    dedup: AccountDedup,
}

impl UsageCollector {
    pub fn new(
        stores: Stores,
        drivers: Arc<DriverSet>,
        locks: Arc<dyn LockProvider>,
        config: &Config,
    ) -> Self {
        Self {
            stores,
            drivers,
            locks,
            zone_lock_wait: config.usage_zone_lock_wait(),
            interval: config.usage_interval(),
            dedup: config.usage.account_dedup,
        }
    }

    /// Runs one pass over every zone. Never fails; problems are counted.
    pub async fn collect_all_zones(&self) -> TickReport {
        let mut total = TickReport::default();
        let zones = match self.stores.catalog.zones() {
            Ok(zones) => zones,
            Err(e) => {
                warn!(error = %e, "Failed to list zones for usage collection");
                total.failed += 1;
                return total;
            }
        };

        for zone in zones {
            match self.collect_zone_usage(zone.id).await {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    warn!(zone = %zone.name, error = %e, "Usage collection failed for zone");
                    total.failed += 1;
                }
            }
        }
        total
    }

    /// Collects one zone, skipping it if another collector holds its lock.
    #[instrument(skip(self))]
    pub async fn collect_zone_usage(&self, zone_id: ZoneId) -> OrchResult<TickReport> {
        let zone = self.stores.catalog.zone(zone_id)?.ok_or_else(|| {
            OrchError::invalid_parameter("zone_id", format!("unknown zone {}", zone_id))
        })?;

        let _guard = match self
            .locks
            .acquire(&usage_lock_name(zone_id), self.zone_lock_wait)
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                info!(zone = %zone.name, error = %e, "Zone usage is being collected elsewhere, skipping");
                return Ok(TickReport {
                    skipped: 1,
                    ..TickReport::default()
                });
            }
        };

        let mut pass = ZonePass::default();
        for physical_network in self.stores.catalog.physical_networks(zone_id)? {
            let appliances = match self.stores.appliances.list_appliances(physical_network.id) {
                Ok(appliances) => appliances,
                Err(e) => {
                    warn!(zone = %zone.name, physical_network = physical_network.id, error = %e, "Failed to list appliances");
                    pass.report.failed += 1;
                    continue;
                }
            };
            for appliance in appliances
                .iter()
                .filter(|a| a.state != ApplianceState::Removed)
            {
                self.collect_appliance(&zone.name, appliance, &mut pass)
                    .await;
            }
        }

        debug!(
            zone = %zone.name,
            completed = pass.report.completed,
            skipped = pass.report.skipped,
            failed = pass.report.failed,
            "Zone usage pass finished"
        );
        let outcome = match pass.report.status() {
            TaskStatus::Success => AuditOutcome::Success,
            _ => AuditOutcome::Failure,
        };
        let record = AuditRecord::new(AuditCategory::UsageCollection, "UsageCollector", "collect_zone")
            .with_outcome(outcome)
            .with_object_id(zone.name.clone())
            .with_object_type("zone")
            .with_details(serde_json::json!({
                "completed": pass.report.completed,
                "skipped": pass.report.skipped,
                "failed": pass.report.failed,
            }));
        audit_log!(record);

        Ok(pass.report)
    }

    async fn collect_appliance(&self, zone: &str, appliance: &Appliance, pass: &mut ZonePass) {
        let mappings = match self.stores.mappings.list_mappings(appliance.id) {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!(zone = %zone, appliance = appliance.id, error = %e, "Failed to list mappings");
                pass.report.failed += 1;
                return;
            }
        };

        let mut accounts_here = HashSet::new();
        for mapping in mappings {
            let network = match self.stores.catalog.network(mapping.network_id) {
                Ok(Some(network)) => network,
                Ok(None) => continue,
                Err(e) => {
                    warn!(zone = %zone, network = mapping.network_id, error = %e, "Failed to load network");
                    pass.report.failed += 1;
                    continue;
                }
            };
            if network.state != NetworkState::Implemented {
                continue;
            }

            if self.dedup == AccountDedup::PerAccount
                && pass.seen_accounts.contains(&network.account_id)
            {
                warn!(
                    zone = %zone,
                    account = network.account_id,
                    appliance = appliance.id,
                    network = network.id,
                    "Account already collected behind another appliance, skipping"
                );
                pass.report.skipped += 1;
                continue;
            }
            accounts_here.insert(network.account_id);

            let targets = match self.targets_for(&network, appliance) {
                Ok(targets) => targets,
                Err(e) => {
                    warn!(zone = %zone, network = network.id, error = %e, "Failed to resolve usage targets");
                    pass.report.failed += 1;
                    continue;
                }
            };
            if targets.is_empty() {
                continue;
            }

            let report = match self.query(zone, appliance, &mut pass.answers).await {
                Some(report) => report,
                None => {
                    pass.report.failed += targets.len();
                    continue;
                }
            };

            for target in &targets {
                match self.reconcile_target(target, &report) {
                    Ok(_) => pass.report.completed += 1,
                    Err(e) => {
                        warn!(
                            zone = %zone,
                            network = target.key.network_id,
                            appliance = appliance.id,
                            error = %e,
                            "Failed to update usage row"
                        );
                        pass.report.failed += 1;
                    }
                }
            }
        }
        pass.seen_accounts.extend(accounts_here);
    }

    /// Sends at most one usage query per appliance per pass.
    async fn query(
        &self,
        zone: &str,
        appliance: &Appliance,
        answers: &mut HashMap<ApplianceId, Option<Arc<UsageReport>>>,
    ) -> Option<Arc<UsageReport>> {
        if let Some(cached) = answers.get(&appliance.id) {
            return cached.clone();
        }

        let fetched = match self
            .drivers
            .send_checked(zone, appliance, &Command::UsageQuery)
            .await
        {
            Ok(answer) => match answer.usage {
                Some(report) => Some(Arc::new(report)),
                None => {
                    warn!(zone = %zone, appliance = appliance.id, "Usage answer carried no counters");
                    None
                }
            },
            Err(e) => {
                warn!(zone = %zone, appliance = appliance.id, error = %e, "Usage query failed, skipping appliance this tick");
                None
            }
        };
        answers.insert(appliance.id, fetched.clone());
        fetched
    }

    /// Rows that need counters for `network` on `appliance`.
    fn targets_for(
        &self,
        network: &GuestNetwork,
        appliance: &Appliance,
    ) -> OrchResult<Vec<UsageTarget>> {
        let key = |public_ip: Option<IpAddr>| UsageKey {
            account_id: network.account_id,
            zone_id: network.zone_id,
            network_id: network.id,
            public_ip,
            appliance_id: appliance.id,
        };
        let catalog = &self.stores.catalog;
        let mut targets = Vec::new();
        let mut seen = HashSet::new();

        match appliance.kind() {
            ApplianceKind::Firewall => {
                if network.shared_source_nat {
                    targets.push(UsageTarget {
                        key: key(None),
                        source: CounterSource::GuestVlan(network.vlan_tag),
                    });
                } else if let Some(ip) = catalog.source_nat_ip(network.id)? {
                    seen.insert(ip.address);
                    targets.push(UsageTarget {
                        key: key(Some(ip.address)),
                        source: CounterSource::Ip(ip.address),
                    });
                }

                let rule_ips = catalog
                    .static_nat_ips(network.id)?
                    .into_iter()
                    .chain(catalog.port_forwarding_ips(network.id)?);
                for ip in rule_ips {
                    if seen.insert(ip.address) {
                        targets.push(UsageTarget {
                            key: key(Some(ip.address)),
                            source: CounterSource::Ip(ip.address),
                        });
                    }
                }
            }
            ApplianceKind::LoadBalancer => {
                for ip in catalog.load_balancer_ips(network.id)? {
                    if !seen.insert(ip.address) {
                        continue;
                    }
                    if let Some(source) = self.balancer_source(network, appliance, ip.address)? {
                        targets.push(UsageTarget {
                            key: key(Some(ip.address)),
                            source,
                        });
                    }
                }
            }
        }
        Ok(targets)
    }

    fn balancer_source(
        &self,
        network: &GuestNetwork,
        appliance: &Appliance,
        public_ip: IpAddr,
    ) -> OrchResult<Option<CounterSource>> {
        if !appliance.is_inline() {
            return Ok(Some(CounterSource::Ip(public_ip)));
        }
        match self.stores.catalog.inline_nic_ip(network.id, public_ip)? {
            Some(internal) => Ok(Some(CounterSource::InlineNic(internal))),
            None => {
                warn!(
                    network = network.id,
                    appliance = appliance.id,
                    public_ip = %public_ip,
                    "No NIC mapping for inline balancer address, skipping row"
                );
                Ok(None)
            }
        }
    }

    /// Reconciles one row; a key missing from the answer reads as zero.
    fn reconcile_target(
        &self,
        target: &UsageTarget,
        report: &UsageReport,
    ) -> OrchResult<UsageStatsRow> {
        let reading = target.source.read(report).unwrap_or_else(|| {
            info!(
                network = target.key.network_id,
                appliance = target.key.appliance_id,
                source = ?target.source,
                "No counters reported, reading as zero"
            );
            ByteCounters::default()
        });

        let now = Utc::now();
        self.stores.usage.update_row(&target.key, &mut |row: &mut UsageStatsRow| {
            if apply_reading(row, reading, now) {
                info!(
                    network = row.key.network_id,
                    appliance = row.key.appliance_id,
                    public_ip = ?row.key.public_ip,
                    "Counter reset detected, rolled previous period into totals"
                );
            }
            Ok(())
        })
    }

    /// Refreshes the usage row behind one rule's source IP.
    ///
    /// Returns `None` when no appliance serves the rule.
    #[instrument(skip(self))]
    pub async fn update_usage_for_rule(&self, rule_id: RuleId) -> OrchResult<Option<UsageStatsRow>> {
        let catalog = &self.stores.catalog;
        let rule = catalog.rule(rule_id)?.ok_or_else(|| {
            OrchError::invalid_parameter("rule_id", format!("unknown rule {}", rule_id))
        })?;
        let ip = catalog.public_ip(rule.source_ip_id())?.ok_or_else(|| {
            OrchError::invalid_parameter(
                "source_ip_id",
                format!("unknown public IP {}", rule.source_ip_id()),
            )
        })?;
        let network_id = match ip.network_id {
            Some(network_id) => network_id,
            None => {
                debug!(rule = rule_id, "Source IP is not associated with a network");
                return Ok(None);
            }
        };
        let network = self.stores.require_network(network_id)?;

        let kind = rule.kind().appliance_kind();
        let appliance = match self.stores.mappings.find_mapping(network_id, kind)? {
            Some(mapping) => self.stores.appliances.get_appliance(mapping.appliance_id)?,
            None => None,
        };
        let appliance = match appliance {
            Some(appliance) => appliance,
            None => {
                debug!(rule = rule_id, network = network_id, "No appliance assigned, nothing to refresh");
                return Ok(None);
            }
        };

        let zone = self.stores.zone_label(network.zone_id);
        let answer = self
            .drivers
            .send_checked(&zone, &appliance, &Command::UsageQuery)
            .await?;
        let report = answer.usage.ok_or_else(|| {
            OrchError::unavailable(
                zone.clone(),
                Some(appliance.id),
                "usage answer carried no counters",
            )
        })?;

        let source = match kind {
            ApplianceKind::LoadBalancer => {
                match self.balancer_source(&network, &appliance, ip.address)? {
                    Some(source) => source,
                    None => return Ok(None),
                }
            }
            ApplianceKind::Firewall => CounterSource::Ip(ip.address),
        };
        let target = UsageTarget {
            key: UsageKey {
                account_id: network.account_id,
                zone_id: network.zone_id,
                network_id,
                public_ip: Some(ip.address),
                appliance_id: appliance.id,
            },
            source,
        };
        self.reconcile_target(&target, &report).map(Some)
    }
}

#[async_trait]
impl PeriodicTask for UsageCollector {
    fn name(&self) -> &str {
        "usage-collector"
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    async fn run_once(&self) -> TaskResult<TickReport> {
        Ok(self.collect_all_zones().await)
    }
}
