//! extnet - control plane for shared external network appliances
//!
//! Guest networks are placed on externally managed firewall and
//! load-balancer appliances. The crate keeps the inventory of those
//! appliances, decides which one serves each network, drives network
//! implement/shutdown and rule pushes over a command/answer transport, and
//! periodically turns raw appliance byte counters into monotonic usage
//! totals.
//!
//! # Architecture
//!
//! ```text
//! [ControlPlane] ──> [ApplianceRegistry]   inventory, capacity, state
//!       │       ──> [AllocationPolicy]    first-fit placement
//!       │       ──> [NetworkOrchestrator] IpAssoc under "device-map-mutation"
//!       │       ──> [RuleApplier]         one command per rule kind
//!       │       ──> [UsageCollector]      per-zone counter reconciliation
//!       ↓
//! [DriverSet] ──> vendor [ApplianceDriver] ──> appliance agent
//! ```
//!
//! # Key Components
//!
//! - [`control_plane::ControlPlane`]: Wires every component over one set of stores
//! - [`daemon::ExtnetDaemon`]: Runs periodic tasks such as usage collection
//! - [`store`]: Persistence seams and the in-memory implementation
//! - [`transport`]: Commands, answers and the bounded-timeout send path
//!
//! [`ControlPlane`]: control_plane::ControlPlane
//! [`ApplianceRegistry`]: registry::ApplianceRegistry
//! [`AllocationPolicy`]: allocation::AllocationPolicy
//! [`NetworkOrchestrator`]: lifecycle::NetworkOrchestrator
//! [`RuleApplier`]: rules::RuleApplier
//! [`UsageCollector`]: usage::UsageCollector
//! [`DriverSet`]: transport::DriverSet
//! [`ApplianceDriver`]: transport::ApplianceDriver

pub mod allocation;
pub mod audit;
pub mod config;
pub mod control_plane;
pub mod daemon;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod rules;
pub mod sim;
pub mod store;
pub mod transport;
pub mod types;
pub mod usage;

pub use config::Config;
pub use control_plane::ControlPlane;
pub use daemon::{DaemonHandle, ExtnetDaemon};
pub use error::{OrchError, OrchResult};
pub use lifecycle::DEVICE_MAP_LOCK;
pub use rules::ApplyOutcome;
