//! Appliance drivers and the bounded-timeout send path.

use super::command::{Answer, Command};
use crate::error::{OrchError, OrchResult};
use crate::types::{Appliance, ApplianceConfig, Credentials, TransportHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure below the command/answer level.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("appliance unreachable: {0}")]
    Unreachable(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Vendor capability interface.
///
/// One implementation per appliance brand. The driver owns the wire encoding
/// of [`Command`]s; callers only see the uniform answer.
#[async_trait]
pub trait ApplianceDriver: Send + Sync {
    /// Provider name appliances are registered under.
    fn provider(&self) -> &str;

    /// Validates vendor-specific settings before registration.
    fn configure(&self, config: &ApplianceConfig, credentials: &Credentials) -> OrchResult<()> {
        if credentials.username.trim().is_empty() {
            return Err(OrchError::invalid_parameter(
                "credentials.username",
                "must not be empty",
            ));
        }
        if let Some(field) = config.missing_interface() {
            return Err(OrchError::invalid_parameter(field, "must not be empty"));
        }
        Ok(())
    }

    /// Sends one command and waits for its answer.
    async fn send(&self, appliance: &Appliance, command: &Command)
        -> Result<Answer, TransportError>;
}

/// External registry of agent connections.
#[async_trait]
pub trait HostRegistry: Send + Sync {
    /// Establishes the connection for a newly registered device.
    async fn attach(
        &self,
        identity: &str,
        address: SocketAddr,
        credentials: &Credentials,
    ) -> OrchResult<TransportHandle>;

    /// Releases a connection.
    async fn detach(&self, handle: TransportHandle) -> OrchResult<()>;
}

/// Drivers composed by provider name, sharing one command timeout.
pub struct DriverSet {
    drivers: HashMap<String, Arc<dyn ApplianceDriver>>,
    timeout: Duration,
}

impl DriverSet {
    pub fn new(timeout: Duration) -> Self {
        Self {
            drivers: HashMap::new(),
            timeout,
        }
    }

    /// Adds a driver, replacing any previous one for the same provider.
    pub fn with_driver(mut self, driver: Arc<dyn ApplianceDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn register(&mut self, driver: Arc<dyn ApplianceDriver>) {
        self.drivers.insert(driver.provider().to_string(), driver);
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the driver for `provider`.
    pub fn driver(&self, provider: &str) -> OrchResult<&Arc<dyn ApplianceDriver>> {
        self.drivers.get(provider).ok_or_else(|| {
            OrchError::invalid_parameter("provider_name", format!("no driver for '{}'", provider))
        })
    }

    /// Sends `command` and returns the raw answer, positive or negative.
    ///
    /// Transport failures and timeouts become `ResourceUnavailable`.
    pub async fn send(
        &self,
        zone: &str,
        appliance: &Appliance,
        command: &Command,
    ) -> OrchResult<Answer> {
        let driver = self.driver(&appliance.provider_name)?;
        debug!(
            zone = %zone,
            appliance = appliance.id,
            command = %command,
            "Sending command"
        );

        match tokio::time::timeout(self.timeout, driver.send(appliance, command)).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => {
                warn!(zone = %zone, appliance = appliance.id, command = %command, error = %e, "Command failed");
                Err(OrchError::unavailable(zone, Some(appliance.id), e.to_string()))
            }
            Err(_) => {
                warn!(zone = %zone, appliance = appliance.id, command = %command, "Command timed out");
                Err(OrchError::unavailable(
                    zone,
                    Some(appliance.id),
                    format!("{} timed out after {:?}", command.name(), self.timeout),
                ))
            }
        }
    }

    /// Like [`send`](Self::send), but a negative answer is also an error.
    pub async fn send_checked(
        &self,
        zone: &str,
        appliance: &Appliance,
        command: &Command,
    ) -> OrchResult<Answer> {
        let answer = self.send(zone, appliance, command).await?;
        if !answer.result {
            return Err(OrchError::unavailable(
                zone,
                Some(appliance.id),
                answer.details,
            ));
        }
        Ok(answer)
    }
}
