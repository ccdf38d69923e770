//! Connector configuration surfaces.
//!
//! These structs are consumed, not owned: the hosting application resolves
//! them from its declared topology (or any other source) and hands them to
//! the connectors. The serde derives exist so hosts can hydrate them from
//! whatever format their topology resolution uses.

use std::time::Duration;

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Protocol version advertised in the Hello handshake.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Fixed interval slept between reconnection attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for a source connector.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    /// Connector name as declared in the topology.
    pub name: String,
    /// Engine host to connect to.
    pub host: String,
    /// Engine port to connect to.
    pub port: u16,
    /// Shared-secret cookie presented in the handshake.
    pub cookie: String,
    /// Protocol version advertised in the handshake.
    #[serde(default = "default_version")]
    pub version: String,
    /// Name of the hosting program.
    pub program_name: String,
    /// Name of this connector instance.
    pub instance_name: String,
    /// Credit ceiling hint declared in the topology; granted by the engine,
    /// never enforced locally.
    #[serde(default)]
    pub max_credits: u32,
    /// Credit refill hint declared in the topology; granted by the engine,
    /// never enforced locally.
    #[serde(default)]
    pub refill_credits: u32,
    /// Interval slept between reconnection attempts.
    #[serde(default = "default_backoff")]
    pub reconnect_backoff: Duration,
    /// Minimum spacing between record sends; `None` disables pacing.
    #[serde(default)]
    pub send_delay: Option<Duration>,
    /// Largest frame the connection will encode or accept.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

fn default_version() -> String { PROTOCOL_VERSION.to_owned() }

fn default_backoff() -> Duration { DEFAULT_RECONNECT_BACKOFF }

fn default_max_frame_length() -> usize { DEFAULT_MAX_FRAME_LENGTH }

impl SourceConfig {
    /// Build a configuration with default engine knobs.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cookie: impl Into<String>,
        program_name: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            cookie: cookie.into(),
            version: default_version(),
            program_name: program_name.into(),
            instance_name: instance_name.into(),
            max_credits: 0,
            refill_credits: 0,
            reconnect_backoff: default_backoff(),
            send_delay: None,
            max_frame_length: default_max_frame_length(),
        }
    }

    /// Replace the reconnect backoff interval.
    #[must_use]
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Enforce a minimum spacing between record sends.
    #[must_use]
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    /// Replace the maximum frame length.
    #[must_use]
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    /// Record the topology's credit hints.
    #[must_use]
    pub fn with_credit_hints(mut self, max_credits: u32, refill_credits: u32) -> Self {
        self.max_credits = max_credits;
        self.refill_credits = refill_credits;
        self
    }

    /// `host:port` form of the configured target.
    #[must_use]
    pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
}

/// Configuration for a sink connector.
#[derive(Clone, Debug, Deserialize)]
pub struct SinkConfig {
    /// Connector name as declared in the topology.
    pub name: String,
    /// Interface to listen on.
    pub host: String,
    /// Port to listen on; zero picks an ephemeral port.
    pub port: u16,
    /// Shared-secret cookie declared in the topology.
    pub cookie: String,
    /// Largest frame a connection may deliver.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

impl SinkConfig {
    /// Build a configuration with default engine knobs.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cookie: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            cookie: cookie.into(),
            max_frame_length: default_max_frame_length(),
        }
    }

    /// `host:port` form of the configured bind address.
    #[must_use]
    pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
}
