//! Bridge configuration.
//!
//! The core consumes a resolved [`BridgeConfig`] value and never reads files or
//! environment itself. [`BridgeConfig::from_yaml_str`] exists for front ends
//! that keep their settings in YAML:
//!
//! ```rust
//! use motionbridge::config::{BridgeConfig, RobotTransportKind};
//!
//! let config = BridgeConfig::from_yaml_str(
//!     r#"
//! axis_count: 6
//! robot:
//!   address: "10.0.0.5:49152"
//!   transport: udp
//! governor:
//!   tick_interval_ms: 4
//! "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.robot.transport, RobotTransportKind::Udp);
//! assert_eq!(config.governor.tick_interval().as_millis(), 4);
//! assert_eq!(config.animation.address, "127.0.0.1:17344");
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::{BridgeError, Result};

/// Default command port of the animation tool.
pub const DEFAULT_ANIMATION_ADDRESS: &str = "127.0.0.1:17344";

/// Default address of the robot controller's motion channel.
pub const DEFAULT_ROBOT_ADDRESS: &str = "127.0.0.1:49152";

/// Default control period of the robot controller.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 12;

/// Complete configuration of one bridge instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Degrees of freedom of the configured robot
    pub axis_count: usize,

    /// Command channel of the animation tool
    pub animation: AnimationLinkConfig,

    /// Motion channel of the robot controller
    pub robot: RobotLinkConfig,

    /// Pacing of frames towards the robot
    pub governor: GovernorConfig,

    /// Send an acknowledgement line to the animation tool for each telemetry packet
    pub echo_telemetry: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            axis_count: 6,
            animation: AnimationLinkConfig::default(),
            robot: RobotLinkConfig::default(),
            governor: GovernorConfig::default(),
            echo_telemetry: false,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BridgeConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| BridgeError::config(format!("YAML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to YAML, e.g. to write out a starter file.
    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| BridgeError::config(format!("YAML serialize error: {}", e)))
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.axis_count == 0 || self.axis_count > usize::from(u16::MAX) {
            return Err(BridgeError::config(format!(
                "axis_count must be between 1 and {}, got {}",
                u16::MAX,
                self.axis_count
            )));
        }
        if self.governor.tick_interval_ms == 0 {
            return Err(BridgeError::config("governor.tick_interval_ms must be positive"));
        }
        if self.animation.max_line_length < 16 {
            return Err(BridgeError::config("animation.max_line_length must be at least 16"));
        }
        if self.animation.keepalive_ms == Some(0) {
            return Err(BridgeError::config("animation.keepalive_ms must be positive"));
        }
        validate_address("animation.address", &self.animation.address)?;
        validate_address("robot.address", &self.robot.address)?;
        self.animation.link.validate("animation")?;
        self.robot.link.validate("robot")?;
        let liveness = [("animation", &self.animation.liveness), ("robot", &self.robot.liveness)];
        for (link, liveness) in liveness {
            if let Some(liveness) = liveness {
                liveness.validate(link)?;
            }
        }
        self.robot.bind_addr()?;
        Ok(())
    }
}

/// Require `host:port` with a non-empty host and a 16-bit port.
///
/// Host names are resolved at connect time, so only the shape is checked here.
fn validate_address(field: &str, address: &str) -> Result<()> {
    let shape = address.rsplit_once(':').and_then(|(host, port)| {
        let host = host.trim();
        let bracketed = host.starts_with('[') == host.ends_with(']');
        (!host.is_empty() && bracketed && !host.contains(char::is_whitespace)).then_some(port)
    });
    match shape.map(str::parse::<u16>) {
        Some(Ok(_)) => Ok(()),
        _ => Err(BridgeError::config(format!("{field} '{address}' must have the form host:port"))),
    }
}

/// Settings shared by both links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Upper bound on a single `receive`
    pub read_timeout_ms: u64,

    /// Upper bound on a single connect attempt
    pub connect_timeout_ms: u64,

    /// Reconnect pacing
    pub backoff: BackoffConfig,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self { read_timeout_ms: 250, connect_timeout_ms: 2_000, backoff: BackoffConfig::default() }
    }
}

impl LinkSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn validate(&self, link: &str) -> Result<()> {
        if self.read_timeout_ms == 0 {
            return Err(BridgeError::config(format!("{link}.read_timeout_ms must be positive")));
        }
        if self.connect_timeout_ms == 0 {
            return Err(BridgeError::config(format!("{link}.connect_timeout_ms must be positive")));
        }
        self.backoff.validate(link)
    }
}

/// Reconnect backoff: `min(max, initial * multiplier^(n-1))`, then ± jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction (0.0-1.0) of the delay to randomize
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial_ms: 100, max_ms: 5_000, multiplier: 2.0, jitter: 0.2 }
    }
}

impl BackoffConfig {
    fn validate(&self, link: &str) -> Result<()> {
        if self.initial_ms == 0 || self.max_ms < self.initial_ms {
            return Err(BridgeError::config(format!(
                "{link}.backoff requires 0 < initial_ms <= max_ms (got {} / {})",
                self.initial_ms, self.max_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(BridgeError::config(format!("{link}.backoff.multiplier must be >= 1.0")));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(BridgeError::config(format!("{link}.backoff.jitter must be within 0.0-1.0")));
        }
        Ok(())
    }
}

/// Silence thresholds for a link that is expected to be chatty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivenessConfig {
    /// Silence before `Connected` becomes `Degraded`
    pub degraded_after_ms: u64,
    /// Silence before the link is dropped and reconnected
    pub disconnect_after_ms: u64,
}

impl LivenessConfig {
    pub fn degraded_after(&self) -> Duration {
        Duration::from_millis(self.degraded_after_ms)
    }

    pub fn disconnect_after(&self) -> Duration {
        Duration::from_millis(self.disconnect_after_ms)
    }

    fn validate(&self, link: &str) -> Result<()> {
        if self.degraded_after_ms == 0 || self.disconnect_after_ms <= self.degraded_after_ms {
            return Err(BridgeError::config(format!(
                "{link}.liveness requires 0 < degraded_after_ms < disconnect_after_ms"
            )));
        }
        Ok(())
    }
}

/// Animation-tool command channel (always TCP, text lines).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationLinkConfig {
    pub address: String,

    /// Longest accepted command line in bytes
    pub max_line_length: usize,

    /// Recorded as the source of every decoded frame
    pub source_id: String,

    /// Silence thresholds; the animation tool may legitimately stay quiet
    pub liveness: Option<LivenessConfig>,

    /// Idle time after which a comment line is written so the peer and any
    /// middlebox see the connection is alive
    pub keepalive_ms: Option<u64>,

    #[serde(flatten)]
    pub link: LinkSettings,
}

impl Default for AnimationLinkConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ANIMATION_ADDRESS.to_string(),
            max_line_length: 4096,
            source_id: "animation".to_string(),
            liveness: None,
            keepalive_ms: None,
            link: LinkSettings::default(),
        }
    }
}

impl AnimationLinkConfig {
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_ms.map(Duration::from_millis)
    }
}

/// Transport used towards the robot controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotTransportKind {
    #[default]
    Udp,
    Tcp,
}

/// Robot controller motion channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotLinkConfig {
    pub address: String,

    pub transport: RobotTransportKind,

    /// Local address for the datagram socket
    pub bind_address: String,

    /// Silence thresholds; telemetry is expected every control cycle
    pub liveness: Option<LivenessConfig>,

    #[serde(flatten)]
    pub link: LinkSettings,
}

impl Default for RobotLinkConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ROBOT_ADDRESS.to_string(),
            transport: RobotTransportKind::Udp,
            bind_address: "0.0.0.0:0".to_string(),
            liveness: Some(LivenessConfig { degraded_after_ms: 250, disconnect_after_ms: 2_000 }),
            link: LinkSettings::default(),
        }
    }
}

impl RobotLinkConfig {
    /// Parsed local bind address for the datagram transport.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_address.parse().map_err(|e| {
            BridgeError::config(format!("robot.bind_address '{}': {}", self.bind_address, e))
        })
    }
}

/// What the governor does on a tick with no new frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Repeat the last frame
    #[default]
    Hold,
    /// Send nothing
    Skip,
}

/// Pacing towards the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernorConfig {
    /// Robot control period
    pub tick_interval_ms: u64,
    pub idle_policy: IdlePolicy,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self { tick_interval_ms: DEFAULT_TICK_INTERVAL_MS, idle_policy: IdlePolicy::Hold }
    }
}

impl GovernorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
