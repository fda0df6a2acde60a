use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::push::flow::FlowSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("{name} must be at least {min}")]
    TooSmall { name: &'static str, min: u64 },
    #[error("HEARTBEAT_MIN_MS ({min}) is greater than HEARTBEAT_MAX_MS ({max})")]
    HeartbeatBounds { min: u64, max: u64 },
}

/// Push server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Number of serial lanes the push scheduler runs.
    pub lanes: usize,
    /// Default flow control applied to broadcasts that don't carry their own.
    /// With `PUSH_QPS_LIMIT=0` a broadcast covers the whole table in a single
    /// pass, holding one blocking-pool thread for its duration.
    pub flow: FlowSettings,
    /// Outbound frames a gateway connection may queue before it reports
    /// itself not writable.
    pub write_high_water: usize,
    pub heartbeat: HeartbeatConfig,
    pub net: NetConfig,
    /// Number of finished broadcast reports kept for the HTTP API.
    pub report_history: usize,
}

/// Bounds for the heartbeat interval a client may negotiate.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub min: Duration,
    pub max: Duration,
}

impl HeartbeatConfig {
    /// Clamp a client-requested heartbeat into the configured bounds. Clients
    /// that don't ask for an interval get the maximum.
    pub fn negotiate(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) => Duration::from_millis(ms).clamp(self.min, self.max),
            None => self.max,
        }
    }
}

/// Addresses this node advertises. Empty fields are resolved at runtime by
/// [`crate::net::NetResolver`].
#[derive(Debug, Clone, Default)]
pub struct NetConfig {
    pub local_ip: Option<String>,
    pub public_ip: Option<String>,
    /// Static local → public address mapping for NAT'd hosts.
    pub public_ip_mapping: HashMap<String, String>,
    pub connect_server_register_ip: Option<String>,
    pub gateway_server_register_ip: Option<String>,
    /// Endpoint returning this host's extranet address as plain text.
    pub public_ip_lookup_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4010,
            lanes: 4,
            flow: FlowSettings::default(),
            write_high_water: 256,
            heartbeat: HeartbeatConfig {
                min: Duration::from_secs(10),
                max: Duration::from_secs(180),
            },
            net: NetConfig::default(),
            report_history: 1000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let lanes: usize = parsed_var("PUSH_LANES", defaults.lanes)?;
        if lanes == 0 {
            return Err(ConfigError::TooSmall {
                name: "PUSH_LANES",
                min: 1,
            });
        }
        let write_high_water: usize =
            parsed_var("GATEWAY_WRITE_HIGH_WATER", defaults.write_high_water)?;
        if write_high_water == 0 {
            return Err(ConfigError::TooSmall {
                name: "GATEWAY_WRITE_HIGH_WATER",
                min: 1,
            });
        }

        let min_ms: u64 = parsed_var(
            "HEARTBEAT_MIN_MS",
            defaults.heartbeat.min.as_millis() as u64,
        )?;
        let max_ms: u64 = parsed_var(
            "HEARTBEAT_MAX_MS",
            defaults.heartbeat.max.as_millis() as u64,
        )?;
        if min_ms == 0 {
            return Err(ConfigError::TooSmall {
                name: "HEARTBEAT_MIN_MS",
                min: 1,
            });
        }
        if min_ms > max_ms {
            return Err(ConfigError::HeartbeatBounds {
                min: min_ms,
                max: max_ms,
            });
        }

        let flow = FlowSettings {
            limit: parsed_var("PUSH_QPS_LIMIT", defaults.flow.limit)?,
            max_total: parsed_var("PUSH_MAX_TOTAL", defaults.flow.max_total)?,
            window: Duration::from_millis(parsed_var(
                "PUSH_WINDOW_MS",
                defaults.flow.window.as_millis() as u64,
            )?),
            min_delay: Duration::from_millis(parsed_var(
                "PUSH_MIN_DELAY_MS",
                defaults.flow.min_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parsed_var(
                "PUSH_MAX_DELAY_MS",
                defaults.flow.max_delay.as_millis() as u64,
            )?),
        };
        if flow.min_delay.is_zero() {
            return Err(ConfigError::TooSmall {
                name: "PUSH_MIN_DELAY_MS",
                min: 1,
            });
        }

        Ok(Self {
            port: parsed_var("PORT", defaults.port)?,
            lanes,
            flow,
            write_high_water,
            heartbeat: HeartbeatConfig {
                min: Duration::from_millis(min_ms),
                max: Duration::from_millis(max_ms),
            },
            net: NetConfig {
                local_ip: optional_var("NET_LOCAL_IP"),
                public_ip: optional_var("NET_PUBLIC_IP"),
                public_ip_mapping: parse_mapping(
                    &optional_var("NET_PUBLIC_IP_MAPPING").unwrap_or_default(),
                )?,
                connect_server_register_ip: optional_var("NET_CONNECT_REGISTER_IP"),
                gateway_server_register_ip: optional_var("NET_GATEWAY_REGISTER_IP"),
                public_ip_lookup_url: optional_var("NET_PUBLIC_IP_LOOKUP_URL"),
            },
            report_history: parsed_var("REPORT_HISTORY", defaults.report_history)?,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

/// Parse `local=public,local2=public2`.
fn parse_mapping(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut mapping = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((local, public)) if !local.trim().is_empty() && !public.trim().is_empty() => {
                mapping.insert(local.trim().to_string(), public.trim().to_string());
            }
            _ => {
                return Err(ConfigError::InvalidValue {
                    name: "NET_PUBLIC_IP_MAPPING",
                    value: raw.to_string(),
                })
            }
        }
    }
    Ok(mapping)
}
