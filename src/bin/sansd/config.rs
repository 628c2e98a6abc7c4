// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implements the forwarder configuration file.

use std::fmt::{self, Write};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ipnetwork::IpNetwork;
use log::Level::Debug;
use log::{debug, log_enabled};
use paste::paste;
use serde::{de, Deserialize};

use sans::forward::validator::{self, Blocklist, Validator};
use sans::forward::{self, Transport, Upstream};
use sans::listener::{TimeoutPolicy, Upstreams};
use sans::route::DEFAULT_ROUTE_TABLE_SIZE;

use crate::args::RunArgs;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION LOADING                                              //
////////////////////////////////////////////////////////////////////////

/// Loads the configuration from the file given by `path`.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let raw_config = fs::read(path.as_ref()).context("failed to read the configuration file")?;
    let config: Config =
        toml::from_slice(&raw_config).context("failed to parse the configuration file")?;
    config.check()?;
    log_config_summary(&config);
    Ok(config)
}

/// Loads the configuration from the parsed command line arguments
/// given by `args`.
pub fn load_from_args(args: RunArgs) -> Result<Config> {
    let primary = args
        .upstream
        .ok_or_else(|| anyhow!("no upstream server was given"))?;
    let config = Config {
        bind: args.bind.unwrap_or_else(default_bind),
        forwarding: ForwardingConfig::default(),
        upstreams: UpstreamsConfig {
            primary: primary.into(),
            secondary: args.secondary.map(Into::into),
        },
        probe: args.probe.map(|address| ProbeConfig {
            address,
            route_table_size: default_route_table_size(),
        }),
        validation: ValidationConfig::default(),
    };
    log_config_summary(&config);
    Ok(config)
}

/// Summarizes the configuration in the log, if the debug log level is
/// enabled.
fn log_config_summary(config: &Config) {
    if !log_enabled!(Debug) {
        // Don't compute the message if it will never be printed.
        return;
    }

    let mut message = format!(
        "Configuration loaded:\n\
         Bind address:   {}\n\
         Primary:        {}\n\
         Secondary:      ",
        config.bind,
        Upstream::from(config.upstreams.primary),
    );
    match config.upstreams.secondary {
        Some(secondary) => write!(message, "{}", Upstream::from(secondary)).unwrap(),
        None => message.push_str("none"),
    }
    message.push_str("\nProbe:          ");
    match config.probe {
        Some(ref probe) => write!(
            message,
            "{} (remembering {} names)",
            probe.address, probe.route_table_size,
        )
        .unwrap(),
        None => message.push_str("disabled"),
    }
    write!(
        message,
        "\nTimeout:        {} ms ({})\n\
         Max pending:    {}\n\
         Max answers:    {}\n\
         Blocklist:      {} entries",
        config.forwarding.timeout_ms,
        config.forwarding.timeout_policy,
        config.forwarding.max_pending,
        config.validation.max_answers,
        config.validation.blocklist.len(),
    )
    .unwrap();
    debug!("{}", message);
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION FILE STRUCTURE                                       //
////////////////////////////////////////////////////////////////////////

/// The complete configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    pub upstreams: UpstreamsConfig,
    pub probe: Option<ProbeConfig>,
    #[serde(default)]
    pub validation: ValidationConfig,
}

const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const DEFAULT_BIND_PORT: u16 = 53;

fn default_bind() -> SocketAddr {
    SocketAddr::new(DEFAULT_BIND_IP, DEFAULT_BIND_PORT)
}

impl Config {
    /// Rejects values that deserialize fine but cannot be used.
    fn check(&self) -> Result<()> {
        if self.forwarding.timeout_ms == 0 {
            Err(anyhow!("forwarding.timeout_ms must be positive"))
        } else if self.forwarding.sweep_interval_ms == 0 {
            Err(anyhow!("forwarding.sweep_interval_ms must be positive"))
        } else if self.forwarding.max_pending == 0 {
            Err(anyhow!("forwarding.max_pending must be positive"))
        } else if self.probe.as_ref().map_or(false, |p| p.route_table_size == 0) {
            Err(anyhow!("probe.route_table_size must be positive"))
        } else {
            Ok(())
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: FORWARDING                                  //
////////////////////////////////////////////////////////////////////////

/// How queries are forwarded.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardingConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_true")]
    pub retry_secondary: bool,
    #[serde(default = "default_timeout_policy")]
    pub timeout_policy: ConfigTimeoutPolicy,
    #[serde(default)]
    pub case_randomization: bool,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_sweep_interval_ms() -> u64 {
    250
}

fn default_max_pending() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_timeout_policy() -> ConfigTimeoutPolicy {
    ConfigTimeoutPolicy::ServFail
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_pending: default_max_pending(),
            retry_secondary: default_true(),
            timeout_policy: default_timeout_policy(),
            case_randomization: false,
        }
    }
}

impl ForwardingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl From<&ForwardingConfig> for forward::Config {
    fn from(toml_config: &ForwardingConfig) -> Self {
        Self {
            timeout: Duration::from_millis(toml_config.timeout_ms),
            max_pending: toml_config.max_pending,
            case_randomization: toml_config.case_randomization,
            retry_secondary: toml_config.retry_secondary,
        }
    }
}

/// A deserializable wrapper over the [`sans::listener::TimeoutPolicy`]
/// type.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum ConfigTimeoutPolicy {
    #[serde(rename = "servfail")]
    ServFail,
    #[serde(rename = "silent")]
    Silent,
}

impl fmt::Display for ConfigTimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ServFail => f.write_str("SERVFAIL on timeout"),
            Self::Silent => f.write_str("silent on timeout"),
        }
    }
}

impl From<ConfigTimeoutPolicy> for TimeoutPolicy {
    fn from(config_policy: ConfigTimeoutPolicy) -> Self {
        match config_policy {
            ConfigTimeoutPolicy::ServFail => Self::ServFail,
            ConfigTimeoutPolicy::Silent => Self::Silent,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: UPSTREAMS                                   //
////////////////////////////////////////////////////////////////////////

/// The upstream servers.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamsConfig {
    pub primary: UpstreamConfig,
    pub secondary: Option<UpstreamConfig>,
}

impl From<&UpstreamsConfig> for Upstreams {
    fn from(toml_config: &UpstreamsConfig) -> Self {
        Self {
            primary: toml_config.primary.into(),
            secondary: toml_config.secondary.map(Into::into),
        }
    }
}

/// A single upstream server.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub address: SocketAddr,
    #[serde(default = "default_transport")]
    pub transport: ConfigTransport,
}

fn default_transport() -> ConfigTransport {
    ConfigTransport::Udp
}

impl From<UpstreamConfig> for Upstream {
    fn from(toml_config: UpstreamConfig) -> Self {
        let transport = match toml_config.transport {
            ConfigTransport::Udp => Transport::Udp,
            ConfigTransport::Tcp => Transport::Tcp,
        };
        Self {
            address: toml_config.address,
            transport,
        }
    }
}

impl From<Upstream> for UpstreamConfig {
    fn from(upstream: Upstream) -> Self {
        let transport = match upstream.transport {
            Transport::Udp => ConfigTransport::Udp,
            Transport::Tcp => ConfigTransport::Tcp,
        };
        Self {
            address: upstream.address,
            transport,
        }
    }
}

/// A deserializable wrapper over the [`sans::forward::Transport`]
/// type.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum ConfigTransport {
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: PROBE                                       //
////////////////////////////////////////////////////////////////////////

/// Pollution probing. Probes are always sent over UDP.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    pub address: SocketAddr,
    #[serde(default = "default_route_table_size")]
    pub route_table_size: usize,
}

fn default_route_table_size() -> usize {
    DEFAULT_ROUTE_TABLE_SIZE
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: VALIDATION                                  //
////////////////////////////////////////////////////////////////////////

/// Extra checks applied to upstream responses.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    #[serde(default = "default_max_answers")]
    pub max_answers: usize,
    #[serde(default)]
    pub blocklist: Vec<ConfigNetwork>,
}

fn default_max_answers() -> usize {
    validator::DEFAULT_MAX_ANSWERS
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_answers: default_max_answers(),
            blocklist: Vec::new(),
        }
    }
}

impl From<&ValidationConfig> for Validator {
    fn from(toml_config: &ValidationConfig) -> Self {
        let validator = Self::new(toml_config.max_answers);
        if toml_config.blocklist.is_empty() {
            validator
        } else {
            let blocklist: Blocklist = toml_config.blocklist.iter().map(|entry| entry.0).collect();
            validator.with_blocklist(blocklist)
        }
    }
}

////////////////////////////////////////////////////////////////////////
// WRAPPERS OVER SANS TYPES FOR SERDE                                 //
////////////////////////////////////////////////////////////////////////

/// Generates a deserializable `ConfigX` structure wrapping an `X` type,
/// using the given parsing function.
macro_rules! make_serde_wrapper {
    ($wrapper:ident, $over:ty, $parse:path, $description:literal) => {
        /// A macro-generated deserializable wrapper.
        #[derive(Clone, Copy, Debug)]
        pub struct $wrapper(pub $over);

        impl<'de> Deserialize<'de> for $wrapper {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: de::Deserializer<'de>,
            {
                deserializer.deserialize_str(paste! { [<$wrapper Visitor>] })
            }
        }

        paste! {
            /// A macro-generated [`Visitor`](de::Visitor).
            #[derive(Debug)]
            struct [<$wrapper Visitor>];
        }

        impl<'de> de::Visitor<'de> for paste! { [<$wrapper Visitor>] } {
            type Value = $wrapper;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str($description)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                $parse(value)
                    .map($wrapper)
                    .map_err(|e| E::custom(format!("invalid {}: {}", $description, e)))
            }
        }
    };
}

make_serde_wrapper!(
    ConfigNetwork,
    IpNetwork,
    validator::parse_blocklist_entry,
    "IP address or CIDR range"
);

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use sans::forward::validator::AddressPredicate;

    const FULL_CONFIG: &str = r#"
        bind = "127.0.0.1:5300"

        [forwarding]
        timeout_ms = 1500
        sweep_interval_ms = 100
        max_pending = 16
        retry_secondary = false
        timeout_policy = "silent"
        case_randomization = true

        [upstreams]
        primary = { address = "114.114.114.114:53" }
        secondary = { address = "8.8.4.4:53", transport = "tcp" }

        [probe]
        address = "8.8.8.8:53"

        [validation]
        max_answers = 8
        blocklist = ["243.185.187.39", "46.82.174.68/32", "2001:db8::/32"]
    "#;

    #[test]
    fn full_config_is_parsed() {
        let config: Config = toml::from_str(FULL_CONFIG).unwrap();
        config.check().unwrap();
        assert_eq!(config.bind, "127.0.0.1:5300".parse().unwrap());

        let forwarder_config = forward::Config::from(&config.forwarding);
        assert_eq!(forwarder_config.timeout, Duration::from_millis(1500));
        assert_eq!(forwarder_config.max_pending, 16);
        assert!(!forwarder_config.retry_secondary);
        assert!(forwarder_config.case_randomization);
        assert_eq!(config.forwarding.sweep_interval(), Duration::from_millis(100));
        assert_eq!(
            TimeoutPolicy::from(config.forwarding.timeout_policy),
            TimeoutPolicy::Silent,
        );

        let upstreams = Upstreams::from(&config.upstreams);
        assert_eq!(
            upstreams.primary,
            Upstream::udp("114.114.114.114:53".parse().unwrap()),
        );
        assert_eq!(
            upstreams.secondary,
            Some(Upstream::tcp("8.8.4.4:53".parse().unwrap())),
        );

        let probe = config.probe.unwrap();
        assert_eq!(probe.address, "8.8.8.8:53".parse().unwrap());
        assert_eq!(probe.route_table_size, DEFAULT_ROUTE_TABLE_SIZE);

        assert_eq!(config.validation.max_answers, 8);
        let blocklist: Blocklist = config.validation.blocklist.iter().map(|e| e.0).collect();
        assert!(blocklist.matches("243.185.187.39".parse().unwrap()));
        assert!(blocklist.matches("2001:db8::1".parse().unwrap()));
        assert!(!blocklist.matches("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config =
            toml::from_str("[upstreams]\nprimary = { address = \"192.0.2.1:53\" }").unwrap();
        assert_eq!(config.bind, default_bind());
        assert_eq!(
            forward::Config::from(&config.forwarding),
            forward::Config::default(),
        );
        assert_eq!(config.forwarding.timeout_policy, ConfigTimeoutPolicy::ServFail);
        assert!(!config.forwarding.case_randomization);
        assert!(config.upstreams.secondary.is_none());
        assert!(config.probe.is_none());
        assert_eq!(config.validation.max_answers, validator::DEFAULT_MAX_ANSWERS);
        assert!(config.validation.blocklist.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = toml::from_str(
            "[upstreams]\nprimary = { address = \"192.0.2.1:53\", protocol = \"udp\" }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn invalid_blocklist_entry_is_rejected() {
        let result: Result<Config, _> = toml::from_str(
            "[upstreams]\nprimary = { address = \"192.0.2.1:53\" }\n\
             [validation]\nblocklist = [\"192.0.2.0/33\"]",
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_timeouts_fail_the_check() {
        let config: Config = toml::from_str(
            "[forwarding]\nsweep_interval_ms = 0\n\
             [upstreams]\nprimary = { address = \"192.0.2.1:53\" }",
        )
        .unwrap();
        assert!(config.check().is_err());
    }
}
