//! YAML configuration.
//!
//! Example:
//!
//! ```yaml
//! socket:
//!   frame_num: 8192
//!   rx_size: 4096
//! rules:
//!   - protocol: icmp
//!     icmp_type: 0
//!   - protocol: udp
//!     dst_port: 53
//! filter:
//!   max_masks: 16
//! program:
//!   path: /usr/lib/xdping/filter.o
//!   mode: drv
//! ```
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::filter::{
    FilterError, Rule, RuleTable, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, MAX_MASKS, MAX_RULES,
};
use crate::proto::ICMP_ECHO_REPLY;
use crate::socket::{SocketConfig, SocketError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("filter.max_masks {0} must be between 1 and {max}", max = MAX_MASKS)]
    MaskLimit(usize),

    #[error("rule {index}: {reason}")]
    InvalidRule { index: usize, reason: String },

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolName {
    Icmp,
    Tcp,
    Udp,
}

/// An IP protocol given by name or by number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Protocol {
    Number(u8),
    Name(ProtocolName),
}

impl Protocol {
    pub fn number(&self) -> u8 {
        match self {
            Protocol::Number(n) => *n,
            Protocol::Name(ProtocolName::Icmp) => IPPROTO_ICMP,
            Protocol::Name(ProtocolName::Tcp) => IPPROTO_TCP,
            Protocol::Name(ProtocolName::Udp) => IPPROTO_UDP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub protocol: Protocol,
    #[serde(default)]
    pub icmp_type: Option<u8>,
    #[serde(default)]
    pub dst_port: Option<u16>,
}

impl RuleConfig {
    fn to_rule(&self, index: usize) -> Result<Rule, ConfigError> {
        let protocol = self.protocol.number();
        let invalid = |reason: &str| ConfigError::InvalidRule {
            index,
            reason: reason.to_string(),
        };

        if self.icmp_type.is_some() && protocol != IPPROTO_ICMP {
            return Err(invalid("icmp_type needs protocol icmp"));
        }
        if self.dst_port.is_some() && protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
            return Err(invalid("dst_port needs protocol tcp or udp"));
        }

        Ok(Rule {
            protocol,
            icmp_type: self.icmp_type,
            dst_port: self.dst_port,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterLimits {
    pub max_masks: usize,
    pub max_rules: usize,
}

impl Default for FilterLimits {
    fn default() -> FilterLimits {
        FilterLimits {
            max_masks: MAX_MASKS,
            max_rules: MAX_RULES,
        }
    }
}

/// How the XDP program is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// Generic mode, works on any interface
    #[default]
    Skb,
    /// Native driver mode
    Drv,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    /// Object file holding the XDP program
    pub path: PathBuf,
    /// Program to attach; the first program in the object if unset
    #[serde(default)]
    pub prog_name: Option<String>,
    #[serde(default = "default_rule_map")]
    pub rule_map: String,
    #[serde(default = "default_mask_map")]
    pub mask_map: String,
    #[serde(default = "default_xsk_map")]
    pub xsk_map: String,
    #[serde(default)]
    pub mode: AttachMode,
}

fn default_rule_map() -> String {
    "rules".to_string()
}

fn default_mask_map() -> String {
    "masks".to_string()
}

fn default_xsk_map() -> String {
    "xsks_map".to_string()
}

impl ProgramConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> ProgramConfig {
        ProgramConfig {
            path: path.into(),
            prog_name: None,
            rule_map: default_rule_map(),
            mask_map: default_mask_map(),
            xsk_map: default_xsk_map(),
            mode: AttachMode::default(),
        }
    }
}

fn default_rules() -> Vec<RuleConfig> {
    vec![RuleConfig {
        protocol: Protocol::Name(ProtocolName::Icmp),
        icmp_type: Some(ICMP_ECHO_REPLY),
        dst_port: None,
    }]
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub socket: SocketConfig,
    /// Traffic redirected to the socket; ICMP echo replies if unset
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub filter: FilterLimits,
    #[serde(default)]
    pub program: Option<ProgramConfig>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            socket: SocketConfig::default(),
            rules: default_rules(),
            filter: FilterLimits::default(),
            program: None,
        }
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Config::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket.validate()?;
        if self.filter.max_masks == 0 || self.filter.max_masks > MAX_MASKS {
            return Err(ConfigError::MaskLimit(self.filter.max_masks));
        }
        self.rule_table()?;

        Ok(())
    }

    /// Build the rule table described by `rules` and `filter`.
    pub fn rule_table(&self) -> Result<RuleTable, ConfigError> {
        let mut table = RuleTable::new(self.filter.max_masks, self.filter.max_rules);

        for (index, rule) in self.rules.iter().enumerate() {
            table.insert(rule.to_rule(index)?)?;
        }

        Ok(table)
    }
}
