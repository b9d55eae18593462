use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4AddrRange, Ipv6AddrRange};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// Largest CIDR range an agent entry may expand to.
const MAX_CIDR_HOSTS: u128 = 65_536;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// Labels added to every instance that does not define the same key
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Per-agent extra tags, keyed by agent address or host
    #[serde(default)]
    pub mappings: HashMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(default = "default_sink_capacity")]
    pub capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            capacity: default_sink_capacity(),
        }
    }
}

/// What to do with preprocessing steps the pipeline does not know.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessPolicy {
    /// Refuse the item, prototype or rule carrying the step.
    #[default]
    Reject,
    /// Keep the definition and skip the step with a warning.
    Warn,
}

/// One poller instance: a set of agents sharing credentials and templates.
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default)]
    pub community: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub auth_password: String,
    #[serde(default)]
    pub auth_protocol: String,
    #[serde(default)]
    pub priv_password: String,
    #[serde(default)]
    pub priv_protocol: String,
    #[serde(default)]
    pub security_level: String,
    #[serde(default)]
    pub context_name: String,
    /// Compatibility spelling of `security_level`
    #[serde(default)]
    pub sec_level: String,
    /// Compatibility spelling of `username`
    #[serde(default)]
    pub sec_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_max_repetitions")]
    pub max_repetitions: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub template_files: Vec<String>,
    #[serde(default)]
    pub template_file_contents: BTreeMap<String, String>,
    #[serde(default)]
    pub enable_discovery: bool,
    #[serde(default)]
    pub items: Vec<ItemConfig>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub mappings: HashMap<String, BTreeMap<String, String>>,

    #[serde(default)]
    pub disable_up: bool,
    #[serde(default)]
    pub disable_snmp_up: bool,
    #[serde(default = "default_healthcheck_interval", with = "humantime_serde")]
    pub healthcheck_interval: Duration,
    #[serde(default = "default_healthcheck_timeout", with = "humantime_serde")]
    pub healthcheck_timeout: Duration,
    #[serde(default = "default_healthcheck_retries")]
    pub healthcheck_retries: u32,
    #[serde(default = "default_up_interval", with = "humantime_serde")]
    pub up_interval: Duration,

    #[serde(default)]
    pub preprocessing_policy: PreprocessPolicy,
    #[serde(default = "default_true")]
    pub enable_scripts: bool,
    #[serde(default = "default_script_timeout", with = "humantime_serde")]
    pub script_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub discovered_delete_ttl: Duration,
    #[serde(default, with = "humantime_serde")]
    pub discovered_disable_ttl: Duration,
}

/// An inline static item.
#[derive(Debug, Deserialize, Clone)]
pub struct ItemConfig {
    pub key: String,
    pub oid: String,
    #[serde(default)]
    pub name: String,
    /// `float`, `uint` or `string`; numeric-when-parsable when empty
    #[serde(default, rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub units: String,
    /// Items bound to a discovery rule are produced by discovery, not configured here
    #[serde(default)]
    pub discovery_rule: String,
    #[serde(default = "default_item_delay", with = "humantime_serde")]
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Udp4,
    Udp6,
    Tcp,
    Tcp4,
    Tcp6,
}

impl Transport {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "udp" => Some(Transport::Udp),
            "udp4" => Some(Transport::Udp4),
            "udp6" => Some(Transport::Udp6),
            "tcp" => Some(Transport::Tcp),
            "tcp4" => Some(Transport::Tcp4),
            "tcp6" => Some(Transport::Tcp6),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Udp4 => "udp4",
            Transport::Udp6 => "udp6",
            Transport::Tcp => "tcp",
            Transport::Tcp4 => "tcp4",
            Transport::Tcp6 => "tcp6",
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Transport::Udp | Transport::Udp4 | Transport::Udp6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

impl SecurityLevel {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "noauthnopriv" => Some(SecurityLevel::NoAuthNoPriv),
            "authnopriv" => Some(SecurityLevel::AuthNoPriv),
            "authpriv" => Some(SecurityLevel::AuthPriv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Md5,
    Sha,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivProtocol {
    Des,
    Aes,
    Aes192,
    Aes256,
    Aes192C,
    Aes256C,
}

/// Credentials shared by every endpoint of an instance.
#[derive(Debug, Clone)]
pub enum Credentials {
    Community(String),
    Usm {
        username: String,
        level: SecurityLevel,
        auth: Option<(AuthProtocol, String)>,
        privacy: Option<(PrivProtocol, String)>,
        context_name: String,
    },
}

/// One remote agent. The identity is `scheme://host:port`.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub version: SnmpVersion,
    pub credentials: Arc<Credentials>,
    pub timeout: Duration,
    pub retries: u32,
    pub max_repetitions: u32,
}

impl AgentEndpoint {
    pub fn address(&self) -> String {
        format_address(self.transport, &self.host, self.port)
    }
}

fn format_address(transport: Transport, host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("{}://[{}]:{}", transport.scheme(), host, port)
    } else {
        format!("{}://{}:{}", transport.scheme(), host, port)
    }
}

/// Host part of an agent address: scheme, brackets and port removed.
pub fn host_of(agent: &str) -> &str {
    let rest = agent.split_once("://").map(|(_, r)| r).unwrap_or(agent);
    if let Some(stripped) = rest.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or(stripped);
    }
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => rest,
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = expand_env_vars(content);

        let mut config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        for (i, instance) in config.instances.iter_mut().enumerate() {
            instance.inherit(&config.labels, &config.mappings);
            instance
                .validate()
                .with_context(|| format!("Invalid instance #{}", i))?;
        }

        Ok(config)
    }
}

impl InstanceConfig {
    /// Merge global labels and mappings; instance values win.
    fn inherit(
        &mut self,
        labels: &BTreeMap<String, String>,
        mappings: &HashMap<String, BTreeMap<String, String>>,
    ) {
        for (k, v) in labels {
            self.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (agent, tags) in mappings {
            self.mappings.entry(agent.clone()).or_insert_with(|| tags.clone());
        }
    }

    fn effective_security_level(&self) -> &str {
        if self.security_level.is_empty() {
            &self.sec_level
        } else {
            &self.security_level
        }
    }

    fn effective_username(&self) -> &str {
        if self.username.is_empty() {
            &self.sec_name
        } else {
            &self.username
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }
        if self.template_files.is_empty()
            && self.template_file_contents.is_empty()
            && self.items.is_empty()
        {
            return Err(ConfigError::NothingToCollect);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        self.credentials()?;
        self.endpoints()?;
        Ok(())
    }

    pub fn snmp_version(&self) -> Result<SnmpVersion, ConfigError> {
        match self.version {
            1 => Ok(SnmpVersion::V1),
            2 => Ok(SnmpVersion::V2c),
            3 => Ok(SnmpVersion::V3),
            v => Err(ConfigError::UnsupportedVersion(v)),
        }
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        match self.snmp_version()? {
            SnmpVersion::V1 | SnmpVersion::V2c => {
                if self.community.is_empty() {
                    return Err(ConfigError::MissingCommunity);
                }
                Ok(Credentials::Community(self.community.clone()))
            }
            SnmpVersion::V3 => {
                let username = self.effective_username();
                if username.is_empty() {
                    return Err(ConfigError::MissingUsername);
                }
                let level_str = self.effective_security_level();
                let level = SecurityLevel::parse(level_str)
                    .ok_or_else(|| ConfigError::InvalidSecurityLevel(level_str.to_string()))?;

                let auth = if level == SecurityLevel::NoAuthNoPriv {
                    None
                } else {
                    if self.auth_password.is_empty() {
                        return Err(ConfigError::MissingAuthPassword(level_str.to_string()));
                    }
                    Some((parse_auth_protocol(&self.auth_protocol)?, self.auth_password.clone()))
                };

                let privacy = if level == SecurityLevel::AuthPriv {
                    if self.priv_password.is_empty() {
                        return Err(ConfigError::MissingPrivPassword);
                    }
                    Some((parse_priv_protocol(&self.priv_protocol)?, self.priv_password.clone()))
                } else {
                    None
                };

                Ok(Credentials::Usm {
                    username: username.to_string(),
                    level,
                    auth,
                    privacy,
                    context_name: self.context_name.clone(),
                })
            }
        }
    }

    /// Expand the agent list into endpoints, one per address.
    pub fn endpoints(&self) -> Result<Vec<AgentEndpoint>, ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }
        let version = self.snmp_version()?;
        let credentials = Arc::new(self.credentials()?);

        let mut endpoints = Vec::new();
        for agent in &self.agents {
            for (transport, host, port) in parse_agent(agent, self.port)? {
                endpoints.push(AgentEndpoint {
                    transport,
                    host,
                    port,
                    version,
                    credentials: credentials.clone(),
                    timeout: self.timeout,
                    retries: self.retries,
                    max_repetitions: self.max_repetitions.max(1),
                });
            }
        }
        Ok(endpoints)
    }

    pub fn up_enabled(&self) -> bool {
        !(self.disable_up || self.disable_snmp_up)
    }
}

fn parse_auth_protocol(s: &str) -> Result<AuthProtocol, ConfigError> {
    match s.to_ascii_uppercase().as_str() {
        "" | "MD5" => Ok(AuthProtocol::Md5),
        "SHA" => Ok(AuthProtocol::Sha),
        "SHA224" => Ok(AuthProtocol::Sha224),
        "SHA256" => Ok(AuthProtocol::Sha256),
        "SHA384" => Ok(AuthProtocol::Sha384),
        "SHA512" => Ok(AuthProtocol::Sha512),
        _ => Err(ConfigError::InvalidAuthProtocol(s.to_string())),
    }
}

fn parse_priv_protocol(s: &str) -> Result<PrivProtocol, ConfigError> {
    match s.to_ascii_uppercase().as_str() {
        "" | "DES" => Ok(PrivProtocol::Des),
        "AES" => Ok(PrivProtocol::Aes),
        "AES192" => Ok(PrivProtocol::Aes192),
        "AES256" => Ok(PrivProtocol::Aes256),
        "AES192C" => Ok(PrivProtocol::Aes192C),
        "AES256C" => Ok(PrivProtocol::Aes256C),
        _ => Err(ConfigError::InvalidPrivProtocol(s.to_string())),
    }
}

/// Parse `[scheme://]host[:port]`, where host may be a CIDR range.
fn parse_agent(agent: &str, default_port: u16) -> Result<Vec<(Transport, String, u16)>, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAgent {
        agent: agent.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = agent.trim();
    let (transport, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            if scheme.is_empty() || rest.is_empty() {
                return Err(invalid("empty scheme or address"));
            }
            let transport = Transport::parse(scheme)
                .ok_or_else(|| ConfigError::UnsupportedScheme(scheme.to_ascii_lowercase()))?;
            (transport, rest)
        }
        None => (Transport::Udp, trimmed),
    };
    if rest.is_empty() {
        return Err(invalid("empty address"));
    }

    let (host, port) = split_host_port(rest, default_port).map_err(|r| invalid(&r))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }

    if host.contains('/') {
        let net: IpNet = host.parse().map_err(|_| invalid("malformed CIDR range"))?;
        return expand_cidr(&net)
            .map_err(|r| invalid(&r))
            .map(|ips| ips.into_iter().map(|ip| (transport, ip.to_string(), port)).collect());
    }

    Ok(vec![(transport, host, port)])
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16), String> {
    if let Some(stripped) = addr.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 literal".to_string())?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), parse_port(port)?)),
            None if tail.is_empty() => Ok((host.to_string(), default_port)),
            None => Err(format!("unexpected trailing '{}'", tail)),
        };
    }

    // A bare IPv6 address (or IPv6 CIDR) carries no port.
    if addr.matches(':').count() > 1 {
        return Ok((addr.to_string(), default_port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((addr.to_string(), default_port)),
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>().map_err(|_| format!("invalid port '{}'", s))
}

fn expand_cidr(net: &IpNet) -> Result<Vec<IpAddr>, String> {
    let host_bits = match net {
        IpNet::V4(n) => 32 - n.prefix_len() as u32,
        IpNet::V6(n) => 128 - n.prefix_len() as u32,
    };
    if host_bits >= 128 || (1u128 << host_bits) > MAX_CIDR_HOSTS {
        return Err(format!("CIDR range {} is too large", net));
    }

    let ips = match net {
        IpNet::V4(n) => Ipv4AddrRange::new(n.network(), n.broadcast())
            .map(IpAddr::V4)
            .collect(),
        IpNet::V6(n) => Ipv6AddrRange::new(n.network(), n.broadcast())
            .map(IpAddr::V6)
            .collect(),
    };
    Ok(ips)
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> String {
    static ENV_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ENV_RE.get_or_init(|| {
        regex::Regex::new(r"\$\{([^}]+)\}").unwrap_or_else(|_| unreachable!("static pattern"))
    });
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
fn default_flush_interval() -> Duration { Duration::from_secs(1) }
fn default_sink_capacity() -> usize { 100_000 }
fn default_version() -> u8 { 2 }
fn default_port() -> u16 { 161 }
fn default_timeout() -> Duration { Duration::from_secs(5) }
fn default_retries() -> u32 { 1 }
fn default_max_repetitions() -> u32 { 10 }
fn default_batch_size() -> usize { 60 }
fn default_healthcheck_interval() -> Duration { Duration::from_secs(30) }
fn default_healthcheck_timeout() -> Duration { Duration::from_secs(5) }
fn default_healthcheck_retries() -> u32 { 3 }
fn default_up_interval() -> Duration { Duration::from_secs(30) }
fn default_script_timeout() -> Duration { Duration::from_secs(5) }
fn default_item_delay() -> Duration { Duration::from_secs(60) }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn instance(extra: &str) -> InstanceConfig {
        let doc = format!(
            "[[instances]]\nagents = [\"10.0.0.1\"]\ncommunity = \"public\"\n{}\n\
             [[instances.items]]\nkey = \"sysUpTime\"\noid = \"1.3.6.1.2.1.1.3.0\"\n",
            extra
        );
        let mut cfg: Config = toml::from_str(&doc).unwrap();
        cfg.instances.remove(0)
    }

    fn addresses(agents: &[&str]) -> Vec<String> {
        let mut inst = instance("");
        inst.agents = agents.iter().map(|s| s.to_string()).collect();
        inst.endpoints().unwrap().iter().map(|e| e.address()).collect()
    }

    #[test]
    fn defaults_applied() {
        let inst = instance("");
        assert_eq!(inst.version, 2);
        assert_eq!(inst.port, 161);
        assert_eq!(inst.timeout, Duration::from_secs(5));
        assert_eq!(inst.retries, 1);
        assert_eq!(inst.max_repetitions, 10);
        assert_eq!(inst.batch_size, 60);
        assert_eq!(inst.healthcheck_retries, 3);
        assert_eq!(inst.up_interval, Duration::from_secs(30));
        assert_eq!(inst.preprocessing_policy, PreprocessPolicy::Reject);
        assert_eq!(inst.items[0].delay, Duration::from_secs(60));
        assert!(inst.validate().is_ok());
    }

    #[test]
    fn agent_forms() {
        assert_eq!(
            addresses(&["10.0.0.1", "udp://10.0.0.2:1161", "TCP://switch.local", "[::1]:162"]),
            vec![
                "udp://10.0.0.1:161",
                "udp://10.0.0.2:1161",
                "tcp://switch.local:161",
                "udp://[::1]:162",
            ]
        );
    }

    #[test]
    fn cidr_includes_network_and_broadcast() {
        assert_eq!(
            addresses(&["10.0.1.0/30"]),
            vec![
                "udp://10.0.1.0:161",
                "udp://10.0.1.1:161",
                "udp://10.0.1.2:161",
                "udp://10.0.1.3:161",
            ]
        );
        assert_eq!(addresses(&["udp://10.0.2.0/31:1161"]).len(), 2);
    }

    #[test]
    fn rejects_bad_agents() {
        let mut inst = instance("");
        inst.agents = vec!["http://10.0.0.1".into()];
        assert!(matches!(inst.endpoints(), Err(ConfigError::UnsupportedScheme(s)) if s == "http"));

        inst.agents = vec!["10.0.0.1:notaport".into()];
        assert!(matches!(inst.endpoints(), Err(ConfigError::InvalidAgent { .. })));

        inst.agents = vec!["10.0.0.0/8".into()];
        assert!(matches!(inst.endpoints(), Err(ConfigError::InvalidAgent { .. })));

        inst.agents.clear();
        assert!(matches!(inst.validate(), Err(ConfigError::NoAgents)));
    }

    #[test]
    fn credential_rules() {
        let mut inst = instance("");
        inst.community.clear();
        assert!(matches!(inst.validate(), Err(ConfigError::MissingCommunity)));

        let mut v3 = instance("version = 3");
        assert!(matches!(v3.validate(), Err(ConfigError::MissingUsername)));

        v3.sec_name = "monitor".into();
        v3.sec_level = "authPriv".into();
        assert!(matches!(v3.validate(), Err(ConfigError::MissingAuthPassword(_))));

        v3.auth_password = "secret".into();
        assert!(matches!(v3.validate(), Err(ConfigError::MissingPrivPassword)));

        v3.priv_password = "secret2".into();
        v3.priv_protocol = "AES256C".into();
        v3.auth_protocol = "SHA512".into();
        assert!(v3.validate().is_ok());
        match v3.credentials().unwrap() {
            Credentials::Usm { username, level, privacy, .. } => {
                assert_eq!(username, "monitor");
                assert_eq!(level, SecurityLevel::AuthPriv);
                assert_eq!(privacy.map(|p| p.0), Some(PrivProtocol::Aes256C));
            }
            other => panic!("unexpected credentials {other:?}"),
        }

        v3.security_level = "superSecure".into();
        assert!(matches!(v3.validate(), Err(ConfigError::InvalidSecurityLevel(_))));

        let bad_version = instance("version = 4");
        assert!(matches!(bad_version.validate(), Err(ConfigError::UnsupportedVersion(4))));

        let zero_timeout = instance("timeout = \"0s\"");
        assert!(matches!(zero_timeout.validate(), Err(ConfigError::InvalidTimeout)));
    }

    #[test]
    fn requires_something_to_collect() {
        let mut inst = instance("");
        inst.items.clear();
        assert!(matches!(inst.validate(), Err(ConfigError::NothingToCollect)));
        inst.template_file_contents.insert("a".into(), "zabbix_export: {}".into());
        assert!(inst.validate().is_ok());
    }

    #[test]
    fn host_is_extracted() {
        assert_eq!(host_of("udp://10.0.0.1:161"), "10.0.0.1");
        assert_eq!(host_of("udp://[fe80::1]:161"), "fe80::1");
        assert_eq!(host_of("switch.local"), "switch.local");
        assert_eq!(host_of("tcp://switch.local:1161"), "switch.local");
    }

    #[test]
    fn globals_are_inherited_and_env_expanded() {
        std::env::set_var("SNMP_LLD_TEST_COMMUNITY", "s3cret");
        let cfg = Config::parse(
            r#"
[labels]
region = "eu"
zone = "a"

[mappings."udp://10.0.0.1:161"]
rack = "r1"

[[instances]]
agents = ["10.0.0.1"]
community = "${SNMP_LLD_TEST_COMMUNITY}"
labels = { zone = "b" }
[[instances.items]]
key = "k"
oid = "1.3.6.1.2.1.1.3.0"
"#,
        )
        .unwrap();
        let inst = &cfg.instances[0];
        assert_eq!(inst.community, "s3cret");
        assert_eq!(inst.labels.get("region").map(String::as_str), Some("eu"));
        assert_eq!(inst.labels.get("zone").map(String::as_str), Some("b"));
        assert_eq!(inst.mappings["udp://10.0.0.1:161"]["rack"], "r1");
    }

    #[test]
    fn invalid_instance_fails_load() {
        let err = Config::parse("[[instances]]\nagents = []\n").unwrap_err();
        assert!(format!("{err:#}").contains("instance #0"));
    }
}
