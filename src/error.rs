use std::time::Duration;

/// Configuration problems. Any of these prevents an instance from starting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config: no agents configured")]
    NoAgents,

    #[error("Config: invalid agent '{agent}': {reason}")]
    InvalidAgent { agent: String, reason: String },

    #[error("Config: unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Config: unsupported SNMP version {0}")]
    UnsupportedVersion(u8),

    #[error("Config: community is required for SNMP v1/v2c")]
    MissingCommunity,

    #[error("Config: username is required for SNMP v3")]
    MissingUsername,

    #[error("Config: invalid security level '{0}'")]
    InvalidSecurityLevel(String),

    #[error("Config: auth password is required for security level {0}")]
    MissingAuthPassword(String),

    #[error("Config: privacy password is required for authPriv")]
    MissingPrivPassword,

    #[error("Config: unsupported auth protocol '{0}'")]
    InvalidAuthProtocol(String),

    #[error("Config: unsupported privacy protocol '{0}'")]
    InvalidPrivProtocol(String),

    #[error("Config: timeout must be greater than zero")]
    InvalidTimeout,

    #[error("Config: no template files, template contents or items defined")]
    NothingToCollect,
}

/// Template loading, validation and expansion failures.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template: failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Template: parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Template: version is required")]
    MissingVersion,

    #[error("Template: document must contain at least one template or host")]
    Empty,

    #[error("Template: {kind} {index}: {field} is required")]
    MissingField {
        kind: &'static str,
        index: usize,
        field: &'static str,
    },

    #[error("Template: invalid discovery expression '{expr}': {reason}")]
    InvalidDiscoveryExpr { expr: String, reason: String },

    #[error("Template: invalid OID '{0}'")]
    InvalidOid(String),
}

/// A single protocol call failed. Never fatal to a scheduler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Transport: request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport: I/O error: {0}")]
    Io(String),

    #[error("Transport: cannot resolve '{0}'")]
    Resolve(String),

    #[error("Transport: malformed packet: {0}")]
    Decode(String),

    #[error("Transport: cannot encode request: {0}")]
    Encode(String),

    #[error("Transport: agent returned error status {status} at index {index}")]
    ErrorStatus { status: i64, index: i64 },

    #[error("Transport: no such object: {0}")]
    NoSuchObject(String),

    #[error("Transport: no such instance: {0}")]
    NoSuchInstance(String),

    #[error("Transport: {0}")]
    Unsupported(String),

    #[error("Transport: USM: {0}")]
    Security(String),

    #[error("Transport: session closed")]
    Closed,

    #[error("Transport: no session for agent {0}")]
    UnknownAgent(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Sandbox evaluation failures.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Script: compile error: {0}")]
    Compile(String),

    #[error("Script: runtime error: {0}")]
    Runtime(String),

    #[error("Script: execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Script: value conversion failed: {0}")]
    Conversion(String),

    #[error("Script: scripting is disabled")]
    Disabled,
}

/// Preprocessing failures, raised either when a step is compiled or when it runs.
#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Preprocess: no previous value")]
    NoPreviousValue,

    #[error("Preprocess: value discarded")]
    Discarded,

    #[error("Preprocess: unknown step kind '{0}'")]
    UnknownKind(String),

    #[error("Preprocess: {kind}: invalid parameters: {reason}")]
    InvalidParameters { kind: &'static str, reason: String },

    #[error("Preprocess: {kind}: {reason}")]
    Step { kind: &'static str, reason: String },

    #[error("Preprocess: invalid time difference {0:.3}s")]
    InvalidTimeDelta(f64),

    #[error("Preprocess: {0}")]
    Custom(String),

    #[error("Preprocess: {0}")]
    Script(#[from] ScriptError),

    #[error("Preprocess: JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PreprocessError {
    /// Quiet conditions that drop an observation without being a fault.
    pub fn is_quiet(&self) -> bool {
        matches!(self, PreprocessError::NoPreviousValue | PreprocessError::Discarded)
    }
}

/// Failures of one discovery rule execution.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Discovery: {0}")]
    Transport(#[from] TransportError),

    #[error("Discovery: {0}")]
    Template(#[from] TemplateError),

    #[error("Discovery: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Discovery: empty SNMP OID for rule '{0}'")]
    EmptyOid(String),

    #[error("Discovery: cannot decode discovery document: {0}")]
    Document(String),

    #[error("Discovery: preprocessing task failed: {0}")]
    Task(String),
}
