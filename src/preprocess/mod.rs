//! Preprocessing: ordered transform chains applied to raw values.
//!
//! Steps are compiled once from their template definitions into [`StepSpec`]
//! values, so malformed parameters are caught when an item is loaded rather
//! than on every poll. A [`Pipeline`] runs a chain against one value and keeps
//! the per-item history that change and discard steps depend on.

mod history;
mod script;

pub use history::History;
pub use script::{DisabledScriptEngine, RhaiScriptEngine, ScriptEngine};

use regex::Regex;
use serde_json_path::JsonPath;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::config::{InstanceConfig, PreprocessPolicy};
use crate::error::PreprocessError;
use crate::snmp::{compare_oids, normalize_oid, oid_suffix, SnmpValue, VarBind};
use crate::template::PreprocessStepDef;

/// A value moving through a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    /// Raw results of several walks, one entry per walked root.
    Walks(Vec<(String, Vec<VarBind>)>),
}

/// How byte strings are presented to the first step of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OctetMode {
    /// Printable text, or lowercase hex when not printable.
    Text,
    /// Uppercase hex pairs separated by spaces, for scripts.
    HexSpaced,
    /// Untouched bytes, for MAC and IP formatting.
    Raw,
}

impl OctetMode {
    pub fn for_steps(steps: &[StepSpec]) -> Self {
        if steps.iter().any(|s| matches!(s.step, Step::Script(_))) {
            OctetMode::HexSpaced
        } else if steps
            .iter()
            .any(|s| matches!(s.step, Step::MacFormat { .. } | Step::IpFormat))
        {
            OctetMode::Raw
        } else {
            OctetMode::Text
        }
    }
}

impl Value {
    /// Normalize a protocol value before preprocessing.
    pub fn from_snmp(value: &SnmpValue, octets: OctetMode) -> Self {
        match value {
            SnmpValue::Integer(v) => Value::Int(*v),
            SnmpValue::Counter32(v) | SnmpValue::Gauge32(v) => Value::Int(i64::from(*v)),
            SnmpValue::Counter64(v) => Value::Unsigned(*v),
            SnmpValue::TimeTicks(v) => Value::Float(f64::from(*v) / 100.0),
            SnmpValue::OctetString(bytes) => match octets {
                OctetMode::HexSpaced => Value::Text(hex_spaced(bytes)),
                OctetMode::Raw => Value::Bytes(bytes.clone()),
                OctetMode::Text => match printable(bytes) {
                    Some(text) => Value::Text(text.to_string()),
                    None => Value::Text(hex_lower(bytes)),
                },
            },
            SnmpValue::Opaque(bytes) => Value::Text(hex_lower(bytes)),
            SnmpValue::ObjectIdentifier(oid) => Value::Text(oid.clone()),
            SnmpValue::IpAddress(octets) => Value::Text(Ipv4Addr::from(*octets).to_string()),
            SnmpValue::Null
            | SnmpValue::NoSuchObject
            | SnmpValue::NoSuchInstance
            | SnmpValue::EndOfMibView => Value::Text(String::new()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => parse_number(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok().and_then(parse_number),
            Value::Json(serde_json::Value::Number(n)) => n.as_f64(),
            Value::Json(serde_json::Value::String(s)) => parse_number(s),
            Value::Json(_) | Value::Walks(_) => None,
        }
    }

    /// Text form as seen by string steps and label providers.
    pub fn to_text(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Unsigned(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Json(serde_json::Value::String(s)) => s.clone(),
            Value::Json(v) => v.to_string(),
            Value::Walks(walks) => walks
                .iter()
                .flat_map(|(_, binds)| binds)
                .map(|b| format!(".{} = {}", normalize_oid(&b.oid), render_snmp(&b.value)))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Counters observed as 64-bit wrap at the 64-bit ceiling.
    fn counter_ceiling(&self) -> f64 {
        match self {
            Value::Unsigned(_) => u64::MAX as f64,
            _ => u32::MAX as f64,
        }
    }

    fn is_integral(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Unsigned(_))
    }

    fn from_json(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Unsigned(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::Bool(b) => Value::Text(b.to_string()),
            other => Value::Json(other),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

/// Render a protocol value as discovery text: printable byte strings as text,
/// other byte strings as uppercase hex pairs, numbers in decimal.
pub fn render_snmp(value: &SnmpValue) -> String {
    match value {
        SnmpValue::OctetString(bytes) | SnmpValue::Opaque(bytes) => match printable(bytes) {
            Some(text) => text.to_string(),
            None => hex_spaced(bytes),
        },
        SnmpValue::Integer(v) => v.to_string(),
        SnmpValue::Counter32(v) | SnmpValue::Gauge32(v) | SnmpValue::TimeTicks(v) => v.to_string(),
        SnmpValue::Counter64(v) => v.to_string(),
        SnmpValue::ObjectIdentifier(oid) => oid.clone(),
        SnmpValue::IpAddress(octets) => Ipv4Addr::from(*octets).to_string(),
        SnmpValue::Null
        | SnmpValue::NoSuchObject
        | SnmpValue::NoSuchInstance
        | SnmpValue::EndOfMibView => String::new(),
    }
}

fn printable(bytes: &[u8]) -> Option<&str> {
    if bytes.iter().all(|b| (32..=126).contains(b)) {
        std::str::from_utf8(bytes).ok()
    } else {
        None
    }
}

fn hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(v) = s.parse::<f64>() {
        return Some(v);
    }
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    i64::from_str_radix(hex, 16).ok().map(|v| v as f64)
}

/// One column of an `SNMP_WALK_TO_JSON` step.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkColumn {
    pub macro_name: String,
    pub oid: String,
    pub flag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimSide {
    Both,
    Left,
    Right,
}

/// A compiled step.
#[derive(Debug, Clone)]
pub enum Step {
    Multiplier(f64),
    HexToDecimal,
    MacFormat { separator: String },
    IpFormat,
    Regex { pattern: Regex, output: String },
    /// `iregsub("pattern", "replacement")` script one-liners.
    Replace { pattern: Regex, replacement: String },
    Trim { side: TrimSide, chars: String },
    SimpleChange,
    ChangePerSecond,
    JsonPath { path: JsonPath, source: String },
    Script(String),
    WalkToJson(Vec<WalkColumn>),
    DiscardUnchanged,
    DiscardUnchangedHeartbeat(Duration),
    CheckNotSupported,
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Multiplier(_) => "MULTIPLIER",
            Step::HexToDecimal => "HEX_TO_DECIMAL",
            Step::MacFormat { .. } => "MAC_FORMAT",
            Step::IpFormat => "IP_FORMAT",
            Step::Regex { .. } => "REGEX",
            Step::Replace { .. } | Step::Script(_) => "JAVASCRIPT",
            Step::Trim { side: TrimSide::Both, .. } => "TRIM",
            Step::Trim { side: TrimSide::Left, .. } => "LTRIM",
            Step::Trim { side: TrimSide::Right, .. } => "RTRIM",
            Step::SimpleChange => "SIMPLE_CHANGE",
            Step::ChangePerSecond => "CHANGE_PER_SECOND",
            Step::JsonPath { .. } => "JSONPATH",
            Step::WalkToJson(_) => "SNMP_WALK_TO_JSON",
            Step::DiscardUnchanged => "DISCARD_UNCHANGED",
            Step::DiscardUnchangedHeartbeat(_) => "DISCARD_UNCHANGED_HEARTBEAT",
            Step::CheckNotSupported => "CHECK_NOT_SUPPORTED",
        }
    }

    /// Steps whose outcome depends on earlier observations.
    pub fn uses_history(&self) -> bool {
        matches!(
            self,
            Step::SimpleChange
                | Step::ChangePerSecond
                | Step::DiscardUnchanged
                | Step::DiscardUnchangedHeartbeat(_)
        )
    }

    fn compile(kind: &str, params: &[String]) -> Result<Self, PreprocessError> {
        let first = params.first().map(|p| p.trim()).unwrap_or("");
        let invalid = |kind: &'static str, reason: String| PreprocessError::InvalidParameters { kind, reason };

        let step = match kind.trim().to_ascii_uppercase().as_str() {
            "MULTIPLIER" | "5" => {
                let factor = first
                    .parse::<f64>()
                    .map_err(|_| invalid("MULTIPLIER", format!("'{}' is not a number", first)))?;
                Step::Multiplier(factor)
            }
            "HEX_TO_DECIMAL" | "17" => Step::HexToDecimal,
            "MAC_FORMAT" | "SNMP_HEX_TO_MAC" => Step::MacFormat {
                separator: params
                    .first()
                    .filter(|p| !p.is_empty())
                    .cloned()
                    .unwrap_or_else(|| ":".to_string()),
            },
            "IP_FORMAT" | "SNMP_OCTETS_TO_IP" => Step::IpFormat,
            "REGEX" | "11" => {
                let source = params.first().map(String::as_str).unwrap_or("");
                if source.is_empty() {
                    return Err(invalid("REGEX", "pattern is required".into()));
                }
                let pattern =
                    Regex::new(source).map_err(|e| invalid("REGEX", e.to_string()))?;
                let output = params
                    .get(1)
                    .filter(|p| !p.is_empty())
                    .cloned()
                    .unwrap_or_else(|| "\\0".to_string());
                Step::Regex { pattern, output }
            }
            "TRIM" | "LTRIM" | "RTRIM" => {
                let side = match kind.trim().to_ascii_uppercase().as_str() {
                    "LTRIM" => TrimSide::Left,
                    "RTRIM" => TrimSide::Right,
                    _ => TrimSide::Both,
                };
                Step::Trim {
                    side,
                    chars: params.first().cloned().unwrap_or_default(),
                }
            }
            "SIMPLE_CHANGE" | "9" => Step::SimpleChange,
            "CHANGE_PER_SECOND" | "10" => Step::ChangePerSecond,
            "JSONPATH" | "12" => {
                if first.is_empty() {
                    return Err(invalid("JSONPATH", "path is required".into()));
                }
                let path = JsonPath::parse(first).map_err(|e| invalid("JSONPATH", e.to_string()))?;
                Step::JsonPath {
                    path,
                    source: first.to_string(),
                }
            }
            "JAVASCRIPT" | "21" => {
                let source = params.first().map(String::as_str).unwrap_or("");
                if source.trim().is_empty() {
                    return Err(invalid("JAVASCRIPT", "script is required".into()));
                }
                match script::iregsub_shortcut(source) {
                    Some(Ok((pattern, replacement))) => Step::Replace { pattern, replacement },
                    Some(Err(e)) => return Err(invalid("JAVASCRIPT", e.to_string())),
                    None => Step::Script(source.to_string()),
                }
            }
            "SNMP_WALK_TO_JSON" | "16" => {
                if params.is_empty() || params.len() % 3 != 0 {
                    return Err(invalid(
                        "SNMP_WALK_TO_JSON",
                        "parameters must be triplets of macro, OID, flag".into(),
                    ));
                }
                let columns = params
                    .chunks(3)
                    .map(|c| WalkColumn {
                        macro_name: c[0].trim().to_string(),
                        oid: normalize_oid(&c[1]).to_string(),
                        flag: c[2].trim().to_string(),
                    })
                    .collect();
                Step::WalkToJson(columns)
            }
            "DISCARD_UNCHANGED" | "19" => Step::DiscardUnchanged,
            "DISCARD_UNCHANGED_HEARTBEAT" | "20" => {
                let heartbeat = crate::timing::parse_delay(first, Duration::ZERO);
                if heartbeat.is_zero() {
                    return Err(invalid(
                        "DISCARD_UNCHANGED_HEARTBEAT",
                        format!("invalid heartbeat '{}'", first),
                    ));
                }
                Step::DiscardUnchangedHeartbeat(heartbeat)
            }
            "CHECK_NOT_SUPPORTED" | "26" => Step::CheckNotSupported,
            other => return Err(PreprocessError::UnknownKind(other.to_string())),
        };
        Ok(step)
    }
}

/// What happens when a step fails.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ErrorHandler {
    /// Propagate the error.
    #[default]
    Original,
    /// Drop the value quietly.
    Discard,
    /// Replace the value and stop the chain.
    CustomValue(String),
    /// Fail with the given message.
    CustomError(String),
}

impl ErrorHandler {
    pub fn parse(handler: &str, params: &str) -> Self {
        match handler.trim().to_ascii_uppercase().as_str() {
            "DISCARD_VALUE" | "1" => ErrorHandler::Discard,
            "CUSTOM_VALUE" | "2" => ErrorHandler::CustomValue(params.to_string()),
            "CUSTOM_ERROR" | "3" => ErrorHandler::CustomError(params.to_string()),
            _ => ErrorHandler::Original,
        }
    }
}

/// A compiled step with its error handler.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub step: Step,
    pub on_fail: ErrorHandler,
}

impl StepSpec {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            on_fail: ErrorHandler::Original,
        }
    }

    pub fn compile(def: &PreprocessStepDef) -> Result<Self, PreprocessError> {
        Ok(Self {
            step: Step::compile(&def.kind, &def.parameters)?,
            on_fail: ErrorHandler::parse(&def.error_handler, &def.error_handler_params),
        })
    }
}

/// Compile a definition list under the load-time policy.
///
/// With [`PreprocessPolicy::Reject`] the first bad step fails the whole list;
/// with [`PreprocessPolicy::Warn`] bad steps are logged and left out.
pub fn compile_steps(
    defs: &[PreprocessStepDef],
    policy: PreprocessPolicy,
) -> Result<Vec<StepSpec>, PreprocessError> {
    let mut steps = Vec::with_capacity(defs.len());
    for def in defs {
        match StepSpec::compile(def) {
            Ok(spec) => steps.push(spec),
            Err(e) if policy == PreprocessPolicy::Warn => {
                tracing::warn!(kind = %def.kind, error = %e, "Skipping preprocessing step");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(steps)
}

/// True when running the chain may block for a noticeable time.
pub fn needs_blocking(steps: &[StepSpec]) -> bool {
    steps.iter().any(|s| matches!(s.step, Step::Script(_)))
}

/// Runs step chains. Shared by the collector and the discovery engine.
pub struct Pipeline {
    history: History,
    scripts: Arc<dyn ScriptEngine>,
}

impl Pipeline {
    pub fn new(scripts: Arc<dyn ScriptEngine>) -> Self {
        Self {
            history: History::default(),
            scripts,
        }
    }

    pub fn from_config(config: &InstanceConfig) -> Self {
        let scripts: Arc<dyn ScriptEngine> = if config.enable_scripts {
            Arc::new(RhaiScriptEngine::new(config.script_timeout))
        } else {
            Arc::new(DisabledScriptEngine)
        };
        Self::new(scripts)
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn apply(
        &self,
        agent: &str,
        key: &str,
        value: Value,
        steps: &[StepSpec],
    ) -> Result<Value, PreprocessError> {
        self.apply_at(agent, key, value, steps, Instant::now())
    }

    /// Run `steps` in order; each step receives the previous step's output.
    pub fn apply_at(
        &self,
        agent: &str,
        key: &str,
        mut value: Value,
        steps: &[StepSpec],
        now: Instant,
    ) -> Result<Value, PreprocessError> {
        let history_key = format!("{}|{}", agent, key);
        for spec in steps {
            match self.run(&spec.step, value, &history_key, now) {
                Ok(next) => value = next,
                Err(e) if e.is_quiet() => return Err(e),
                Err(e) => {
                    return match &spec.on_fail {
                        ErrorHandler::Original => Err(e),
                        ErrorHandler::Discard => Err(PreprocessError::Discarded),
                        ErrorHandler::CustomValue(v) => Ok(Value::Text(v.clone())),
                        ErrorHandler::CustomError(msg) => Err(PreprocessError::Custom(msg.clone())),
                    };
                }
            }
        }
        Ok(value)
    }

    fn run(&self, step: &Step, value: Value, history_key: &str, now: Instant) -> Result<Value, PreprocessError> {
        let fail = |reason: String| PreprocessError::Step {
            kind: step.kind(),
            reason,
        };

        match step {
            Step::Multiplier(factor) => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| fail(format!("'{}' is not numeric", value.to_text())))?;
                Ok(Value::Float(v * factor))
            }
            Step::HexToDecimal => hex_to_decimal(&value).map_err(fail),
            Step::MacFormat { separator } => Ok(mac_format(value, separator)),
            Step::IpFormat => Ok(ip_format(value)),
            Step::Regex { pattern, output } => {
                let text = value.to_text();
                Ok(Value::Text(regex_extract(pattern, output, &text)))
            }
            Step::Replace { pattern, replacement } => {
                let text = value.to_text();
                Ok(Value::Text(pattern.replace_all(&text, replacement.as_str()).into_owned()))
            }
            Step::Trim { side, chars } => Ok(Value::Text(trim(&value.to_text(), *side, chars))),
            Step::SimpleChange | Step::ChangePerSecond => {
                let current = value
                    .as_f64()
                    .ok_or_else(|| fail(format!("'{}' is not numeric", value.to_text())))?;
                let previous = self.history.swap(history_key, current, now);
                let (prev_value, prev_at) = previous.ok_or(PreprocessError::NoPreviousValue)?;

                if matches!(step, Step::SimpleChange) {
                    let delta = current - prev_value;
                    return Ok(if value.is_integral() {
                        Value::Int(delta as i64)
                    } else {
                        Value::Float(delta)
                    });
                }

                let elapsed = now
                    .checked_duration_since(prev_at)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                if elapsed <= 0.0 {
                    return Err(PreprocessError::InvalidTimeDelta(elapsed));
                }
                let delta = if current < prev_value {
                    (value.counter_ceiling() - prev_value) + current
                } else {
                    current - prev_value
                };
                Ok(Value::Float(delta / elapsed))
            }
            Step::JsonPath { path, source } => {
                let document = match value {
                    Value::Json(v) => v,
                    Value::Text(s) => serde_json::from_str(&s)?,
                    Value::Bytes(b) => serde_json::from_slice(&b)?,
                    other => return Err(fail(format!("expects JSON text, got '{}'", other.to_text()))),
                };
                json_path(path, &document).ok_or_else(|| fail(format!("path '{}' not found", source)))
            }
            Step::Script(source) => {
                let input = script::script_input(&value);
                let output = self.scripts.evaluate(source, input)?;
                Ok(Value::from_json(output))
            }
            Step::WalkToJson(columns) => match value {
                Value::Walks(walks) => walk_to_json(columns, &walks).map_err(fail),
                other => Err(fail(format!("expects walk results, got '{}'", other.to_text()))),
            },
            Step::DiscardUnchanged => {
                if self.history.unchanged(history_key, &value.to_text(), now, None) {
                    Err(PreprocessError::Discarded)
                } else {
                    Ok(value)
                }
            }
            Step::DiscardUnchangedHeartbeat(heartbeat) => {
                if self.history.unchanged(history_key, &value.to_text(), now, Some(*heartbeat)) {
                    Err(PreprocessError::Discarded)
                } else {
                    Ok(value)
                }
            }
            Step::CheckNotSupported => Ok(value),
        }
    }
}

fn hex_to_decimal(value: &Value) -> Result<Value, String> {
    let text = match value {
        Value::Bytes(b) => hex_lower(b),
        other => other.to_text(),
    };
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if digits.is_empty() {
        return Ok(Value::Int(0));
    }
    if let Ok(v) = i64::from_str_radix(&digits, 16) {
        return Ok(Value::Int(v));
    }
    u64::from_str_radix(&digits, 16)
        .map(Value::Unsigned)
        .map_err(|e| format!("'{}': {}", digits, e))
}

fn mac_format(value: Value, separator: &str) -> Value {
    let bytes: Vec<u8> = match &value {
        Value::Bytes(b) if b.len() == 6 => b.clone(),
        Value::Bytes(_) => return value,
        other => {
            let digits: Vec<u8> = other
                .to_text()
                .bytes()
                .filter(u8::is_ascii_hexdigit)
                .collect();
            if digits.len() != 12 {
                return value;
            }
            let parsed: Option<Vec<u8>> = digits
                .chunks(2)
                .map(|pair| {
                    std::str::from_utf8(pair)
                        .ok()
                        .and_then(|s| u8::from_str_radix(s, 16).ok())
                })
                .collect();
            match parsed {
                Some(bytes) => bytes,
                None => return value,
            }
        }
    };
    Value::Text(
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(separator),
    )
}

fn ipv4_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3}\.){3}\d{1,3}").unwrap_or_else(|_| unreachable!()))
}

fn ip_format(value: Value) -> Value {
    match &value {
        Value::Bytes(b) if b.len() == 4 => {
            Value::Text(Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string())
        }
        Value::Bytes(b) if b.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            Value::Text(Ipv6Addr::from(octets).to_string())
        }
        Value::Bytes(_) => value,
        Value::Text(s) => {
            let s = s.trim();
            if s.parse::<IpAddr>().is_ok() {
                return Value::Text(s.to_string());
            }
            let parts: Vec<&str> = s.split('.').collect();
            if parts.len() >= 4 {
                let tail: Option<Vec<u8>> =
                    parts[parts.len() - 4..].iter().map(|p| p.parse::<u8>().ok()).collect();
                if let Some(o) = tail {
                    return Value::Text(Ipv4Addr::new(o[0], o[1], o[2], o[3]).to_string());
                }
            }
            match ipv4_literal().find(s) {
                Some(m) => Value::Text(m.as_str().to_string()),
                None => value,
            }
        }
        other => match ipv4_literal().find(&other.to_text()) {
            Some(m) => Value::Text(m.as_str().to_string()),
            None => value,
        },
    }
}

/// First match of `pattern` rendered through `output`, where `\0`..`\9`
/// refer to capture groups. No match yields an empty string.
fn regex_extract(pattern: &Regex, output: &str, text: &str) -> String {
    let Some(caps) = pattern.captures(text) else {
        return String::new();
    };
    let mut out = String::with_capacity(output.len());
    let mut chars = output.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(d) = chars.peek().and_then(|n| n.to_digit(10)) {
                chars.next();
                out.push_str(caps.get(d as usize).map(|m| m.as_str()).unwrap_or(""));
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn trim(text: &str, side: TrimSide, chars: &str) -> String {
    let strip = |c: char| {
        if chars.is_empty() {
            c.is_whitespace() || c.is_control()
        } else {
            chars.contains(c)
        }
    };
    match side {
        TrimSide::Both => text.trim_matches(strip),
        TrimSide::Left => text.trim_start_matches(strip),
        TrimSide::Right => text.trim_end_matches(strip),
    }
    .to_string()
}

fn json_path(path: &JsonPath, document: &serde_json::Value) -> Option<Value> {
    let nodes = path.query(document).all();
    let result = match nodes.as_slice() {
        [] => return None,
        [single] => (*single).clone(),
        many => serde_json::Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    };
    match result {
        serde_json::Value::Null => None,
        v @ (serde_json::Value::Object(_) | serde_json::Value::Array(_)) => Some(Value::Text(v.to_string())),
        v => Some(Value::from_json(v)),
    }
}

/// Join walk results by index into a `{"data": [...]}` discovery document.
fn walk_to_json(columns: &[WalkColumn], walks: &[(String, Vec<VarBind>)]) -> Result<Value, String> {
    if walks.len() != columns.len() {
        return Err(format!(
            "{} walk results for {} columns",
            walks.len(),
            columns.len()
        ));
    }

    let mut rows: BTreeMap<String, serde_json::Map<String, serde_json::Value>> = BTreeMap::new();
    for (column, (_, binds)) in columns.iter().zip(walks) {
        for bind in binds {
            let Some(index) = oid_suffix(&bind.oid, &column.oid) else {
                continue;
            };
            let row = rows.entry(index.to_string()).or_insert_with(|| {
                let mut row = serde_json::Map::new();
                row.insert("{#SNMPINDEX}".into(), index.into());
                row
            });
            let text = match &bind.value {
                SnmpValue::OctetString(b) => String::from_utf8_lossy(b).into_owned(),
                other => render_snmp(other),
            };
            row.insert(column.macro_name.clone(), text.into());
        }
    }

    let mut ordered: Vec<(String, serde_json::Map<String, serde_json::Value>)> = rows.into_iter().collect();
    ordered.sort_by(|a, b| compare_oids(&a.0, &b.0));
    let data: Vec<serde_json::Value> = ordered
        .into_iter()
        .map(|(_, row)| serde_json::Value::Object(row))
        .collect();
    Ok(Value::Text(serde_json::json!({ "data": data }).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn def(kind: &str, params: &[&str]) -> PreprocessStepDef {
        PreprocessStepDef {
            kind: kind.to_string(),
            parameters: params.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    fn steps(defs: &[PreprocessStepDef]) -> Vec<StepSpec> {
        compile_steps(defs, PreprocessPolicy::Reject).unwrap()
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(Arc::new(RhaiScriptEngine::new(Duration::from_secs(5))))
    }

    fn run(defs: &[PreprocessStepDef], value: Value) -> Result<Value, PreprocessError> {
        pipeline().apply("udp://h:161", "k", value, &steps(defs))
    }

    #[test]
    fn multiplier_accepts_numbers_and_hex_strings() {
        assert_eq!(run(&[def("MULTIPLIER", &["8"])], Value::Int(10)).unwrap(), Value::Float(80.0));
        assert_eq!(run(&[def("5", &["0.5"])], "0x64".into()).unwrap(), Value::Float(50.0));
        assert!(run(&[def("MULTIPLIER", &["8"])], "abc".into()).is_err());
    }

    #[test]
    fn hex_to_decimal_strips_noise() {
        assert_eq!(run(&[def("HEX_TO_DECIMAL", &[])], "0x1F".into()).unwrap(), Value::Int(31));
        assert_eq!(run(&[def("17", &[])], "00 01 00".into()).unwrap(), Value::Int(256));
        assert_eq!(run(&[def("HEX_TO_DECIMAL", &[])], "".into()).unwrap(), Value::Int(0));
        assert_eq!(
            run(&[def("HEX_TO_DECIMAL", &[])], Value::Bytes(vec![0x01, 0x00])).unwrap(),
            Value::Int(256)
        );
    }

    #[test]
    fn mac_format_variants() {
        let raw = Value::Bytes(vec![0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
        assert_eq!(
            run(&[def("MAC_FORMAT", &[])], raw).unwrap(),
            Value::Text("00:1A:2B:3C:4D:5E".into())
        );
        assert_eq!(
            run(&[def("SNMP_HEX_TO_MAC", &["-"])], "00 1a 2b 3c 4d 5e".into()).unwrap(),
            Value::Text("00-1A-2B-3C-4D-5E".into())
        );
        assert_eq!(
            run(&[def("MAC_FORMAT", &[])], Value::Bytes(vec![1, 2, 3])).unwrap(),
            Value::Bytes(vec![1, 2, 3])
        );
        assert_eq!(run(&[def("MAC_FORMAT", &[])], "n/a".into()).unwrap(), Value::Text("n/a".into()));
    }

    #[test]
    fn ip_format_variants() {
        assert_eq!(
            run(&[def("IP_FORMAT", &[])], Value::Bytes(vec![10, 0, 0, 1])).unwrap(),
            Value::Text("10.0.0.1".into())
        );
        let mut v6 = vec![0u8; 16];
        v6[0] = 0xfe;
        v6[1] = 0x80;
        v6[15] = 1;
        assert_eq!(
            run(&[def("SNMP_OCTETS_TO_IP", &[])], Value::Bytes(v6)).unwrap(),
            Value::Text("fe80::1".into())
        );
        assert_eq!(
            run(&[def("IP_FORMAT", &[])], "1.4.192.168.1.20".into()).unwrap(),
            Value::Text("192.168.1.20".into())
        );
        assert_eq!(
            run(&[def("IP_FORMAT", &[])], "addr=172.16.0.9;".into()).unwrap(),
            Value::Text("172.16.0.9".into())
        );
        assert_eq!(run(&[def("IP_FORMAT", &[])], "none".into()).unwrap(), Value::Text("none".into()));
    }

    #[test]
    fn regex_with_backreferences() {
        let step = def("REGEX", &[r"(\d+)\s*(\w+)", r"\2=\1"]);
        assert_eq!(run(&[step], "speed 1000 Mbps".into()).unwrap(), Value::Text("Mbps=1000".into()));
        assert_eq!(
            run(&[def("REGEX", &[r"\d+"])], "port 24".into()).unwrap(),
            Value::Text("24".into())
        );
        assert_eq!(run(&[def("11", &[r"\d+", r"\0"])], "none".into()).unwrap(), Value::Text("".into()));
    }

    #[test]
    fn trims() {
        assert_eq!(run(&[def("TRIM", &[])], " eth0\n".into()).unwrap(), Value::Text("eth0".into()));
        assert_eq!(run(&[def("LTRIM", &[])], "\t eth0 ".into()).unwrap(), Value::Text("eth0 ".into()));
        assert_eq!(run(&[def("RTRIM", &["\""])], "\"eth0\"".into()).unwrap(), Value::Text("\"eth0".into()));
    }

    #[test]
    fn simple_change_needs_history() {
        let p = pipeline();
        let chain = steps(&[def("SIMPLE_CHANGE", &[])]);
        let t0 = Instant::now();
        let first = p.apply_at("a", "k", Value::Int(100), &chain, t0);
        assert!(matches!(first, Err(PreprocessError::NoPreviousValue)));
        let second = p.apply_at("a", "k", Value::Int(130), &chain, t0 + Duration::from_secs(5));
        assert_eq!(second.unwrap(), Value::Int(30));
    }

    #[test]
    fn change_per_second_wraps_32_bit_counters() {
        let p = pipeline();
        let chain = steps(&[def("CHANGE_PER_SECOND", &[])]);
        let t0 = Instant::now();
        assert!(matches!(
            p.apply_at("a", "k", Value::Int(120), &chain, t0),
            Err(PreprocessError::NoPreviousValue)
        ));
        let rate = p
            .apply_at("a", "k", Value::Int(80), &chain, t0 + Duration::from_secs(10))
            .unwrap();
        assert_eq!(rate, Value::Float(((4294967295.0 - 120.0) + 80.0) / 10.0));

        let rate = p
            .apply_at("a", "k", Value::Int(180), &chain, t0 + Duration::from_secs(20))
            .unwrap();
        assert_eq!(rate, Value::Float(10.0));
    }

    #[test]
    fn change_per_second_wraps_64_bit_counters() {
        let p = pipeline();
        let chain = steps(&[def("10", &[])]);
        let t0 = Instant::now();
        let _ = p.apply_at("a", "k", Value::Unsigned(u64::MAX - 9), &chain, t0);
        let rate = p
            .apply_at("a", "k", Value::Unsigned(10), &chain, t0 + Duration::from_secs(1))
            .unwrap();
        let expected = (u64::MAX as f64 - (u64::MAX - 9) as f64) + 10.0;
        assert_eq!(rate, Value::Float(expected));
    }

    #[test]
    fn change_per_second_rejects_zero_interval() {
        let p = pipeline();
        let chain = steps(&[def("CHANGE_PER_SECOND", &[])]);
        let t0 = Instant::now();
        let _ = p.apply_at("a", "k", Value::Int(1), &chain, t0);
        assert!(matches!(
            p.apply_at("a", "k", Value::Int(2), &chain, t0),
            Err(PreprocessError::InvalidTimeDelta(_))
        ));
    }

    #[test]
    fn history_is_per_agent_and_key() {
        let p = pipeline();
        let chain = steps(&[def("SIMPLE_CHANGE", &[])]);
        let t0 = Instant::now();
        let _ = p.apply_at("a", "k", Value::Int(1), &chain, t0);
        assert!(p.apply_at("b", "k", Value::Int(5), &chain, t0).is_err());
        assert!(p.apply_at("a", "other", Value::Int(5), &chain, t0).is_err());
        assert_eq!(p.history().len(), 3);
    }

    #[test]
    fn rate_then_multiplier() {
        let p = pipeline();
        let chain = steps(&[def("CHANGE_PER_SECOND", &[]), def("MULTIPLIER", &["8"])]);
        let t0 = Instant::now();
        let _ = p.apply_at("a", "k", Value::Unsigned(1000), &chain, t0);
        let v = p
            .apply_at("a", "k", Value::Unsigned(2000), &chain, t0 + Duration::from_secs(10))
            .unwrap();
        assert_eq!(v, Value::Float(800.0));
    }

    #[test]
    fn json_path_extraction() {
        let doc = r#"{"a":{"b":[1,2]},"name":"eth0","n":7}"#;
        assert_eq!(run(&[def("JSONPATH", &["$.name"])], doc.into()).unwrap(), Value::Text("eth0".into()));
        assert_eq!(run(&[def("12", &["$.n"])], doc.into()).unwrap(), Value::Int(7));
        assert_eq!(run(&[def("JSONPATH", &["$.a.b"])], doc.into()).unwrap(), Value::Text("[1,2]".into()));
        assert!(run(&[def("JSONPATH", &["$.missing"])], doc.into()).is_err());
        assert!(run(&[def("JSONPATH", &["$.name"])], "not json".into()).is_err());
    }

    #[test]
    fn error_handlers() {
        let mut step = def("MULTIPLIER", &["2"]);
        step.error_handler = "CUSTOM_VALUE".into();
        step.error_handler_params = "-1".into();
        let chain = vec![step.clone(), def("MULTIPLIER", &["10"])];
        assert_eq!(run(&chain, "x".into()).unwrap(), Value::Text("-1".into()));

        step.error_handler = "1".into();
        assert!(matches!(run(&[step.clone()], "x".into()), Err(PreprocessError::Discarded)));

        step.error_handler = "CUSTOM_ERROR".into();
        step.error_handler_params = "bad value".into();
        match run(&[step], "x".into()) {
            Err(PreprocessError::Custom(msg)) => assert_eq!(msg, "bad value"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn discard_unchanged() {
        let p = pipeline();
        let chain = steps(&[def("DISCARD_UNCHANGED", &[])]);
        let t0 = Instant::now();
        assert!(p.apply_at("a", "k", Value::Int(1), &chain, t0).is_ok());
        assert!(matches!(
            p.apply_at("a", "k", Value::Int(1), &chain, t0 + Duration::from_secs(1)),
            Err(PreprocessError::Discarded)
        ));
        assert!(p.apply_at("a", "k", Value::Int(2), &chain, t0 + Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn discard_unchanged_heartbeat() {
        let p = pipeline();
        let chain = steps(&[def("DISCARD_UNCHANGED_HEARTBEAT", &["1m"])]);
        let t0 = Instant::now();
        assert!(p.apply_at("a", "k", "up".into(), &chain, t0).is_ok());
        assert!(p
            .apply_at("a", "k", "up".into(), &chain, t0 + Duration::from_secs(30))
            .is_err());
        assert!(p
            .apply_at("a", "k", "up".into(), &chain, t0 + Duration::from_secs(61))
            .is_ok());
    }

    #[test]
    fn compile_policy() {
        let defs = [def("NO_SUCH_STEP", &[]), def("MULTIPLIER", &["2"])];
        assert!(matches!(
            compile_steps(&defs, PreprocessPolicy::Reject),
            Err(PreprocessError::UnknownKind(_))
        ));
        let kept = compile_steps(&defs, PreprocessPolicy::Warn).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].step.kind(), "MULTIPLIER");

        assert!(compile_steps(&[def("MULTIPLIER", &["x"])], PreprocessPolicy::Reject).is_err());
        assert!(compile_steps(&[def("REGEX", &["("])], PreprocessPolicy::Reject).is_err());
        assert!(compile_steps(&[def("SNMP_WALK_TO_JSON", &["{#A}", "1.3"])], PreprocessPolicy::Reject).is_err());
    }

    #[test]
    fn walk_to_json_joins_columns_by_index() {
        let chain = steps(&[def(
            "SNMP_WALK_TO_JSON",
            &["{#IFNAME}", "1.3.6.1.2.1.31.1.1.1.1", "0", "{#IFTYPE}", ".1.3.6.1.2.1.2.2.1.3", "0"],
        )]);
        let walks = vec![
            (
                "1.3.6.1.2.1.31.1.1.1.1".to_string(),
                vec![
                    VarBind::new("1.3.6.1.2.1.31.1.1.1.1.10", SnmpValue::OctetString(b"eth1".to_vec())),
                    VarBind::new("1.3.6.1.2.1.31.1.1.1.1.2", SnmpValue::OctetString(b"eth0".to_vec())),
                ],
            ),
            (
                "1.3.6.1.2.1.2.2.1.3".to_string(),
                vec![VarBind::new("1.3.6.1.2.1.2.2.1.3.2", SnmpValue::Integer(6))],
            ),
        ];
        let out = pipeline().apply("a", "rule", Value::Walks(walks), &chain).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&out.to_text()).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({"data": [
                {"{#SNMPINDEX}": "2", "{#IFNAME}": "eth0", "{#IFTYPE}": "6"},
                {"{#SNMPINDEX}": "10", "{#IFNAME}": "eth1"},
            ]})
        );
    }

    #[test]
    fn octet_normalization_follows_the_chain() {
        let raw = SnmpValue::OctetString(vec![0x00, 0x1a, 0xff]);
        assert_eq!(Value::from_snmp(&raw, OctetMode::Text), Value::Text("001aff".into()));
        assert_eq!(Value::from_snmp(&raw, OctetMode::HexSpaced), Value::Text("00 1A FF".into()));
        assert_eq!(Value::from_snmp(&raw, OctetMode::Raw), Value::Bytes(vec![0x00, 0x1a, 0xff]));
        assert_eq!(
            Value::from_snmp(&SnmpValue::OctetString(b"eth0".to_vec()), OctetMode::Text),
            Value::Text("eth0".into())
        );
        assert_eq!(Value::from_snmp(&SnmpValue::TimeTicks(12345), OctetMode::Text), Value::Float(123.45));
        assert_eq!(Value::from_snmp(&SnmpValue::Counter64(7), OctetMode::Text), Value::Unsigned(7));

        let chain = steps(&[def("MAC_FORMAT", &[])]);
        assert_eq!(OctetMode::for_steps(&chain), OctetMode::Raw);
        let chain = steps(&[def("JAVASCRIPT", &["value"])]);
        assert_eq!(OctetMode::for_steps(&chain), OctetMode::HexSpaced);
        assert_eq!(OctetMode::for_steps(&[]), OctetMode::Text);
    }

    #[test]
    fn script_step_runs_in_sandbox() {
        let out = run(&[def("JAVASCRIPT", &["value * 2"])], Value::Int(21)).unwrap();
        assert_eq!(out, Value::Int(42));
        let out = run(&[def("JAVASCRIPT", &[r#"iregsub("^GigabitEthernet", "Gi")"#])], "GigabitEthernet0/1".into())
            .unwrap();
        assert_eq!(out, Value::Text("Gi0/1".into()));
    }

    #[test]
    fn disabled_scripts_fail() {
        let p = Pipeline::new(Arc::new(DisabledScriptEngine));
        let chain = steps(&[def("JAVASCRIPT", &["value"])]);
        assert!(matches!(
            p.apply("a", "k", Value::Int(1), &chain),
            Err(PreprocessError::Script(crate::error::ScriptError::Disabled))
        ));
    }
}
