//! Script sandbox for `JAVASCRIPT` steps.
//!
//! Scripts are written in Rhai. The input is bound to `value` and the value of
//! the last expression (or of `return`) is the step output.

use parking_lot::RwLock;
use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use super::{hex_spaced, Value};
use crate::error::ScriptError;

const MAX_STRING_SIZE: usize = 16 * 1024 * 1024;
const MAX_ARRAY_SIZE: usize = 100_000;
const MAX_MAP_SIZE: usize = 10_000;
const MAX_CALL_LEVELS: usize = 64;
const MAX_CACHED_SCRIPTS: usize = 1024;

/// Evaluates a script against one input value.
pub trait ScriptEngine: Send + Sync {
    fn evaluate(&self, script: &str, input: serde_json::Value) -> Result<serde_json::Value, ScriptError>;
}

/// Used when scripting is turned off for an instance.
pub struct DisabledScriptEngine;

impl ScriptEngine for DisabledScriptEngine {
    fn evaluate(&self, _script: &str, _input: serde_json::Value) -> Result<serde_json::Value, ScriptError> {
        Err(ScriptError::Disabled)
    }
}

/// Rhai-backed sandbox: no module imports, no `eval`, bounded collection
/// sizes and a wall-clock deadline per evaluation.
pub struct RhaiScriptEngine {
    timeout: Duration,
    cache: RwLock<HashMap<String, Arc<AST>>>,
}

impl RhaiScriptEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn compiled(&self, script: &str) -> Result<Arc<AST>, ScriptError> {
        if let Some(ast) = self.cache.read().get(script) {
            return Ok(ast.clone());
        }

        let ast = sandbox(None)
            .compile(script)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        let ast = Arc::new(ast);

        let mut cache = self.cache.write();
        if cache.len() >= MAX_CACHED_SCRIPTS {
            cache.clear();
        }
        cache.insert(script.to_string(), ast.clone());
        Ok(ast)
    }

    pub fn cached_scripts(&self) -> usize {
        self.cache.read().len()
    }
}

impl ScriptEngine for RhaiScriptEngine {
    fn evaluate(&self, script: &str, input: serde_json::Value) -> Result<serde_json::Value, ScriptError> {
        let ast = self.compiled(script)?;
        let engine = sandbox(Some(Instant::now() + self.timeout));

        let value = rhai::serde::to_dynamic(input).map_err(|e| ScriptError::Conversion(e.to_string()))?;
        let mut scope = Scope::new();
        scope.push_dynamic("value", value);

        let result: Dynamic = engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| match *e {
                EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout(self.timeout),
                other => ScriptError::Runtime(other.to_string()),
            })?;

        rhai::serde::from_dynamic(&result).map_err(|e| ScriptError::Conversion(e.to_string()))
    }
}

fn sandbox(deadline: Option<Instant>) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.set_max_string_size(MAX_STRING_SIZE);
    engine.set_max_array_size(MAX_ARRAY_SIZE);
    engine.set_max_map_size(MAX_MAP_SIZE);
    engine.set_max_call_levels(MAX_CALL_LEVELS);

    if let Some(deadline) = deadline {
        engine.on_progress(move |_ops| {
            if Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
    }

    engine.on_print(|text| tracing::info!(target: "script", "{}", text));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "script", source = source.unwrap_or(""), position = %pos, "{}", text)
    });

    engine.register_fn("parse_json", |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let parsed: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        rhai::serde::to_dynamic(parsed)
    });
    engine.register_fn("to_json", |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
        let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
        Ok(json.to_string())
    });

    engine
}

/// Input binding for a script: a `{"data": [...]}` document is unwrapped to
/// its rows, other values map onto their JSON counterparts.
pub(super) fn script_input(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(v) => serde_json::Value::from(*v),
        Value::Unsigned(v) => serde_json::Value::from(*v),
        Value::Float(v) => serde_json::Value::from(*v),
        Value::Text(s) => unwrap_discovery_document(s).unwrap_or_else(|| serde_json::Value::String(s.clone())),
        Value::Bytes(b) => serde_json::Value::String(hex_spaced(b)),
        Value::Json(v) => v.clone(),
        Value::Walks(_) => serde_json::Value::String(value.to_text()),
    }
}

fn unwrap_discovery_document(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') || !trimmed.contains("\"data\"") {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(mut doc)) => doc.remove("data"),
        _ => None,
    }
}

fn iregsub_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"iregsub\("([^"]+)",\s*"([^"]*)"\)"#).unwrap_or_else(|_| unreachable!())
    })
}

/// Recognize an `iregsub("pattern", "replacement")` one-liner and turn it
/// into a case-insensitive regex replacement.
pub(super) fn iregsub_shortcut(script: &str) -> Option<Result<(Regex, String), regex::Error>> {
    let caps = iregsub_re().captures(script)?;
    let pattern = format!("(?i){}", &caps[1]);
    Some(Regex::new(&pattern).map(|re| (re, replacement_template(&caps[2]))))
}

/// Convert `\1` style backreferences to the `${1}` form used by `regex`.
fn replacement_template(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek().is_some_and(|n| n.is_ascii_digit()) => {
                if let Some(d) = chars.next() {
                    out.push_str(&format!("${{{}}}", d));
                }
            }
            '$' => out.push_str("$$"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> RhaiScriptEngine {
        RhaiScriptEngine::new(Duration::from_secs(5))
    }

    #[test]
    fn evaluates_expressions() {
        let e = engine();
        assert_eq!(e.evaluate("value + 1", json!(41)).unwrap(), json!(42));
        assert_eq!(e.evaluate("return value.to_upper();", json!("eth0")).unwrap(), json!("ETH0"));
    }

    #[test]
    fn reshapes_discovery_rows() {
        let e = engine();
        let script = r#"
            let out = [];
            for row in value {
                if row["{#IFTYPE}"] == "6" {
                    out.push(#{ "{#IFNAME}": row["{#IFNAME}"], "{#SNMPINDEX}": row["{#SNMPINDEX}"] });
                }
            }
            to_json(out)
        "#;
        let doc = r#"{"data":[{"{#SNMPINDEX}":"1","{#IFNAME}":"lo","{#IFTYPE}":"24"},{"{#SNMPINDEX}":"2","{#IFNAME}":"eth0","{#IFTYPE}":"6"}]}"#;
        let input = script_input(&Value::Text(doc.to_string()));
        assert!(input.is_array());
        let out = e.evaluate(script, input).unwrap();
        let rows: serde_json::Value = serde_json::from_str(out.as_str().unwrap()).unwrap();
        assert_eq!(rows, json!([{"{#IFNAME}": "eth0", "{#SNMPINDEX}": "2"}]));
    }

    #[test]
    fn parse_json_helper() {
        let out = engine()
            .evaluate(r#"let d = parse_json(value); d.speed * 2"#, json!(r#"{"speed": 50}"#))
            .unwrap();
        assert_eq!(out, json!(100));
    }

    #[test]
    fn compiled_scripts_are_cached() {
        let e = engine();
        e.evaluate("value", json!(1)).unwrap();
        e.evaluate("value", json!(2)).unwrap();
        assert_eq!(e.cached_scripts(), 1);
    }

    #[test]
    fn runaway_scripts_time_out() {
        let e = RhaiScriptEngine::new(Duration::from_millis(50));
        let err = e.evaluate("let x = 0; loop { x += 1; }", json!(null)).unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(_)));
    }

    #[test]
    fn compile_errors_and_sandbox() {
        let e = engine();
        assert!(matches!(e.evaluate("let = ;", json!(1)), Err(ScriptError::Compile(_))));
        assert!(e.evaluate(r#"eval("1")"#, json!(1)).is_err());
        assert!(e.evaluate(r#"import "os" as os; 1"#, json!(1)).is_err());
    }

    #[test]
    fn iregsub_one_liner() {
        let (re, rep) = iregsub_shortcut(r#"return iregsub("^(\w+)\s+port", "\1");"#).unwrap().unwrap();
        assert_eq!(re.replace_all("Gigabit PORT 1", rep.as_str()), "Gigabit 1");
        assert!(iregsub_shortcut("value * 8").is_none());
    }
}
