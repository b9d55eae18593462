use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn user_macro_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\$[^}]+\}").unwrap_or_else(|_| unreachable!()))
}

/// Strip `{#` and `}` from a discovery macro name, if present.
pub fn normalize_lld_macro(name: &str) -> &str {
    name.strip_prefix("{#")
        .and_then(|n| n.strip_suffix('}'))
        .unwrap_or(name)
}

/// Expand `{#NAME}` placeholders from a discovery row, then `{$NAME}`
/// placeholders through `lookup`. Unknown user macros are left untouched.
pub fn expand<'a, F>(text: &str, row: Option<&BTreeMap<String, String>>, lookup: F) -> String
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut result = text.to_string();

    if let Some(row) = row {
        if result.contains("{#") {
            for (name, value) in row {
                let placeholder = format!("{{#{}}}", normalize_lld_macro(name));
                if result.contains(&placeholder) {
                    result = result.replace(&placeholder, value);
                }
            }
        }
    }

    if result.contains("{$") {
        result = user_macro_re()
            .replace_all(&result, |caps: &regex::Captures| {
                let whole = &caps[0];
                match lookup(whole) {
                    Some(v) if !v.is_empty() => v.to_string(),
                    _ => whole.to_string(),
                }
            })
            .into_owned();
    }

    result
}

/// True if `text` still holds a discovery placeholder.
pub fn has_lld_macro(text: &str) -> bool {
    text.contains("{#")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn lookup(name: &str) -> Option<&'static str> {
        match name {
            "{$IF.DELAY}" => Some("3m"),
            "{$EMPTY}" => Some(""),
            _ => None,
        }
    }

    #[test]
    fn expands_both_kinds() {
        let r = row(&[("{#SNMPINDEX}", "3"), ("IFNAME", "eth0")]);
        assert_eq!(
            expand("if[{#IFNAME}.{#SNMPINDEX}] every {$IF.DELAY}", Some(&r), lookup),
            "if[eth0.3] every 3m"
        );
    }

    #[test]
    fn unknown_macros_left_alone() {
        assert_eq!(expand("{$NOPE} {$EMPTY} {#X}", None, lookup), "{$NOPE} {$EMPTY} {#X}");
        assert!(has_lld_macro("1.3.6.{#SNMPINDEX}"));
        assert!(!has_lld_macro("1.3.6.1"));
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_lld_macro("{#IFNAME}"), "IFNAME");
        assert_eq!(normalize_lld_macro("IFNAME"), "IFNAME");
    }
}
