//! Discovery filters: per-row conditions combined by AND, OR or a formula.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::lenient_string;
use super::macros::normalize_lld_macro;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DiscoveryFilter {
    #[serde(default, deserialize_with = "lenient_string")]
    pub evaltype: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub formula: String,
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterCondition {
    #[serde(rename = "macro", default, deserialize_with = "lenient_string")]
    pub macro_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub operator: String,
    #[serde(rename = "formulaid", default, deserialize_with = "lenient_string")]
    pub formula_id: String,
}

impl FilterCondition {
    fn evaluate(&self, row: &BTreeMap<String, String>) -> bool {
        let actual = lookup(row, &self.macro_name);
        let expected = self.value.as_str();

        match self.operator.to_ascii_uppercase().as_str() {
            "" | "8" | "MATCHES_REGEX" => regex_match(expected, actual),
            "9" | "NOT_MATCHES_REGEX" => !regex_match(expected, actual),
            "2" | "LIKE" => actual.contains(expected),
            "3" | "NOT_LIKE" => !actual.contains(expected),
            "1" | "NOT_EQUALS" => actual != expected,
            _ => actual == expected,
        }
    }
}

/// Row lookup tolerating macro names stored with or without braces.
fn lookup<'a>(row: &'a BTreeMap<String, String>, name: &str) -> &'a str {
    if let Some(v) = row.get(name) {
        return v;
    }
    let bare = normalize_lld_macro(name);
    row.get(bare)
        .or_else(|| row.get(&format!("{{#{}}}", bare)))
        .map(String::as_str)
        .unwrap_or("")
}

fn regex_match(pattern: &str, value: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(value),
        Err(e) => {
            tracing::debug!(pattern, error = %e, "Invalid filter regex");
            false
        }
    }
}

impl DiscoveryFilter {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether a discovered row passes this filter. No conditions = pass.
    pub fn matches(&self, row: &BTreeMap<String, String>) -> bool {
        if self.conditions.is_empty() {
            return true;
        }

        let mut results: Vec<(String, bool)> = Vec::with_capacity(self.conditions.len());
        for (i, condition) in self.conditions.iter().enumerate() {
            let id = if condition.formula_id.is_empty() {
                format!("condition_{}", i)
            } else {
                condition.formula_id.clone()
            };
            results.push((id, condition.evaluate(row)));
        }

        let all = || results.iter().all(|(_, r)| *r);
        match self.evaltype.to_ascii_uppercase().as_str() {
            "" | "0" => {
                if self.formula.is_empty() {
                    all()
                } else {
                    self.evaluate_formula(&results)
                }
            }
            "2" | "OR" => results.iter().any(|(_, r)| *r),
            "3" | "FORMULA" => {
                if self.formula.is_empty() {
                    true
                } else {
                    self.evaluate_formula(&results)
                }
            }
            _ => all(),
        }
    }

    fn evaluate_formula(&self, results: &[(String, bool)]) -> bool {
        let values: HashMap<&str, bool> = results.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        match evaluate_formula(&self.formula, &values) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(formula = %self.formula, error = %e, "Filter formula failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(formula: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = formula.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(format!("expected '{}{}'", c, c));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

/// Recursive descent over `or` > `and` > `not` > atom.
struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    values: &'a HashMap<&'a str, bool>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or_expr(&mut self) -> Result<bool, String> {
        let mut value = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<bool, String> {
        let mut value = self.not_expr()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.not_expr()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn not_expr(&mut self) -> Result<bool, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(!self.not_expr()?);
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<bool, String> {
        match self.next() {
            Some(Token::Open) => {
                let value = self.or_expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(Token::Ident(id)) => self
                .values
                .get(id.as_str())
                .copied()
                .ok_or_else(|| format!("unknown condition '{}'", id)),
            Some(other) => Err(format!("unexpected token {:?}", other)),
            None => Err("unexpected end of formula".to_string()),
        }
    }
}

fn evaluate_formula(formula: &str, values: &HashMap<&str, bool>) -> Result<bool, String> {
    let mut parser = Parser {
        tokens: tokenize(formula)?,
        pos: 0,
        values,
    };
    let value = parser.or_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(format!("trailing input at token {}", parser.pos));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn cond(id: &str, macro_name: &str, value: &str, op: &str) -> FilterCondition {
        FilterCondition {
            macro_name: macro_name.into(),
            value: value.into(),
            operator: op.into(),
            formula_id: id.into(),
        }
    }

    #[test]
    fn operators() {
        let r = row(&[("{#IFNAME}", "eth0"), ("IFTYPE", "6")]);
        assert!(cond("A", "{#IFNAME}", "^eth", "").evaluate(&r));
        assert!(cond("A", "{#IFNAME}", "^eth", "MATCHES_REGEX").evaluate(&r));
        assert!(!cond("A", "{#IFNAME}", "^lo", "8").evaluate(&r));
        assert!(cond("A", "{#IFNAME}", "^lo", "NOT_MATCHES_REGEX").evaluate(&r));
        assert!(cond("A", "{#IFNAME}", "th", "LIKE").evaluate(&r));
        assert!(cond("A", "{#IFNAME}", "lo", "3").evaluate(&r));
        assert!(cond("A", "{#IFTYPE}", "6", "EQUALS").evaluate(&r));
        assert!(cond("A", "{#IFTYPE}", "24", "NOT_EQUALS").evaluate(&r));
        assert!(cond("A", "{#IFTYPE}", "6", "SOMETHING_NEW").evaluate(&r));
        assert!(!cond("A", "{#IFNAME}", "(", "MATCHES_REGEX").evaluate(&r));
    }

    #[test]
    fn evaltypes() {
        let r = row(&[("{#A}", "x"), ("{#B}", "y")]);
        let mut f = DiscoveryFilter {
            evaltype: "AND".into(),
            formula: String::new(),
            conditions: vec![cond("A", "{#A}", "x", "EQUALS"), cond("B", "{#B}", "x", "EQUALS")],
        };
        assert!(!f.matches(&r));

        f.evaltype = "OR".into();
        assert!(f.matches(&r));

        f.evaltype = "FORMULA".into();
        f.formula = "A and not B".into();
        assert!(f.matches(&r));

        f.formula = "A and B".into();
        assert!(!f.matches(&r));

        f.formula = String::new();
        assert!(f.matches(&r));

        f.evaltype = "0".into();
        f.formula = "(A or B) AND NOT B".into();
        assert!(f.matches(&r));

        assert!(DiscoveryFilter::default().matches(&r));
    }

    #[test]
    fn positional_ids() {
        let r = row(&[("{#A}", "x")]);
        let f = DiscoveryFilter {
            evaltype: "3".into(),
            formula: "condition_0 || condition_1".into(),
            conditions: vec![cond("", "{#A}", "nope", "EQUALS"), cond("", "{#A}", "x", "EQUALS")],
        };
        assert!(f.matches(&r));
    }

    #[test]
    fn bad_formula_is_false() {
        let values: HashMap<&str, bool> = [("A", true)].into_iter().collect();
        assert!(evaluate_formula("A and", &values).is_err());
        assert!(evaluate_formula("A and Z", &values).is_err());
        assert!(evaluate_formula("(A", &values).is_err());
        assert!(evaluate_formula("A B", &values).is_err());
        assert_eq!(evaluate_formula("!A || A", &values), Ok(true));

        let f = DiscoveryFilter {
            evaltype: "FORMULA".into(),
            formula: "A and Z".into(),
            conditions: vec![cond("A", "{#A}", "", "EQUALS")],
        };
        assert!(!f.matches(&BTreeMap::new()));
    }
}
