//! SNMP sessions as seen by the rest of the crate.
//!
//! The connection manager, collector and discovery engine only talk to the
//! [`Session`] and [`Connector`] traits. [`client::SnmpConnector`]
//! implements them for v1, v2c and v3 over UDP or TCP.

pub mod ber;
pub mod client;
pub mod usm;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::AgentEndpoint;
use crate::error::TransportError;

/// OID used for liveness checks (sysUpTime.0).
pub const SYS_UPTIME_OID: &str = "1.3.6.1.2.1.1.3.0";

/// Parsed OID components.
pub type OidComponents = SmallVec<[u32; 16]>;

#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectIdentifier(String),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl SnmpValue {
    /// True for the v2 exception values.
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            SnmpValue::NoSuchObject | SnmpValue::NoSuchInstance | SnmpValue::EndOfMibView
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarBind {
    pub oid: String,
    pub value: SnmpValue,
}

impl VarBind {
    pub fn new(oid: impl Into<String>, value: SnmpValue) -> Self {
        Self {
            oid: oid.into(),
            value,
        }
    }
}

/// One live session bound to an agent.
#[async_trait]
pub trait Session: Send + Sync {
    /// GET every OID in one request. Results follow the request order.
    async fn get(&self, oids: &[String]) -> Result<Vec<VarBind>, TransportError>;

    /// Walk the subtree under `root`, in OID order.
    async fn walk(&self, root: &str) -> Result<Vec<VarBind>, TransportError>;

    async fn close(&self);
}

/// Opens sessions for endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &AgentEndpoint) -> Result<Arc<dyn Session>, TransportError>;
}

/// Parse a dotted OID, tolerating a leading dot.
pub fn parse_oid(oid: &str) -> Result<OidComponents, TransportError> {
    let trimmed = oid.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return Err(TransportError::Encode(format!("empty OID '{}'", oid)));
    }
    trimmed
        .split('.')
        .map(|c| {
            c.parse::<u32>()
                .map_err(|_| TransportError::Encode(format!("invalid OID '{}'", oid)))
        })
        .collect()
}

pub fn format_oid(components: &[u32]) -> String {
    let mut out = String::with_capacity(components.len() * 4);
    for (i, c) in components.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push_str(&c.to_string());
    }
    out
}

/// Normalized dotted form: no leading dot, no surrounding whitespace.
pub fn normalize_oid(oid: &str) -> &str {
    oid.trim().trim_start_matches('.')
}

/// The part of `oid` below `root`, if `oid` lies strictly inside the subtree.
/// Prefixes only match on component boundaries.
pub fn oid_suffix<'a>(oid: &'a str, root: &str) -> Option<&'a str> {
    let oid = normalize_oid(oid);
    let root = normalize_oid(root).trim_end_matches('.');
    let rest = oid.strip_prefix(root)?;
    let rest = rest.strip_prefix('.')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Numeric ordering of dotted OIDs. Unparsable components sort as zero.
pub fn compare_oids(a: &str, b: &str) -> Ordering {
    let left = normalize_oid(a).split('.').map(|c| c.parse::<u32>().unwrap_or(0));
    let right = normalize_oid(b).split('.').map(|c| c.parse::<u32>().unwrap_or(0));
    left.cmp(right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_parsing() {
        assert_eq!(parse_oid(".1.3.6.1").unwrap().as_slice(), &[1, 3, 6, 1]);
        assert!(parse_oid("").is_err());
        assert!(parse_oid("1.3.x").is_err());
        assert_eq!(format_oid(&[1, 3, 6, 1, 2]), "1.3.6.1.2");
    }

    #[test]
    fn suffix_respects_component_boundaries() {
        let root = "1.3.6.1.2.1.2.2.1.1";
        assert_eq!(oid_suffix("1.3.6.1.2.1.2.2.1.1.5", root), Some("5"));
        assert_eq!(oid_suffix(".1.3.6.1.2.1.2.2.1.1.5.7", root), Some("5.7"));
        assert_eq!(oid_suffix("1.3.6.1.2.1.2.2.1.10.5", root), None);
        assert_eq!(oid_suffix(root, root), None);
    }

    #[test]
    fn numeric_ordering() {
        assert_eq!(compare_oids("1.3.6.1.10", "1.3.6.1.9"), Ordering::Greater);
        assert_eq!(compare_oids("1.3.6.1", "1.3.6.1.0"), Ordering::Less);
        assert_eq!(compare_oids(".1.3", "1.3"), Ordering::Equal);
    }
}
