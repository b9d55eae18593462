pub mod collector;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod instance;
pub mod item;
pub mod labels;
pub mod preprocess;
pub mod scheduler;
pub mod snmp;
pub mod storage;
pub mod template;
pub mod timing;

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use std::collections::BTreeMap;

    /// Tag set of an observation, ordered for stable output
    pub type Tags = BTreeMap<String, String>;

    /// A single observation pushed to the sink
    #[derive(Debug, Clone, Serialize)]
    pub struct Sample {
        pub timestamp: DateTime<Utc>,
        pub metric: String,
        pub value: SampleValue,
        pub labels: Tags,
    }

    impl Sample {
        pub fn new(metric: impl Into<String>, value: SampleValue, labels: Tags) -> Self {
            Self {
                timestamp: Utc::now(),
                metric: metric.into(),
                value,
                labels,
            }
        }
    }

    /// Observation value
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(untagged)]
    pub enum SampleValue {
        Float(f64),
        Uint(u64),
        Int(i64),
        Text(String),
    }

    impl SampleValue {
        pub fn as_f64(&self) -> Option<f64> {
            match self {
                SampleValue::Float(v) => Some(*v),
                SampleValue::Uint(v) => Some(*v as f64),
                SampleValue::Int(v) => Some(*v as f64),
                SampleValue::Text(s) => s.trim().parse().ok(),
            }
        }
    }

    impl std::fmt::Display for SampleValue {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                SampleValue::Float(v) => write!(f, "{}", v),
                SampleValue::Uint(v) => write!(f, "{}", v),
                SampleValue::Int(v) => write!(f, "{}", v),
                SampleValue::Text(s) => write!(f, "{}", s),
            }
        }
    }
}
