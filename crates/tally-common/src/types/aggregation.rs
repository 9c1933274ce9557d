//! Aggregation kinds

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TallyError;

/// The aggregation function a meter applies to matched events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AggregationKind {
    Count,
    Sum,
    Avg,
    Max,
    Min,
    Range,
    Func,
    Unique,
    Duration,
}

/// Scalar type a kind needs out of the event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    /// Only the occurrence matters
    None,
    Number,
    Text,
}

impl AggregationKind {
    pub const ALL: [AggregationKind; 9] = [
        AggregationKind::Count,
        AggregationKind::Sum,
        AggregationKind::Avg,
        AggregationKind::Max,
        AggregationKind::Min,
        AggregationKind::Range,
        AggregationKind::Func,
        AggregationKind::Unique,
        AggregationKind::Duration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationKind::Count => "count",
            AggregationKind::Sum => "sum",
            AggregationKind::Avg => "avg",
            AggregationKind::Max => "max",
            AggregationKind::Min => "min",
            AggregationKind::Range => "range",
            AggregationKind::Func => "func",
            AggregationKind::Unique => "unique",
            AggregationKind::Duration => "duration",
        }
    }

    /// What has to be extracted from an event to fold it into a reading
    pub fn sample_type(&self) -> SampleType {
        match self {
            AggregationKind::Count => SampleType::None,
            AggregationKind::Sum
            | AggregationKind::Avg
            | AggregationKind::Max
            | AggregationKind::Min
            | AggregationKind::Range
            | AggregationKind::Func
            | AggregationKind::Duration => SampleType::Number,
            AggregationKind::Unique => SampleType::Text,
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationKind {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AggregationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TallyError::UnknownAggregationKind(s.to_string()))
    }
}

impl TryFrom<String> for AggregationKind {
    type Error = TallyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AggregationKind> for String {
    fn from(kind: AggregationKind) -> Self {
        kind.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for kind in AggregationKind::ALL {
            assert_eq!(kind.as_str().parse::<AggregationKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        let err = "median".parse::<AggregationKind>().unwrap_err();
        assert!(matches!(err, TallyError::UnknownAggregationKind(ref k) if k == "median"));
    }

    #[test]
    fn test_serde_rejects_unknown() {
        assert!(serde_json::from_str::<AggregationKind>("\"p99\"").is_err());
        let kind: AggregationKind = serde_json::from_str("\"avg\"").unwrap();
        assert_eq!(kind, AggregationKind::Avg);
    }
}
