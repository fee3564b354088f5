//! Log/metric narrowing applied on the delivery path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::{EncodedEnvelope, EnvelopeKind};

/// Narrows a stream to one class of envelope.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Everything passes
    #[default]
    None,
    /// Only log messages pass
    LogsOnly,
    /// Only metric samples pass
    MetricsOnly,
}

impl Filter {
    /// Parse the `filter-type` query parameter.
    ///
    /// Unknown or missing values mean no filtering.
    #[must_use]
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("logs") => Self::LogsOnly,
            Some("metrics") => Self::MetricsOnly,
            _ => Self::None,
        }
    }

    /// Whether an envelope of `kind` is kept
    #[must_use]
    pub const fn keeps_kind(self, kind: EnvelopeKind) -> bool {
        match self {
            Self::None => true,
            Self::LogsOnly => kind.is_log(),
            Self::MetricsOnly => kind.is_metric(),
        }
    }

    /// Whether `envelope` is kept
    #[must_use]
    pub const fn keeps(self, envelope: &EncodedEnvelope) -> bool {
        self.keeps_kind(envelope.kind())
    }

    /// Metric label for this filter
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::LogsOnly => "logs",
            Self::MetricsOnly => "metrics",
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
