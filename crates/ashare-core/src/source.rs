use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Canonical provider identifiers used for registry keys, statistics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Sse,
    Szse,
    Eastmoney,
}

impl SourceKind {
    pub const ALL: [Self; 3] = [Self::Sse, Self::Szse, Self::Eastmoney];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::Szse => "szse",
            Self::Eastmoney => "eastmoney",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sse" => Ok(Self::Sse),
            "szse" => Ok(Self::Szse),
            "eastmoney" => Ok(Self::Eastmoney),
            other => Err(ValidationError::InvalidSource {
                value: other.to_owned(),
            }),
        }
    }
}
