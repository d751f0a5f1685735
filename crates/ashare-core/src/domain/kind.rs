use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Kind of market data a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    SseStocks,
    SzseStocks,
    Index,
    LimitUp,
    LimitDown,
}

impl DataKind {
    pub const ALL: [Self; 5] = [
        Self::SseStocks,
        Self::SzseStocks,
        Self::Index,
        Self::LimitUp,
        Self::LimitDown,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SseStocks => "sse_stocks",
            Self::SzseStocks => "szse_stocks",
            Self::Index => "index",
            Self::LimitUp => "limit_up",
            Self::LimitDown => "limit_down",
        }
    }
}

impl Display for DataKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or(ValidationError::InvalidDataKind { value: normalized })
    }
}
