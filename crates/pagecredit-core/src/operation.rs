//! The closed set of document operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BillingError;

/// A billable document operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Merge documents.
    Merge,
    /// Split a document into parts.
    Split,
    /// Compress a document.
    Compress,
    /// Rotate pages.
    Rotate,
    /// Stamp a watermark.
    Watermark,
    /// Password-protect a document.
    Protect,
    /// Remove password protection.
    Unlock,
    /// Convert to or from PDF.
    Convert,
    /// Optical character recognition.
    Ocr,
}

impl Operation {
    /// Every supported operation.
    pub const ALL: [Self; 9] = [
        Self::Merge,
        Self::Split,
        Self::Compress,
        Self::Rotate,
        Self::Watermark,
        Self::Protect,
        Self::Unlock,
        Self::Convert,
        Self::Ocr,
    ];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Split => "split",
            Self::Compress => "compress",
            Self::Rotate => "rotate",
            Self::Watermark => "watermark",
            Self::Protect => "protect",
            Self::Unlock => "unlock",
            Self::Convert => "convert",
            Self::Ocr => "ocr",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| BillingError::InvalidOperation(s.to_string()))
    }
}
