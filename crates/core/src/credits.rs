//! Billable operation kinds and the credit cost table.
//!
//! The table is built once at startup and is read-only afterwards. Every
//! lookup either yields a positive cost or fails with
//! [`CoreError::UnknownOperation`]; a zero-cost fallback is never implied.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Credits;

// ---------------------------------------------------------------------------
// Operation kinds
// ---------------------------------------------------------------------------

/// A billable generation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum OperationKind {
    Storyboard,
    Analysis,
    Avatar,
    VideoFast720,
    VideoFast1080,
    VideoStd720,
    VideoStd1080,
    ThreeDConversion,
    AudioAnalysis,
    ImageGeneration,
    RemixVideo,
    Sticker,
    Music,
}

impl OperationKind {
    /// Every known kind, in cost-table order.
    pub const ALL: [OperationKind; 13] = [
        OperationKind::Storyboard,
        OperationKind::Analysis,
        OperationKind::Avatar,
        OperationKind::VideoFast720,
        OperationKind::VideoFast1080,
        OperationKind::VideoStd720,
        OperationKind::VideoStd1080,
        OperationKind::ThreeDConversion,
        OperationKind::AudioAnalysis,
        OperationKind::ImageGeneration,
        OperationKind::RemixVideo,
        OperationKind::Sticker,
        OperationKind::Music,
    ];

    /// Wire and storage name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Storyboard => "storyboard",
            OperationKind::Analysis => "analysis",
            OperationKind::Avatar => "avatar",
            OperationKind::VideoFast720 => "video-fast-720",
            OperationKind::VideoFast1080 => "video-fast-1080",
            OperationKind::VideoStd720 => "video-std-720",
            OperationKind::VideoStd1080 => "video-std-1080",
            OperationKind::ThreeDConversion => "3d-conversion",
            OperationKind::AudioAnalysis => "audio-analysis",
            OperationKind::ImageGeneration => "image-generation",
            OperationKind::RemixVideo => "remix-video",
            OperationKind::Sticker => "sticker",
            OperationKind::Music => "music",
        }
    }

    /// Whether the kind produces a video asset.
    pub fn is_video(self) -> bool {
        matches!(
            self,
            OperationKind::VideoFast720
                | OperationKind::VideoFast1080
                | OperationKind::VideoStd720
                | OperationKind::VideoStd1080
                | OperationKind::RemixVideo
                | OperationKind::Storyboard
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownOperation(s.to_string()))
    }
}

impl TryFrom<String> for OperationKind {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OperationKind> for &'static str {
    fn from(kind: OperationKind) -> Self {
        kind.as_str()
    }
}

// ---------------------------------------------------------------------------
// Ledger entries
// ---------------------------------------------------------------------------

/// What moved credits on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum TransactionKind {
    /// Charge for a generation request.
    Debit,
    /// Reversal of a debit whose task failed.
    Refund,
    /// Operator top-up.
    Grant,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 3] = [
        TransactionKind::Debit,
        TransactionKind::Refund,
        TransactionKind::Grant,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Debit => "debit",
            TransactionKind::Refund => "refund",
            TransactionKind::Grant => "grant",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::Internal(format!("Unknown transaction kind '{s}'")))
    }
}

impl TryFrom<String> for TransactionKind {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransactionKind> for &'static str {
    fn from(kind: TransactionKind) -> Self {
        kind.as_str()
    }
}

// ---------------------------------------------------------------------------
// Cost table
// ---------------------------------------------------------------------------

/// Default credit costs, matching the published price list.
pub const DEFAULT_COSTS: [(OperationKind, Credits); 13] = [
    (OperationKind::Storyboard, 5),
    (OperationKind::Analysis, 3),
    (OperationKind::Avatar, 10),
    (OperationKind::VideoFast720, 15),
    (OperationKind::VideoFast1080, 25),
    (OperationKind::VideoStd720, 20),
    (OperationKind::VideoStd1080, 35),
    (OperationKind::ThreeDConversion, 20),
    (OperationKind::AudioAnalysis, 5),
    (OperationKind::ImageGeneration, 8),
    (OperationKind::RemixVideo, 15),
    (OperationKind::Sticker, 5),
    (OperationKind::Music, 12),
];

/// Immutable mapping from operation kind to a positive credit cost.
#[derive(Debug, Clone)]
pub struct CostTable {
    costs: HashMap<OperationKind, Credits>,
}

impl CostTable {
    /// Build a table from explicit entries.
    ///
    /// Rejects non-positive costs so that a misconfigured entry can never
    /// turn into free generation.
    pub fn new(
        entries: impl IntoIterator<Item = (OperationKind, Credits)>,
    ) -> Result<Self, CoreError> {
        let mut costs = HashMap::new();
        for (kind, cost) in entries {
            if cost <= 0 {
                return Err(CoreError::Validation(format!(
                    "Cost for '{kind}' must be positive, got {cost}"
                )));
            }
            costs.insert(kind, cost);
        }
        Ok(Self { costs })
    }

    /// Look up the cost of a kind.
    pub fn cost(&self, kind: OperationKind) -> Result<Credits, CoreError> {
        self.costs
            .get(&kind)
            .copied()
            .ok_or_else(|| CoreError::UnknownOperation(kind.to_string()))
    }

    /// Parse a wire name and look up its cost in one step.
    pub fn resolve(&self, name: &str) -> Result<(OperationKind, Credits), CoreError> {
        let kind: OperationKind = name.trim().parse()?;
        Ok((kind, self.cost(kind)?))
    }

    /// Iterate over all configured entries.
    pub fn entries(&self) -> impl Iterator<Item = (OperationKind, Credits)> + '_ {
        self.costs.iter().map(|(kind, cost)| (*kind, *cost))
    }
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            costs: DEFAULT_COSTS.into_iter().collect(),
        }
    }
}
