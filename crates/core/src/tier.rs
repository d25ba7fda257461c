//! Fallback tiers, error classes and task complexity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One ranked option in the fallback chain, ordered by preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    PrimaryRemote,
    SecondaryRemote,
    Local,
    Queued,
}

impl FallbackTier {
    /// Every tier in walk order.
    pub const ALL: [FallbackTier; 4] = [
        FallbackTier::PrimaryRemote,
        FallbackTier::SecondaryRemote,
        FallbackTier::Local,
        FallbackTier::Queued,
    ];

    /// The tier tried after this one, if any.
    pub fn next(self) -> Option<FallbackTier> {
        match self {
            Self::PrimaryRemote => Some(Self::SecondaryRemote),
            Self::SecondaryRemote => Some(Self::Local),
            Self::Local => Some(Self::Queued),
            Self::Queued => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryRemote => "primary_remote",
            Self::SecondaryRemote => "secondary_remote",
            Self::Local => "local",
            Self::Queued => "queued",
        }
    }

    /// Whether this tier talks to a remote backend.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::PrimaryRemote | Self::SecondaryRemote)
    }
}

impl fmt::Display for FallbackTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the fallback chain should do after a tier failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Try the same tier again.
    RetryableSameTier,
    /// Move on to the next tier.
    AdvanceTier,
    /// Move on, but never into the local tier.
    SkipLocalTier,
    /// Stop the walk and surface the error.
    Terminal,
}

/// How demanding an inbound request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    SimpleAck,
    StatusQuery,
    Complex,
}

impl TaskComplexity {
    /// The first tier worth trying for this complexity.
    pub fn starting_tier(self) -> FallbackTier {
        match self {
            Self::SimpleAck | Self::StatusQuery => FallbackTier::Local,
            Self::Complex => FallbackTier::PrimaryRemote,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SimpleAck => "simple_ack",
            Self::StatusQuery => "status_query",
            Self::Complex => "complex",
        }
    }
}

impl fmt::Display for TaskComplexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered_by_preference() {
        assert!(FallbackTier::PrimaryRemote < FallbackTier::SecondaryRemote);
        assert!(FallbackTier::SecondaryRemote < FallbackTier::Local);
        assert!(FallbackTier::Local < FallbackTier::Queued);
    }

    #[test]
    fn next_walks_all_tiers() {
        let mut walked = vec![FallbackTier::PrimaryRemote];
        while let Some(next) = walked.last().and_then(|t| t.next()) {
            walked.push(next);
        }
        assert_eq!(walked, FallbackTier::ALL.to_vec());
    }

    #[test]
    fn complex_starts_at_primary() {
        assert_eq!(
            TaskComplexity::Complex.starting_tier(),
            FallbackTier::PrimaryRemote
        );
        assert_eq!(TaskComplexity::SimpleAck.starting_tier(), FallbackTier::Local);
        assert_eq!(
            TaskComplexity::StatusQuery.starting_tier(),
            FallbackTier::Local
        );
    }

    #[test]
    fn tier_serializes_snake_case() {
        let json = serde_json::to_string(&FallbackTier::SecondaryRemote).unwrap();
        assert_eq!(json, "\"secondary_remote\"");
        assert_eq!(FallbackTier::Queued.to_string(), "queued");
    }
}
