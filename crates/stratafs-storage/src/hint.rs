//! Per-file write-lifetime hints and the zone matching rule built on them.
//!
//! The allocator colocates data of similar expected lifetime so that whole
//! zones age out together, keeping future relocation cost down.

use serde::{Deserialize, Serialize};

/// Advisory write-lifetime hint attached to files and zones.
///
/// Ordering matters: a larger value means the data is expected to stay live
/// for longer, and the allocator compares hints numerically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u32)]
pub enum WriteLifetimeHint {
    /// No hint was ever provided.
    #[default]
    NotSet = 0,
    /// Explicitly no expectation.
    None = 1,
    /// Short-lived data (WAL-like).
    Short = 2,
    /// Medium-lived data.
    Medium = 3,
    /// Long-lived data.
    Long = 4,
    /// Data expected to stay live for the lifetime of the store.
    Extreme = 5,
}

impl WriteLifetimeHint {
    /// Decodes a hint from its wire representation.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::NotSet),
            1 => Some(Self::None),
            2 => Some(Self::Short),
            3 => Some(Self::Medium),
            4 => Some(Self::Long),
            5 => Some(Self::Extreme),
            _ => None,
        }
    }

    /// Wire representation of the hint.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Score for a zone whose hint makes it a bad home for the file.
pub const LIFETIME_DIFF_NOT_GOOD: u32 = 100;
/// Score for an exact hint match; usable but not ideal, since mixing equal
/// hints still spreads one file across many zones.
pub const LIFETIME_DIFF_MEH: u32 = 2;

/// Scores how well a zone's lifetime hint fits a file's. Lower is better.
///
/// Files without a usable hint (`NotSet`/`None`) only match zones carrying
/// the same non-hint, so hinted zones are never polluted by unhinted data.
/// Otherwise zones expected to outlive the file score by the distance, and
/// zones expected to die sooner than the file are rejected outright.
pub fn lifetime_diff(zone_lifetime: WriteLifetimeHint, file_lifetime: WriteLifetimeHint) -> u32 {
    if file_lifetime == WriteLifetimeHint::NotSet || file_lifetime == WriteLifetimeHint::None {
        if file_lifetime == zone_lifetime {
            return 0;
        }
        return LIFETIME_DIFF_NOT_GOOD;
    }

    if zone_lifetime == file_lifetime {
        return LIFETIME_DIFF_MEH;
    }

    if zone_lifetime > file_lifetime {
        return zone_lifetime.as_u32() - file_lifetime.as_u32();
    }

    LIFETIME_DIFF_NOT_GOOD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_roundtrip() {
        for v in 0..=5u32 {
            let hint = WriteLifetimeHint::from_u32(v).unwrap();
            assert_eq!(hint.as_u32(), v);
        }
        assert!(WriteLifetimeHint::from_u32(6).is_none());
    }

    #[test]
    fn test_unhinted_file_matches_only_same_hint() {
        use WriteLifetimeHint::*;
        assert_eq!(lifetime_diff(NotSet, NotSet), 0);
        assert_eq!(lifetime_diff(None, None), 0);
        assert_eq!(lifetime_diff(None, NotSet), LIFETIME_DIFF_NOT_GOOD);
        assert_eq!(lifetime_diff(Medium, NotSet), LIFETIME_DIFF_NOT_GOOD);
        assert_eq!(lifetime_diff(Short, None), LIFETIME_DIFF_NOT_GOOD);
    }

    #[test]
    fn test_hinted_file_scoring() {
        use WriteLifetimeHint::*;
        assert_eq!(lifetime_diff(Short, Short), LIFETIME_DIFF_MEH);
        assert_eq!(lifetime_diff(Extreme, Short), 3);
        assert_eq!(lifetime_diff(Long, Medium), 1);
        // Zone expected to die before the file is a bad match.
        assert_eq!(lifetime_diff(Short, Long), LIFETIME_DIFF_NOT_GOOD);
        assert_eq!(lifetime_diff(NotSet, Medium), LIFETIME_DIFF_NOT_GOOD);
    }
}
