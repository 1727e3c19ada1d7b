//! Level mapping: cumulative honor to level, xp and progress.
//!
//! The table is an ordered set of honor thresholds, each marking the honor at
//! which a level begins. Lookups are floor/ceiling queries over that set.
//!
//! The table is only ever replaced wholesale through `reload`. The highest
//! level ever configured is tracked separately and never decreases.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One row of the level ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelMapping {
    /// Level number, starting at 1
    pub level: u32,
    /// Cumulative honor at which this level begins
    pub threshold: u64,
}

impl LevelMapping {
    /// Returned by `next_level` when there is no further level
    pub const SENTINEL: LevelMapping = LevelMapping {
        level: 1,
        threshold: 0,
    };

    pub fn new(level: u32, threshold: u64) -> Self {
        Self { level, threshold }
    }
}

/// Derived level state for a subject; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressionSnapshot {
    pub level: u32,
    /// Honor earned beyond the current level's threshold
    pub xp: u64,
}

impl ProgressionSnapshot {
    pub const BASE: ProgressionSnapshot = ProgressionSnapshot { level: 1, xp: 0 };
}

/// Rejected level configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LevelTableError {
    #[error("level 0 is not a valid level (threshold {threshold})")]
    ZeroLevel { threshold: u64 },

    #[error("threshold {threshold} is assigned to both level {first} and level {second}")]
    DuplicateThreshold { threshold: u64, first: u32, second: u32 },

    #[error("level {level} at threshold {threshold} does not exceed level {previous} below it")]
    NotIncreasing {
        level: u32,
        threshold: u64,
        previous: u32,
    },
}

/// Ordered threshold -> level table
#[derive(Debug, Clone, Default)]
pub struct LevelMappingTable {
    by_threshold: BTreeMap<u64, LevelMapping>,
    max_level: u32,
}

impl LevelMappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[LevelMapping]) -> Result<Self, LevelTableError> {
        let mut table = Self::new();
        table.reload(entries)?;
        Ok(table)
    }

    /// Replace the whole table.
    ///
    /// Entries may arrive in any order. Invalid input leaves the current
    /// table untouched. Returns the number of levels now configured.
    pub fn reload(&mut self, entries: &[LevelMapping]) -> Result<usize, LevelTableError> {
        let staged = Self::stage(entries)?;

        let configured_max = entries.iter().map(|e| e.level).max().unwrap_or(0);
        self.max_level = self.max_level.max(configured_max);
        self.by_threshold = staged;

        debug!(
            "Level table reloaded: {} levels, max level {}",
            self.by_threshold.len(),
            self.max_level
        );
        Ok(self.by_threshold.len())
    }

    fn stage(entries: &[LevelMapping]) -> Result<BTreeMap<u64, LevelMapping>, LevelTableError> {
        let mut staged = BTreeMap::new();
        for entry in entries {
            if entry.level == 0 {
                return Err(LevelTableError::ZeroLevel {
                    threshold: entry.threshold,
                });
            }
            if let Some(existing) = staged.insert(entry.threshold, *entry) {
                return Err(LevelTableError::DuplicateThreshold {
                    threshold: entry.threshold,
                    first: existing.level,
                    second: entry.level,
                });
            }
        }

        // Thresholds are now ascending; levels must ascend with them
        let mut previous: Option<&LevelMapping> = None;
        for mapping in staged.values() {
            if let Some(prev) = previous {
                if mapping.level <= prev.level {
                    return Err(LevelTableError::NotIncreasing {
                        level: mapping.level,
                        threshold: mapping.threshold,
                        previous: prev.level,
                    });
                }
            }
            previous = Some(mapping);
        }

        Ok(staged)
    }

    /// Highest level ever configured, across all reloads
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn len(&self) -> usize {
        self.by_threshold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_threshold.is_empty()
    }

    /// Configured levels in threshold order
    pub fn entries(&self) -> impl Iterator<Item = &LevelMapping> {
        self.by_threshold.values()
    }

    /// Greatest threshold <= honor
    fn floor(&self, honor: u64) -> Option<&LevelMapping> {
        self.by_threshold.range(..=honor).next_back().map(|(_, m)| m)
    }

    /// Smallest threshold >= honor
    fn ceiling(&self, honor: u64) -> Option<&LevelMapping> {
        self.by_threshold.range(honor..).next().map(|(_, m)| m)
    }

    /// Level and leftover xp for a cumulative honor value
    pub fn level_and_xp(&self, honor: u64) -> ProgressionSnapshot {
        if honor == 0 {
            return ProgressionSnapshot::BASE;
        }
        match self.floor(honor) {
            Some(current) => ProgressionSnapshot {
                level: current.level,
                xp: honor - current.threshold,
            },
            None => ProgressionSnapshot::BASE,
        }
    }

    /// The next level above the one `honor` sits in, if any.
    ///
    /// A subject exactly on a threshold needs the threshold above it, so the
    /// ceiling query is offset by one when xp is zero.
    pub fn try_next_level(&self, honor: u64) -> Option<LevelMapping> {
        let snapshot = self.level_and_xp(honor);
        let target = if snapshot.xp == 0 {
            honor.checked_add(1)?
        } else {
            honor
        };
        self.ceiling(target).copied()
    }

    /// Like `try_next_level`, but returns `LevelMapping::SENTINEL` at max level
    pub fn next_level(&self, honor: u64) -> LevelMapping {
        self.try_next_level(honor).unwrap_or(LevelMapping::SENTINEL)
    }

    /// Fraction of the way from the current threshold to the next, in [0, 1]
    pub fn progress_to_next_level(&self, honor: u64) -> f64 {
        if honor == 0 {
            return 0.0;
        }
        let (current, next) = match (self.floor(honor), self.try_next_level(honor)) {
            (Some(current), Some(next)) => (current, next),
            _ => return 1.0,
        };

        let diff = next.threshold.saturating_sub(current.threshold);
        if diff == 0 {
            return 1.0;
        }
        let progress = (honor - current.threshold) as f64 / diff as f64;
        progress.clamp(0.0, 1.0)
    }
}
