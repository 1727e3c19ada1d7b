//! Level-up detection for progression displays.

use serde::{Deserialize, Serialize};

/// Per-session level state, owned by whoever tracks connected subjects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRecord {
    pub previous_level: u32,
    /// True until the first progression display after connecting
    pub first_display: bool,
}

impl LevelRecord {
    pub fn new() -> Self {
        Self {
            previous_level: 1,
            first_display: true,
        }
    }
}

impl Default for LevelRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A level transition worth announcing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelUp {
    pub from: u32,
    pub to: u32,
}

/// Compare a freshly computed level with the recorded one.
///
/// Fires only after the first display, on an increase, and above level 1.
/// The record is updated whether or not anything fires.
pub fn detect_level_up(record: &mut LevelRecord, new_level: u32) -> Option<LevelUp> {
    let previous = record.previous_level;
    let fired = !record.first_display && new_level > previous && new_level > 1;

    record.previous_level = new_level;
    record.first_display = false;

    fired.then_some(LevelUp {
        from: previous,
        to: new_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_display_never_fires() {
        let mut record = LevelRecord::new();
        assert_eq!(detect_level_up(&mut record, 7), None);
        assert_eq!(record.previous_level, 7);
        assert!(!record.first_display);
    }

    #[test]
    fn test_increase_fires() {
        let mut record = LevelRecord {
            previous_level: 2,
            first_display: false,
        };
        assert_eq!(detect_level_up(&mut record, 3), Some(LevelUp { from: 2, to: 3 }));
        assert_eq!(record.previous_level, 3);
    }

    #[test]
    fn test_same_or_lower_level_is_silent() {
        let mut record = LevelRecord {
            previous_level: 4,
            first_display: false,
        };
        assert_eq!(detect_level_up(&mut record, 4), None);
        assert_eq!(detect_level_up(&mut record, 2), None);
        assert_eq!(record.previous_level, 2);
    }

    #[test]
    fn test_level_one_is_silent() {
        let mut record = LevelRecord {
            previous_level: 0,
            first_display: false,
        };
        assert_eq!(detect_level_up(&mut record, 1), None);
        assert_eq!(record.previous_level, 1);
    }
}
