//! Progression service: the live level table plus display refresh.
//!
//! Queries take a read lock; `reload_mappings` swaps the whole table under a
//! single write lock, then asks the presence registry to refresh every
//! connected subject. The table and the transaction queues share no state.

use ledger_common::{
    detect_level_up, LevelMapping, LevelMappingTable, LevelRecord, LevelTableError, LevelUp,
    ProgressionSnapshot, SubjectId,
};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, info};

/// Knows who is connected and how to redraw their progression display
pub trait PresenceRegistry: Send + Sync {
    fn connected_subjects(&self) -> Vec<SubjectId>;

    fn refresh_progression(&self, subject: &SubjectId);
}

/// Registry with nobody connected
pub struct NoPresence;

impl PresenceRegistry for NoPresence {
    fn connected_subjects(&self) -> Vec<SubjectId> {
        Vec::new()
    }

    fn refresh_progression(&self, _subject: &SubjectId) {}
}

/// Everything a progression display needs for one honor value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressionView {
    pub honor: u64,
    pub level: u32,
    pub xp: u64,
    /// None at max level
    pub next_level: Option<LevelMapping>,
    pub progress: f64,
}

pub struct ProgressionService {
    table: RwLock<LevelMappingTable>,
    presence: Arc<dyn PresenceRegistry>,
}

impl ProgressionService {
    pub fn new(presence: Arc<dyn PresenceRegistry>) -> Self {
        Self {
            table: RwLock::new(LevelMappingTable::new()),
            presence,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LevelMappingTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the level table and refresh every connected subject.
    ///
    /// On invalid input the current table stays and nobody is refreshed.
    pub fn reload_mappings(&self, entries: &[LevelMapping]) -> Result<usize, LevelTableError> {
        let (levels, max_level) = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let levels = table.reload(entries)?;
            (levels, table.max_level())
        };
        info!("Loaded {} level mappings (max level {})", levels, max_level);

        let subjects = self.presence.connected_subjects();
        debug!("Refreshing progression for {} connected subjects", subjects.len());
        for subject in &subjects {
            self.presence.refresh_progression(subject);
        }
        Ok(levels)
    }

    pub fn level_and_xp(&self, honor: u64) -> ProgressionSnapshot {
        self.read().level_and_xp(honor)
    }

    pub fn next_level(&self, honor: u64) -> LevelMapping {
        self.read().next_level(honor)
    }

    pub fn progress_to_next_level(&self, honor: u64) -> f64 {
        self.read().progress_to_next_level(honor)
    }

    pub fn max_level(&self) -> u32 {
        self.read().max_level()
    }

    /// All lookups for one honor value against a single table version
    pub fn view(&self, honor: u64) -> ProgressionView {
        let table = self.read();
        let snapshot = table.level_and_xp(honor);
        ProgressionView {
            honor,
            level: snapshot.level,
            xp: snapshot.xp,
            next_level: table.try_next_level(honor),
            progress: table.progress_to_next_level(honor),
        }
    }

    /// Compute the subject's level and update its session record
    pub fn observe(&self, record: &mut LevelRecord, honor: u64) -> Option<LevelUp> {
        let level = self.level_and_xp(honor).level;
        let level_up = detect_level_up(record, level);
        if let Some(up) = level_up {
            debug!("Level up {} -> {}", up.from, up.to);
        }
        level_up
    }
}
