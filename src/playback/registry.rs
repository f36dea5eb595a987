//! # Active-Unit Registry
//!
//! Tracks every unit that is scheduled or playing, so the engine can silence
//! everything at once (barge-in, context switch) and answer "is anything
//! still audible".

use crate::playback::decoder::PcmBuffer;
use crate::playback::device::{RenderDevice, UnitHandle};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A decoded buffer placed on the device.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub handle: UnitHandle,
    pub buffer: Arc<PcmBuffer>,
    /// Device clock time the unit starts at
    pub start_time: f64,
    /// Owning turn; `None` for one-shot clips such as the greeting
    pub context_id: Option<String>,
}

impl PlaybackUnit {
    pub fn duration(&self) -> f64 {
        self.buffer.duration()
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
}

/// Units keyed by device handle. Handles grow monotonically, so iteration
/// follows scheduling order.
#[derive(Debug, Default)]
pub struct ActiveUnitRegistry {
    units: BTreeMap<UnitHandle, PlaybackUnit>,
}

impl ActiveUnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, unit: PlaybackUnit) {
        self.units.insert(unit.handle, unit);
    }

    /// Remove a unit after the device reports its end. Unknown handles
    /// (units already flushed by `stop_all`) are ignored.
    pub fn deregister(&mut self, handle: UnitHandle) -> Option<PlaybackUnit> {
        self.units.remove(&handle)
    }

    pub fn count(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, handle: UnitHandle) -> bool {
        self.units.contains_key(&handle)
    }

    /// Registered units in scheduling order.
    pub fn units(&self) -> impl Iterator<Item = &PlaybackUnit> {
        self.units.values()
    }

    /// Units belonging to one turn.
    pub fn count_for(&self, context_id: &str) -> usize {
        self.units
            .values()
            .filter(|unit| unit.context_id.as_deref() == Some(context_id))
            .count()
    }

    /// Halt every registered unit, then forget them all.
    ///
    /// Every halt is issued before this returns. A unit that already
    /// finished may make the device complain; that is expected and ignored.
    /// Returns how many units were halted.
    pub fn stop_all<D: RenderDevice + ?Sized>(&mut self, device: &mut D) -> usize {
        let count = self.units.len();
        for (handle, _) in std::mem::take(&mut self.units) {
            if let Err(err) = device.stop(handle) {
                debug!(handle = handle.0, error = %err, "Unit was already halted");
            }
        }
        count
    }

    /// Drop all bookkeeping without touching the device.
    pub fn clear(&mut self) {
        self.units.clear();
    }
}
