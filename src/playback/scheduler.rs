//! # Playback Scheduler
//!
//! Places decoded fragments back-to-back on the rendering device so that a
//! turn plays without gaps or clicks between fragments.
//!
//! ## Key Ideas:
//! - **Cursor**: the device-clock time at which the next unit must start.
//!   Each scheduled unit advances it by the unit's duration. Unset until the
//!   first unit of a turn.
//! - **Pre-buffering**: with the cursor unset, nothing is scheduled until
//!   `min_buffer_chunks` fragments are queued. This trades a small, fixed
//!   startup delay for jitter-free steady state.
//! - **Busy flag**: `drain` is guarded so two drain passes never work the
//!   FIFO at once, including while a device resume is in flight.

use crate::error::{DeviceError, PlaybackError};
use crate::playback::decoder::FragmentDecoder;
use crate::playback::device::{DeviceState, RenderDevice, UnitHandle};
use crate::playback::registry::{ActiveUnitRegistry, PlaybackUnit};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// One transport-delivered unit of encoded audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub context_id: String,
    pub sequence_index: Option<u64>,
    /// Transport-encoded (base64) 16-bit PCM
    pub audio: String,
    pub is_final: bool,
}

/// Why a drain pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Everything queued was scheduled (or dropped as undecodable)
    Drained,
    /// Nothing queued
    Idle,
    /// Another pass holds the busy flag
    Busy,
    /// Waiting for `min_buffer_chunks` fragments before the first unit
    Prebuffering,
    /// Device is suspended; the caller must start a resume
    ResumeRequested,
    /// A resume is already in flight
    AwaitingResume,
    /// Device is closed; nothing was touched
    DeviceClosed,
}

/// Everything a drain pass did, for the engine to report.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub scheduled: Vec<UnitHandle>,
    pub errors: Vec<PlaybackError>,
    pub underruns: u32,
}

impl DrainReport {
    fn new(outcome: DrainOutcome) -> Self {
        Self {
            outcome,
            scheduled: Vec::new(),
            errors: Vec::new(),
            underruns: 0,
        }
    }
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    queue: VecDeque<Fragment>,
    busy: bool,
    cursor: Option<f64>,
    min_buffer_chunks: usize,
    /// Set once the current turn's end is known; short turns skip pre-buffering
    prebuffer_released: bool,
    resume_pending: bool,
}

impl PlaybackScheduler {
    pub fn new(min_buffer_chunks: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            busy: false,
            cursor: None,
            min_buffer_chunks,
            prebuffer_released: false,
            resume_pending: false,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_resume_pending(&self) -> bool {
        self.resume_pending
    }

    /// Next start time, `None` while unset.
    pub fn cursor(&self) -> Option<f64> {
        self.cursor
    }

    /// Audio scheduled but not yet played, in seconds. Never negative.
    pub fn buffered_ahead(&self, now: f64) -> f64 {
        self.cursor.map(|cursor| (cursor - now).max(0.0)).unwrap_or(0.0)
    }

    /// Let the current turn start even below the pre-buffer threshold.
    pub fn release_prebuffer(&mut self) {
        self.prebuffer_released = true;
    }

    /// Append a fragment and drain unless a pass is already running.
    pub fn enqueue<D: RenderDevice + ?Sized>(
        &mut self,
        fragment: Fragment,
        device: &mut D,
        decoder: &FragmentDecoder,
        registry: &mut ActiveUnitRegistry,
    ) -> DrainReport {
        self.queue.push_back(fragment);
        self.drain(device, decoder, registry)
    }

    /// Schedule every queued fragment back-to-back.
    ///
    /// ## Steps:
    /// 1. Bail out on a closed device, a running pass, or a pending resume
    /// 2. Ask for a resume if the device is suspended (fragments stay queued)
    /// 3. Hold off while pre-buffering
    /// 4. Pop, decode, schedule at the cursor, advance, register
    /// 5. Release the busy flag and re-check the FIFO
    pub fn drain<D: RenderDevice + ?Sized>(
        &mut self,
        device: &mut D,
        decoder: &FragmentDecoder,
        registry: &mut ActiveUnitRegistry,
    ) -> DrainReport {
        let state = device.state();
        if state == DeviceState::Closed {
            return DrainReport::new(DrainOutcome::DeviceClosed);
        }
        if self.busy {
            return DrainReport::new(DrainOutcome::Busy);
        }
        if self.resume_pending {
            return DrainReport::new(DrainOutcome::AwaitingResume);
        }
        if self.queue.is_empty() {
            return DrainReport::new(DrainOutcome::Idle);
        }
        if state.needs_resume() {
            self.request_resume();
            debug!(state = ?state, queued = self.queue.len(), "Device needs resume before scheduling");
            return DrainReport::new(DrainOutcome::ResumeRequested);
        }
        if self.cursor.is_none()
            && !self.prebuffer_released
            && self.queue.len() < self.min_buffer_chunks
        {
            debug!(
                queued = self.queue.len(),
                threshold = self.min_buffer_chunks,
                "Pre-buffering"
            );
            return DrainReport::new(DrainOutcome::Prebuffering);
        }

        self.busy = true;
        let mut report = DrainReport::new(DrainOutcome::Drained);

        while let Some(fragment) = self.queue.pop_front() {
            let buffer = match decoder.decode(&fragment.audio) {
                Ok(buffer) => Arc::new(buffer),
                Err(err) => {
                    warn!(
                        context_id = %fragment.context_id,
                        sequence_index = ?fragment.sequence_index,
                        error = %err,
                        "Dropping undecodable fragment"
                    );
                    report.errors.push(err.into());
                    continue;
                }
            };

            let now = device.current_time();
            let start_time = match self.cursor {
                None => now,
                Some(cursor) if cursor < now => {
                    report.underruns += 1;
                    warn!(
                        context_id = %fragment.context_id,
                        behind_ms = ((now - cursor) * 1000.0) as u64,
                        "Playback underrun, restarting at device time"
                    );
                    now
                }
                Some(cursor) => cursor,
            };

            match device.schedule(Arc::clone(&buffer), start_time) {
                Ok(handle) => {
                    self.cursor = Some(start_time + buffer.duration());
                    registry.register(PlaybackUnit {
                        handle,
                        buffer,
                        start_time,
                        context_id: Some(fragment.context_id),
                    });
                    report.scheduled.push(handle);
                }
                Err(DeviceError::Closed) => {
                    report.errors.push(DeviceError::Closed.into());
                    self.queue.clear();
                    break;
                }
                Err(err) => {
                    warn!(context_id = %fragment.context_id, error = %err, "Device refused fragment");
                    report.errors.push(err.into());
                }
            }
        }

        self.busy = false;
        if !self.queue.is_empty() {
            let more = self.drain(device, decoder, registry);
            report.scheduled.extend(more.scheduled);
            report.errors.extend(more.errors);
            report.underruns += more.underruns;
        }
        report
    }

    /// Mark a resume as in flight. Returns `false` if one already was.
    pub fn request_resume(&mut self) -> bool {
        !std::mem::replace(&mut self.resume_pending, true)
    }

    /// A resume finished (successfully or not); draining may continue.
    pub fn resume_finished(&mut self) {
        self.resume_pending = false;
    }

    /// Forget queued fragments and the cursor. A resume in flight stays in
    /// flight.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.cursor = None;
        self.busy = false;
        self.prebuffer_released = false;
        dropped
    }
}
