//! # Rendering Devices
//!
//! The playback engine never talks to audio hardware directly; it drives a
//! `RenderDevice`. A device owns a clock (seconds since it was created,
//! frozen while suspended), accepts buffers scheduled at absolute clock
//! times, and reports each unit's end through a `DeviceEvent` channel.
//!
//! ## Implementations:
//! - **`VirtualDevice`**: keeps exact timing with tokio timers but renders
//!   nothing. Used by default and in tests (tokio's paused clock drives it).
//! - **`SpeakerDevice`** (feature `speaker`): mixes units into the default
//!   output device through cpal.
//!
//! ## Device States:
//! `Running` → `Suspended`/`Interrupted` (backgrounded, audio focus lost) →
//! `Running` again after `resume()`; `Closed` is terminal and every operation
//! on a closed device is a no-op.

use crate::error::DeviceError;
use crate::playback::decoder::PcmBuffer;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle state of a rendering device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Running,
    Suspended,
    Interrupted,
    Closed,
}

impl DeviceState {
    /// Needs an explicit `resume()` before new audio becomes audible.
    pub fn needs_resume(&self) -> bool {
        matches!(self, DeviceState::Suspended | DeviceState::Interrupted)
    }
}

/// Handle the device gives back for a scheduled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UnitHandle(pub u64);

/// Notifications a device sends back to its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The unit finished playing or was stopped
    Ended(UnitHandle),
}

/// Future returned by `RenderDevice::resume`.
pub type ResumeFuture = BoxFuture<'static, Result<(), DeviceError>>;

/// An audio output the scheduler can place buffers on.
pub trait RenderDevice {
    fn state(&self) -> DeviceState;

    /// Device clock in seconds.
    fn current_time(&self) -> f64;

    /// Start leaving the suspended state. The returned future resolves once
    /// the device is running again.
    fn resume(&mut self) -> ResumeFuture;

    /// Place `buffer` on the output starting at clock time `start_at`.
    fn schedule(&mut self, buffer: Arc<PcmBuffer>, start_at: f64) -> Result<UnitHandle, DeviceError>;

    /// Halt a unit. Implementations may report an error for a unit that
    /// already finished; callers treat that as harmless.
    fn stop(&mut self, handle: UnitHandle) -> Result<(), DeviceError>;

    /// Release the output. Terminal.
    fn close(&mut self);
}

impl<D: RenderDevice + ?Sized> RenderDevice for Box<D> {
    fn state(&self) -> DeviceState {
        (**self).state()
    }

    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn resume(&mut self) -> ResumeFuture {
        (**self).resume()
    }

    fn schedule(&mut self, buffer: Arc<PcmBuffer>, start_at: f64) -> Result<UnitHandle, DeviceError> {
        (**self).schedule(buffer, start_at)
    }

    fn stop(&mut self, handle: UnitHandle) -> Result<(), DeviceError> {
        (**self).stop(handle)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// A device that keeps time but produces no sound.
///
/// ## Thread Safety:
/// The completion timers run as tokio tasks, so the unit table lives behind
/// `Arc<Mutex<...>>`. Timers only hold a `Weak` reference; dropping the
/// device cancels everything.
pub struct VirtualDevice {
    inner: Arc<Mutex<VirtualInner>>,
}

struct VirtualInner {
    state: DeviceState,
    /// Clock accumulated before the current running stretch
    elapsed_before: f64,
    running_since: Option<Instant>,
    next_handle: u64,
    units: HashMap<UnitHandle, VirtualUnit>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

struct VirtualUnit {
    end_time: f64,
    timer: Option<JoinHandle<()>>,
}

fn lock(inner: &Mutex<VirtualInner>) -> MutexGuard<'_, VirtualInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl VirtualInner {
    fn current_time(&self) -> f64 {
        let running = self
            .running_since
            .map(|since| since.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.elapsed_before + running
    }

    fn arm(&mut self, handle: UnitHandle, weak: Weak<Mutex<VirtualInner>>) {
        let now = self.current_time();
        if let Some(unit) = self.units.get_mut(&handle) {
            let delay = (unit.end_time - now).max(0.0);
            unit.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                if let Some(inner) = weak.upgrade() {
                    let mut guard = lock(&inner);
                    if guard.units.remove(&handle).is_some() {
                        let _ = guard.events.send(DeviceEvent::Ended(handle));
                    }
                }
            }));
        }
    }

    fn resume_now(&mut self, weak: Weak<Mutex<VirtualInner>>) -> Result<(), DeviceError> {
        match self.state {
            DeviceState::Closed => Err(DeviceError::Closed),
            DeviceState::Running => Ok(()),
            DeviceState::Suspended | DeviceState::Interrupted => {
                self.state = DeviceState::Running;
                self.running_since = Some(Instant::now());
                let handles: Vec<UnitHandle> = self.units.keys().copied().collect();
                for handle in handles {
                    self.arm(handle, weak.clone());
                }
                debug!(units = self.units.len(), "Virtual device resumed");
                Ok(())
            }
        }
    }
}

impl VirtualDevice {
    /// Create a running device; unit completions are sent to `events`.
    pub fn new(events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VirtualInner {
                state: DeviceState::Running,
                elapsed_before: 0.0,
                running_since: Some(Instant::now()),
                next_handle: 1,
                units: HashMap::new(),
                events,
            })),
        }
    }

    /// Create a device that starts suspended, as a browser output context does.
    pub fn new_suspended(events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        let device = Self::new(events);
        device.suspend();
        device
    }

    /// Freeze the clock and pause every pending completion.
    pub fn suspend(&self) {
        self.enter_paused_state(DeviceState::Suspended);
    }

    /// Like `suspend`, but caused by the platform (audio focus loss).
    pub fn interrupt(&self) {
        self.enter_paused_state(DeviceState::Interrupted);
    }

    fn enter_paused_state(&self, target: DeviceState) {
        let mut inner = lock(&self.inner);
        if inner.state != DeviceState::Running {
            return;
        }
        inner.elapsed_before = inner.current_time();
        inner.running_since = None;
        inner.state = target;
        for unit in inner.units.values_mut() {
            if let Some(timer) = unit.timer.take() {
                timer.abort();
            }
        }
    }

    /// Units scheduled and not yet finished.
    pub fn pending_units(&self) -> usize {
        lock(&self.inner).units.len()
    }
}

impl RenderDevice for VirtualDevice {
    fn state(&self) -> DeviceState {
        lock(&self.inner).state
    }

    fn current_time(&self) -> f64 {
        lock(&self.inner).current_time()
    }

    fn resume(&mut self) -> ResumeFuture {
        let inner = Arc::clone(&self.inner);
        async move {
            // resuming is asynchronous on real outputs; give other work a turn
            tokio::task::yield_now().await;
            let weak = Arc::downgrade(&inner);
            let mut guard = lock(&inner);
            guard.resume_now(weak)
        }
        .boxed()
    }

    fn schedule(&mut self, buffer: Arc<PcmBuffer>, start_at: f64) -> Result<UnitHandle, DeviceError> {
        let weak = Arc::downgrade(&self.inner);
        let mut inner = lock(&self.inner);
        if inner.state == DeviceState::Closed {
            return Err(DeviceError::Closed);
        }

        let handle = UnitHandle(inner.next_handle);
        inner.next_handle += 1;

        let start = start_at.max(inner.current_time());
        inner.units.insert(
            handle,
            VirtualUnit {
                end_time: start + buffer.duration(),
                timer: None,
            },
        );
        if inner.state == DeviceState::Running {
            inner.arm(handle, weak);
        }
        Ok(handle)
    }

    fn stop(&mut self, handle: UnitHandle) -> Result<(), DeviceError> {
        let mut inner = lock(&self.inner);
        if inner.state == DeviceState::Closed {
            return Ok(());
        }
        if let Some(unit) = inner.units.remove(&handle) {
            if let Some(timer) = unit.timer {
                timer.abort();
            }
            let _ = inner.events.send(DeviceEvent::Ended(handle));
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut inner = lock(&self.inner);
        if inner.state == DeviceState::Closed {
            return;
        }
        inner.elapsed_before = inner.current_time();
        inner.running_since = None;
        inner.state = DeviceState::Closed;
        for (_, unit) in inner.units.drain() {
            if let Some(timer) = unit.timer {
                timer.abort();
            }
        }
        debug!("Virtual device closed");
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        self.close();
    }
}
