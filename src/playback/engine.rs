//! # Playback Engine
//!
//! Composes the decoder, scheduler, registry, context tracker, sequence
//! monitor and completion handshake into one per-session state machine.
//!
//! ## Key Rust Concepts:
//! - **Sans-IO**: the engine never sleeps, spawns or sends. Each operation
//!   runs to completion synchronously and leaves `EngineEffect`s behind;
//!   the host (the WebSocket actor) turns them into timers, futures and
//!   outbound frames. This keeps every step atomic and makes the engine
//!   testable without a runtime.
//! - **Generic device**: `PlaybackEngine<D: RenderDevice>` is monomorphized
//!   for the scripted device in tests and boxed for the server.

use crate::config::PlaybackConfig;
use crate::error::{DeviceError, PlaybackError};
use crate::playback::completion::{is_sentinel_context, CompletionHandshake, DrainCheck, TriggerOutcome};
use crate::playback::context::{ContextState, ContextTracker, ContextTransition};
use crate::playback::decoder::FragmentDecoder;
use crate::playback::device::{DeviceEvent, DeviceState, RenderDevice, ResumeFuture, UnitHandle};
use crate::playback::protocol::OutboundEvent;
use crate::playback::registry::{ActiveUnitRegistry, PlaybackUnit};
use crate::playback::scheduler::{DrainOutcome, DrainReport, Fragment, PlaybackScheduler};
use crate::playback::sequence::SequenceMonitor;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Work the host must carry out after an engine call.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEffect {
    /// Call `begin_resume` and feed the result to `on_device_resumed`
    ResumeDevice,
    /// Call `check_drain(context_id)` after `delay`
    ScheduleDrainCheck { context_id: String, delay: Duration },
    /// Send this event to the remote sender
    Send(OutboundEvent),
    /// Something went wrong but playback continues
    Report(PlaybackError),
}

/// Running totals for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub fragments_received: u64,
    pub fragments_ignored: u64,
    pub units_scheduled: u64,
    pub decode_errors: u64,
    pub device_errors: u64,
    pub sequence_anomalies: u64,
    pub context_switches: u64,
    pub contexts_drained: u64,
    pub duplicate_completions: u64,
    pub interrupts: u64,
    pub underruns: u64,
}

impl EngineStats {
    /// Counts accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &EngineStats) -> EngineStats {
        EngineStats {
            fragments_received: self.fragments_received.saturating_sub(earlier.fragments_received),
            fragments_ignored: self.fragments_ignored.saturating_sub(earlier.fragments_ignored),
            units_scheduled: self.units_scheduled.saturating_sub(earlier.units_scheduled),
            decode_errors: self.decode_errors.saturating_sub(earlier.decode_errors),
            device_errors: self.device_errors.saturating_sub(earlier.device_errors),
            sequence_anomalies: self.sequence_anomalies.saturating_sub(earlier.sequence_anomalies),
            context_switches: self.context_switches.saturating_sub(earlier.context_switches),
            contexts_drained: self.contexts_drained.saturating_sub(earlier.contexts_drained),
            duplicate_completions: self
                .duplicate_completions
                .saturating_sub(earlier.duplicate_completions),
            interrupts: self.interrupts.saturating_sub(earlier.interrupts),
            underruns: self.underruns.saturating_sub(earlier.underruns),
        }
    }
}

/// Point-in-time view for logs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub context: ContextState,
    pub device_state: DeviceState,
    pub queued_fragments: usize,
    pub active_units: usize,
    pub buffered_ahead_secs: f64,
    pub expected_sequence_index: u64,
    pub pending_completions: usize,
    pub stats: EngineStats,
}

pub struct PlaybackEngine<D: RenderDevice> {
    device: D,
    decoder: FragmentDecoder,
    scheduler: PlaybackScheduler,
    registry: ActiveUnitRegistry,
    context: ContextTracker,
    sequence: SequenceMonitor,
    completion: CompletionHandshake,
    /// Unit of the greeting clip while it plays
    greeting: Option<UnitHandle>,
    quiescence_delay: Duration,
    drain_poll_interval: Duration,
    effects: Vec<EngineEffect>,
    stats: EngineStats,
}

impl<D: RenderDevice> PlaybackEngine<D> {
    pub fn new(device: D, config: &PlaybackConfig) -> Self {
        Self {
            device,
            decoder: FragmentDecoder::new(config.sample_rate),
            scheduler: PlaybackScheduler::new(config.min_buffer_chunks),
            registry: ActiveUnitRegistry::new(),
            context: ContextTracker::new(),
            sequence: SequenceMonitor::new(),
            completion: CompletionHandshake::new(config.ledger_capacity),
            greeting: None,
            quiescence_delay: config.quiescence_delay(),
            drain_poll_interval: config.drain_poll_interval(),
            effects: Vec::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn registry(&self) -> &ActiveUnitRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn context(&self) -> &ContextState {
        self.context.state()
    }

    /// Hand over everything the host still has to do.
    pub fn take_effects(&mut self) -> Vec<EngineEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Anything scheduled, playing or waiting to be scheduled.
    pub fn is_audible(&self) -> bool {
        !self.registry.is_empty() || !self.scheduler.is_queue_empty()
    }

    /// Answer a re-engagement check from the remote sender.
    pub fn reengagement_check(&mut self) -> bool {
        let audible = self.is_audible();
        debug!(audible, "Re-engagement check");
        self.effects
            .push(EngineEffect::Send(OutboundEvent::ReengagementCheckResult { audible }));
        audible
    }

    /// Accept one transport fragment.
    ///
    /// ## Steps:
    /// 1. Reject fragments without a usable context id or audio
    /// 2. Let the context tracker decide; flush the old turn on a switch
    /// 3. Check the sequence index (telemetry only)
    /// 4. Enqueue and drain
    /// 5. Fire the end-of-turn trigger for `isFinal` fragments
    pub fn on_fragment(&mut self, fragment: Fragment) {
        if is_sentinel_context(&fragment.context_id) || fragment.audio.trim().is_empty() {
            self.stats.fragments_ignored += 1;
            warn!(
                context_id = %fragment.context_id,
                has_audio = !fragment.audio.trim().is_empty(),
                "Ignoring fragment without context id or audio"
            );
            return;
        }
        self.stats.fragments_received += 1;

        match self.context.observe(&fragment.context_id) {
            ContextTransition::Started => {
                debug!(context_id = %fragment.context_id, "Context started");
                self.sequence.reset();
            }
            ContextTransition::Continued => {}
            ContextTransition::Switched { previous } => {
                let halted = self.flush();
                self.sequence.reset();
                self.stats.context_switches += 1;
                info!(
                    previous = %previous,
                    context_id = %fragment.context_id,
                    halted_units = halted,
                    "Context superseded, old audio flushed"
                );
            }
        }

        if self
            .sequence
            .observe(&fragment.context_id, fragment.sequence_index)
            .is_anomaly()
        {
            self.stats.sequence_anomalies += 1;
        }

        let end_of_context = fragment.is_final.then(|| fragment.context_id.clone());
        let report = self
            .scheduler
            .enqueue(fragment, &mut self.device, &self.decoder, &mut self.registry);
        self.absorb(report);

        if let Some(context_id) = end_of_context {
            self.end_of_context(&context_id);
        }
    }

    /// Out-of-band end-of-turn marker.
    pub fn on_stream_complete(&mut self, context_id: &str) {
        self.end_of_context(context_id);
    }

    fn end_of_context(&mut self, context_id: &str) {
        if is_sentinel_context(context_id) {
            warn!(context_id = %context_id, "End of turn without a usable context id");
            return;
        }

        // a short turn may never reach the pre-buffer threshold
        if self.context.is_current(context_id) {
            self.scheduler.release_prebuffer();
            let report = self
                .scheduler
                .drain(&mut self.device, &self.decoder, &mut self.registry);
            self.absorb(report);
        }

        match self.completion.trigger(context_id) {
            TriggerOutcome::Armed => {
                let ahead = self.scheduler.buffered_ahead(self.device.current_time());
                let delay = self.quiescence_delay + Duration::from_secs_f64(ahead);
                debug!(
                    context_id = %context_id,
                    delay_ms = delay.as_millis() as u64,
                    "Completion handshake armed"
                );
                self.effects.push(EngineEffect::ScheduleDrainCheck {
                    context_id: context_id.to_string(),
                    delay,
                });
            }
            TriggerOutcome::AlreadyPending | TriggerOutcome::Ignored => {}
        }
    }

    /// A drain-check timer fired for `context_id`.
    pub fn check_drain(&mut self, context_id: &str) {
        let drained = self.registry.is_empty() && self.scheduler.is_queue_empty();
        match self.completion.check(context_id, drained) {
            DrainCheck::Waiting => {
                self.effects.push(EngineEffect::ScheduleDrainCheck {
                    context_id: context_id.to_string(),
                    delay: self.drain_poll_interval,
                });
            }
            DrainCheck::Notify => {
                self.stats.contexts_drained += 1;
                if self.context.current().map_or(true, |current| current == context_id) {
                    self.context.end();
                    self.scheduler.clear();
                    self.sequence.reset();
                }
                info!(context_id = %context_id, "Context drained");
                self.effects.push(EngineEffect::Send(OutboundEvent::Drained {
                    context_id: context_id.to_string(),
                }));
            }
            DrainCheck::Duplicate => {
                self.stats.duplicate_completions += 1;
            }
            DrainCheck::NotPending => {
                debug!(context_id = %context_id, "Stale drain check");
            }
        }
    }

    /// Barge-in. Everything audible or queued is gone when this returns.
    /// A stopped greeting keeps its handle, so its `Ended` event still
    /// yields `greeting-finished`.
    pub fn interrupt(&mut self) {
        let halted = self.flush();
        let ended = self.context.end();
        self.sequence.reset();
        self.stats.interrupts += 1;
        info!(
            context_id = ?ended,
            halted_units = halted,
            "Playback interrupted"
        );
    }

    /// Stop every unit and forget the queue and cursor.
    fn flush(&mut self) -> usize {
        let halted = self.registry.stop_all(&mut self.device);
        let dropped = self.scheduler.clear();
        if dropped > 0 {
            debug!(dropped, "Dropped queued fragments");
        }
        halted
    }

    /// Start the resume the scheduler asked for.
    pub fn begin_resume(&mut self) -> ResumeFuture {
        self.device.resume()
    }

    /// The resume future completed.
    pub fn on_device_resumed(&mut self, result: Result<(), DeviceError>) {
        self.scheduler.resume_finished();
        match result {
            Ok(()) => {
                debug!(state = ?self.device.state(), "Device resumed");
                let report = self
                    .scheduler
                    .drain(&mut self.device, &self.decoder, &mut self.registry);
                self.absorb(report);
            }
            // fragments stay queued; the next enqueue retries
            Err(err) => {
                warn!(error = %err, "Device resume failed");
                self.stats.device_errors += 1;
                self.effects.push(EngineEffect::Report(err.into()));
            }
        }
    }

    pub fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Ended(handle) => {
                self.registry.deregister(handle);
                if self.greeting == Some(handle) {
                    self.greeting = None;
                    info!("Greeting finished");
                    self.effects.push(EngineEffect::Send(OutboundEvent::GreetingFinished));
                }
            }
        }
    }

    /// Play a one-shot clip right away, outside any turn. It is registered,
    /// so an interrupt silences it too.
    pub fn play_greeting(&mut self, audio: &str) {
        if self.device.state() == DeviceState::Closed {
            self.report(DeviceError::Closed.into());
            return;
        }

        let buffer = match self.decoder.decode(audio) {
            Ok(buffer) => Arc::new(buffer),
            Err(err) => {
                warn!(error = %err, "Greeting could not be decoded");
                self.report(err.into());
                return;
            }
        };

        if self.device.state().needs_resume() && self.scheduler.request_resume() {
            self.effects.push(EngineEffect::ResumeDevice);
        }

        let start_time = self.device.current_time();
        let duration_secs = buffer.duration();
        match self.device.schedule(Arc::clone(&buffer), start_time) {
            Ok(handle) => {
                self.stats.units_scheduled += 1;
                self.registry.register(PlaybackUnit {
                    handle,
                    buffer,
                    start_time,
                    context_id: None,
                });
                if let Some(previous) = self.greeting.replace(handle) {
                    debug!(handle = previous.0, "Greeting replaced");
                }
                info!(duration_secs, "Greeting scheduled");
            }
            Err(err) => self.report(err.into()),
        }
    }

    /// Release the device. The engine is inert afterwards.
    pub fn close(&mut self) {
        self.registry.clear();
        self.scheduler.clear();
        self.context.end();
        self.device.close();
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            context: self.context.state().clone(),
            device_state: self.device.state(),
            queued_fragments: self.scheduler.queue_len(),
            active_units: self.registry.count(),
            buffered_ahead_secs: self.scheduler.buffered_ahead(self.device.current_time()),
            expected_sequence_index: self.sequence.expected_next(),
            pending_completions: self.completion.pending_count(),
            stats: self.stats,
        }
    }

    fn report(&mut self, err: PlaybackError) {
        match err {
            PlaybackError::Decode(_) => self.stats.decode_errors += 1,
            PlaybackError::Device(_) => self.stats.device_errors += 1,
        }
        self.effects.push(EngineEffect::Report(err));
    }

    fn absorb(&mut self, report: DrainReport) {
        self.stats.units_scheduled += report.scheduled.len() as u64;
        self.stats.underruns += u64::from(report.underruns);
        for err in report.errors {
            self.report(err);
        }
        if report.outcome == DrainOutcome::ResumeRequested {
            self.effects.push(EngineEffect::ResumeDevice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::playback::decoder::encode_pcm16;
    use crate::playback::device::scripted::ScriptedDevice;

    fn config(min_buffer_chunks: usize) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: 1000,
            min_buffer_chunks,
            ..PlaybackConfig::default()
        }
    }

    fn engine(min_buffer_chunks: usize) -> PlaybackEngine<ScriptedDevice> {
        PlaybackEngine::new(ScriptedDevice::new(), &config(min_buffer_chunks))
    }

    /// `samples` at 1 kHz, so 100 samples = 0.1 s
    fn fragment(context: &str, index: u64, samples: usize) -> Fragment {
        Fragment {
            context_id: context.to_string(),
            sequence_index: Some(index),
            audio: encode_pcm16(&vec![1000i16; samples]),
            is_final: false,
        }
    }

    fn finish_all(engine: &mut PlaybackEngine<ScriptedDevice>) {
        let handles: Vec<UnitHandle> = engine.registry().units().map(|unit| unit.handle).collect();
        for handle in handles {
            engine.on_device_event(DeviceEvent::Ended(handle));
        }
    }

    fn drained_events(effects: &[EngineEffect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                EngineEffect::Send(OutboundEvent::Drained { context_id }) => Some(context_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_back_to_back_scheduling_within_a_turn() {
        let mut engine = engine(2);
        engine.device_mut().now = 1.0;
        engine.on_fragment(fragment("a", 0, 100));
        assert!(engine.device().scheduled.is_empty());

        engine.on_fragment(fragment("a", 1, 300));
        let calls = engine.device().scheduled.clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].start_at, 1.0);
        assert!((calls[1].start_at - 1.1).abs() < 1e-9);
        assert!((engine.scheduler().cursor().unwrap() - 1.4).abs() < 1e-9);
    }

    #[test]
    fn test_context_switch_flushes_before_scheduling() {
        let mut engine = engine(1);
        for index in 0..3 {
            engine.on_fragment(fragment("a", index, 100));
        }
        assert_eq!(engine.registry().count_for("a"), 3);

        engine.device_mut().now = 0.05;
        engine.on_fragment(fragment("b", 0, 100));

        let device = engine.device();
        assert_eq!(device.stopped, vec![UnitHandle(1), UnitHandle(2), UnitHandle(3)]);
        assert_eq!(engine.registry().count_for("a"), 0);
        assert_eq!(engine.registry().count_for("b"), 1);
        // the new turn restarts at device time rather than after the old cursor
        let new_unit = device.scheduled.last().unwrap();
        assert_eq!(new_unit.start_at, 0.05);
        assert_eq!(engine.context(), &ContextState::Active("b".to_string()));
        assert_eq!(engine.stats().context_switches, 1);
    }

    #[test]
    fn test_largest_sequence_index_keeps_playing() {
        let mut engine = engine(1);
        engine.on_fragment(fragment("a", u64::MAX, 100));
        engine.on_fragment(fragment("a", u64::MAX, 100));
        engine.on_fragment(fragment("a", 0, 100));

        assert_eq!(engine.registry().count_for("a"), 3);
        assert_eq!(engine.stats().sequence_anomalies, 2);
        assert!(engine.take_effects().is_empty());
    }

    #[test]
    fn test_sequence_restarts_for_new_turn() {
        let mut engine = engine(1);
        engine.on_fragment(fragment("a", 0, 10));
        engine.on_fragment(fragment("a", 1, 10));
        engine.on_fragment(fragment("b", 0, 10));
        assert_eq!(engine.stats().sequence_anomalies, 0);

        engine.on_fragment(fragment("b", 5, 10));
        assert_eq!(engine.stats().sequence_anomalies, 1);
        // anomalies never stop playback
        assert_eq!(engine.registry().count_for("b"), 2);
    }

    #[test]
    fn test_completion_waits_for_silence() {
        let mut engine = engine(1);
        engine.on_fragment(fragment("x", 0, 100));
        engine.on_fragment(fragment("x", 1, 100));
        engine.take_effects();

        engine.on_stream_complete("x");
        let effects = engine.take_effects();
        assert!(matches!(
            effects.as_slice(),
            [EngineEffect::ScheduleDrainCheck { context_id, delay }]
                if context_id == "x" && *delay == Duration::from_millis(400)
        ));

        engine.check_drain("x");
        let effects = engine.take_effects();
        assert!(drained_events(&effects).is_empty());
        assert_eq!(
            effects,
            vec![EngineEffect::ScheduleDrainCheck {
                context_id: "x".to_string(),
                delay: Duration::from_millis(100),
            }]
        );

        finish_all(&mut engine);
        engine.check_drain("x");
        let effects = engine.take_effects();
        assert_eq!(drained_events(&effects), vec!["x".to_string()]);
        assert_eq!(engine.context(), &ContextState::NoContext);
        assert!(engine.scheduler().cursor().is_none());
    }

    #[test]
    fn test_completion_is_sent_once() {
        let mut engine = engine(1);
        engine.on_fragment(fragment("x", 0, 100));
        finish_all(&mut engine);

        let mut drained = Vec::new();
        for _ in 0..2 {
            engine.on_stream_complete("x");
            engine.check_drain("x");
            drained.extend(drained_events(&engine.take_effects()));
        }
        assert_eq!(drained, vec!["x".to_string()]);
        assert_eq!(engine.stats().duplicate_completions, 1);
    }

    #[test]
    fn test_final_flag_and_stream_complete_share_one_handshake() {
        let mut engine = engine(1);
        let mut last = fragment("x", 0, 100);
        last.is_final = true;
        engine.on_fragment(last);
        engine.on_stream_complete("x");

        let armed = engine
            .take_effects()
            .into_iter()
            .filter(|effect| matches!(effect, EngineEffect::ScheduleDrainCheck { .. }))
            .count();
        assert_eq!(armed, 1);
    }

    #[test]
    fn test_short_turn_plays_below_prebuffer_threshold() {
        let mut engine = engine(2);
        let mut only = fragment("x", 0, 100);
        only.is_final = true;
        engine.on_fragment(only);

        assert_eq!(engine.device().scheduled.len(), 1);
        finish_all(&mut engine);
        engine.take_effects();
        engine.check_drain("x");
        assert_eq!(drained_events(&engine.take_effects()), vec!["x".to_string()]);
    }

    #[test]
    fn test_sentinel_ids_are_ignored() {
        let mut engine = engine(1);
        engine.on_fragment(fragment("undefined", 0, 100));
        engine.on_stream_complete("null");
        engine.on_stream_complete("");

        assert!(engine.take_effects().is_empty());
        assert!(engine.device().scheduled.is_empty());
        assert_eq!(engine.stats().fragments_ignored, 1);
    }

    #[test]
    fn test_interrupt_is_total() {
        let mut engine = engine(3);
        // nothing registered at all
        engine.interrupt();
        assert!(!engine.is_audible());

        engine.on_fragment(fragment("a", 0, 100));
        engine.on_fragment(fragment("a", 1, 100));
        engine.on_fragment(fragment("a", 2, 100));
        engine.on_fragment(fragment("a", 3, 100));
        assert_eq!(engine.registry().count(), 4);

        engine.interrupt();
        assert_eq!(engine.registry().count(), 0);
        assert_eq!(engine.scheduler().queue_len(), 0);
        assert_eq!(engine.device().stopped.len(), 4);
        assert_eq!(engine.context(), &ContextState::NoContext);
        assert!(engine.scheduler().cursor().is_none());

        // queued-but-unscheduled fragments are dropped too
        engine.on_fragment(fragment("b", 0, 100));
        assert_eq!(engine.scheduler().queue_len(), 1);
        engine.interrupt();
        assert_eq!(engine.scheduler().queue_len(), 0);
    }

    #[test]
    fn test_pending_completion_fires_after_interrupt() {
        let mut engine = engine(1);
        engine.on_fragment(fragment("x", 0, 100));
        engine.on_stream_complete("x");
        engine.interrupt();
        engine.take_effects();

        engine.check_drain("x");
        assert_eq!(drained_events(&engine.take_effects()), vec!["x".to_string()]);
    }

    #[test]
    fn test_malformed_fragment_reported_and_skipped() {
        let mut engine = engine(1);
        engine.on_fragment(fragment("a", 0, 100));
        let mut bad = fragment("a", 1, 0);
        bad.audio = "not*base64".to_string();
        engine.on_fragment(bad);
        engine.on_fragment(fragment("a", 2, 100));

        let effects = engine.take_effects();
        assert!(matches!(
            effects.as_slice(),
            [EngineEffect::Report(PlaybackError::Decode(DecodeError::InvalidEncoding(_)))]
        ));
        let calls = &engine.device().scheduled;
        assert_eq!(calls.len(), 2);
        assert!((calls[1].start_at - 0.1).abs() < 1e-9);
        assert_eq!(engine.stats().decode_errors, 1);
    }

    #[test]
    fn test_suspended_device_resumes_once_then_drains() {
        let mut engine = engine(1);
        engine.device_mut().state = DeviceState::Suspended;
        engine.on_fragment(fragment("a", 0, 100));
        engine.on_fragment(fragment("a", 1, 100));

        let effects = engine.take_effects();
        assert_eq!(effects, vec![EngineEffect::ResumeDevice]);
        assert!(engine.device().scheduled.is_empty());

        let resume = engine.begin_resume();
        assert_eq!(engine.device().resume_requests, 1);
        drop(resume);

        engine.device_mut().state = DeviceState::Running;
        engine.on_device_resumed(Ok(()));
        assert_eq!(engine.device().scheduled.len(), 2);
        assert_eq!(engine.device().resume_requests, 1);
    }

    #[test]
    fn test_failed_resume_keeps_fragments() {
        let mut engine = engine(1);
        engine.device_mut().state = DeviceState::Interrupted;
        engine.on_fragment(fragment("a", 0, 100));
        engine.take_effects();

        engine.on_device_resumed(Err(DeviceError::Backend("focus lost".to_string())));
        assert_eq!(engine.scheduler().queue_len(), 1);
        assert!(matches!(
            engine.take_effects().as_slice(),
            [EngineEffect::Report(PlaybackError::Device(_))]
        ));

        // the next fragment asks again
        engine.on_fragment(fragment("a", 1, 100));
        assert_eq!(engine.take_effects(), vec![EngineEffect::ResumeDevice]);
    }

    #[test]
    fn test_closed_device_turns_everything_into_no_ops() {
        let mut engine = engine(1);
        engine.close();
        engine.on_fragment(fragment("a", 0, 100));
        assert!(engine.device().scheduled.is_empty());
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_reengagement_check_reports_audibility() {
        let mut engine = engine(2);
        assert!(!engine.reengagement_check());

        // queued but not yet scheduled still counts
        engine.on_fragment(fragment("a", 0, 100));
        assert!(engine.reengagement_check());

        let effects = engine.take_effects();
        assert_eq!(
            effects,
            vec![
                EngineEffect::Send(OutboundEvent::ReengagementCheckResult { audible: false }),
                EngineEffect::Send(OutboundEvent::ReengagementCheckResult { audible: true }),
            ]
        );
    }

    #[test]
    fn test_greeting_plays_and_reports_its_end() {
        let mut engine = engine(2);
        engine.device_mut().now = 2.0;
        engine.play_greeting(&encode_pcm16(&[500; 300]));

        assert_eq!(engine.device().scheduled[0].start_at, 2.0);
        assert!(engine.is_audible());

        engine.on_device_event(DeviceEvent::Ended(UnitHandle(1)));
        assert_eq!(
            engine.take_effects(),
            vec![EngineEffect::Send(OutboundEvent::GreetingFinished)]
        );
        assert!(!engine.is_audible());
    }

    #[test]
    fn test_interrupt_silences_greeting() {
        let mut engine = engine(2);
        engine.play_greeting(&encode_pcm16(&[500; 300]));
        engine.interrupt();
        assert_eq!(engine.device().stopped, vec![UnitHandle(1)]);
        assert!(!engine.is_audible());

        // the stopped unit still reports its end, and the client still hears about it
        engine.on_device_event(DeviceEvent::Ended(UnitHandle(1)));
        assert_eq!(
            engine.take_effects(),
            vec![EngineEffect::Send(OutboundEvent::GreetingFinished)]
        );
        engine.on_device_event(DeviceEvent::Ended(UnitHandle(1)));
        assert!(engine.take_effects().is_empty());
    }

    #[test]
    fn test_stats_delta() {
        let mut engine = engine(1);
        engine.on_fragment(fragment("a", 0, 10));
        let before = engine.stats();
        engine.on_fragment(fragment("a", 1, 10));
        engine.interrupt();

        let delta = engine.stats().since(&before);
        assert_eq!(delta.fragments_received, 1);
        assert_eq!(delta.interrupts, 1);
        assert_eq!(delta.units_scheduled, 1);
    }
}
