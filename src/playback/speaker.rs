//! # Speaker Output
//!
//! `RenderDevice` backed by the default cpal output. Scheduled units are
//! mixed inside the output callback; the device clock is the number of
//! frames the callback has rendered, so it freezes while the stream is
//! paused.
//!
//! ## Thread Safety:
//! The cpal callback runs on its own audio thread. The unit table lives in
//! `Arc<Mutex<...>>` (a std mutex, the callback is not async) and the clock
//! is an `AtomicU64`. `cpal::Stream` is not `Send`, so a `SpeakerDevice`
//! stays on the thread that opened it.

use crate::error::DeviceError;
use crate::playback::decoder::PcmBuffer;
use crate::playback::device::{DeviceEvent, DeviceState, RenderDevice, ResumeFuture, UnitHandle};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use futures_util::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{error, info};

struct MixUnit {
    handle: UnitHandle,
    start_frame: u64,
    buffer: Arc<PcmBuffer>,
}

impl MixUnit {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.len() as u64
    }
}

struct Mixer {
    units: Vec<MixUnit>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

fn lock(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Mixer {
    /// Fill one interleaved block starting at `first_frame`.
    fn render(&mut self, out: &mut [f32], channels: usize, first_frame: u64) {
        for (offset, frame) in out.chunks_mut(channels).enumerate() {
            let position = first_frame + offset as u64;
            let mut value = 0.0f32;
            for unit in &self.units {
                if position >= unit.start_frame && position < unit.end_frame() {
                    value += unit.buffer.samples()[(position - unit.start_frame) as usize];
                }
            }
            frame.fill(value.clamp(-1.0, 1.0));
        }

        let block_end = first_frame + (out.len() / channels) as u64;
        let events = &self.events;
        self.units.retain(|unit| {
            let done = unit.end_frame() <= block_end;
            if done {
                let _ = events.send(DeviceEvent::Ended(unit.handle));
            }
            !done
        });
    }
}

pub struct SpeakerDevice {
    stream: Option<cpal::Stream>,
    mixer: Arc<Mutex<Mixer>>,
    frames_rendered: Arc<AtomicU64>,
    sample_rate: u32,
    state: DeviceState,
    next_handle: u64,
}

impl SpeakerDevice {
    /// Open the default output at `sample_rate`, mono samples duplicated to
    /// every output channel. The stream starts suspended when asked to.
    pub fn open(
        sample_rate: u32,
        start_suspended: bool,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| DeviceError::Backend("no audio output device available".to_string()))?;
        let default_config = device
            .default_output_config()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let channels = default_config.channels();
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            device_name = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate,
            channels,
            "Opening speaker output"
        );

        let mixer = Arc::new(Mutex::new(Mixer {
            units: Vec::new(),
            events,
        }));
        let frames_rendered = Arc::new(AtomicU64::new(0));

        let callback_mixer = Arc::clone(&mixer);
        let callback_frames = Arc::clone(&frames_rendered);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let first_frame = callback_frames.load(Ordering::Acquire);
                    lock(&callback_mixer).render(data, channels as usize, first_frame);
                    callback_frames.fetch_add((data.len() / channels as usize) as u64, Ordering::Release);
                },
                |err| error!(error = %err, "Speaker stream error"),
                None,
            )
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let state = if start_suspended {
            DeviceState::Suspended
        } else {
            stream.play().map_err(|e| DeviceError::Backend(e.to_string()))?;
            DeviceState::Running
        };

        Ok(Self {
            stream: Some(stream),
            mixer,
            frames_rendered,
            sample_rate,
            state,
            next_handle: 1,
        })
    }

    fn frames_now(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    /// Pause the stream; the clock stops with it.
    pub fn suspend(&mut self) -> Result<(), DeviceError> {
        if self.state != DeviceState::Running {
            return Ok(());
        }
        if let Some(stream) = &self.stream {
            stream.pause().map_err(|e| DeviceError::Backend(e.to_string()))?;
        }
        self.state = DeviceState::Suspended;
        Ok(())
    }
}

impl RenderDevice for SpeakerDevice {
    fn state(&self) -> DeviceState {
        self.state
    }

    fn current_time(&self) -> f64 {
        self.frames_now() as f64 / self.sample_rate as f64
    }

    fn resume(&mut self) -> ResumeFuture {
        let result = match (self.state, &self.stream) {
            (DeviceState::Running, _) => Ok(()),
            (DeviceState::Closed, _) | (_, None) => Err(DeviceError::Closed),
            (_, Some(stream)) => stream.play().map_err(|e| DeviceError::Backend(e.to_string())),
        };
        if result.is_ok() && self.state != DeviceState::Closed {
            self.state = DeviceState::Running;
        }
        futures_util::future::ready(result).boxed()
    }

    fn schedule(&mut self, buffer: Arc<PcmBuffer>, start_at: f64) -> Result<UnitHandle, DeviceError> {
        if self.state == DeviceState::Closed {
            return Err(DeviceError::Closed);
        }
        let handle = UnitHandle(self.next_handle);
        self.next_handle += 1;

        let requested = (start_at * self.sample_rate as f64).round().max(0.0) as u64;
        let start_frame = requested.max(self.frames_now());
        lock(&self.mixer).units.push(MixUnit {
            handle,
            start_frame,
            buffer,
        });
        Ok(handle)
    }

    fn stop(&mut self, handle: UnitHandle) -> Result<(), DeviceError> {
        let mut mixer = lock(&self.mixer);
        match mixer.units.iter().position(|unit| unit.handle == handle) {
            Some(index) => {
                mixer.units.swap_remove(index);
                let _ = mixer.events.send(DeviceEvent::Ended(handle));
                Ok(())
            }
            None => Err(DeviceError::Backend(format!("unit {} already finished", handle.0))),
        }
    }

    fn close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }
        self.stream = None;
        lock(&self.mixer).units.clear();
        self.state = DeviceState::Closed;
        info!("Speaker output closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixer_sums_overlapping_units_and_reports_ends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer {
            units: vec![
                MixUnit {
                    handle: UnitHandle(1),
                    start_frame: 0,
                    buffer: Arc::new(PcmBuffer::new(vec![0.25; 4], 1000)),
                },
                MixUnit {
                    handle: UnitHandle(2),
                    start_frame: 2,
                    buffer: Arc::new(PcmBuffer::new(vec![0.5; 4], 1000)),
                },
            ],
            events: tx,
        };

        // stereo, 4 frames
        let mut out = vec![0.0; 8];
        mixer.render(&mut out, 2, 0);
        assert_eq!(out, vec![0.25, 0.25, 0.25, 0.25, 0.75, 0.75, 0.75, 0.75]);
        assert_eq!(rx.try_recv(), Ok(DeviceEvent::Ended(UnitHandle(1))));
        assert!(rx.try_recv().is_err());

        let mut out = vec![0.0; 8];
        mixer.render(&mut out, 2, 4);
        assert_eq!(&out[..4], &[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(rx.try_recv(), Ok(DeviceEvent::Ended(UnitHandle(2))));
    }
}
