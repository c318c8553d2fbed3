//! Acoustic echo cancellation for the capture path.
//!
//! The playback worker pushes every sample it sends to the speaker into a
//! render FIFO; the capture worker pops one frame of that reference per
//! microphone frame and lets the canceller subtract the echo in place.
//! Anything going wrong here degrades to pass-through, never to an error
//! on the call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::AecSettings;
use crate::errors::AecError;

pub const AEC_SAMPLE_RATE: u32 = 8000;
/// 10 ms at 8 kHz.
pub const AEC_FRAME_SAMPLES: usize = 80;
pub const AEC_FRAME_BYTES: usize = AEC_FRAME_SAMPLES * 2;
/// Half a second of reference audio.
pub const AEC_FIFO_CAPACITY: usize = AEC_FRAME_SAMPLES * 50;

// ── Render FIFO ───────────────────────────────────────────────────────────────

/// Bounded ring of recently played samples. Overflow drops the oldest.
#[derive(Debug)]
pub struct RenderFifo {
    samples: VecDeque<i16>,
    capacity: usize,
}

impl RenderFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, samples: &[i16]) {
        if self.capacity == 0 {
            return;
        }
        let keep = &samples[samples.len().saturating_sub(self.capacity)..];
        let overflow = (self.samples.len() + keep.len()).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(keep);
    }

    /// Exactly `count` samples, or `None` without consuming anything.
    pub fn pop(&mut self, count: usize) -> Option<Vec<i16>> {
        if count == 0 || self.samples.len() < count {
            return None;
        }
        Some(self.samples.drain(..count).collect())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// ── Engine contract ───────────────────────────────────────────────────────────

/// An echo canceller working on fixed-size mono frames.
///
/// Implementations need not be reentrant; the adapter serializes calls.
pub trait EchoCanceller: Send {
    fn frame_len(&self) -> usize;

    /// Remove the echo of `far` from `near`, in place.
    fn process(&mut self, near: &mut [i16], far: &[i16]) -> Result<(), AecError>;
}

/// Normalized-LMS adaptive FIR filter estimating the speaker→mic echo path.
pub struct NlmsCanceller {
    weights: Vec<f32>,
    history: VecDeque<f32>,
    energy: f32,
    step: f32,
}

impl NlmsCanceller {
    const REGULARIZATION: f32 = 1e-3;

    pub fn new(tail_ms: u32, step: f32) -> Result<Self, AecError> {
        let taps = (tail_ms as usize * AEC_SAMPLE_RATE as usize) / 1000;
        if taps == 0 {
            return Err(AecError::Init(format!("tail of {tail_ms} ms is too short")));
        }
        if !(step > 0.0 && step <= 1.0) {
            return Err(AecError::Init(format!("step size {step} outside (0, 1]")));
        }
        Ok(Self {
            weights: vec![0.0; taps],
            history: VecDeque::from(vec![0.0; taps]),
            energy: 0.0,
            step,
        })
    }

    pub fn taps(&self) -> usize {
        self.weights.len()
    }

    fn filter_sample(&mut self, near: f32, far: f32) -> f32 {
        if let Some(old) = self.history.pop_back() {
            self.energy -= old * old;
        }
        self.history.push_front(far);
        self.energy = (self.energy + far * far).max(0.0);

        let estimate: f32 = self
            .weights
            .iter()
            .zip(self.history.iter())
            .map(|(w, x)| w * x)
            .sum();
        let error = near - estimate;

        let gain = self.step * error / (self.energy + Self::REGULARIZATION);
        for (w, x) in self.weights.iter_mut().zip(self.history.iter()) {
            *w += gain * x;
        }
        error
    }
}

impl EchoCanceller for NlmsCanceller {
    fn frame_len(&self) -> usize {
        AEC_FRAME_SAMPLES
    }

    fn process(&mut self, near: &mut [i16], far: &[i16]) -> Result<(), AecError> {
        if near.len() != AEC_FRAME_SAMPLES || far.len() != AEC_FRAME_SAMPLES {
            return Err(AecError::FrameSize {
                expected: AEC_FRAME_SAMPLES,
                got: near.len().min(far.len()),
            });
        }
        for (n, &f) in near.iter_mut().zip(far) {
            let out = self.filter_sample(f32::from(*n) / 32768.0, f32::from(f) / 32768.0);
            *n = (out * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
        Ok(())
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

pub type EngineFactory =
    Arc<dyn Fn() -> Result<Box<dyn EchoCanceller>, AecError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AecStatus {
    Active,
    ForceDisabled,
    Unavailable(String),
}

/// Render FIFO + engine, each behind its own lock.
pub struct EchoCancellation {
    force_disable: bool,
    factory: EngineFactory,
    enabled: AtomicBool,
    fifo: Mutex<RenderFifo>,
    engine: Mutex<Option<Box<dyn EchoCanceller>>>,
}

impl EchoCancellation {
    pub fn new(settings: &AecSettings) -> Self {
        let (tail_ms, step) = (settings.tail_ms, settings.step_size);
        let factory: EngineFactory = Arc::new(move || {
            NlmsCanceller::new(tail_ms, step).map(|e| Box::new(e) as Box<dyn EchoCanceller>)
        });
        Self::with_factory(settings.force_disable, factory)
    }

    pub fn with_factory(force_disable: bool, factory: EngineFactory) -> Self {
        Self {
            force_disable,
            factory,
            enabled: AtomicBool::new(false),
            fifo: Mutex::new(RenderFifo::new(AEC_FIFO_CAPACITY)),
            engine: Mutex::new(None),
        }
    }

    /// Prepare for a new audio session.
    pub fn init(&self) -> AecStatus {
        self.fifo.lock().clear();
        if self.force_disable {
            self.enabled.store(false, Ordering::SeqCst);
            return AecStatus::ForceDisabled;
        }

        let mut engine = self.engine.lock();
        let status = if engine.is_some() {
            AecStatus::Active
        } else {
            match (self.factory)() {
                Ok(e) if e.frame_len() == AEC_FRAME_SAMPLES => {
                    *engine = Some(e);
                    AecStatus::Active
                }
                Ok(e) => AecStatus::Unavailable(format!(
                    "engine frame of {} samples, need {AEC_FRAME_SAMPLES}",
                    e.frame_len()
                )),
                Err(e) => AecStatus::Unavailable(e.to_string()),
            }
        };
        self.enabled.store(status == AecStatus::Active, Ordering::SeqCst);
        status
    }

    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.engine.lock().take();
        self.fifo.lock().clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Record samples that are about to be played.
    pub fn push_render(&self, samples: &[i16]) {
        if self.is_enabled() {
            self.fifo.lock().push(samples);
        }
    }

    /// Cancel echo in one captured frame. Missing reference data is replaced
    /// by silence; engine errors leave the frame untouched.
    pub fn cancel(&self, near: &mut [i16]) {
        if !self.is_enabled() {
            return;
        }
        let far = self
            .fifo
            .lock()
            .pop(near.len())
            .unwrap_or_else(|| vec![0; near.len()]);

        let mut engine = self.engine.lock();
        if let Some(engine) = engine.as_mut() {
            let original = near.to_vec();
            if engine.process(near, &far).is_err() {
                near.copy_from_slice(&original);
            }
        }
    }

    pub fn buffered_reference(&self) -> usize {
        self.fifo.lock().len()
    }
}
