use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Commands accepted between ticks. Producers (keyboard thread, future
/// network surface) post; the pipeline drains once per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Reopen the frame source after a `Stop`.
    Start,
    /// Tear down the frame source and effect instances; the pipeline stays
    /// alive and restartable.
    Stop,
    /// Cross-fade to the named effect over the configured duration.
    SetEffect(String),
    /// Cross-fade to the named effect over an explicit duration.
    BeginTransition { name: String, duration_ms: u64 },
    /// Cross-fade to a randomly chosen effect other than the current one.
    RandomEffect,
    /// Drop to passthrough.
    Deactivate,
    /// Set the input distortion level (0-100).
    SetDistortion(u8),
    Shutdown,
}

impl ControlEvent {
    fn kind(&self) -> u8 {
        match self {
            Self::Start => 0,
            Self::Stop => 1,
            Self::SetEffect(_) => 2,
            Self::BeginTransition { .. } => 3,
            Self::RandomEffect => 4,
            Self::Deactivate => 5,
            Self::SetDistortion(_) => 6,
            Self::Shutdown => 7,
        }
    }
}

/// Bounded multi-producer queue with drop-oldest overflow: under a command
/// flood the pipeline acts on recent intent rather than stalling or
/// replaying stale commands.
#[derive(Clone)]
pub struct ControlBus {
    inner: Arc<Mutex<VecDeque<ControlEvent>>>,
    capacity: usize,
}

impl ControlBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.max(1)))),
            capacity: capacity.max(1),
        }
    }

    pub fn post(&self, event: ControlEvent) {
        let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(event);
    }

    /// Take every pending event, coalescing repeats of the same kind down
    /// to the most recent one. Relative order of the survivors follows
    /// their last occurrence, so "set A, set B" still ends on B.
    pub fn drain(&self) -> Vec<ControlEvent> {
        let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<ControlEvent> = Vec::with_capacity(q.len());
        for ev in q.drain(..) {
            out.retain(|e| e.kind() != ev.kind());
            out.push(ev);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
