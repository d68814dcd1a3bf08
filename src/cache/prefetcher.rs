//! Predictive pre-caching: plans which nearby frames to render ahead of the
//! playhead and tracks the single active pre-cache session.
//!
//! Planning is pure: candidates at offsets `1..=window` in the requested
//! direction(s), closest first. Execution lives in the cache facade, which
//! renders each candidate outside the store lock and commits it only while
//! the session is still current.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::cache::frame::FrameNumber;
use crate::render::FrameRenderer;

/// Which side of the playhead to pre-cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
    Both,
}

/// A frame to render ahead of need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchRequest {
    pub frame: FrameNumber,
    /// Distance from the playhead.
    pub distance: u64,
    /// Higher = sooner. Decreases with distance.
    pub priority: u64,
}

/// Build the pre-cache queue around `current`, highest priority first.
///
/// Equidistant candidates keep forward before backward. Backward candidates
/// that would fall before frame 0 are skipped.
pub fn plan_requests(current: FrameNumber, window: u64, direction: Direction) -> Vec<PrefetchRequest> {
    let forward = matches!(direction, Direction::Forward | Direction::Both);
    let backward = matches!(direction, Direction::Backward | Direction::Both);

    let mut requests = Vec::new();
    for distance in 1..=window {
        let priority = window - distance + 1;
        if forward {
            if let Some(frame) = current.checked_add(distance) {
                requests.push(PrefetchRequest {
                    frame,
                    distance,
                    priority,
                });
            }
        }
        if backward {
            if let Some(frame) = current.checked_sub(distance) {
                requests.push(PrefetchRequest {
                    frame,
                    distance,
                    priority,
                });
            }
        }
    }

    // Stable: ties stay in push order (forward first).
    requests.sort_by(|a, b| b.priority.cmp(&a.priority));
    requests
}

/// Cooperative cancellation flag shared with a running session.
#[derive(Debug, Clone, Default)]
pub struct PrefetchCancel(Arc<AtomicBool>);

impl PrefetchCancel {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct ActiveSession {
    id: Uuid,
    cancel: PrefetchCancel,
    queue: VecDeque<PrefetchRequest>,
}

/// Registered renderer plus the one active pre-cache session, if any.
#[derive(Default)]
pub struct Prefetcher {
    renderer: Option<Arc<dyn FrameRenderer>>,
    active: Option<ActiveSession>,
}

impl Prefetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_renderer(&mut self, renderer: Arc<dyn FrameRenderer>) {
        if self.renderer.is_some() {
            debug!("Replacing registered render callback");
        }
        self.renderer = Some(renderer);
    }

    pub fn renderer(&self) -> Option<Arc<dyn FrameRenderer>> {
        self.renderer.clone()
    }

    /// Start a session with `requests`, cancelling any running one.
    pub fn begin(&mut self, requests: Vec<PrefetchRequest>) -> (Uuid, PrefetchCancel) {
        self.abort();
        let id = Uuid::new_v4();
        let cancel = PrefetchCancel::new();
        self.active = Some(ActiveSession {
            id,
            cancel: cancel.clone(),
            queue: requests.into(),
        });
        (id, cancel)
    }

    /// Pop the next request for session `id`, or `None` if it was superseded,
    /// cancelled or has drained.
    pub fn next_for(&mut self, id: Uuid) -> Option<PrefetchRequest> {
        let session = self.active.as_mut().filter(|s| s.id == id)?;
        if session.cancel.is_cancelled() {
            return None;
        }
        session.queue.pop_front()
    }

    /// Whether session `id` may still commit frames.
    pub fn is_current(&self, id: Uuid) -> bool {
        self.active
            .as_ref()
            .is_some_and(|s| s.id == id && !s.cancel.is_cancelled())
    }

    /// Mark session `id` finished if it is still the active one.
    pub fn finish(&mut self, id: Uuid) {
        if self.active.as_ref().is_some_and(|s| s.id == id) {
            self.active = None;
        }
    }

    /// Cancel the active session and drop its queue. Returns whether one was running.
    pub fn abort(&mut self) -> bool {
        match self.active.take() {
            Some(mut session) => {
                session.cancel.cancel();
                session.queue.clear();
                debug!(session = %session.id, "Pre-cache session aborted");
                true
            }
            None => false,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.active.is_some()
    }

    /// Requests still queued for the active session.
    pub fn pending(&self) -> usize {
        self.active.as_ref().map(|s| s.queue.len()).unwrap_or(0)
    }
}
