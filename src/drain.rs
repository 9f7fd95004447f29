//! Graceful drain coordination.
//!
//! Tracks every accepted connection's state so shutdown can close idle
//! connections immediately, let active ones finish, and give up after the
//! drain timeout. Hijacked (upgraded) connections leave the idle set for
//! good; the drainer must never close a live websocket splice.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Returned when active connections outlive the drain timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainTimeout;

#[derive(Default)]
struct DrainState {
    active: usize,
    idle: HashSet<u64>,
    hijacked: HashSet<u64>,
}

pub struct DrainController {
    state: Mutex<DrainState>,
    next_id: AtomicU64,
    draining: AtomicBool,
    drained: Notify,
}

impl DrainController {
    pub fn new() -> Arc<DrainController> {
        Arc::new(DrainController {
            state: Mutex::new(DrainState::default()),
            next_id: AtomicU64::new(1),
            draining: AtomicBool::new(false),
            drained: Notify::new(),
        })
    }

    /// Registers a connection as active; returns its tracking id.
    pub fn track_active(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().expect("drain lock");
        state.active += 1;
        state.idle.remove(&id);
        id
    }

    /// An active connection finished its request and went idle.
    pub fn mark_idle(&self, id: u64) {
        let mut state = self.state.lock().expect("drain lock");
        if state.hijacked.contains(&id) {
            return;
        }
        state.active = state.active.saturating_sub(1);
        state.idle.insert(id);
        drop(state);
        self.notify_if_drained();
    }

    /// The connection was taken over (websocket upgrade); it no longer
    /// participates in idle tracking, so shutdown cannot close it.
    pub fn mark_hijacked(&self, id: u64) {
        let mut state = self.state.lock().expect("drain lock");
        state.idle.remove(&id);
        state.active = state.active.saturating_sub(1);
        state.hijacked.insert(id);
        drop(state);
        self.notify_if_drained();
    }

    pub fn mark_closed(&self, id: u64) {
        let mut state = self.state.lock().expect("drain lock");
        if !state.idle.remove(&id) && !state.hijacked.remove(&id) {
            state.active = state.active.saturating_sub(1);
        }
        drop(state);
        self.notify_if_drained();
    }

    pub fn active_connections(&self) -> usize {
        self.state.lock().expect("drain lock").active
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Starts the drain: no new work is admitted (health degrades) and the
    /// idle set is handed back for the owner to close.
    pub fn begin_drain(&self) -> Vec<u64> {
        self.draining.store(true, Ordering::Relaxed);
        let mut state = self.state.lock().expect("drain lock");
        let idle: Vec<u64> = state.idle.drain().collect();
        drop(state);
        self.notify_if_drained();
        idle
    }

    /// Resolves when active connections reach zero, or fails after the
    /// timeout.
    pub async fn wait(&self, timeout: Duration) -> Result<(), DrainTimeout> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = std::pin::pin!(self.drained.notified());
            // Register interest before re-checking, so a notification
            // arriving between the check and the await is not lost.
            notified.as_mut().enable();
            if self.active_connections() == 0 {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(_) => continue,
                Err(_) => return Err(DrainTimeout),
            }
        }
    }

    fn notify_if_drained(&self) {
        if self.is_draining() && self.active_connections() == 0 {
            self.drained.notify_waiters();
        }
    }
}
