//! Heartbeat monitor.
//!
//! Tracks the last `beat` seen from a provider. The monitor is a scoped
//! resource: its background checker lives exactly as long as the value,
//! so dropping it on any exit path of the listener loop stops the checker.

use crate::message::{Message, MessageType};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Stand-in for deadlines too far out to represent (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + delay`, saturating at [`FAR_FUTURE`] instead of overflowing.
pub(crate) fn deadline(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

struct State {
    timeout: Option<Duration>,
    last_seen: Mutex<Instant>,
    alive: watch::Sender<bool>,
}

impl State {
    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_alive(&self) -> bool {
        match self.timeout {
            Some(timeout) => self.last_seen().elapsed() < timeout,
            None => true,
        }
    }
}

pub struct HeartbeatMonitor {
    state: Arc<State>,
    checker: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Start monitoring. `None` disables monitoring: the peer is always alive.
    ///
    /// The start instant counts as the first beat, which gives the peer one
    /// full timeout of grace before it can be declared silent.
    pub fn start(timeout: Option<Duration>) -> Self {
        let (alive, _) = watch::channel(true);
        let state = Arc::new(State {
            timeout,
            last_seen: Mutex::new(Instant::now()),
            alive,
        });

        let checker = timeout.map(|timeout| tokio::spawn(check_liveness(Arc::clone(&state), timeout)));

        Self { state, checker }
    }

    /// Record a heartbeat. Messages of any other type are ignored.
    pub fn feed(&self, message: &Message) {
        if message.kind != MessageType::Beat {
            return;
        }
        *self
            .state
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();

        self.state.alive.send_if_modified(|alive| {
            if *alive {
                return false;
            }
            *alive = true;
            info!(topic = %message.topic, "Heartbeat resumed");
            true
        });
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    /// Receiver that flips to `false` when the peer goes silent and back to
    /// `true` when beats resume.
    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.state.alive.subscribe()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Some(checker) = self.checker.take() {
            checker.abort();
        }
    }
}

async fn check_liveness(state: Arc<State>, timeout: Duration) {
    loop {
        tokio::time::sleep_until(deadline(state.last_seen(), timeout)).await;
        if state.is_alive() {
            // A beat arrived while sleeping; rearm from it.
            continue;
        }

        state.alive.send_if_modified(|alive| {
            if !*alive {
                return false;
            }
            *alive = false;
            warn!(?timeout, "No heartbeat received within timeout");
            true
        });

        let mut liveness = state.alive.subscribe();
        if liveness.wait_for(|alive| *alive).await.is_err() {
            return;
        }
    }
}
