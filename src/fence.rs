//! Wait/signal events and the per-session fence registry
//!
//! An [`Event`] is the shared primitive a client signals from its own
//! context. A [`FenceRegistry`] binds events to client-chosen ids and arms
//! one-shot waits on them. A fired wait never runs coordinator logic in
//! place: it calls the registry's notifier, which posts a task to the
//! coordinator worker carrying the [`FenceKey`] of the wait.

use crate::types::{ClientId, EventId};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Waiter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct EventState {
    signaled: bool,
    next_token: u64,
    waiters: Vec<(u64, Waiter)>,
}

/// Shared wait/signal primitive
#[derive(Clone, Default)]
pub struct Event {
    state: Arc<Mutex<EventState>>,
}

/// Identifies one armed wait on an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitToken(u64);

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event and run every armed waiter once
    pub fn signal(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.signaled = true;
            std::mem::take(&mut state.waiters)
        };
        for (_, waiter) in waiters {
            waiter();
        }
    }

    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Arm `waiter` to run on the next signal.
    ///
    /// Returns `None` without arming when the event is already signaled.
    pub fn arm(&self, waiter: impl FnOnce() + Send + 'static) -> Option<WaitToken> {
        let mut state = self.state.lock();
        if state.signaled {
            return None;
        }
        state.next_token += 1;
        let token = state.next_token;
        state.waiters.push((token, Box::new(waiter)));
        Some(WaitToken(token))
    }

    /// Drop an armed waiter. Returns false if it already ran.
    pub fn cancel(&self, token: WaitToken) -> bool {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|(t, _)| *t != token.0);
        state.waiters.len() != before
    }

    fn same_as(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// Serial number of one armed fence wait, unique within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceKey(pub u64);

/// Callback the registry invokes, from the signaling context, when a wait fires
pub type FenceNotifier = Arc<dyn Fn(ClientId, FenceKey) + Send + Sync>;

/// Outcome of arming a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    /// Nothing to wait for
    Ready,
    /// The image becomes ready once the notifier reports this key
    Pending(FenceKey),
}

/// Why an event import was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceError {
    InvalidId,
    DuplicateId(EventId),
    AlreadyImported(EventId),
}

impl fmt::Display for FenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FenceError::InvalidId => write!(f, "event id {} is reserved", EventId::INVALID),
            FenceError::DuplicateId(id) => write!(f, "event id {} imported twice", id),
            FenceError::AlreadyImported(id) => {
                write!(f, "event already imported under id {}", id)
            }
        }
    }
}

impl std::error::Error for FenceError {}

struct ArmedWait {
    event: Event,
    token: WaitToken,
}

/// Fences of one session
pub struct FenceRegistry {
    client: ClientId,
    fences: HashMap<EventId, Event>,
    armed: HashMap<FenceKey, ArmedWait>,
    next_key: u64,
    notifier: FenceNotifier,
}

impl FenceRegistry {
    pub fn new(client: ClientId, notifier: FenceNotifier) -> Self {
        Self {
            client,
            fences: HashMap::new(),
            armed: HashMap::new(),
            next_key: 0,
            notifier,
        }
    }

    pub fn import_event(&mut self, event: Event, id: EventId) -> Result<(), FenceError> {
        if id == EventId::INVALID {
            return Err(FenceError::InvalidId);
        }
        if self.fences.contains_key(&id) {
            return Err(FenceError::DuplicateId(id));
        }
        if let Some((existing, _)) = self.fences.iter().find(|(_, e)| e.same_as(&event)) {
            return Err(FenceError::AlreadyImported(*existing));
        }
        self.fences.insert(id, event);
        Ok(())
    }

    /// Forget `id`. Waits already armed on the event stay armed.
    pub fn release_event(&mut self, id: EventId) {
        if self.fences.remove(&id).is_none() {
            debug!("Client {} released unknown event {}", self.client, id);
        }
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.fences.contains_key(&id)
    }

    /// Arm a one-shot wait on event `id`.
    ///
    /// An event that is already signaled is consumed (reset) and reported
    /// ready. So is an id the session never imported.
    pub fn arm_wait(&mut self, id: EventId) -> FenceWait {
        let Some(event) = self.fences.get(&id).cloned() else {
            debug!("Client {} waits on unknown event {}, treating as ready", self.client, id);
            return FenceWait::Ready;
        };

        self.next_key += 1;
        let key = FenceKey(self.next_key);
        let notifier = self.notifier.clone();
        let client = self.client;
        match event.arm(move || notifier(client, key)) {
            Some(token) => {
                trace!("Client {} armed fence {:?} on event {}", self.client, key, id);
                self.armed.insert(key, ArmedWait { event, token });
                FenceWait::Pending(key)
            }
            None => {
                event.reset();
                FenceWait::Ready
            }
        }
    }

    /// Consume the wait for `key` after its notifier ran. Returns false for a
    /// wait that was disarmed in the meantime.
    pub fn on_fired(&mut self, key: FenceKey) -> bool {
        match self.armed.remove(&key) {
            Some(wait) => {
                wait.event.reset();
                true
            }
            None => false,
        }
    }

    /// Cancel an armed wait whose image no longer needs it
    pub fn disarm(&mut self, key: FenceKey) {
        if let Some(wait) = self.armed.remove(&key) {
            wait.event.cancel(wait.token);
        }
    }

    /// Signal event `id` on the client's behalf. Returns false if unknown.
    pub fn signal(&self, id: EventId) -> bool {
        match self.fences.get(&id) {
            Some(event) => {
                event.signal();
                true
            }
            None => false,
        }
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Cancel every wait and forget every event
    pub fn clear(&mut self) {
        for (_, wait) in self.armed.drain() {
            wait.event.cancel(wait.token);
        }
        self.fences.clear();
    }
}
