//! Coordinator: connections, ownership and event routing
//!
//! One [`Coordinator`] lives on the worker thread and owns every session and
//! the [`CoordinatorCore`]. It decides which session owns the displays,
//! routes hardware events to sessions and turns protocol violations into
//! teardown.

pub mod core;
pub mod worker;

pub use self::core::{CoordinatorCore, DisplaySnapshot, VsyncOutcome};
pub use worker::{spawn, CoordinatorHandle, SessionHandle, Task};

use crate::config::CoordinatorConfig;
use crate::display::DisplayInfo;
use crate::engine::{BufferAllocator, DisplayEngine};
use crate::fence::{FenceKey, FenceNotifier, FenceRegistry};
use crate::session::{Reply, Request, Session, SessionError, SessionEvent, SessionProxy, SessionSnapshot, VsyncLimits};
use crate::status::Status;
use crate::types::{ClientId, ClientKind, ConfigStamp, DisplayId, VirtconMode};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Diagnostic view of the whole coordinator
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub controller_stamp: ConfigStamp,
    pub virtcon_mode: VirtconMode,
    pub active: Option<ClientId>,
    pub live_layers: usize,
    pub displays: Vec<DisplaySnapshot>,
    pub sessions: Vec<SessionSnapshot>,
}

pub struct Coordinator {
    core: CoordinatorCore,
    sessions: BTreeMap<ClientId, Session>,
    primary: Option<ClientId>,
    virtcon: Option<ClientId>,
    /// Session whose configuration is on the hardware
    active: Option<ClientId>,
    virtcon_mode: VirtconMode,
    next_client_id: u64,
    vsync_limits: VsyncLimits,
    fence_notifier: FenceNotifier,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn DisplayEngine>,
        allocator: Arc<dyn BufferAllocator>,
        config: &CoordinatorConfig,
        fence_notifier: FenceNotifier,
    ) -> Self {
        Self {
            core: CoordinatorCore::new(engine, allocator, config.max_layers),
            sessions: BTreeMap::new(),
            primary: None,
            virtcon: None,
            active: None,
            virtcon_mode: config.virtcon_mode,
            next_client_id: 0,
            vsync_limits: config.vsync_limits(),
            fence_notifier,
        }
    }

    pub fn core(&self) -> &CoordinatorCore {
        &self.core
    }

    pub fn session(&self, id: ClientId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn active(&self) -> Option<ClientId> {
        self.active
    }

    pub fn virtcon_mode(&self) -> VirtconMode {
        self.virtcon_mode
    }

    /// Open a session. At most one client of each kind may be connected.
    pub fn connect(&mut self, kind: ClientKind, events: mpsc::UnboundedSender<SessionEvent>) -> Result<ClientId, Status> {
        let slot = match kind {
            ClientKind::Primary => &mut self.primary,
            ClientKind::Virtcon => &mut self.virtcon,
        };
        if slot.is_some() {
            return Err(Status::AlreadyBound);
        }

        self.next_client_id += 1;
        let id = ClientId(self.next_client_id);
        *slot = Some(id);

        let proxy = SessionProxy::new(id, events, self.vsync_limits);
        let fences = FenceRegistry::new(id, self.fence_notifier.clone());
        let mut session = Session::new(id, kind, proxy, fences);
        session.on_displays_changed(&self.core.display_infos(), &[]);
        self.sessions.insert(id, session);
        info!("Client {} connected as {}", id, kind);

        self.handle_ownership_changes();
        if self.active != Some(id) {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.set_ownership(false, &mut self.core);
            }
        }
        Ok(id)
    }

    /// Tear down a session. Unknown ids are ignored.
    pub fn disconnect(&mut self, id: ClientId) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        session.tear_down(&mut self.core);
        self.core.cancel_delayed_apply(id);
        info!("Client {} ({}) disconnected", id, session.kind());

        if self.primary == Some(id) {
            self.primary = None;
        }
        if self.virtcon == Some(id) {
            self.virtcon = None;
            self.virtcon_mode = VirtconMode::Inactive;
        }
        if self.active == Some(id) {
            self.active = None;
        }
        self.handle_ownership_changes();
    }

    /// Run one client request. A protocol violation tears the session down
    /// and is reported as [`Status::PeerClosed`].
    pub fn handle_request(&mut self, id: ClientId, request: Request) -> Result<Reply, Status> {
        if let Request::SetVirtconMode { mode } = request {
            if self.virtcon != Some(id) {
                return Err(Status::AccessDenied);
            }
            self.set_virtcon_mode(mode);
            return Ok(Reply::None);
        }

        let Some(session) = self.sessions.get_mut(&id) else {
            return Err(Status::PeerClosed);
        };
        match session.handle(request, &mut self.core) {
            Ok(reply) => Ok(reply),
            Err(SessionError::Status(status)) => Err(status),
            Err(SessionError::ProtocolViolation(reason)) => {
                warn!("Client {} violated the protocol: {}", id, reason);
                self.disconnect(id);
                Err(Status::PeerClosed)
            }
        }
    }

    pub fn set_virtcon_mode(&mut self, mode: VirtconMode) {
        if mode != self.virtcon_mode {
            info!("Virtcon mode {:?} -> {:?}", self.virtcon_mode, mode);
        }
        self.virtcon_mode = mode;
        self.handle_ownership_changes();
    }

    fn handle_ownership_changes(&mut self) {
        let virtcon_owns = self.virtcon.is_some()
            && (self.virtcon_mode == VirtconMode::Forced
                || (self.virtcon_mode == VirtconMode::Fallback && self.primary.is_none()));
        let new_active = if virtcon_owns { self.virtcon } else { self.primary };
        if new_active == self.active {
            return;
        }

        if let Some(old) = self.active.and_then(|id| self.sessions.get_mut(&id)) {
            old.set_ownership(false, &mut self.core);
        }
        if let Some(new) = new_active.and_then(|id| self.sessions.get_mut(&id)) {
            new.set_ownership(true, &mut self.core);
        }
        debug!("Active client {:?} -> {:?}", self.active, new_active);
        self.active = new_active;
    }

    /// Hardware vsync for `display_id` reporting controller stamp `stamp`
    pub fn on_display_vsync(&mut self, display_id: DisplayId, timestamp: u64, stamp: ConfigStamp) -> Option<VsyncOutcome> {
        let outcome = self.core.on_display_vsync(display_id, stamp)?;

        for session in self.sessions.values_mut() {
            session.on_display_vsync(display_id, timestamp, stamp);
        }
        if let Some(client) = outcome.reapply {
            if let Some(session) = self.sessions.get_mut(&client) {
                debug!("Reissuing deferred apply of client {}", client);
                session.reapply(&mut self.core);
            }
        }
        Some(outcome)
    }

    /// Hotplug
    pub fn on_displays_changed(&mut self, added: Vec<DisplayInfo>, removed: Vec<DisplayId>) {
        for id in &removed {
            self.core.remove_display(*id);
        }
        for info in &added {
            self.core.add_display(info.clone());
        }
        info!("Displays changed: {} added, {} removed", added.len(), removed.len());
        for session in self.sessions.values_mut() {
            session.on_displays_changed(&added, &removed);
        }
    }

    pub fn on_capture_complete(&mut self) {
        match self.sessions.values_mut().find(|s| s.flags().capture_active()) {
            Some(session) => session.on_capture_complete(&mut self.core),
            None => debug!("Capture completed with no session waiting"),
        }
        self.core.release_orphaned_captures();
    }

    pub fn on_fence_fired(&mut self, client: ClientId, key: FenceKey) {
        if let Some(session) = self.sessions.get_mut(&client) {
            session.on_fence_fired(key, &mut self.core);
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            controller_stamp: self.core.controller_stamp(),
            virtcon_mode: self.virtcon_mode,
            active: self.active,
            live_layers: self.core.live_layers(),
            displays: self.core.snapshot(),
            sessions: self.sessions.values().map(Session::snapshot).collect(),
        }
    }

    /// Tear down every session
    pub fn shutdown(&mut self) {
        let ids: Vec<ClientId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
    }
}
