//! Coordinator worker thread and the handles that talk to it
//!
//! Every mutation of coordinator state happens on one thread. Clients, the
//! engine's interrupt sources and fence callbacks post [`Task`]s onto a
//! crossbeam channel; replies travel back on tokio oneshots so async callers
//! can await them.

use super::{Coordinator, Snapshot};
use crate::config::CoordinatorConfig;
use crate::display::DisplayInfo;
use crate::engine::{BufferAllocator, DisplayEngine};
use crate::fence::{FenceKey, FenceNotifier};
use crate::session::{Reply, Request, SessionEvent};
use crate::status::Status;
use crate::types::{ClientId, ClientKind, ConfigStamp, DisplayId, VirtconMode};
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

/// Work item for the coordinator thread
pub enum Task {
    Connect {
        kind: ClientKind,
        events: mpsc::UnboundedSender<SessionEvent>,
        reply: oneshot::Sender<Result<ClientId, Status>>,
    },
    Disconnect {
        client: ClientId,
    },
    Request {
        client: ClientId,
        request: Request,
        /// `None` for fire-and-forget requests
        reply: Option<oneshot::Sender<Result<Reply, Status>>>,
    },
    SetVirtconMode(VirtconMode),
    Vsync {
        display_id: DisplayId,
        timestamp: u64,
        stamp: ConfigStamp,
    },
    DisplaysChanged {
        added: Vec<DisplayInfo>,
        removed: Vec<DisplayId>,
    },
    CaptureComplete,
    FenceFired {
        client: ClientId,
        key: FenceKey,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown,
}

/// Start the coordinator thread. It runs until [`CoordinatorHandle::shutdown`].
pub fn spawn(
    engine: Arc<dyn DisplayEngine>,
    allocator: Arc<dyn BufferAllocator>,
    config: CoordinatorConfig,
) -> std::io::Result<(CoordinatorHandle, JoinHandle<()>)> {
    let (tx, rx) = unbounded();
    let fence_tx = tx.clone();

    let thread = std::thread::Builder::new()
        .name("display-coordinator".to_string())
        .spawn(move || {
            let notifier: FenceNotifier = Arc::new(move |client, key| {
                let _ = fence_tx.send(Task::FenceFired { client, key });
            });
            let mut coordinator = Coordinator::new(engine, allocator, &config, notifier);
            run(&mut coordinator, rx);
        })?;

    Ok((CoordinatorHandle { tasks: tx }, thread))
}

fn run(coordinator: &mut Coordinator, tasks: Receiver<Task>) {
    info!("Coordinator worker started");
    while let Ok(task) = tasks.recv() {
        if !dispatch(coordinator, task) {
            break;
        }
    }
    coordinator.shutdown();
    info!("Coordinator worker stopped");
}

/// Run one task. Returns false once the worker should stop.
pub fn dispatch(coordinator: &mut Coordinator, task: Task) -> bool {
    match task {
        Task::Connect { kind, events, reply } => {
            let _ = reply.send(coordinator.connect(kind, events));
        }
        Task::Disconnect { client } => coordinator.disconnect(client),
        Task::Request { client, request, reply } => {
            let result = coordinator.handle_request(client, request);
            match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(status) = result {
                        debug!("Client {} one-way request failed: {}", client, status);
                    }
                }
            }
        }
        Task::SetVirtconMode(mode) => coordinator.set_virtcon_mode(mode),
        Task::Vsync { display_id, timestamp, stamp } => {
            if let Some(outcome) = coordinator.on_display_vsync(display_id, timestamp, stamp) {
                if !outcome.retired.is_empty() {
                    trace!("Display {} retired {} image(s)", display_id, outcome.retired.len());
                }
            }
        }
        Task::DisplaysChanged { added, removed } => coordinator.on_displays_changed(added, removed),
        Task::CaptureComplete => coordinator.on_capture_complete(),
        Task::FenceFired { client, key } => coordinator.on_fence_fired(client, key),
        Task::Snapshot { reply } => {
            let _ = reply.send(coordinator.snapshot());
        }
        Task::Shutdown => return false,
    }
    true
}

/// Cloneable entry point into the coordinator thread
#[derive(Clone)]
pub struct CoordinatorHandle {
    tasks: Sender<Task>,
}

impl CoordinatorHandle {
    /// Open a session of `kind`
    pub async fn connect(&self, kind: ClientKind) -> Result<SessionHandle, Status> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.tasks
            .send(Task::Connect { kind, events: events_tx, reply })
            .map_err(|_| Status::PeerClosed)?;
        let id = rx.await.map_err(|_| Status::PeerClosed)??;
        Ok(SessionHandle { id, tasks: self.tasks.clone(), events })
    }

    /// Policy override from outside any session
    pub fn set_virtcon_mode(&self, mode: VirtconMode) {
        let _ = self.tasks.send(Task::SetVirtconMode(mode));
    }

    /// Vsync interrupt. Returns false once the worker is gone.
    pub fn on_vsync(&self, display_id: DisplayId, timestamp: u64, stamp: ConfigStamp) -> bool {
        self.tasks
            .send(Task::Vsync { display_id, timestamp, stamp })
            .is_ok()
    }

    /// Hotplug interrupt
    pub fn on_displays_changed(&self, added: Vec<DisplayInfo>, removed: Vec<DisplayId>) {
        let _ = self.tasks.send(Task::DisplaysChanged { added, removed });
    }

    pub fn on_capture_complete(&self) {
        let _ = self.tasks.send(Task::CaptureComplete);
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.tasks.send(Task::Snapshot { reply }).ok()?;
        rx.await.ok()
    }

    /// Tear down every session and stop the worker
    pub fn shutdown(&self) {
        let _ = self.tasks.send(Task::Shutdown);
    }
}

/// A connected client. Dropping it closes the session.
pub struct SessionHandle {
    id: ClientId,
    tasks: Sender<Task>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Send a request and wait for its reply. A closed session reports
    /// [`Status::PeerClosed`].
    pub async fn call(&self, request: Request) -> Result<Reply, Status> {
        let (reply, rx) = oneshot::channel();
        self.tasks
            .send(Task::Request { client: self.id, request, reply: Some(reply) })
            .map_err(|_| Status::PeerClosed)?;
        rx.await.map_err(|_| Status::PeerClosed)?
    }

    /// Send a request without waiting for the outcome
    pub fn send(&self, request: Request) -> Result<(), Status> {
        self.tasks
            .send(Task::Request { client: self.id, request, reply: None })
            .map_err(|_| Status::PeerClosed)
    }

    /// Next event, or `None` once the session is closed
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.tasks.send(Task::Disconnect { client: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{HeadlessAllocator, HeadlessEngine};
    use crate::types::{DisplayMode, PixelFormat};

    fn start() -> (CoordinatorHandle, JoinHandle<()>, Arc<HeadlessEngine>) {
        let engine = Arc::new(HeadlessEngine::new(false));
        let (handle, thread) = spawn(
            engine.clone(),
            Arc::new(HeadlessAllocator::new()),
            CoordinatorConfig::default(),
        )
        .unwrap();
        handle.on_displays_changed(
            vec![DisplayInfo {
                id: DisplayId(1),
                modes: vec![DisplayMode { width: 64, height: 64, refresh_rate_millihertz: 60_000 }],
                pixel_formats: vec![PixelFormat::Argb8888],
                cursor_formats: vec![],
            }],
            vec![],
        );
        (handle, thread, engine)
    }

    #[tokio::test]
    async fn session_round_trip() {
        let (handle, thread, engine) = start();
        let mut session = handle.connect(ClientKind::Primary).await.unwrap();

        assert!(matches!(
            session.next_event().await,
            Some(SessionEvent::DisplaysChanged { .. })
        ));
        assert_eq!(session.next_event().await, Some(SessionEvent::OwnershipChanged(true)));

        let layer_id = match session.call(Request::CreateLayer).await.unwrap() {
            Reply::Layer(id) => id,
            other => panic!("unexpected reply {:?}", other),
        };
        session
            .call(Request::SetLayerColorConfig {
                layer_id,
                format: PixelFormat::Argb8888,
                bytes: vec![0, 0, 0, 0xff],
            })
            .await
            .unwrap();
        session
            .call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![layer_id] })
            .await
            .unwrap();
        session.call(Request::ApplyConfig).await.unwrap();
        assert_eq!(engine.last_applied_stamp(), ConfigStamp(1));

        assert_eq!(handle.connect(ClientKind::Primary).await.err(), Some(Status::AlreadyBound));

        drop(session);
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.sessions.is_empty());
        assert_eq!(snapshot.live_layers, 0);

        handle.shutdown();
        thread.join().unwrap();
        assert!(!handle.on_vsync(DisplayId(1), 0, ConfigStamp(1)));
    }

    #[tokio::test]
    async fn violation_closes_session() {
        let (handle, thread, _engine) = start();
        let session = handle.connect(ClientKind::Primary).await.unwrap();
        let result = session
            .call(Request::DestroyLayer { layer_id: crate::types::LayerId(9) })
            .await;
        assert_eq!(result, Err(Status::PeerClosed));
        assert_eq!(session.call(Request::CreateLayer).await, Err(Status::PeerClosed));

        handle.shutdown();
        thread.join().unwrap();
    }
}
