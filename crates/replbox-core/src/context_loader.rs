//! Creation and teardown of the nested "frame" surface.
//!
//! The frame backend runs the guest runtime as a cooperatively scheduled
//! task inside the controller's own runtime. The loader keeps at most one
//! such surface attached; creating a new one detaches the previous one
//! first. Surfaces can be requested before the host is ready to attach
//! them (for example while the engine catalog is still being assembled):
//! such requests are queued and replayed, in order, by
//! [`ContextLoader::mark_host_ready`].

use crate::guest::{EngineCatalog, GuestRuntime};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Resource every frame surface is pointed at.
pub const FRAME_BOOTSTRAP: &str = "replbox://frame/bootstrap";

/// Message target of an attached frame.
pub struct FrameHandle {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    inbound: Option<mpsc::UnboundedReceiver<String>>,
}

impl FrameHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Post a raw payload to the frame. Frames are unaddressed: whichever
    /// frame is attached receives it.
    pub fn post_message(&self, raw: String) -> bool {
        self.outbound.send(raw).is_ok()
    }

    /// Payloads posted by the frame. Can only be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inbound.take()
    }
}

type ReadyCallback = Box<dyn FnOnce(FrameHandle) + Send>;
type PendingAppend = Box<dyn FnOnce(&mut LoaderState) + Send>;

struct FrameSurface {
    id: u64,
    task: JoinHandle<()>,
}

struct LoaderState {
    host_ready: bool,
    pending: Vec<PendingAppend>,
    surface: Option<FrameSurface>,
    next_id: u64,
    bootstrap: String,
    catalog: Arc<EngineCatalog>,
}

impl LoaderState {
    fn detach(&mut self) {
        if let Some(surface) = self.surface.take() {
            log::debug!("Detaching frame surface #{}", surface.id);
            surface.task.abort();
        }
    }

    fn attach(&mut self, callback: ReadyCallback) {
        self.detach();
        self.next_id += 1;
        let id = self.next_id;

        let (to_frame, frame_inbound) = mpsc::unbounded_channel();
        let (frame_outbound, from_frame) = mpsc::unbounded_channel();
        let runtime = GuestRuntime::new(Arc::clone(&self.catalog), frame_outbound);
        let handle = FrameHandle {
            id,
            outbound: to_frame,
            inbound: Some(from_frame),
        };

        log::debug!("Attaching frame surface #{} at {}", id, self.bootstrap);
        let task = tokio::spawn(async move {
            // The surface counts as ready once its task is scheduled.
            callback(handle);
            runtime.run(frame_inbound).await;
        });
        self.surface = Some(FrameSurface { id, task });
    }
}

/// Cheap to clone; clones manage the same surface.
#[derive(Clone)]
pub struct ContextLoader {
    state: Arc<Mutex<LoaderState>>,
}

impl ContextLoader {
    /// A loader whose host is ready immediately.
    pub fn new(catalog: Arc<EngineCatalog>) -> Self {
        let loader = Self::deferred(catalog);
        loader.mark_host_ready();
        loader
    }

    /// A loader that queues frame creation until [`mark_host_ready`] runs.
    ///
    /// [`mark_host_ready`]: ContextLoader::mark_host_ready
    pub fn deferred(catalog: Arc<EngineCatalog>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoaderState {
                host_ready: false,
                pending: Vec::new(),
                surface: None,
                next_id: 0,
                bootstrap: FRAME_BOOTSTRAP.to_string(),
                catalog,
            })),
        }
    }

    pub fn with_bootstrap(self, bootstrap: impl Into<String>) -> Self {
        self.lock().bootstrap = bootstrap.into();
        self
    }

    pub fn is_host_ready(&self) -> bool {
        self.lock().host_ready
    }

    /// Flush queued appends in submission order. Later calls are no-ops.
    pub fn mark_host_ready(&self) {
        let mut state = self.lock();
        if state.host_ready {
            return;
        }
        state.host_ready = true;
        let pending = std::mem::take(&mut state.pending);
        log::debug!("Frame host ready, flushing {} queued appends", pending.len());
        for append in pending {
            append(&mut state);
        }
    }

    /// Replace the current frame with a fresh one and hand its message
    /// target to `callback` once it is ready.
    pub fn create_frame_context<F>(&self, callback: F)
    where
        F: FnOnce(FrameHandle) + Send + 'static,
    {
        let callback: ReadyCallback = Box::new(callback);
        self.append(Box::new(move |state: &mut LoaderState| state.attach(callback)));
    }

    pub fn destroy_frame(&self) {
        self.lock().detach();
    }

    /// Detach the current frame only if it is the one identified by `id`.
    pub fn destroy_frame_if(&self, id: u64) {
        let mut state = self.lock();
        if state.surface.as_ref().map(|surface| surface.id) == Some(id) {
            state.detach();
        }
    }

    pub fn has_frame(&self) -> bool {
        self.lock().surface.is_some()
    }

    pub fn pending_appends(&self) -> usize {
        self.lock().pending.len()
    }

    fn append(&self, append: PendingAppend) {
        let mut state = self.lock();
        if state.host_ready {
            append(&mut state);
        } else {
            state.pending.push(append);
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::engines::ECHO_ENGINE;
    use crate::protocol::{Message, IMPORT_SCRIPTS, READY};
    use serde_json::json;
    use tokio::sync::oneshot;

    fn catalog() -> Arc<EngineCatalog> {
        Arc::new(EngineCatalog::with_builtin_engines())
    }

    #[tokio::test]
    async fn test_frame_reports_ready_and_speaks_protocol() {
        let loader = ContextLoader::new(catalog());
        let (tx, rx) = oneshot::channel();
        loader.create_frame_context(move |handle| {
            let _ = tx.send(handle);
        });

        let mut handle = rx.await.unwrap();
        let mut inbound = handle.take_inbound().unwrap();
        assert!(handle.take_inbound().is_none());

        let import = Message::new(IMPORT_SCRIPTS, json!([ECHO_ENGINE]));
        assert!(handle.post_message(import.encode().unwrap()));
        let reply = Message::decode(&inbound.recv().await.unwrap()).unwrap();
        assert_eq!(reply.kind, READY);
    }

    #[tokio::test]
    async fn test_appends_queue_until_host_ready() {
        let loader = ContextLoader::deferred(catalog());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let mut done_tx = Some(done_tx);

        for label in ["first", "second"] {
            let order = order.clone();
            let done = if label == "second" { done_tx.take() } else { None };
            loader.create_frame_context(move |handle| {
                order.lock().unwrap().push((label, handle.id()));
                if let Some(done) = done {
                    let _ = done.send(());
                }
            });
        }

        assert!(!loader.has_frame());
        assert_eq!(loader.pending_appends(), 2);

        loader.mark_host_ready();
        loader.mark_host_ready();
        assert_eq!(loader.pending_appends(), 0);
        done_rx.await.unwrap();

        // The first surface is replaced before it is ever scheduled.
        assert_eq!(*order.lock().unwrap(), vec![("second", 2)]);
        assert!(loader.has_frame());
    }

    #[tokio::test]
    async fn test_new_frame_detaches_previous() {
        let loader = ContextLoader::new(catalog());
        let (tx, rx) = oneshot::channel();
        loader.create_frame_context(move |handle| {
            let _ = tx.send(handle);
        });
        let mut first = rx.await.unwrap();
        let mut first_inbound = first.take_inbound().unwrap();

        let (tx, rx) = oneshot::channel();
        loader.create_frame_context(move |handle| {
            let _ = tx.send(handle);
        });
        let second = rx.await.unwrap();
        assert_eq!(second.id(), first.id() + 1);

        // The first frame's runtime is gone, so its channel closes.
        assert!(first_inbound.recv().await.is_none());

        loader.destroy_frame_if(first.id());
        assert!(loader.has_frame());
        loader.destroy_frame_if(second.id());
        assert!(!loader.has_frame());
    }
}
