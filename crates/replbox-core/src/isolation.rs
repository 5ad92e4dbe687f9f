//! Ownership of the single live isolation context.
//!
//! An [`IsolationContext`] holds at most one backend: a worker process or
//! a frame surface. Spawning always kills the previous backend first and
//! bumps a generation counter, so a frame that becomes ready after it was
//! superseded is detached instead of installed. Every inbound payload is
//! decoded and republished on the shared [`EventBus`]; payloads that do
//! not decode are dropped. A backend that goes quiet on its own (the worker
//! exited, the frame was torn down) is retired and reported as [`EXIT`].

use crate::context_loader::{ContextLoader, FrameHandle};
use crate::errors::SandboxError;
use crate::event_bus::EventBus;
use crate::input::InputServerConfig;
use crate::protocol::{Message, EXIT, IMPORT_SCRIPTS, SET_INPUT_SERVER};
use crate::worker::WorkerBackend;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Worker,
    Frame,
}

enum Backend {
    None,
    Worker(WorkerBackend),
    Frame(FrameHandle),
}

struct ContextState {
    generation: u64,
    kind: Option<BackendKind>,
    backend: Backend,
    pump: Option<JoinHandle<()>>,
}

impl ContextState {
    fn post(&self, message: &Message) -> Result<(), SandboxError> {
        let raw = message.encode()?;
        match &self.backend {
            Backend::Worker(worker) => worker.post(raw),
            Backend::Frame(frame) => {
                if frame.post_message(raw) {
                    Ok(())
                } else {
                    Err(SandboxError::Io("Frame surface is detached".to_string()))
                }
            }
            Backend::None => Err(SandboxError::ContextNotLoaded),
        }
    }

    /// Import the payloads (minus the entry point), then announce the
    /// input configuration if there is one.
    fn bootstrap(
        &self,
        imports: &[String],
        input: Option<&InputServerConfig>,
    ) -> Result<(), SandboxError> {
        self.post(&Message::new(IMPORT_SCRIPTS, json!(imports)))?;
        if let Some(config) = input {
            self.post(&Message::new(SET_INPUT_SERVER, config.to_value()))?;
        }
        Ok(())
    }

    /// Drop the backend and bump the generation. The pump handle goes back
    /// to the caller.
    fn teardown(&mut self, loader: &ContextLoader) -> Option<JoinHandle<()>> {
        self.generation += 1;
        match std::mem::replace(&mut self.backend, Backend::None) {
            Backend::Worker(mut worker) => worker.terminate(),
            Backend::Frame(frame) => loader.destroy_frame_if(frame.id()),
            Backend::None => {
                // A frame may still be on its way; the generation bump makes
                // its ready callback detach it.
            }
        }
        self.kind = None;
        self.pump.take()
    }
}

/// Cheap to clone; clones control the same context.
#[derive(Clone)]
pub struct IsolationContext {
    bus: EventBus,
    loader: ContextLoader,
    supports_threads: bool,
    input: Option<InputServerConfig>,
    state: Arc<Mutex<ContextState>>,
}

impl IsolationContext {
    pub fn new(bus: EventBus, loader: ContextLoader) -> Self {
        Self {
            bus,
            loader,
            supports_threads: true,
            input: None,
            state: Arc::new(Mutex::new(ContextState {
                generation: 0,
                kind: None,
                backend: Backend::None,
                pump: None,
            })),
        }
    }

    /// Whether the host can run the worker backend at all.
    pub fn with_thread_support(mut self, supported: bool) -> Self {
        self.supports_threads = supported;
        self
    }

    /// Input configuration forwarded after every import.
    pub fn with_input_config(mut self, config: Option<InputServerConfig>) -> Self {
        self.input = config;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Backend chosen by the last `spawn`, until the next `kill`.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.lock().kind
    }

    /// True once the backend exists and can take messages.
    pub fn is_live(&self) -> bool {
        !matches!(self.lock().backend, Backend::None)
    }

    /// Replace the current context with a fresh one loading `payloads`.
    ///
    /// The first payload is the backend's own entry point; the rest are
    /// imported once the backend is alive.
    pub fn spawn(&self, payloads: &[String], prefer_thread: bool) -> Result<(), SandboxError> {
        let (entry_point, imports) = payloads.split_first().ok_or_else(|| {
            SandboxError::Spawn("payload list is empty".to_string())
        })?;
        let imports = imports.to_vec();

        let mut state = self.lock();
        self.kill_locked(&mut state);
        let generation = state.generation;

        if self.supports_threads && prefer_thread {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let worker = WorkerBackend::spawn(entry_point, inbound_tx)?;
            state.kind = Some(BackendKind::Worker);
            state.backend = Backend::Worker(worker);
            state.pump = Some(spawn_pump(
                self.bus.clone(),
                inbound_rx,
                Arc::downgrade(&self.state),
                self.loader.clone(),
                generation,
            ));
            return state.bootstrap(&imports, self.input.as_ref());
        }

        state.kind = Some(BackendKind::Frame);
        drop(state);

        let shared = Arc::clone(&self.state);
        let bus = self.bus.clone();
        let loader = self.loader.clone();
        let input = self.input.clone();
        self.loader.create_frame_context(move |mut frame| {
            let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation != generation {
                log::debug!("Discarding superseded frame #{}", frame.id());
                drop(state);
                loader.destroy_frame_if(frame.id());
                return;
            }
            if let Some(inbound) = frame.take_inbound() {
                state.pump = Some(spawn_pump(
                    bus,
                    inbound,
                    Arc::downgrade(&shared),
                    loader,
                    generation,
                ));
            }
            state.backend = Backend::Frame(frame);
            if let Err(e) = state.bootstrap(&imports, input.as_ref()) {
                log::error!("Failed to bootstrap frame context: {}", e);
            }
        });
        Ok(())
    }

    /// Encode and transmit one message to the live context.
    pub fn send(&self, message: &Message) -> Result<(), SandboxError> {
        log::debug!("-> {} {}", message.kind, message.data);
        self.lock().post(message)
    }

    /// Tear down the live context, if any. Idempotent.
    pub fn kill(&self) {
        let mut state = self.lock();
        self.kill_locked(&mut state);
    }

    /// Decode one raw inbound payload and republish it.
    pub fn on_receive(bus: &EventBus, raw: &str) {
        match Message::decode(raw) {
            Ok(message) => {
                if !message.is_known() {
                    log::debug!("Passing through unrecognized message type '{}'", message.kind);
                }
                log::debug!("<- {} {}", message.kind, message.data);
                bus.publish(&message.kind, &message.data);
            }
            Err(e) => log::debug!("Dropping undecodable payload: {}", e),
        }
    }

    fn kill_locked(&self, state: &mut ContextState) {
        if let Some(pump) = state.teardown(&self.loader) {
            pump.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Republish everything `inbound` yields. When the backend hangs up while
/// it is still the current generation, retire it and publish [`EXIT`]; a
/// kill aborts the pump first, so deliberate teardown stays silent.
fn spawn_pump(
    bus: EventBus,
    mut inbound: mpsc::UnboundedReceiver<String>,
    owner: Weak<Mutex<ContextState>>,
    loader: ContextLoader,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = inbound.recv().await {
            IsolationContext::on_receive(&bus, &raw);
        }

        let Some(owner) = owner.upgrade() else {
            return;
        };
        {
            let mut state = owner.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation != generation {
                return;
            }
            // Our own handle; dropping it detaches this task.
            drop(state.teardown(&loader));
        }
        log::warn!("Isolation context #{} exited without being killed", generation);
        bus.publish(EXIT, &Value::Null);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::engines::ECHO_ENGINE;
    use crate::guest::EngineCatalog;
    use crate::protocol::{EVALUATE, READY, RESULT};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn frame_context() -> (IsolationContext, EventBus) {
        let bus = EventBus::new();
        let loader = ContextLoader::new(Arc::new(EngineCatalog::with_builtin_engines()));
        let context = IsolationContext::new(bus.clone(), loader).with_thread_support(false);
        (context, bus)
    }

    fn watch(bus: &EventBus, events: &[&str]) -> UnboundedReceiver<(String, Value)> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(events, move |data, event| {
            let _ = tx.send((event.to_string(), data.clone()));
        });
        rx
    }

    async fn expect(rx: &mut UnboundedReceiver<(String, Value)>) -> (String, Value) {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn payloads() -> Vec<String> {
        vec!["unused-entry".to_string(), ECHO_ENGINE.to_string()]
    }

    #[tokio::test]
    async fn test_frame_spawn_imports_and_republishes() {
        let (context, bus) = frame_context();
        let mut events = watch(&bus, &[READY, RESULT]);

        context.spawn(&payloads(), true).unwrap();
        assert_eq!(context.backend_kind(), Some(BackendKind::Frame));
        assert_eq!(expect(&mut events).await.0, READY);
        assert!(context.is_live());

        context.send(&Message::new(EVALUATE, json!("42"))).unwrap();
        assert_eq!(expect(&mut events).await, (RESULT.to_string(), json!("42")));
    }

    #[tokio::test]
    async fn test_respawn_leaves_single_live_context() {
        let (context, bus) = frame_context();
        let mut events = watch(&bus, &[READY]);

        context.spawn(&payloads(), false).unwrap();
        context.spawn(&payloads(), false).unwrap();

        assert_eq!(expect(&mut events).await.0, READY);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err(), "superseded frame must never report ready");
        assert!(context.loader.has_frame());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (context, bus) = frame_context();
        let mut events = watch(&bus, &[READY, EXIT]);
        context.spawn(&payloads(), false).unwrap();
        expect(&mut events).await;

        context.kill();
        context.kill();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err(), "a deliberate kill is not an exit");
        assert!(!context.is_live());
        assert_eq!(context.backend_kind(), None);
        assert!(!context.loader.has_frame());
        assert!(matches!(
            context.send(&Message::new(EVALUATE, json!("1"))),
            Err(SandboxError::ContextNotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_kill_before_frame_ready_discards_it() {
        let (context, bus) = frame_context();
        let mut events = watch(&bus, &[READY]);
        context.spawn(&payloads(), false).unwrap();
        context.kill();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert!(!context.is_live());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_that_exits_is_retired() {
        let bus = EventBus::new();
        let loader = ContextLoader::new(Arc::new(EngineCatalog::with_builtin_engines()));
        let context = IsolationContext::new(bus.clone(), loader);
        let mut events = watch(&bus, &[READY, EXIT]);

        context
            .spawn(&["true".to_string(), ECHO_ENGINE.to_string()], true)
            .unwrap();

        assert_eq!(expect(&mut events).await, (EXIT.to_string(), Value::Null));
        assert!(!context.is_live());
        assert_eq!(context.backend_kind(), None);
        assert!(matches!(
            context.send(&Message::new(EVALUATE, json!("1"))),
            Err(SandboxError::ContextNotLoaded)
        ));
    }

    #[test]
    fn test_on_receive_drops_garbage_and_passes_unknown_types() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(&["custom", RESULT], move |data, event| {
            seen_clone.lock().unwrap().push(format!("{}={}", event, data));
        });

        IsolationContext::on_receive(&bus, "garbage");
        IsolationContext::on_receive(&bus, r#"{"data":1}"#);
        IsolationContext::on_receive(&bus, r#"{"type":"custom","data":[1,2]}"#);
        IsolationContext::on_receive(&bus, r#"{"type":"result","data":"ok"}"#);

        assert_eq!(*seen.lock().unwrap(), vec!["custom=[1,2]", "result=\"ok\""]);
    }

    #[test]
    fn test_empty_payload_list_is_rejected() {
        let (context, _bus) = frame_context();
        assert!(matches!(context.spawn(&[], false), Err(SandboxError::Spawn(_))));
    }
}
