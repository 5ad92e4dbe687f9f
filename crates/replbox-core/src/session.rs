//! Controller façade over one isolation context.
//!
//! A [`Session`] loads a language into a fresh context, drives evaluations
//! and routes `input` requests through the configured input strategy. All
//! completion is signalled through the shared [`EventBus`]: operations
//! return as soon as their message is on its way, and callbacks run from
//! the event handlers once the matching reply arrives.
//!
//! Status moves `Unloaded → Loading → Ready → Evaluating → Ready …`; a kill,
//! or a context that exits on its own, returns it to `Unloaded`. At most one
//! evaluation is pending at a time. An evaluation the watchdog gave up on
//! leaves the session `Abandoned` until it is killed or reloaded, since the
//! context is still busy with the old code.

use crate::context_loader::ContextLoader;
use crate::errors::{EvaluationError, SandboxError};
use crate::event_bus::{EventBus, SubscriptionId};
use crate::guest::{value_to_text, EngineCatalog};
use crate::input::{InputDelivery, InputProvider, InputStrategy};
use crate::isolation::{BackendKind, IsolationContext};
use crate::language::{EnvironmentTable, LanguageRegistry, LanguageSpec};
use crate::protocol::{
    Message, ERROR, EVALUATE, EVALUATE_RAW, EXIT, GET_NEXT_LINE_INDENT, INDENT, INPUT, READY, RESULT,
    TIMEOUT,
};
use crate::watchdog::{TimeoutPolicy, Watchdog};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;

/// Events that settle or suspend a pending evaluation.
const MONITORED: [&str; 3] = [RESULT, ERROR, INPUT];

pub type EvaluationCallback = Box<dyn FnOnce(Result<Value, EvaluationError>) + Send>;
pub type IndentCallback = Box<dyn FnOnce(Option<u32>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unloaded,
    Loading,
    Ready,
    Evaluating,
    /// The watchdog gave up; the context may still answer the old evaluation.
    Abandoned,
}

struct PendingEvaluation {
    id: u64,
    callback: Option<EvaluationCallback>,
    subscription: SubscriptionId,
    /// Status to fall back to if the request never reaches the context.
    previous: SessionStatus,
}

struct SessionState {
    status: SessionStatus,
    language: Option<Arc<LanguageSpec>>,
    pending: Option<PendingEvaluation>,
    next_evaluation: u64,
    ready_subscription: Option<SubscriptionId>,
    indent_waiters: VecDeque<IndentCallback>,
}

struct SessionInner {
    id: String,
    bus: EventBus,
    registry: Arc<LanguageRegistry>,
    environment: EnvironmentTable,
    context: IsolationContext,
    watchdog: Option<Watchdog>,
    input_provider: Option<Arc<dyn InputProvider>>,
    delivery: InputDelivery,
    subscriptions: Vec<(&'static str, SubscriptionId)>,
    state: Mutex<SessionState>,
}

pub struct SessionBuilder {
    registry: Arc<LanguageRegistry>,
    catalog: Arc<EngineCatalog>,
    loader: Option<ContextLoader>,
    environment: EnvironmentTable,
    thread_support: bool,
    timeout: Option<TimeoutPolicy>,
    input_strategy: InputStrategy,
    input_provider: Option<Arc<dyn InputProvider>>,
    session_id: Option<String>,
}

impl SessionBuilder {
    pub fn new(registry: Arc<LanguageRegistry>) -> Self {
        Self {
            registry,
            catalog: Arc::new(EngineCatalog::with_builtin_engines()),
            loader: None,
            environment: EnvironmentTable::detect(),
            thread_support: true,
            timeout: None,
            input_strategy: InputStrategy::Direct,
            input_provider: None,
            session_id: None,
        }
    }

    /// Engines available to frame contexts.
    pub fn catalog(mut self, catalog: Arc<EngineCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Use an existing loader instead of one built from the catalog.
    pub fn loader(mut self, loader: ContextLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn environment(mut self, environment: EnvironmentTable) -> Self {
        self.environment = environment;
        self
    }

    pub fn thread_support(mut self, supported: bool) -> Self {
        self.thread_support = supported;
        self
    }

    pub fn timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout = Some(policy);
        self
    }

    pub fn input_strategy(mut self, strategy: InputStrategy) -> Self {
        self.input_strategy = strategy;
        self
    }

    pub fn input_provider(mut self, provider: Arc<dyn InputProvider>) -> Self {
        self.input_provider = Some(provider);
        self
    }

    /// Fixed session id; a random one is generated otherwise.
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Session, SandboxError> {
        let id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let delivery = InputDelivery::for_session(&self.input_strategy, &id)?;
        let input_config = match delivery {
            InputDelivery::Direct => None,
            _ => Some(delivery.server_config(&self.input_strategy, &id)),
        };

        let bus = EventBus::new();
        let loader = self
            .loader
            .unwrap_or_else(|| ContextLoader::new(Arc::clone(&self.catalog)));
        let context = IsolationContext::new(bus.clone(), loader)
            .with_thread_support(self.thread_support)
            .with_input_config(input_config);
        let watchdog = self
            .timeout
            .map(|policy| Watchdog::new(bus.clone(), policy));

        log::info!(
            "Created session {} (input strategy: {})",
            id,
            self.input_strategy.name()
        );

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let mut subscriptions = Vec::with_capacity(3);
            let indent = weak.clone();
            subscriptions.push((
                INDENT,
                bus.subscribe(&[INDENT], move |data, _| {
                    if let Some(inner) = indent.upgrade() {
                        inner.resolve_indent(data);
                    }
                }),
            ));
            let exit = weak.clone();
            subscriptions.push((
                EXIT,
                bus.subscribe(&[EXIT], move |_, _| {
                    if let Some(inner) = exit.upgrade() {
                        inner.context_exited();
                    }
                }),
            ));
            if watchdog.is_some() {
                // Let the isolated side see missed deadlines too.
                let forward = context.clone();
                subscriptions.push((
                    TIMEOUT,
                    bus.subscribe(&[TIMEOUT], move |data, _| {
                        if let Err(e) = forward.send(&Message::new(TIMEOUT, data.clone())) {
                            log::debug!("Could not forward timeout to the context: {}", e);
                        }
                    }),
                ));
            }
            SessionInner {
                id,
                bus: bus.clone(),
                registry: self.registry,
                environment: self.environment,
                context,
                watchdog,
                input_provider: self.input_provider,
                delivery,
                subscriptions,
                state: Mutex::new(SessionState {
                    status: SessionStatus::Unloaded,
                    language: None,
                    pending: None,
                    next_evaluation: 0,
                    ready_subscription: None,
                    indent_waiters: VecDeque::new(),
                }),
            }
        });
        Ok(Session { inner })
    }
}

/// Cheap to clone; clones drive the same context.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder(registry: Arc<LanguageRegistry>) -> SessionBuilder {
        SessionBuilder::new(registry)
    }

    /// Random identifier keying input delivery.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Subscribe to raw events of the current context.
    pub fn on<F>(&self, types: &[&str], handler: F) -> SubscriptionId
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(types, handler)
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    pub fn language(&self) -> Option<Arc<LanguageSpec>> {
        self.inner.lock().language.clone()
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.inner.context.backend_kind()
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.inner.registry
    }

    /// Load `name` into a fresh context. `on_ready` runs once the context
    /// has imported every payload.
    ///
    /// Unknown languages fail here, before any context is touched. A
    /// pending evaluation of the previous context resolves as
    /// [`EvaluationError::Terminated`].
    pub fn load_language<F>(&self, name: &str, prefer_thread: bool, on_ready: F) -> Result<(), SandboxError>
    where
        F: FnOnce() + Send + 'static,
    {
        let language = self.inner.registry.get(name)?;
        let payloads = language.resolve_payloads(&self.inner.environment)?;
        log::info!(
            "Loading language '{}' in session {} ({} payloads)",
            language.system_name,
            self.inner.id,
            payloads.len()
        );

        self.inner.abort_pending(EvaluationError::Terminated);

        let weak = Arc::downgrade(&self.inner);
        {
            let mut state = self.inner.lock();
            if let Some(previous) = state.ready_subscription.take() {
                self.inner.bus.unsubscribe(&[READY], Some(previous));
            }
            state.indent_waiters.clear();
            state.status = SessionStatus::Loading;
            state.language = Some(Arc::clone(&language));
            state.ready_subscription = Some(self.inner.bus.subscribe_once(&[READY], move |_, _| {
                if let Some(inner) = weak.upgrade() {
                    inner.mark_ready();
                }
                on_ready();
            }));
        }

        if let Err(e) = self.inner.context.spawn(&payloads, prefer_thread) {
            log::error!("Failed to load language '{}': {}", name, e);
            let mut state = self.inner.lock();
            if let Some(subscription) = state.ready_subscription.take() {
                self.inner.bus.unsubscribe(&[READY], Some(subscription));
            }
            state.status = SessionStatus::Unloaded;
            state.language = None;
            return Err(e);
        }
        Ok(())
    }

    /// Load `name` and wait until it is ready or reports a load error.
    pub async fn load(&self, name: &str, prefer_thread: bool) -> Result<(), SandboxError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();
        let error_subscription = self.inner.bus.subscribe_once(&[ERROR], move |data, _| {
            let _ = error_tx.send(value_to_text(data.clone()));
        });

        let outcome = match self.load_language(name, prefer_thread, move || {
            let _ = ready_tx.send(());
        }) {
            Ok(()) => tokio::select! {
                ready = ready_rx => ready.map_err(|_| {
                    SandboxError::Spawn(format!("Context for '{}' went away before it was ready", name))
                }),
                Ok(message) = error_rx => Err(SandboxError::Spawn(message)),
            },
            Err(e) => Err(e),
        };
        self.inner.bus.unsubscribe(&[ERROR], Some(error_subscription));
        outcome
    }

    /// Evaluate `code` in the loaded context.
    ///
    /// `callback` receives exactly one of the value or the error. Without a
    /// callback the outcome is only visible as `result` / `error` events.
    pub fn evaluate(&self, code: &str, callback: Option<EvaluationCallback>) -> Result<(), SandboxError> {
        self.inner.start_evaluation(EVALUATE, code, callback)
    }

    /// Like [`evaluate`](Session::evaluate), but asks the engine for its
    /// unformatted result.
    pub fn evaluate_raw(&self, code: &str, callback: Option<EvaluationCallback>) -> Result<(), SandboxError> {
        self.inner.start_evaluation(EVALUATE_RAW, code, callback)
    }

    /// Evaluate and wait for the outcome.
    pub async fn run(&self, code: &str) -> Result<Result<Value, EvaluationError>, SandboxError> {
        let (tx, rx) = oneshot::channel();
        self.evaluate(
            code,
            Some(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })),
        )?;
        Ok(rx.await.unwrap_or(Err(EvaluationError::Terminated)))
    }

    /// Ask whether `code` needs another line, and at which indent.
    ///
    /// Code whose last line is blank is complete by definition and resolves
    /// to `None` without a round trip.
    pub fn check_next_line_indent<F>(&self, code: &str, callback: F) -> Result<(), SandboxError>
    where
        F: FnOnce(Option<u32>) + Send + 'static,
    {
        if ends_with_blank_line(code) {
            callback(None);
            return Ok(());
        }

        let mut state = self.inner.lock();
        if state.status == SessionStatus::Unloaded {
            return Err(SandboxError::ContextNotLoaded);
        }
        state.indent_waiters.push_back(Box::new(callback));
        if let Err(e) = self
            .inner
            .context
            .send(&Message::new(GET_NEXT_LINE_INDENT, json!(code)))
        {
            state.indent_waiters.pop_back();
            return Err(e);
        }
        Ok(())
    }

    pub async fn next_line_indent(&self, code: &str) -> Result<Option<u32>, SandboxError> {
        let (tx, rx) = oneshot::channel();
        self.check_next_line_indent(code, move |indent| {
            let _ = tx.send(indent);
        })?;
        rx.await.map_err(|_| SandboxError::ContextNotLoaded)
    }

    /// Tear down the context. A pending evaluation resolves as
    /// [`EvaluationError::Terminated`].
    pub fn kill(&self) {
        log::info!("Killing context of session {}", self.inner.id);
        self.inner.context.kill();
        self.inner.abort_pending(EvaluationError::Terminated);
        let mut state = self.inner.lock();
        if let Some(subscription) = state.ready_subscription.take() {
            self.inner.bus.unsubscribe(&[READY], Some(subscription));
        }
        state.indent_waiters.clear();
        state.status = SessionStatus::Unloaded;
    }
}

impl SessionInner {
    fn start_evaluation(
        self: &Arc<Self>,
        kind: &str,
        code: &str,
        callback: Option<EvaluationCallback>,
    ) -> Result<(), SandboxError> {
        let id = {
            let mut state = self.lock();
            let previous = state.status;
            match previous {
                SessionStatus::Unloaded => return Err(SandboxError::ContextNotLoaded),
                SessionStatus::Evaluating => return Err(SandboxError::EvaluationInProgress),
                SessionStatus::Abandoned => return Err(SandboxError::ContextAbandoned),
                SessionStatus::Loading | SessionStatus::Ready => {}
            }
            state.next_evaluation += 1;
            let id = state.next_evaluation;
            let subscription = self.monitor(id);
            state.pending = Some(PendingEvaluation {
                id,
                callback,
                subscription,
                previous,
            });
            state.status = SessionStatus::Evaluating;

            // The frame backend cannot be interrupted from outside, so it
            // is the only one the watchdog guards.
            if let Some(watchdog) = self.frame_watchdog() {
                let weak = Arc::downgrade(self);
                watchdog.arm(move |checks| {
                    if let Some(inner) = weak.upgrade() {
                        inner.finish(id, Err(EvaluationError::Abandoned { checks }));
                    }
                });
            }
            id
        };

        log::debug!("Starting evaluation #{} in session {}", id, self.id);
        if let Err(e) = self.context.send(&Message::new(kind, json!(code))) {
            self.settle(id, None);
            return Err(e);
        }
        Ok(())
    }

    /// One-shot subscription settling (or suspending) evaluation `id`.
    fn monitor(self: &Arc<Self>, id: u64) -> SubscriptionId {
        let weak = Arc::downgrade(self);
        self.bus.subscribe_once(&MONITORED, move |data, event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                INPUT => inner.answer_input(id, data.clone()),
                ERROR => inner.finish(id, Err(EvaluationError::Runtime(value_to_text(data.clone())))),
                _ => inner.finish(id, Ok(data.clone())),
            }
        })
    }

    fn answer_input(self: Arc<Self>, id: u64, request: Value) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.suspend_for_input();
        }
        tokio::spawn(async move {
            let text = match &self.input_provider {
                Some(provider) => provider.read_input(&request).await.unwrap_or_else(|e| {
                    log::warn!("Input provider failed, answering with an empty line: {}", e);
                    String::new()
                }),
                None => {
                    log::warn!("Session {} has no input provider, answering with an empty line", self.id);
                    String::new()
                }
            };
            if let Err(e) = self.delivery.record(&text).await {
                log::warn!("Failed to record input for session {}: {}", self.id, e);
            }

            // Keep watching before the answer goes out so the reply to it
            // cannot slip past.
            {
                let mut state = self.lock();
                let subscription = match state.pending.as_ref() {
                    Some(pending) if pending.id == id => self.monitor(id),
                    _ => {
                        log::debug!("Dropping input for settled evaluation #{}", id);
                        return;
                    }
                };
                if let Some(pending) = state.pending.as_mut() {
                    pending.subscription = subscription;
                }
            }
            if let Some(watchdog) = &self.watchdog {
                watchdog.resume_after_input();
            }

            if let Err(e) = self.context.send(&Message::new(INPUT, json!(text))) {
                log::error!("Failed to answer input request: {}", e);
                self.finish(id, Err(EvaluationError::Terminated));
            }
        });
    }

    /// Resolve evaluation `id` if it is still the pending one.
    fn finish(&self, id: u64, outcome: Result<Value, EvaluationError>) {
        let next = match outcome {
            Err(EvaluationError::Abandoned { .. }) => SessionStatus::Abandoned,
            _ => SessionStatus::Ready,
        };
        let callback = match self.settle(id, Some(next)) {
            Some(callback) => callback,
            None => return,
        };
        match callback {
            Some(callback) => callback(outcome),
            None => {
                if let Err(e) = outcome {
                    log::debug!("Evaluation #{} failed without a callback: {}", id, e);
                }
            }
        }
    }

    /// Clear evaluation `id`, returning its callback slot. The session moves
    /// to `next`, or back to where it was before the evaluation when `None`.
    fn settle(&self, id: u64, next: Option<SessionStatus>) -> Option<Option<EvaluationCallback>> {
        let mut state = self.lock();
        if state.pending.as_ref().map(|pending| pending.id) != Some(id) {
            return None;
        }
        let pending = state.pending.take()?;
        self.bus.unsubscribe(&MONITORED, Some(pending.subscription));
        if let Some(watchdog) = &self.watchdog {
            watchdog.disarm();
        }
        if state.status == SessionStatus::Evaluating {
            state.status = next.unwrap_or(pending.previous);
        }
        log::debug!("Evaluation #{} settled in session {}", id, self.id);
        Some(pending.callback)
    }

    fn abort_pending(&self, error: EvaluationError) {
        let pending = self.lock().pending.as_ref().map(|pending| pending.id);
        if let Some(id) = pending {
            self.finish(id, Err(error));
        }
    }

    /// The context stopped without a kill. Fail whatever was waiting on it.
    fn context_exited(&self) {
        let ready_subscription = {
            let mut state = self.lock();
            if self.context.backend_kind().is_some() {
                log::debug!("Ignoring exit of a context that was already replaced");
                return;
            }
            state.indent_waiters.clear();
            state.status = SessionStatus::Unloaded;
            state.ready_subscription.take()
        };
        log::warn!("Context of session {} exited unexpectedly", self.id);
        // Dropping the ready handler lets `load` see the context went away.
        if let Some(subscription) = ready_subscription {
            self.bus.unsubscribe(&[READY], Some(subscription));
        }
        self.abort_pending(EvaluationError::Terminated);
    }

    fn mark_ready(&self) {
        let mut state = self.lock();
        if state.status == SessionStatus::Loading {
            state.status = SessionStatus::Ready;
        }
        state.ready_subscription = None;
        log::info!("Session {} is ready", self.id);
    }

    fn resolve_indent(&self, data: &Value) {
        let waiter = self.lock().indent_waiters.pop_front();
        let Some(waiter) = waiter else {
            log::debug!("Ignoring unsolicited indent reply");
            return;
        };
        let indent = data.as_u64().and_then(|level| u32::try_from(level).ok());
        waiter(indent);
    }

    fn frame_watchdog(&self) -> Option<&Watchdog> {
        match self.context.backend_kind() {
            Some(BackendKind::Frame) => self.watchdog.as_ref(),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for (event, subscription) in &self.subscriptions {
            self.bus.unsubscribe(&[*event], Some(*subscription));
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.disarm();
        }
        self.context.kill();
    }
}

/// True when the text after the last newline is only whitespace.
fn ends_with_blank_line(code: &str) -> bool {
    match code.rfind('\n') {
        Some(index) => code[index + 1..].trim().is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_last_line_detection() {
        assert!(ends_with_blank_line("print 1\n"));
        assert!(ends_with_blank_line("if x:\n  y\n   \t"));
        assert!(!ends_with_blank_line("if x:"));
        assert!(!ends_with_blank_line("a\nb"));
        assert!(!ends_with_blank_line(""));
    }

    #[test]
    fn test_remote_strategy_with_bad_scheme_fails_construction() {
        let result = Session::builder(Arc::new(LanguageRegistry::default()))
            .input_strategy(InputStrategy::Remote {
                url: "gopher://example.com/".to_string(),
            })
            .build();
        assert!(matches!(result, Err(SandboxError::UnsupportedDeliveryMechanism(_))));
    }

    #[test]
    fn test_session_ids_are_random_unless_fixed() {
        let registry = Arc::new(LanguageRegistry::default());
        let a = Session::builder(registry.clone()).build().unwrap();
        let b = Session::builder(registry.clone()).build().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);

        let fixed = Session::builder(registry).session_id("fixed").build().unwrap();
        assert_eq!(fixed.id(), "fixed");
        assert_eq!(fixed.status(), SessionStatus::Unloaded);
    }

    #[test]
    fn test_evaluate_before_load_is_rejected() {
        let session = Session::builder(Arc::new(LanguageRegistry::default())).build().unwrap();
        assert!(matches!(session.evaluate("1", None), Err(SandboxError::ContextNotLoaded)));
        assert!(matches!(
            session.check_next_line_indent("x", |_| {}),
            Err(SandboxError::ContextNotLoaded)
        ));
    }
}
