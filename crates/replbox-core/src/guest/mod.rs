//! The isolated side of the protocol.
//!
//! A [`GuestRuntime`] is what runs inside an isolation context: it receives
//! encoded messages from the controller, loads an [`Engine`] when told to
//! import scripts, and answers evaluation and indentation queries. Both
//! backends host the same runtime; the frame backend drives it over
//! in-process channels and the worker backend over stdio (see
//! [`GuestRuntime::run_stdio`], used by the `replbox-guest` binary).

pub mod engines;

use crate::protocol::{
    Message, ERROR, EVALUATE, EVALUATE_RAW, GET_NEXT_LINE_INDENT, IMPORT_SCRIPTS, INDENT, INPUT,
    OUTPUT, PROGRESS, READY, RESULT, SET_INPUT_SERVER, TIMEOUT,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// An interpreter loaded into a guest runtime.
#[async_trait]
pub trait Engine: Send {
    async fn evaluate(&mut self, code: &str, io: &mut GuestIo<'_>) -> Result<Value, String>;

    async fn evaluate_raw(&mut self, code: &str, io: &mut GuestIo<'_>) -> Result<Value, String> {
        self.evaluate(code, io).await
    }

    /// `None` when `code` is complete, otherwise the indent level of the
    /// next line.
    fn next_line_indent(&self, code: &str) -> Option<u32>;
}

pub type EngineFactory =
    Arc<dyn Fn(&[String]) -> Result<Box<dyn Engine>, String> + Send + Sync>;

/// Engines a guest runtime can load, keyed by engine reference.
#[derive(Clone, Default)]
pub struct EngineCatalog {
    factories: HashMap<String, EngineFactory>,
}

impl EngineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_engines() -> Self {
        let mut catalog = Self::new();
        catalog.register(engines::ECHO_ENGINE, |libraries| {
            Ok(Box::new(engines::EchoEngine::new(libraries)) as Box<dyn Engine>)
        });
        catalog.register(engines::SHELL_ENGINE, |libraries| {
            Ok(Box::new(engines::ShellEngine::new(libraries)) as Box<dyn Engine>)
        });
        catalog
    }

    pub fn register<F>(&mut self, reference: &str, factory: F)
    where
        F: Fn(&[String]) -> Result<Box<dyn Engine>, String> + Send + Sync + 'static,
    {
        self.factories.insert(reference.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.factories.contains_key(reference)
    }

    pub fn create(&self, reference: &str, libraries: &[String]) -> Result<Box<dyn Engine>, String> {
        let factory = self
            .factories
            .get(reference)
            .ok_or_else(|| format!("No engine registered for '{}'", reference))?;
        factory(libraries)
    }
}

/// Channel back to the controller, handed to an engine for the duration of
/// one evaluation.
pub struct GuestIo<'a> {
    outbound: &'a mpsc::UnboundedSender<String>,
    inbound: &'a mut mpsc::UnboundedReceiver<String>,
    backlog: &'a mut VecDeque<Message>,
    input_server: Option<&'a Value>,
    timeouts: u32,
}

impl GuestIo<'_> {
    pub fn output(&self, text: &str) {
        post(self.outbound, Message::new(OUTPUT, json!(text)));
    }

    pub fn progress(&self, percent: f64) {
        post(self.outbound, Message::new(PROGRESS, json!(percent)));
    }

    /// Input configuration the controller announced with `setInputServer`.
    pub fn input_server(&self) -> Option<&Value> {
        self.input_server
    }

    /// Missed-deadline notifications the controller sent before this
    /// evaluation started.
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Ask the controller for a line of input and wait for it. Messages
    /// that arrive in the meantime are kept for after the evaluation.
    /// Returns `None` once the controller has gone away.
    pub async fn read_input(&mut self) -> Option<String> {
        post(self.outbound, Message::new(INPUT, Value::Null));
        loop {
            let raw = self.inbound.recv().await?;
            match Message::decode(&raw) {
                Ok(message) if message.kind == INPUT => return Some(value_to_text(message.data)),
                Ok(message) => self.backlog.push_back(message),
                Err(e) => log::debug!("Guest dropped undecodable message: {}", e),
            }
        }
    }
}

pub struct GuestRuntime {
    catalog: Arc<EngineCatalog>,
    outbound: mpsc::UnboundedSender<String>,
    engine: Option<Box<dyn Engine>>,
    input_server: Option<Value>,
    backlog: VecDeque<Message>,
    timeouts: u32,
}

impl GuestRuntime {
    pub fn new(catalog: Arc<EngineCatalog>, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            catalog,
            outbound,
            engine: None,
            input_server: None,
            backlog: VecDeque::new(),
            timeouts: 0,
        }
    }

    /// Handle messages until the controller closes the channel.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<String>) {
        loop {
            let message = match self.backlog.pop_front() {
                Some(message) => message,
                None => match inbound.recv().await {
                    Some(raw) => match Message::decode(&raw) {
                        Ok(message) => message,
                        Err(e) => {
                            log::debug!("Guest dropped undecodable message: {}", e);
                            continue;
                        }
                    },
                    None => break,
                },
            };
            self.handle(message, &mut inbound).await;
        }
        log::debug!("Guest runtime stopped: controller channel closed");
    }

    /// Serve the protocol over stdin/stdout, one encoded message per line.
    pub async fn run_stdio(catalog: Arc<EngineCatalog>) -> std::io::Result<()> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = outbound_rx.recv().await {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if inbound_tx.send(line).is_err() {
                    break;
                }
            }
            Ok::<(), std::io::Error>(())
        });

        GuestRuntime::new(catalog, outbound_tx).run(inbound_rx).await;
        reader.abort();
        writer
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }

    async fn handle(&mut self, message: Message, inbound: &mut mpsc::UnboundedReceiver<String>) {
        let Message { kind, data } = message;
        match kind.as_str() {
            IMPORT_SCRIPTS => self.import_scripts(&data),
            SET_INPUT_SERVER => {
                log::debug!("Guest input configuration: {}", data);
                self.input_server = Some(data);
            }
            EVALUATE | EVALUATE_RAW => {
                self.evaluate(kind == EVALUATE_RAW, value_to_text(data), inbound)
                    .await
            }
            GET_NEXT_LINE_INDENT => {
                let code = value_to_text(data);
                let indent = self
                    .engine
                    .as_ref()
                    .and_then(|engine| engine.next_line_indent(&code));
                let payload = match indent {
                    Some(level) => json!(level),
                    None => json!(false),
                };
                post(&self.outbound, Message::new(INDENT, payload));
            }
            TIMEOUT => {
                self.timeouts += 1;
                log::info!("Controller reported a missed deadline: {} (total {})", data, self.timeouts);
            }
            INPUT => log::debug!("Guest ignored input outside of an evaluation"),
            other => log::debug!("Guest ignored message of type '{}'", other),
        }
    }

    fn import_scripts(&mut self, data: &Value) {
        let references: Vec<String> = data
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let Some((engine_ref, libraries)) = references.split_last() else {
            post(
                &self.outbound,
                Message::new(ERROR, json!("importScripts carried no engine reference")),
            );
            return;
        };

        match self.catalog.create(engine_ref, libraries) {
            Ok(engine) => {
                log::info!(
                    "Guest loaded engine '{}' with {} libraries",
                    engine_ref,
                    libraries.len()
                );
                self.engine = Some(engine);
                post(&self.outbound, Message::new(READY, Value::Null));
            }
            Err(e) => {
                log::error!("Guest failed to load engine '{}': {}", engine_ref, e);
                post(&self.outbound, Message::new(ERROR, json!(e)));
            }
        }
    }

    async fn evaluate(
        &mut self,
        raw: bool,
        code: String,
        inbound: &mut mpsc::UnboundedReceiver<String>,
    ) {
        let Self {
            engine,
            outbound,
            backlog,
            input_server,
            timeouts,
            ..
        } = self;

        let Some(engine) = engine.as_mut() else {
            post(outbound, Message::new(ERROR, json!("No engine loaded")));
            return;
        };

        let mut io = GuestIo {
            outbound: &*outbound,
            inbound,
            backlog,
            input_server: input_server.as_ref(),
            timeouts: *timeouts,
        };
        let outcome = if raw {
            engine.evaluate_raw(&code, &mut io).await
        } else {
            engine.evaluate(&code, &mut io).await
        };

        match outcome {
            Ok(value) => post(outbound, Message::new(RESULT, value)),
            Err(message) => post(outbound, Message::new(ERROR, json!(message))),
        }
    }
}

fn post(outbound: &mpsc::UnboundedSender<String>, message: Message) {
    match message.encode() {
        Ok(raw) => {
            if outbound.send(raw).is_err() {
                log::debug!("Guest could not post '{}': controller gone", message.kind);
            }
        }
        Err(e) => log::warn!("Guest could not encode '{}': {}", message.kind, e),
    }
}

pub(crate) fn value_to_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
