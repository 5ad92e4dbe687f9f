//! Interactive loop over stdin.
//!
//! Lines are collected until the engine reports the fragment complete, then
//! evaluated. Stdin is shared with the input provider so programs that ask
//! for input read the next line the user types.

use anyhow::{Context, Result};
use async_trait::async_trait;
use replbox_core::config::ReplboxConfig;
use replbox_core::errors::{EvaluationError, SandboxError};
use replbox_core::input::InputProvider;
use replbox_core::protocol::{OUTPUT, TIMEOUT};
use replbox_core::session::Session;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

type SharedLines = Arc<Mutex<Lines<BufReader<Stdin>>>>;

/// Answers `input` requests with the next line typed on stdin.
#[derive(Clone)]
pub struct StdinInput {
    lines: SharedLines,
}

impl StdinInput {
    pub fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())),
        }
    }

    async fn next_line(&self) -> Result<Option<String>, SandboxError> {
        Ok(self.lines.lock().await.next_line().await?)
    }
}

#[async_trait]
impl InputProvider for StdinInput {
    async fn read_input(&self, request: &Value) -> Result<String, SandboxError> {
        if !request.is_null() {
            print!("{}", display_text(request));
            let _ = std::io::stdout().flush();
        }
        Ok(self.next_line().await?.unwrap_or_default())
    }
}

/// Strings print bare, everything else as JSON.
pub fn display_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub struct Repl {
    session: Session,
    stdin: StdinInput,
    language: String,
    prefer_thread: bool,
}

impl Repl {
    pub async fn start(config: &ReplboxConfig, language: &str, prefer_thread: bool) -> Result<Self> {
        let stdin = StdinInput::new();
        let session = config
            .session_builder()?
            .input_provider(Arc::new(stdin.clone()))
            .build()?;

        session.on(&[OUTPUT], |data, _| {
            print!("{}", display_text(data));
            let _ = std::io::stdout().flush();
        });
        session.on(&[TIMEOUT], |data, _| {
            eprintln!("[still running, check {}]", data["checks"]);
        });

        let repl = Self {
            session,
            stdin,
            language: language.to_string(),
            prefer_thread: prefer_thread && config.session.prefer_thread,
        };
        repl.reload().await?;
        Ok(repl)
    }

    async fn reload(&self) -> Result<()> {
        self.session
            .load(&self.language, self.prefer_thread)
            .await
            .with_context(|| format!("Failed to load language '{}'", self.language))?;
        if let Some(spec) = self.session.language() {
            println!("{} ready ({:?} backend). Type .exit to quit.", spec.name, self.session.backend_kind());
        }
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        let mut buffer = String::new();
        let mut indent = 0;
        loop {
            let prompt = if buffer.is_empty() {
                "> ".to_string()
            } else {
                format!("..{}", "  ".repeat(indent as usize + 1))
            };
            print!("{}", prompt);
            std::io::stdout().flush()?;

            let Some(line) = self.stdin.next_line().await? else {
                println!();
                break;
            };

            if buffer.is_empty() {
                match line.trim() {
                    "" => continue,
                    ".exit" => break,
                    ".reset" => {
                        self.reload().await?;
                        continue;
                    }
                    _ => {}
                }
            }

            buffer.push_str(&line);
            match self.session.next_line_indent(&buffer).await {
                Ok(Some(level)) => {
                    indent = level;
                    buffer.push('\n');
                    continue;
                }
                Ok(None) => {}
                Err(e) => log::warn!("Indent check failed, evaluating as is: {}", e),
            }

            let code = std::mem::take(&mut buffer);
            indent = 0;
            self.evaluate(code.trim_end()).await?;
        }
        self.session.kill();
        Ok(())
    }

    async fn evaluate(&self, code: &str) -> Result<()> {
        let outcome = tokio::select! {
            outcome = self.session.run(code) => outcome?,
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted.");
                self.session.kill();
                return self.reload().await;
            }
        };

        match outcome {
            Ok(Value::Null) => {}
            Ok(value) => println!("=> {}", display_text(&value)),
            Err(EvaluationError::Runtime(message)) => eprintln!("Error: {}", message),
            Err(e @ EvaluationError::Abandoned { .. }) => {
                eprintln!("{}; restarting {}", e, self.language);
                self.session.kill();
                self.reload().await?;
            }
            Err(e @ EvaluationError::Terminated) => {
                eprintln!("{}; restarting {}", e, self.language);
                self.reload().await?;
            }
        }
        Ok(())
    }
}
