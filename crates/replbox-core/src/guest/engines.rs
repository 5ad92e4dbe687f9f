//! Engines bundled with the guest runtime.

use super::{Engine, GuestIo};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

pub const ECHO_ENGINE: &str = "builtin:echo";
pub const SHELL_ENGINE: &str = "builtin:shell";

const OPENERS: [char; 3] = ['(', '[', '{'];
const CLOSERS: [char; 3] = [')', ']', '}'];

/// Returns the submitted code unchanged. Useful for exercising the
/// protocol without a real interpreter.
pub struct EchoEngine {
    libraries: Vec<String>,
}

impl EchoEngine {
    pub fn new(libraries: &[String]) -> Self {
        Self {
            libraries: libraries.to_vec(),
        }
    }
}

#[async_trait]
impl Engine for EchoEngine {
    async fn evaluate(&mut self, code: &str, _io: &mut GuestIo<'_>) -> Result<Value, String> {
        Ok(json!(code))
    }

    async fn evaluate_raw(&mut self, code: &str, _io: &mut GuestIo<'_>) -> Result<Value, String> {
        Ok(json!({ "code": code, "libraries": self.libraries }))
    }

    fn next_line_indent(&self, code: &str) -> Option<u32> {
        let depth = code.chars().fold(0i64, |depth, c| {
            if OPENERS.contains(&c) {
                depth + 1
            } else if CLOSERS.contains(&c) {
                depth - 1
            } else {
                depth
            }
        });
        if depth > 0 {
            return Some(depth as u32);
        }
        let last_line = code.lines().last().unwrap_or_default();
        if last_line.trim_end().ends_with(':') {
            let current = last_line.len() - last_line.trim_start().len();
            return Some(current as u32 / 2 + 1);
        }
        None
    }
}

/// Runs each evaluation as `sh -c <code>`, after sourcing the libraries
/// the language imported. Stdout is streamed as `output`; a non-zero exit
/// status becomes an `error` carrying stderr.
pub struct ShellEngine {
    shell: String,
    libraries: Vec<String>,
}

impl ShellEngine {
    pub fn new(libraries: &[String]) -> Self {
        Self {
            shell: "sh".to_string(),
            libraries: libraries.to_vec(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn script(&self, code: &str) -> String {
        let mut script = String::new();
        for library in &self.libraries {
            script.push_str(&format!(". '{}'\n", library.replace('\'', r"'\''")));
        }
        script.push_str(code);
        script
    }
}

#[async_trait]
impl Engine for ShellEngine {
    async fn evaluate(&mut self, code: &str, io: &mut GuestIo<'_>) -> Result<Value, String> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(self.script(code))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to start {}: {}", self.shell, e))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                stderr.read_to_string(&mut text).await.map(|_| text)
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| format!("Failed to read output: {}", e))?
            {
                io.output(&format!("{}\n", line));
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| format!("Failed to wait for {}: {}", self.shell, e))?;
        let stderr = match stderr_task {
            Some(task) => task.await.ok().and_then(Result::ok).unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(Value::Null)
        } else if stderr.trim().is_empty() {
            Err(format!("exited with {}", status))
        } else {
            Err(stderr.trim_end().to_string())
        }
    }

    fn next_line_indent(&self, code: &str) -> Option<u32> {
        let depth = code
            .split(|c: char| c.is_whitespace() || c == ';' || c == '&' || c == '|')
            .fold(0i64, |depth, token| match token {
                "if" | "do" | "case" | "{" | "(" => depth + 1,
                "fi" | "done" | "esac" | "}" | ")" => depth - 1,
                _ => depth,
            });
        if depth > 0 {
            Some(depth as u32)
        } else if code.trim_end().ends_with('\\') {
            Some(0)
        } else {
            None
        }
    }
}
