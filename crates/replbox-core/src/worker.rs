//! Worker backend: the isolated context as a separate OS process.
//
// The process is started from the payload's entry-point executable and
// speaks the line-delimited protocol over its stdin/stdout. Stderr is
// forwarded to the log. Killing the process is the only interrupt. When the
// process exits on its own, its stdout closes and so does `inbound`.

use crate::errors::SandboxError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct WorkerBackend {
    entry_point: String,
    child: Child,
    outbound: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerBackend {
    /// Start `entry_point` and forward every line it prints to `inbound`.
    pub fn spawn(
        entry_point: &str,
        inbound: mpsc::UnboundedSender<String>,
    ) -> Result<Self, SandboxError> {
        log::info!("Starting worker process: {}", entry_point);

        let mut child = Command::new(entry_point)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Spawn(format!("Failed to start worker '{}': {}", entry_point, e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SandboxError::Spawn(format!("Worker '{}' has no stdin pipe", entry_point))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::Spawn(format!("Worker '{}' has no stdout pipe", entry_point))
        })?;
        let stderr = child.stderr.take();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let mut tasks = Vec::with_capacity(3);

        tasks.push(tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(raw) = outbound_rx.recv().await {
                let written = async {
                    stdin.write_all(raw.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    log::warn!("Worker stdin closed: {}", e);
                    break;
                }
            }
        }));

        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if inbound.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        log::debug!("Worker stdout closed");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Failed to read worker stdout: {}", e);
                        break;
                    }
                }
            }
        }));

        if let Some(stderr) = stderr {
            let name = entry_point.to_string();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[worker {}] {}", name, line);
                }
            }));
        }

        Ok(Self {
            entry_point: entry_point.to_string(),
            child,
            outbound,
            tasks,
        })
    }

    /// Queue a raw payload for the worker's stdin. Writes keep send order.
    pub fn post(&self, raw: String) -> Result<(), SandboxError> {
        self.outbound.send(raw).map_err(|_| {
            SandboxError::Io(format!("Worker '{}' is no longer accepting input", self.entry_point))
        })
    }

    pub fn terminate(&mut self) {
        log::info!("Terminating worker process: {}", self.entry_point);
        if let Err(e) = self.child.start_kill() {
            log::debug!("Worker '{}' already exited: {}", self.entry_point, e);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for WorkerBackend {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
