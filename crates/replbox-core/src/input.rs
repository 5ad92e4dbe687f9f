//! Input strategies for evaluations that ask for a line of text.
//!
//! The text itself always comes from an [`InputProvider`] supplied by the
//! embedding program. The strategy decides what else happens to it:
//! `direct` hands it straight back, `local_store` also appends it to a
//! per-session log, `remote` also posts it to an HTTP endpoint keyed by the
//! session id.

use crate::errors::SandboxError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Strategy selected when the session is built. Exactly one is active.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum InputStrategy {
    #[default]
    Direct,
    LocalStore {
        /// Defaults to `~/.replbox/input`.
        #[serde(default)]
        directory: Option<PathBuf>,
    },
    Remote {
        url: String,
    },
}

impl InputStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            InputStrategy::Direct => "direct",
            InputStrategy::LocalStore { .. } => "local_store",
            InputStrategy::Remote { .. } => "remote",
        }
    }
}

/// Source of the text answering an `input` request.
#[async_trait]
pub trait InputProvider: Send + Sync {
    /// `request` is the payload of the `input` message, usually a prompt
    /// or null.
    async fn read_input(&self, request: &Value) -> Result<String, SandboxError>;
}

/// Answers every request with the same text.
#[derive(Debug, Clone, Default)]
pub struct StaticInput(pub String);

#[async_trait]
impl InputProvider for StaticInput {
    async fn read_input(&self, _request: &Value) -> Result<String, SandboxError> {
        Ok(self.0.clone())
    }
}

/// What the isolated side is told about input handling via
/// `setInputServer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputServerConfig {
    pub strategy: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl InputServerConfig {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputLogEntry {
    pub timestamp: DateTime<Utc>,
    pub input: String,
}

/// Append-only log of every input of one session, one JSON object per
/// line.
#[derive(Debug, Clone)]
pub struct InputLog {
    path: PathBuf,
}

impl InputLog {
    pub fn new(directory: Option<&Path>, session_id: &str) -> Result<Self, SandboxError> {
        let directory = match directory {
            Some(directory) => directory.to_path_buf(),
            None => Self::default_directory()?,
        };
        Ok(Self {
            path: directory.join(format!("{}.jsonl", session_id)),
        })
    }

    pub fn default_directory() -> Result<PathBuf, SandboxError> {
        dirs::home_dir()
            .map(|home| home.join(".replbox").join("input"))
            .ok_or_else(|| {
                SandboxError::Config("Cannot determine home directory for the input log".to_string())
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, input: &str) -> Result<(), SandboxError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entry = InputLogEntry {
            timestamp: Utc::now(),
            input: input.to_string(),
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| SandboxError::Io(format!("Failed to encode input log entry: {}", e)))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every entry written so far; an absent log reads as empty.
    pub async fn entries(&self) -> Result<Vec<InputLogEntry>, SandboxError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    SandboxError::Io(format!("Corrupt input log {}: {}", self.path.display(), e))
                })
            })
            .collect()
    }
}

/// Posts every input to `<url><session id>` as `input=<text>`.
#[derive(Debug, Clone)]
pub struct RemoteDelivery {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteDelivery {
    pub fn new(url: &str, session_id: &str) -> Result<Self, SandboxError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|_| SandboxError::UnsupportedDeliveryMechanism(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SandboxError::UnsupportedDeliveryMechanism(url.to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}{}", url, session_id),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn deliver(&self, input: &str) -> Result<(), SandboxError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(format!("input={}", urlencoding::encode(input)))
            .send()
            .await?;
        if response.status().is_success() {
            log::debug!("Delivered input to {}", self.endpoint);
            Ok(())
        } else {
            Err(SandboxError::Delivery(format!(
                "{} answered {}",
                self.endpoint,
                response.status()
            )))
        }
    }
}

/// The strategy, bound to one session.
#[derive(Debug, Clone)]
pub enum InputDelivery {
    Direct,
    LocalStore(InputLog),
    Remote(RemoteDelivery),
}

impl InputDelivery {
    /// Fails with `UnsupportedDeliveryMechanism` when no transport can
    /// reach a remote URL.
    pub fn for_session(strategy: &InputStrategy, session_id: &str) -> Result<Self, SandboxError> {
        Ok(match strategy {
            InputStrategy::Direct => InputDelivery::Direct,
            InputStrategy::LocalStore { directory } => {
                InputDelivery::LocalStore(InputLog::new(directory.as_deref(), session_id)?)
            }
            InputStrategy::Remote { url } => {
                InputDelivery::Remote(RemoteDelivery::new(url, session_id)?)
            }
        })
    }

    pub fn server_config(&self, strategy: &InputStrategy, session_id: &str) -> InputServerConfig {
        InputServerConfig {
            strategy: strategy.name().to_string(),
            session_id: session_id.to_string(),
            url: match strategy {
                InputStrategy::Remote { url } => Some(url.clone()),
                _ => None,
            },
        }
    }

    /// Store or forward an acquired input.
    pub async fn record(&self, input: &str) -> Result<(), SandboxError> {
        match self {
            InputDelivery::Direct => Ok(()),
            InputDelivery::LocalStore(log) => log.append(input).await,
            InputDelivery::Remote(remote) => remote.deliver(input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path as UrlPath, State};
    use axum::http::HeaderMap;
    use axum::{routing::post, Router};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Recorded = Arc<Mutex<Vec<(String, String, String)>>>;

    async fn record_input(
        State(recorded): State<Recorded>,
        UrlPath(session): UrlPath<String>,
        headers: HeaderMap,
        body: String,
    ) -> &'static str {
        let content_type = headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        recorded.lock().unwrap().push((session, content_type, body));
        "ok"
    }

    async fn start_input_server() -> (String, Recorded) {
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/input/{session}", post(record_input))
            .with_state(recorded.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{}/input/", addr), recorded)
    }

    #[test]
    fn test_strategy_parses_from_yaml() {
        let direct: InputStrategy = serde_yaml::from_str("strategy: direct").unwrap();
        assert_eq!(direct, InputStrategy::Direct);

        let remote: InputStrategy =
            serde_yaml::from_str("strategy: remote\nurl: https://example.com/in/").unwrap();
        assert_eq!(
            remote,
            InputStrategy::Remote {
                url: "https://example.com/in/".to_string()
            }
        );

        let local: InputStrategy = serde_yaml::from_str("strategy: local_store").unwrap();
        assert_eq!(local, InputStrategy::LocalStore { directory: None });
    }

    #[test]
    fn test_unsupported_remote_schemes_are_rejected() {
        for url in ["ftp://example.com/", "mailto:someone@example.com", "not a url"] {
            let strategy = InputStrategy::Remote {
                url: url.to_string(),
            };
            assert!(matches!(
                InputDelivery::for_session(&strategy, "abc"),
                Err(SandboxError::UnsupportedDeliveryMechanism(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_local_store_appends_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = InputStrategy::LocalStore {
            directory: Some(dir.path().join("nested")),
        };
        let delivery = InputDelivery::for_session(&strategy, "session-1").unwrap();

        delivery.record("first").await.unwrap();
        delivery.record("second line").await.unwrap();

        let InputDelivery::LocalStore(log) = &delivery else {
            panic!("expected a local store");
        };
        assert_eq!(log.path(), dir.path().join("nested").join("session-1.jsonl"));
        let inputs: Vec<String> = log.entries().await.unwrap().into_iter().map(|e| e.input).collect();
        assert_eq!(inputs, vec!["first", "second line"]);
    }

    #[tokio::test]
    async fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = InputLog::new(Some(dir.path()), "nobody").unwrap();
        assert!(log.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_posts_form_encoded_input() {
        let (url, recorded) = start_input_server().await;
        let delivery = RemoteDelivery::new(&url, "sess42").unwrap();
        assert_eq!(delivery.endpoint(), format!("{}sess42", url));

        delivery.deliver("a b&c=d").await.unwrap();

        let recorded = recorded.lock().unwrap().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "sess42");
        assert_eq!(recorded[0].1, "application/x-www-form-urlencoded");
        assert_eq!(recorded[0].2, "input=a%20b%26c%3Dd");
    }

    #[tokio::test]
    async fn test_remote_error_status_is_reported() {
        let (url, _recorded) = start_input_server().await;
        // No route matches a nested path.
        let delivery = RemoteDelivery::new(&format!("{}missing/", url), "x").unwrap();
        assert!(matches!(
            delivery.deliver("hi").await,
            Err(SandboxError::Delivery(_))
        ));
    }

    #[test]
    fn test_server_config_carries_remote_url() {
        let strategy = InputStrategy::Remote {
            url: "http://localhost/in/".to_string(),
        };
        let delivery = InputDelivery::for_session(&strategy, "s1").unwrap();
        let config = delivery.server_config(&strategy, "s1");
        assert_eq!(
            config.to_value(),
            serde_json::json!({"strategy": "remote", "session_id": "s1", "url": "http://localhost/in/"})
        );
    }
}
