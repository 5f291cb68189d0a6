//! Wire messages exchanged over the queues
//!
//! Every payload is a UTF-8 JSON object carrying a `kind` discriminator, so
//! the receiving side decodes straight into a typed variant.

use crate::storage::{Author, Publication, Source};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised at the message boundary
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Lifecycle status carried by a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
}

/// One unit of crawl work: a single author on a single source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub author_id: i64,
    pub url: String,
    #[serde(alias = "author")]
    pub author_name: String,
    pub source: Source,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a fresh task for an author
    pub fn for_author(author: &Author, created_at: DateTime<Utc>) -> Self {
        Self {
            author_id: author.author_id,
            url: author.url.clone(),
            author_name: author.name.clone(),
            source: author.source,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at,
        }
    }

    /// The same task, pending again with one more retry on its count
    pub fn next_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            status: TaskStatus::Pending,
            ..self.clone()
        }
    }

    /// Checks the fields a worker needs to crawl
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.url.trim().is_empty() {
            return Err(MessageError::Malformed("task has no url".to_string()));
        }
        if url::Url::parse(&self.url).is_err() {
            return Err(MessageError::Malformed(format!(
                "task url '{}' is not absolute",
                self.url
            )));
        }
        if self.author_name.trim().is_empty() {
            return Err(MessageError::Malformed("task has no author".to_string()));
        }
        Ok(())
    }
}

/// Whether a crawl succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// A worker's report on one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub status: ResultStatus,
    pub task_data: Task,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub node_id: String,
}

impl CrawlResult {
    pub fn success(task: Task, publications: Vec<Publication>, node_id: &str) -> Self {
        Self {
            status: ResultStatus::Success,
            task_data: task,
            publications,
            error: None,
            node_id: node_id.to_string(),
        }
    }

    pub fn failure(task: Task, error: impl Into<String>, node_id: &str) -> Self {
        Self {
            status: ResultStatus::Error,
            task_data: task,
            publications: Vec::new(),
            error: Some(error.into()),
            node_id: node_id.to_string(),
        }
    }
}

/// Worker liveness ping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    pub fn now(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything that travels over the queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Task(Task),
    Result(CrawlResult),
    Heartbeat(Heartbeat),
}

impl Message {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decodes a payload into a typed message
    ///
    /// Payloads missing required keys or carrying an unknown `kind` fail here.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Result(_) => "result",
            Self::Heartbeat(_) => "heartbeat",
        }
    }
}

impl From<Task> for Message {
    fn from(task: Task) -> Self {
        Self::Task(task)
    }
}

impl From<CrawlResult> for Message {
    fn from(result: CrawlResult) -> Self {
        Self::Result(result)
    }
}

impl From<Heartbeat> for Message {
    fn from(heartbeat: Heartbeat) -> Self {
        Self::Heartbeat(heartbeat)
    }
}
