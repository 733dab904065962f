//! Remote source contract + Wordnik and fixture-backed implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use wotd_core::{Artifact, Definition, Example, PipelineError};
use wotd_storage::HttpFetcher;

pub const CRATE_NAME: &str = "wotd-adapters";

pub const WORDNIK_BASE_URL: &str = "https://api.wordnik.com/v4";

/// One call, one artifact. Retries belong to the orchestrator.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_artifact(&self) -> Result<Artifact, PipelineError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordnikResponse {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub word: String,
    #[serde(default)]
    pub definitions: Vec<WordnikDefinition>,
    #[serde(default)]
    pub publish_date: String,
    #[serde(default)]
    pub examples: Vec<WordnikExample>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub pronunciation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordnikDefinition {
    #[serde(default)]
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub part_of_speech: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WordnikExample {
    #[serde(default)]
    pub title: String,
    pub text: String,
}

impl WordnikResponse {
    /// Map the wire payload onto the domain artifact, rejecting payloads that
    /// lack the fields the pipeline relies on.
    pub fn into_artifact(self) -> Result<Artifact, PipelineError> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::MalformedResponse("missing _id".into()));
        }
        if self.word.trim().is_empty() {
            return Err(PipelineError::MalformedResponse("missing word".into()));
        }
        if self.publish_date.trim().is_empty() {
            return Err(PipelineError::MalformedResponse(format!(
                "missing publishDate for `{}`",
                self.word
            )));
        }
        let Some(first) = self.definitions.into_iter().next() else {
            return Err(PipelineError::MalformedResponse(format!(
                "no definitions for `{}`",
                self.word
            )));
        };

        let definition = Definition {
            source: first.source,
            text: first.text,
            note: first.note,
            part_of_speech: first.part_of_speech,
        };
        let examples = self
            .examples
            .into_iter()
            .map(|e| Example {
                text: e.text,
                title: e.title,
            })
            .collect();

        Ok(Artifact::new(
            self.id,
            self.word,
            self.pronunciation.unwrap_or_default(),
            definition,
            examples,
            self.publish_date,
            self.note.unwrap_or_default(),
        ))
    }
}

pub fn parse_wordnik_payload(bytes: &[u8]) -> Result<Artifact, PipelineError> {
    let response: WordnikResponse = serde_json::from_slice(bytes)
        .map_err(|err| PipelineError::MalformedResponse(err.to_string()))?;
    response.into_artifact()
}

/// Load a Wordnik-shaped payload from disk, for tooling and tests.
pub fn load_fixture_payload(path: impl AsRef<Path>) -> Result<Artifact> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_wordnik_payload(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct WordnikSource {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
}

impl WordnikSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/words.json/wordOfTheDay",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl RemoteSource for WordnikSource {
    fn source_id(&self) -> &'static str {
        "wordnik"
    }

    async fn fetch_artifact(&self) -> Result<Artifact, PipelineError> {
        let url = self.endpoint();
        let response = self
            .http
            .fetch_bytes(&url, &[("api_key", self.api_key.as_str())])
            .await?;
        let artifact = parse_wordnik_payload(&response.body)?;
        debug!(
            source_id = self.source_id(),
            external_id = artifact.external_id(),
            word = artifact.word(),
            "parsed word of the day"
        );
        Ok(artifact)
    }
}

/// Serves whatever payload currently sits at `path`, re-reading it on every call.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RemoteSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_artifact(&self) -> Result<Artifact, PipelineError> {
        let data = tokio::fs::read(&self.path).await.map_err(|err| {
            PipelineError::Network(format!("reading {}: {err}", self.path.display()))
        })?;
        parse_wordnik_payload(&data)
    }
}
