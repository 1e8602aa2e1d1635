//! Common test utilities for sql-extractor integration tests

#![allow(dead_code)]

use flate2::read::GzDecoder;
use sql_extractor::{Config, Event, EventPayload, EventPublisher};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

/// Event publisher that keeps every event in memory
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, Event)>>,
}

impl RecordingPublisher {
    /// Every event published so far, in publish order
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Type tags of every event published so far
    pub fn types(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event_type).collect()
    }

    /// Number of events with the given type tag
    pub fn count(&self, event_type: &str) -> usize {
        self.types().iter().filter(|t| *t == event_type).count()
    }

    /// Topics events were published on
    pub fn topics(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// `extract-ended` payload for `query`, if any
    pub fn extract_ended(&self, query: &str) -> Option<EventPayload> {
        self.events().into_iter().map(|e| e.data).find(|data| {
            matches!(data, EventPayload::ExtractEnded { query: q, .. } if q == query)
        })
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, topic: &str, correlation_id: &str, payload: EventPayload) {
        self.events
            .lock()
            .unwrap()
            .push((topic.to_string(), Event::new(correlation_id, payload)));
    }
}

/// Temporary cache root and query directory
pub struct Workspace {
    pub cache: TempDir,
    pub queries: TempDir,
}

impl Workspace {
    /// Create a workspace with one `.sql` file per `(name, sql)` pair
    pub fn with_queries(queries: &[(&str, &str)]) -> Self {
        let workspace = Self {
            cache: tempfile::tempdir().unwrap(),
            queries: tempfile::tempdir().unwrap(),
        };
        for (name, sql) in queries {
            std::fs::write(workspace.queries.path().join(format!("{name}.sql")), sql).unwrap();
        }
        workspace
    }

    /// YAML configuration pointing at this workspace and `agent`
    pub fn yaml(&self, agent: &str, extra: &str) -> String {
        format!(
            r#"
workers: 2
gzip: true
format: csv
connections:
  warehouse:
    driver: postgres
    info:
      host: db.internal
      dbname: analytics
cache:
  path: {cache}
sql_agent:
  addr: {agent}
queries:
  - connection: warehouse
    dir: {queries}
retry:
  max_attempts: 1
  delay: 0
{extra}
"#,
            cache = self.cache.path().display(),
            queries = self.queries.path().display(),
        )
    }

    /// Decoded configuration for this workspace
    pub fn config(&self, agent: &str, extra: &str) -> Config {
        Config::from_yaml_str(&self.yaml(agent, extra)).unwrap()
    }
}

/// Decompress a gzip file into a string
pub fn gunzip_file(path: &Path) -> String {
    let mut out = String::new();
    GzDecoder::new(std::fs::File::open(path).unwrap())
        .read_to_string(&mut out)
        .unwrap();
    out
}

/// Decompress gzip bytes into a string
pub fn gunzip_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    GzDecoder::new(bytes).read_to_string(&mut out).unwrap();
    out
}
