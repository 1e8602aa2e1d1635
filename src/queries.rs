//! Query discovery
//!
//! Turns the `queries` section of the configuration into the job list of one batch.
//! A query's name is its file name without the `.sql` extension unless the config
//! entry names it explicitly.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::Job;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// A query read from disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryFile {
    /// Query name
    pub name: String,
    /// File the query was read from
    pub path: PathBuf,
    /// SQL text, untouched
    pub sql: String,
}

/// Read a single query file
pub fn read_query_file(path: &Path) -> Result<QueryFile> {
    let sql = std::fs::read_to_string(path).map_err(|e| Error::Query {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok(QueryFile {
        name: query_name(path),
        path: path.to_path_buf(),
        sql,
    })
}

/// Read every `*.sql` file below `dir`, in path order
pub fn read_query_dir(dir: &Path) -> Result<Vec<QueryFile>> {
    let mut queries = Vec::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Query {
            path: e.path().unwrap_or(dir).to_path_buf(),
            message: e.to_string(),
        })?;

        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }

        queries.push(read_query_file(entry.path())?);
    }

    tracing::debug!(dir = ?dir, count = queries.len(), "read query directory");
    Ok(queries)
}

fn query_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Config {
    /// Read every configured query into jobs scheduled now
    pub fn read_jobs(&self) -> Result<Vec<Job>> {
        self.read_jobs_at(Utc::now())
    }

    /// Read every configured query into jobs sharing `scheduled_at`
    ///
    /// Entries with neither `dir` nor `file` are skipped with a warning.
    pub fn read_jobs_at(&self, scheduled_at: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();

        for entry in &self.queries {
            let connection = self
                .connections
                .get(&entry.connection)
                .cloned()
                .map(Arc::new)
                .ok_or_else(|| {
                    Error::config("queries", format!("no connection named {}", entry.connection))
                })?;

            let files = match (&entry.dir, &entry.file) {
                (Some(dir), _) => read_query_dir(dir)?,
                (None, Some(file)) => {
                    let mut query = read_query_file(file)?;
                    if let Some(name) = &entry.name {
                        query.name = name.clone();
                    }
                    vec![query]
                }
                (None, None) => {
                    tracing::warn!(
                        connection = %entry.connection,
                        "query config has neither `dir` nor `file` set, skipping"
                    );
                    continue;
                }
            };

            for query in files {
                let mut job = Job::scheduled_at(
                    query.name,
                    Arc::clone(&connection),
                    query.sql,
                    scheduled_at,
                );
                job.file = Some(query.path);
                jobs.push(job);
            }
        }

        Ok(jobs)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::types::Connection;
    use std::fs;

    fn config_with(queries: Vec<QueryConfig>) -> Config {
        let mut config = Config::default();
        config.connections.insert(
            "warehouse".into(),
            Connection {
                driver: "postgres".into(),
                info: serde_json::Map::new(),
            },
        );
        config.queries = queries;
        config
    }

    #[test]
    fn file_name_without_extension_is_query_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active_users.sql");
        fs::write(&path, "select * from users where active;\n").unwrap();

        let query = read_query_file(&path).unwrap();
        assert_eq!(query.name, "active_users");
        assert_eq!(query.sql, "select * from users where active;\n");
        assert_eq!(query.path, path);
    }

    #[test]
    fn missing_file_is_query_error() {
        let err = read_query_file(Path::new("/no/such/query.sql")).unwrap_err();
        assert!(matches!(err, Error::Query { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn directory_walk_picks_sql_files_recursively_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.sql"), "select 2").unwrap();
        fs::write(dir.path().join("a.sql"), "select 1").unwrap();
        fs::write(dir.path().join("README.md"), "not a query").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.sql"), "select 3").unwrap();

        let queries = read_query_dir(dir.path()).unwrap();
        let names: Vec<&str> = queries.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn jobs_share_schedule_time_and_connection() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.sql"), "select 1").unwrap();
        fs::write(dir.path().join("b.sql"), "select 2").unwrap();

        let config = config_with(vec![QueryConfig {
            connection: "warehouse".into(),
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }]);

        let at = Utc::now();
        let jobs = config.read_jobs_at(at).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.scheduled_at == at));
        assert!(jobs.iter().all(|j| j.connection.driver == "postgres"));
        assert!(jobs.iter().all(|j| j.started_at.is_none()));
        assert_eq!(jobs[0].file.as_deref(), Some(dir.path().join("a.sql").as_path()));
    }

    #[test]
    fn explicit_name_overrides_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q1.sql");
        fs::write(&path, "select 1").unwrap();

        let config = config_with(vec![QueryConfig {
            connection: "warehouse".into(),
            file: Some(path),
            name: Some("daily_totals".into()),
            ..Default::default()
        }]);

        let jobs = config.read_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "daily_totals");
    }

    #[test]
    fn entry_without_dir_or_file_is_skipped() {
        let config = config_with(vec![QueryConfig {
            connection: "warehouse".into(),
            ..Default::default()
        }]);
        assert!(config.read_jobs().unwrap().is_empty());
    }

    #[test]
    fn unknown_connection_is_config_error() {
        let config = config_with(vec![QueryConfig {
            connection: "nope".into(),
            file: Some(PathBuf::from("/tmp/x.sql")),
            ..Default::default()
        }]);
        let err = config.read_jobs().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("nope"));
    }
}
