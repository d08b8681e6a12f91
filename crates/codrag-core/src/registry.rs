//! Durable project registry.
//!
//! SQLite-backed mapping of project id to (root path, mode, config), with a
//! uniqueness constraint on the absolute root path and a `builds` audit
//! table. Connections are short-lived (one per operation) in WAL mode, so
//! registry access never blocks engine reads for long.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::ProjectConfig;
use crate::error::{CoreError, CoreResult};

/// Where a project's index directory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectMode {
    /// Index stored under the engine data directory.
    Standalone,
    /// Index stored inside the repository at `<root>/.codrag`.
    Embedded,
}

impl ProjectMode {
    /// Stable string form stored in the registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Embedded => "embedded",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "standalone" => Ok(Self::Standalone),
            "embedded" => Ok(Self::Embedded),
            other => Err(CoreError::validation(format!("invalid project mode: {other}"))),
        }
    }
}

/// A registered project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Generated id (UUID v4).
    pub id: String,
    /// Display name; defaults to the root directory name.
    pub name: String,
    /// Absolute root path, unique across the registry.
    pub path: String,
    /// Index directory placement.
    pub mode: ProjectMode,
    /// Per-project configuration.
    pub config: ProjectConfig,
    /// UTC ISO-8601 creation timestamp.
    pub created_at: String,
    /// UTC ISO-8601 last-update timestamp.
    pub updated_at: String,
}

/// SQLite-backed project registry.
pub struct ProjectRegistry {
    db_path: PathBuf,
    data_dir: PathBuf,
}

impl ProjectRegistry {
    /// Open (and initialize) the registry database.
    pub fn open(db_path: &Path, data_dir: &Path) -> CoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let registry = Self { db_path: db_path.to_path_buf(), data_dir: data_dir.to_path_buf() };
        let conn = registry.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                path TEXT NOT NULL UNIQUE,
                mode TEXT DEFAULT 'standalone',
                config TEXT,
                created_at TEXT,
                updated_at TEXT
            );
            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                project_id TEXT REFERENCES projects(id),
                status TEXT,
                started_at TEXT,
                completed_at TEXT,
                stats TEXT,
                error TEXT
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT
            );",
        )?;
        Ok(registry)
    }

    fn connect(&self) -> CoreResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::debug!(error = %e, "WAL journal mode unavailable");
        }
        Ok(conn)
    }

    /// Resolve the index directory for a project.
    ///
    /// Embedded mode: `<root>/.codrag`; standalone: `<data_dir>/projects/<id>`.
    pub fn index_dir(&self, project: &Project) -> PathBuf {
        match project.mode {
            ProjectMode::Embedded => Path::new(&project.path).join(".codrag"),
            ProjectMode::Standalone => self.data_dir.join("projects").join(&project.id),
        }
    }

    /// Register a project. The root path is made absolute and must be unique.
    pub fn add_project(
        &self,
        path: &Path,
        name: Option<&str>,
        mode: ProjectMode,
        config: Option<ProjectConfig>,
    ) -> CoreResult<Project> {
        let abs_path = std::path::absolute(path)?;
        let abs_str = abs_path.to_string_lossy().to_string();

        let project_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let final_name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| abs_path.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| project_id.clone());
        let config = config.unwrap_or_default();
        let config_json = serde_json::to_string(&config)?;

        let conn = self.connect()?;
        let result = conn.execute(
            "INSERT INTO projects (id, name, path, mode, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (&project_id, &final_name, &abs_str, mode.as_str(), &config_json, &now, &now),
        );

        match result {
            Ok(_) => Ok(Project {
                id: project_id,
                name: final_name,
                path: abs_str,
                mode,
                config,
                created_at: now.clone(),
                updated_at: now,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(CoreError::ProjectAlreadyExists { path: abs_str })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a project by id.
    pub fn get_project(&self, project_id: &str) -> CoreResult<Option<Project>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, path, mode, config, created_at, updated_at
             FROM projects WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([project_id], row_to_project)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// List all projects, most recently updated first.
    pub fn list_projects(&self) -> CoreResult<Vec<Project>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, path, mode, config, created_at, updated_at
             FROM projects ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_project)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Update name and/or config, bumping `updated_at`.
    pub fn update_project(
        &self,
        project_id: &str,
        name: Option<&str>,
        config: Option<&ProjectConfig>,
    ) -> CoreResult<Project> {
        let existing = self
            .get_project(project_id)?
            .ok_or_else(|| CoreError::ProjectNotFound { project_id: project_id.to_string() })?;

        let new_name = name.unwrap_or(&existing.name);
        let new_config = config.unwrap_or(&existing.config);
        let now = chrono::Utc::now().to_rfc3339();

        let conn = self.connect()?;
        conn.execute(
            "UPDATE projects SET name = ?1, config = ?2, updated_at = ?3 WHERE id = ?4",
            (new_name, serde_json::to_string(new_config)?, &now, project_id),
        )?;

        self.get_project(project_id)?
            .ok_or_else(|| CoreError::ProjectNotFound { project_id: project_id.to_string() })
    }

    /// Remove a project, optionally purging its index directory.
    ///
    /// Purging is refused when the resolved index directory escapes its
    /// containment: the project root for embedded mode, the engine data
    /// directory for standalone mode. Refusal happens before the registry row
    /// is touched.
    pub fn remove_project(&self, project_id: &str, purge: bool) -> CoreResult<()> {
        let project = self
            .get_project(project_id)?
            .ok_or_else(|| CoreError::ProjectNotFound { project_id: project_id.to_string() })?;

        if purge {
            let index_dir = self.index_dir(&project);
            if index_dir.exists() {
                let resolved = index_dir.canonicalize()?;
                let containment = match project.mode {
                    ProjectMode::Embedded => Path::new(&project.path)
                        .canonicalize()
                        .unwrap_or_else(|_| PathBuf::from(&project.path)),
                    ProjectMode::Standalone => self
                        .data_dir
                        .join("projects")
                        .canonicalize()
                        .unwrap_or_else(|_| self.data_dir.join("projects")),
                };
                if !resolved.starts_with(&containment) {
                    return Err(CoreError::PurgeRefused { path: resolved });
                }
                std::fs::remove_dir_all(&resolved)?;
            }
        }

        let conn = self.connect()?;
        conn.execute("DELETE FROM projects WHERE id = ?1", [project_id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Build audit trail
    // -----------------------------------------------------------------------

    /// Record the start of a build; returns the audit row id.
    pub fn record_build_started(&self, project_id: &str) -> CoreResult<String> {
        let build_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO builds (id, project_id, status, started_at) VALUES (?1, ?2, 'running', ?3)",
            (&build_id, project_id, &now),
        )?;
        Ok(build_id)
    }

    /// Record build completion or failure.
    pub fn record_build_finished(
        &self,
        build_id: &str,
        status: &str,
        stats_json: Option<&str>,
        error: Option<&str>,
    ) -> CoreResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE builds SET status = ?1, completed_at = ?2, stats = ?3, error = ?4 WHERE id = ?5",
            (status, &now, stats_json, error, build_id),
        )?;
        Ok(())
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let mode_str: String = row.get::<_, Option<String>>(3)?.unwrap_or_else(|| "standalone".into());
    let config_raw: Option<String> = row.get(4)?;
    let config = config_raw
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        mode: ProjectMode::parse(&mode_str).unwrap_or(ProjectMode::Standalone),
        config,
        created_at: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        updated_at: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
    })
}
