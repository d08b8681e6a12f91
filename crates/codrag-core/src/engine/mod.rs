//! Engine facade: per-process owner of indexes, watchers, and build threads,
//! keyed by project id.
//!
//! ## Concurrency
//!
//! Each project gets a cell holding its committed in-memory snapshots
//! (embedding index, trace index) behind `RwLock<Option<Arc<…>>>`, a
//! per-project mutation lock serializing builds, atomic building flags, and
//! an optional watcher. Two builds for the same project are mutually
//! exclusive; builds for different projects proceed in parallel. Searches
//! and context calls clone the current snapshot `Arc` and never wait for a
//! running build: snapshots are swapped only after a successful on-disk
//! commit, so a reader sees either entirely pre-build or entirely post-build
//! state.
//!
//! Background threads never terminate the process; failures are published
//! through `last_build_error` / `last_trace_error` and the registry's build
//! audit table.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, ProjectConfig, WatcherTuning};
use crate::embedder::Embedder;
use crate::error::{CoreError, CoreResult};
use crate::index::{BuildOptions, CodeIndex, IndexStats};
use crate::registry::{Project, ProjectMode, ProjectRegistry};
use crate::search::context::{
    ContextOptions, StructuredContext, TraceExpansionOptions,
};
use crate::search::{self, context};
use crate::trace::{
    NeighborDirection, NeighborSet, TraceBuildOptions, TraceBuilder, TraceIndex, TraceStatus,
};
use crate::types::{EmbeddingManifest, SearchHit, TraceEdgeKind, TraceNode, TraceNodeKind};
use crate::watcher::{
    AutoRebuildWatcher, EventSource, IsBuilding, NotifyEventSource, TriggerBuild, WatchState,
    WatchStatus,
};

/// Aggregated status for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    /// The registry record.
    pub project: Project,
    /// Whether committed index files exist on disk.
    pub index_exists: bool,
    /// Stats of the loaded index snapshot.
    pub index: IndexStats,
    /// Whether an embedding build is running.
    pub building: bool,
    /// Failure of the most recent embedding build, if any.
    pub last_build_error: Option<String>,
    /// Whether trace support is enabled for the project.
    pub trace_enabled: bool,
    /// Whether a trace build is running.
    pub trace_building: bool,
    /// Trace status, when trace is enabled.
    pub trace: Option<TraceStatus>,
    /// Failure of the most recent trace build, if any.
    pub last_trace_error: Option<String>,
    /// Watcher status, when a watcher exists for the project.
    pub watch: Option<WatchStatus>,
}

struct ProjectCell {
    project_id: String,
    repo_root: PathBuf,
    index_dir: PathBuf,
    config: RwLock<ProjectConfig>,
    /// Serializes mutating operations (embedding + trace builds).
    mutation: Mutex<()>,
    index: RwLock<Option<Arc<CodeIndex>>>,
    trace: RwLock<Option<Arc<TraceIndex>>>,
    building: AtomicBool,
    trace_building: AtomicBool,
    cancel: AtomicBool,
    last_build: Mutex<Option<EmbeddingManifest>>,
    last_build_error: Mutex<Option<String>>,
    last_trace_error: Mutex<Option<String>>,
    build_thread: Mutex<Option<JoinHandle<()>>>,
    trace_thread: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<Arc<AutoRebuildWatcher>>>,
}

struct EngineInner {
    config: EngineConfig,
    registry: ProjectRegistry,
    embedder: Arc<dyn Embedder>,
    cells: DashMap<String, Arc<ProjectCell>>,
}

/// The CoDRAG core engine.
///
/// Cheap to clone; all state is shared behind the inner `Arc`. Tests
/// construct their own engine per case with a fake embedder.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine with explicit configuration and embedding provider.
    pub fn new(config: EngineConfig, embedder: Arc<dyn Embedder>) -> CoreResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let registry = ProjectRegistry::open(&config.registry_db_path(), &config.data_dir)?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            model = %embedder.model_tag(),
            "engine initialized"
        );

        Ok(Self {
            inner: Arc::new(EngineInner { config, registry, embedder, cells: DashMap::new() }),
        })
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Register a project rooted at `path`.
    pub fn add_project(
        &self,
        path: &Path,
        name: Option<&str>,
        mode: ProjectMode,
        config: Option<ProjectConfig>,
    ) -> CoreResult<Project> {
        if !path.is_dir() {
            return Err(CoreError::validation(format!(
                "project root is not a directory: {}",
                path.display()
            )));
        }
        self.inner.registry.add_project(path, name, mode, config)
    }

    /// Look up a project.
    pub fn get_project(&self, project_id: &str) -> CoreResult<Project> {
        self.inner
            .registry
            .get_project(project_id)?
            .ok_or_else(|| CoreError::ProjectNotFound { project_id: project_id.to_string() })
    }

    /// List projects, most recently updated first.
    pub fn list_projects(&self) -> CoreResult<Vec<Project>> {
        self.inner.registry.list_projects()
    }

    /// Update a project's name and/or config.
    pub fn update_project(
        &self,
        project_id: &str,
        name: Option<&str>,
        config: Option<&ProjectConfig>,
    ) -> CoreResult<Project> {
        let updated = self.inner.registry.update_project(project_id, name, config)?;
        if let Some(cell) = self.inner.cells.get(project_id) {
            *cell.config.write() = updated.config.clone();
        }
        Ok(updated)
    }

    /// Remove a project, optionally purging its index directory.
    ///
    /// Stops the watcher, cancels any in-flight builds, and waits for their
    /// threads before touching the registry.
    pub fn remove_project(&self, project_id: &str, purge: bool) -> CoreResult<()> {
        if let Some((_, cell)) = self.inner.cells.remove(project_id) {
            if let Some(watcher) = cell.watcher.lock().take() {
                watcher.stop();
            }
            cell.cancel.store(true, Ordering::Relaxed);
            join_thread(&cell.build_thread);
            join_thread(&cell.trace_thread);
        }
        self.inner.registry.remove_project(project_id, purge)
    }

    /// Aggregated status: index existence + stats + building flags + trace
    /// status + watch status.
    pub fn status(&self, project_id: &str) -> CoreResult<ProjectStatus> {
        let project = self.get_project(project_id)?;
        let cell = self.cell_for(&project)?;

        let index_exists = cell.index_dir.join("documents.json").exists();
        let index_stats = match cell.index.read().as_ref() {
            Some(index) => index.stats(),
            None => IndexStats {
                loaded: false,
                index_dir: cell.index_dir.to_string_lossy().to_string(),
                model: None,
                built_at: None,
                total_documents: 0,
                embedding_dim: 0,
            },
        };

        let trace_enabled = project.config.trace.enabled;
        let trace = if trace_enabled {
            Some(TraceIndex::peek_status(&cell.index_dir))
        } else {
            None
        };

        let watch = cell.watcher.lock().as_ref().map(|w| w.status());
        let last_build_error = cell.last_build_error.lock().clone();
        let last_trace_error = cell.last_trace_error.lock().clone();

        Ok(ProjectStatus {
            project,
            index_exists,
            index: index_stats,
            building: cell.building.load(Ordering::Relaxed),
            last_build_error,
            trace_enabled,
            trace_building: cell.trace_building.load(Ordering::Relaxed),
            trace,
            last_trace_error,
            watch,
        })
    }

    // -----------------------------------------------------------------------
    // Builds
    // -----------------------------------------------------------------------

    /// Start an embedding build on a worker thread.
    ///
    /// Rejects with [`CoreError::BuildAlreadyRunning`] when a build is
    /// already in flight for the project.
    pub fn start_build(&self, project_id: &str, options: BuildOptions) -> CoreResult<()> {
        let project = self.get_project(project_id)?;
        let cell = self.cell_for(&project)?;
        Self::spawn_build(&self.inner, &cell, options)
    }

    fn spawn_build(
        inner: &Arc<EngineInner>,
        cell: &Arc<ProjectCell>,
        options: BuildOptions,
    ) -> CoreResult<()> {
        if cell.building.swap(true, Ordering::SeqCst) {
            return Err(CoreError::BuildAlreadyRunning { project_id: cell.project_id.clone() });
        }
        cell.cancel.store(false, Ordering::Relaxed);

        let audit_id = match inner.registry.record_build_started(&cell.project_id) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "failed to record build start");
                None
            }
        };

        let inner = Arc::clone(inner);
        let cell_for_thread = Arc::clone(cell);
        let handle = std::thread::spawn(move || {
            run_build(&inner, &cell_for_thread, options, audit_id);
        });

        // Park the handle so shutdown can join it.
        let mut slot = cell.build_thread.lock();
        if let Some(previous) = slot.take() {
            let _ = previous.join();
        }
        *slot = Some(handle);
        Ok(())
    }

    /// Block until the current embedding build (if any) finishes.
    pub fn wait_for_build(&self, project_id: &str) -> CoreResult<()> {
        let project = self.get_project(project_id)?;
        let cell = self.cell_for(&project)?;
        join_thread(&cell.build_thread);
        Ok(())
    }

    /// Start a trace build on a worker thread.
    pub fn start_trace_build(&self, project_id: &str) -> CoreResult<()> {
        let project = self.get_project(project_id)?;
        if !project.config.trace.enabled {
            return Err(CoreError::TraceDisabled { project_id: project_id.to_string() });
        }
        let cell = self.cell_for(&project)?;

        if cell.trace_building.swap(true, Ordering::SeqCst) {
            return Err(CoreError::TraceBuildAlreadyRunning { project_id: project_id.to_string() });
        }

        let cell_for_thread = Arc::clone(&cell);
        let handle = std::thread::spawn(move || {
            run_trace_build(&cell_for_thread);
        });

        let mut slot = cell.trace_thread.lock();
        if let Some(previous) = slot.take() {
            let _ = previous.join();
        }
        *slot = Some(handle);
        Ok(())
    }

    /// Block until the current trace build (if any) finishes.
    pub fn wait_for_trace_build(&self, project_id: &str) -> CoreResult<()> {
        let project = self.get_project(project_id)?;
        let cell = self.cell_for(&project)?;
        join_thread(&cell.trace_thread);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Search / context
    // -----------------------------------------------------------------------

    /// Hybrid search over a project's committed index snapshot.
    pub fn search(
        &self,
        project_id: &str,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> CoreResult<Vec<SearchHit>> {
        validate_query(query)?;
        if k == 0 {
            return Err(CoreError::validation("k must be positive"));
        }

        let index = self.loaded_index(project_id)?;
        search::search(&index, self.inner.embedder.as_ref(), query, k, min_score)
    }

    /// Assemble a plain context string.
    pub fn context(
        &self,
        project_id: &str,
        query: &str,
        options: &ContextOptions,
    ) -> CoreResult<String> {
        validate_query(query)?;
        validate_context_options(options)?;
        let index = self.loaded_index(project_id)?;
        context::get_context(&index, self.inner.embedder.as_ref(), query, options)
    }

    /// Assemble structured context, optionally expanded through the trace
    /// graph.
    pub fn context_structured(
        &self,
        project_id: &str,
        query: &str,
        options: &ContextOptions,
        expansion: Option<&TraceExpansionOptions>,
    ) -> CoreResult<StructuredContext> {
        validate_query(query)?;
        validate_context_options(options)?;
        let index = self.loaded_index(project_id)?;
        let mut ctx =
            context::get_context_structured(&index, self.inner.embedder.as_ref(), query, options)?;

        if let Some(expansion) = expansion {
            let project = self.get_project(project_id)?;
            if project.config.trace.enabled {
                if let Ok(trace) = self.loaded_trace(project_id) {
                    context::expand_with_trace(
                        &mut ctx,
                        &trace,
                        Path::new(&project.path),
                        expansion,
                    );
                }
            }
        }

        Ok(ctx)
    }

    // -----------------------------------------------------------------------
    // Trace queries
    // -----------------------------------------------------------------------

    /// Name search over trace nodes.
    pub fn trace_search(
        &self,
        project_id: &str,
        query: &str,
        kind: Option<TraceNodeKind>,
        limit: usize,
    ) -> CoreResult<Vec<TraceNode>> {
        validate_query(query)?;
        let trace = self.loaded_trace(project_id)?;
        Ok(trace.search_nodes(query, kind, limit).into_iter().cloned().collect())
    }

    /// Trace node lookup.
    pub fn trace_node(&self, project_id: &str, node_id: &str) -> CoreResult<TraceNode> {
        let trace = self.loaded_trace(project_id)?;
        trace
            .get_node(node_id)
            .cloned()
            .ok_or_else(|| CoreError::NodeNotFound { node_id: node_id.to_string() })
    }

    /// Bounded neighbor traversal around a trace node.
    pub fn trace_neighbors(
        &self,
        project_id: &str,
        node_id: &str,
        direction: NeighborDirection,
        edge_kinds: Option<&[TraceEdgeKind]>,
        max_nodes: usize,
    ) -> CoreResult<NeighborSet> {
        let trace = self.loaded_trace(project_id)?;
        if trace.get_node(node_id).is_none() {
            return Err(CoreError::NodeNotFound { node_id: node_id.to_string() });
        }
        Ok(trace.get_neighbors(node_id, direction, edge_kinds, max_nodes))
    }

    // -----------------------------------------------------------------------
    // Watcher
    // -----------------------------------------------------------------------

    /// Start the auto-rebuild watcher for a project with the platform event
    /// source.
    pub fn watch_start(&self, project_id: &str) -> CoreResult<()> {
        self.watch_start_with_source(project_id, Box::new(NotifyEventSource::new()))
    }

    /// Start the watcher with an explicit event source (used by tests).
    pub fn watch_start_with_source(
        &self,
        project_id: &str,
        source: Box<dyn EventSource>,
    ) -> CoreResult<()> {
        let project = self.get_project(project_id)?;
        let cell = self.cell_for(&project)?;

        let mut watcher_slot = cell.watcher.lock();
        if watcher_slot.is_none() {
            let tuning = project.config.watcher.unwrap_or(self.inner.config.watcher);
            let watcher = Arc::new(self.make_watcher(&cell, tuning, source));
            *watcher_slot = Some(watcher);
        }
        if let Some(watcher) = watcher_slot.as_ref() {
            watcher.start()?;
        }
        Ok(())
    }

    fn make_watcher(
        &self,
        cell: &Arc<ProjectCell>,
        tuning: WatcherTuning,
        source: Box<dyn EventSource>,
    ) -> AutoRebuildWatcher {
        let weak_inner: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let weak_cell = Arc::downgrade(cell);

        let on_trigger: TriggerBuild = Box::new(move |paths| {
            let (Some(inner), Some(cell)) = (weak_inner.upgrade(), weak_cell.upgrade()) else {
                return false;
            };
            tracing::debug!(
                project_id = %cell.project_id,
                changed = paths.len(),
                "watcher triggering rebuild"
            );
            match Engine::spawn_build(&inner, &cell, BuildOptions::default()) {
                Ok(()) => true,
                Err(CoreError::BuildAlreadyRunning { .. }) => false,
                Err(e) => {
                    tracing::warn!(error = %e, "watcher-triggered build failed to start");
                    false
                }
            }
        });

        let weak_cell = Arc::downgrade(cell);
        let is_building: IsBuilding = Box::new(move || {
            weak_cell
                .upgrade()
                .map(|cell| cell.building.load(Ordering::Relaxed))
                .unwrap_or(false)
        });

        AutoRebuildWatcher::new(
            &cell.repo_root,
            &cell.index_dir,
            tuning,
            source,
            on_trigger,
            is_building,
        )
    }

    /// Stop the watcher for a project. No-op when none is running.
    pub fn watch_stop(&self, project_id: &str) -> CoreResult<()> {
        let project = self.get_project(project_id)?;
        let cell = self.cell_for(&project)?;
        if let Some(watcher) = cell.watcher.lock().as_ref() {
            watcher.stop();
        }
        Ok(())
    }

    /// Watcher status; a disabled placeholder when none exists.
    pub fn watch_status(&self, project_id: &str) -> CoreResult<WatchStatus> {
        let project = self.get_project(project_id)?;
        let cell = self.cell_for(&project)?;
        let status = cell.watcher.lock().as_ref().map(|w| w.status());
        Ok(status.unwrap_or(WatchStatus {
            enabled: false,
            state: WatchState::Disabled,
            debounce_ms: self.inner.config.watcher.debounce_ms,
            stale: false,
            stale_since: None,
            pending_paths_count: 0,
            next_rebuild_at: None,
            last_event_at: None,
            last_rebuild_at: None,
        }))
    }

    /// Shut down: stop watchers, request build cancellation, join worker
    /// threads.
    pub fn shutdown(&self) {
        for entry in self.inner.cells.iter() {
            let cell = entry.value();
            if let Some(watcher) = cell.watcher.lock().take() {
                watcher.stop();
            }
            cell.cancel.store(true, Ordering::Relaxed);
            join_thread(&cell.build_thread);
            join_thread(&cell.trace_thread);
        }
        tracing::info!("engine shut down");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn cell_for(&self, project: &Project) -> CoreResult<Arc<ProjectCell>> {
        if let Some(cell) = self.inner.cells.get(&project.id) {
            return Ok(Arc::clone(cell.value()));
        }

        let index_dir = self.inner.registry.index_dir(project);
        let cell = Arc::new(ProjectCell {
            project_id: project.id.clone(),
            repo_root: PathBuf::from(&project.path),
            index_dir,
            config: RwLock::new(project.config.clone()),
            mutation: Mutex::new(()),
            index: RwLock::new(None),
            trace: RwLock::new(None),
            building: AtomicBool::new(false),
            trace_building: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            last_build: Mutex::new(None),
            last_build_error: Mutex::new(None),
            last_trace_error: Mutex::new(None),
            build_thread: Mutex::new(None),
            trace_thread: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        // Insert-or-get under DashMap's entry lock.
        let entry = self.inner.cells.entry(project.id.clone()).or_insert(cell);
        Ok(Arc::clone(entry.value()))
    }

    /// Current index snapshot, loading from disk on first access.
    fn loaded_index(&self, project_id: &str) -> CoreResult<Arc<CodeIndex>> {
        let project = self.get_project(project_id)?;
        let cell = self.cell_for(&project)?;

        if let Some(index) = cell.index.read().as_ref() {
            if index.is_loaded() {
                return Ok(Arc::clone(index));
            }
        }

        // Lazy load from committed files.
        let loaded = CodeIndex::open(&cell.index_dir);
        if loaded.is_loaded() {
            let arc = Arc::new(loaded);
            *cell.index.write() = Some(Arc::clone(&arc));
            return Ok(arc);
        }

        Err(CoreError::IndexNotBuilt { project_id: project_id.to_string() })
    }

    /// Current trace snapshot, loading from disk on first access.
    fn loaded_trace(&self, project_id: &str) -> CoreResult<Arc<TraceIndex>> {
        let project = self.get_project(project_id)?;
        if !project.config.trace.enabled {
            return Err(CoreError::TraceDisabled { project_id: project_id.to_string() });
        }
        let cell = self.cell_for(&project)?;

        if let Some(trace) = cell.trace.read().as_ref() {
            if trace.is_loaded() {
                return Ok(Arc::clone(trace));
            }
        }

        let mut loaded = TraceIndex::new(&cell.index_dir);
        if loaded.load() {
            let arc = Arc::new(loaded);
            *cell.trace.write() = Some(Arc::clone(&arc));
            return Ok(arc);
        }

        Err(CoreError::TraceNotBuilt { project_id: project_id.to_string() })
    }
}

fn run_build(
    inner: &Arc<EngineInner>,
    cell: &Arc<ProjectCell>,
    options: BuildOptions,
    audit_id: Option<String>,
) {
    let _guard = cell.mutation.lock();

    let mut effective = options;
    {
        let config = cell.config.read();
        if effective.include_globs.is_empty() {
            effective.include_globs = config.include_globs.clone();
        }
        if effective.exclude_globs.is_empty() {
            effective.exclude_globs = config.exclude_globs.clone();
        }
        if effective.max_file_bytes == 0 {
            effective.max_file_bytes = config.effective_max_file_bytes();
        }
    }

    let mut index = CodeIndex::open(&cell.index_dir);
    let result = index.build(&cell.repo_root, inner.embedder.as_ref(), &effective, &cell.cancel);

    match result {
        Ok(manifest) => {
            // Swap the committed snapshot in; readers pick it up atomically.
            *cell.index.write() = Some(Arc::new(index));
            *cell.last_build.lock() = Some(manifest.clone());
            *cell.last_build_error.lock() = None;

            if let Some(audit_id) = &audit_id {
                let stats = serde_json::to_string(&manifest.build).ok();
                if let Err(e) = inner.registry.record_build_finished(
                    audit_id,
                    "completed",
                    stats.as_deref(),
                    None,
                ) {
                    tracing::warn!(error = %e, "failed to record build completion");
                }
            }
        }
        Err(e) => {
            let message = e.to_string();
            tracing::error!(project_id = %cell.project_id, error = %message, "build failed");
            *cell.last_build_error.lock() = Some(message.clone());

            if let Some(audit_id) = &audit_id {
                if let Err(audit_err) =
                    inner.registry.record_build_finished(audit_id, "failed", None, Some(&message))
                {
                    tracing::warn!(error = %audit_err, "failed to record build failure");
                }
            }
        }
    }

    cell.building.store(false, Ordering::SeqCst);
}

fn run_trace_build(cell: &Arc<ProjectCell>) {
    let _guard = cell.mutation.lock();

    let builder = TraceBuilder::new(&cell.repo_root, &cell.index_dir, TraceBuildOptions::default());
    match builder.build(&cell.cancel) {
        Ok(manifest) => {
            *cell.last_trace_error.lock() = manifest.last_error.clone();
            let mut trace = TraceIndex::new(&cell.index_dir);
            if trace.load() {
                *cell.trace.write() = Some(Arc::new(trace));
            }
        }
        Err(e) => {
            let message = e.to_string();
            tracing::error!(project_id = %cell.project_id, error = %message, "trace build failed");
            *cell.last_trace_error.lock() = Some(message);
        }
    }

    cell.trace_building.store(false, Ordering::SeqCst);
}

fn join_thread(slot: &Mutex<Option<JoinHandle<()>>>) {
    let handle = slot.lock().take();
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

fn validate_query(query: &str) -> CoreResult<()> {
    if query.trim().is_empty() {
        return Err(CoreError::validation("query is required"));
    }
    Ok(())
}

fn validate_context_options(options: &ContextOptions) -> CoreResult<()> {
    if options.k == 0 {
        return Err(CoreError::validation("k must be positive"));
    }
    if options.max_chars == 0 {
        return Err(CoreError::validation("max_chars must be positive"));
    }
    Ok(())
}
