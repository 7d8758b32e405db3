//! The build orchestrator: full and incremental builds over one project.
//!
//! A full build discovers every tracked file under the project root and
//! builds the reference graph from scratch. An incremental build resolves
//! only the changed files into a small delta graph (pre-sized to the
//! reference graph's layer count so layer numbers line up), compiles it
//! with interface changes allowed to pull reference members across, merges
//! the delta back, and finally re-links whatever became dirty.
//!
//! The orchestrator is also the only place that touches the filesystem on
//! the graph's behalf: orphaned generated files reported by a suppression
//! are deleted here, and only if the build created them.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifact;
use crate::cancel::CancelToken;
use crate::compile::{self, CompileError};
use crate::diagnostics::BuildResult;
use crate::graph::{self, LayersGraph, SuppressOutcome, VertexArena};
use crate::link::{self, LinkError};
use crate::project::{
    is_tracked_source, FileSettings, ProjectConfig, ProjectError, ProjectState,
};
use crate::resolver::{self, ResolveError};
use crate::toolchain::Toolchain;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// One project's build state: configuration, persisted metadata, and the
/// reference dependency graph kept between builds.
pub struct BuildOrchestrator {
    root: PathBuf,
    config: ProjectConfig,
    state: ProjectState,
    arena: VertexArena,
    graph: LayersGraph,
    cancel: CancelToken,
}

impl BuildOrchestrator {
    /// Open a project rooted at `root`, loading its persisted metadata.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(ProjectError::RootNotFound(root.to_path_buf()).into());
        }
        let root = root.canonicalize()?;
        let config = ProjectConfig::load(&root)?;
        let state = ProjectState::load(&root)?;
        Ok(Self {
            root,
            config,
            state,
            arena: VertexArena::new(),
            graph: LayersGraph::new(),
            cancel: CancelToken::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProjectConfig {
        &mut self.config
    }

    /// Token another thread can use to cancel a running build at the next
    /// file boundary.
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Attach per-file settings (executable flag, extra flags, external
    /// objects) and persist them. Takes effect at the next resolution of
    /// the file.
    pub fn set_file_settings(&mut self, path: PathBuf, settings: FileSettings) -> Result<()> {
        self.state.set_settings(path, settings);
        self.state.save(&self.root)?;
        Ok(())
    }

    pub fn settings(&self, path: &Path) -> FileSettings {
        self.state.settings(path)
    }

    /// Run a build. `changed` is `None` for a full build, or the list of
    /// files that changed since the last one (project-relative paths;
    /// absolute paths declare external references). Deleted files are
    /// recognized by their absence on disk and suppressed from the graph.
    pub fn request_build(&mut self, changed: Option<&[PathBuf]>) -> Result<BuildResult> {
        self.cancel.reset();
        let toolchain = Toolchain::new(&self.root, &self.config);

        let roots = match changed {
            None => {
                info!("full build of {:?}", self.root);
                self.arena = VertexArena::new();
                self.graph = LayersGraph::new();
                self.discover()?
            }
            Some(files) => {
                info!("incremental build, {} changed file(s)", files.len());
                self.partition_deleted(files)
            }
        };

        // Materialize external references before resolution sees them.
        for target in roots.iter().filter(|p| p.is_absolute()) {
            let link = resolver::external_link_path(target);
            resolver::write_external_link(&self.root, &link, target)?;
            self.state.mark_generated(link);
        }

        let resolved = resolver::resolve(&mut self.arena, &toolchain, &self.state, &roots)?;

        // Move everything the resolver touched into a delta graph aligned
        // with the reference graph's layers.
        let mut delta = LayersGraph::with_layer_count(self.graph.layer_count());
        for &id in &resolved.resolved {
            if self.graph.contains(id) {
                self.graph.remove_vertex(&self.arena, id);
            }
        }
        delta.add_all(&mut self.arena, &resolved.resolved);
        for &id in &resolved.executables {
            delta.add_exe(id);
        }
        for &id in &resolved.demoted_executables {
            self.graph.remove_exe(&mut self.arena, id);
            delta.remove_exe(&mut self.arena, id);
        }

        for &id in &resolved.orphaned_externals {
            if !self.arena.contains(id) {
                continue;
            }
            debug!("suppressing orphaned external {:?}", self.arena.vertex(id).path);
            let outcome = if delta.contains(id) {
                delta.suppress(&mut self.arena, id)
            } else {
                self.graph.suppress(&mut self.arena, id)
            };
            self.delete_orphans(&outcome);
        }

        let compiled = compile::run(
            &mut self.arena,
            &mut delta,
            Some(&mut self.graph),
            &toolchain,
            &self.config,
            &mut self.state,
            &self.cancel,
        )?;

        self.graph.merge_with(&self.arena, delta);
        self.graph.remove_empty_final_layers();
        let report = graph::check_consistency(&mut self.arena);
        if !report.is_clean() {
            warn!(
                "graph consistency check: {} repaired edge(s), {} layer violation(s), cyclic: {}",
                report.repaired_edges,
                report.layer_violations.len(),
                report.cyclic
            );
        }

        let mut result = BuildResult {
            markers: compiled.markers,
            cancelled: compiled.cancelled,
            cycles: resolved.cycles,
            ..BuildResult::default()
        };
        if !result.cancelled {
            let linked = link::run(
                &mut self.arena,
                &mut self.graph,
                &toolchain,
                &self.config,
                &mut self.state,
                &self.cancel,
            )?;
            result.link_failures = linked.failures;
            result.cancelled = linked.cancelled;
        }
        result.success = !result.cancelled
            && !result.markers.has_errors()
            && result.link_failures.is_empty();

        self.state.save(&self.root)?;
        info!(
            "build finished: success={}, {} error(s), {} warning(s)",
            result.success,
            result.error_count(),
            result.warning_count()
        );
        Ok(result)
    }

    /// Discover and resolve the whole project without compiling anything,
    /// leaving the reference graph populated. Used for graph inspection.
    pub fn resolve_only(&mut self) -> Result<()> {
        let toolchain = Toolchain::new(&self.root, &self.config);
        self.arena = VertexArena::new();
        self.graph = LayersGraph::new();
        let roots = self.discover()?;
        let resolved = resolver::resolve(&mut self.arena, &toolchain, &self.state, &roots)?;
        self.graph.add_all(&mut self.arena, &resolved.resolved);
        for &id in &resolved.executables {
            self.graph.add_exe(id);
        }
        Ok(())
    }

    /// Delete everything the build generated and forget the graph.
    pub fn request_clean(&mut self) -> Result<()> {
        info!("cleaning {:?}", self.root);
        let files: Vec<PathBuf> = self.state.generated_files().cloned().collect();
        for file in files {
            artifact::remove_with_retry(&self.root.join(&file));
        }
        self.state.reset();
        self.arena = VertexArena::new();
        self.graph = LayersGraph::new();
        self.state.save(&self.root)?;
        Ok(())
    }

    /// Serializable snapshot of the reference graph, layer by layer.
    pub fn dump_graph(&self) -> GraphDump {
        let mut layers = Vec::with_capacity(self.graph.layer_count());
        for index in 0..self.graph.layer_count() {
            let mut files: Vec<FileDump> = self
                .graph
                .layer(index)
                .unwrap_or_default()
                .iter()
                .map(|&id| {
                    let v = self.arena.vertex(id);
                    FileDump {
                        path: v.path.clone(),
                        kind: format!("{:?}", v.kind).to_lowercase(),
                        requires: v
                            .requires()
                            .iter()
                            .map(|&d| self.arena.vertex(d).path.clone())
                            .collect(),
                        exe_name: v.exe_name.clone(),
                    }
                })
                .collect();
            files.sort_by(|a, b| a.path.cmp(&b.path));
            layers.push(files);
        }
        GraphDump { layers }
    }

    /// Walk the project tree for tracked files, skipping dot-directories.
    fn discover(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root).into_iter().filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.'))
                    .unwrap_or(false)
        });
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            // Files the build generated (auto interfaces, links) are not
            // sources; they re-enter the graph through their producers.
            if is_tracked_source(rel) && !self.state.is_generated(rel) {
                files.push(rel.to_path_buf());
            }
        }
        files.sort();
        debug!("discovered {} tracked file(s)", files.len());
        Ok(files)
    }

    /// Split a change list into surviving roots, suppressing the vertices
    /// of files that no longer exist on disk.
    fn partition_deleted(&mut self, files: &[PathBuf]) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        for file in files {
            let (lookup, exists) = if file.is_absolute() {
                (resolver::external_link_path(file), file.exists())
            } else {
                (file.clone(), self.root.join(file).exists())
            };
            if exists {
                roots.push(file.clone());
                continue;
            }
            info!("{:?} was deleted, dropping it from the graph", file);
            if let Some(id) = self.arena.find(&lookup) {
                let outcome = self.graph.suppress(&mut self.arena, id);
                self.delete_orphans(&outcome);
            }
            self.state.clear_generated(&lookup);
        }
        roots
    }

    /// Delete files a suppression orphaned, but never a file the build did
    /// not generate itself.
    fn delete_orphans(&mut self, outcome: &SuppressOutcome) {
        for file in outcome
            .external_links
            .iter()
            .chain(outcome.auto_interfaces.iter())
        {
            if !self.state.is_generated(file) {
                continue;
            }
            debug!("deleting orphaned generated file {:?}", file);
            artifact::remove_with_retry(&self.root.join(file));
            self.state.clear_generated(file);
        }
    }
}

/// Serializable view of the layered graph.
#[derive(Debug, Serialize)]
pub struct GraphDump {
    pub layers: Vec<Vec<FileDump>>,
}

#[derive(Debug, Serialize)]
pub struct FileDump {
    pub path: PathBuf,
    pub kind: String,
    pub requires: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe_name: Option<String>,
}
