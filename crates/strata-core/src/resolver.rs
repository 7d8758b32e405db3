//! Dependency resolution: from tool output to graph edges.
//!
//! The resolver runs the dependency tool over the files being (re)built,
//! then walks the declared dependencies depth-first, creating vertices on
//! first sight and reconciling each in-scope vertex's edge set against the
//! fresh tool output. Vertices outside the scope (unchanged members of the
//! reference graph) are descended through exactly once so cycles that pass
//! through them are still detected, but their edges are left alone.
//!
//! A dependency found on the active visiting stack closes a cycle: the
//! offending edge is dropped, the chain is reported, and its members are
//! left out of the result set while everything else proceeds. One bad
//! import never poisons the rest of the build.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::depfile::{self, DepRule};
use crate::graph::{FileKind, Vertex, VertexArena, VertexId};
use crate::project::{exts, ProjectState, EXTERNAL_DIR, STRATA_DIR};
use crate::toolchain::{ToolError, Toolchain};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Everything a resolution pass learned, for the orchestrator to apply.
#[derive(Debug, Default)]
pub struct ResolveOutcome {
    /// Every fresh or in-scope vertex visited, dependencies before
    /// dependents. The caller inserts these into the target graph.
    /// Unchanged vertices descended only for cycle re-checking are not
    /// listed, and neither are members of a reported cycle.
    pub resolved: Vec<VertexId>,

    /// Dependency cycles found, each as the chain of file paths that closes
    /// it. The closing edge was not added to the graph and the chain's
    /// members were dropped from `resolved`.
    pub cycles: Vec<Vec<PathBuf>>,

    /// External vertices whose last dependent edge was removed during
    /// reconciliation. The caller suppresses them after the pass.
    pub orphaned_externals: Vec<VertexId>,

    /// In-scope sources currently flagged to produce an executable.
    pub executables: Vec<VertexId>,

    /// In-scope sources whose executable flag was just cleared.
    pub demoted_executables: Vec<VertexId>,
}

/// Resolve dependencies for a set of root files (project-relative paths,
/// or absolute paths for external references).
pub fn resolve(
    arena: &mut VertexArena,
    toolchain: &Toolchain,
    state: &ProjectState,
    roots: &[PathBuf],
) -> Result<ResolveOutcome> {
    let mut resolver = Resolver {
        arena,
        toolchain,
        state,
        scope: roots.iter().cloned().collect(),
        rules: Vec::new(),
        fetched: HashSet::new(),
        visiting: Vec::new(),
        visited: HashSet::new(),
        cycle_members: HashSet::new(),
        outcome: ResolveOutcome::default(),
    };
    resolver.prefetch(roots)?;
    for root in roots {
        resolver.visit(root)?;
    }
    Ok(resolver.outcome)
}

struct Resolver<'a> {
    arena: &'a mut VertexArena,
    toolchain: &'a Toolchain,
    state: &'a ProjectState,
    scope: HashSet<PathBuf>,
    rules: Vec<DepRule>,
    /// Files already covered by a dependency tool run (even if the tool
    /// printed no rule for them).
    fetched: HashSet<PathBuf>,
    /// DFS stack of paths, for cycle detection and reporting.
    visiting: Vec<PathBuf>,
    visited: HashSet<VertexId>,
    /// Paths belonging to a reported cycle; barred from the result set.
    cycle_members: HashSet<PathBuf>,
    outcome: ResolveOutcome,
}

impl Resolver<'_> {
    /// One dependency tool run over all compilable roots up front; files
    /// discovered later are fetched lazily.
    fn prefetch(&mut self, roots: &[PathBuf]) -> Result<()> {
        let batch: Vec<PathBuf> = roots
            .iter()
            .filter(|p| !p.is_absolute() && is_compilable(p))
            .cloned()
            .collect();
        if !batch.is_empty() {
            self.fetch(&batch)?;
        }
        Ok(())
    }

    fn fetch(&mut self, files: &[PathBuf]) -> Result<()> {
        let output = self.toolchain.dependencies(files)?;
        if !output.success {
            // Dependency listing fails on syntax errors; the compile step
            // will surface those against the file itself.
            warn!("dependency tool failed: {}", output.stderr.trim());
        }
        self.rules.extend(depfile::parse(&output.stdout));
        self.fetched.extend(files.iter().cloned());
        Ok(())
    }

    /// Declared dependencies of a file, fetching its rule on demand.
    fn dependencies_of(&mut self, path: &Path) -> Result<Vec<PathBuf>> {
        if !self.fetched.contains(path) {
            self.fetch(&[path.to_path_buf()])?;
        }
        Ok(depfile::rule_for(&self.rules, path)
            .map(|r| r.dependencies.clone())
            .unwrap_or_default())
    }

    fn visit(&mut self, path: &Path) -> Result<Option<VertexId>> {
        let path = if path.is_absolute() {
            external_link_path(path)
        } else {
            path.to_path_buf()
        };

        if let Some(pos) = self.visiting.iter().position(|p| *p == path) {
            let mut chain = self.visiting[pos..].to_vec();
            chain.push(path.clone());
            warn!(
                "dependency cycle: {}",
                chain
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
            self.cycle_members.extend(chain.iter().cloned());
            self.outcome.cycles.push(chain);
            return Ok(None);
        }
        if let Some(id) = self.arena.find(&path) {
            if self.visited.contains(&id) {
                return Ok(Some(id));
            }
        }

        let (id, fresh) = match self.arena.find(&path) {
            Some(id) => (id, false),
            None => match self.create_vertex(&path)? {
                Some(id) => (id, true),
                None => return Ok(None),
            },
        };
        let kind = self.arena.vertex(id).kind;
        let in_scope = fresh || self.scope.contains(&path);

        self.visiting.push(path.clone());
        let compilable = matches!(kind, FileKind::Source | FileKind::Interface);
        let result = if in_scope && compilable {
            self.reconcile(id, &path)
        } else {
            self.recheck(id)
        };
        self.visiting.pop();
        result?;

        self.visited.insert(id);
        // Only fresh or in-scope vertices enter the result set, and a
        // member of a reported cycle never does.
        if (fresh || in_scope) && !self.cycle_members.contains(&path) {
            self.outcome.resolved.push(id);
            if in_scope && kind == FileKind::Source {
                self.apply_exe_flag(id, &path);
            }
        }
        Ok(Some(id))
    }

    /// Replace an in-scope vertex's edge set with the tool's fresh answer.
    fn reconcile(&mut self, id: VertexId, path: &Path) -> Result<()> {
        let declared = self.dependencies_of(path)?;
        let previous: Vec<VertexId> = self.arena.vertex(id).requires().to_vec();

        let mut kept: HashSet<VertexId> = HashSet::new();
        for dep in declared {
            if dep == *path {
                continue;
            }
            let Some(dep) = self.redirect_auto_interface(path, dep) else {
                continue;
            };
            if let Some(child) = self.visit(&dep)? {
                self.arena.add_edge(id, child);
                kept.insert(child);
            }
        }

        for old in previous {
            if kept.contains(&old) {
                continue;
            }
            debug!(
                "dropping stale dependency {:?} -> {:?}",
                path,
                self.arena.vertex(old).path
            );
            self.arena.remove_forward(id, old);
            if !self.arena.remove_reverse(old, id) {
                warn!(
                    "reciprocity violation: {:?} did not list {:?} as a dependent",
                    self.arena.vertex(old).path,
                    path
                );
            }
            let v = self.arena.vertex(old);
            if v.is_external() && v.required_by().is_empty() {
                self.outcome.orphaned_externals.push(old);
            }
        }
        Ok(())
    }

    /// A dependency on an auto-generated interface really points at the
    /// sibling source that produces it; a dependency on the vertex's own
    /// generated interface is dropped outright.
    fn redirect_auto_interface(&self, path: &Path, dep: PathBuf) -> Option<PathBuf> {
        if FileKind::from_path(&dep) != Some(FileKind::Interface)
            || !self.state.is_generated(&dep)
        {
            return Some(dep);
        }
        if dep == path.with_extension(exts::INTERFACE) {
            return None;
        }
        debug!("redirecting generated interface dependency {:?} to its source", dep);
        Some(dep.with_extension(exts::SOURCE))
    }

    /// Descend through an unchanged vertex without touching its edges, so
    /// a newly created edge upstream still gets its cycle detected.
    fn recheck(&mut self, id: VertexId) -> Result<()> {
        let deps: Vec<PathBuf> = self
            .arena
            .vertex(id)
            .requires()
            .iter()
            .map(|&d| self.arena.vertex(d).path.clone())
            .collect();
        for dep in deps {
            self.visit(&dep)?;
        }
        Ok(())
    }

    fn create_vertex(&mut self, path: &Path) -> Result<Option<VertexId>> {
        if is_external_link(path) {
            let vertex = self.new_external(path)?;
            return Ok(Some(self.arena.insert(vertex)));
        }
        let Some(kind) = FileKind::from_path(path) else {
            warn!("ignoring dependency with unknown extension: {:?}", path);
            return Ok(None);
        };
        debug!("tracking {:?} as {:?}", path, kind);
        Ok(Some(self.arena.insert(Vertex::new(path.to_path_buf(), kind))))
    }

    /// Materialize the link file for an external reference and build its
    /// vertex. The link records the absolute target; the vertex's linker
    /// contribution is the user-declared object list.
    fn new_external(&mut self, link: &Path) -> Result<Vertex> {
        let full = self.toolchain.root().join(link);
        if let Some(dir) = full.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut vertex = Vertex::new(link.to_path_buf(), FileKind::External);
        vertex.external_objects = self.state.settings(link).external_objects.clone();
        Ok(vertex)
    }

    fn apply_exe_flag(&mut self, id: VertexId, path: &Path) {
        let wanted = self.state.settings(path).exe_name;
        let current = self.arena.vertex(id).exe_name.clone();
        if wanted != current {
            self.arena.vertex_mut(id).exe_name = wanted.clone();
        }
        match (current, wanted) {
            (_, Some(_)) => self.outcome.executables.push(id),
            (Some(_), None) => self.outcome.demoted_executables.push(id),
            (None, None) => {}
        }
    }
}

fn is_compilable(path: &Path) -> bool {
    matches!(
        FileKind::from_path(path),
        Some(FileKind::Source) | Some(FileKind::Interface)
    )
}

/// Project-relative path of the materialized link for an external file.
pub fn external_link_path(target: &Path) -> PathBuf {
    let name = target.file_name().unwrap_or_default();
    Path::new(STRATA_DIR).join(EXTERNAL_DIR).join(name)
}

fn is_external_link(path: &Path) -> bool {
    path.starts_with(Path::new(STRATA_DIR).join(EXTERNAL_DIR))
}

/// Write the link file for an external reference, recording its target.
/// Separate from resolution so the caller can mark it build-generated.
pub fn write_external_link(root: &Path, link: &Path, target: &Path) -> std::io::Result<()> {
    let full = root.join(link);
    if let Some(dir) = full.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(full, format!("{}\n", target.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LayersGraph;
    use crate::project::ProjectConfig;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stub dependency tool: for each file argument, emits the make rule
    /// `<stem>.cmo : <contents of file.deps>` (or `.cmi` for interfaces).
    fn install_dep_tool(root: &Path) {
        let tools = root.join("tools");
        fs::create_dir_all(&tools).unwrap();
        let script = tools.join("deps");
        fs::write(
            &script,
            "#!/bin/sh\n\
             for f in \"$@\"; do\n\
               base=\"${f%.*}\"\n\
               ext=\"${f##*.}\"\n\
               if [ \"$ext\" = ml ]; then obj=\"$base.cmo\"; else obj=\"$base.cmi\"; fi\n\
               deps=\"\"\n\
               if [ -f \"$f.deps\" ]; then deps=$(cat \"$f.deps\"); fi\n\
               echo \"$obj : $deps\"\n\
             done\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn toolchain(root: &Path) -> Toolchain {
        let config = ProjectConfig {
            dep_tool: PathBuf::from("tools/deps"),
            ..ProjectConfig::default()
        };
        Toolchain::new(root, &config)
    }

    fn source(root: &Path, name: &str, deps: &str) {
        fs::write(root.join(name), "let x = 1\n").unwrap();
        if !deps.is_empty() {
            fs::write(root.join(format!("{name}.deps")), deps).unwrap();
        }
    }

    #[test]
    fn test_resolves_chain_with_deps_first() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "a.ml", "");
        source(root, "b.ml", "a.cmo");
        source(root, "c.ml", "b.cmo");

        let mut arena = VertexArena::new();
        let state = ProjectState::default();
        let outcome = resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[PathBuf::from("c.ml")],
        )
        .unwrap();

        assert!(outcome.cycles.is_empty());
        let paths: Vec<PathBuf> = outcome
            .resolved
            .iter()
            .map(|&id| arena.vertex(id).path.clone())
            .collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("a.ml"),
                PathBuf::from("b.ml"),
                PathBuf::from("c.ml")
            ]
        );

        let c = arena.find(Path::new("c.ml")).unwrap();
        let b = arena.find(Path::new("b.ml")).unwrap();
        assert_eq!(arena.vertex(c).requires(), &[b]);
    }

    #[test]
    fn test_layers_after_resolution() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "a.ml", "");
        source(root, "b.ml", "a.cmo");

        let mut arena = VertexArena::new();
        let state = ProjectState::default();
        let outcome = resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[PathBuf::from("a.ml"), PathBuf::from("b.ml")],
        )
        .unwrap();

        let mut graph = LayersGraph::new();
        graph.add_all(&mut arena, &outcome.resolved);
        let a = arena.find(Path::new("a.ml")).unwrap();
        let b = arena.find(Path::new("b.ml")).unwrap();
        assert_eq!(arena.vertex(a).layer(), 0);
        assert_eq!(arena.vertex(b).layer(), 1);
    }

    #[test]
    fn test_cycle_edge_is_dropped_and_reported() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "a.ml", "b.cmo");
        source(root, "b.ml", "a.cmo");

        let mut arena = VertexArena::new();
        let state = ProjectState::default();
        let outcome = resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[PathBuf::from("a.ml"), PathBuf::from("b.ml")],
        )
        .unwrap();

        assert_eq!(outcome.cycles.len(), 1);
        let a = arena.find(Path::new("a.ml")).unwrap();
        let b = arena.find(Path::new("b.ml")).unwrap();
        // One direction survives, the closing edge was dropped.
        let total = arena.vertex(a).requires().len() + arena.vertex(b).requires().len();
        assert_eq!(total, 1);
        // Neither member of the cycle makes it into the result set.
        assert!(outcome.resolved.is_empty());
    }

    #[test]
    fn test_independent_file_unaffected_by_cycle() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "a.ml", "b.cmo");
        source(root, "b.ml", "a.cmo");
        source(root, "d.ml", "");

        let mut arena = VertexArena::new();
        let state = ProjectState::default();
        let outcome = resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[
                PathBuf::from("a.ml"),
                PathBuf::from("b.ml"),
                PathBuf::from("d.ml"),
            ],
        )
        .unwrap();

        assert_eq!(outcome.cycles.len(), 1);
        let d = arena.find(Path::new("d.ml")).unwrap();
        assert!(arena.vertex(d).requires().is_empty());
        assert!(outcome.resolved.contains(&d));
        // d resolves fully while both cycle members stay excluded.
        let a = arena.find(Path::new("a.ml")).unwrap();
        let b = arena.find(Path::new("b.ml")).unwrap();
        assert!(!outcome.resolved.contains(&a));
        assert!(!outcome.resolved.contains(&b));
    }

    #[test]
    fn test_stale_edge_removed_on_rebuild() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "a.ml", "");
        source(root, "b.ml", "a.cmo");

        let mut arena = VertexArena::new();
        let state = ProjectState::default();
        resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[PathBuf::from("a.ml"), PathBuf::from("b.ml")],
        )
        .unwrap();

        // b no longer depends on a.
        fs::remove_file(root.join("b.ml.deps")).unwrap();
        resolve(&mut arena, &toolchain(root), &state, &[PathBuf::from("b.ml")]).unwrap();

        let a = arena.find(Path::new("a.ml")).unwrap();
        let b = arena.find(Path::new("b.ml")).unwrap();
        assert!(arena.vertex(b).requires().is_empty());
        assert!(arena.vertex(a).required_by().is_empty());
    }

    #[test]
    fn test_out_of_scope_vertex_keeps_its_edges() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "a.ml", "");
        source(root, "b.ml", "a.cmo");
        source(root, "c.ml", "b.cmo");

        let mut arena = VertexArena::new();
        let state = ProjectState::default();
        resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[
                PathBuf::from("a.ml"),
                PathBuf::from("b.ml"),
                PathBuf::from("c.ml"),
            ],
        )
        .unwrap();

        // b's declared deps change on disk, but only c is in scope: b must
        // not be re-resolved.
        fs::remove_file(root.join("b.ml.deps")).unwrap();
        resolve(&mut arena, &toolchain(root), &state, &[PathBuf::from("c.ml")]).unwrap();

        let a = arena.find(Path::new("a.ml")).unwrap();
        let b = arena.find(Path::new("b.ml")).unwrap();
        assert_eq!(arena.vertex(b).requires(), &[a]);
    }

    #[test]
    fn test_rechecked_vertices_stay_out_of_the_result() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "a.ml", "");
        source(root, "b.ml", "a.cmo");
        source(root, "c.ml", "b.cmo");

        let mut arena = VertexArena::new();
        let state = ProjectState::default();
        resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[
                PathBuf::from("a.ml"),
                PathBuf::from("b.ml"),
                PathBuf::from("c.ml"),
            ],
        )
        .unwrap();

        // Only c changed: its unchanged dependencies are descended for
        // cycle checking but must not re-enter the result set.
        let outcome =
            resolve(&mut arena, &toolchain(root), &state, &[PathBuf::from("c.ml")]).unwrap();
        let paths: Vec<PathBuf> = outcome
            .resolved
            .iter()
            .map(|&id| arena.vertex(id).path.clone())
            .collect();
        assert_eq!(paths, vec![PathBuf::from("c.ml")]);
    }

    #[test]
    fn test_executable_flag_applied_from_settings() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "main.ml", "");

        let mut arena = VertexArena::new();
        let mut state = ProjectState::default();
        state.set_settings(
            PathBuf::from("main.ml"),
            crate::project::FileSettings {
                exe_name: Some("prog".to_string()),
                ..Default::default()
            },
        );
        let outcome = resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[PathBuf::from("main.ml")],
        )
        .unwrap();

        let main = arena.find(Path::new("main.ml")).unwrap();
        assert_eq!(outcome.executables, vec![main]);
        assert_eq!(arena.vertex(main).exe_name.as_deref(), Some("prog"));
    }

    #[test]
    fn test_generated_interface_dependency_redirects_to_source() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);
        source(root, "a.ml", "a.cmi");
        source(root, "c.ml", "a.cmi");

        let mut arena = VertexArena::new();
        let mut state = ProjectState::default();
        state.mark_generated(PathBuf::from("a.mli"));
        resolve(
            &mut arena,
            &toolchain(root),
            &state,
            &[PathBuf::from("a.ml"), PathBuf::from("c.ml")],
        )
        .unwrap();

        let a = arena.find(Path::new("a.ml")).unwrap();
        let c = arena.find(Path::new("c.ml")).unwrap();
        // c's dependency on the generated a.mli points at a.ml instead;
        // a's dependency on its own generated interface is dropped.
        assert_eq!(arena.vertex(c).requires(), &[a]);
        assert!(arena.vertex(a).requires().is_empty());
        assert!(arena.find(Path::new("a.mli")).is_none());
    }

    #[test]
    fn test_external_root_materializes_under_strata() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        install_dep_tool(root);

        let target = PathBuf::from("/opt/lib/extra.ml");
        let mut arena = VertexArena::new();
        let state = ProjectState::default();
        let outcome = resolve(&mut arena, &toolchain(root), &state, &[target.clone()]).unwrap();

        let link = external_link_path(&target);
        assert_eq!(link, PathBuf::from(".strata/external/extra.ml"));
        let id = arena.find(&link).unwrap();
        assert!(arena.vertex(id).is_external());
        assert_eq!(outcome.resolved, vec![id]);
    }
}
