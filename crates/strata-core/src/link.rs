//! The link driver: refreshing executables after a compile pass.
//!
//! For every registered executable the full link set is recomputed by a
//! post-order walk of its dependencies, leaves first, which is exactly the
//! object order the linker wants. Interfaces contribute nothing themselves;
//! one is stood in for by its paired source's subtree, since the binary
//! needs the implementation. Externals are opaque: they splice in their
//! user-declared object list unchanged.
//!
//! An executable is re-linked only when its object list changed, when a
//! compile marked it dirty, or when the binary is missing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::graph::{FileKind, LayersGraph, VertexArena, VertexId};
use crate::project::{ProjectConfig, ProjectState};
use crate::toolchain::{ToolError, Toolchain};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Default)]
pub struct LinkOutcome {
    /// Binaries written by this pass.
    pub linked: Vec<PathBuf>,
    /// Executables whose link failed, with the raw linker output.
    pub failures: Vec<(PathBuf, String)>,
    pub cancelled: bool,
}

/// Re-link every registered executable that needs it.
pub fn run(
    arena: &mut VertexArena,
    graph: &mut LayersGraph,
    toolchain: &Toolchain,
    config: &ProjectConfig,
    state: &mut ProjectState,
    cancel: &CancelToken,
) -> Result<LinkOutcome> {
    let mut outcome = LinkOutcome::default();
    for exe in graph.executables().to_vec() {
        if cancel.is_cancelled() {
            info!("link pass cancelled");
            outcome.cancelled = true;
            return Ok(outcome);
        }
        link_one(arena, graph, toolchain, config, state, exe, &mut outcome)?;
    }
    Ok(outcome)
}

fn link_one(
    arena: &mut VertexArena,
    graph: &mut LayersGraph,
    toolchain: &Toolchain,
    config: &ProjectConfig,
    state: &mut ProjectState,
    exe: VertexId,
    outcome: &mut LinkOutcome,
) -> Result<()> {
    let Some(exe_name) = arena.vertex(exe).exe_name.clone() else {
        warn!(
            "{:?} is registered as an executable but has no binary name",
            arena.vertex(exe).path
        );
        return Ok(());
    };
    let source = arena.vertex(exe).path.clone();
    let binary_rel = source.parent().unwrap_or(Path::new("")).join(&exe_name);

    let members = collect_link_set(arena, exe);
    let objects = object_list(arena, config, exe, &members);

    let dirty = graph.is_link_dirty(exe);
    let list_changed = objects != arena.vertex(exe).linked_objects;
    let binary_missing = !toolchain.root().join(&binary_rel).exists();
    if !dirty && !list_changed && !binary_missing {
        debug!("{:?} is up to date", binary_rel);
        return Ok(());
    }

    // Refresh the reverse bookkeeping so object changes keep dirtying the
    // right executables.
    arena.clear_link_set(exe);
    for &m in &members {
        arena.add_link_member(exe, m);
    }

    let mut flags = config.flags.clone();
    flags.extend(state.settings(&source).flags);

    info!("linking {:?} from {} object(s)", binary_rel, objects.len());
    let output = toolchain.link(&binary_rel, &objects, &flags)?;
    if !output.success {
        warn!("link failed for {:?}", binary_rel);
        outcome.failures.push((binary_rel, output.stderr));
        return Ok(());
    }

    arena.vertex_mut(exe).linked_objects = objects;
    graph.clear_link_dirty(exe);
    state.mark_generated(binary_rel.clone());
    state.set_exe_mode(binary_rel.clone(), config.build_mode);
    outcome.linked.push(binary_rel);
    Ok(())
}

/// Post-order walk of the executable's dependencies, leaves first. The
/// executable itself is excluded; its own object always goes last.
fn collect_link_set(arena: &VertexArena, exe: VertexId) -> Vec<VertexId> {
    let mut ordered = Vec::new();
    let mut seen = HashSet::new();
    let mut visiting = vec![exe];
    for dep in arena.vertex(exe).requires().to_vec() {
        visit(arena, dep, &mut ordered, &mut seen, &mut visiting);
    }
    ordered
}

fn visit(
    arena: &VertexArena,
    id: VertexId,
    ordered: &mut Vec<VertexId>,
    seen: &mut HashSet<VertexId>,
    visiting: &mut Vec<VertexId>,
) {
    if seen.contains(&id) || visiting.contains(&id) {
        return;
    }
    match arena.vertex(id).kind {
        FileKind::Interface => {
            // The binary needs the implementation standing behind this
            // interface. A paired source already on the walk (notably the
            // executable's own source) is skipped.
            if let Some(source) = arena.paired_source(id) {
                visit(arena, source, ordered, seen, visiting);
            }
        }
        FileKind::Source => {
            visiting.push(id);
            for dep in arena.vertex(id).requires().to_vec() {
                visit(arena, dep, ordered, seen, visiting);
            }
            visiting.pop();
            seen.insert(id);
            ordered.push(id);
        }
        FileKind::External => {
            seen.insert(id);
            ordered.push(id);
        }
        FileKind::Lexer | FileKind::Parser => {}
    }
}

/// Flatten the link set into the linker's object list, the executable's own
/// object last.
fn object_list(
    arena: &VertexArena,
    config: &ProjectConfig,
    exe: VertexId,
    members: &[VertexId],
) -> Vec<PathBuf> {
    let object_ext = config.build_mode.object_ext();
    let mut objects = Vec::new();
    for &m in members {
        let v = arena.vertex(m);
        if v.is_external() {
            objects.extend(v.external_objects.iter().cloned());
        } else {
            let object = v
                .object_artifact
                .clone()
                .unwrap_or_else(|| v.path.with_extension(object_ext));
            objects.push(object);
        }
    }
    let own = arena.vertex(exe);
    objects.push(
        own.object_artifact
            .clone()
            .unwrap_or_else(|| own.path.with_extension(object_ext)),
    );
    objects
}
