//! The compile driver: one pass over a layered graph.
//!
//! Layers are swept in order, so a file is always compiled after everything
//! it depends on. Before each compile the previous artifacts are set aside;
//! afterwards the fresh artifacts are compared byte for byte against them.
//! Only a real object change dirties the executables that link it, and only
//! a real compiled-interface change enqueues the file's dependents, which
//! sit in strictly later layers and are picked up by the same sweep.
//!
//! A failed compile restores the set-aside artifacts, records the parsed
//! diagnostics and moves on; one broken file never stops the pass.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact;
use crate::cancel::CancelToken;
use crate::diagnostics::MarkerSet;
use crate::graph::{FileKind, LayersGraph, VertexArena, VertexId};
use crate::project::{exts, ProjectConfig, ProjectState};
use crate::toolchain::{ToolError, Toolchain};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// What a compile pass produced.
#[derive(Debug, Default)]
pub struct CompileOutcome {
    pub markers: MarkerSet,
    pub cancelled: bool,
    /// Vertices whose compile failed; their last good artifacts were kept.
    pub failed: Vec<VertexId>,
}

/// Compile every member of `graph`, bottom layer first.
///
/// `reference` is the graph holding the unchanged remainder of the project
/// during an incremental build: when an interface change ripples to a
/// dependent still parked there, the dependent is moved into `graph` and
/// compiled in this same pass.
pub fn run(
    arena: &mut VertexArena,
    graph: &mut LayersGraph,
    reference: Option<&mut LayersGraph>,
    toolchain: &Toolchain,
    config: &ProjectConfig,
    state: &mut ProjectState,
    cancel: &CancelToken,
) -> Result<CompileOutcome> {
    let pending: HashSet<VertexId> = graph.members().collect();
    let mut pass = CompilePass {
        arena,
        graph,
        reference,
        toolchain,
        config,
        state,
        cancel,
        pending,
        outcome: CompileOutcome::default(),
    };
    pass.sweep()?;
    Ok(pass.outcome)
}

struct CompilePass<'a> {
    arena: &'a mut VertexArena,
    graph: &'a mut LayersGraph,
    reference: Option<&'a mut LayersGraph>,
    toolchain: &'a Toolchain,
    config: &'a ProjectConfig,
    state: &'a mut ProjectState,
    cancel: &'a CancelToken,
    pending: HashSet<VertexId>,
    outcome: CompileOutcome,
}

impl CompilePass<'_> {
    fn sweep(&mut self) -> Result<()> {
        let mut layer = 0;
        // Enqueued dependents land in strictly later layers, so a single
        // sweep with a live layer bound drains the pending set.
        while layer < self.graph.layer_count() {
            if self.cancel.is_cancelled() {
                info!("compile pass cancelled before layer {layer}");
                self.outcome.cancelled = true;
                return Ok(());
            }
            let ids: Vec<VertexId> = self
                .graph
                .layer(layer)
                .map(|l| l.to_vec())
                .unwrap_or_default();
            for id in ids {
                if self.cancel.is_cancelled() {
                    self.outcome.cancelled = true;
                    return Ok(());
                }
                if !self.pending.remove(&id) {
                    continue;
                }
                self.compile_vertex(id)?;
            }
            layer += 1;
        }
        if !self.pending.is_empty() {
            warn!("{} file(s) left pending after sweep", self.pending.len());
        }
        Ok(())
    }

    fn compile_vertex(&mut self, id: VertexId) -> Result<()> {
        match self.arena.vertex(id).kind {
            FileKind::Source => self.compile_source(id),
            FileKind::Interface => self.compile_interface(id),
            FileKind::Lexer | FileKind::Parser => {
                // Generator files only matter through the sources generated
                // from them, which are tracked in their own right.
                debug!("skipping generator file {:?}", self.arena.vertex(id).path);
                Ok(())
            }
            FileKind::External => Ok(()),
        }
    }

    fn compile_source(&mut self, id: VertexId) -> Result<()> {
        let path = self.arena.vertex(id).path.clone();
        // With a hand-written interface, the compiled interface belongs to
        // the interface vertex; otherwise this vertex owns it.
        let owns_interface = self.arena.paired_interface(id).is_none();

        let object_rel = path.with_extension(self.config.build_mode.object_ext());
        let interface_rel = path.with_extension(exts::INTERFACE_OBJECT);
        let object_abs = self.abs(&object_rel);
        let interface_abs = self.abs(&interface_rel);

        // A stale auto-generated textual interface would shadow the fresh
        // signature; drop it and regenerate after the compile.
        if owns_interface {
            let mli_rel = path.with_extension(exts::INTERFACE);
            let mli_abs = self.abs(&mli_rel);
            if mli_abs.exists() && self.state.is_generated(&mli_rel) {
                artifact::remove_with_retry(&mli_abs);
            }
        }

        let object_backup = self.snapshot_artifact(&object_rel)?;
        let interface_backup = if owns_interface {
            self.snapshot_artifact(&interface_rel)?
        } else {
            None
        };

        let mut flags = self.config.flags.clone();
        flags.extend(self.state.settings(&path).flags);

        debug!("compiling {:?}", path);
        let output = self.toolchain.compile(&path, &flags)?;
        let markers = MarkerSet::parse(&output.stderr);
        let failed = !output.success || markers.has_errors();
        self.outcome.markers.extend(markers);

        if failed {
            info!("compile failed for {:?}", path);
            restore(object_backup.as_deref(), &object_abs);
            restore(interface_backup.as_deref(), &interface_abs);
            self.state.clear_generated(&artifact::backup_path(&object_rel));
            self.state.clear_generated(&artifact::backup_path(&interface_rel));
            self.outcome.failed.push(id);
            return Ok(());
        }

        let object_changed =
            !artifact::same_contents(object_backup.as_deref(), Some(&object_abs))?;
        self.arena.vertex_mut(id).object_artifact = Some(object_rel.clone());
        self.state.mark_generated(object_rel.clone());
        if object_changed {
            debug!("object artifact changed for {:?}", path);
            for exe in self.arena.vertex(id).affected_exes().to_vec() {
                self.graph.mark_link_dirty(exe);
            }
            if self.arena.vertex(id).exe_name.is_some() {
                self.graph.mark_link_dirty(id);
            }
        }

        if owns_interface {
            self.arena.vertex_mut(id).interface_artifact = Some(interface_rel.clone());
            self.state.mark_generated(interface_rel.clone());
            self.refresh_textual_interface(&path)?;
            let interface_changed =
                !artifact::same_contents(interface_backup.as_deref(), Some(&interface_abs))?;
            if interface_changed {
                debug!("compiled interface changed for {:?}", path);
                self.enqueue_dependents(id);
            }
        } else {
            self.arena.vertex_mut(id).interface_artifact = None;
        }

        self.discard_backup(object_backup.as_deref(), &object_rel);
        self.discard_backup(interface_backup.as_deref(), &interface_rel);
        Ok(())
    }

    fn compile_interface(&mut self, id: VertexId) -> Result<()> {
        let path = self.arena.vertex(id).path.clone();
        let interface_rel = path.with_extension(exts::INTERFACE_OBJECT);
        let interface_abs = self.abs(&interface_rel);
        let backup = self.snapshot_artifact(&interface_rel)?;

        let mut flags = self.config.flags.clone();
        flags.extend(self.state.settings(&path).flags);

        debug!("compiling interface {:?}", path);
        let output = self.toolchain.compile(&path, &flags)?;
        let markers = MarkerSet::parse(&output.stderr);
        let failed = !output.success || markers.has_errors();
        self.outcome.markers.extend(markers);

        if failed {
            info!("compile failed for {:?}", path);
            restore(backup.as_deref(), &interface_abs);
            self.state.clear_generated(&artifact::backup_path(&interface_rel));
            self.outcome.failed.push(id);
            return Ok(());
        }

        self.arena.vertex_mut(id).interface_artifact = Some(interface_rel.clone());
        self.state.mark_generated(interface_rel.clone());
        let changed = !artifact::same_contents(backup.as_deref(), Some(&interface_abs))?;
        if changed {
            debug!("compiled interface changed for {:?}", path);
            self.enqueue_dependents(id);
        }
        self.discard_backup(backup.as_deref(), &interface_rel);
        Ok(())
    }

    /// Keep the on-disk textual interface of a source without a hand-written
    /// one in sync with the inferred signature. Never overwrites a file the
    /// build did not generate itself.
    fn refresh_textual_interface(&mut self, source: &Path) -> Result<()> {
        let mli_rel = source.with_extension(exts::INTERFACE);
        let mli_abs = self.abs(&mli_rel);
        if mli_abs.exists() && !self.state.is_generated(&mli_rel) {
            return Ok(());
        }
        let output = self.toolchain.infer_interface(source)?;
        if !output.success {
            debug!("interface inference failed for {:?}", source);
            return Ok(());
        }
        fs::write(&mli_abs, output.stdout)?;
        self.state.mark_generated(mli_rel);
        Ok(())
    }

    /// Pull a changed interface's dependents into this pass. Dependents
    /// parked in the reference graph are moved over first.
    fn enqueue_dependents(&mut self, id: VertexId) {
        let dependents: Vec<VertexId> = self.arena.vertex(id).required_by().to_vec();
        if dependents.is_empty() {
            return;
        }
        for &d in &dependents {
            if !self.graph.contains(d) {
                if let Some(reference) = self.reference.as_deref_mut() {
                    if reference.contains(d) {
                        reference.remove_vertex(self.arena, d);
                    }
                }
            }
        }
        self.graph.add_all(self.arena, &dependents);
        self.pending.extend(dependents);
    }

    /// Set an artifact aside, refusing to clobber a backup the build does
    /// not own. Without a usable snapshot the fresh artifact counts as
    /// changed, which over-propagates rather than under-propagates.
    fn snapshot_artifact(&mut self, rel: &Path) -> Result<Option<PathBuf>> {
        let backup_rel = artifact::backup_path(rel);
        let backup_abs = self.abs(&backup_rel);
        if backup_abs.exists() && !self.state.is_generated(&backup_rel) {
            warn!(
                "{:?} exists but was not build-generated, not snapshotting",
                backup_rel
            );
            return Ok(None);
        }
        let snapshot = artifact::snapshot(&self.abs(rel))?;
        if snapshot.is_some() {
            self.state.mark_generated(backup_rel);
        }
        Ok(snapshot)
    }

    /// Drop a consumed backup and its generated-registry entry, so stale
    /// `_old` paths never accumulate in the persisted state.
    fn discard_backup(&mut self, backup: Option<&Path>, rel: &Path) {
        if let Some(backup) = backup {
            artifact::remove_with_retry(backup);
        }
        self.state.clear_generated(&artifact::backup_path(rel));
    }

    fn abs(&self, rel: &Path) -> PathBuf {
        self.toolchain.root().join(rel)
    }
}

/// Put a set-aside artifact back after a failed compile, replacing any
/// partial output, so dependents keep compiling against the last good one.
fn restore(backup: Option<&Path>, original: &Path) {
    let Some(backup) = backup else { return };
    if original.exists() {
        if let Err(err) = fs::remove_file(original) {
            warn!("could not drop partial artifact {:?}: {}", original, err);
        }
    }
    if let Err(err) = fs::rename(backup, original) {
        warn!("could not restore {:?} from backup: {}", original, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Vertex;
    use crate::project::BuildMode;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stub compiler. `-c file.ml` copies the file to `.cmo` and derives the
    /// `.cmi` from its `let` names (unless a hand-written `.mli` exists);
    /// `-c file.mli` derives the `.cmi` from the interface text; `-i` prints
    /// the derived signature. A `SYNTAX_ERROR` marker in the file makes the
    /// compile fail with a parseable error.
    fn install_compiler(root: &Path) {
        let tools = root.join("tools");
        fs::create_dir_all(&tools).unwrap();
        let script = tools.join("comp");
        fs::write(
            &script,
            r#"#!/bin/sh
sig() { sed -n 's/^let \([a-z_0-9]*\).*/val \1/p' "$1"; }
if [ "$1" = "-o" ]; then
    exe="$2"; shift 2
    cat "$@" > "$exe"
    exit 0
fi
for a in "$@"; do file="$a"; done
if grep -q SYNTAX_ERROR "$file"; then
    echo "File \"$file\", line 1, characters 0-1:" >&2
    echo "Error: Syntax error" >&2
    exit 2
fi
base="${file%.*}"
ext="${file##*.}"
if [ "$1" = "-i" ]; then
    sig "$file"
    exit 0
fi
if [ "$ext" = "ml" ]; then
    cp "$file" "$base.cmo"
    if [ ! -f "$base.mli" ]; then sig "$file" > "$base.cmi"; fi
else
    cat "$file" > "$base.cmi"
fi
exit 0
"#,
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }

    struct Fixture {
        dir: TempDir,
        arena: VertexArena,
        graph: LayersGraph,
        config: ProjectConfig,
        state: ProjectState,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            install_compiler(dir.path());
            let config = ProjectConfig {
                compiler_bytecode: PathBuf::from("tools/comp"),
                build_mode: BuildMode::Bytecode,
                ..ProjectConfig::default()
            };
            Self {
                dir,
                arena: VertexArena::new(),
                graph: LayersGraph::new(),
                config,
                state: ProjectState::default(),
                cancel: CancelToken::new(),
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn source(&mut self, name: &str, body: &str) -> VertexId {
            fs::write(self.root().join(name), body).unwrap();
            self.arena
                .insert(Vertex::new(PathBuf::from(name), FileKind::Source))
        }

        fn run(&mut self) -> CompileOutcome {
            let toolchain = Toolchain::new(self.root(), &self.config);
            run(
                &mut self.arena,
                &mut self.graph,
                None,
                &toolchain,
                &self.config,
                &mut self.state,
                &self.cancel,
            )
            .unwrap()
        }
    }

    #[test]
    fn test_full_pass_compiles_bottom_up() {
        let mut fx = Fixture::new();
        let a = fx.source("a.ml", "let one = 1\n");
        let b = fx.source("b.ml", "let two = A.one + 1\n");
        fx.arena.add_edge(b, a);
        let ids = [a, b];
        fx.graph.add_all(&mut fx.arena, &ids);

        let outcome = fx.run();
        assert!(!outcome.cancelled);
        assert!(outcome.failed.is_empty());
        assert!(outcome.markers.is_empty());
        assert!(fx.root().join("a.cmo").exists());
        assert!(fx.root().join("b.cmo").exists());
        assert_eq!(
            fx.arena.vertex(a).object_artifact,
            Some(PathBuf::from("a.cmo"))
        );
    }

    #[test]
    fn test_body_edit_does_not_enqueue_dependents() {
        let mut fx = Fixture::new();
        let a = fx.source("a.ml", "let one = 1\n");
        let b = fx.source("b.ml", "let two = A.one + 1\n");
        fx.arena.add_edge(b, a);
        let ids = [a, b];
        fx.graph.add_all(&mut fx.arena, &ids);
        fx.run();

        // Change the body but not the signature, then recompile only a.
        fs::write(fx.root().join("a.ml"), "let one = 2\n").unwrap();
        fs::remove_file(fx.root().join("b.cmo")).unwrap();
        let mut delta = LayersGraph::with_layer_count(fx.graph.layer_count());
        fx.graph.remove_vertex(&fx.arena, a);
        delta.add_all(&mut fx.arena, &[a]);

        let toolchain = Toolchain::new(fx.dir.path(), &fx.config);
        let outcome = run(
            &mut fx.arena,
            &mut delta,
            Some(&mut fx.graph),
            &toolchain,
            &fx.config,
            &mut fx.state,
            &fx.cancel,
        )
        .unwrap();

        assert!(outcome.failed.is_empty());
        // b was not pulled into the pass, so its object was not recreated.
        assert!(!fx.root().join("b.cmo").exists());
        assert!(!delta.contains(b));
    }

    #[test]
    fn test_signature_change_recompiles_dependents() {
        let mut fx = Fixture::new();
        let a = fx.source("a.ml", "let one = 1\n");
        let b = fx.source("b.ml", "let two = A.renamed + 1\n");
        fx.arena.add_edge(b, a);
        let ids = [a, b];
        fx.graph.add_all(&mut fx.arena, &ids);
        fx.run();

        // Rename the binding: the compiled interface changes.
        fs::write(fx.root().join("a.ml"), "let renamed = 1\n").unwrap();
        fs::remove_file(fx.root().join("b.cmo")).unwrap();
        let mut delta = LayersGraph::with_layer_count(fx.graph.layer_count());
        fx.graph.remove_vertex(&fx.arena, a);
        delta.add_all(&mut fx.arena, &[a]);

        let toolchain = Toolchain::new(fx.dir.path(), &fx.config);
        let outcome = run(
            &mut fx.arena,
            &mut delta,
            Some(&mut fx.graph),
            &toolchain,
            &fx.config,
            &mut fx.state,
            &fx.cancel,
        )
        .unwrap();

        assert!(outcome.failed.is_empty());
        // b was moved out of the reference graph and recompiled.
        assert!(delta.contains(b));
        assert!(!fx.graph.contains(b));
        assert!(fx.root().join("b.cmo").exists());
    }

    #[test]
    fn test_failed_compile_keeps_last_good_artifact() {
        let mut fx = Fixture::new();
        let a = fx.source("a.ml", "let one = 1\n");
        fx.graph.add_all(&mut fx.arena, &[a]);
        fx.run();
        let good = fs::read(fx.root().join("a.cmo")).unwrap();

        fs::write(fx.root().join("a.ml"), "SYNTAX_ERROR\n").unwrap();
        let outcome = fx.run();

        assert_eq!(outcome.failed, vec![a]);
        assert!(outcome.markers.has_errors());
        assert_eq!(fs::read(fx.root().join("a.cmo")).unwrap(), good);
        // No backup left behind.
        assert!(!fx.root().join("a.cmo_old").exists());
    }

    #[test]
    fn test_failure_is_contained_to_one_file() {
        let mut fx = Fixture::new();
        let bad = fx.source("bad.ml", "SYNTAX_ERROR\n");
        let good = fx.source("good.ml", "let ok = 1\n");
        let ids = [bad, good];
        fx.graph.add_all(&mut fx.arena, &ids);

        let outcome = fx.run();
        assert_eq!(outcome.failed, vec![bad]);
        assert!(fx.root().join("good.cmo").exists());
    }

    #[test]
    fn test_consumed_backups_leave_no_registry_entries() {
        let mut fx = Fixture::new();
        let a = fx.source("a.ml", "let one = 1\n");
        fx.graph.add_all(&mut fx.arena, &[a]);
        fx.run();

        // The second pass snapshots the existing artifacts and discards
        // the backups afterwards, marks included.
        fx.run();
        assert!(fx.state.is_generated(Path::new("a.cmo")));
        assert!(!fx.state.is_generated(Path::new("a.cmo_old")));
        assert!(!fx.state.is_generated(Path::new("a.cmi_old")));

        // The restore path after a failed compile clears them too.
        fs::write(fx.root().join("a.ml"), "SYNTAX_ERROR\n").unwrap();
        fx.run();
        assert!(!fx.state.is_generated(Path::new("a.cmo_old")));
        assert!(!fx.state.is_generated(Path::new("a.cmi_old")));
    }

    #[test]
    fn test_object_change_marks_affected_exes_dirty() {
        let mut fx = Fixture::new();
        let a = fx.source("a.ml", "let one = 1\n");
        let main = fx.source("main.ml", "let () = print_int A.one\n");
        fx.arena.add_edge(main, a);
        fx.arena.vertex_mut(main).exe_name = Some("prog".to_string());
        fx.arena.add_link_member(main, a);
        let ids = [a, main];
        fx.graph.add_all(&mut fx.arena, &ids);
        fx.graph.add_exe(main);

        fx.run();
        assert!(fx.graph.is_link_dirty(main));
    }

    #[test]
    fn test_auto_interface_written_and_marked_generated() {
        let mut fx = Fixture::new();
        let a = fx.source("a.ml", "let one = 1\n");
        fx.graph.add_all(&mut fx.arena, &[a]);
        fx.run();

        let mli = fx.root().join("a.mli");
        assert!(mli.exists());
        assert!(fx.state.is_generated(Path::new("a.mli")));
        assert_eq!(fs::read_to_string(mli).unwrap().trim(), "val one");
    }

    #[test]
    fn test_hand_written_interface_owns_compiled_interface() {
        let mut fx = Fixture::new();
        fs::write(fx.root().join("a.mli"), "val one\n").unwrap();
        let mli = fx
            .arena
            .insert(Vertex::new(PathBuf::from("a.mli"), FileKind::Interface));
        let a = fx.source("a.ml", "let one = 1\nlet hidden = 2\n");
        fx.arena.add_edge(a, mli);
        let ids = [mli, a];
        fx.graph.add_all(&mut fx.arena, &ids);

        fx.run();
        // The interface vertex owns the cmi; the source does not, and the
        // hand-written mli is never overwritten.
        assert_eq!(
            fx.arena.vertex(mli).interface_artifact,
            Some(PathBuf::from("a.cmi"))
        );
        assert_eq!(fx.arena.vertex(a).interface_artifact, None);
        assert_eq!(
            fs::read_to_string(fx.root().join("a.mli")).unwrap(),
            "val one\n"
        );
    }

    #[test]
    fn test_cancellation_stops_before_work() {
        let mut fx = Fixture::new();
        let a = fx.source("a.ml", "let one = 1\n");
        fx.graph.add_all(&mut fx.arena, &[a]);
        fx.cancel.cancel();

        let outcome = fx.run();
        assert!(outcome.cancelled);
        assert!(!fx.root().join("a.cmo").exists());
    }
}
