//! Layered dependency graph over tracked files.
//!
//! A file that depends on nothing sits on layer 0. A file whose deepest
//! dependency chain goes through layer `n` sits on layer `n + 1`: a vertex's
//! layer is the length of the longest path from it to a leaf. Visiting the
//! graph layer by layer therefore compiles every file after everything it
//! depends on.
//!
//! Vertices live in a [`VertexArena`] and are addressed by stable
//! [`VertexId`] indices; `requires` / `required_by` are id sets, so there
//! are no pointer back-references to dangle. A vertex belongs to at most one
//! [`LayersGraph`] at a time (membership is tracked by the graph, not the
//! vertex), and its layer number is graph-independent: moving a vertex
//! between graphs preserves its place in the dependency hierarchy.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use tracing::{debug, warn};

use crate::project::exts;

// ============================================================================
// Vertex
// ============================================================================

/// Stable handle to a vertex inside a [`VertexArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(u32);

impl VertexId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// What kind of file a vertex tracks; drives the compile and link drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Implementation source (`.ml`).
    Source,
    /// Interface (`.mli`), hand-written or auto-generated.
    Interface,
    /// Lexer description (`.mll`).
    Lexer,
    /// Parser description (`.mly`).
    Parser,
    /// Reference to a file outside the project; never compiled, its linker
    /// contribution is a fixed user-declared object list.
    External,
}

impl FileKind {
    /// Classify a tracked file by extension. External references are
    /// classified by their creator, not by extension.
    pub fn from_path(path: &Path) -> Option<FileKind> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(exts::SOURCE) => Some(FileKind::Source),
            Some(exts::INTERFACE) => Some(FileKind::Interface),
            Some(exts::LEXER) => Some(FileKind::Lexer),
            Some(exts::PARSER) => Some(FileKind::Parser),
            _ => None,
        }
    }
}

/// One tracked file in the dependency graph.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Project-relative path (for externals, the materialized link path).
    pub path: PathBuf,

    /// Kind of file, fixed at creation.
    pub kind: FileKind,

    /// Layer number; maintained exclusively by [`LayersGraph`].
    layer: usize,

    /// Files this file's compilation depends on, in the order the
    /// dependency tool declared them.
    requires: Vec<VertexId>,

    /// Files whose compilation depends on this file (reverse edges).
    required_by: Vec<VertexId>,

    /// Executables whose binary must be refreshed when this file's object
    /// artifact changes.
    affected_exes: Vec<VertexId>,

    /// For executables: the full transitive set of vertices whose artifacts
    /// are passed to the linker, in dependency order.
    link_set: Vec<VertexId>,

    /// For executables: the ordered object list used by the last successful
    /// link, kept to skip re-linking when nothing changed.
    pub linked_objects: Vec<PathBuf>,

    /// Executable name when this file is flagged to produce one.
    pub exe_name: Option<String>,

    /// Compiled object artifact (`.cmo` / `.cmx`) from the last successful
    /// compile. `None` for interfaces and never-compiled vertices.
    pub object_artifact: Option<PathBuf>,

    /// Compiled interface artifact (`.cmi`). `None` when a separate
    /// hand-written interface vertex owns it.
    pub interface_artifact: Option<PathBuf>,

    /// For externals: the fixed object list declared by the user.
    pub external_objects: Vec<PathBuf>,
}

impl Vertex {
    /// Create a detached vertex on layer 0 with no edges.
    pub fn new(path: PathBuf, kind: FileKind) -> Self {
        Self {
            path,
            kind,
            layer: 0,
            requires: Vec::new(),
            required_by: Vec::new(),
            affected_exes: Vec::new(),
            link_set: Vec::new(),
            linked_objects: Vec::new(),
            exe_name: None,
            object_artifact: None,
            interface_artifact: None,
            external_objects: Vec::new(),
        }
    }

    /// Layer this vertex currently sits on.
    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Forward dependency edges, in declaration order.
    pub fn requires(&self) -> &[VertexId] {
        &self.requires
    }

    /// Reverse dependency edges.
    pub fn required_by(&self) -> &[VertexId] {
        &self.required_by
    }

    /// Executables affected by a change to this vertex's object artifact.
    pub fn affected_exes(&self) -> &[VertexId] {
        &self.affected_exes
    }

    /// Current link set (executables only).
    pub fn link_set(&self) -> &[VertexId] {
        &self.link_set
    }

    pub fn is_external(&self) -> bool {
        self.kind == FileKind::External
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Owning store for all vertices, shared by every graph built over them.
///
/// Ids are stable: removing a vertex leaves a vacant slot and never shifts
/// other ids. "Not in any graph" is simply "no graph lists the id as a
/// member"; a removed id is additionally vacant here.
#[derive(Debug, Default)]
pub struct VertexArena {
    slots: Vec<Option<Vertex>>,
    by_path: HashMap<PathBuf, VertexId>,
}

impl VertexArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a vertex, returning its id. Replaces any vacant path mapping;
    /// inserting a second vertex for an existing path is a caller bug and
    /// shadows the old path mapping.
    pub fn insert(&mut self, vertex: Vertex) -> VertexId {
        let id = VertexId(self.slots.len() as u32);
        self.by_path.insert(vertex.path.clone(), id);
        self.slots.push(Some(vertex));
        id
    }

    /// Remove a vertex, freeing its slot.
    pub fn remove(&mut self, id: VertexId) -> Option<Vertex> {
        let vertex = self.slots.get_mut(id.index())?.take()?;
        self.by_path.remove(&vertex.path);
        Some(vertex)
    }

    pub fn get(&self, id: VertexId) -> Option<&Vertex> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: VertexId) -> Option<&mut Vertex> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Borrow a vertex that is known to be live.
    pub fn vertex(&self, id: VertexId) -> &Vertex {
        self.get(id).expect("vertex id must be live")
    }

    /// Mutably borrow a vertex that is known to be live.
    pub fn vertex_mut(&mut self, id: VertexId) -> &mut Vertex {
        self.get_mut(id).expect("vertex id must be live")
    }

    pub fn contains(&self, id: VertexId) -> bool {
        self.get(id).is_some()
    }

    /// Look a vertex up by its project-relative path.
    pub fn find(&self, path: &Path) -> Option<VertexId> {
        self.by_path.get(path).copied().filter(|&id| self.contains(id))
    }

    /// Iterate over all live vertices.
    pub fn iter(&self) -> impl Iterator<Item = (VertexId, &Vertex)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (VertexId(i as u32), v)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------------
    // Edge operations
    // ------------------------------------------------------------------------

    /// Add the reciprocal pair of edges `from requires to`, ignoring
    /// duplicates.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId) {
        if from == to {
            return;
        }
        {
            let v = self.vertex_mut(from);
            if !v.requires.contains(&to) {
                v.requires.push(to);
            }
        }
        let v = self.vertex_mut(to);
        if !v.required_by.contains(&from) {
            v.required_by.push(from);
        }
    }

    /// Remove `to` from `from`'s requires. Returns whether it was present.
    pub fn remove_forward(&mut self, from: VertexId, to: VertexId) -> bool {
        let v = self.vertex_mut(from);
        if let Some(pos) = v.requires.iter().position(|&d| d == to) {
            v.requires.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove `from` from `to`'s required_by. Returns whether it was
    /// present (absence is a reciprocity violation the caller reports).
    pub fn remove_reverse(&mut self, to: VertexId, from: VertexId) -> bool {
        let v = self.vertex_mut(to);
        if let Some(pos) = v.required_by.iter().position(|&a| a == from) {
            v.required_by.remove(pos);
            true
        } else {
            false
        }
    }

    /// Record that `exe` links `member`'s artifact.
    pub fn add_link_member(&mut self, exe: VertexId, member: VertexId) {
        {
            let v = self.vertex_mut(exe);
            if !v.link_set.contains(&member) {
                v.link_set.push(member);
            }
        }
        let v = self.vertex_mut(member);
        if !v.affected_exes.contains(&exe) {
            v.affected_exes.push(exe);
        }
    }

    /// Forget that `member` contributes to `exe`'s binary.
    pub fn remove_link_member(&mut self, exe: VertexId, member: VertexId) {
        let v = self.vertex_mut(exe);
        v.link_set.retain(|&m| m != member);
        let v = self.vertex_mut(member);
        v.affected_exes.retain(|&e| e != exe);
    }

    /// Clear an executable's link set, dropping it from every member's
    /// affected set.
    pub fn clear_link_set(&mut self, exe: VertexId) -> Vec<VertexId> {
        let members = std::mem::take(&mut self.vertex_mut(exe).link_set);
        for &m in &members {
            if self.contains(m) {
                self.vertex_mut(m).affected_exes.retain(|&e| e != exe);
            }
        }
        members
    }

    // ------------------------------------------------------------------------
    // Paired source/interface lookup
    // ------------------------------------------------------------------------

    /// For a source vertex: the interface vertex with the same stem, if it
    /// is among the dependencies.
    pub fn paired_interface(&self, id: VertexId) -> Option<VertexId> {
        let v = self.vertex(id);
        if v.kind != FileKind::Source {
            return None;
        }
        let want = v.path.with_extension(exts::INTERFACE);
        v.requires
            .iter()
            .copied()
            .find(|&d| {
                let d = self.vertex(d);
                d.kind == FileKind::Interface && d.path == want
            })
    }

    /// For an interface vertex: the source vertex with the same stem, if
    /// any depends on it.
    pub fn paired_source(&self, id: VertexId) -> Option<VertexId> {
        let v = self.vertex(id);
        if v.kind != FileKind::Interface {
            return None;
        }
        let want = v.path.with_extension(exts::SOURCE);
        v.required_by
            .iter()
            .copied()
            .find(|&a| {
                let a = self.vertex(a);
                a.kind == FileKind::Source && a.path == want
            })
    }
}

// ============================================================================
// Layers graph
// ============================================================================

/// Files the orchestrator must delete after a vertex was suppressed.
///
/// The graph itself never touches the filesystem; it reports what became
/// orphaned and the caller decides (checking the generated-file registry).
#[derive(Debug, Default)]
pub struct SuppressOutcome {
    /// Materialized external links whose last dependent vanished.
    pub external_links: Vec<PathBuf>,
    /// Auto-generated interface files orphaned by removing their source.
    pub auto_interfaces: Vec<PathBuf>,
}

/// An ordered sequence of layers over arena vertices, plus the executable
/// registry for the link driver.
#[derive(Debug, Default)]
pub struct LayersGraph {
    /// `layers[i]` holds the member ids on layer `i`. Dense: trailing empty
    /// layers are trimmed by [`LayersGraph::remove_empty_final_layers`].
    layers: Vec<Vec<VertexId>>,

    /// Every member id, for O(1) membership checks.
    members: HashSet<VertexId>,

    /// Vertices flagged to produce an executable.
    executables: Vec<VertexId>,

    /// Executables whose binary must be refreshed by the next link pass.
    link_dirty: HashSet<VertexId>,
}

impl LayersGraph {
    pub fn new() -> Self {
        Self {
            layers: vec![Vec::new()],
            members: HashSet::new(),
            executables: Vec::new(),
            link_dirty: HashSet::new(),
        }
    }

    /// Pre-allocate a number of layers. Delta graphs built against a
    /// reference graph start with the reference's layer count so vertices
    /// keep their layer index when moved across.
    pub fn with_layer_count(count: usize) -> Self {
        let mut graph = Self::new();
        while graph.layers.len() < count.max(1) {
            graph.layers.push(Vec::new());
        }
        graph
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Member ids on layer `index`, or `None` past the end.
    pub fn layer(&self, index: usize) -> Option<&[VertexId]> {
        self.layers.get(index).map(|l| l.as_slice())
    }

    pub fn add_empty_layer(&mut self) {
        self.layers.push(Vec::new());
    }

    pub fn contains(&self, id: VertexId) -> bool {
        self.members.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.members.iter().copied()
    }

    pub fn executables(&self) -> &[VertexId] {
        &self.executables
    }

    /// Find a member vertex by path.
    pub fn find_vertex(&self, arena: &VertexArena, path: &Path) -> Option<VertexId> {
        arena.find(path).filter(|id| self.contains(*id))
    }

    fn insert_at(&mut self, id: VertexId, layer: usize) {
        while self.layers.len() <= layer {
            self.add_empty_layer();
        }
        if !self.layers[layer].contains(&id) {
            self.layers[layer].push(id);
        }
        self.members.insert(id);
    }

    fn remove_from_layer(&mut self, id: VertexId, layer: usize) -> bool {
        match self.layers.get_mut(layer) {
            Some(l) => {
                if let Some(pos) = l.iter().position(|&v| v == id) {
                    l.remove(pos);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Insertion and re-layering
    // ------------------------------------------------------------------------

    /// Add a batch of vertices (typically a resolver result: each vertex
    /// together with its dependencies), then re-layer from the batch.
    ///
    /// Vertices already belonging to another graph must have been removed
    /// from it by the caller first; their layer number carries over.
    /// Idempotent: re-running on an already consistent graph moves nothing.
    pub fn add_all(&mut self, arena: &mut VertexArena, ids: &[VertexId]) {
        for &id in ids {
            let layer = arena.vertex(id).layer;
            self.insert_at(id, layer);
        }
        self.refresh_layers(arena, ids);
    }

    /// Recompute layers breadth-first from a seed set, moving members whose
    /// computed layer differs from the stored one and rippling through
    /// `required_by`. Non-member vertices reached by the ripple get their
    /// layer field updated (the hierarchy is graph-independent); their own
    /// graph repositions them on [`LayersGraph::resync`].
    pub fn refresh_layers(&mut self, arena: &mut VertexArena, seeds: &[VertexId]) {
        let mut queue: VecDeque<VertexId> = seeds.iter().copied().collect();
        let mut guard = 0usize;
        let budget = arena.len().saturating_mul(arena.len().max(2)) + seeds.len() + 16;

        while let Some(id) = queue.pop_front() {
            // A consistent graph is acyclic, so propagation terminates; the
            // guard keeps a corrupted graph from spinning forever.
            guard += 1;
            if guard > budget {
                warn!("layer propagation exceeded budget, aborting refresh");
                return;
            }
            if !arena.contains(id) {
                continue;
            }
            let computed = Self::computed_layer(arena, id);
            let stored = arena.vertex(id).layer;
            if computed == stored {
                continue;
            }
            debug!(
                "re-layering {:?}: {} -> {}",
                arena.vertex(id).path,
                stored,
                computed
            );
            if self.members.contains(&id) && !self.remove_from_layer(id, stored) {
                warn!(
                    "vertex {:?} was not in its recorded layer {}",
                    arena.vertex(id).path,
                    stored
                );
            }
            arena.vertex_mut(id).layer = computed;
            if self.members.contains(&id) {
                self.insert_at(id, computed);
            }
            for &a in arena.vertex(id).required_by() {
                queue.push_back(a);
            }
        }
    }

    /// `0` for a leaf, else one more than the deepest requirement.
    fn computed_layer(arena: &VertexArena, id: VertexId) -> usize {
        let v = arena.vertex(id);
        v.requires
            .iter()
            .filter_map(|&d| arena.get(d))
            .map(|d| d.layer + 1)
            .max()
            .unwrap_or(0)
    }

    /// Rebuild the layer vectors from the members' stored layer numbers.
    /// Used after merging, when layers may have shifted while vertices were
    /// parked in another graph.
    pub fn resync(&mut self, arena: &VertexArena) {
        let mut ids: Vec<VertexId> = self.members.iter().copied().collect();
        ids.sort();
        self.layers = vec![Vec::new()];
        for id in ids {
            match arena.get(id) {
                Some(v) => {
                    let layer = v.layer;
                    while self.layers.len() <= layer {
                        self.layers.push(Vec::new());
                    }
                    self.layers[layer].push(id);
                }
                None => {
                    self.members.remove(&id);
                }
            }
        }
        self.remove_empty_final_layers();
    }

    /// Trim trailing empty layers.
    pub fn remove_empty_final_layers(&mut self) {
        while self.layers.len() > 1 && self.layers.last().is_some_and(|l| l.is_empty()) {
            self.layers.pop();
        }
    }

    // ------------------------------------------------------------------------
    // Executables
    // ------------------------------------------------------------------------

    /// Register an executable vertex, ignoring duplicates.
    pub fn add_exe(&mut self, id: VertexId) {
        if !self.executables.contains(&id) {
            self.executables.push(id);
        }
    }

    /// Unregister an executable: clears its link set and removes it from
    /// every member's affected set.
    pub fn remove_exe(&mut self, arena: &mut VertexArena, id: VertexId) -> bool {
        let Some(pos) = self.executables.iter().position(|&e| e == id) else {
            return false;
        };
        self.executables.remove(pos);
        self.link_dirty.remove(&id);
        arena.clear_link_set(id);
        arena.vertex_mut(id).linked_objects.clear();
        true
    }

    /// Mark an executable as needing a re-link in the next link pass.
    pub fn mark_link_dirty(&mut self, id: VertexId) {
        self.link_dirty.insert(id);
    }

    pub fn is_link_dirty(&self, id: VertexId) -> bool {
        self.link_dirty.contains(&id)
    }

    pub fn clear_link_dirty(&mut self, id: VertexId) {
        self.link_dirty.remove(&id);
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Drop a vertex from this graph's layers without touching the
    /// dependency hierarchy. Afterwards the vertex is in no graph; used
    /// when moving vertices into a delta graph.
    pub fn remove_vertex(&mut self, arena: &VertexArena, id: VertexId) {
        if !self.members.remove(&id) {
            return;
        }
        let layer = arena.vertex(id).layer;
        if !self.remove_from_layer(id, layer) {
            warn!(
                "vertex {:?} missing from its layer {} during removal",
                arena.vertex(id).path,
                layer
            );
        }
    }

    /// Destroy a vertex: detach it from the hierarchy in both directions,
    /// drop it from its layer and the executable registry, cascade-suppress
    /// external dependencies left with no dependent, free the arena slot,
    /// and re-layer the former dependents.
    ///
    /// Requires are treated as ground truth: a dependency that did not list
    /// this vertex back is logged as a consistency fault and recovery
    /// continues.
    pub fn suppress(&mut self, arena: &mut VertexArena, id: VertexId) -> SuppressOutcome {
        let mut outcome = SuppressOutcome::default();
        self.suppress_into(arena, id, &mut outcome);
        outcome
    }

    fn suppress_into(
        &mut self,
        arena: &mut VertexArena,
        id: VertexId,
        outcome: &mut SuppressOutcome,
    ) {
        if !arena.contains(id) {
            return;
        }
        let requires = arena.vertex(id).requires.clone();
        let required_by = arena.vertex(id).required_by.clone();
        let affected_exes = arena.vertex(id).affected_exes.clone();
        let link_set = arena.vertex(id).link_set.clone();
        let path = arena.vertex(id).path.clone();
        let kind = arena.vertex(id).kind;
        let is_exe = arena.vertex(id).exe_name.is_some();
        let had_interface = arena.paired_interface(id).is_some();
        let layer = arena.vertex(id).layer;

        // Detach from the hierarchy, requires side first.
        let mut orphaned_externals = Vec::new();
        for d in requires {
            if !arena.remove_reverse(d, id) {
                warn!(
                    "reciprocity violation: {:?} did not list {:?} as a dependent",
                    arena.vertex(d).path,
                    path
                );
            }
            let dep = arena.vertex(d);
            if dep.is_external() && dep.required_by.is_empty() {
                orphaned_externals.push(d);
            }
        }
        for a in &required_by {
            if !arena.remove_forward(*a, id) {
                warn!(
                    "reciprocity violation: {:?} did not require {:?}",
                    arena.vertex(*a).path,
                    path
                );
            }
        }
        for e in affected_exes {
            if arena.contains(e) {
                arena.vertex_mut(e).link_set.retain(|&m| m != id);
            }
        }
        for m in link_set {
            if arena.contains(m) {
                arena.vertex_mut(m).affected_exes.retain(|&e| e != id);
            }
        }

        // Drop from this graph.
        self.members.remove(&id);
        self.remove_from_layer(id, layer);
        if is_exe {
            self.executables.retain(|&e| e != id);
            self.link_dirty.remove(&id);
        }

        // Report orphaned files for the caller to delete.
        match kind {
            FileKind::External => outcome.external_links.push(path.clone()),
            FileKind::Source if !had_interface => {
                outcome
                    .auto_interfaces
                    .push(path.with_extension(exts::INTERFACE));
            }
            _ => {}
        }

        arena.remove(id);

        for d in orphaned_externals {
            self.suppress_into(arena, d, outcome);
        }
        self.refresh_layers(arena, &required_by);
    }

    // ------------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------------

    /// Absorb another graph built over the same arena: every member and
    /// executable moves into this graph at its current layer number.
    pub fn merge_with(&mut self, arena: &VertexArena, other: LayersGraph) {
        for id in other.members {
            self.members.insert(id);
        }
        for exe in other.executables {
            self.add_exe(exe);
        }
        for exe in other.link_dirty {
            self.link_dirty.insert(exe);
        }
        self.resync(arena);
    }
}

// ============================================================================
// Consistency checking
// ============================================================================

/// Result of a consistency pass over the arena.
#[derive(Debug, Default)]
pub struct ConsistencyReport {
    /// Reverse-edge entries that had to be rebuilt from `requires`.
    pub repaired_edges: usize,
    /// Vertices whose stored layer broke the layer invariant.
    pub layer_violations: Vec<VertexId>,
    /// Whether a `requires` cycle survives in the arena.
    pub cyclic: bool,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.repaired_edges == 0 && self.layer_violations.is_empty() && !self.cyclic
    }
}

/// Verify and repair arena-wide invariants.
///
/// Reciprocity is repaired by trusting `requires` and rebuilding every
/// `required_by` set from it. Acyclicity is checked on a petgraph mirror of
/// the forward edges; a detected cycle is only reported, since the resolver
/// is responsible for keeping cyclic edges out.
pub fn check_consistency(arena: &mut VertexArena) -> ConsistencyReport {
    let mut report = ConsistencyReport::default();

    // Rebuild required_by from requires.
    let mut expected: HashMap<VertexId, Vec<VertexId>> = HashMap::new();
    let ids: Vec<VertexId> = arena.iter().map(|(id, _)| id).collect();
    for &id in &ids {
        expected.entry(id).or_default();
        for &d in arena.vertex(id).requires() {
            expected.entry(d).or_default().push(id);
        }
    }
    for &id in &ids {
        let rebuilt = expected.remove(&id).unwrap_or_default();
        let current = &arena.vertex(id).required_by;
        let current_set: HashSet<VertexId> = current.iter().copied().collect();
        let rebuilt_set: HashSet<VertexId> = rebuilt.iter().copied().collect();
        if current_set != rebuilt_set {
            let drift = current_set.symmetric_difference(&rebuilt_set).count();
            warn!(
                "reciprocity violation at {:?}: rebuilding {} reverse edge(s)",
                arena.vertex(id).path,
                drift
            );
            report.repaired_edges += drift;
            arena.vertex_mut(id).required_by = rebuilt;
        }
    }

    // Layer invariant.
    for &id in &ids {
        let v = arena.vertex(id);
        let computed = v
            .requires()
            .iter()
            .filter_map(|&d| arena.get(d))
            .map(|d| d.layer() + 1)
            .max()
            .unwrap_or(0);
        if v.layer() != computed {
            report.layer_violations.push(id);
        }
    }

    // Acyclicity on a petgraph mirror.
    let mut mirror: StableGraph<VertexId, ()> = StableGraph::new();
    let mut nodes: HashMap<VertexId, NodeIndex> = HashMap::new();
    for &id in &ids {
        nodes.insert(id, mirror.add_node(id));
    }
    for &id in &ids {
        for &d in arena.vertex(id).requires() {
            if let (Some(&a), Some(&b)) = (nodes.get(&id), nodes.get(&d)) {
                mirror.add_edge(a, b, ());
            }
        }
    }
    report.cyclic = is_cyclic_directed(&mirror);

    report
}

// ============================================================================
// Tests
// ============================================================================
