//! Incremental build orchestration over a layered dependency graph.
//!
//! The crate tracks a project's source files as vertices of a dependency
//! graph organized into layers: a file sits one layer above its deepest
//! dependency, so compiling layer by layer always compiles prerequisites
//! first. Builds are incremental at two levels: only changed files (and
//! files their compiled interfaces actually affect) are recompiled, and an
//! executable is re-linked only when an object it links really changed.
//!
//! [`orchestrator::BuildOrchestrator`] is the entry point; the modules
//! underneath it are usable on their own:
//!
//! - [`graph`]: vertex arena and the layered graph itself
//! - [`resolver`]: dependency-tool output to graph edges, with cycle
//!   containment
//! - [`compile`]: the layer-sweeping compile driver
//! - [`link`]: link-set computation and executable refresh
//! - [`depfile`]: make-rule parsing
//! - [`artifact`]: artifact snapshotting and byte comparison
//! - [`diagnostics`]: compiler output to structured markers
//! - [`project`]: configuration and persisted per-file state
//! - [`toolchain`]: external tool invocation
//! - [`cancel`]: cooperative cancellation

pub mod artifact;
pub mod cancel;
pub mod compile;
pub mod depfile;
pub mod diagnostics;
pub mod graph;
pub mod link;
pub mod orchestrator;
pub mod project;
pub mod resolver;
pub mod toolchain;

pub use cancel::CancelToken;
pub use diagnostics::{BuildResult, Marker, MarkerSet, Severity};
pub use orchestrator::{BuildError, BuildOrchestrator};
pub use project::{BuildMode, FileSettings, ProjectConfig, ProjectState};
