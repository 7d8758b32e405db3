//! Project configuration and persisted per-file state.
//!
//! The orchestrator does not own the per-file metadata it consumes: the
//! "produce executable" flag, extra compiler flags and external object lists
//! are attached to files from the outside (an IDE property page, the CLI).
//! They are persisted as JSON under the `.strata` directory, together with
//! the registry of files the build itself generated (auto-generated
//! interfaces, artifact backups), which must never be confused with user
//! files when deleting.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Name of the metadata directory at the project root.
pub const STRATA_DIR: &str = ".strata";

/// Folder (inside [`STRATA_DIR`]) where references to files outside the
/// project root are materialized.
pub const EXTERNAL_DIR: &str = "external";

const CONFIG_FILE: &str = "project.json";
const STATE_FILE: &str = "state.json";

/// File extensions understood by the orchestrator.
pub mod exts {
    /// Implementation source file.
    pub const SOURCE: &str = "ml";
    /// Hand-written or auto-generated interface file.
    pub const INTERFACE: &str = "mli";
    /// Lexer description, compiled by an external generator.
    pub const LEXER: &str = "mll";
    /// Parser description, compiled by an external generator.
    pub const PARSER: &str = "mly";
    /// Compiled object in bytecode mode.
    pub const OBJECT_BYTECODE: &str = "cmo";
    /// Compiled object in native mode.
    pub const OBJECT_NATIVE: &str = "cmx";
    /// Compiled interface.
    pub const INTERFACE_OBJECT: &str = "cmi";
    /// Suffix appended to an artifact extension for the pre-compile backup.
    pub const BACKUP_SUFFIX: &str = "_old";
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading or saving project metadata.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a metadata file
    #[error("invalid metadata in {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Project root not found
    #[error("project root not found: {0}")]
    RootNotFound(PathBuf),
}

/// Result type for project metadata operations.
pub type Result<T> = std::result::Result<T, ProjectError>;

// ============================================================================
// Build mode
// ============================================================================

/// Compilation mode for the whole project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// Bytecode compilation, producing `.cmo` objects.
    #[default]
    Bytecode,
    /// Native compilation, producing `.cmx` objects.
    Native,
}

impl BuildMode {
    /// Extension of the object artifact produced in this mode.
    pub fn object_ext(self) -> &'static str {
        match self {
            BuildMode::Bytecode => exts::OBJECT_BYTECODE,
            BuildMode::Native => exts::OBJECT_NATIVE,
        }
    }
}

// ============================================================================
// Project configuration
// ============================================================================

/// Project-level build configuration, persisted at
/// `.strata/project.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Directories passed as include paths to every tool invocation,
    /// relative to the project root.
    pub include_dirs: Vec<PathBuf>,

    /// Compilation mode (bytecode or native).
    pub build_mode: BuildMode,

    /// Flags added to every compiler and linker invocation.
    pub flags: Vec<String>,

    /// Dependency-listing tool. A bare name is resolved on `PATH`.
    pub dep_tool: PathBuf,

    /// Bytecode compiler (also used as the linker in bytecode mode).
    pub compiler_bytecode: PathBuf,

    /// Native compiler (also used as the linker in native mode).
    pub compiler_native: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            include_dirs: Vec::new(),
            build_mode: BuildMode::Bytecode,
            flags: Vec::new(),
            dep_tool: PathBuf::from("ocamldep"),
            compiler_bytecode: PathBuf::from("ocamlc"),
            compiler_native: PathBuf::from("ocamlopt"),
        }
    }
}

impl ProjectConfig {
    /// Load the configuration from `<root>/.strata/project.json`, falling
    /// back to defaults when the file does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(STRATA_DIR).join(CONFIG_FILE);
        if !path.exists() {
            debug!("no project config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)?;
        serde_json::from_str(&text).map_err(|source| ProjectError::Malformed { path, source })
    }

    /// Save the configuration to `<root>/.strata/project.json`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let dir = root.join(STRATA_DIR);
        fs::create_dir_all(&dir)?;
        let text = serde_json::to_string_pretty(self).expect("config serialization cannot fail");
        fs::write(dir.join(CONFIG_FILE), text)?;
        Ok(())
    }

    /// Compiler used for the configured build mode.
    pub fn compiler(&self) -> &Path {
        match self.build_mode {
            BuildMode::Bytecode => &self.compiler_bytecode,
            BuildMode::Native => &self.compiler_native,
        }
    }
}

// ============================================================================
// Per-file settings and project state
// ============================================================================

/// Metadata attached to a single source file by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// When set, compiling this file also produces an executable with this
    /// name (placed next to the source file).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe_name: Option<String>,

    /// Extra compiler flags for this file only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,

    /// For external references: the fixed, ordered list of object files to
    /// pass to the linker in place of discovered dependencies.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_objects: Vec<PathBuf>,
}

/// Mutable project state persisted at `.strata/state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectState {
    /// Per-file user settings, keyed by project-relative path.
    files: HashMap<PathBuf, FileSettings>,

    /// Files created by the build itself (auto-generated interfaces,
    /// artifact backups, linked binaries). Only these may be deleted
    /// without user consent.
    generated: HashSet<PathBuf>,

    /// Build mode recorded for each linked binary.
    exe_modes: HashMap<PathBuf, BuildMode>,
}

impl ProjectState {
    /// Load the state from `<root>/.strata/state.json`, or start empty.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(STRATA_DIR).join(STATE_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)?;
        serde_json::from_str(&text).map_err(|source| ProjectError::Malformed { path, source })
    }

    /// Save the state to `<root>/.strata/state.json`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let dir = root.join(STRATA_DIR);
        fs::create_dir_all(&dir)?;
        let text = serde_json::to_string_pretty(self).expect("state serialization cannot fail");
        fs::write(dir.join(STATE_FILE), text)?;
        Ok(())
    }

    /// Settings for a file, defaulting to empty settings.
    pub fn settings(&self, path: &Path) -> FileSettings {
        self.files.get(path).cloned().unwrap_or_default()
    }

    /// Replace the settings for a file.
    pub fn set_settings(&mut self, path: PathBuf, settings: FileSettings) {
        if settings == FileSettings::default() {
            self.files.remove(&path);
        } else {
            self.files.insert(path, settings);
        }
    }

    /// Mark a file as build-generated.
    pub fn mark_generated(&mut self, path: PathBuf) {
        self.generated.insert(path);
    }

    /// Whether a file was created by the build.
    pub fn is_generated(&self, path: &Path) -> bool {
        self.generated.contains(path)
    }

    /// Drop the generated mark for a file (ownership passed to the user,
    /// or the file was deleted).
    pub fn clear_generated(&mut self, path: &Path) {
        self.generated.remove(path);
    }

    /// All files currently marked as build-generated.
    pub fn generated_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.generated.iter()
    }

    /// Record the build mode metadata for a linked binary.
    pub fn set_exe_mode(&mut self, exe: PathBuf, mode: BuildMode) {
        self.exe_modes.insert(exe, mode);
    }

    /// Build mode last used to link a binary.
    pub fn exe_mode(&self, exe: &Path) -> Option<BuildMode> {
        self.exe_modes.get(exe).copied()
    }

    /// Forget all generated files and binary metadata (used by clean).
    pub fn reset(&mut self) {
        self.generated.clear();
        self.exe_modes.clear();
    }
}

// ============================================================================
// Path helpers
// ============================================================================

/// Replace the extension of a project-relative path.
pub fn with_ext(path: &Path, ext: &str) -> PathBuf {
    path.with_extension(ext)
}

/// Whether `path` names a file the orchestrator tracks (by extension).
pub fn is_tracked_source(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(exts::SOURCE) | Some(exts::INTERFACE) | Some(exts::LEXER) | Some(exts::PARSER)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_mode_object_ext() {
        assert_eq!(BuildMode::Bytecode.object_ext(), "cmo");
        assert_eq!(BuildMode::Native.object_ext(), "cmx");
    }

    #[test]
    fn test_config_roundtrip() {
        let temp = TempDir::new().unwrap();
        let mut config = ProjectConfig::default();
        config.include_dirs.push(PathBuf::from("lib"));
        config.flags.push("-g".to_string());
        config.save(temp.path()).unwrap();

        let loaded = ProjectConfig::load(temp.path()).unwrap();
        assert_eq!(loaded.include_dirs, vec![PathBuf::from("lib")]);
        assert_eq!(loaded.flags, vec!["-g".to_string()]);
        assert_eq!(loaded.build_mode, BuildMode::Bytecode);
    }

    #[test]
    fn test_config_defaults_when_missing() {
        let temp = TempDir::new().unwrap();
        let config = ProjectConfig::load(temp.path()).unwrap();
        assert_eq!(config.dep_tool, PathBuf::from("ocamldep"));
    }

    #[test]
    fn test_state_generated_registry() {
        let temp = TempDir::new().unwrap();
        let mut state = ProjectState::default();
        state.mark_generated(PathBuf::from("util.mli"));
        assert!(state.is_generated(Path::new("util.mli")));
        assert!(!state.is_generated(Path::new("util.ml")));

        state.save(temp.path()).unwrap();
        let loaded = ProjectState::load(temp.path()).unwrap();
        assert!(loaded.is_generated(Path::new("util.mli")));

        let mut loaded = loaded;
        loaded.clear_generated(Path::new("util.mli"));
        assert!(!loaded.is_generated(Path::new("util.mli")));
    }

    #[test]
    fn test_file_settings_default_is_dropped() {
        let mut state = ProjectState::default();
        state.set_settings(
            PathBuf::from("main.ml"),
            FileSettings {
                exe_name: Some("prog".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            state.settings(Path::new("main.ml")).exe_name.as_deref(),
            Some("prog")
        );

        state.set_settings(PathBuf::from("main.ml"), FileSettings::default());
        assert_eq!(state.settings(Path::new("main.ml")), FileSettings::default());
    }

    #[test]
    fn test_is_tracked_source() {
        assert!(is_tracked_source(Path::new("a.ml")));
        assert!(is_tracked_source(Path::new("dir/a.mli")));
        assert!(is_tracked_source(Path::new("lexer.mll")));
        assert!(is_tracked_source(Path::new("parser.mly")));
        assert!(!is_tracked_source(Path::new("a.cmo")));
        assert!(!is_tracked_source(Path::new("README.md")));
    }
}
