//! Invocation of the external compiler toolchain.
//!
//! Tools run as blocking child processes with the project root as working
//! directory, so every path handed to them and printed by them is
//! project-relative. A missing tool is a distinct error: it aborts the
//! current step with a clear message instead of surfacing as a generic
//! spawn failure.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::debug;

use crate::project::ProjectConfig;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to run {}: {source}", .tool.display())]
    Spawn {
        tool: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output of {} is not valid UTF-8", .tool.display())]
    BadOutput { tool: PathBuf },
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// Captured result of a tool run. A failing exit status is not an error at
/// this level; callers decide what a non-zero exit means for their step.
#[derive(Debug)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Configured tool commands plus the project root they run in.
#[derive(Debug, Clone)]
pub struct Toolchain {
    root: PathBuf,
    dep_tool: PathBuf,
    compiler: PathBuf,
    include_dirs: Vec<PathBuf>,
}

impl Toolchain {
    pub fn new(root: &Path, config: &ProjectConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            dep_tool: config.dep_tool.clone(),
            compiler: config.compiler().to_path_buf(),
            include_dirs: config.include_dirs.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `-I dir` pairs for every configured include directory.
    fn include_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.include_dirs.len() * 2);
        for dir in &self.include_dirs {
            args.push("-I".to_string());
            args.push(dir.display().to_string());
        }
        args
    }

    /// Run the dependency tool over a set of files, returning its make-rule
    /// output.
    pub fn dependencies(&self, files: &[PathBuf]) -> Result<ToolOutput> {
        let mut args = self.include_args();
        args.extend(files.iter().map(|f| f.display().to_string()));
        self.run(&self.dep_tool, &args)
    }

    /// Compile one file to its object artifact (`-c`).
    pub fn compile(&self, file: &Path, extra_flags: &[String]) -> Result<ToolOutput> {
        let mut args = vec!["-c".to_string(), "-dtypes".to_string()];
        args.extend(self.include_args());
        args.extend(extra_flags.iter().cloned());
        args.push(file.display().to_string());
        self.run(&self.compiler, &args)
    }

    /// Print the inferred interface of a source file (`-i`), warnings off.
    pub fn infer_interface(&self, file: &Path) -> Result<ToolOutput> {
        let mut args = vec!["-i".to_string(), "-w".to_string(), "a".to_string()];
        args.extend(self.include_args());
        args.push(file.display().to_string());
        self.run(&self.compiler, &args)
    }

    /// Link an ordered object list into an executable.
    pub fn link(
        &self,
        exe: &Path,
        objects: &[PathBuf],
        extra_flags: &[String],
    ) -> Result<ToolOutput> {
        let mut args = vec!["-o".to_string(), exe.display().to_string()];
        args.extend(self.include_args());
        args.extend(extra_flags.iter().cloned());
        args.extend(objects.iter().map(|o| o.display().to_string()));
        self.run(&self.compiler, &args)
    }

    fn run(&self, tool: &Path, args: &[String]) -> Result<ToolOutput> {
        if !tool_available(&self.root, tool) {
            return Err(ToolError::NotFound(tool.to_path_buf()));
        }
        debug!("running {} {}", tool.display(), args.join(" "));
        let output = Command::new(tool)
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|source| ToolError::Spawn {
                tool: tool.to_path_buf(),
                source,
            })?;
        let stdout = String::from_utf8(output.stdout).map_err(|_| ToolError::BadOutput {
            tool: tool.to_path_buf(),
        })?;
        let stderr = String::from_utf8(output.stderr).map_err(|_| ToolError::BadOutput {
            tool: tool.to_path_buf(),
        })?;
        Ok(ToolOutput {
            success: output.status.success(),
            stdout,
            stderr,
        })
    }
}

/// A bare command name is left to PATH lookup at spawn time; a command
/// containing a path separator must point at an existing file.
fn tool_available(root: &Path, tool: &Path) -> bool {
    if tool.components().count() <= 1 {
        return true;
    }
    if tool.is_absolute() {
        tool.exists()
    } else {
        root.join(tool).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::BuildMode;
    use tempfile::TempDir;

    fn toolchain(root: &Path, compiler: &str) -> Toolchain {
        let config = ProjectConfig {
            compiler_bytecode: PathBuf::from(compiler),
            ..ProjectConfig::default()
        };
        Toolchain::new(root, &config)
    }

    #[test]
    fn test_missing_tool_with_path_is_not_found() {
        let dir = TempDir::new().unwrap();
        let tc = toolchain(dir.path(), "./tools/nope");
        let err = tc.compile(Path::new("a.ml"), &[]).unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[test]
    fn test_bare_name_passes_through_to_path_lookup() {
        let dir = TempDir::new().unwrap();
        let tc = toolchain(dir.path(), "definitely-not-a-real-compiler");
        // Bare names are resolved at spawn time; failure surfaces as Spawn.
        let err = tc.compile(Path::new("a.ml"), &[]).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn test_run_captures_output_and_status() {
        let dir = TempDir::new().unwrap();
        let tc = toolchain(dir.path(), "sh");
        let out = tc
            .run(
                Path::new("sh"),
                &["-c".to_string(), "echo out; echo err >&2".to_string()],
            )
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");

        let out = tc
            .run(Path::new("sh"), &["-c".to_string(), "exit 3".to_string()])
            .unwrap();
        assert!(!out.success);
    }

    #[test]
    fn test_runs_in_project_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), b"").unwrap();
        let tc = toolchain(dir.path(), "sh");
        let out = tc
            .run(Path::new("sh"), &["-c".to_string(), "test -f marker".to_string()])
            .unwrap();
        assert!(out.success);
    }

    #[test]
    fn test_include_args() {
        let dir = TempDir::new().unwrap();
        let config = ProjectConfig {
            include_dirs: vec![PathBuf::from("lib"), PathBuf::from("vendor")],
            build_mode: BuildMode::Bytecode,
            ..ProjectConfig::default()
        };
        let tc = Toolchain::new(dir.path(), &config);
        assert_eq!(tc.include_args(), vec!["-I", "lib", "-I", "vendor"]);
    }
}
