//! Parsing compiler output into structured diagnostics.
//!
//! The compiler reports problems as a location line followed by one or more
//! message lines:
//!
//! ```text
//! File "src/main.ml", line 12, characters 4-9:
//! Error: Unbound value foo
//! ```
//!
//! Everything between two location lines belongs to the preceding one. A
//! message whose first word is `Warning` is a warning; everything else is
//! an error.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marker text the linker emits when linking (not compiling) failed.
/// Diagnostics parsing stops there; the raw linker output is reported
/// against the executable instead.
const LINK_FAILURE_PREFIX: &str = "Error while linking";

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^File "(.+?)", line (\d+), characters (\d+)-(\d+):"#)
            .expect("location pattern is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One diagnostic attached to a file location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub severity: Severity,
    pub file: PathBuf,
    /// 1-based line number as reported by the tool.
    pub line: u32,
    /// 0-based column range on that line.
    pub char_start: u32,
    pub char_end: u32,
    pub message: String,
}

/// Diagnostics collected from one tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSet {
    pub markers: Vec<Marker>,
}

impl MarkerSet {
    /// Parse a compiler's stderr into markers.
    pub fn parse(output: &str) -> MarkerSet {
        let mut markers = Vec::new();
        let mut current: Option<(PathBuf, u32, u32, u32)> = None;
        let mut message = String::new();

        let mut flush = |loc: &mut Option<(PathBuf, u32, u32, u32)>, message: &mut String| {
            if let Some((file, line, start, end)) = loc.take() {
                let text = message.trim().to_string();
                if !text.is_empty() {
                    let severity = if text.starts_with("Warning") {
                        Severity::Warning
                    } else {
                        Severity::Error
                    };
                    markers.push(Marker {
                        severity,
                        file,
                        line,
                        char_start: start,
                        char_end: end,
                        message: text,
                    });
                }
            }
            message.clear();
        };

        for line in output.lines() {
            if line.starts_with(LINK_FAILURE_PREFIX) {
                break;
            }
            if let Some(caps) = location_re().captures(line) {
                flush(&mut current, &mut message);
                // The digit groups matched \d+, so parsing only fails on
                // absurdly large numbers; those lines are skipped.
                let parsed = (|| {
                    Some((
                        PathBuf::from(&caps[1]),
                        caps[2].parse().ok()?,
                        caps[3].parse().ok()?,
                        caps[4].parse().ok()?,
                    ))
                })();
                current = parsed;
            } else if current.is_some() {
                if !message.is_empty() {
                    message.push('\n');
                }
                message.push_str(line);
            }
        }
        flush(&mut current, &mut message);

        MarkerSet { markers }
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter().filter(|m| m.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter().filter(|m| m.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn extend(&mut self, other: MarkerSet) {
        self.markers.extend(other.markers);
    }
}

/// Outcome of a whole build request, serializable for consumers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildResult {
    /// Whether every compile and link step succeeded.
    pub success: bool,
    /// Whether the build stopped early on a cancellation request.
    pub cancelled: bool,
    /// Diagnostics from all compile steps, in build order.
    pub markers: MarkerSet,
    /// Raw linker output for executables that failed to link, keyed by
    /// binary path.
    pub link_failures: Vec<(PathBuf, String)>,
    /// Dependency cycles found during resolution, each as the chain of
    /// files closing it. The offending edges were excluded from the graph.
    pub cycles: Vec<Vec<PathBuf>>,
}

impl BuildResult {
    pub fn error_count(&self) -> usize {
        self.markers.errors().count() + self.link_failures.len()
    }

    pub fn warning_count(&self) -> usize {
        self.markers.warnings().count()
    }
}
