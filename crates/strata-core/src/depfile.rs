//! Parsing of make-rule dependency output.
//!
//! The dependency tool prints rules of the form
//!
//! ```text
//! target.cmo target.cmx : dep2.cmo dep1.cmi
//! ```
//!
//! with long lines continued by a trailing backslash and spaces inside
//! filenames escaped as `\ `. Compiled-artifact names are mapped back to
//! the files that produce them (`.cmi` to the interface, `.cmo` to the
//! source) so the resolver works entirely in terms of tracked files.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::project::exts;

/// One parsed rule: a target file and its dependencies.
///
/// Dependencies are stored in declaration order reversed, which is the
/// order the resolver wants to visit them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepRule {
    pub target: PathBuf,
    pub dependencies: Vec<PathBuf>,
}

/// Parse the full output of a dependency tool run.
///
/// Unparseable lines are logged and skipped; the resolver treats a file
/// with no rule as having no dependencies.
pub fn parse(output: &str) -> Vec<DepRule> {
    let mut rules = Vec::new();
    for line in join_continuations(output) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_rule(&line) {
            Some(rule) => rules.push(rule),
            None => warn!("skipping unparseable dependency line: {line:?}"),
        }
    }
    rules
}

/// Find the rule for a given source or interface file, if any.
pub fn rule_for<'a>(rules: &'a [DepRule], file: &Path) -> Option<&'a DepRule> {
    rules.iter().find(|r| r.target == file)
}

/// Merge physical lines ending in `\` into single logical lines.
fn join_continuations(output: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for line in output.lines() {
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
            current.push(' ');
        } else {
            current.push_str(line);
            lines.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn parse_rule(line: &str) -> Option<DepRule> {
    let colon = find_unescaped_colon(line)?;
    let (lhs, rhs) = line.split_at(colon);
    let rhs = &rhs[1..];

    // The tool prints one rule per object kind; the first target is enough
    // to identify the file.
    let target = split_filenames(lhs).into_iter().next()?;
    let target = demangle(&target)?;

    let mut dependencies: Vec<PathBuf> = split_filenames(rhs)
        .iter()
        .filter_map(|d| demangle(d))
        .collect();
    dependencies.reverse();

    Some(DepRule { target, dependencies })
}

fn find_unescaped_colon(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    (0..bytes.len()).find(|&i| bytes[i] == b':' && (i == 0 || bytes[i - 1] != b'\\'))
}

/// Split on whitespace, honoring `\ ` escapes inside filenames.
fn split_filenames(part: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = String::new();
    let mut chars = part.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                chars.next();
                current.push(' ');
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    names.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        names.push(current);
    }
    names
}

/// Map a compiled-artifact name back to the file that produces it.
///
/// `.cmi` comes from the interface, `.cmo` / `.cmx` from the source.
/// Plain source and interface names pass through unchanged; anything else
/// is dropped.
fn demangle(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(exts::INTERFACE_OBJECT) => Some(path.with_extension(exts::INTERFACE)),
        Some(exts::OBJECT_BYTECODE) | Some(exts::OBJECT_NATIVE) => {
            Some(path.with_extension(exts::SOURCE))
        }
        Some(exts::SOURCE) | Some(exts::INTERFACE) => Some(path.to_path_buf()),
        _ => None,
    }
}
