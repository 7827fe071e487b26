//! Script discovery.
//!
//! The script directory is a flat listing. Only `.js` and `.ts` files are
//! recognized, and names starting with the backup marker `~` are ignored
//! (editor swap files, disabled scripts).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Prefix marking a file as a backup that must not be loaded.
pub const BACKUP_MARKER: char = '~';

/// How a discovered file becomes guest-executable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Executed as-is (`.js`).
    Native,
    /// Compiled by the external transpiler first (`.ts`).
    NeedsTranspile,
}

impl ScriptKind {
    /// Classify by extension; `None` for unrecognized files.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "js" => Some(Self::Native),
            "ts" => Some(Self::NeedsTranspile),
            _ => None,
        }
    }
}

/// Whether `path` names a script that should be loaded.
pub fn is_recognized(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with(BACKUP_MARKER) && ScriptKind::from_path(path).is_some()
}

/// A discovered script, rebuilt on every reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptUnit {
    /// Location on disk.
    pub path: PathBuf,
    /// Detected kind.
    pub kind: ScriptKind,
    /// Raw source as read from disk.
    pub source: String,
    /// Output of the transpiler, for [`ScriptKind::NeedsTranspile`] units.
    pub transpiled: Option<String>,
}

impl ScriptUnit {
    /// Read a recognized script from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let kind = ScriptKind::from_path(path)
            .with_context(|| format!("Not a script: {}", path.display()))?;
        let source = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            source,
            transpiled: None,
        })
    }

    /// File name used to attribute diagnostics.
    pub fn name(&self) -> String {
        display_name(&self.path)
    }

    /// Code to evaluate: the transpiled unit when present, else the raw source.
    pub fn code(&self) -> &str {
        self.transpiled.as_deref().unwrap_or(&self.source)
    }
}

/// File name of `path`, lossily converted.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// List recognized scripts in `dir`, sorted by file name.
///
/// Subdirectories are not descended into.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to list script directory {}", dir.display()))?;

    let mut scripts: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_recognized(path))
        .collect();
    scripts.sort_by_key(|p| p.file_name().map(ToOwned::to_owned));
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(ScriptKind::from_path(Path::new("a.js")), Some(ScriptKind::Native));
        assert_eq!(ScriptKind::from_path(Path::new("a.ts")), Some(ScriptKind::NeedsTranspile));
        assert_eq!(ScriptKind::from_path(Path::new("a.lua")), None);
        assert_eq!(ScriptKind::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn test_backup_marker_excluded() {
        assert!(is_recognized(Path::new("/s/main.js")));
        assert!(!is_recognized(Path::new("/s/~main.js")));
        assert!(!is_recognized(Path::new("/s/main.js.swp")));
    }

    #[test]
    fn test_discover_is_flat_filtered_and_sorted() {
        let dir = TempDir::new().unwrap();
        for name in ["b.ts", "a.js", "~old.js", "notes.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.js"), "").unwrap();

        let names: Vec<String> = discover(dir.path())
            .unwrap()
            .iter()
            .map(|p| display_name(p))
            .collect();
        assert_eq!(names, vec!["a.js", "b.ts"]);
    }

    #[test]
    fn test_unit_code_prefers_transpiled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.ts");
        fs::write(&path, "let a: number = 1;").unwrap();

        let mut unit = ScriptUnit::read(&path).unwrap();
        assert_eq!(unit.kind, ScriptKind::NeedsTranspile);
        assert_eq!(unit.code(), "let a: number = 1;");
        unit.transpiled = Some("let a = 1;".to_string());
        assert_eq!(unit.code(), "let a = 1;");
        assert_eq!(unit.name(), "x.ts");
    }
}
