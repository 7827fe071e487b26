//! External transpiler discovery and invocation.
//!
//! Sources that the guest engine cannot execute directly (`.ts`) are
//! compiled by an external bundler found on `PATH`. Probing happens on
//! every reload so installing a tool takes effect without a restart.
//!
//! Contract with the tool: `<tool> <fixed flags...> <absolute path>`; exit
//! code 0 with the compiled unit on stdout is success, anything else is a
//! failure whose stderr is kept as the diagnostic.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Known external transpilers, in search priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranspilerKind {
    /// `bun build`
    Bun,
    /// `esbuild`
    Esbuild,
}

impl TranspilerKind {
    /// Search order; the first tool found wins.
    pub const SEARCH_ORDER: [Self; 2] = [Self::Bun, Self::Esbuild];

    /// Executable base name.
    pub fn program(self) -> &'static str {
        match self {
            Self::Bun => "bun",
            Self::Esbuild => "esbuild",
        }
    }

    /// Fixed flags placed before the input path.
    pub fn flags(self) -> &'static [&'static str] {
        match self {
            Self::Bun => &["build", "--minify", "--bundle", "--target=browser"],
            Self::Esbuild => &["--bundle", "--minify", "--format=iife", "--platform=browser", "--target=es2020"],
        }
    }

    fn candidates(self) -> Vec<String> {
        let base = self.program();
        if cfg!(windows) {
            vec![format!("{base}.exe"), format!("{base}.cmd")]
        } else {
            vec![base.to_string()]
        }
    }
}

impl fmt::Display for TranspilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// Failure transpiling one file.
#[derive(Debug, thiserror::Error)]
pub enum TranspileError {
    /// No tool was found during the last search.
    #[error("no transpiler available for {}", .file.display())]
    Unavailable {
        /// The file that needed transpiling.
        file: PathBuf,
    },
    /// The tool could not be started.
    #[error("failed to start {tool} for {}: {source}", .file.display())]
    Spawn {
        /// Tool that was invoked.
        tool: TranspilerKind,
        /// Input file.
        file: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// The tool ran and exited unsuccessfully.
    #[error("{tool} exited with {} for {}: {stderr}", exit_label(.code.as_ref()), .file.display())]
    Exit {
        /// Tool that was invoked.
        tool: TranspilerKind,
        /// Input file.
        file: PathBuf,
        /// Exit code, `None` if terminated by a signal.
        code: Option<i32>,
        /// Captured diagnostic output.
        stderr: String,
    },
}

fn exit_label(code: Option<&i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("code {c}"))
}

/// Resolved transpiler for one reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranspilerBinding {
    /// No tool available; sources needing transpilation are skipped.
    None,
    /// A tool found on the search path.
    Tool {
        /// Which tool.
        kind: TranspilerKind,
        /// Absolute path of its executable.
        executable: PathBuf,
    },
}

impl TranspilerBinding {
    /// Search the process `PATH`.
    pub fn locate() -> Self {
        Self::locate_in(std::env::var_os("PATH").as_deref())
    }

    /// Search an explicit path list (same syntax as `PATH`).
    pub fn locate_in(search_path: Option<&OsStr>) -> Self {
        let Some(search_path) = search_path else {
            return Self::None;
        };
        let dirs: Vec<PathBuf> = std::env::split_paths(search_path).collect();

        for kind in TranspilerKind::SEARCH_ORDER {
            for dir in &dirs {
                for name in kind.candidates() {
                    let candidate = dir.join(name);
                    if is_executable(&candidate) {
                        log::debug!("Found transpiler {kind} at {}", candidate.display());
                        return Self::Tool {
                            kind,
                            executable: candidate,
                        };
                    }
                }
            }
        }
        Self::None
    }

    /// Whether a tool is bound.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }

    /// Transpile one file, returning the compiled source.
    ///
    /// Blocks on the subprocess.
    pub fn transpile(&self, file: &Path) -> Result<String, TranspileError> {
        let Self::Tool { kind, executable } = self else {
            return Err(TranspileError::Unavailable {
                file: file.to_path_buf(),
            });
        };
        let input = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());

        let output = Command::new(executable)
            .args(kind.flags())
            .arg(&input)
            .output()
            .map_err(|source| TranspileError::Spawn {
                tool: *kind,
                file: file.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(TranspileError::Exit {
                tool: *kind,
                file: file.to_path_buf(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            log::debug!("{kind} diagnostics for {}: {}", file.display(), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl fmt::Display for TranspilerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Tool { kind, executable } => write!(f, "{kind} ({})", executable.display()),
        }
    }
}

/// Source of a [`TranspilerBinding`] for each reload.
pub trait TranspilerLocator: Send + Sync + fmt::Debug {
    /// Resolve the binding to use.
    fn locate(&self) -> TranspilerBinding;
}

/// Searches the process `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathLocator;

impl TranspilerLocator for PathLocator {
    fn locate(&self) -> TranspilerBinding {
        TranspilerBinding::locate()
    }
}

/// A fixed binding resolves to itself.
impl TranspilerLocator for TranspilerBinding {
    fn locate(&self) -> TranspilerBinding {
        self.clone()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
