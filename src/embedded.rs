//! Bundled resources embedded at compile time by build.rs.
//!
//! The build script walks `resources/` and generates `embedded_resources.rs`
//! containing `EMBEDDED_RESOURCES`, an array of (relative path, content)
//! tuples. Paths always use `/` separators.
//!
//! # Layout
//!
//! - `sdk/bootstrap.js`: guest SDK evaluated into every context (required)
//! - `declare/*`: type declarations copied into the data directory on first run
//! - `scripts/*`: example scripts seeded on first run

include!(concat!(env!("OUT_DIR"), "/embedded_resources.rs"));

/// Path of the SDK bootstrap inside the bundle.
pub const SDK_BOOTSTRAP: &str = "sdk/bootstrap.js";

/// Get embedded resource content by path.
#[inline]
pub fn get(path: &str) -> Option<&'static str> {
    ResourceBundle::embedded().get(path)
}

/// Get all embedded resources as (path, content) pairs.
#[inline]
pub fn all() -> &'static [(&'static str, &'static str)] {
    EMBEDDED_RESOURCES
}

/// Set of bundled files a [`ScriptHost`](crate::ScriptHost) draws its SDK and
/// seed content from.
///
/// Defaults to the compiled-in bundle; tests substitute a partial bundle to
/// exercise the missing-SDK path.
#[derive(Debug, Clone, Copy)]
pub struct ResourceBundle {
    files: &'static [(&'static str, &'static str)],
}

impl ResourceBundle {
    /// The bundle compiled into this binary.
    pub fn embedded() -> Self {
        Self { files: EMBEDDED_RESOURCES }
    }

    /// A bundle over an arbitrary static file table.
    pub fn from_static(files: &'static [(&'static str, &'static str)]) -> Self {
        Self { files }
    }

    /// Look up one file.
    pub fn get(&self, path: &str) -> Option<&'static str> {
        self.files.iter().find(|(p, _)| *p == path).map(|(_, c)| *c)
    }

    /// Files below `prefix/`, relative to it.
    pub fn under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'static str, &'static str)> + 'a {
        self.files.iter().filter_map(move |(path, content)| {
            path.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .map(|rel| (rel, *content))
        })
    }
}

impl Default for ResourceBundle {
    fn default() -> Self {
        Self::embedded()
    }
}
