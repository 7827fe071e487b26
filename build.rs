//! Build script for hyscript.
//!
//! Walks `resources/` and generates `embedded_resources.rs` in `OUT_DIR`,
//! embedding every bundled file (SDK bootstrap, declaration files, seed
//! scripts) with `include_str!()`. The SDK is required at runtime in every
//! build profile, so nothing is stubbed out for debug builds.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=resources");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let root = manifest_dir.join("resources");

    let mut files = Vec::new();
    collect(&root, &root, &mut files);
    files.sort();

    let mut generated = String::from("/// Bundled resources as (relative path, content) pairs.\n");
    generated.push_str("pub static EMBEDDED_RESOURCES: &[(&str, &str)] = &[\n");
    for (rel, abs) in &files {
        println!("cargo:rerun-if-changed={}", abs.display());
        let _ = writeln!(generated, "    ({rel:?}, include_str!({:?})),", abs.display().to_string());
    }
    generated.push_str("];\n");

    fs::write(out_dir.join("embedded_resources.rs"), generated).expect("Failed to write embedded_resources.rs");
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push((rel, path));
        }
    }
}
