// Build helper shared by every library crate: turns the crate README into the
// crate-level rustdoc. Pull it into a build.rs with:
//     include!("../build_common.rs");
//
// The including file must import:
//   use std::env;
//   use std::fs;
//   use std::path::Path;

/// Render `README.md` into `$OUT_DIR/README_GENERATED.md` for `include_str!`.
///
/// Links are rewritten so they resolve inside rustdoc:
/// 1. `](src/foo.rs)` becomes `](foo)` (module links)
/// 2. `](../../README.md` points at the repository URL from the workspace manifest
///
/// A crate without a README still gets a one-line doc so the include never fails.
fn process_readme_for_rustdoc(crate_dir: &str) {
    println!("cargo:rerun-if-changed=README.md");
    println!("cargo:rerun-if-changed=../../Cargo.toml");

    let readme_path = Path::new(crate_dir).join("README.md");
    let content = fs::read_to_string(&readme_path).unwrap_or_else(|_| {
        let name = env::var("CARGO_PKG_NAME").unwrap_or_default();
        let description = env::var("CARGO_PKG_DESCRIPTION").unwrap_or_default();
        format!("# {name}\n\n{description}\n")
    });

    let mut rustdoc_content = content.replace("](src/", "](").replace(".rs)", ")");

    if let Some(url) = workspace_repository_url(crate_dir) {
        rustdoc_content = rustdoc_content.replace("](../../README.md", &format!("]({url}"));
    }

    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("README_GENERATED.md");
    fs::write(dest_path, rustdoc_content).unwrap();
}

/// Read `repository = "..."` from the workspace Cargo.toml (two levels up).
fn workspace_repository_url(crate_dir: &str) -> Option<String> {
    let workspace_toml = Path::new(crate_dir).parent()?.parent()?.join("Cargo.toml");
    let content = fs::read_to_string(workspace_toml).ok()?;

    content.lines().map(str::trim).find_map(|line| {
        if !line.starts_with("repository") || !line.contains('=') {
            return None;
        }
        let start = line.find('"')?;
        let end = line.rfind('"')?;
        (start < end).then(|| line[start + 1..end].to_string())
    })
}
