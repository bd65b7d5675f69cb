pub mod manifest;
pub mod registry;

use std::path::Path;

use tracing::{debug, info, warn};

use weft_core::error::Result;

pub use manifest::{PluginManifest, PluginMetadata};
pub use registry::{resolve_in, PluginRegistry, RegistrySnapshot};

/// Load plugin manifests from a directory.
///
/// Reads every `*.toml` and `*.json` file directly under `dir`, in file name
/// order. Unreadable or malformed files are logged and skipped.
pub fn load_manifests(dir: &Path) -> Vec<PluginManifest> {
    let mut manifests = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Cannot read manifest directory");
            return manifests;
        }
    };

    let mut paths: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("toml") | Some("json")
                )
        })
        .collect();
    paths.sort();

    for path in paths {
        match PluginManifest::from_path(&path) {
            Ok(m) => {
                debug!(plugin = %m.id(), path = %path.display(), "Loaded plugin manifest");
                manifests.push(m);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load plugin manifest");
            }
        }
    }

    manifests
}

/// Load a directory of manifests and build the registry from them.
pub fn load_registry(dir: &Path) -> Result<PluginRegistry> {
    let manifests = load_manifests(dir);
    info!(count = manifests.len(), path = %dir.display(), "Building registry from manifests");
    PluginRegistry::build(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.toml"),
            "[plugin]\nid = \"alpha\"\n[[executors]]\nid = \"echo\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("b.json"), r#"{"plugin": {"id": "beta"}}"#).unwrap();
        std::fs::write(dir.path().join("broken.toml"), "this is not toml [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let manifests = load_manifests(dir.path());
        let ids: Vec<_> = manifests.iter().map(|m| m.id().to_string()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);

        let registry = load_registry(dir.path()).unwrap();
        assert!(registry.snapshot().executor("echo").is_some());
    }

    #[test]
    fn missing_directory_is_empty() {
        let manifests = load_manifests(Path::new("/nonexistent/weft/plugins"));
        assert!(manifests.is_empty());
    }
}
