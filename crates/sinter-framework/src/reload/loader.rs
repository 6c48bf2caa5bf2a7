//! Plugin source loading.
//!
//! A *source* is a manifest file naming catalog kinds and their overrides:
//!
//! ```toml
//! [[plugin]]
//! kind = "example.echo"
//! priority = 100
//!
//! [[plugin.rule]]
//! reg = "^#echo (.+)$"
//! fnc = "echo"
//!
//! [plugin.config]
//! prefix = "> "
//! ```
//!
//! Directory layout follows the usual plugin folder convention: manifests at
//! the top level load individually; a subdirectory loads its
//! `index.plugin.toml` when present, otherwise every manifest inside it.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{LoadError, LoadResult, ReloadError};
use crate::plugin::registration::PluginDefinition;

/// File name suffix of plugin manifests.
pub const MANIFEST_SUFFIX: &str = ".plugin.toml";

const INDEX_MANIFEST: &str = "index.plugin.toml";

/// Turns a plugin source into plugin definitions.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Returns `true` if this loader understands `path`.
    fn matches(&self, path: &Path) -> bool;

    /// Reads and parses `path`.
    async fn load(&self, path: &Path) -> LoadResult<Vec<PluginDefinition>>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "plugin")]
    plugins: Vec<PluginDefinition>,
}

/// Loader for `*.plugin.toml` manifests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestLoader;

impl ManifestLoader {
    /// Parses manifest `text` read from `path`.
    ///
    /// Entries without a kind are skipped; a manifest left with no entries
    /// is rejected.
    pub fn parse(path: &Path, text: &str) -> LoadResult<Vec<PluginDefinition>> {
        let manifest: Manifest = toml::from_str(text).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            reason: e.message().to_string(),
        })?;

        let total = manifest.plugins.len();
        let definitions: Vec<PluginDefinition> = manifest
            .plugins
            .into_iter()
            .filter(|d| !d.kind.trim().is_empty())
            .collect();
        if definitions.len() < total {
            warn!(
                path = %path.display(),
                skipped = total - definitions.len(),
                "Manifest entries without a kind skipped"
            );
        }
        if definitions.is_empty() {
            return Err(LoadError::NoValidExports {
                path: path.to_path_buf(),
            });
        }
        Ok(definitions)
    }
}

#[async_trait]
impl PluginLoader for ManifestLoader {
    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
    }

    async fn load(&self, path: &Path) -> LoadResult<Vec<PluginDefinition>> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &text)
    }
}

/// Outcome of a directory load pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Registrations added, per source key.
    pub loaded: Vec<(String, usize)>,
    /// Sources that failed, with the error message.
    pub failed: Vec<(PathBuf, String)>,
    /// Sources whose kind is not in the catalog.
    pub missing: Vec<(PathBuf, String)>,
}

impl LoadReport {
    /// Total number of registrations loaded.
    pub fn plugin_count(&self) -> usize {
        self.loaded.iter().map(|(_, n)| n).sum()
    }

    /// Missing kinds, deduplicated and sorted.
    pub fn missing_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self
            .missing
            .iter()
            .map(|(_, kind)| kind.as_str())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }
}

/// Registration key of `path`: its location relative to `root`, with `/`
/// separators.
pub fn source_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Lists the manifests under `dir` in load order.
///
/// A missing directory yields no sources.
pub async fn scan_sources(dir: &Path, loader: &dyn PluginLoader) -> Result<Vec<PathBuf>, ReloadError> {
    let scan_err = |source| ReloadError::Scan {
        path: dir.to_path_buf(),
        source,
    };
    if !tokio::fs::try_exists(dir).await.map_err(scan_err)? {
        debug!(dir = %dir.display(), "Plugin directory does not exist");
        return Ok(Vec::new());
    }

    let mut sources = Vec::new();
    for entry in sorted_entries(dir).await.map_err(scan_err)? {
        if entry.is_dir() {
            let index = entry.join(INDEX_MANIFEST);
            if tokio::fs::try_exists(&index).await.map_err(scan_err)? {
                sources.push(index);
                continue;
            }
            for nested in sorted_entries(&entry).await.map_err(scan_err)? {
                if !nested.is_dir() && loader.matches(&nested) {
                    sources.push(nested);
                }
            }
        } else if loader.matches(&entry) {
            sources.push(entry);
        }
    }
    Ok(sources)
}

async fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Priority;
    use crate::rule::Permission;

    const MANIFEST: &str = r#"
[[plugin]]
kind = "example.echo"
priority = 100

[[plugin.rule]]
reg = "^#echo (.+)$"
fnc = "echo"
permission = "admin"

[plugin.config]
prefix = "> "

[[plugin]]
kind = "example.watch"
priority = "extended"
event = ["notice.group", "request"]
"#;

    #[test]
    fn test_parse_manifest() {
        let defs = ManifestLoader::parse(Path::new("echo.plugin.toml"), MANIFEST).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].kind, "example.echo");
        assert_eq!(defs[0].priority, Some(Priority::Value(100)));
        let rules = defs[0].rules.as_ref().unwrap();
        assert_eq!(rules[0].handler, "echo");
        assert_eq!(rules[0].permission, Permission::Admin);
        assert_eq!(defs[0].config["prefix"], "> ");
        assert_eq!(defs[1].priority, Some(Priority::Extended));
        assert_eq!(defs[1].event.as_ref().unwrap().patterns().len(), 2);
    }

    #[test]
    fn test_parse_errors() {
        let path = Path::new("bad.plugin.toml");
        assert!(matches!(
            ManifestLoader::parse(path, "[[plugin]\nkind ="),
            Err(LoadError::Parse { .. })
        ));
        assert!(matches!(
            ManifestLoader::parse(path, ""),
            Err(LoadError::NoValidExports { .. })
        ));
        assert!(matches!(
            ManifestLoader::parse(path, "[[plugin]]\nkind = \"\""),
            Err(LoadError::NoValidExports { .. })
        ));
    }

    #[test]
    fn test_source_key_is_relative() {
        let root = Path::new("/srv/plugins");
        assert_eq!(
            source_key(root, Path::new("/srv/plugins/tools/index.plugin.toml")),
            "tools/index.plugin.toml"
        );
        assert_eq!(source_key(root, Path::new("/other/a.plugin.toml")), "other/a.plugin.toml");
    }

    #[tokio::test]
    async fn test_scan_prefers_index() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("b.plugin.toml"), MANIFEST).unwrap();
        std::fs::write(root.join("a.plugin.toml"), MANIFEST).unwrap();
        std::fs::write(root.join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(root.join("tools")).unwrap();
        std::fs::write(root.join("tools/index.plugin.toml"), MANIFEST).unwrap();
        std::fs::write(root.join("tools/extra.plugin.toml"), MANIFEST).unwrap();
        std::fs::create_dir(root.join("games")).unwrap();
        std::fs::write(root.join("games/dice.plugin.toml"), MANIFEST).unwrap();

        let sources = scan_sources(root, &ManifestLoader).await.unwrap();
        let keys: Vec<String> = sources.iter().map(|p| source_key(root, p)).collect();
        assert_eq!(
            keys,
            vec![
                "a.plugin.toml",
                "b.plugin.toml",
                "games/dice.plugin.toml",
                "tools/index.plugin.toml",
            ]
        );

        let missing = scan_sources(&root.join("nope"), &ManifestLoader).await.unwrap();
        assert!(missing.is_empty());
    }
}
