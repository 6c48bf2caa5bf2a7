//! Plugin kinds available to the loader.
//!
//! Compiled-in plugins register themselves in the [`PLUGIN_CATALOG`]
//! distributed slice with [`register_plugin!`](crate::register_plugin);
//! [`PluginCatalog::linked`] collects them at startup. Embedders can also add
//! factories by hand. Manifests refer to plugins by their catalog *kind*.

use std::collections::HashMap;
use std::sync::Arc;

use linkme::distributed_slice;
use tracing::{debug, warn};

use super::Plugin;

/// Creates a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// A statically registered plugin kind.
#[derive(Clone, Copy)]
pub struct CatalogEntry {
    /// Kind name manifests refer to.
    pub kind: &'static str,
    /// Instance constructor.
    pub create: fn() -> Box<dyn Plugin>,
}

impl std::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Plugin kinds contributed by every linked crate.
#[distributed_slice]
pub static PLUGIN_CATALOG: [CatalogEntry];

/// Adds a `Default` plugin type to [`PLUGIN_CATALOG`].
///
/// ```rust,ignore
/// register_plugin!(ECHO_PLUGIN, "example.echo", Echo);
/// ```
#[macro_export]
macro_rules! register_plugin {
    ($static_name:ident, $kind:expr, $plugin:ty) => {
        #[$crate::linkme::distributed_slice($crate::plugin::catalog::PLUGIN_CATALOG)]
        #[linkme(crate = $crate::linkme)]
        static $static_name: $crate::plugin::catalog::CatalogEntry =
            $crate::plugin::catalog::CatalogEntry {
                kind: $kind,
                create: || {
                    ::std::boxed::Box::new(<$plugin as ::std::default::Default>::default())
                },
            };
    };
}

/// Kind name to factory lookup.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: HashMap<String, PluginFactory>,
}

impl PluginCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects every entry of [`PLUGIN_CATALOG`].
    ///
    /// When a kind is registered more than once the first entry wins.
    pub fn linked() -> Self {
        let mut catalog = Self::new();
        for entry in PLUGIN_CATALOG.iter() {
            if catalog.contains(entry.kind) {
                warn!(kind = entry.kind, "Duplicate plugin kind in catalog, keeping first");
                continue;
            }
            let create = entry.create;
            catalog.insert(entry.kind, Arc::new(create));
        }
        debug!(kinds = catalog.len(), "Linked plugin catalog collected");
        catalog
    }

    /// Adds or replaces a factory, returning the previous one.
    pub fn insert(&mut self, kind: impl Into<String>, factory: PluginFactory) -> Option<PluginFactory> {
        self.factories.insert(kind.into(), factory)
    }

    /// Adds a `Default` plugin type under `kind`.
    pub fn register<P>(&mut self, kind: impl Into<String>) -> &mut Self
    where
        P: Plugin + Default + 'static,
    {
        self.insert(kind, Arc::new(|| Box::new(P::default()) as Box<dyn Plugin>));
        self
    }

    pub fn get(&self, kind: &str) -> Option<PluginFactory> {
        self.factories.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{HandlerContext, Outcome, PluginMeta};
    use async_trait::async_trait;
    use sinter_core::BoxError;

    #[derive(Default)]
    struct Linked;

    #[async_trait]
    impl Plugin for Linked {
        fn meta(&self) -> PluginMeta {
            PluginMeta::new("linked")
        }

        async fn handle(&self, _handler: &str, _ctx: &HandlerContext) -> Result<Outcome, BoxError> {
            Ok(Outcome::Handled)
        }
    }

    crate::register_plugin!(LINKED_TEST_PLUGIN, "test.linked", Linked);

    #[test]
    fn test_linked_catalog_contains_registered_kind() {
        let catalog = PluginCatalog::linked();
        let factory = catalog.get("test.linked").unwrap();
        assert_eq!(factory().meta().name, "linked");
    }

    #[test]
    fn test_manual_registration() {
        let mut catalog = PluginCatalog::new();
        catalog.register::<Linked>("b").register::<Linked>("a");
        assert_eq!(catalog.kinds(), vec!["a", "b"]);
        assert!(catalog.contains("a"));
        assert!(catalog.get("missing").is_none());
    }
}
