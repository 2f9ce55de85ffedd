//! Route registry and JSON loader.
//!
//! Routes are declared in a JSON file; each route carries a canonical path,
//! one URL alias per language, and a caching strategy. Every alias (and its
//! trailing-slash variant) resolves to the same canonical path, which is
//! what the cache keys on.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::cache::Strategy;
use crate::infra::InfraError;

/// One route as declared in the routes file.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteDef {
    /// Alias-independent identifier, e.g. `/features`.
    pub canonical: String,
    /// Language tag → URL path, e.g. `{"en": "/en/features"}`.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    /// Handler name; empty selects the generic content handler.
    #[serde(default)]
    pub handler: String,
    /// Template identifier handed to the handler.
    #[serde(default)]
    pub template: String,
    /// Translation key for the page title.
    #[serde(default)]
    pub title: String,
    pub strategy: Strategy,
}

#[derive(Debug, Deserialize)]
struct RoutesFile {
    routes: Vec<RouteDef>,
}

/// Route data resolved for one URL path.
#[derive(Debug)]
pub struct ResolvedRoute<'a> {
    pub canonical: &'a str,
    pub language: &'a str,
    pub strategy: Strategy,
    pub def: &'a RouteDef,
}

/// Lookup tables over the declared routes.
pub struct RouteRegistry {
    routes: Vec<RouteDef>,
    by_path: HashMap<String, (usize, String)>,
    by_canonical: HashMap<String, usize>,
}

impl RouteRegistry {
    /// Build a registry, registering each alias with and without a trailing
    /// slash. Duplicate aliases and empty canonicals are configuration
    /// errors.
    pub fn from_defs(routes: Vec<RouteDef>) -> Result<Self, InfraError> {
        let mut by_path = HashMap::new();
        let mut by_canonical = HashMap::new();

        for (idx, def) in routes.iter().enumerate() {
            if def.canonical.trim().is_empty() {
                return Err(InfraError::routes("route with empty canonical path"));
            }
            if by_canonical.insert(def.canonical.clone(), idx).is_some() {
                return Err(InfraError::routes(format!(
                    "duplicate canonical path `{}`",
                    def.canonical
                )));
            }

            for (language, path) in &def.paths {
                if !path.starts_with('/') {
                    return Err(InfraError::routes(format!(
                        "path `{path}` for `{}` must start with `/`",
                        def.canonical
                    )));
                }
                for alias in alias_variants(path) {
                    if by_path
                        .insert(alias.clone(), (idx, language.clone()))
                        .is_some()
                    {
                        return Err(InfraError::routes(format!(
                            "path `{alias}` registered by more than one route"
                        )));
                    }
                }
            }
        }

        Ok(Self {
            routes,
            by_path,
            by_canonical,
        })
    }

    /// Load and parse the routes file.
    pub fn load(path: &Path) -> Result<Self, InfraError> {
        let data = fs::read(path).map_err(|err| {
            InfraError::routes(format!("failed to read `{}`: {err}", path.display()))
        })?;
        let file: RoutesFile = serde_json::from_slice(&data).map_err(|err| {
            InfraError::routes(format!("failed to parse `{}`: {err}", path.display()))
        })?;

        let registry = Self::from_defs(file.routes)?;
        info!(
            target = "statio::http::routes",
            file = %path.display(),
            count = registry.routes.len(),
            "routes loaded"
        );
        Ok(registry)
    }

    /// Resolve a URL path to its route, or `None` for unknown paths.
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute<'_>> {
        let (idx, language) = self.by_path.get(path)?;
        let def = &self.routes[*idx];
        Some(ResolvedRoute {
            canonical: &def.canonical,
            language,
            strategy: def.strategy,
            def,
        })
    }

    /// The URL alias for `(canonical, language)`, used for replay requests.
    pub fn url_for(&self, canonical: &str, language: &str) -> Option<String> {
        let idx = self.by_canonical.get(canonical)?;
        self.routes[*idx].paths.get(language).cloned()
    }

    pub fn def_for_canonical(&self, canonical: &str) -> Option<&RouteDef> {
        self.by_canonical
            .get(canonical)
            .map(|idx| &self.routes[*idx])
    }

    pub fn routes(&self) -> &[RouteDef] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn alias_variants(path: &str) -> Vec<String> {
    if path == "/" {
        vec![path.to_string()]
    } else {
        vec![path.to_string(), format!("{path}/")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(canonical: &str, paths: &[(&str, &str)], strategy: Strategy) -> RouteDef {
        RouteDef {
            canonical: canonical.to_string(),
            paths: paths
                .iter()
                .map(|(lang, path)| (lang.to_string(), path.to_string()))
                .collect(),
            handler: String::new(),
            template: "content.html".to_string(),
            title: format!("{}.title", canonical.trim_start_matches('/')),
            strategy,
        }
    }

    #[test]
    fn aliases_resolve_to_one_canonical() {
        let registry = RouteRegistry::from_defs(vec![def(
            "/features",
            &[("en", "/en/features"), ("tr", "/tr/ozellikler")],
            Strategy::Static,
        )])
        .unwrap();

        let en = registry.resolve("/en/features").unwrap();
        assert_eq!(en.canonical, "/features");
        assert_eq!(en.language, "en");

        let tr = registry.resolve("/tr/ozellikler").unwrap();
        assert_eq!(tr.canonical, "/features");
        assert_eq!(tr.language, "tr");

        assert!(registry.resolve("/nope").is_none());
    }

    #[test]
    fn trailing_slash_variant_is_registered() {
        let registry = RouteRegistry::from_defs(vec![def(
            "/features",
            &[("en", "/en/features")],
            Strategy::Static,
        )])
        .unwrap();

        assert!(registry.resolve("/en/features/").is_some());
    }

    #[test]
    fn url_for_returns_language_alias() {
        let registry = RouteRegistry::from_defs(vec![def(
            "/features",
            &[("en", "/en/features"), ("tr", "/tr/ozellikler")],
            Strategy::Incremental,
        )])
        .unwrap();

        assert_eq!(
            registry.url_for("/features", "tr").as_deref(),
            Some("/tr/ozellikler")
        );
        assert!(registry.url_for("/features", "de").is_none());
        assert!(registry.url_for("/missing", "en").is_none());
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let result = RouteRegistry::from_defs(vec![
            def("/a", &[("en", "/en/page")], Strategy::Static),
            def("/b", &[("en", "/en/page")], Strategy::Static),
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn empty_canonical_is_rejected() {
        let result = RouteRegistry::from_defs(vec![def("", &[("en", "/en/a")], Strategy::Static)]);
        assert!(result.is_err());
    }

    #[test]
    fn load_parses_routes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(
            &path,
            r#"{
  "routes": [
    {
      "canonical": "/",
      "paths": {"en": "/en", "tr": "/tr"},
      "handler": "content",
      "template": "index.html",
      "title": "home.title",
      "strategy": "static"
    },
    {
      "canonical": "/search",
      "paths": {"en": "/en/search"},
      "strategy": "dynamic"
    }
  ]
}"#,
        )
        .unwrap();

        let registry = RouteRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("/en").unwrap().canonical, "/");
        assert_eq!(
            registry.resolve("/en/search").unwrap().strategy,
            Strategy::Dynamic
        );
    }
}
