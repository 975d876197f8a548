//! NoHands configuration, loaded from environment variables.

use std::path::{Component, Path, PathBuf};

use nohands_pipeline::RegistryAuth;

#[derive(Clone, Debug)]
pub struct NohandsConfig {
    /// Root for the git cache (`cache/`) and build checkouts (`builds/`).
    pub checkout_dir: PathBuf,
    /// Maximum number of builds running at once.
    pub max_concurrent_builds: usize,
    /// Public base URL of this server, handed to containers as a trusted origin.
    pub app_url: String,
    /// Registry host for pushed images.
    pub registry_url: String,
    pub registry_username: String,
    pub registry_password: String,
    /// Default page size for list endpoints.
    pub page_size: i64,
    /// Upstream timeout for the container forwarding proxy.
    pub proxy_timeout_secs: u64,
}

impl NohandsConfig {
    pub fn from_env() -> Self {
        let config = Self::from_lookup(|key| std::env::var(key).ok());

        if config.app_url.is_empty() {
            tracing::warn!("NOHANDS_APP_URL not set -- containers get no CSRF_TRUSTED_ORIGINS");
        }
        if config.registry().is_none() {
            tracing::warn!("DOCKER_REGISTRY credentials incomplete -- registry pushes disabled");
        }

        config
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let checkout_dir = lookup("NOHANDS_CHECKOUT_DIR")
            .filter(|s| !s.is_empty())
            .map(|dir| resolve_parent_dirs(Path::new(&dir)))
            .unwrap_or_else(|| PathBuf::from("./git_checkouts"));
        let max_concurrent_builds = lookup("NOHANDS_MAX_CONCURRENT_BUILDS")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(2);
        let app_url = lookup("NOHANDS_APP_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_default();
        let registry_url = lookup("DOCKER_REGISTRY").unwrap_or_default();
        let registry_username = lookup("DOCKER_REGISTRY_USERNAME").unwrap_or_default();
        let registry_password = lookup("DOCKER_REGISTRY_PASSWORD").unwrap_or_default();
        let page_size = lookup("NOHANDS_PAGE_SIZE")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(20);
        let proxy_timeout_secs = lookup("NOHANDS_PROXY_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Self {
            checkout_dir,
            max_concurrent_builds,
            app_url,
            registry_url,
            registry_username,
            registry_password,
            page_size,
            proxy_timeout_secs,
        }
    }

    /// Cached clone of a repository: `cache/<id>-<name>`, with every
    /// character outside `[A-Za-z0-9._-]` in the name replaced by `_`.
    pub fn cache_path(&self, repository_id: i64, repository_name: &str) -> PathBuf {
        let name: String = repository_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.checkout_dir
            .join("cache")
            .join(format!("{repository_id}-{name}"))
    }

    /// Working tree for one build.
    pub fn build_path(&self, build_id: i64) -> PathBuf {
        self.checkout_dir.join("builds").join(format!("build_{build_id}"))
    }

    /// Registry credentials, if all of them are configured.
    pub fn registry(&self) -> Option<RegistryAuth> {
        RegistryAuth::from_parts(
            Some(&self.registry_url),
            Some(&self.registry_username),
            Some(&self.registry_password),
        )
    }
}

/// Drop `..` components lexically, anchoring relative paths at the working
/// directory first. Paths without `..` are returned unchanged.
fn resolve_parent_dirs(path: &Path) -> PathBuf {
    if !path.components().any(|c| c == Component::ParentDir) {
        return path.to_path_buf();
    }
    let anchored = if path.is_relative() {
        std::env::current_dir().unwrap_or_default().join(path)
    } else {
        path.to_path_buf()
    };
    let mut resolved = PathBuf::new();
    for component in anchored.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> NohandsConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NohandsConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config(&[]);
        assert_eq!(config.checkout_dir, PathBuf::from("./git_checkouts"));
        assert_eq!(config.max_concurrent_builds, 2);
        assert_eq!(config.page_size, 20);
        assert_eq!(config.proxy_timeout_secs, 30);
        assert!(config.app_url.is_empty());
        assert!(config.registry().is_none());
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config(&[
            ("NOHANDS_MAX_CONCURRENT_BUILDS", "0"),
            ("NOHANDS_PAGE_SIZE", "lots"),
            ("NOHANDS_CHECKOUT_DIR", ""),
        ]);
        assert_eq!(config.max_concurrent_builds, 2);
        assert_eq!(config.page_size, 20);
        assert_eq!(config.checkout_dir, PathBuf::from("./git_checkouts"));
    }

    #[test]
    fn paths_and_registry() {
        let config = config(&[
            ("NOHANDS_CHECKOUT_DIR", "/srv/nohands"),
            ("NOHANDS_APP_URL", "https://nohands.example.com/"),
            ("DOCKER_REGISTRY", "registry.example.com"),
            ("DOCKER_REGISTRY_USERNAME", "ci"),
            ("DOCKER_REGISTRY_PASSWORD", "secret"),
        ]);
        assert_eq!(
            config.cache_path(4, "my repo"),
            PathBuf::from("/srv/nohands/cache/4-my_repo")
        );
        assert_eq!(
            config.build_path(12),
            PathBuf::from("/srv/nohands/builds/build_12")
        );
        assert_eq!(config.app_url, "https://nohands.example.com");
        let registry = config.registry().unwrap();
        assert_eq!(registry.url, "registry.example.com");
        assert_eq!(registry.username, "ci");
    }

    #[test]
    fn cache_path_cannot_leave_the_cache_directory() {
        let config = config(&[("NOHANDS_CHECKOUT_DIR", "/srv/nohands")]);
        let cache_root = PathBuf::from("/srv/nohands/cache");
        for name in ["../../victim", "..", "a/../../b", "..\\x", "/etc"] {
            let path = config.cache_path(9, name);
            let rest = path.strip_prefix(&cache_root).unwrap();
            assert_eq!(rest.components().count(), 1, "{name} -> {}", path.display());
            assert!(matches!(rest.components().next(), Some(Component::Normal(_))));
        }
        assert_eq!(
            config.cache_path(9, "../../victim"),
            PathBuf::from("/srv/nohands/cache/9-.._.._victim")
        );
    }

    #[test]
    fn checkout_dir_parent_components_are_resolved() {
        let cfg = config(&[("NOHANDS_CHECKOUT_DIR", "/srv/tmp/../nohands/./data")]);
        assert_eq!(cfg.checkout_dir, PathBuf::from("/srv/nohands/data"));

        let relative = config(&[("NOHANDS_CHECKOUT_DIR", "../checkouts")]);
        assert!(relative.checkout_dir.is_absolute());
        assert!(relative
            .checkout_dir
            .components()
            .all(|c| c != Component::ParentDir));
    }
}
