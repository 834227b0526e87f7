use std::env;

// Constants
const DEFAULT_BIND: &str = "127.0.0.1:3000";
const DEFAULT_TABLE: &str = "blotter";
const DEFAULT_STATIC_DIR: &str = "static";
const DEFAULT_DEMO_EMAIL: &str = "demo@example.com";
const DEFAULT_DEMO_PASSWORD: &str = "demo";

/// Connection settings for the hosted store and auth service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Project base URL, e.g. `https://xyz.example.co`
    pub url: String,
    /// Public API key sent as the `apikey` header
    pub api_key: String,
    /// Table holding blotter entries
    pub table: String,
}

/// Runtime configuration of the blotter server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the HTTP server listens on
    pub bind: String,
    /// Directory of the front-end assets served for non-API paths
    pub static_dir: String,
    /// Remote store settings; `None` runs the server in demo mode
    pub store: Option<StoreConfig>,
    /// Credentials accepted by the in-memory auth backend in demo mode
    pub demo_email: String,
    pub demo_password: String,
}

impl Config {
    /// Build the configuration from `BLOTTER_*` environment variables
    ///
    /// * `BLOTTER_STORE_URL` / `BLOTTER_STORE_KEY` - hosted store endpoint and key
    /// * `BLOTTER_TABLE` - table name (default `blotter`)
    /// * `BLOTTER_BIND` - listen address (default `127.0.0.1:3000`)
    /// * `BLOTTER_STATIC_DIR` - front-end assets (default `static`)
    /// * `BLOTTER_DEMO_EMAIL` / `BLOTTER_DEMO_PASSWORD` - demo-mode login
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store = non_empty("BLOTTER_STORE_URL").map(|url| StoreConfig {
            url: url.trim_end_matches('/').to_string(),
            api_key: non_empty("BLOTTER_STORE_KEY").unwrap_or_default(),
            table: non_empty("BLOTTER_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
        });

        Config {
            bind: non_empty("BLOTTER_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            static_dir: non_empty("BLOTTER_STATIC_DIR")
                .unwrap_or_else(|| DEFAULT_STATIC_DIR.to_string()),
            store,
            demo_email: non_empty("BLOTTER_DEMO_EMAIL")
                .unwrap_or_else(|| DEFAULT_DEMO_EMAIL.to_string()),
            demo_password: non_empty("BLOTTER_DEMO_PASSWORD")
                .unwrap_or_else(|| DEFAULT_DEMO_PASSWORD.to_string()),
        }
    }

    /// Apply command line overrides (`blotter [bind-address]`)
    pub fn with_args(mut self, args: &[String]) -> Self {
        if let Some(bind) = args.get(1) {
            self.bind = bind.clone();
        }
        self
    }

    pub fn is_demo(&self) -> bool {
        self.store.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_demo_mode() {
        let config = Config::from_lookup(lookup(&[]));
        assert!(config.is_demo());
        assert_eq!(config.bind, "127.0.0.1:3000");
        assert_eq!(config.demo_email, "demo@example.com");
    }

    #[test]
    fn reads_store_settings() {
        let config = Config::from_lookup(lookup(&[
            ("BLOTTER_STORE_URL", "https://project.example.co/"),
            ("BLOTTER_STORE_KEY", "anon-key"),
        ]));
        let store = config.store.expect("store configured");
        assert_eq!(store.url, "https://project.example.co");
        assert_eq!(store.api_key, "anon-key");
        assert_eq!(store.table, "blotter");
    }

    #[test]
    fn first_argument_overrides_bind() {
        let args = vec!["blotter".to_string(), "0.0.0.0:8080".to_string()];
        let config = Config::from_lookup(lookup(&[("BLOTTER_BIND", "127.0.0.1:1")])).with_args(&args);
        assert_eq!(config.bind, "0.0.0.0:8080");
    }
}
