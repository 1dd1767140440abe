// web-server/src/config.rs
use config::{Config as ConfigFile, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Web server configuration. Session secrets are not part of it; they are
/// read separately from `SESSION_*` (see `SessionSettings::from_env`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub web_server_addr: String,
    /// `redis://…`, or `memory://` for an in-process store
    pub redis_url: String,
    pub cookie: CookieConfig,
    pub oidc: OidcConfig,
    pub redirects: RedirectConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CookieConfig {
    pub name: String,
    pub secure: bool,
}

/// Identity provider (Keycloak realm) settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Realm issuer, e.g. `https://sso.example.com/realms/main`
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub post_logout_redirect_uri: String,
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedirectConfig {
    pub after_login: String,
    pub on_error: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            web_server_addr: "127.0.0.1:8081".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            cookie: CookieConfig {
                name: "sid".to_string(),
                secure: true,
            },
            oidc: OidcConfig {
                issuer_url: "http://127.0.0.1:8080/realms/main".to_string(),
                client_id: "dashboard".to_string(),
                client_secret: None,
                redirect_uri: "http://127.0.0.1:8081/api/auth/callback".to_string(),
                post_logout_redirect_uri: "http://127.0.0.1:8081/".to_string(),
                scopes: vec!["openid".to_string(), "profile".to_string()],
            },
            redirects: RedirectConfig {
                after_login: "/".to_string(),
                on_error: "/login".to_string(),
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration: defaults, then config files, then `APP__*`
    /// environment variables
    pub fn load() -> Result<Self, config::ConfigError> {
        // Get the run mode, defaulting to "development"
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        // Locate the config directory
        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                // Check if we're in the project root or a subcrate
                let mut path = PathBuf::from("./config");
                if !path.exists() {
                    path = PathBuf::from("../config");
                }
                path
            });

        tracing::info!("Loading configuration from {}", config_dir.display());
        tracing::info!("Using run mode: {}", run_mode);

        ConfigFile::builder()
            .add_source(ConfigFile::try_from(&Self::default())?)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", run_mode))).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?
            .try_deserialize()
    }
}
