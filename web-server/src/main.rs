// Web Server - main.rs
// web-server/src/main.rs
mod api;
mod config;
mod identity;
mod utils;

use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use session_core::{setup_tracing, KeyValueStore, MemoryStore, RedisStore, SessionSettings, SessionStore};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::api::auth::AuthState;
use crate::config::ServerConfig;
use crate::identity::KeycloakClient;

const MEMORY_STORE_URL: &str = "memory://";
// How often the in-process store drops expired keys
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

fn startup_error(context: &str, err: impl std::fmt::Display) -> io::Error {
    tracing::error!("{}: {}", context, err);
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, err))
}

async fn connect_store(url: &str, settings: &SessionSettings) -> io::Result<Arc<dyn KeyValueStore>> {
    if url == MEMORY_STORE_URL {
        tracing::warn!("Using in-process session store; sessions will not survive a restart");
        let store = MemoryStore::new();
        store.spawn_reaper(REAPER_INTERVAL);
        return Ok(Arc::new(store));
    }

    let timeout = Duration::from_millis(settings.store_timeout_ms);
    let store = RedisStore::connect(url, timeout)
        .await
        .map_err(|e| startup_error("Could not connect to session store", e))?;
    Ok(Arc::new(store))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Setup tracing
    setup_tracing();

    // Load configuration; missing or weak session secrets stop startup here
    let config = ServerConfig::load().map_err(|e| startup_error("Invalid server configuration", e))?;
    let settings = SessionSettings::from_env().map_err(|e| startup_error("Invalid session settings", e))?;

    let kv = connect_store(&config.redis_url, &settings).await?;
    let sessions = SessionStore::new(kv, &settings).map_err(|e| startup_error("Could not build session store", e))?;
    let identity = KeycloakClient::new(config.oidc.clone())
        .map_err(|e| startup_error("Invalid identity provider configuration", e))?;

    // Save address before moving config into web::Data
    let server_addr = config.web_server_addr.clone();

    let auth_state = web::Data::new(AuthState {
        sessions: sessions.clone(),
        identity: Arc::new(identity),
        cookie: config.cookie.clone(),
        redirects: config.redirects.clone(),
    });

    tracing::info!("Starting Web Server on {}", server_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(auth_state.clone())
            .service(health)
            .configure(api::configure)
    })
    .bind(&server_addr)?
    .run()
    .await?;

    if let Err(e) = sessions.close().await {
        tracing::warn!("Error closing session store: {}", e);
    }
    tracing::info!("Web Server stopped");
    Ok(())
}
