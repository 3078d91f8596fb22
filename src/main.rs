use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use anyhow::Context;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

use schooldesk::auth::{hash_password, JwtKeys, Role};
use schooldesk::config::Config;
use schooldesk::models::NewUser;
use schooldesk::rate_limit::LoginThrottle;
use schooldesk::repo::Repo;
use schooldesk::{config as routes, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping schooldesk");
    let cfg = Config::from_env()?;
    info!(env = %cfg.app_env, port = cfg.port, "configuration loaded");

    let repo = build_repo(&cfg).await?;
    seed_admin(repo.as_ref(), &cfg).await?;

    let state = AppState::new(repo, JwtKeys::new(cfg.jwt_secret.as_bytes(), chrono::Duration::hours(cfg.token_ttl_hours)))
        .with_password_cost(cfg.bcrypt_cost)
        .with_login_throttle(LoginThrottle::new(cfg.login_throttle.clone()));
    let frontend_url = cfg.frontend_url.clone();

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                // local dev frontends
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                .allowed_origin("http://localhost:3000")
                .allowed_origin("http://127.0.0.1:3000")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            if let Some(front) = &frontend_url {
                c = c.allowed_origin(front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(routes)
    })
    .bind(("0.0.0.0", cfg.port))
    .with_context(|| format!("binding port {}", cfg.port))?;

    info!("Listening on http://0.0.0.0:{}", cfg.port);
    server.run().await.context("http server")
}

#[cfg(feature = "postgres-store")]
async fn connect_postgres(url: &str) -> anyhow::Result<Arc<dyn Repo>> {
    use schooldesk::repo::pg::PgRepo;
    use sqlx::postgres::PgPoolOptions;

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await.context("connecting to PostgreSQL")?;
    let repo = PgRepo::new(pool);
    repo.migrate().await?;
    info!("Using Postgres repository backend");
    Ok(Arc::new(repo))
}

/// PostgreSQL when a database is configured, otherwise the in-memory store.
async fn build_repo(cfg: &Config) -> anyhow::Result<Arc<dyn Repo>> {
    #[cfg(feature = "postgres-store")]
    if let Some(url) = cfg.database_url.as_deref() {
        return connect_postgres(url).await;
    }
    in_memory(cfg)
}

#[cfg(feature = "inmem-store")]
fn in_memory(cfg: &Config) -> anyhow::Result<Arc<dyn Repo>> {
    if cfg.is_production() {
        warn!("no database configured, data will not survive a restart");
    }
    info!("Using in-memory repository backend");
    Ok(Arc::new(schooldesk::repo::inmem::InMemRepo::new()))
}

#[cfg(not(feature = "inmem-store"))]
fn in_memory(_cfg: &Config) -> anyhow::Result<Arc<dyn Repo>> {
    anyhow::bail!("DATABASE_URL or DB_HOST must be set")
}

/// Creates the first admin account when none exists.
async fn seed_admin(repo: &dyn Repo, cfg: &Config) -> anyhow::Result<()> {
    if repo.count_users_with_role(Role::Admin).await? > 0 {
        return Ok(());
    }
    let password_hash = hash_password(&cfg.admin_seed_password, cfg.bcrypt_cost)
        .map_err(|e| anyhow::anyhow!("hashing seed password: {e}"))?;
    let admin = repo
        .create_user(NewUser {
            username: cfg.admin_seed_username.clone(),
            password_hash,
            role: Role::Admin,
            teacher_id: None,
            email: String::new(),
            phone: String::new(),
            force_password_change: true,
        })
        .await?;
    warn!(username = %admin.username, "seeded initial admin account; change its password");
    Ok(())
}
