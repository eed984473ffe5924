use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use structopt::StructOpt;
use tower_http::trace::TraceLayer;

mod db;
mod error;
mod extractors;
mod feeds;
mod handlers;

use error::Error;
use extractors::AppState;
use feeds::CommentFeeds;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, StructOpt)]
#[structopt(name = "luma-server", about = "Comment sections and their live feeds")]
struct Opt {
    /// Postgres database holding comments and sessions
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    #[structopt(long, env = "LUMA_LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("Error opening database {:?}", db_url))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/whoami", get(handlers::whoami))
        .route("/api/list-comments/:entity", get(handlers::list_comments))
        .route("/api/fetch-comment/:id", get(handlers::fetch_comment))
        .route("/api/my-comments", get(handlers::list_my_comments))
        .route("/api/create-comment", post(handlers::create_comment))
        .route("/api/edit-comment", post(handlers::edit_comment))
        .route("/api/remove-comments", post(handlers::remove_comments))
        .route("/api/remove-thread", post(handlers::remove_thread))
        .route("/ws/comment-feed/:entity", get(handlers::comment_feed))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = Opt::from_args();

    let pool = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&mut *pool.acquire().await.context("getting migrator connection")?)
        .await
        .context("applying migrations")?;

    let state = AppState {
        backend: Arc::new(db::PgBackend::new(pool.clone())),
        sessions: Arc::new(db::PgSessions(pool)),
    };

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app(state).into_make_service())
        .await
        .context("serving axum webserver")
}
