#[macro_use]
extern crate diesel;

use std::io;

use actix_web::{middleware, web, App, HttpServer};
use chrono::Utc;

mod actions;
mod auth;
mod capacity;
mod config;
mod error;
mod memory;
mod models;
mod provisioning;
mod queue;
mod routes;
mod schema;
mod service;
mod store;
mod views;

use config::Config;
use routes::AppState;
use service::Registry;
use store::Store;

fn io_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env().map_err(io_error)?;

    match config.database_url.as_deref() {
        Some(url) => {
            // initialize DB pool outside of `HttpServer::new` so that it is shared
            // across all workers
            let pool = actions::initialize_db_pool(
                url,
                config.db_pool_size,
                config.db_connect_timeout,
                config.transaction_timeout,
            )
            .map_err(io_error)?;
            let store = actions::PgStore::new(pool, config.transaction_timeout);
            run_server(store, config).await
        }
        None => {
            log::warn!("DATABASE_URL is not set, keeping all state in memory");
            let store = memory::MemoryStore::with_lock_timeout(config.transaction_timeout);
            run_server(store, config).await
        }
    }
}

async fn run_server<S: Store>(store: S, config: Config) -> io::Result<()> {
    let registry = Registry::new(store);

    if let Some(admin) = &config.admin {
        let bootstrap = registry.clone();
        let admin = admin.clone();
        web::block(move || {
            bootstrap.ensure_admin(&admin.uid, &admin.email, admin.display_name, Utc::now())
        })
            .await
            .map_err(io_error)?
            .map_err(io_error)?;
    }

    let mut queue_service = queue::QueueService::new(registry.clone());
    match &config.amqp {
        Some(amqp) => {
            queue_service.initialize(amqp).await.map_err(io_error)?;
            if let Err(e) = queue_service.start_consuming_event_ends().await {
                log::error!("Failed to start event end consumer: {:?}", e);
            }
        }
        None => log::warn!("AMQP_HOST is not set, change feed and event end timers are disabled"),
    }

    let state = web::Data::new(AppState::new(registry, queue_service));

    log::info!("starting HTTP server at http://{}:{}", config.bind_addr, config.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(routes::configure::<S>)
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await
}
