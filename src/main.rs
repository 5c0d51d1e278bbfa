use std::sync::Arc;

use log::{error, info};
use warp::Filter;

use alert_room::clock::SystemClock;
use alert_room::config::Config;
use alert_room::donations::LocalGateway;
use alert_room::notify::LogNotifier;
use alert_room::{routes, App};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load();
    let addr = config.address();
    let poll_interval = config.job_poll_interval;

    let app = match App::build(config, Arc::new(SystemClock), Arc::new(LogNotifier), Arc::new(LocalGateway)).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };
    let _deletion_worker = app.scheduler.clone().spawn(poll_interval);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["authorization", "content-type"])
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE"]);
    let tls = app
        .config
        .tls_files()
        .map(|(cert, key)| (cert.to_path_buf(), key.to_path_buf()));
    let routes = routes::routes(app).with(cors).with(warp::log("alert_room"));

    match tls {
        Some((cert, key)) => {
            info!("Starting secure server (HTTPS/WSS) on {addr}...");
            warp::serve(routes).tls().cert_path(cert).key_path(key).run(addr).await;
        }
        None => {
            info!("TLS files unavailable, falling back to HTTP/WS on {addr}...");
            warp::serve(routes).run(addr).await;
        }
    }
}
