//! EvoForge server binary.
//!
//! Reads configuration from the environment, wires the oracle client, and
//! serves the control plane until interrupted.
//!
//! Exit codes: 0 on normal shutdown, 1 on user/configuration error, 2 when
//! no oracle credential is available, 130 when terminated by a signal.

use evoforge::clients::openai::OpenAiCompatClient;
use evoforge::config::EvoForgeConfig;
use evoforge::server;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = EvoForgeConfig::from_env();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();

    let api_key = match config.api_key.clone() {
        Some(key) => key,
        None => {
            log::error!("ORACLE_API_KEY is not set; the swarm has no oracle to consult");
            std::process::exit(2);
        }
    };
    let oracle = Arc::new(OpenAiCompatClient::new(api_key).with_base_url(config.base_url.clone()));

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("interrupt received, shutting down");
        flag.store(true, Ordering::SeqCst);
    };

    match server::serve(config, oracle, shutdown).await {
        Ok(()) => {
            if interrupted.load(Ordering::SeqCst) {
                std::process::exit(130);
            }
        }
        Err(err) => {
            log::error!("server error: {}", err);
            std::process::exit(1);
        }
    }
}
