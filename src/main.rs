mod config;
mod gemini;
mod handlers;
mod health;
mod session;
mod stager;

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::prelude::*;

use config::Config;
use gemini::GeminiClient;
use handlers::{AppState, Command};
use session::SessionStore;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gemrelay.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("gemrelay.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting gemrelay...");
    info!("Loaded config from {config_path}");
    info!("Model: {}", config.model);

    health::spawn(config.port);

    let bot = Bot::new(&config.telegram_bot_token);
    let gemini = GeminiClient::new(
        config.gemini_api_key.clone(),
        config.model.clone(),
        config.temperature,
        handlers::SYSTEM_PROMPT,
    );
    let state = Arc::new(AppState {
        gemini,
        sessions: SessionStore::new(),
    });

    let handler = Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handlers::handle_command),
        )
        .branch(dptree::endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
