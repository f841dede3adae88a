use std::env;

use engage_config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: engage serve [--config <path>]");
        std::process::exit(2);
    }

    let mut config_path: Option<String> = None;
    while let Some(arg) = args.next() {
        if arg == "--config" {
            match args.next() {
                Some(v) => config_path = Some(v),
                None => {
                    eprintln!("--config requires a path");
                    std::process::exit(2);
                }
            }
        }
    }

    let loaded = match &config_path {
        Some(path) => engage_config::load_and_validate(path),
        None => engage_config::load_from_env(),
    };
    let cfg = match loaded {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);

    if let Err(e) = engage_server::serve(cfg).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins over `logging.level` when set.
fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
