use tracing_subscriber::EnvFilter;

fn usage() -> ! {
    eprintln!("Usage: switchboard serve [--config <path>]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else { usage() };
    if command != "serve" {
        usage();
    }

    let mut config_path = "./config/example-config.yaml".to_string();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = path,
                None => usage(),
            },
            _ => usage(),
        }
    }

    let cfg = match switchboard_config::load_and_validate(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load config {config_path}: {err}");
            std::process::exit(1);
        }
    };
    tracing::info!(config = %config_path, store = %cfg.store.kind, "configuration loaded");

    if let Err(err) = switchboard_server::serve(cfg).await {
        eprintln!("server exited: {err}");
        std::process::exit(1);
    }
}
