use std::process;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fleetplane::cli::{
    check, format_validation_result, resolve_settings_path, serve, Cli, Commands,
};
use fleetplane::config::load_settings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    match cli.command {
        Commands::Check(args) => {
            let path = match resolve_settings_path(args.settings.as_deref()) {
                Ok(path) => path,
                Err(e) => {
                    error!("{}", e);
                    process::exit(1);
                }
            };
            let result = check(&path);
            print!("{}", format_validation_result(&result, &path.display().to_string()));
            if !result.valid {
                process::exit(1);
            }
        }
        Commands::Serve(args) => {
            let settings = resolve_settings_path(args.settings.as_deref())
                .and_then(|path| Ok(load_settings(&path)?));
            let mut settings = match settings {
                Ok(settings) => settings,
                Err(e) => {
                    error!("Failed to load settings: {}", e);
                    process::exit(1);
                }
            };
            if let Some(workers) = args.workers {
                settings = settings.with_dispatch_workers(workers);
            }
            if let Err(e) = serve(settings).await {
                error!("Serve failed: {}", e);
                process::exit(1);
            }
        }
    }
}
