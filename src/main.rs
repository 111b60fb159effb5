use std::{future::IntoFuture, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{Result, eyre::WrapErr};
use openedge_connector::{
    adapters::{HttpHandler, InMemoryBackend, InMemoryCache, router},
    config::{DEFAULT_CONFIG_TOML, ServerConfig, ServerConfigValidator, load_config},
    core::{ChecksumService, ConnectionPool, ParameterService, build_executor},
    metrics,
    ports::ParameterValue,
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the connector (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let Args { command, config } = Args::parse();

    match command.unwrap_or(Commands::Serve { config }) {
        Commands::Validate { config } => validate_config_command(&config).await,
        Commands::Init { config } => init_config_command(&config).await,
        Commands::Serve { config } => serve(&config).await,
    }
}

/// Backend used when no OpenEdge client library is linked in. Serves a
/// single diagnostic procedure.
fn diagnostic_backend() -> InMemoryBackend {
    let backend = InMemoryBackend::new();
    backend.register("ping.p", |parameters, context| {
        if parameters.output_parameter(1).is_some() {
            parameters.set_output(
                1,
                ParameterValue::Text(format!("pong from {}", context.endpoint())),
            )?;
        }
        Ok(())
    });
    backend
}

async fn serve(config_path: &str) -> Result<()> {
    let config: ServerConfig = load_config(config_path)
        .await
        .wrap_err_with(|| format!("Failed to load config from {config_path}"))?;
    ServerConfigValidator::validate(&config).wrap_err("Invalid configuration")?;

    tracing_setup::init_tracing_with_config(
        &config.logging.level,
        config.logging.json,
        config.logging.spans,
    )?;
    metrics::init_metrics()?;

    tracing::info!(
        config = %config_path,
        app_servers = config.openedge.app_servers.len(),
        max_connections = config.openedge.max_connections,
        "Configuration loaded"
    );
    tracing::warn!("No OpenEdge client library linked, serving the in-memory diagnostic backend");

    let pool = Arc::new(ConnectionPool::new(config.openedge.max_connections));
    let executor = build_executor(
        &config,
        Arc::new(diagnostic_backend()),
        Arc::clone(&pool),
        Arc::new(InMemoryCache::new(config.cache.max_entries)),
    );
    let handler = Arc::new(HttpHandler::new(
        executor,
        ParameterService::new(ChecksumService::new()),
        Arc::clone(&pool),
    ));
    let app = router(handler);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(listen_addr = %config.listen_addr, "Listening for procedure requests");

    let shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        let fatal = pool.fatal_token();
        tokio::spawn(async move {
            shutdown.run_signal_handler(fatal).await;
        });
    }

    let server = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = Arc::clone(&shutdown);
        async move {
            shutdown.wait_for_shutdown_signal().await;
        }
    });
    let drain_deadline = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            shutdown.wait_for_shutdown_signal().await;
            tokio::time::sleep(shutdown.drain_timeout()).await;
        }
    };

    tokio::select! {
        result = server.into_future() => result.wrap_err("Server error")?,
        _ = drain_deadline => {
            tracing::warn!("In-flight requests did not drain in time, forcing shutdown");
        }
    }

    let closed = pool.close_all().await;
    tracing::info!(closed_connections = closed, "Connection pool closed");

    if shutdown.is_shutdown_initiated() {
        let reason = shutdown.wait_for_shutdown_signal().await;
        if reason.exit_code() != 0 {
            tracing::error!(?reason, "Exiting with failure, restart required");
            std::process::exit(reason.exit_code());
        }
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            let mut app_servers: Vec<&String> = config.openedge.app_servers.keys().collect();
            app_servers.sort();

            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Max Connections: {}", config.openedge.max_connections);
            println!(
                "   • App Servers: {}",
                app_servers
                    .iter()
                    .map(|id| id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!(
                "   • Response Cache: {}",
                if config.cache.enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Define an app server named 'default' under [openedge.app_servers]");
            println!("   • Keep app server ids to letters, digits, '_' and '-'");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG_TOML)
        .await
        .wrap_err("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'openedge-connector serve --config {config_path}' to start the connector");
    Ok(())
}
