use anyhow::Result;
use appmanager::{AppManager, ManagerConfig, MarkerFileHandler};
use clap::Parser;
use std::collections::BTreeSet;
use tokio::runtime::Handle;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "appmanager")]
#[command(about = "Application lifecycle manager")]
#[command(version)]
#[command(long_about = "Resolves, installs, starts, stops and removes the applications listed \
in its configuration, sequencing concurrent lifecycle requests per application. Applications \
that are not present yet are watched for and started once they appear.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "appmanager.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting applications")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - configure but don't start applications
    #[arg(long, help = "Perform dry run - configure applications but don't start them")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting application manager v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match ManagerConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    match config.validate() {
        Ok(()) if args.validate_config => {
            info!("Configuration validation successful");
            println!("✓ Configuration is valid");
            return Ok(());
        }
        Ok(()) => {}
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            eprintln!("✗ Configuration validation failed: {}", e);
            std::process::exit(1);
        }
    }

    let app_types: BTreeSet<String> = config
        .applications
        .iter()
        .map(|app| app.app_type().to_string())
        .collect();

    let mut manager = AppManager::new(config).await.map_err(|e| {
        error!("Failed to create application manager: {}", e);
        e
    })?;

    let handler = MarkerFileHandler::new(Handle::current());
    for app_type in &app_types {
        manager.register_handler(app_type, handler.clone());
    }

    manager.initialize().map_err(|e| {
        error!("Failed to configure applications: {}", e);
        e
    })?;

    if args.dry_run {
        info!("Dry run mode - applications configured but not started");
        for summary in manager.summaries() {
            println!("{} [{}] {}", summary.pid, summary.state, summary.name.unwrap_or_default());
        }
        let exit_code = manager.shutdown().await?;
        println!("✓ Dry run completed successfully - all applications configured");
        std::process::exit(exit_code);
    }

    manager.start_applications();

    let exit_code = manager.run().await.map_err(|e| {
        error!("Application manager error during execution: {}", e);
        e
    })?;

    info!("Application manager exited with code: {}", exit_code);

    // Non-zero when any application failed to shut down cleanly
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("appmanager={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Application manager configuration file");
    println!("# Applications are listed as [[applications]] tables with pid, name, location and type");
    println!();
    println!("{}", ManagerConfig::default().to_toml()?);
    Ok(())
}
