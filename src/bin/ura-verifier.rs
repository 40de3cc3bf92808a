use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{
    fmt::time::LocalTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use ura_verifier::{
    app::{self, AppStateBuilder},
    config::Config,
    crm::{BitrixClient, CrmApi},
    handler::middleware::request_log::AccessLogEventFormat,
    preflight,
    ura::Classifier,
    version,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version = version::get_short_version(),
    about = "Records on Bitrix24 deals whether the caller went through the URA",
    long_about = version::get_version_info()
)]
struct Cli {
    #[clap(
        long,
        global = true,
        help = "Path to the configuration file (TOML format)"
    )]
    conf: Option<String>,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit without starting the server
    CheckConfig,
    /// Verify a single deal, update its field and print the result
    Classify {
        /// Bitrix24 deal id
        deal_id: String,
    },
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            println!("Loading config from: {}", path);
            Config::load(path)
        }
        None => {
            println!("Loading default config");
            let mut config = Config::default();
            config.apply_env();
            Ok(config)
        }
    }
}

/// Keeps the non-blocking file writer flushing until dropped.
fn init_tracing(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }
    env_filter = env_filter.add_directive("hyper=info".parse()?);
    env_filter = env_filter.add_directive("reqwest=info".parse()?);

    let event_format = AccessLogEventFormat::new(LocalTime::rfc_3339());
    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("{}: {}", e, log_file))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(event_format)
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()?;
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().event_format(event_format))
            .try_init()?;
        Ok(None)
    }
}

fn print_issues(err: &preflight::PreflightError) {
    eprintln!("Configuration validation failed:");
    for issue in &err.issues {
        eprintln!("- {}: {}", issue.field, issue.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(cli.conf.as_deref())?;

    match cli.command {
        Some(Commands::CheckConfig) => {
            return match preflight::validate_start(&config).await {
                Ok(_) => {
                    println!("Configuration is valid; http_addr is available.");
                    Ok(())
                }
                Err(err) => {
                    print_issues(&err);
                    std::process::exit(1);
                }
            };
        }
        Some(Commands::Classify { deal_id }) => {
            let issues = preflight::validate_config(&config);
            if !issues.is_empty() {
                print_issues(&preflight::PreflightError::new(issues));
                std::process::exit(1);
            }
            let _guard = init_tracing(&config)?;
            let crm: Arc<dyn CrmApi> = Arc::new(BitrixClient::new(&config.bitrix));
            let classifier = Classifier::new(crm, &config)?;
            match classifier.classify(&deal_id).await {
                Ok(classification) => {
                    println!("{}", serde_json::to_string_pretty(&classification)?);
                    return Ok(());
                }
                Err(err) => {
                    eprintln!("{}: {}", err.status_code(), err);
                    std::process::exit(1);
                }
            }
        }
        None => {}
    }

    println!("Start at {}", Utc::now());
    println!("{}", version::get_version_info());

    if let Err(err) = preflight::validate_start(&config).await {
        print_issues(&err);
        std::process::exit(1);
    }

    let _guard = init_tracing(&config)?;

    let state = AppStateBuilder::new().config(config).build()?;
    info!("starting ura-verifier on {}", state.config.http_addr);
    let mut app_future = Box::pin(app::run(state.clone()));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm_stream = signal(SignalKind::terminate())?;
        tokio::select! {
            result = &mut app_future => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("received CTRL+C, shutting down");
                state.token.cancel();
                app_future.await?;
            }
            _ = sigterm_stream.recv() => {
                info!("received SIGTERM, shutting down");
                state.token.cancel();
                app_future.await?;
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut app_future => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("received CTRL+C, shutting down");
                state.token.cancel();
                app_future.await?;
            }
        }
    }

    Ok(())
}
