mod config;

use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
enum CliCommand {
    /// Run the gateway until SIGINT or SIGTERM
    Serve(ConfigArgs),
    /// Load and validate a config file, then exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, default_value = "config.yaml")]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid gateway config: {0}")]
    Validation(#[from] gateway::config::ValidationError),
    #[error("invalid sentry dsn: {0}")]
    SentryDsn(String),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Gateway(#[from] gateway::GatewayError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match &cli {
        CliCommand::Serve(args) => serve(&args.config_file),
        CliCommand::CheckConfig(args) => check_config(&args.config_file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    config.gateway.validate()?;
    println!("{}: ok", path.display());
    Ok(())
}

fn serve(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    let _sentry = init_logging(config.common.logging.as_ref())?;
    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!(config = %path.display(), "starting tenant-router");
    let report = runtime.block_on(gateway::run(config.gateway, shutdown_signal()))?;
    tracing::info!(
        closed = report.closed,
        failed = report.failed.len(),
        "tenant-router stopped"
    );

    Ok(())
}

fn init_logging(
    logging: Option<&LoggingConfig>,
) -> Result<Option<sentry::ClientInitGuard>, CliError> {
    let guard = match logging {
        Some(logging) => {
            let dsn = logging
                .sentry_dsn
                .parse::<sentry::types::Dsn>()
                .map_err(|e| CliError::SentryDsn(e.to_string()))?;
            Some(sentry::init(sentry::ClientOptions {
                dsn: Some(dsn),
                release: sentry::release_name!(),
                ..Default::default()
            }))
        }
        None => None,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    Ok(guard)
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some("tenant_router"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| CliError::Metrics("a metrics recorder is already installed".into()))?;

    shared::metrics_defs::describe_all(resolver::metrics_defs::ALL_METRICS);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("could not listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("could not listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve() {
        let cli = CliCommand::try_parse_from(["tenant-router", "serve"]).unwrap();
        match cli {
            CliCommand::Serve(args) => assert_eq!(args.config_file, PathBuf::from("config.yaml")),
            CliCommand::CheckConfig(_) => panic!("expected serve"),
        }
    }

    #[test]
    fn parse_check_config() {
        let cli = CliCommand::try_parse_from([
            "tenant-router",
            "check-config",
            "--config-file",
            "/etc/tenant-router.yaml",
        ])
        .unwrap();
        match cli {
            CliCommand::CheckConfig(args) => {
                assert_eq!(args.config_file, PathBuf::from("/etc/tenant-router.yaml"))
            }
            CliCommand::Serve(_) => panic!("expected check-config"),
        }
    }

    #[test]
    fn check_config_rejects_invalid_gateway() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut tmp,
            br#"
gateway:
    listener:
        host: 0.0.0.0
        port: 3000
    admin_listener:
        host: 0.0.0.0
        port: 3000
    metadata:
        url: http://config-service.internal/
    stores:
        relational:
            default:
                uri: postgres://db.internal:5432/platform
                namespace: public
"#,
        )
        .unwrap();

        let result = check_config(tmp.path());
        assert!(matches!(result, Err(CliError::Validation(_))));
    }
}
