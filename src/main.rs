use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use permdump::addon::permission::PermissionRecorder;
use permdump::addon::{AddonManager, EventLog};
use permdump::cli::{CaptureArgs, Cli, Commands, InspectFormat};
use permdump::config::{AppConfig, Verbosity, DEFAULT_CONFIG_FILE};
use permdump::logging;
use permdump::proxy::tls::{CertificateManager, UpstreamConnector};
use permdump::proxy::ProxyServer;
use permdump::replay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Capture(args) => {
            cmd_capture(config_path, args).await?;
        }
        Commands::Ca { pem } => {
            logging::init(Verbosity::default());
            cmd_ca(config_path, pem)?;
        }
        Commands::Inspect { file, format } => {
            logging::init(Verbosity::default());
            cmd_inspect(&file, format)?;
        }
        Commands::Init => {
            cmd_init(config_path)?;
        }
    }

    Ok(())
}

async fn cmd_capture(config_path: Option<&Path>, args: CaptureArgs) -> anyhow::Result<()> {
    let config = args.load_config(config_path)?;
    logging::init(config.log.verbosity);

    let recorder = Arc::new(PermissionRecorder::new(config.capture.clone()));
    let mut addons = AddonManager::new();
    addons.add(Arc::new(EventLog));
    addons.add(recorder.clone());
    let addons = Arc::new(addons);

    addons.running()?;

    let result = run(&config, args.rfile.as_deref(), addons.clone()).await;
    addons.done();
    result?;

    let summary = recorder.summary();
    println!(
        "Recorded {} permission failure(s), skipped {} duplicate(s)",
        summary.recorded, summary.duplicates_skipped
    );
    Ok(())
}

async fn run(
    config: &AppConfig,
    rfile: Option<&Path>,
    addons: Arc<AddonManager>,
) -> anyhow::Result<()> {
    if let Some(rfile) = rfile {
        let count = replay::replay_file(rfile, &addons)?;
        println!("Replayed {} flow(s) from {}", count, rfile.display());
    }

    if !config.proxy.server {
        return Ok(());
    }

    let mut server = ProxyServer::new(config.proxy.listen_addr())
        .with_addons(addons)
        .with_upstream(UpstreamConnector::new(config.proxy.ssl_insecure)?)
        .with_connect_timeout(Duration::from_secs(config.proxy.connect_timeout_secs));
    if config.proxy.intercept_tls {
        let certificates = CertificateManager::load_or_create(&config.proxy.confdir)?;
        println!("CA certificate: {}", certificates.ca_cert_path().display());
        server = server.with_certificates(Arc::new(certificates));
    }

    let addr = server.start().await?;
    println!("Proxy running on {}", addr);
    println!("Set HTTPS_PROXY=http://{} to route vSphere API traffic through permdump", addr);

    // Keep running until interrupted
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    Ok(())
}

fn cmd_ca(config_path: Option<&Path>, pem: bool) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)?;
    let certificates = CertificateManager::load_or_create(&config.proxy.confdir)?;
    if pem {
        print!("{}", certificates.ca_cert_pem());
    } else {
        println!("{}", certificates.ca_cert_path().display());
    }
    Ok(())
}

fn cmd_inspect(file: &Path, format: InspectFormat) -> anyhow::Result<()> {
    let failures = replay::collect_failures(file)?;

    match format {
        InspectFormat::Csv => {
            print!("{}", logging::csv::to_csv_string(&failures)?);
        }
        InspectFormat::Table => {
            if failures.is_empty() {
                println!("No permission failures found.");
                return Ok(());
            }
            println!(
                "{:<30} {:<24} {:<24} {}",
                "USER AGENT", "OBJECT TYPE", "OBJECT NAME", "PRIVILEGE MISSING"
            );
            println!("{}", "─".repeat(110));
            for failure in &failures {
                println!(
                    "{:<30} {:<24} {:<24} {}",
                    failure.user_agent,
                    failure.object_type.as_deref().unwrap_or("-"),
                    failure.object_name.as_deref().unwrap_or("-"),
                    failure.privilege_missing.as_deref().unwrap_or("-"),
                );
            }
            println!("\n{} failure(s)", failures.len());
        }
    }
    Ok(())
}

fn cmd_init(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        return Ok(());
    }

    std::fs::write(&config_path, include_str!("../templates/permdump.toml"))?;
    println!("Created config: {}", config_path.display());
    println!("\nNext steps:");
    println!("  1. Start capturing: permdump capture --set vs_dump_csv=failures.csv");
    println!("  2. Trust the CA:    permdump ca --pem > permdump-ca.pem");
    println!("  3. Route traffic:   HTTPS_PROXY=http://127.0.0.1:8080");
    Ok(())
}
