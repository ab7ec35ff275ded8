use std::fs;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use log::{info, warn};
use tokio::sync::broadcast;

mod arp;
mod config;
mod manager;
mod messages;
mod mqtt;
mod scanner;
mod session;
mod ssh;

use scanner::ArpScanner;
use session::SessionDriver;
use ssh::SshConnector;

/// Reports which devices are home by polling a router's ARP table over SSH.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Scan once, print the table as JSON and exit without connecting to MQTT
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ssh runs this binary as its askpass helper for password logins.
    if let Ok(password) = std::env::var(ssh::ASKPASS_ENV) {
        let prompt = std::env::args().nth(1).unwrap_or_default();
        let reply = ssh::askpass_reply(&prompt, &password)
            .with_context(|| format!("declining askpass prompt {prompt:?}"))?;
        println!("{reply}");
        return Ok(());
    }

    if std::env::var_os("RUST_LOG").is_none() {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        pretty_env_logger::init();
    }

    let cli = Cli::parse();

    let config_contents = fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)
        .with_context(|| format!("parsing {}", cli.config.display()))?;
    config.validate()?;

    let scan = config.scan();
    let driver = SessionDriver::new(
        SshConnector::default(),
        config.router.target()?,
        config.router.prompt(),
        scan.timeouts(),
    )
    .context("invalid router.prompt")?;
    let parser = arp::ArpParser::new(config.router.interface()).context("invalid router.interface")?;

    info!(
        "Scanning {}@{} for devices on {}",
        config.router.username,
        config.router.host,
        config.router.interface()
    );
    let scanner = ArpScanner::new(
        driver,
        parser,
        config.router.command(),
        scan.min_refresh_interval(),
    )
    .await;

    if cli.once {
        let table = scanner.table();
        println!("{}", serde_json::to_string_pretty(&table.records())?);
        anyhow::ensure!(scanner.initial_health(), "scan of {} failed", config.router.host);
        return Ok(());
    }

    if !scanner.initial_health() {
        warn!("Starting without an initial device table");
    }

    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let (tx, rx) = broadcast::channel(10);
    let listener = mqtt_client.clone();
    tokio::spawn(async move {
        listener.event_loop(&mut eventloop, tx).await;
    });

    let core = manager::Manager::new(
        scanner,
        mqtt_client,
        config.router.host.clone(),
        scan.poll_interval(),
    );
    core.run_loop(rx, tokio::signal::ctrl_c())
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    Ok(())
}
