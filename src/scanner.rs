use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use mac_address::MacAddress;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::arp::{ArpParser, ScanTable};
use crate::session::{Connector, SessionDriver, SessionError};

pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_COMMAND: &str = "arp";

/// What a device tracker needs from a presence source.
pub trait DeviceScanner {
    /// Refreshes if due and returns the devices currently home.
    fn scan_devices(&self) -> impl Future<Output = Vec<MacAddress>> + Send;

    fn get_device_name(&self, device: &MacAddress) -> Option<String>;
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("command output contained no ARP entries")]
    ParseYieldedNothing,
}

#[derive(Debug, Default)]
struct Throttle {
    last_attempt: Option<Instant>,
    last_success: bool,
}

/// Polls a router's ARP table over SSH, at most once per refresh interval.
///
/// Queries always read the table of the last successful scan; a failed scan
/// leaves it untouched.
pub struct ArpScanner<C> {
    driver: SessionDriver<C>,
    parser: ArpParser,
    command: String,
    min_refresh_interval: Duration,
    table: ArcSwap<ScanTable>,
    throttle: Mutex<Throttle>,
    initial_health: bool,
}

impl<C: Connector> ArpScanner<C> {
    /// Creates the scanner and runs the first scan straight away.
    pub async fn new(
        driver: SessionDriver<C>,
        parser: ArpParser,
        command: impl Into<String>,
        min_refresh_interval: Duration,
    ) -> Self {
        let mut scanner = ArpScanner {
            driver,
            parser,
            command: command.into(),
            min_refresh_interval,
            table: ArcSwap::from_pointee(ScanTable::default()),
            throttle: Mutex::new(Throttle::default()),
            initial_health: false,
        };
        scanner.initial_health = scanner.refresh().await;
        if !scanner.initial_health {
            warn!(
                "Initial scan of {} failed, will retry on the next poll",
                scanner.driver.target().host
            );
        }
        scanner
    }

    /// Whether the scan made during construction succeeded.
    pub fn initial_health(&self) -> bool {
        self.initial_health
    }

    pub fn table(&self) -> Arc<ScanTable> {
        self.table.load_full()
    }

    /// Rescans unless the last attempt was less than the refresh interval
    /// ago, in which case the previous outcome is returned untouched.
    pub async fn refresh(&self) -> bool {
        let mut throttle = self.throttle.lock().await;
        let now = Instant::now();
        if let Some(last_attempt) = throttle.last_attempt {
            if now.duration_since(last_attempt) < self.min_refresh_interval {
                debug!("Skipping scan, last attempt {:?} ago", now - last_attempt);
                return throttle.last_success;
            }
        }
        throttle.last_attempt = Some(now);

        let host = &self.driver.target().host;
        throttle.last_success = match self.scan().await {
            Ok(table) => {
                info!("Found {} devices on {}", table.len(), host);
                self.table.store(Arc::new(table));
                true
            }
            Err(err) => {
                error!("Scanning {host} failed: {err}");
                false
            }
        };
        throttle.last_success
    }

    async fn scan(&self) -> Result<ScanTable, ScanError> {
        let raw = self.driver.run_command(&self.command).await?;
        debug!("Raw output of {:?}: {:?}", self.command, raw);

        let table = self.parser.parse(&raw);
        if table.is_empty() {
            return Err(ScanError::ParseYieldedNothing);
        }
        Ok(table)
    }

    pub async fn list_present_devices(&self) -> Vec<MacAddress> {
        self.refresh().await;
        self.table.load().present_devices()
    }

    pub fn get_device_name(&self, device: &MacAddress) -> Option<String> {
        self.table
            .load()
            .get(device)
            .map(|record| record.hostname.clone())
    }
}

impl<C: Connector> DeviceScanner for ArpScanner<C> {
    async fn scan_devices(&self) -> Vec<MacAddress> {
        self.list_present_devices().await
    }

    fn get_device_name(&self, device: &MacAddress) -> Option<String> {
        ArpScanner::get_device_name(self, device)
    }
}
