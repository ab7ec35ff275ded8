use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info};
use mac_address::MacAddress;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::messages::{DeviceAnnouncement, Presence, ScanRequest};
use crate::mqtt::MqttClient;
use crate::scanner::DeviceScanner;

/// Turns successive scans into arrival and departure announcements.
pub struct Manager<S> {
    scanner: S,
    mqtt_client: MqttClient,
    source: String,
    poll_interval: Duration,
    /// Devices announced as home, with the name they were announced under.
    home: HashMap<MacAddress, String>,
}

/// Compares the last announced set against a fresh scan. Departures keep the
/// name they were announced with since the scanner no longer knows them.
fn diff_presence<S: DeviceScanner>(
    home: &HashMap<MacAddress, String>,
    present: &[MacAddress],
    scanner: &S,
) -> Vec<DeviceAnnouncement> {
    let mut announcements = Vec::new();

    for mac in present {
        if !home.contains_key(mac) {
            let name = scanner
                .get_device_name(mac)
                .unwrap_or_else(|| mac.to_string());
            announcements.push(DeviceAnnouncement {
                name,
                mac_address: *mac,
                presence: Presence::Home,
            });
        }
    }

    let mut departed: Vec<(&MacAddress, &String)> = home
        .iter()
        .filter(|(mac, _)| !present.contains(mac))
        .collect();
    departed.sort_by_key(|(mac, _)| mac.bytes());
    for (mac, name) in departed {
        announcements.push(DeviceAnnouncement {
            name: name.clone(),
            mac_address: *mac,
            presence: Presence::NotHome,
        });
    }

    announcements
}

impl<S: DeviceScanner> Manager<S> {
    pub fn new(
        scanner: S,
        mqtt_client: MqttClient,
        source: String,
        poll_interval: Duration,
    ) -> Self {
        Manager {
            scanner,
            mqtt_client,
            source,
            poll_interval,
            home: HashMap::new(),
        }
    }

    async fn poll(&mut self) {
        let present = self.scanner.scan_devices().await;
        debug!("{} devices home", present.len());

        for announcement in diff_presence(&self.home, &present, &self.scanner) {
            if let Err(err) = self
                .mqtt_client
                .announce_device(&announcement, &self.source)
                .await
            {
                error!("Error announcing {}: {:?}", announcement.name, err);
                continue;
            }
            // Only record what was announced so failed publishes retry next poll.
            match announcement.presence {
                Presence::Home => {
                    self.home
                        .insert(announcement.mac_address, announcement.name);
                }
                Presence::NotHome => {
                    self.home.remove(&announcement.mac_address);
                }
            }
        }
    }

    /// Polls until `shutdown` resolves or the request channel closes. The
    /// shutdown future lives across iterations so it also fires during a poll.
    pub async fn run_loop<F: Future>(
        mut self,
        mut rx: broadcast::Receiver<ScanRequest>,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => self.poll().await,
                msg = rx.recv() => match msg {
                    Ok(ScanRequest::Refresh) => {
                        info!("Received scan request");
                        self.poll().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        debug!("Scan requests lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Scan request channel closed");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        self.mqtt_client.disconnect().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use super::*;
    use crate::config;

    struct FixedScanner {
        names: HashMap<MacAddress, String>,
    }

    impl DeviceScanner for FixedScanner {
        async fn scan_devices(&self) -> Vec<MacAddress> {
            self.names.keys().copied().collect()
        }

        fn get_device_name(&self, device: &MacAddress) -> Option<String> {
            self.names.get(device).cloned()
        }
    }

    fn mac(s: &str) -> MacAddress {
        MacAddress::from_str(s).unwrap()
    }

    /// Requests shutdown from inside its first scan.
    struct StoppingScanner {
        stop: Mutex<Option<oneshot::Sender<()>>>,
    }

    impl DeviceScanner for StoppingScanner {
        async fn scan_devices(&self) -> Vec<MacAddress> {
            if let Some(stop) = self.stop.lock().unwrap().take() {
                let _ = stop.send(());
            }
            Vec::new()
        }

        fn get_device_name(&self, _device: &MacAddress) -> Option<String> {
            None
        }
    }

    fn mqtt_config() -> config::MqttConfig {
        config::MqttConfig {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            publisher_id: None,
            topic_path: None,
            keep_alive_seconds: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_poll_stops_the_loop() {
        let (stop_tx, stop_rx) = oneshot::channel();
        let scanner = StoppingScanner {
            stop: Mutex::new(Some(stop_tx)),
        };
        let (mqtt_client, _eventloop) = MqttClient::new(&mqtt_config());
        let (_tx, rx) = broadcast::channel(10);
        let manager = Manager::new(
            scanner,
            mqtt_client,
            "192.168.1.1".to_string(),
            Duration::from_secs(3600),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(60),
            manager.run_loop(rx, async {
                let _ = stop_rx.await;
            }),
        )
        .await
        .expect("run_loop ignored the shutdown request");
        assert!(result.is_ok());
    }

    #[test]
    fn test_arrivals_and_departures() {
        let laptop = mac("aa:bb:cc:dd:ee:01");
        let phone = mac("aa:bb:cc:dd:ee:02");
        let scanner = FixedScanner {
            names: HashMap::from([(laptop, "laptop".to_string())]),
        };
        let home = HashMap::from([(phone, "phone".to_string())]);

        let announcements = diff_presence(&home, &[laptop], &scanner);
        assert_eq!(
            announcements,
            vec![
                DeviceAnnouncement {
                    name: "laptop".to_string(),
                    mac_address: laptop,
                    presence: Presence::Home,
                },
                DeviceAnnouncement {
                    name: "phone".to_string(),
                    mac_address: phone,
                    presence: Presence::NotHome,
                },
            ]
        );
    }

    #[test]
    fn test_unchanged_devices_not_reannounced() {
        let laptop = mac("aa:bb:cc:dd:ee:01");
        let scanner = FixedScanner {
            names: HashMap::from([(laptop, "laptop".to_string())]),
        };
        let home = HashMap::from([(laptop, "laptop".to_string())]);
        assert!(diff_presence(&home, &[laptop], &scanner).is_empty());
    }

    #[test]
    fn test_unnamed_device_announced_by_mac() {
        let unknown = mac("aa:bb:cc:dd:ee:03");
        let scanner = FixedScanner {
            names: HashMap::new(),
        };
        let announcements = diff_presence(&HashMap::new(), &[unknown], &scanner);
        assert_eq!(announcements[0].name, unknown.to_string());
    }
}
