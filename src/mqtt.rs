use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config;
use crate::messages::{DeviceAnnouncement, Presence, ScanRequest};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Error, Debug)]
pub enum AnnounceError {
    #[error("encoding device message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publishing device message: {0}")]
    Publish(#[from] rumqttc::ClientError),
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage<'a> {
    name: &'a str,
    #[serde(rename = "id")]
    mac_address: String,
    state: Presence,
    source: &'a str,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "arp-presence".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "presence".to_string()),
            },
            eventloop,
        )
    }

    fn refresh_topic(&self) -> String {
        format!("{}/scan/refresh", self.topic_path)
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![SubscribeFilter::new(
                self.refresh_topic(),
                QoS::AtMostOnce,
            )])
            .await?;

        Ok(())
    }

    /// Forwards refresh requests received over MQTT to the tracker.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<ScanRequest>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        if p.topic == self.refresh_topic() {
                            if let Err(err) = tx.send(ScanRequest::Refresh) {
                                error!("Error requesting scan: {:?}", err);
                            }
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn announce_device(
        &self,
        announcement: &DeviceAnnouncement,
        source: &str,
    ) -> Result<(), AnnounceError> {
        info!(
            "Announcing {} ({}) as {:?} on MQTT",
            announcement.name, announcement.mac_address, announcement.presence
        );
        let payload = device_payload(announcement, source)?;
        self.client
            .publish(
                self.device_topic(&announcement.name),
                QoS::AtMostOnce,
                false,
                payload,
            )
            .await?;
        Ok(())
    }

    fn device_topic(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(name)
        )
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn device_payload(
    announcement: &DeviceAnnouncement,
    source: &str,
) -> Result<String, serde_json::Error> {
    let message = DeviceMqttMessage {
        name: &announcement.name,
        mac_address: announcement.mac_address.to_string(),
        state: announcement.presence,
        source,
    };
    serde_json::to_string(&message)
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Device 123";
        let sanitized = sanitize_name(name);
        assert_eq!(sanitized, "test_s_device_123");
    }

    #[test]
    fn test_sanitize_mac_fallback_name() {
        assert_eq!(sanitize_name("AA:BB:CC:DD:EE:FF"), "aa_bb_cc_dd_ee_ff");
    }

    #[test]
    fn test_device_payload() {
        let announcement = DeviceAnnouncement {
            name: "laptop".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            presence: Presence::NotHome,
        };
        let payload: serde_json::Value =
            serde_json::from_str(&device_payload(&announcement, "192.168.1.1").unwrap()).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "name": "laptop",
                "id": "AA:BB:CC:DD:EE:FF",
                "state": "not_home",
                "source": "192.168.1.1",
            })
        );
    }

    #[tokio::test]
    async fn test_announce_device_queues_publish() {
        let (client, _eventloop) = MqttClient::new(&config::MqttConfig {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            publisher_id: None,
            topic_path: None,
            keep_alive_seconds: None,
        });
        let announcement = DeviceAnnouncement {
            name: "laptop".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            presence: Presence::Home,
        };
        assert!(client.announce_device(&announcement, "192.168.1.1").await.is_ok());
    }

    #[test]
    fn test_device_topic() {
        let config = config::MqttConfig {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            publisher_id: Some("gateway".to_string()),
            topic_path: None,
            keep_alive_seconds: None,
        };
        let (client, _eventloop) = MqttClient::new(&config);
        assert_eq!(client.device_topic("Laptop"), "presence/gateway/laptop");
        assert_eq!(client.refresh_topic(), "presence/scan/refresh");
    }
}
