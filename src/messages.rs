use mac_address::MacAddress;
use serde_derive::Serialize;

#[derive(Clone, Debug)]
pub enum ScanRequest {
    Refresh,
}

/// Presence state of a device. The ARP table only ever records `Home`;
/// `NotHome` is announced by the tracker when a device drops out of the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Home,
    NotHome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    pub name: String,
    pub mac_address: MacAddress,
    pub presence: Presence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_serializes_as_tracker_state() {
        assert_eq!(serde_json::to_string(&Presence::Home).unwrap(), "\"home\"");
        assert_eq!(
            serde_json::to_string(&Presence::NotHome).unwrap(),
            "\"not_home\""
        );
    }
}
