use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr as _;

use log::debug;
use mac_address::MacAddress;
use regex::Regex;
use serde_derive::Serialize;

use crate::messages::Presence;

/// Bridge interface that OpenWrt puts LAN clients on.
pub const DEFAULT_INTERFACE: &str = "br-lan";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub mac_address: MacAddress,
    pub hostname: String,
    pub ip_address: Ipv4Addr,
    pub presence: Presence,
}

/// Devices seen by one successful scan, keyed by MAC address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanTable {
    devices: HashMap<MacAddress, DeviceRecord>,
}

impl ScanTable {
    pub fn get(&self, mac_address: &MacAddress) -> Option<&DeviceRecord> {
        self.devices.get(mac_address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Addresses currently home, ordered by their bytes so repeated polls
    /// report devices in a stable order.
    pub fn present_devices(&self) -> Vec<MacAddress> {
        let mut present: Vec<MacAddress> = self
            .devices
            .values()
            .filter(|record| record.presence == Presence::Home)
            .map(|record| record.mac_address)
            .collect();
        present.sort_by_key(|mac| mac.bytes());
        present
    }

    pub fn records(&self) -> Vec<&DeviceRecord> {
        let mut records: Vec<&DeviceRecord> = self.devices.values().collect();
        records.sort_by_key(|record| record.mac_address.bytes());
        records
    }
}

/// Matches `arp` output lines of the form
/// `laptop.lan (192.168.1.20) at aa:bb:cc:dd:ee:ff [ether]  on br-lan`.
/// Only the last domain label is dropped from the hostname.
#[derive(Debug, Clone)]
pub struct ArpParser {
    pattern: Regex,
}

impl ArpParser {
    pub fn new(interface: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"(?:(?P<host>[A-Za-z0-9][A-Za-z0-9_.-]*?)(?:\.[A-Za-z0-9_-]+)?|\?) \((?P<ip>\d{{1,3}}(?:\.\d{{1,3}}){{3}})\) at (?P<mac>(?:[0-9A-Fa-f]{{2}}[:-]){{5}}[0-9A-Fa-f]{{2}}) \[[^\]]*\]\s+on {}(?:\s|$)",
            regex::escape(interface)
        ))?;
        Ok(ArpParser { pattern })
    }

    /// Builds a fresh table from raw command output. Later entries for the
    /// same address replace earlier ones.
    pub fn parse(&self, raw: &str) -> ScanTable {
        let mut devices = HashMap::new();

        for line in raw.lines() {
            for captures in self.pattern.captures_iter(line) {
                let mac_text = &captures["mac"];
                let Ok(mac_address) = MacAddress::from_str(&mac_text.replace('-', ":")) else {
                    debug!("Skipping unparseable MAC address {mac_text:?}");
                    continue;
                };
                let Ok(ip_address) = Ipv4Addr::from_str(&captures["ip"]) else {
                    debug!("Skipping invalid IPv4 address in line {line:?}");
                    continue;
                };
                // `?` leaves the host group unset.
                let hostname = captures
                    .name("host")
                    .map_or(mac_text, |host| host.as_str())
                    .to_string();

                devices.insert(
                    mac_address,
                    DeviceRecord {
                        mac_address,
                        hostname,
                        ip_address,
                        presence: Presence::Home,
                    },
                );
            }
        }

        ScanTable { devices }
    }
}
