use super::frame::MacAddr;
use super::pool::DEFAULT_BUF_SIZE;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// How queues map onto NIC ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NicMode {
    /// One port, `queues` RX/TX queue pairs sharing one receive pool.
    #[default]
    Server,
    /// `queues` ports with a single queue pair and a private pool each.
    Client,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NicConfig {
    /// Device driver. `memory` selects the in-process software port.
    pub driver: String,

    pub mode: NicMode,

    /// Queue count in server mode, port count in client mode.
    /// Must equal `netio.workers`.
    pub queues: u16,

    /// Requested RX ring size; clamped to device limits.
    pub rx_descriptors: u16,

    /// Requested TX ring size; clamped to device limits.
    pub tx_descriptors: u16,

    /// Maximum frames pulled per rx_burst call.
    pub rx_burst: usize,

    /// TX staging buffer capacity per queue.
    pub tx_burst: usize,

    /// Data room of each pool buffer.
    pub buf_size: usize,

    /// Install destination-address flow rules steering traffic to queues.
    pub flow_steering: bool,

    /// Destination addresses used by flow rules; queue `i` gets
    /// `bind_addresses[i % len]`.
    pub bind_addresses: Vec<IpAddr>,

    /// Source MAC override ("aa:bb:cc:dd:ee:ff"); defaults to the port's MAC.
    pub local_mac: Option<String>,

    /// Next-hop MAC for every outbound frame (no ARP on this path).
    pub peer_mac: Option<String>,

    /// Source addresses used when the engine leaves the local address unset.
    pub local_ips: Vec<IpAddr>,

    /// Empty rx_burst polls before the worker starts sleeping.
    pub spin_polls: u32,

    /// Sleep slice once spinning gave up, in microseconds.
    pub idle_sleep_us: u64,

    /// Fail startup unless every queue/port was provisioned.
    pub require_all: bool,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            mode: NicMode::Server,
            queues: 1,
            rx_descriptors: 1024,
            tx_descriptors: 1024,
            rx_burst: 32,
            tx_burst: 32,
            buf_size: DEFAULT_BUF_SIZE,
            flow_steering: false,
            bind_addresses: Vec::new(),
            local_mac: None,
            peer_mac: None,
            local_ips: Vec::new(),
            spin_polls: 1000,
            idle_sleep_us: 50,
            require_all: true,
        }
    }
}

impl NicConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.driver.is_empty() {
            errors.push("nic.driver cannot be empty".to_string());
        }

        if self.queues == 0 {
            errors.push("nic.queues must be at least 1".to_string());
        }

        if self.rx_descriptors == 0 || self.tx_descriptors == 0 {
            errors.push("nic.rx_descriptors and nic.tx_descriptors must be > 0".to_string());
        }

        if self.rx_burst == 0 || self.tx_burst == 0 {
            errors.push("nic.rx_burst and nic.tx_burst must be > 0".to_string());
        }

        if self.buf_size < 128 {
            errors.push(format!(
                "nic.buf_size must be at least 128 bytes (got {})",
                self.buf_size
            ));
        }

        if self.flow_steering && self.bind_addresses.is_empty() {
            errors.push("nic.flow_steering requires at least one bind address".to_string());
        }

        for (field, value) in [("local_mac", &self.local_mac), ("peer_mac", &self.peer_mac)] {
            if let Some(mac) = value {
                if parse_mac(mac).is_none() {
                    errors.push(format!("nic.{} is not a valid MAC address: {}", field, mac));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn peer_mac_addr(&self) -> MacAddr {
        self.peer_mac
            .as_deref()
            .and_then(parse_mac)
            .unwrap_or([0xff; 6])
    }

    pub fn local_mac_addr(&self) -> Option<MacAddr> {
        self.local_mac.as_deref().and_then(parse_mac)
    }
}

/// Parse a colon- or dash-separated MAC address.
pub fn parse_mac(s: &str) -> Option<MacAddr> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(|c| c == ':' || c == '-');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("02:00:5e:10:00:ff"),
            Some([0x02, 0x00, 0x5e, 0x10, 0x00, 0xff])
        );
        assert_eq!(parse_mac("02-00-5e-10-00-01").map(|m| m[5]), Some(1));
        assert!(parse_mac("02:00:5e:10:00").is_none());
        assert!(parse_mac("02:00:5e:10:00:01:02").is_none());
        assert!(parse_mac("zz:00:5e:10:00:01").is_none());
    }

    #[test]
    fn test_flow_steering_needs_addresses() {
        let config = NicConfig {
            flow_steering: true,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("bind address")));
    }

    #[test]
    fn test_peer_mac_defaults_to_broadcast() {
        assert_eq!(NicConfig::default().peer_mac_addr(), [0xff; 6]);
    }
}
