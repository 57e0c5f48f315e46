//! SFU Configuration

use serde::{Deserialize, Serialize};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Capacity of each stream's keyframe-request queue; signals beyond it are dropped
    pub keyframe_queue_capacity: usize,
    /// Layer label used when the publisher sends a single, non-simulcast video track
    pub default_layer: String,
    /// Starting RTP timestamp of every viewer's rewrite clock
    pub initial_timestamp: u32,
    /// Maximum number of concurrent streams (0 = unlimited)
    pub max_streams: usize,
    /// Public addresses advertised as host candidates (NAT 1:1 mapping)
    pub nat_1to1_ips: Vec<String>,
    /// Discover this host's public IP at startup and add it to `nat_1to1_ips`
    pub include_public_ip: bool,
    /// Endpoint queried for the public IP (expects a JSON `query` field)
    pub public_ip_lookup_url: String,
    /// Restrict ICE gathering to the named network interface
    pub interface_filter: Option<String>,
    /// Single UDP port shared by every ICE agent (both directions)
    pub udp_mux_port: Option<u16>,
    /// UDP mux port for publishers, overrides `udp_mux_port`
    pub udp_mux_port_whip: Option<u16>,
    /// UDP mux port for viewers, overrides `udp_mux_port`
    pub udp_mux_port_whep: Option<u16>,
    /// Lower bound of the ephemeral ICE port range (ignored when a mux port is set)
    pub udp_port_min: Option<u16>,
    /// Upper bound of the ephemeral ICE port range
    pub udp_port_max: Option<u16>,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            keyframe_queue_capacity: 50,
            default_layer: "default".to_string(),
            initial_timestamp: 50_000,
            max_streams: 0,
            nat_1to1_ips: Vec::new(),
            include_public_ip: false,
            public_ip_lookup_url: "http://ip-api.com/json/".to_string(),
            interface_filter: None,
            udp_mux_port: None,
            udp_mux_port_whip: None,
            udp_mux_port_whep: None,
            udp_port_min: None,
            udp_port_max: None,
        }
    }
}

impl SfuConfig {
    /// UDP mux port used by publisher transports
    #[must_use]
    pub fn whip_mux_port(&self) -> Option<u16> {
        self.udp_mux_port_whip.or(self.udp_mux_port)
    }

    /// UDP mux port used by viewer transports
    #[must_use]
    pub fn whep_mux_port(&self) -> Option<u16> {
        self.udp_mux_port_whep.or(self.udp_mux_port)
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.keyframe_queue_capacity == 0 {
            errors.push("sfu.keyframe_queue_capacity must be greater than zero".to_string());
        }
        if self.default_layer.trim().is_empty() {
            errors.push("sfu.default_layer must not be empty".to_string());
        }
        match (self.udp_port_min, self.udp_port_max) {
            (Some(min), Some(max)) if min > max => {
                errors.push(format!("sfu.udp_port_min ({min}) is above sfu.udp_port_max ({max})"));
            }
            (Some(_), None) | (None, Some(_)) => {
                errors.push("sfu.udp_port_min and sfu.udp_port_max must be set together".to_string());
            }
            _ => {}
        }
        if self.include_public_ip && self.public_ip_lookup_url.is_empty() {
            errors.push("sfu.public_ip_lookup_url is required when include_public_ip is set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SfuConfig::default().validate().is_ok());
    }

    #[test]
    fn test_per_direction_mux_port_overrides_shared() {
        let config = SfuConfig {
            udp_mux_port: Some(8443),
            udp_mux_port_whep: Some(8444),
            ..Default::default()
        };
        assert_eq!(config.whip_mux_port(), Some(8443));
        assert_eq!(config.whep_mux_port(), Some(8444));
    }

    #[test]
    fn test_validate_reports_all_errors() {
        let config = SfuConfig {
            keyframe_queue_capacity: 0,
            default_layer: " ".to_string(),
            udp_port_min: Some(6000),
            udp_port_max: Some(5000),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
