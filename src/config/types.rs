use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;

/// Root of a device profile
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    /// Device the policies apply to
    #[serde(rename = "device-info")]
    pub device: DeviceInfo,

    /// Standalone policies, one leaf each
    #[serde(rename = "individual-policies", default)]
    pub individual_policies: Mapping,

    /// Multi-step policies, arbitrarily nested name -> body maps
    #[serde(rename = "interaction-policies", default)]
    pub interaction_policies: Mapping,
}

/// Device metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name (used as nftables table name downstream)
    #[serde(alias = "device-name")]
    pub name: String,

    /// MAC address
    #[serde(rename = "mac-address")]
    pub mac: String,

    /// IPv4 address
    #[serde(rename = "ipv4-address", alias = "ip-address", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    /// IPv6 address
    #[serde(rename = "ipv6-address", default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

impl DeviceInfo {
    /// Create device metadata with an IPv4 address only.
    pub fn new(name: impl Into<String>, mac: impl Into<String>, ipv4: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mac: mac.into(),
            ipv4: Some(ipv4.into()),
            ipv6: None,
        }
    }

    /// Set the IPv6 address.
    pub fn with_ipv6(mut self, ipv6: impl Into<String>) -> Self {
        self.ipv6 = Some(ipv6.into());
        self
    }
}

/// Which profile section a top-level policy comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Individual,
    Interaction,
}
