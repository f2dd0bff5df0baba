//! Network address model for cloud instances.
//!
//! This library provides:
//! - `Address`: a single network address reported by a cloud provider
//! - Address type and network scope derivation for IP literals and hostnames
//! - Selection helpers for picking a public or internal address
//!
//! Providers report addresses as plain strings. The type is always derived
//! from the value; the scope is either supplied by the provider or derived
//! from well-known address ranges.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

// ============================================================================
// Address
// ============================================================================

/// Kind of value held by an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Ipv4,
    Ipv6,
    Hostname,
}

impl AddressType {
    /// Derive the address type from a raw value.
    pub fn derive(value: &str) -> Self {
        match value.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => Self::Ipv4,
            Ok(IpAddr::V6(_)) => Self::Ipv6,
            Err(_) => Self::Hostname,
        }
    }
}

/// Reachability of an address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkScope {
    /// Scope was not reported and cannot be derived.
    #[default]
    Unknown,

    /// Reachable from the public internet.
    Public,

    /// Reachable only from inside the cloud (private ranges, link-local).
    CloudLocal,

    /// Reachable only from the machine itself (loopback).
    MachineLocal,
}

/// A network address of a cloud instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Address value (IP literal or hostname).
    pub value: String,

    /// Address type, derived from the value.
    #[serde(rename = "type")]
    pub kind: AddressType,

    /// Provider-specific network name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,

    /// Network scope.
    #[serde(default)]
    pub scope: NetworkScope,
}

impl Address {
    /// Create an address with a derived type and unknown scope.
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let kind = AddressType::derive(&value);
        Self {
            value,
            kind,
            network_name: None,
            scope: NetworkScope::Unknown,
        }
    }

    /// Create an address with an explicit scope.
    pub fn with_scope(value: impl Into<String>, scope: NetworkScope) -> Self {
        Self {
            scope,
            ..Self::new(value)
        }
    }

    /// Create an address whose scope is derived from the value.
    pub fn with_derived_scope(value: impl Into<String>) -> Self {
        let mut address = Self::new(value);
        address.scope = address.derive_scope();
        address
    }

    /// Attach a provider network name.
    #[must_use]
    pub fn in_network(mut self, network_name: impl Into<String>) -> Self {
        self.network_name = Some(network_name.into());
        self
    }

    /// Parse the value as an IP literal.
    pub fn parse_ip(&self) -> Result<IpAddr, NetworkError> {
        IpAddr::from_str(&self.value).map_err(|_| NetworkError::InvalidAddress(self.value.clone()))
    }

    /// Classify the address by well-known ranges.
    ///
    /// Hostnames cannot be classified and yield `Unknown`.
    pub fn derive_scope(&self) -> NetworkScope {
        match self.parse_ip() {
            Ok(IpAddr::V4(addr)) => ipv4_scope(addr),
            Ok(IpAddr::V6(addr)) => ipv6_scope(addr),
            Err(_) => NetworkScope::Unknown,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.network_name {
            Some(network) => write!(f, "{}({})", self.value, network),
            None => write!(f, "{}", self.value),
        }
    }
}

/// Build an ordered address list from raw values.
pub fn new_addresses<I, S>(values: I) -> Vec<Address>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Address::new).collect()
}

/// Order-sensitive comparison of two address lists.
pub fn addresses_equal(a: &[Address], b: &[Address]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Pick the address most likely to be reachable from outside the cloud.
///
/// Prefers the first public address, then the first address of unknown scope.
pub fn select_public_address(addresses: &[Address]) -> Option<&Address> {
    addresses
        .iter()
        .find(|a| a.scope == NetworkScope::Public)
        .or_else(|| addresses.iter().find(|a| a.scope == NetworkScope::Unknown))
}

/// Pick the address to use for traffic between machines of the same cloud.
///
/// Prefers cloud-local, then public, then unknown scope. Machine-local
/// addresses are never selected.
pub fn select_internal_address(addresses: &[Address]) -> Option<&Address> {
    [
        NetworkScope::CloudLocal,
        NetworkScope::Public,
        NetworkScope::Unknown,
    ]
    .into_iter()
    .find_map(|scope| addresses.iter().find(|a| a.scope == scope))
}

// ============================================================================
// Scope Classification
// ============================================================================

fn ipv4_scope(addr: Ipv4Addr) -> NetworkScope {
    if addr.is_loopback() {
        NetworkScope::MachineLocal
    } else if addr.is_private() || addr.is_link_local() {
        NetworkScope::CloudLocal
    } else {
        NetworkScope::Public
    }
}

fn ipv6_scope(addr: Ipv6Addr) -> NetworkScope {
    if addr.is_loopback() {
        return NetworkScope::MachineLocal;
    }

    // fc00::/7 unique local, fe80::/10 link local
    let local = [
        Ipv6Prefix::new(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
        Ipv6Prefix::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    ];
    if local.iter().flatten().any(|prefix| prefix.contains(addr)) {
        NetworkScope::CloudLocal
    } else {
        NetworkScope::Public
    }
}

/// IPv6 prefix used for range checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Prefix {
    /// Base address of the prefix.
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }
}

fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("127.0.0.1", AddressType::Ipv4)]
    #[case("192.168.1.1", AddressType::Ipv4)]
    #[case("::1", AddressType::Ipv6)]
    #[case("2001:db8::10", AddressType::Ipv6)]
    #[case("ec2-1-2-3-4.compute.amazonaws.com", AddressType::Hostname)]
    #[case("localhost", AddressType::Hostname)]
    fn test_address_type_derivation(#[case] value: &str, #[case] expected: AddressType) {
        assert_eq!(Address::new(value).kind, expected);
    }

    #[rstest]
    #[case("127.0.0.1", NetworkScope::MachineLocal)]
    #[case("10.0.0.4", NetworkScope::CloudLocal)]
    #[case("172.16.5.1", NetworkScope::CloudLocal)]
    #[case("192.168.1.1", NetworkScope::CloudLocal)]
    #[case("169.254.0.3", NetworkScope::CloudLocal)]
    #[case("8.8.8.8", NetworkScope::Public)]
    #[case("::1", NetworkScope::MachineLocal)]
    #[case("fd00::1", NetworkScope::CloudLocal)]
    #[case("fe80::1", NetworkScope::CloudLocal)]
    #[case("2001:db8::1", NetworkScope::Public)]
    #[case("node-1.internal", NetworkScope::Unknown)]
    fn test_scope_derivation(#[case] value: &str, #[case] expected: NetworkScope) {
        assert_eq!(Address::with_derived_scope(value).scope, expected);
    }

    #[test]
    fn test_new_addresses_keeps_order() {
        let addresses = new_addresses(["127.0.0.1", "192.168.1.1"]);
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].value, "127.0.0.1");
        assert_eq!(addresses[1].value, "192.168.1.1");
        assert!(addresses.iter().all(|a| a.scope == NetworkScope::Unknown));
    }

    #[test]
    fn test_addresses_equal_is_order_sensitive() {
        let a = new_addresses(["10.0.0.1", "10.0.0.2"]);
        let b = new_addresses(["10.0.0.2", "10.0.0.1"]);
        assert!(addresses_equal(&a, &a.clone()));
        assert!(!addresses_equal(&a, &b));
        assert!(!addresses_equal(&a, &a[..1]));
    }

    #[test]
    fn test_select_public_address() {
        let addresses = vec![
            Address::with_scope("10.0.0.1", NetworkScope::CloudLocal),
            Address::with_scope("host.example.com", NetworkScope::Unknown),
            Address::with_scope("203.0.113.7", NetworkScope::Public),
        ];
        assert_eq!(
            select_public_address(&addresses).map(|a| a.value.as_str()),
            Some("203.0.113.7")
        );

        let no_public = &addresses[..2];
        assert_eq!(
            select_public_address(no_public).map(|a| a.value.as_str()),
            Some("host.example.com")
        );

        assert!(select_public_address(&addresses[..1]).is_none());
        assert!(select_public_address(&[]).is_none());
    }

    #[test]
    fn test_select_internal_address() {
        let addresses = vec![
            Address::with_scope("127.0.0.1", NetworkScope::MachineLocal),
            Address::with_scope("203.0.113.7", NetworkScope::Public),
            Address::with_scope("10.0.0.1", NetworkScope::CloudLocal),
        ];
        assert_eq!(
            select_internal_address(&addresses).map(|a| a.value.as_str()),
            Some("10.0.0.1")
        );
        assert_eq!(
            select_internal_address(&addresses[..2]).map(|a| a.value.as_str()),
            Some("203.0.113.7")
        );
        assert!(select_internal_address(&addresses[..1]).is_none());
    }

    #[test]
    fn test_parse_ip_rejects_hostname() {
        let err = Address::new("not-an-ip").parse_ip().unwrap_err();
        assert_eq!(err, NetworkError::InvalidAddress("not-an-ip".to_string()));
    }

    #[test]
    fn test_ipv6_prefix() {
        let prefix = Ipv6Prefix::new("2001:db8::ffff".parse().unwrap(), 32).unwrap();
        assert_eq!(prefix.address, "2001:db8::".parse::<Ipv6Addr>().unwrap());

        assert!(prefix.contains("2001:db8::1".parse().unwrap()));
        assert!(!prefix.contains("2001:db9::1".parse().unwrap()));
        assert_eq!(
            Ipv6Prefix::new(Ipv6Addr::UNSPECIFIED, 129),
            Err(NetworkError::InvalidPrefix(
                "prefix length 129 exceeds 128".to_string()
            ))
        );
    }

    #[test]
    fn test_address_serialization() {
        let address = Address::with_derived_scope("10.1.2.3").in_network("private");
        let json = serde_json::to_string(&address).unwrap();
        assert!(json.contains("\"type\":\"ipv4\""));
        assert!(json.contains("\"scope\":\"cloud_local\""));
        assert!(json.contains("\"network_name\":\"private\""));

        let parsed: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, address);
        assert_eq!(parsed.to_string(), "10.1.2.3(private)");
    }

    proptest! {
        #[test]
        fn test_any_ipv4_is_typed_ipv4(octets in any::<[u8; 4]>()) {
            let value = Ipv4Addr::from(octets).to_string();
            let address = Address::with_derived_scope(value);
            prop_assert_eq!(address.kind, AddressType::Ipv4);
            prop_assert_ne!(address.scope, NetworkScope::Unknown);
        }

        #[test]
        fn test_any_ipv6_is_typed_ipv6(bits in any::<u128>()) {
            let value = Ipv6Addr::from(bits).to_string();
            prop_assert_eq!(Address::new(value).kind, AddressType::Ipv6);
        }
    }
}
