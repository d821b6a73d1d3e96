//! Address-based admission control
//!
//! The never-contact list is a set of network/prefix rules; a peer whose
//! address falls inside any rule is banned and never reaches the trust
//! evaluator.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// IP network specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNetwork {
    address: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    /// Create a new IP network, validating the prefix length
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, CoreError> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(CoreError::InvalidNetwork(format!(
                "{address}/{prefix_len}"
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Create for a single host (/32 or /128)
    pub fn host(address: IpAddr) -> Self {
        let prefix_len = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            address,
            prefix_len,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an IP falls inside this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(target)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u32 << (32 - self.prefix_len);
                let net_bits = u32::from(net) & mask;
                let target_bits = u32::from(target) & mask;
                net_bits == target_bits
            }
            (IpAddr::V6(net), IpAddr::V6(target)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u128 << (128 - self.prefix_len);
                let net_bits = u128::from(net) & mask;
                let target_bits = u128::from(target) & mask;
                net_bits == target_bits
            }
            _ => false, // IPv4/IPv6 mismatch
        }
    }
}

impl FromStr for IpNetwork {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let address: IpAddr = addr
                    .parse()
                    .map_err(|_| CoreError::InvalidNetwork(s.to_string()))?;
                let prefix_len: u8 = prefix
                    .parse()
                    .map_err(|_| CoreError::InvalidNetwork(s.to_string()))?;
                Self::new(address, prefix_len)
            }
            None => {
                let address: IpAddr = s
                    .parse()
                    .map_err(|_| CoreError::InvalidNetwork(s.to_string()))?;
                Ok(Self::host(address))
            }
        }
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Never-contact list enforcement
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    rules: Vec<IpNetwork>,
}

impl AddressFilter {
    pub fn new(rules: Vec<IpNetwork>) -> Self {
        Self { rules }
    }

    /// Whether `address` is matched by any never-contact rule
    pub fn is_banned(&self, address: IpAddr) -> bool {
        self.rules.iter().any(|rule| rule.contains(address))
    }

    pub fn rules(&self) -> &[IpNetwork] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
