//! NAT address column entries
//!
//! Format: `<mac> <ip> [<ip>...] is_chassis_resident("<cr-lrp>")`.

use crate::error::{Error, Result};
use crate::net::IpPrefix;
use std::str::FromStr;

const RESIDENT_MARKER: &str = "is_chassis_resident";

/// One parsed `nat_addresses` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatAddress {
    pub mac: String,
    pub ips: Vec<IpPrefix>,
    /// Chassis-redirect port the addresses are resident on
    pub port: Option<String>,
}

impl FromStr for NatAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(Error::invalid_address(format!("bad NAT entry: {}", s)));
        }

        let (ip_tokens, port) = match tokens.last() {
            Some(last) if last.starts_with(RESIDENT_MARKER) => {
                let port = last
                    .split('"')
                    .nth(1)
                    .map(|p| p.trim_end_matches('\\').to_string())
                    .filter(|p| !p.is_empty());
                (&tokens[1..tokens.len() - 1], port)
            }
            _ => (&tokens[1..], None),
        };

        let ips = ip_tokens
            .iter()
            .map(|t| t.parse::<IpPrefix>())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mac: tokens[0].to_string(),
            ips,
            port,
        })
    }
}
