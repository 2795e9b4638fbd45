// src/config/models.rs

use anyhow::{bail, Result};
use serde::{de, Deserialize, Deserializer};
use std::fmt;

/// Port served when the configuration does not name one.
pub const DEFAULT_PORT: u16 = 6600;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Zero or more bind entries. Each is the literal `any`, an absolute
    /// filesystem path, or a hostname/address literal. An empty list means
    /// one wildcard bind.
    #[serde(default)]
    pub bind_addresses: Vec<String>,

    /// TCP port shared by every non-local bind target.
    #[serde(
        default = "default_port",
        deserialize_with = "deserialize_port"
    )]
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addresses: Vec::new(),
            port: DEFAULT_PORT,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        for (i, entry) in self.bind_addresses.iter().enumerate() {
            if entry.is_empty() {
                bail!("bind_addresses[{i}] is empty");
            }
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Parse a configured port value the strict way: the whole string must be
/// a positive integer no larger than 65535. Trailing garbage is an error,
/// not silently dropped.
pub fn parse_port(value: &str) -> Result<u16, String> {
    match value.parse::<i64>() {
        Ok(n) => check_port_range(i128::from(n)),
        Err(_) => Err(format!("port {value:?} is not a positive integer")),
    }
}

fn check_port_range(n: i128) -> Result<u16, String> {
    if n <= 0 {
        return Err(format!("port {n} is not a positive integer"));
    }
    if n > i128::from(u16::MAX) {
        return Err(format!("port {n} is out of range"));
    }
    Ok(n as u16)
}

/// Accepts either an integer or a string so `port: 6600` and
/// `port: "6600"` both work in config files.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct PortVisitor;

    impl<'de> de::Visitor<'de> for PortVisitor {
        type Value = u16;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a positive integer between 1 and 65535")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u16, E> {
            check_port_range(i128::from(v)).map_err(E::custom)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u16, E> {
            check_port_range(i128::from(v)).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u16, E> {
            parse_port(v).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(PortVisitor)
}
