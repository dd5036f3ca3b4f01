//! Wire format of the shadowsocks manager API.
//!
//! Requests are plain ASCII datagrams, optionally followed by a JSON body:
//! `add: {"server_port": 8381, "password": "..."}`, `remove: {"server_port": 8381}`,
//! `ping` and `list`. Only `ping` and `list` are answered.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Malformed {command} reply: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { port: u16, password: String },
    Remove { port: u16 },
    Ping,
    List,
}

#[derive(Serialize)]
struct AddRequest<'a> {
    server_port: u16,
    password: &'a str,
}

#[derive(Serialize)]
struct RemoveRequest {
    server_port: u16,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Add { .. } => "add",
            Command::Remove { .. } => "remove",
            Command::Ping => "ping",
            Command::List => "list",
        }
    }

    pub fn expects_reply(&self) -> bool {
        matches!(self, Command::Ping | Command::List)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(match self {
            Command::Add { port, password } => format!(
                "add: {}",
                serde_json::to_string(&AddRequest {
                    server_port: *port,
                    password,
                })?
            ),
            Command::Remove { port } => format!(
                "remove: {}",
                serde_json::to_string(&RemoveRequest { server_port: *port })?
            ),
            Command::Ping => "ping".to_string(),
            Command::List => "list".to_string(),
        })
    }
}

/// Answer to `ping`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingReply {
    /// `stat: {...}` from the libev edition, transferred bytes per port.
    Stats(BTreeMap<u16, u64>),
    /// Any other datagram, e.g. `pong` from the python edition.
    Ack,
}

impl PingReply {
    pub fn transferred(&self, port: u16) -> Option<u64> {
        match self {
            PingReply::Stats(stats) => stats.get(&port).copied(),
            PingReply::Ack => None,
        }
    }

    pub fn has_counters(&self) -> bool {
        matches!(self, PingReply::Stats(_))
    }
}

/// One element of the `list` answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortEntry {
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub server_port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

/// A cached answer of either query command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonReply {
    Ping(PingReply),
    List(Vec<PortEntry>),
}

fn port_from_string_or_number<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u16),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(port) => Ok(port),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

pub fn parse_ping(raw: &str) -> Result<PingReply, ProtocolError> {
    let malformed = |reason: String| ProtocolError::Malformed {
        command: "ping",
        reason,
    };
    let Some((_, body)) = raw.split_once(':') else {
        return Ok(PingReply::Ack);
    };
    let map: BTreeMap<String, Value> =
        serde_json::from_str(body.trim()).map_err(|e| malformed(e.to_string()))?;

    let mut stats = BTreeMap::new();
    for (key, value) in map {
        let port = key
            .trim()
            .parse::<u16>()
            .map_err(|e| malformed(format!("port {key:?}: {e}")))?;
        let bytes = value
            .as_u64()
            .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
            .ok_or_else(|| malformed(format!("counter of port {port}: {value}")))?;
        stats.insert(port, bytes);
    }
    Ok(PingReply::Stats(stats))
}

pub fn parse_list(raw: &str) -> Result<Vec<PortEntry>, ProtocolError> {
    serde_json::from_str(raw.trim()).map_err(|e| ProtocolError::Malformed {
        command: "list",
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_commands() {
        let add = Command::Add {
            port: 8381,
            password: "p\"w".to_string(),
        };
        assert_eq!(add.encode().unwrap(), r#"add: {"server_port":8381,"password":"p\"w"}"#);
        assert_eq!(
            Command::Remove { port: 8381 }.encode().unwrap(),
            r#"remove: {"server_port":8381}"#
        );
        assert_eq!(Command::Ping.encode().unwrap(), "ping");
        assert!(!add.expects_reply());
        assert!(Command::List.expects_reply());
    }

    #[test]
    fn test_parse_ping_editions() {
        let reply = parse_ping(r#"stat: {"8381": 1024, "8382":0}"#).unwrap();
        assert_eq!(reply.transferred(8381), Some(1024));
        assert_eq!(reply.transferred(8382), Some(0));
        assert_eq!(reply.transferred(8383), None);
        assert!(reply.has_counters());

        assert_eq!(parse_ping("pong").unwrap(), PingReply::Ack);
        assert_eq!(parse_ping("").unwrap(), PingReply::Ack);
        assert!(parse_ping("stat: {not json").is_err());
    }

    #[test]
    fn test_parse_list_accepts_string_and_number_ports() {
        let entries =
            parse_list(r#"[{"server_port":"8381","password":"a"},{"server_port":8382}]"#).unwrap();
        assert_eq!(entries[0].server_port, 8381);
        assert_eq!(entries[0].password.as_deref(), Some("a"));
        assert_eq!(entries[1].server_port, 8382);
        assert_eq!(entries[1].password, None);

        assert!(parse_list("").is_err());
        assert!(parse_list(r#"[{"server_port":"x"}]"#).is_err());
    }
}
