//! §6.1 connection-string grammar.
//!
//! ```text
//! troparcel://<transport>/<target>[?<params>]
//!    transport = ws | wss | file | snapshot
//!    when ws/wss:        target = host[:port][/room]            param: token=<token>
//!    when file:          target = <path>                        (room derived from dir)
//!    when snapshot:      target = <full https url>              param: auth=<bearer>
//! ```
use anyhow::{bail, Context, Result};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionTarget {
    WebSocket {
        host: String,
        port: Option<u16>,
        room: Option<String>,
        token: Option<String>,
        tls: bool,
    },
    File {
        path: String,
    },
    Snapshot {
        url: String,
        auth: Option<String>,
    },
}

const SCHEME: &str = "troparcel://";

pub fn parse_connection_string(s: &str) -> Result<ConnectionTarget> {
    let rest = s.strip_prefix(SCHEME).context("connection string must start with troparcel://")?;
    let (transport, rest) = rest.split_once('/').context("missing transport target")?;

    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    let params = parse_query(query.unwrap_or(""));

    match transport {
        "ws" | "wss" => {
            let tls = transport == "wss";
            let (hostport, room) = match path.split_once('/') {
                Some((hp, room)) => (hp, Some(room.to_string())),
                None => (path, None),
            };
            let (host, port) = match hostport.split_once(':') {
                Some((h, p)) => (h.to_string(), Some(p.parse().context("invalid port")?)),
                None => (hostport.to_string(), None),
            };
            if host.is_empty() {
                bail!("missing host in ws/wss connection string");
            }
            Ok(ConnectionTarget::WebSocket {
                host,
                port,
                room,
                token: params.get("token").cloned(),
                tls,
            })
        }
        "file" => {
            if path.is_empty() {
                bail!("missing path in file connection string");
            }
            Ok(ConnectionTarget::File {
                path: path.to_string(),
            })
        }
        "snapshot" => {
            if path.is_empty() {
                bail!("missing url in snapshot connection string");
            }
            // The grammar's target is the full URL minus the scheme we just
            // consumed; reassemble the https:// prefix ourselves.
            let url = format!("https://{}", path);
            Ok(ConnectionTarget::Snapshot {
                url,
                auth: params.get("auth").cloned(),
            })
        }
        other => bail!("unknown transport {:?}, expected ws|wss|file|snapshot", other),
    }
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ws_with_room_and_token() {
        let target = parse_connection_string("troparcel://ws/relay.example.com:2468/myroom?token=abc123").unwrap();
        assert_eq!(
            target,
            ConnectionTarget::WebSocket {
                host: "relay.example.com".into(),
                port: Some(2468),
                room: Some("myroom".into()),
                token: Some("abc123".into()),
                tls: false,
            }
        );
    }

    #[test]
    fn parses_wss_without_room() {
        let target = parse_connection_string("troparcel://wss/relay.example.com").unwrap();
        assert_eq!(
            target,
            ConnectionTarget::WebSocket {
                host: "relay.example.com".into(),
                port: None,
                room: None,
                token: None,
                tls: true,
            }
        );
    }

    #[test]
    fn parses_file_target() {
        let target = parse_connection_string("troparcel://file//shared/team-room").unwrap();
        assert_eq!(
            target,
            ConnectionTarget::File {
                path: "/shared/team-room".into(),
            }
        );
    }

    #[test]
    fn parses_snapshot_target_with_auth() {
        let target = parse_connection_string("troparcel://snapshot/api.example.com/state?auth=tok").unwrap();
        assert_eq!(
            target,
            ConnectionTarget::Snapshot {
                url: "https://api.example.com/state".into(),
                auth: Some("tok".into()),
            }
        );
    }

    #[test]
    fn rejects_unknown_transport() {
        assert!(parse_connection_string("troparcel://ftp/host").is_err());
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(parse_connection_string("ws://host").is_err());
    }
}
