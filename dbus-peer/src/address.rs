//! The D-Bus address grammar: `<transport>:key=value[,key=value…][;…]`.
//!
//! Covers `unix:path=`, `unix:abstract=`, `tcp:host=,port=,family=`, and
//! `nonce-tcp:host=,port=,noncefile=`, plus percent-unescaping of key values.

use std::collections::HashMap;
use std::env;

use crate::error::{Error, ErrorKind, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// An address's `family=` constraint on which IP version to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// `family=ipv4`.
    Ipv4,
    /// `family=ipv6`.
    Ipv6,
}

/// A single connectable endpoint parsed out of a D-Bus address string.
///
/// A full address string may list several semicolon-separated endpoints,
/// tried in order until one connects; [`parse`] returns them all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `unix:path=…` — a filesystem-backed Unix domain socket.
    UnixPath(String),
    /// `unix:abstract=…` — a Linux abstract-namespace Unix domain socket.
    UnixAbstract(String),
    /// `tcp:host=…,port=…[,family=ipv4|ipv6]` — a plain TCP socket.
    /// `EXTERNAL` is unavailable over this transport.
    Tcp {
        /// Hostname or address to dial.
        host: String,
        /// TCP port.
        port: u16,
        /// Restrict resolution to this IP version, if given.
        family: Option<Family>,
    },
    /// `nonce-tcp:host=…,port=…,noncefile=…[,family=ipv4|ipv6]` — a TCP
    /// socket guarded by a shared-secret nonce: the first 16 bytes read
    /// from `noncefile` must be written as the first bytes on the wire,
    /// before SASL negotiation begins.
    NonceTcp {
        /// Hostname or address to dial.
        host: String,
        /// TCP port.
        port: u16,
        /// Restrict resolution to this IP version, if given.
        family: Option<Family>,
        /// Path to the file holding the shared nonce.
        noncefile: String,
    },
}

/// Parse a full D-Bus address string into its semicolon-separated,
/// connectable endpoints.
///
/// Listen-only forms (`unix:tmpdir=`, `nonce-tcp:` with no `noncefile=`
/// param) are rejected with [`ErrorKind::UnsupportedAddress`] rather than
/// silently skipped, so a caller that mistakenly passes a server address
/// finds out immediately. A `nonce-tcp:` address that does name a
/// `noncefile=` is connectable: the file is read and its contents written
/// ahead of SASL once [`crate::transport::connect`] dials it, so whether the
/// file is actually readable is only discovered at connect time.
pub fn parse(address: &str) -> Result<Vec<Endpoint>> {
    address.split(';').filter(|s| !s.is_empty()).map(parse_one).collect()
}

/// Resolve the session bus address from `DBUS_SESSION_BUS_ADDRESS`.
pub fn session_bus() -> Result<Vec<Endpoint>> {
    let value = env::var(ENV_SESSION_BUS)
        .map_err(|_| Error::from(ErrorKind::UnsupportedAddress(ENV_SESSION_BUS.into())))?;
    parse(&value)
}

/// Resolve the system bus address from `DBUS_SYSTEM_BUS_ADDRESS`, falling
/// back to the well-known Unix socket path.
pub fn system_bus() -> Result<Vec<Endpoint>> {
    let value = env::var(ENV_SYSTEM_BUS).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS.to_owned());
    parse(&value)
}

fn parse_one(entry: &str) -> Result<Endpoint> {
    let (transport, rest) = entry
        .split_once(':')
        .ok_or_else(|| Error::from(ErrorKind::UnsupportedAddress(entry.to_owned())))?;

    let params = parse_params(rest)?;

    match transport {
        "unix" => {
            if let Some(path) = params.get("path") {
                Ok(Endpoint::UnixPath(path.clone()))
            } else if let Some(name) = params.get("abstract") {
                Ok(Endpoint::UnixAbstract(name.clone()))
            } else if params.contains_key("tmpdir") {
                Err(ErrorKind::UnsupportedAddress(
                    "unix:tmpdir= is a listen-only address".into(),
                )
                .into())
            } else {
                Err(ErrorKind::UnsupportedAddress(entry.to_owned()).into())
            }
        }
        "tcp" => {
            let host = tcp_host(&params, entry)?;
            let port = tcp_port(&params, entry)?;
            let family = tcp_family(&params, entry)?;
            Ok(Endpoint::Tcp { host, port, family })
        }
        "nonce-tcp" => {
            let host = tcp_host(&params, entry)?;
            let port = tcp_port(&params, entry)?;
            let family = tcp_family(&params, entry)?;
            let noncefile = params.get("noncefile").cloned().ok_or_else(|| {
                Error::from(ErrorKind::UnsupportedAddress(
                    "nonce-tcp without noncefile= is a listen-only address".into(),
                ))
            })?;
            Ok(Endpoint::NonceTcp {
                host,
                port,
                family,
                noncefile,
            })
        }
        other => Err(ErrorKind::UnsupportedAddress(format!("unknown transport {other:?}")).into()),
    }
}

fn tcp_host(params: &HashMap<String, String>, entry: &str) -> Result<String> {
    params
        .get("host")
        .cloned()
        .ok_or_else(|| Error::from(ErrorKind::UnsupportedAddress(entry.to_owned())))
}

fn tcp_port(params: &HashMap<String, String>, entry: &str) -> Result<u16> {
    params
        .get("port")
        .ok_or_else(|| Error::from(ErrorKind::UnsupportedAddress(entry.to_owned())))?
        .parse()
        .map_err(|_| Error::from(ErrorKind::UnsupportedAddress(entry.to_owned())))
}

fn tcp_family(params: &HashMap<String, String>, entry: &str) -> Result<Option<Family>> {
    match params.get("family").map(String::as_str) {
        None => Ok(None),
        Some("ipv4") => Ok(Some(Family::Ipv4)),
        Some("ipv6") => Ok(Some(Family::Ipv6)),
        Some(_) => Err(Error::from(ErrorKind::UnsupportedAddress(entry.to_owned()))),
    }
}

fn parse_params(rest: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();

    for kv in rest.split(',').filter(|s| !s.is_empty()) {
        let (key, value) = kv
            .split_once('=')
            .ok_or_else(|| Error::from(ErrorKind::UnsupportedAddress(kv.to_owned())))?;
        map.insert(key.to_owned(), percent_decode(value)?);
    }

    Ok(map)
}

fn percent_decode(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::from(ErrorKind::UnsupportedAddress(value.to_owned())))?;
            let byte = u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16)
                .map_err(|_| Error::from(ErrorKind::UnsupportedAddress(value.to_owned())))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|e| ErrorKind::InvalidUtf8(e.utf8_error()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_path() {
        let endpoints = parse("unix:path=/run/dbus/system_bus_socket").unwrap();
        assert_eq!(
            endpoints,
            vec![Endpoint::UnixPath("/run/dbus/system_bus_socket".into())]
        );
    }

    #[test]
    fn parses_unix_abstract_with_percent_escapes() {
        let endpoints = parse("unix:abstract=/tmp/dbus-%2Ftest").unwrap();
        assert_eq!(endpoints, vec![Endpoint::UnixAbstract("/tmp/dbus-/test".into())]);
    }

    #[test]
    fn parses_tcp() {
        let endpoints = parse("tcp:host=localhost,port=1234").unwrap();
        assert_eq!(
            endpoints,
            vec![Endpoint::Tcp {
                host: "localhost".into(),
                port: 1234,
                family: None,
            }]
        );
    }

    #[test]
    fn parses_tcp_with_family() {
        let endpoints = parse("tcp:host=localhost,port=1234,family=ipv6").unwrap();
        assert_eq!(
            endpoints,
            vec![Endpoint::Tcp {
                host: "localhost".into(),
                port: 1234,
                family: Some(Family::Ipv6),
            }]
        );
    }

    #[test]
    fn rejects_unknown_tcp_family() {
        assert!(parse("tcp:host=localhost,port=1234,family=carrier-pigeon").is_err());
    }

    #[test]
    fn parses_nonce_tcp_with_noncefile() {
        let endpoints = parse("nonce-tcp:host=localhost,port=1234,noncefile=/tmp/n").unwrap();
        assert_eq!(
            endpoints,
            vec![Endpoint::NonceTcp {
                host: "localhost".into(),
                port: 1234,
                family: None,
                noncefile: "/tmp/n".into(),
            }]
        );
    }

    #[test]
    fn rejects_nonce_tcp_without_noncefile() {
        assert!(parse("nonce-tcp:host=localhost,port=1234").is_err());
    }

    #[test]
    fn parses_multiple_semicolon_separated_endpoints() {
        let endpoints = parse("unix:path=/a;tcp:host=b,port=1").unwrap();
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn rejects_listen_only_tmpdir() {
        assert!(parse("unix:tmpdir=/tmp").is_err());
    }

    #[test]
    fn rejects_unknown_transport() {
        assert!(parse("carrier-pigeon:path=/a").is_err());
    }
}
