//! SQL Server Browser client (SSRP).
//!
//! When a named instance is given without a port, the instance's TCP port
//! is discovered by sending a single `0x03` (CLNT_BCAST_EX) datagram to
//! UDP port 1434 and parsing the reply: a 3-byte preamble, then a
//! semicolon-delimited sequence of key;value pairs, instances separated by
//! empty tokens. The "tcp" key carries the port.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::StreamError;

/// UDP port the browser service listens on.
pub const BROWSER_PORT: u16 = 1434;

/// The enumeration request byte.
const CLNT_BCAST_EX: u8 = 0x03;

/// Per-instance properties keyed by property name.
pub type InstanceInfo = HashMap<String, String>;

/// Enumerate all instances advertised by the host's browser service.
pub async fn browse(
    host: &str,
    wait: Duration,
) -> Result<HashMap<String, InstanceInfo>, StreamError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, BROWSER_PORT)).await?;
    socket.send(&[CLNT_BCAST_EX]).await?;

    let mut buf = vec![0u8; 65536];
    let n = timeout(wait, socket.recv(&mut buf))
        .await
        .map_err(|_| StreamError::BrowserTimeout)??;
    parse_browser_reply(&buf[..n])
}

/// Resolve one instance's TCP port, case-insensitively.
pub async fn resolve_instance(
    host: &str,
    instance: &str,
    wait: Duration,
) -> Result<u16, StreamError> {
    let instances = browse(host, wait).await?;
    let found = instances
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(instance))
        .map(|(_, info)| info)
        .ok_or_else(|| StreamError::InstanceNotFound(instance.to_owned()))?;
    found
        .get("tcp")
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or(StreamError::BrowserFormat)
}

/// Parse a browser reply into a map of instance name to properties.
pub fn parse_browser_reply(reply: &[u8]) -> Result<HashMap<String, InstanceInfo>, StreamError> {
    // Preamble: response byte plus a little-endian payload size.
    if reply.len() < 3 {
        return Err(StreamError::BrowserFormat);
    }
    let body = std::str::from_utf8(&reply[3..]).map_err(|_| StreamError::BrowserFormat)?;

    let mut instances = HashMap::new();
    let mut current = InstanceInfo::new();
    let mut tokens = body.split(';');
    loop {
        let Some(key) = tokens.next() else { break };
        if key.is_empty() {
            // Empty token closes the current instance group.
            if let Some(name) = current.get("InstanceName").cloned() {
                instances.insert(name, std::mem::take(&mut current));
            } else {
                current.clear();
            }
            continue;
        }
        let Some(value) = tokens.next() else { break };
        current.insert(key.to_owned(), value.to_owned());
    }
    if let Some(name) = current.get("InstanceName").cloned() {
        instances.insert(name, current);
    }
    Ok(instances)
}
