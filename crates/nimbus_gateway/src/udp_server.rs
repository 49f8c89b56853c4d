//! UDP ingestion: the wire format is one datagram per message,
//! `"<shortId>:<jsonPayload>"`, datagram boundaries are message boundaries.

use anyhow::Context;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nimbus_domain::{DomainError, DomainResult, InboundMessage, MessageRouter};

const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, PartialEq)]
pub struct ParsedDatagram {
    pub short_id: String,
    pub message: InboundMessage,
}

/// Frame and parse one datagram: UTF-8, trim, split at the first colon,
/// sanitize the short id, parse the remainder as JSON.
pub fn parse_datagram(raw: &[u8]) -> DomainResult<ParsedDatagram> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| DomainError::InvalidMessage("datagram is not valid UTF-8".to_string()))?;
    let text = text.trim();

    let (short_id, payload) = text.split_once(':').ok_or_else(|| {
        DomainError::InvalidMessage(format!("missing short id separator: {:?}", text))
    })?;

    let short_id = short_id.trim();
    if short_id.is_empty() || !short_id.bytes().all(valid_short_id_byte) {
        return Err(DomainError::InvalidShortId(short_id.to_string()));
    }

    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| DomainError::InvalidMessage(format!("invalid JSON payload: {}", e)))?;
    let message = InboundMessage::parse(value)?;

    Ok(ParsedDatagram {
        short_id: short_id.to_string(),
        message,
    })
}

// Short ids are lookup keys into the registry and the store; keep them to a
// boring identifier charset.
fn valid_short_id_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

/// Receive loop. Malformed datagrams are dropped with a log entry; socket
/// errors are fatal. The loop itself never awaits downstream work beyond
/// enqueueing into the router.
pub async fn run(
    port: u16,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind udp port {}", port))?;
    info!(port = port, "udp server listening");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("udp server stopping");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received.context("udp receive failed")?;
                let datagram = &buf[..len];
                match parse_datagram(datagram) {
                    Ok(parsed) => {
                        debug!(
                            peer = %peer,
                            short_id = %parsed.short_id,
                            "datagram received"
                        );
                        router.dispatch(&parsed.short_id, parsed.message).await;
                    }
                    Err(e) => {
                        warn!(
                            peer = %peer,
                            error = %e,
                            raw = %String::from_utf8_lossy(datagram).trim(),
                            "dropping datagram"
                        );
                    }
                }
            }
        }
    }
}
