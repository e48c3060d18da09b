//! Standalone interactive client mode.
//!
//! Dials the configured target and keeps two activities running on the one
//! stream: a terminal producer that frames pasted HL7 text, and a receive
//! task that acknowledges whatever the far side pushes. Reconnects forever
//! with a fixed delay, like the proxy's active side.

use crate::codec::MllpCodec;
use crate::config::Hl7Settings;
use crate::endpoint::{PeerWriter, RECONNECT_DELAY};
use crate::error::Result;
use crate::hl7;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(settings: Hl7Settings, cancel: CancellationToken) -> Result<()> {
    let settings = Arc::new(settings);
    let host = settings.client_host.clone();
    let port = settings.client_port;
    info!(remote = %format!("{host}:{port}"), "client starting, paste HL7 text and finish with an empty line");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                info!("connected");
                run_connection(stream, &settings, &cancel).await;
                info!("disconnected");
            }
            Err(e) => warn!(error = %e, "connect failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(RECONNECT_DELAY) => {}
        }
    }
    Ok(())
}

async fn run_connection(stream: TcpStream, settings: &Arc<Hl7Settings>, cancel: &CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let writer = PeerWriter::new(0, write_half);

    let producer = tokio::spawn(produce_from_stdin(writer.clone(), cancel.clone()));

    let mut frames = FramedRead::new(read_half, MllpCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        let payload = match frame {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                warn!(error = %e, "read failed");
                break;
            }
            None => break,
        };

        let control_id = hl7::control_id(&payload);
        if hl7::is_ack(&payload) {
            info!(%control_id, "ack received");
            continue;
        }

        info!(%control_id, msg_type = %hl7::message_type(&payload).unwrap_or_default(), "message received");
        let ack = hl7::build_ack(&payload, settings);
        if let Err(e) = writer.send(ack).await {
            warn!(error = %e, "ack write failed");
            break;
        }
        if settings.disconnect_after_ack {
            break;
        }
    }

    producer.abort();
}

/// Reads pasted HL7 from the terminal. Lines accumulate until an empty
/// line, then the block is normalized to 0x0D segment endings, framed and
/// sent.
async fn produce_from_stdin(writer: PeerWriter, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut block: Vec<String> = Vec::new();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => {
                if block.is_empty() {
                    continue;
                }
                let payload = normalize_message(&block.join("\n"));
                block.clear();
                info!(control_id = %hl7::control_id(&payload), "sending");
                if let Err(e) = writer.send(payload).await {
                    warn!(error = %e, "send failed");
                    return;
                }
            }
            Ok(Some(line)) => block.push(line),
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                return;
            }
        }
    }
}

/// Normalizes pasted text to HL7 segment terminators: every line ending
/// becomes a single 0x0D, and the message always ends with one.
pub fn normalize_message(text: &str) -> Bytes {
    let mut out = String::with_capacity(text.len() + 1);
    for segment in text.replace("\r\n", "\r").replace('\n', "\r").split('\r') {
        if !segment.is_empty() {
            out.push_str(segment);
            out.push('\r');
        }
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mixed_line_endings() {
        let text = "MSH|^~\\&|A|B|C|D|ts||ORU^R01|9|P|2.3.1\r\nPID|1\nOBX|1";
        let normalized = normalize_message(text);
        assert_eq!(
            &normalized[..],
            b"MSH|^~\\&|A|B|C|D|ts||ORU^R01|9|P|2.3.1\rPID|1\rOBX|1\r"
        );
    }

    #[test]
    fn trailing_terminator_is_not_duplicated() {
        let normalized = normalize_message("MSH|^~\\&|A\r");
        assert_eq!(&normalized[..], b"MSH|^~\\&|A\r");
    }

    #[test]
    fn blank_segments_are_dropped() {
        let normalized = normalize_message("MSH|^~\\&|A\n\nPID|1\n");
        assert_eq!(&normalized[..], b"MSH|^~\\&|A\rPID|1\r");
    }
}
