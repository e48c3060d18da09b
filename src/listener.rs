//! Standalone listener mode: accept MLLP peers, acknowledge allowed
//! messages, optionally hang up after each ACK.

use crate::codec::MllpCodec;
use crate::config::Hl7Settings;
use crate::error::{BridgeError, Result};
use crate::hl7;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct MllpListener;

impl MllpListener {
    pub async fn spawn(settings: Hl7Settings) -> Result<ListenerHandle> {
        let settings = Arc::new(settings);
        let listener = TcpListener::bind(("0.0.0.0", settings.port))
            .await
            .map_err(BridgeError::Bind)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, allowed = ?settings.allowed_events, "listener starting");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, settings, cancel.clone()));

        Ok(ListenerHandle {
            local_addr,
            cancel,
            task,
        })
    }
}

pub struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        info!("listener stopped");
    }
}

async fn accept_loop(listener: TcpListener, settings: Arc<Hl7Settings>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                info!(%addr, "peer connected");
                let settings = Arc::clone(&settings);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    handle_connection(stream, settings, cancel).await;
                    debug!(%addr, "connection closed");
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn handle_connection(stream: TcpStream, settings: Arc<Hl7Settings>, cancel: CancellationToken) {
    let mut transport = Framed::new(stream, MllpCodec::new());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = transport.next() => frame,
        };
        let payload = match frame {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                warn!(error = %e, "read failed");
                break;
            }
            None => break,
        };

        // The event filter keys off a plain pipe split of MSH-9; an empty
        // allow list admits everything.
        let msg_type = hl7::message_type_naive(&payload).unwrap_or_default();
        let allowed =
            settings.allowed_events.is_empty() || settings.allowed_events.contains(&msg_type);

        if allowed {
            info!(
                control_id = %hl7::control_id(&payload),
                %msg_type,
                "message received"
            );
            let ack = hl7::build_ack(&payload, &settings);
            if let Err(e) = transport.send(ack).await {
                warn!(error = %e, "ack write failed");
                break;
            }
        } else {
            debug!(%msg_type, "event not allowed, no ack");
        }

        if settings.disconnect_after_ack {
            break;
        }
    }
}
