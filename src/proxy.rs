//! Proxy supervisor: starts both endpoint connectors, wires sessions to
//! the retry queues, and owns shutdown.

use crate::config::Hl7Settings;
use crate::endpoint::{self, writer_slot, EndpointContext};
use crate::error::{BridgeError, Result};
use crate::queue::{self, RetryQueue};
use crate::session::Side;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Bridge;

impl Bridge {
    /// Binds the passive side, starts the connectors and both drain tasks,
    /// and returns a handle. Bind failure is fatal and reported to the
    /// caller; everything after that reconnects on its own.
    pub async fn spawn(settings: Hl7Settings) -> Result<BridgeHandle> {
        let settings = Arc::new(settings);
        let listener = TcpListener::bind(("0.0.0.0", settings.port))
            .await
            .map_err(BridgeError::Bind)?;
        let local_addr = listener.local_addr()?;
        info!(
            %local_addr,
            remote = %format!("{}:{}", settings.client_host, settings.client_port),
            direction = ?settings.proxy_direction,
            "proxy starting"
        );

        let cancel = CancellationToken::new();
        let (passive_slot, passive_watch) = writer_slot();
        let (active_slot, active_watch) = writer_slot();
        // one queue per forwarding direction, named for its destination
        let to_active = Arc::new(RetryQueue::new());
        let to_passive = Arc::new(RetryQueue::new());

        let accept_task = tokio::spawn(endpoint::accept_loop(
            listener,
            EndpointContext {
                settings: Arc::clone(&settings),
                side: Side::Passive,
                own_slot: passive_slot,
                dest: active_watch.clone(),
                dest_queue: Arc::clone(&to_active),
                cancel: cancel.clone(),
            },
        ));

        let dial_task = tokio::spawn(endpoint::dial_loop(
            settings.client_host.clone(),
            settings.client_port,
            EndpointContext {
                settings: Arc::clone(&settings),
                side: Side::Active,
                own_slot: active_slot,
                dest: passive_watch.clone(),
                dest_queue: Arc::clone(&to_passive),
                cancel: cancel.clone(),
            },
        ));

        let drain_to_active = tokio::spawn(queue::drain_task(
            to_active,
            active_watch.clone(),
            passive_watch.clone(),
            Arc::clone(&settings),
            cancel.clone(),
        ));
        let drain_to_passive = tokio::spawn(queue::drain_task(
            to_passive,
            passive_watch,
            active_watch,
            Arc::clone(&settings),
            cancel.clone(),
        ));

        Ok(BridgeHandle {
            local_addr,
            cancel,
            tasks: vec![accept_task, dial_task, drain_to_active, drain_to_passive],
        })
    }
}

pub struct BridgeHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    /// The passive side's actually-bound address (useful with `Port: 0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cooperative shutdown: cancels every loop and waits for the
    /// supervisor tasks to finish, which closes all owned sockets.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("proxy stopped");
    }
}
