//! Endpoint connectors for the proxy's two sides.
//!
//! Both variants share one contract: produce a sequence of peer streams
//! over time and publish the current one for writers. The passive side
//! accepts inbound connections; the active side dials out and redials
//! after a fixed delay. Publication goes through a `watch` channel, so
//! forwarders and drain tasks always see the most recent stream without
//! sharing mutable references.

use crate::codec::MllpCodec;
use crate::error::Result;
use crate::session::{self, SessionContext, Side};
use bytes::Bytes;
use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

/// Delay between redial attempts on the active side.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The write half of a connected peer, behind the per-stream write mutex.
/// ACK replies, direct forwards and queue drains all contend on it, which
/// serializes frames on the wire. Cloning is cheap and shares the stream.
#[derive(Clone)]
pub struct PeerWriter {
    generation: u64,
    sink: Arc<Mutex<FramedWrite<OwnedWriteHalf, MllpCodec>>>,
}

impl PeerWriter {
    pub fn new(generation: u64, write_half: OwnedWriteHalf) -> Self {
        Self {
            generation,
            sink: Arc::new(Mutex::new(FramedWrite::new(write_half, MllpCodec::new()))),
        }
    }

    /// Frames the payload and writes it out. One record per call; the
    /// mutex spans the whole write so frames never interleave.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(payload).await?;
        Ok(())
    }

    /// Identifies which accept/dial produced this stream. Used to make
    /// sure a dying session only clears the slot it still owns.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub type WriterSlot = Arc<watch::Sender<Option<PeerWriter>>>;
pub type WriterWatch = watch::Receiver<Option<PeerWriter>>;

pub fn writer_slot() -> (WriterSlot, WriterWatch) {
    let (tx, rx) = watch::channel(None);
    (Arc::new(tx), rx)
}

fn clear_if_current(slot: &WriterSlot, generation: u64) {
    slot.send_if_modified(|current| {
        let owns = current
            .as_ref()
            .is_some_and(|w| w.generation() == generation);
        if owns {
            *current = None;
        }
        owns
    });
}

/// Everything a connector needs to wire an accepted/dialed peer into the
/// proxy: its own publication slot plus the opposite side's writer watch
/// and retry queue.
pub(crate) struct EndpointContext {
    pub settings: Arc<crate::config::Hl7Settings>,
    pub side: Side,
    pub own_slot: WriterSlot,
    pub dest: WriterWatch,
    pub dest_queue: Arc<crate::queue::RetryQueue>,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl EndpointContext {
    fn session(&self, own_writer: PeerWriter) -> SessionContext {
        SessionContext {
            settings: Arc::clone(&self.settings),
            side: self.side,
            own_writer,
            dest: self.dest.clone(),
            dest_queue: Arc::clone(&self.dest_queue),
            cancel: self.cancel.clone(),
        }
    }
}

/// Passive connector: accepts peers until cancelled. Each accept replaces
/// the published writer; the session for an older peer keeps running until
/// that peer hangs up, but writers only ever target the newest stream.
pub(crate) async fn accept_loop(listener: TcpListener, ctx: EndpointContext) {
    let mut generation: u64 = 0;
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                generation += 1;
                info!(%addr, side = ?ctx.side, generation, "peer connected");
                let (read_half, write_half) = stream.into_split();
                let writer = PeerWriter::new(generation, write_half);
                ctx.own_slot.send_replace(Some(writer.clone()));

                let session = ctx.session(writer);
                let slot = Arc::clone(&ctx.own_slot);
                tokio::spawn(async move {
                    session::run_session(read_half, session).await;
                    clear_if_current(&slot, generation);
                    debug!(%addr, generation, "session ended");
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Active connector: dials the configured target, runs the session inline,
/// and redials after [`RECONNECT_DELAY`] on failure or disconnect.
pub(crate) async fn dial_loop(host: String, port: u16, ctx: EndpointContext) {
    let mut generation: u64 = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                generation += 1;
                info!(remote = %format!("{host}:{port}"), side = ?ctx.side, generation, "connected");
                let (read_half, write_half) = stream.into_split();
                let writer = PeerWriter::new(generation, write_half);
                ctx.own_slot.send_replace(Some(writer.clone()));

                session::run_session(read_half, ctx.session(writer)).await;
                clear_if_current(&ctx.own_slot, generation);
                info!(generation, "session ended, redialing");
            }
            Err(e) => {
                warn!(remote = %format!("{host}:{port}"), error = %e, "connect failed");
            }
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
