//! Session handler: drives one connected peer of the proxy.
//!
//! The loop deframes one record at a time, classifies it, and acts before
//! reading the next record, so per-source arrival order is preserved.
//! Inbound ACKs terminate here — they are never forwarded (the proxy
//! answers its peers locally). Application records are acknowledged per
//! the direction's timing policy and forwarded to the opposite side, or
//! buffered when that side is down.

use crate::codec::MllpCodec;
use crate::config::{Hl7Settings, ProxyDirection};
use crate::endpoint::{PeerWriter, WriterWatch};
use crate::hl7;
use crate::queue::{Pending, RetryQueue};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which connector produced this session's peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The listening side of the proxy
    Passive,
    /// The dialing side of the proxy
    Active,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Passive => Side::Active,
            Side::Active => Side::Passive,
        }
    }
}

/// When the sender of an application record gets its local ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTiming {
    /// Acknowledge as soon as the record is read, before forwarding.
    OnReceipt,
    /// Acknowledge only once the record has been handed to the far side.
    /// While the far side is down the sender hears nothing and may resend
    /// or hold per its own semantics.
    AfterDelivery,
}

/// ACK timing as a function of proxy direction and source side. In the
/// default direction both peers are acknowledged on receipt; with the
/// analyzer on the dialing side, its "accepted" must mean "delivered".
pub fn ack_timing(direction: ProxyDirection, source: Side) -> AckTiming {
    match (direction, source) {
        (ProxyDirection::ClientToListener, Side::Active) => AckTiming::AfterDelivery,
        _ => AckTiming::OnReceipt,
    }
}

pub struct SessionContext {
    pub settings: Arc<Hl7Settings>,
    pub side: Side,
    /// This peer's own stream, target of its local ACKs.
    pub own_writer: PeerWriter,
    /// The opposite side's current writer.
    pub dest: WriterWatch,
    /// Retry queue for records heading to the opposite side.
    pub dest_queue: Arc<RetryQueue>,
    pub cancel: CancellationToken,
}

/// Runs until the peer closes, the stream errors, or the proxy shuts down.
pub async fn run_session(read_half: OwnedReadHalf, ctx: SessionContext) {
    let mut frames = FramedRead::new(read_half, MllpCodec::new());

    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        let payload = match frame {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                warn!(side = ?ctx.side, error = %e, "read failed, dropping session");
                break;
            }
            None => {
                debug!(side = ?ctx.side, "peer closed");
                break;
            }
        };

        handle_record(&ctx, payload).await;
    }
}

async fn handle_record(ctx: &SessionContext, payload: Bytes) {
    let control_id = hl7::control_id(&payload);

    if hl7::is_ack(&payload) {
        debug!(side = ?ctx.side, %control_id, "ack consumed");
        return;
    }

    match ack_timing(ctx.settings.proxy_direction, ctx.side) {
        AckTiming::OnReceipt => {
            send_ack(ctx, &payload, &control_id).await;
            forward(ctx, payload, false).await;
        }
        AckTiming::AfterDelivery => {
            if forward(ctx, payload.clone(), true).await {
                send_ack(ctx, &payload, &control_id).await;
            }
        }
    }
}

/// Local ACK back to the sender. A failed ACK write is logged and not
/// retried; the peer must resend.
async fn send_ack(ctx: &SessionContext, payload: &Bytes, control_id: &str) {
    let ack = hl7::build_ack(payload, &ctx.settings);
    if let Err(e) = ctx.own_writer.send(ack).await {
        warn!(side = ?ctx.side, %control_id, error = %e, "local ack write failed");
    }
}

/// Hands the record to the opposite side. Returns true when it was written
/// directly. A record goes through the queue whenever the destination is
/// down or its queue still holds earlier records, which keeps total order.
/// A failed direct write puts the record back at the queue head.
async fn forward(ctx: &SessionContext, payload: Bytes, needs_ack: bool) -> bool {
    let control_id = hl7::control_id(&payload);
    let writer = ctx.dest.borrow().clone();

    match writer {
        Some(writer) if ctx.dest_queue.is_empty() => {
            match writer.send(payload.clone()).await {
                Ok(()) => {
                    debug!(to = ?ctx.side.opposite(), %control_id, "forwarded");
                    true
                }
                Err(e) => {
                    warn!(to = ?ctx.side.opposite(), %control_id, error = %e, "forward failed, buffering");
                    ctx.dest_queue.requeue_front(Pending { payload, needs_ack });
                    false
                }
            }
        }
        _ => {
            ctx.dest_queue.push(Pending { payload, needs_ack });
            debug!(
                to = ?ctx.side.opposite(),
                %control_id,
                queued = ctx.dest_queue.len(),
                "destination unavailable, buffered"
            );
            false
        }
    }
}
