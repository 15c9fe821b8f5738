//! WebSocket handling for `/<room>?token=`: accepts a peer's state vector
//! and update frames, replies with the delta, and rebroadcasts updates to
//! every other connection in the room (§4.I).
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{info, warn};
use troparcel_crdt::encode::{decode_delta, decode_push_clock, encode_state};
use warp::ws::{Message, WebSocket};

use crate::auth::AuthResult;
use crate::ratelimit::LimitOutcome;
use crate::room::ActivityKind;
use crate::server::SharedState;
use crate::store::mask_ip;

/// Close codes the client should recognise (§4.I).
pub const CLOSE_BAD_URL: u16 = 4000;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_ROOM_LIMIT: u16 = 4002;
pub const CLOSE_PER_IP_LIMIT: u16 = 4003;

pub async fn handle_connection(ws: WebSocket, room_name: String, token: Option<String>, remote: Option<SocketAddr>, state: Arc<SharedState>) {
    let masked = remote.map(|a| mask_ip(a.ip())).unwrap_or_else(|| "unknown".to_string());

    match state.auth.check(&room_name, token.as_deref()) {
        AuthResult::Unauthorized => {
            close_with(ws, CLOSE_UNAUTHORIZED, "unauthorized").await;
            return;
        }
        AuthResult::NotRequired | AuthResult::Authorized => {}
    }

    if let Some(ip) = remote.map(|a| a.ip()) {
        if state.rate_limiter.try_admit_connection(ip) == LimitOutcome::PerIpLimitExceeded {
            close_with(ws, CLOSE_PER_IP_LIMIT, "too many connections from this address").await;
            return;
        }
    }

    if state.rate_limiter.try_admit_room(state.registry.room_count()) == LimitOutcome::RoomLimitExceeded
        && state.registry.get(&room_name).is_none()
    {
        close_with(ws, CLOSE_ROOM_LIMIT, "server is at its room capacity").await;
        if let Some(ip) = remote.map(|a| a.ip()) {
            state.rate_limiter.release_connection(ip);
        }
        return;
    }

    let room = state.registry.get_or_create(&room_name, || {
        state.store.load(&room_name).ok().flatten().unwrap_or_else(|| troparcel_crdt::ReplicatedDoc::new(1))
    });
    room.connection_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let _ = room.activity.send(ActivityKind::Connected);
    info!(room = %room_name, remote = %masked, "peer connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut activity_rx = room.activity.subscribe();

    // §4.I: a newly-connected peer gets the room's current state immediately,
    // not just on the next broadcast.
    let initial_state = encode_state(&room.doc.read()).ok();
    if let Some(bytes) = initial_state {
        if ws_tx.send(Message::binary(bytes)).await.is_err() {
            room.connection_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            let _ = room.activity.send(ActivityKind::Disconnected);
            if let Some(ip) = remote.map(|a| a.ip()) {
                state.rate_limiter.release_connection(ip);
            }
            return;
        }
    }

    let relay_room = room.clone();
    let relay_state = state.clone();
    let relay_name = room_name.clone();
    let outbound = tokio::spawn(async move {
        loop {
            match activity_rx.recv().await {
                Ok(ActivityKind::Updated) => {
                    let bytes = { encode_state(&relay_room.doc.read()).ok() };
                    if let Some(bytes) = bytes {
                        if ws_tx.send(Message::binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = relay_state;
        let _ = relay_name;
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!(room = %room_name, error = %err, "websocket read error");
                break;
            }
        };
        if msg.is_binary() {
            if let Err(err) = apply_frame(&room, &state, &room_name, msg.as_bytes()) {
                warn!(room = %room_name, error = %err, "rejected malformed frame");
            }
        } else if msg.is_close() {
            break;
        }
    }

    outbound.abort();
    room.connection_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    let _ = room.activity.send(ActivityKind::Disconnected);
    if let Some(ip) = remote.map(|a| a.ip()) {
        state.rate_limiter.release_connection(ip);
    }
    info!(room = %room_name, remote = %masked, "peer disconnected");
}

fn apply_frame(room: &crate::room::Room, state: &SharedState, room_name: &str, bytes: &[u8]) -> anyhow::Result<()> {
    if let Ok(sv) = decode_push_clock(bytes) {
        // Peer announced their state vector; nothing to apply, the
        // outbound task will pick up the next Updated broadcast.
        let _ = sv;
        return Ok(());
    }
    let incoming = decode_delta(bytes)?;
    {
        let mut doc = room.doc.write();
        doc.merge(&incoming);
    }
    if let Err(err) = state.store.save(room_name, &room.doc.read()) {
        warn!(room = room_name, error = %err, "failed to persist room after merge");
    }
    let _ = room.activity.send(ActivityKind::Updated);
    Ok(())
}

async fn close_with(mut ws: WebSocket, code: u16, reason: &str) {
    let _ = ws.send(Message::close_with(code, reason.to_string())).await;
    let _ = ws.close().await;
}
