//! HTTP monitoring surface: health check, room status, per-room stats,
//! server-sent event stream of room activity, manual compaction trigger,
//! and a minimal HTML dashboard (§4.I, §6.3).
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use warp::http::StatusCode;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use crate::compaction::compact_room;
use crate::server::SharedState;

pub fn routes(state: Arc<SharedState>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());

    let health = warp::path("health").and(warp::get()).map(|| warp::reply::json(&serde_json::json!({"status": "ok"})));

    let status = warp::path!("api" / "status")
        .and(warp::get())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_state.clone())
        .map(status_handler);

    let rooms = warp::path!("api" / "rooms")
        .and(warp::get())
        .and(with_state.clone())
        .map(list_rooms_handler);

    let room_detail = warp::path!("api" / "rooms" / String)
        .and(warp::get())
        .and(with_state.clone())
        .map(room_detail_handler);

    let room_events = warp::path!("api" / "rooms" / String / "events")
        .and(warp::get())
        .and(with_state.clone())
        .map(room_events_handler);

    let compact = warp::path!("api" / "rooms" / String / "compact")
        .and(warp::post())
        .and(with_state.clone())
        .map(compact_handler);

    let dashboard = warp::path::end().and(warp::get()).and(with_state).map(dashboard_handler);

    health.or(status).or(rooms).or(room_detail).or(room_events).or(compact).or(dashboard)
}

#[derive(Serialize)]
struct StatusBody {
    rooms: usize,
    max_rooms: usize,
}

fn status_handler(authorization: Option<String>, state: Arc<SharedState>) -> Box<dyn Reply> {
    if let Some(expected) = &state.monitor_token {
        let provided = authorization.as_deref().and_then(|h| h.strip_prefix("Bearer "));
        if provided != Some(expected.as_str()) {
            return Box::new(warp::reply::with_status("unauthorized", StatusCode::UNAUTHORIZED));
        }
    }
    Box::new(warp::reply::json(&StatusBody {
        rooms: state.registry.room_count(),
        max_rooms: state.max_rooms,
    }))
}

fn list_rooms_handler(state: Arc<SharedState>) -> impl Reply {
    warp::reply::json(&state.registry.room_names())
}

#[derive(Serialize)]
struct RoomDetail {
    name: String,
    connections: usize,
}

fn room_detail_handler(name: String, state: Arc<SharedState>) -> Box<dyn Reply> {
    match state.registry.get(&name) {
        Some(room) => Box::new(warp::reply::json(&RoomDetail {
            name: room.name.clone(),
            connections: room.connection_count.load(std::sync::atomic::Ordering::SeqCst),
        })),
        None => Box::new(warp::reply::with_status("not found", StatusCode::NOT_FOUND)),
    }
}

fn room_events_handler(name: String, state: Arc<SharedState>) -> impl Reply {
    let stream = match state.registry.get(&name) {
        Some(room) => {
            let rx = room.activity.subscribe();
            tokio_stream::wrappers::BroadcastStream::new(rx)
        }
        None => {
            let (_tx, rx) = tokio::sync::broadcast::channel(1);
            tokio_stream::wrappers::BroadcastStream::new(rx)
        }
    };
    let events = stream.filter_map(|kind| async move {
        let kind = kind.ok()?;
        Some(Ok::<_, Infallible>(Event::default().data(format!("{kind:?}"))))
    });
    warp::sse::reply(warp::sse::keep_alive().interval(Duration::from_secs(15)).stream(events))
}

fn compact_handler(name: String, state: Arc<SharedState>) -> Box<dyn Reply> {
    let now = state.clock_unix_secs();
    match compact_room(&state.registry, &state.store, &name, state.tombstone_max_age, now) {
        Some(report) => Box::new(warp::reply::json(&serde_json::json!({
            "room": report.room,
            "orphaned_uuids_removed": report.orphaned_uuids_removed,
        }))),
        None => Box::new(warp::reply::with_status("not found", StatusCode::NOT_FOUND)),
    }
}

fn dashboard_handler(state: Arc<SharedState>) -> impl Reply {
    let rooms = state.registry.room_names();
    let rows: String = rooms.iter().map(|r| format!("<tr><td>{r}</td></tr>")).collect();
    warp::reply::html(format!(
        "<html><head><title>troparcel relay</title></head><body><h1>rooms</h1><table>{rows}</table></body></html>"
    ))
}
