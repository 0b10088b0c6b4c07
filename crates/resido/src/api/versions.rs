use axum::extract::State;
use axum::response::Response;
use serde_json::json;

use super::envelope::ok;
use super::ApiState;
use crate::clock::Clock;

pub(crate) async fn versions(State(state): State<ApiState>) -> Response {
    let uptime = (state.clock.now() - state.started_at).num_seconds().max(0);
    ok(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
    }))
}
