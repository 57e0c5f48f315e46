//! WHIP publish endpoint
//!
//! - `POST /api/whip` - body is the publisher's SDP offer, response is the answer

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use super::auth::StreamKeyAuth;
use super::{AppResult, AppState};

/// Content type of SDP offer and answer bodies
pub const APPLICATION_SDP: &str = "application/sdp";

pub async fn publish(
    State(state): State<AppState>,
    StreamKeyAuth(key): StreamKeyAuth,
    offer: String,
) -> AppResult<Response> {
    let answer = state.sfu.ingest(offer, &key).await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, "/api/whip"),
            (header::CONTENT_TYPE, APPLICATION_SDP),
        ],
        answer,
    )
        .into_response())
}
