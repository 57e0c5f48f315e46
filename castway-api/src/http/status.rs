//! Stream status endpoint
//!
//! - `GET /api/status` - keys of every live stream

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub stream_key: String,
}

pub async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamStatus>> {
    let mut statuses: Vec<StreamStatus> = state
        .sfu
        .list_stream_keys()
        .into_iter()
        .map(|key| StreamStatus {
            stream_key: key.as_str().to_string(),
        })
        .collect();
    statuses.sort_by(|a, b| a.stream_key.cmp(&b.stream_key));
    Json(statuses)
}
