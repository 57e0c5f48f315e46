//! WHEP playback endpoints
//!
//! - `POST /api/whep` - body is the viewer's SDP offer; the answer carries
//!   `Link` headers for the two extensions below
//! - `GET /api/sse/{session_id}` - server-sent `layers` event listing the
//!   simulcast layers the viewer can pick from
//! - `POST /api/layer/{session_id}` - switch the viewer to another layer

use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use castway_sfu::{LayerId, SessionId};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use super::auth::StreamKeyAuth;
use super::whip::APPLICATION_SDP;
use super::{AppError, AppResult, AppState};

const SSE_LINK_REL: &str = "urn:ietf:params:whep:ext:core:server-sent-events";
const LAYER_LINK_REL: &str = "urn:ietf:params:whep:ext:core:layer";

/// One selectable layer in the `layers` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayerEntry {
    pub encoding_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaLayers {
    pub layers: Vec<LayerEntry>,
}

/// Payload of the `layers` event, keyed by media id (video is always `"1"`)
pub type LayersEvent = BTreeMap<String, MediaLayers>;

#[must_use]
pub fn layers_event(layers: Vec<LayerId>) -> LayersEvent {
    let layers = layers
        .into_iter()
        .map(|layer| LayerEntry {
            encoding_id: layer.as_str().to_string(),
        })
        .collect();
    BTreeMap::from([("1".to_string(), MediaLayers { layers })])
}

/// Body of a layer switch request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerRequest {
    #[serde(default)]
    pub media_id: Option<String>,
    pub encoding_id: String,
}

fn link(target: &str, params: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&format!("<{target}>; {params}"))
        .map_err(|e| AppError::internal_server_error(e.to_string()))
}

pub async fn subscribe(
    State(state): State<AppState>,
    StreamKeyAuth(key): StreamKeyAuth,
    offer: String,
) -> AppResult<Response> {
    let answer = state.sfu.playback(offer, &key).await?;
    let session_id = answer.session_id;

    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, HeaderValue::from_static("/api/whep"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(APPLICATION_SDP));
    headers.append(
        header::LINK,
        link(
            &format!("/api/sse/{session_id}"),
            &format!(r#"rel="{SSE_LINK_REL}"; events="layers""#),
        )?,
    );
    headers.append(
        header::LINK,
        link(
            &format!("/api/layer/{session_id}"),
            &format!(r#"rel="{LAYER_LINK_REL}""#),
        )?,
    );

    Ok((StatusCode::CREATED, headers, answer.sdp).into_response())
}

pub async fn layer_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let layers = state.sfu.list_layers(&SessionId::from(session_id));
    let event = Event::default()
        .event("layers")
        .json_data(layers_event(layers))
        .map_err(|e| AppError::internal_server_error(e.to_string()))?;

    Ok(Sse::new(stream::once(async move { Ok(event) })))
}

pub async fn switch_layer(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<LayerRequest>,
) -> AppResult<StatusCode> {
    let session_id = SessionId::from(session_id);
    if state
        .sfu
        .switch_layer(&session_id, &LayerId::from(request.encoding_id))
    {
        Ok(StatusCode::OK)
    } else {
        Err(AppError::not_found(format!("WHEP session {session_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_event_shape() {
        let event = layers_event(vec![LayerId::from("h"), LayerId::from("l")]);
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"1":{"layers":[{"encodingId":"h"},{"encodingId":"l"}]}}"#
        );
    }

    #[test]
    fn test_layer_request_media_id_is_optional() {
        let request: LayerRequest = serde_json::from_str(r#"{"encodingId":"h"}"#).unwrap();
        assert_eq!(request.encoding_id, "h");
        assert!(request.media_id.is_none());
    }
}
