// Stream key authorization

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use castway_sfu::StreamKey;

use super::AppError;

/// Stream key carried in the `Authorization` header.
///
/// The key is the whole credential, with an optional `Bearer ` prefix.
#[derive(Debug, Clone)]
pub struct StreamKeyAuth(pub StreamKey);

impl<S> FromRequestParts<S> for StreamKeyAuth
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| AppError::bad_request("Authorization was not set"))?;
        let value = header
            .to_str()
            .map_err(|_| AppError::bad_request("Authorization is not valid text"))?;

        parse_stream_key(value)
            .map(Self)
            .ok_or_else(|| AppError::bad_request("Authorization was not set"))
    }
}

fn parse_stream_key(value: &str) -> Option<StreamKey> {
    let key = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if key.is_empty() {
        None
    } else {
        Some(StreamKey::from(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_key() {
        assert_eq!(parse_stream_key("live"), Some(StreamKey::from("live")));
        assert_eq!(parse_stream_key("Bearer live"), Some(StreamKey::from("live")));
        assert_eq!(parse_stream_key("Bearer "), None);
        assert_eq!(parse_stream_key("  "), None);
    }
}
