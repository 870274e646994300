//! Request extractors and guards.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use serde::de::DeserializeOwned;

use crate::response::error_response;

/// JSON body whose rejections use the API error envelope.
///
/// A missing or wrong content type answers 415; any body that does not
/// parse into `T` answers 400.
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(JsonRejection::MissingJsonContentType(e)) => {
                Err(error_response(&e.body_text(), StatusCode::UNSUPPORTED_MEDIA_TYPE))
            }
            Err(e) => Err(error_response(&e.body_text(), StatusCode::BAD_REQUEST)),
        }
    }
}

/// Address the request came from: the first `X-Forwarded-For` hop, else
/// the socket peer when the server records connection info.
pub struct PeerAddr(pub Option<String>);

impl<S> FromRequestParts<S> for PeerAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let address = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });
        Ok(Self(address))
    }
}

const JSON_MEDIA_TYPES: [&str; 4] = ["*/*", "application/*", "application/json", "application/hal+json"];

/// Whether the `Accept` header admits a JSON response. No header admits anything.
pub fn accepts_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT) else {
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    accept
        .split(',')
        .filter_map(|range| range.split(';').next())
        .map(str::trim)
        .any(|range| JSON_MEDIA_TYPES.contains(&range))
}

/// Middleware answering 406 to clients that refuse JSON.
pub async fn require_json_accept(request: Request, next: Next) -> Response {
    if !accepts_json(request.headers()) {
        return error_response("only application/json responses are available", StatusCode::NOT_ACCEPTABLE);
    }
    next.run(request).await
}
