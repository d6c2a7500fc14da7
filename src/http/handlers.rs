//! Request handlers
//!
//! The file endpoint ties the whole data plane together: URL grammar →
//! resolver → router → range engine. The rest of the surface (root
//! redirect, status document, watch page, CORS preflight) is intentionally
//! small.

use std::collections::{BTreeMap, HashMap};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::json;
use tracing::{debug, error, info};

use crate::error::GatewayError;
use crate::http::path::parse_media_request;
use crate::http::{apply_cors, apply_no_cache, readable_uptime, render, AppState};
use crate::ledger::LedgerGuard;
use crate::router::select_session;
use crate::stream::{body_for, content_range, parse_range, RangeError, StreamRequest};

/// Characters percent-encoded inside `Content-Disposition` filenames.
const FILENAME_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'_')
    .remove(b'-');

/// `GET /`: redirect to the project documentation.
pub async fn root(State(state): State<AppState>) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    if let Ok(location) = HeaderValue::from_str(&state.doc_url) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    response
}

/// `OPTIONS *`: the CORS preamble.
pub async fn preflight() -> Response {
    let mut response = StatusCode::OK.into_response();
    apply_cors(response.headers_mut());
    response.headers_mut().insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

/// `GET /status`: operational snapshot as JSON.
pub async fn status(State(state): State<AppState>) -> Response {
    let distribution: BTreeMap<String, usize> = state
        .ledger
        .snapshot()
        .into_iter()
        .map(|(id, load)| (id.to_string(), load))
        .collect();

    let username = state
        .pool
        .primary_username()
        .unwrap_or_else(|| "unknown".to_string());

    let document = json!({
        "server": {
            "status": "operational",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": readable_uptime(state.started_at.elapsed()),
        },
        "telegram_bot": {
            "username": format!("@{username}"),
            "active_clients": state.pool.active_count(),
        },
        "resources": {
            "total_workload": state.ledger.total_load(),
            "workload_distribution": distribution,
        },
    });

    let mut response = Json(document).into_response();
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// `GET|HEAD /watch/<path>`: HTML preview page.
pub async fn watch(
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match parse_media_request(&path, query.get("hash").map(String::as_str)) {
        Ok((message_id, hash)) => {
            let page = render::watch_page(message_id, &hash);
            let mut response = Response::new(Body::from(page));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            );
            headers.insert(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Range, Content-Type, *"),
            );
            apply_no_cache(headers);
            response
        }
        Err(e) => error_response(e),
    }
}

/// `GET|HEAD /<path>`: the streaming file endpoint.
pub async fn media(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    match serve_media(state, method, path, query, headers).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn serve_media(
    state: AppState,
    method: Method,
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let (message_id, _hash) = parse_media_request(&path, query.get("hash").map(String::as_str))?;

    // The router's hard fallback to the primary cannot rescue an empty
    // pool; fail before touching the resolver or the ledger.
    if state.pool.active_count() == 0 {
        return Err(GatewayError::NoFallback(
            "no upstream sessions are live".to_string(),
        ));
    }

    // Route before resolving: the routed session is the resolver's
    // last-resort metadata source for this request.
    let session_id = select_session(&state.ledger, Some(message_id));
    let descriptor = state.resolver.resolve(message_id, session_id).await?;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let range = parse_range(range_header, descriptor.file_size).map_err(|e| match e {
        RangeError::Invalid(h) => GatewayError::InvalidRange(h),
        RangeError::Unsatisfiable { size } => GatewayError::UnsatisfiableRange { size },
    })?;

    // A resolved full interval is served as a plain 200, Range header or not.
    let full = range.is_full(descriptor.file_size);
    let status = if full {
        StatusCode::OK
    } else {
        StatusCode::PARTIAL_CONTENT
    };

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&descriptor.mime_type) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&range.len().to_string()) {
        response_headers.insert(header::CONTENT_LENGTH, value);
    }
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    let filename = utf8_percent_encode(&descriptor.file_name, FILENAME_ENCODE).to_string();
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{filename}\"")) {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response_headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    apply_no_cache(&mut response_headers);
    apply_cors(&mut response_headers);
    if !full {
        if let Ok(value) = HeaderValue::from_str(&content_range(range, descriptor.file_size)) {
            response_headers.insert(header::CONTENT_RANGE, value);
        }
    }

    let mut guard = LedgerGuard::new(state.ledger.clone());
    guard.borrow(session_id);
    info!(
        message_id,
        session = session_id,
        load = state.ledger.load_of(session_id).unwrap_or(0),
        start = range.start,
        end = range.end,
        "stream opened"
    );

    let body = if method == Method::HEAD {
        // Same header derivation, no body; the guard settles immediately.
        drop(guard);
        Body::empty()
    } else {
        body_for(
            state.pool.clone(),
            state.ledger.clone(),
            StreamRequest {
                message_id,
                range,
                initial_session: session_id,
            },
            guard,
        )
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Map a [`GatewayError`] onto the HTTP surface.
fn error_response(e: GatewayError) -> Response {
    match e {
        GatewayError::InvalidUrl | GatewayError::DescriptorNotFound(_) => {
            debug!(error = %e, "resource not found");
            (StatusCode::NOT_FOUND, "Resource not found").into_response()
        }
        GatewayError::InvalidRange(header_value) => {
            debug!(header = %header_value, "invalid range header");
            (
                StatusCode::BAD_REQUEST,
                format!("Invalid range header: {header_value}"),
            )
                .into_response()
        }
        GatewayError::UnsatisfiableRange { size } => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
        }
        GatewayError::NoFallback(reason) => {
            let error_id = new_error_id();
            error!(error_id = %error_id, reason = %reason, "no session available for request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("An unexpected server error occurred: {error_id}"),
            )
                .into_response()
        }
        other => {
            let error_id = new_error_id();
            error!(error_id = %error_id, error = %other, "server error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("An unexpected server error occurred: {error_id}"),
            )
                .into_response()
        }
    }
}

/// Short hex id correlating a 500 response with its log line.
fn new_error_id() -> String {
    let bytes: [u8; 6] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_id_is_twelve_hex_chars() {
        let id = new_error_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unsatisfiable_range_carries_content_range() {
        let response = error_response(GatewayError::UnsatisfiableRange { size: 5_242_880 });
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            "bytes */5242880"
        );
    }

    #[test]
    fn test_not_found_mapping() {
        let response = error_response(GatewayError::InvalidUrl);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = error_response(GatewayError::DescriptorNotFound(5));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_no_fallback_maps_to_500() {
        let response = error_response(GatewayError::NoFallback("pool empty".into()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_filename_percent_encoding() {
        let encoded = utf8_percent_encode("My Movie (1).mkv", FILENAME_ENCODE).to_string();
        assert_eq!(encoded, "My%20Movie%20%281%29.mkv");
    }
}
