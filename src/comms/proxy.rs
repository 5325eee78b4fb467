use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

use crate::comms::edge_gate::ErrorResponse;

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Correlates a request across the gate and the upstream logs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// Connection-scoped headers never travel past a proxy hop.
const HOP_BY_HOP: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwards authorized requests to the internal services.
#[derive(Debug, Clone)]
pub struct Upstream {
    base_url: String,
    client: Client,
}

impl Upstream {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("creating upstream HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn forward(&self, req: Request) -> Response {
        match self.try_forward(req).await {
            Ok(response) => response,
            Err(e) => {
                error!("upstream forward failed: {:#}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    Json(ErrorResponse {
                        error: "bad_gateway".to_string(),
                        message: "Upstream unavailable".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }

    async fn try_forward(&self, req: Request) -> Result<Response> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path_and_query);

        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .context("reading request body")?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        let request_id = ensure_request_id(&mut headers);

        debug!(method = %parts.method, url = %url, request_id = %request_id, "forwarding to upstream");

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .context("sending upstream request")?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        let bytes = upstream.bytes().await.context("reading upstream body")?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Keep a caller-supplied request id, otherwise mint one.
fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return id.to_string();
    }
    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    id
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}
