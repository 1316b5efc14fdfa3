/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! HTTP dispatcher - routes requests based on method and path.

use crate::server::api::StatusHandler;
use crate::server::doh::{DohEndpoint, MAX_DNS_MESSAGE_SIZE};
use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handler for one `(method, path)` route.
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        query: Option<String>,
        headers: &HeaderMap,
        body: Bytes,
        src_addr: SocketAddr,
    ) -> Response<Bytes>;
}

/// Routes incoming requests to the registered handler; unmatched routes
/// get a 404.
pub struct HttpDispatcher {
    routes: AHashMap<(Method, String), Box<dyn HttpHandler>>,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self {
            routes: AHashMap::new(),
        }
    }

    /// Build the full route table: DoH GET/POST plus the admin surface.
    pub fn with_routes(doh_path: &str, endpoint: Arc<DohEndpoint>) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_route(
            Method::GET,
            doh_path.to_string(),
            Box::new(DohGetHandler {
                endpoint: endpoint.clone(),
            }),
        );
        dispatcher.register_route(
            Method::POST,
            doh_path.to_string(),
            Box::new(DohPostHandler { endpoint }),
        );
        dispatcher.register_route(
            Method::GET,
            "/api/status".to_string(),
            Box::new(StatusHandler),
        );
        dispatcher
    }

    pub fn register_route(&mut self, method: Method, path: String, handler: Box<dyn HttpHandler>) {
        debug!("registering route: {} {}", method, path);
        self.routes.insert((method, path), handler);
    }

    pub async fn handle_request(
        &self,
        method: Method,
        path: String,
        query: Option<String>,
        headers: &HeaderMap,
        body: Bytes,
        src_addr: SocketAddr,
    ) -> Response<Bytes> {
        debug!("received request: {} {} from {}", method, path, src_addr);

        if let Some(handler) = self.routes.get(&(method.clone(), path.clone())) {
            handler.handle(query, headers, body, src_addr).await
        } else {
            warn!("route not found: {} {}", method, path);
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header("Content-Type", "text/plain")
                .body(Bytes::from_static(b"404 Not Found"))
                .expect("404 response")
        }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// DoH GET: query in the URL (`?dns=` base64url or `?name=`).
struct DohGetHandler {
    endpoint: Arc<DohEndpoint>,
}

#[async_trait]
impl HttpHandler for DohGetHandler {
    async fn handle(
        &self,
        query: Option<String>,
        _headers: &HeaderMap,
        _body: Bytes,
        src_addr: SocketAddr,
    ) -> Response<Bytes> {
        self.endpoint
            .handle_get(query.as_deref(), Some(src_addr))
            .await
    }
}

/// DoH POST: binary `application/dns-message` or JSON body.
struct DohPostHandler {
    endpoint: Arc<DohEndpoint>,
}

#[async_trait]
impl HttpHandler for DohPostHandler {
    async fn handle(
        &self,
        _query: Option<String>,
        headers: &HeaderMap,
        body: Bytes,
        src_addr: SocketAddr,
    ) -> Response<Bytes> {
        // Cap request size before touching the body; prevents memory
        // exhaustion from oversized posts.
        if body.len() > MAX_DNS_MESSAGE_SIZE {
            warn!("DNS message too large: {} bytes from {}", body.len(), src_addr);
            return Response::builder()
                .status(StatusCode::PAYLOAD_TOO_LARGE)
                .header("Content-Type", "text/plain")
                .body(Bytes::from_static(b"413 Payload Too Large"))
                .expect("error response");
        }

        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        self.endpoint
            .handle_post(content_type, &body, Some(src_addr))
            .await
    }
}
