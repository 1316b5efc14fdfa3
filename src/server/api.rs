/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Minimal administrative surface.

use crate::server::dispatcher::HttpHandler;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;

#[derive(Debug, Serialize)]
struct StatusReply {
    status: &'static str,
    version: &'static str,
    server_time: i64,
}

/// `GET /api/status`
pub struct StatusHandler;

#[async_trait]
impl HttpHandler for StatusHandler {
    async fn handle(
        &self,
        _query: Option<String>,
        _headers: &HeaderMap,
        _body: Bytes,
        _src_addr: SocketAddr,
    ) -> Response<Bytes> {
        let reply = StatusReply {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            server_time: chrono::Utc::now().timestamp_millis(),
        };

        let body = serde_json::to_vec(&reply).unwrap_or_else(|_| b"{}".to_vec());
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Bytes::from(body))
            .expect("status response")
    }
}
