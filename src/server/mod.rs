/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! HTTP surface.
//!
//! Serves DoH over HTTP/2 (plain TCP or TLS) and the minimal admin
//! endpoints. Each connection is handled in its own task; each HTTP/2
//! request is spawned for maximum concurrency.

pub mod api;
pub mod dispatcher;
pub mod doh;

use crate::config::types::ServerConfig;
use crate::core::error::{DnsError, Result};
use crate::plugin::chain::Chain;
use crate::server::dispatcher::HttpDispatcher;
use crate::server::doh::DohEndpoint;
use bytes::Bytes;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// DoH HTTP server.
pub struct HttpServer {
    listen: String,
    dispatcher: Arc<HttpDispatcher>,
    tls: Option<Arc<rustls::ServerConfig>>,
    src_ip_header: Arc<Option<String>>,
}

impl HttpServer {
    pub fn from_config(config: &ServerConfig, chain: Arc<Chain>) -> Result<Self> {
        let endpoint = Arc::new(DohEndpoint::new(chain));
        let dispatcher = Arc::new(HttpDispatcher::with_routes(&config.path, endpoint));

        let tls = match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => Some(Arc::new(load_tls_config(cert, key)?)),
            _ => None,
        };

        Ok(HttpServer {
            listen: config.listen.clone(),
            dispatcher,
            tls,
            src_ip_header: Arc::new(config.src_ip_header.clone()),
        })
    }

    /// Accept loop. Runs until the process exits.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        if self.tls.is_some() {
            info!("HTTPS (HTTP/2) DoH server listening on {}", self.listen);
        } else {
            info!("HTTP (HTTP/2) DoH server listening on {}", self.listen);
        }

        let tls_acceptor = self.tls.clone().map(TlsAcceptor::from);

        // JoinSet to track all active connection tasks
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut active_connections = 0u64;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, src)) => {
                            let dispatcher = self.dispatcher.clone();
                            let src_ip_header = self.src_ip_header.clone();
                            let tls_acceptor = tls_acceptor.clone();

                            active_connections += 1;
                            debug!("new connection from {} (active: {})", src, active_connections);

                            tasks.spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            handle_http_stream(tls_stream, src, dispatcher, src_ip_header).await;
                                        }
                                        Err(e) => {
                                            warn!("TLS handshake failed for {}: {}", src, e);
                                        }
                                    }
                                } else {
                                    handle_http_stream(stream, src, dispatcher, src_ip_header).await;
                                }
                            });
                        }
                        Err(e) => {
                            debug!(%e, "error accepting HTTP connection");
                        }
                    }
                }

                // Clean up finished tasks
                Some(result) = tasks.join_next() => {
                    active_connections = active_connections.saturating_sub(1);
                    if let Err(e) = result {
                        warn!("connection task panicked: {:?}", e);
                    }
                }
            }
        }
    }
}

/// Handle HTTP/2 requests over a stream (TLS or plain TCP).
async fn handle_http_stream<S>(
    stream: S,
    src: SocketAddr,
    dispatcher: Arc<HttpDispatcher>,
    src_ip_header: Arc<Option<String>>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static,
{
    let mut h2 = match h2::server::handshake(stream).await {
        Ok(h2) => h2,
        Err(err) => {
            warn!("HTTP/2 handshake error from {}: {}", src, err);
            return;
        }
    };

    loop {
        let (request, mut respond) = match h2.accept().await {
            Some(Ok(next_request)) => next_request,
            Some(Err(err)) => {
                warn!("error accepting HTTP/2 request from {}: {}", src, err);
                return;
            }
            None => {
                debug!("HTTP/2 connection closed by {}", src);
                return;
            }
        };

        let dispatcher = dispatcher.clone();
        let src_ip_header = src_ip_header.clone();

        // Each request runs in its own task so one slow upstream call
        // never blocks the other multiplexed streams.
        tokio::spawn(async move {
            let method = request.method().clone();
            let uri = request.uri().clone();
            let path = uri.path().to_string();
            let query = uri.query().map(|s| s.to_string());
            let headers = request.headers().clone();

            let client_addr = extract_client_ip(&headers, &src_ip_header, src);

            // Read the body with HTTP/2 flow control.
            let mut recv_stream = request.into_body();
            let mut body_bytes = Vec::new();
            while let Some(chunk_result) = recv_stream.data().await {
                match chunk_result {
                    Ok(chunk) => {
                        body_bytes.extend_from_slice(&chunk);
                        // Release the flow-control window so the sender
                        // can continue.
                        let _ = recv_stream.flow_control().release_capacity(chunk.len());
                    }
                    Err(e) => {
                        warn!("failed to read request body chunk from {}: {}", src, e);
                        break;
                    }
                }
            }

            let response = dispatcher
                .handle_request(
                    method,
                    path,
                    query,
                    &headers,
                    Bytes::from(body_bytes),
                    client_addr,
                )
                .await;

            let (parts, response_bytes) = response.into_parts();
            let h2_response = match http::Response::builder()
                .status(parts.status)
                .body(())
            {
                Ok(mut resp) => {
                    *resp.headers_mut() = parts.headers;
                    resp
                }
                Err(e) => {
                    warn!("failed to build HTTP/2 response: {}", e);
                    return;
                }
            };

            let mut send_stream = match respond.send_response(h2_response, false) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to send HTTP/2 response headers to {}: {}", src, e);
                    return;
                }
            };
            if let Err(e) = send_stream.send_data(response_bytes, true) {
                warn!("failed to send HTTP/2 response body to {}: {}", src, e);
            }
        });
    }
}

/// Load a rustls server config from PEM cert/key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig> {
    let cert_file = File::open(cert_path)
        .map_err(|e| DnsError::config(format!("failed to open cert '{}': {}", cert_path, e)))?;
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect();
    let certs = certs
        .map_err(|e| DnsError::config(format!("failed to parse cert '{}': {}", cert_path, e)))?;
    if certs.is_empty() {
        return Err(DnsError::config(format!(
            "no certificates found in '{}'",
            cert_path
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| DnsError::config(format!("failed to open key '{}': {}", key_path, e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| DnsError::config(format!("failed to parse key '{}': {}", key_path, e)))?
        .ok_or_else(|| DnsError::config(format!("no private key found in '{}'", key_path)))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DnsError::config(format!("invalid TLS configuration: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(config)
}

/// Extract the real client address from HTTP headers.
///
/// Behind a reverse proxy the TCP source is the proxy; the configured
/// header (X-Real-IP / X-Forwarded-For style) carries the client. Falls
/// back to the TCP source on any parse failure.
pub fn extract_client_ip(
    headers: &http::HeaderMap,
    src_ip_header: &Option<String>,
    tcp_src: SocketAddr,
) -> SocketAddr {
    let Some(header_name) = src_ip_header else {
        return tcp_src;
    };
    let Some(header_value) = headers.get(header_name.as_str()) else {
        return tcp_src;
    };
    let Ok(raw) = header_value.to_str() else {
        return tcp_src;
    };

    if let Ok(addr) = SocketAddr::from_str(raw) {
        return addr;
    }
    if let Ok(ip) = raw.parse::<std::net::IpAddr>() {
        return SocketAddr::new(ip, tcp_src.port());
    }
    // X-Forwarded-For may list several hops; the first is the client.
    if let Some(first) = raw.split(',').next() {
        if let Ok(ip) = first.trim().parse::<std::net::IpAddr>() {
            return SocketAddr::new(ip, tcp_src.port());
        }
    }

    warn!("failed to parse IP from header {}: {}", header_name, raw);
    tcp_src
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn tcp_src() -> SocketAddr {
        "203.0.113.9:4444".parse().unwrap()
    }

    #[test]
    fn no_header_configured_uses_tcp_source() {
        let headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers, &None, tcp_src()), tcp_src());
    }

    #[test]
    fn bare_ip_header_keeps_tcp_port() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.7".parse().unwrap());
        let addr = extract_client_ip(&headers, &Some("x-real-ip".to_string()), tcp_src());
        assert_eq!(addr, "198.51.100.7:4444".parse().unwrap());
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.7, 10.0.0.1".parse().unwrap(),
        );
        let addr = extract_client_ip(&headers, &Some("x-forwarded-for".to_string()), tcp_src());
        assert_eq!(addr.ip(), "198.51.100.7".parse::<std::net::IpAddr>().unwrap());
    }

    #[test]
    fn garbage_header_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "not-an-ip".parse().unwrap());
        let addr = extract_client_ip(&headers, &Some("x-real-ip".to_string()), tcp_src());
        assert_eq!(addr, tcp_src());
    }
}
