//! Package pull from HTTP(S) and CoAP(S) URIs

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lwm2m_coap::client::CoapClient;
use lwm2m_coap::{create_transport, Security, TransmissionParams, TransportError, TransportTarget};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use percent_encoding::percent_decode_str;
use tracing::{debug, info};
use url::Url;

use super::job::is_storage_full;
use crate::config::ServerUri;
use crate::error::UpdateError;

/// Fetches a package into a local file
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Download `uri` into `dest`, returning the number of bytes written
    async fn fetch(&self, uri: &Url, dest: &Path) -> Result<u64, UpdateError>;
}

/// Validate a package URI before any transfer starts
pub fn parse_package_uri(raw: &str) -> Result<Url, UpdateError> {
    let url = Url::parse(raw.trim()).map_err(|e| UpdateError::InvalidUri(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" | "coap" | "coaps" => {}
        other => return Err(UpdateError::UnsupportedProtocol(other.to_string())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(UpdateError::InvalidUri(format!("{} has no host", raw)));
    }
    Ok(url)
}

/// Fetcher using reqwest for HTTP(S) and the block-wise CoAP client
pub struct NetFetcher {
    http: reqwest::Client,
    params: TransmissionParams,
    block_szx: u8,
    bind: SocketAddr,
    /// Credentials for `coaps://` package servers
    coaps: Option<Security>,
}

impl NetFetcher {
    pub fn new(
        timeout: Duration,
        params: TransmissionParams,
        block_szx: u8,
        bind: SocketAddr,
        coaps: Option<Security>,
    ) -> Result<Self, UpdateError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|e| UpdateError::Updater(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            params,
            block_szx,
            bind,
            coaps,
        })
    }

    async fn fetch_http(&self, uri: &Url, file: &mut File) -> Result<u64, UpdateError> {
        let response = self
            .http
            .get(uri.clone())
            .send()
            .await
            .map_err(classify_http_error)?;
        let status = response.status();
        if status.is_client_error() {
            return Err(UpdateError::InvalidUri(format!("{} returned {}", uri, status)));
        }
        if !status.is_success() {
            return Err(UpdateError::ConnectionLost(format!("{} returned {}", uri, status)));
        }

        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_http_error)?;
            write_chunk(file, &chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    async fn fetch_coap(&self, uri: &Url, file: &mut File) -> Result<u64, UpdateError> {
        let secure = uri.scheme() == "coaps";
        let security = match (secure, &self.coaps) {
            (false, _) => Security::NoSec,
            (true, Some(security)) => security.clone(),
            (true, None) => {
                return Err(UpdateError::UnsupportedProtocol(
                    "coaps:// package server without credentials".into(),
                ))
            }
        };
        let host = uri
            .host_str()
            .ok_or_else(|| UpdateError::InvalidUri(uri.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port().unwrap_or(if secure {
            ServerUri::COAPS_PORT
        } else {
            ServerUri::COAP_PORT
        });
        let (segments, query) = coap_request_parts(uri)?;
        let target = TransportTarget {
            host,
            port,
            bind: self.bind,
            security,
        };
        let transport = create_transport(&target, &self.params)
            .await
            .map_err(classify_coap_error)?;
        let mut client = CoapClient::new(transport.clone(), self.params.clone());
        let mut get = client.blockwise_parts(segments, query, self.block_szx);
        let result = async {
            let mut written = 0u64;
            while let Some(chunk) = client.next_block(&mut get).await.map_err(classify_coap_error)? {
                write_chunk(file, &chunk).await?;
                written += chunk.len() as u64;
            }
            Ok::<_, UpdateError>(written)
        }
        .await;
        if let Err(e) = transport.close().await {
            debug!(error = %e, "Closing package transport failed");
        }
        result
    }
}

#[async_trait]
impl PackageFetcher for NetFetcher {
    async fn fetch(&self, uri: &Url, dest: &Path) -> Result<u64, UpdateError> {
        let part = dest.with_extension("part");
        let mut file = File::create(&part).await.map_err(storage_error)?;
        info!(uri = %uri, dest = %dest.display(), "Package download started");

        let result = match uri.scheme() {
            "http" | "https" => self.fetch_http(uri, &mut file).await,
            "coap" | "coaps" => self.fetch_coap(uri, &mut file).await,
            other => Err(UpdateError::UnsupportedProtocol(other.to_string())),
        };
        let finished = match result {
            Ok(written) => file.sync_all().await.map(|_| written).map_err(storage_error),
            Err(e) => Err(e),
        };
        drop(file);

        match finished {
            Ok(written) => {
                tokio::fs::rename(&part, dest).await.map_err(storage_error)?;
                info!(uri = %uri, bytes = written, "Package download complete");
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

async fn write_chunk(file: &mut File, chunk: &[u8]) -> Result<(), UpdateError> {
    file.write_all(chunk).await.map_err(storage_error)
}

/// Decoded Uri-Path segments and Uri-Query items of a CoAP package URI
fn coap_request_parts(uri: &Url) -> Result<(Vec<String>, Vec<String>), UpdateError> {
    let decode = |raw: &str| {
        percent_decode_str(raw)
            .decode_utf8()
            .map(|s| s.into_owned())
            .map_err(|e| UpdateError::InvalidUri(format!("{}: {}", uri, e)))
    };
    let segments = uri
        .path_segments()
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .map(decode)
        .collect::<Result<Vec<_>, _>>()?;
    let query = uri
        .query()
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter(|item| !item.is_empty())
        .map(decode)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((segments, query))
}

fn storage_error(e: std::io::Error) -> UpdateError {
    if is_storage_full(&e) {
        UpdateError::NotEnoughStorage(e.to_string())
    } else {
        UpdateError::Io(e)
    }
}

fn classify_http_error(e: reqwest::Error) -> UpdateError {
    debug!(error = %e, "HTTP download error");
    if e.is_builder() {
        UpdateError::InvalidUri(e.to_string())
    } else {
        // Connect, TLS validation, timeout and body errors
        UpdateError::ConnectionLost(e.to_string())
    }
}

fn classify_coap_error(e: TransportError) -> UpdateError {
    match e {
        TransportError::UnexpectedResponse(msg) => UpdateError::InvalidUri(msg),
        TransportError::InvalidConfig(msg) => UpdateError::UnsupportedProtocol(msg),
        other => UpdateError::ConnectionLost(other.to_string()),
    }
}
