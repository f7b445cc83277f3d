use std::io::Read;

use bytes::Bytes;
use cyder_tools::log::error;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use reqwest::{Proxy, StatusCode};

use crate::controller::error::RelayError;
use crate::schema::enum_def::ChannelType;

/// One shared client per `(channel type, proxy)` pair.
#[derive(Default)]
pub struct HttpClientPool {
    default_proxy: Option<String>,
    clients: DashMap<(ChannelType, Option<String>), reqwest::Client>,
}

impl HttpClientPool {
    pub fn new(default_proxy: Option<String>) -> Self {
        Self {
            default_proxy: default_proxy.filter(|p| !p.is_empty()),
            clients: DashMap::new(),
        }
    }

    /// A channel proxy wins over the global one.
    pub fn client_for(&self, channel_type: ChannelType, proxy: Option<&str>) -> Result<reqwest::Client, RelayError> {
        let proxy = proxy
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_proxy.clone());
        let key = (channel_type, proxy);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }
        let client = build_reqwest_client(key.1.as_deref())?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }
}

fn build_reqwest_client(proxy_url: Option<&str>) -> Result<reqwest::Client, RelayError> {
    let mut client_builder = reqwest::Client::builder();
    if let Some(proxy_url) = proxy_url {
        let proxy = Proxy::all(proxy_url).map_err(|e| {
            error!("Invalid proxy URL '{}': {}", proxy_url, e);
            RelayError::internal("invalid proxy configuration")
        })?;
        client_builder = client_builder.proxy(proxy);
    }
    client_builder.build().map_err(|e| {
        error!("Failed to build reqwest client: {}", e);
        RelayError::internal("failed to build HTTP client")
    })
}

pub fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"))
}

pub fn gunzip(body: Bytes) -> Result<Bytes, RelayError> {
    if body.is_empty() {
        return Ok(body);
    }
    let mut gz = GzDecoder::new(&body[..]);
    let mut decompressed = Vec::new();
    gz.read_to_end(&mut decompressed).map_err(|e| {
        error!("Gzip decoding failed: {}", e);
        RelayError::upstream_transport(format!("gzip decoding failed: {}", e))
    })?;
    Ok(Bytes::from(decompressed))
}

/// Reads a full upstream body, undoing gzip when the upstream sent it compressed.
pub async fn read_body(response: reqwest::Response) -> Result<(StatusCode, HeaderMap, Bytes), RelayError> {
    let status = response.status();
    let mut headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            RelayError::upstream_timeout()
        } else {
            RelayError::upstream_transport(e.to_string())
        }
    })?;
    let body = if is_gzip(&headers) { gunzip(body)? } else { body };
    strip_framing_headers(&mut headers);
    Ok((status, headers, body))
}

/// Headers that describe the upstream framing and must not be echoed.
pub fn strip_framing_headers(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_ENCODING);
    headers.remove(TRANSFER_ENCODING);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn clients_are_shared_per_type_and_proxy() {
        let pool = HttpClientPool::new(None);
        pool.client_for(ChannelType::OpenAi, None).unwrap();
        pool.client_for(ChannelType::OpenAi, Some("")).unwrap();
        pool.client_for(ChannelType::Anthropic, None).unwrap();
        pool.client_for(ChannelType::OpenAi, Some("http://127.0.0.1:9")).unwrap();
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn bad_proxy_is_an_internal_error() {
        let pool = HttpClientPool::new(None);
        let err = pool.client_for(ChannelType::OpenAi, Some("::not a url::")).unwrap_err();
        assert_eq!(err.code, "internal_error");
    }

    #[test]
    fn gzip_bodies_are_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());
        assert_eq!(&gunzip(compressed).unwrap()[..], b"{\"ok\":true}");
        assert!(gunzip(Bytes::from_static(b"plain")).is_err());
    }
}
