use async_trait::async_trait;
use futures_util::StreamExt;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::{CheckpointSignature, MetaError, MetaResult, NamespaceInfo};

pub const IMAGE_SHA256_HEADER: &str = "metanode-image-sha256";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type ImageReader = Pin<Box<dyn AsyncRead + Send>>;

/// An open checkpoint image download. The reader yields the raw image
/// bytes; length and digest come from the response headers when the
/// server provides them.
pub struct ImageDownload {
    pub reader: ImageReader,
    pub content_length: Option<u64>,
    pub sha256: Option<String>,
}

/// Client side of the active metadata server's HTTP endpoints, behind
/// a trait so the bootstrap flow can be driven against fakes.
#[async_trait]
pub trait ActiveNodeClient: Send + Sync {
    fn address(&self) -> &str;
    async fn get_namespace_info(&self) -> MetaResult<NamespaceInfo>;
    async fn get_checkpoint_signature(&self) -> MetaResult<CheckpointSignature>;
    async fn open_image(&self, txid: u64) -> MetaResult<ImageDownload>;
}

pub struct HttpNodeClient {
    address: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpNodeClient {
    pub fn new(address: &str) -> MetaResult<Self> {
        // Only the connect phase is bounded here: image downloads run
        // as long as the throttle dictates.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| MetaError::Internal(format!("build http client failed: {}", e)))?;
        Ok(Self {
            address: address.to_string(),
            base_url: format!("http://{}/meta/v1", address),
            client,
        })
    }

    fn map_request_error(&self, what: &str, e: reqwest::Error) -> MetaError {
        if e.is_connect() || e.is_timeout() {
            MetaError::FailedConnect(format!(
                "{} from {} failed: {}",
                what, self.address, e
            ))
        } else {
            MetaError::RemoteError(format!("{} from {} failed: {}", what, self.address, e))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, what: &str) -> MetaResult<T> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_request_error(what, e))?;
        if !resp.status().is_success() {
            return Err(MetaError::from_http_status(
                resp.status(),
                format!("{} from {} failed", what, url),
            ));
        }
        resp.json::<T>().await.map_err(|e| {
            MetaError::InvalidData(format!("decode {} from {} failed: {}", what, url, e))
        })
    }
}

#[async_trait]
impl ActiveNodeClient for HttpNodeClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_namespace_info(&self) -> MetaResult<NamespaceInfo> {
        self.get_json("namespace", "namespace info").await
    }

    async fn get_checkpoint_signature(&self) -> MetaResult<CheckpointSignature> {
        self.get_json("checkpoint", "checkpoint signature").await
    }

    async fn open_image(&self, txid: u64) -> MetaResult<ImageDownload> {
        let url = format!("{}/image/{}", self.base_url, txid);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_request_error("image download", e))?;
        if !resp.status().is_success() {
            return Err(MetaError::from_http_status(
                resp.status(),
                format!("image download from {} failed", url),
            ));
        }

        let content_length = resp.content_length();
        let sha256 = resp
            .headers()
            .get(IMAGE_SHA256_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let stream = resp.bytes_stream().map(|r| {
            r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("stream error: {}", e)))
        });
        Ok(ImageDownload {
            reader: Box::pin(StreamReader::new(stream)),
            content_length,
            sha256,
        })
    }
}
