use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use reqwest::{Body, Client, Url};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::classify::{classify_error, classify_status};
use crate::{UplinkError, UploadBody, UploadOutcome, UploadRequest, Uploader};

pub const FILENAME_HEADER: &str = "x-filename";
pub const CONTENT_HASH_HEADER: &str = "x-content-sha256";
pub const SOURCE_HOST_HEADER: &str = "x-source-host";

/// Longest response body excerpt kept in a failure reason.
const REASON_BODY_LIMIT: usize = 200;

/// Read size when streaming a file body.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Settings for [`HttpUploader`].
#[derive(Debug, Clone)]
pub struct HttpUploaderConfig {
    pub url: String,
    /// Bound on the whole request, connect to last body byte.
    pub timeout: Duration,
    /// When false, server certificates are not checked.
    pub verify_tls: bool,
    /// Sent as `x-source-host` when set.
    pub source_host: Option<String>,
}

/// Parses an endpoint URL, accepting only http and https.
pub fn parse_endpoint(url: &str) -> Result<Url, UplinkError> {
    let parsed = Url::parse(url).map_err(|e| UplinkError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UplinkError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(parsed)
}

/// Uploads artifacts with one `POST` per attempt, body = raw bytes.
pub struct HttpUploader {
    client: Client,
    url: Url,
    source_host: Option<HeaderValue>,
}

impl HttpUploader {
    pub fn new(config: HttpUploaderConfig) -> Result<Self, UplinkError> {
        let url = parse_endpoint(&config.url)?;

        if !config.verify_tls {
            warn!(url = %url, "TLS certificate verification is DISABLED for uploads");
        }

        let source_host = config
            .source_host
            .filter(|h| !h.is_empty())
            .map(|h| {
                HeaderValue::from_str(&h).map_err(|e| UplinkError::InvalidHeader {
                    name: SOURCE_HOST_HEADER,
                    reason: format!("{h:?}: {e}"),
                })
            })
            .transpose()?;

        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self {
            client,
            url,
            source_host,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn send(&self, request: &UploadRequest) -> UploadOutcome {
        let (body, stream_len) = match open_body(&request.body).await {
            Ok(opened) => opened,
            Err(outcome) => {
                debug!(artifact = %request.filename, outcome = ?outcome, "could not open upload body");
                return outcome;
            }
        };
        let mut builder = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(FILENAME_HEADER, request.filename.as_str())
            .body(body);
        // Streamed bodies would otherwise go out chunked.
        if let Some(len) = stream_len {
            builder = builder.header(CONTENT_LENGTH, len);
        }
        if let Some(hash) = &request.expected_hash {
            builder = builder.header(CONTENT_HASH_HEADER, hash.as_str());
        }
        if let Some(host) = &self.source_host {
            builder = builder.header(SOURCE_HOST_HEADER, host.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(artifact = %request.filename, error = %e, "upload request failed");
                return classify_error(&e).into();
            }
        };

        let status = response.status();
        let outcome = classify_status(status);
        if outcome.is_success() {
            return outcome;
        }

        // Include the start of the body in the reason; receivers put their
        // rejection message there.
        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.trim().chars().take(REASON_BODY_LIMIT).collect();
        debug!(artifact = %request.filename, status = status.as_u16(), body = %excerpt, "upload rejected");
        if excerpt.is_empty() {
            return outcome;
        }
        match outcome {
            UploadOutcome::RetryableFailure { reason } => UploadOutcome::RetryableFailure {
                reason: format!("{reason}: {excerpt}"),
            },
            UploadOutcome::PermanentFailure { reason } => UploadOutcome::PermanentFailure {
                reason: format!("{reason}: {excerpt}"),
            },
            other => other,
        }
    }
}

/// Builds a fresh body for one attempt. Streamed bodies come with their length.
async fn open_body(body: &UploadBody) -> Result<(Body, Option<u64>), UploadOutcome> {
    match body {
        UploadBody::Bytes(bytes) => Ok((Body::from(bytes.clone()), None)),
        UploadBody::File(path) => {
            let opened = async {
                let file = tokio::fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                Ok::<_, std::io::Error>((file, len))
            }
            .await;
            match opened {
                Ok((file, len)) => Ok((
                    Body::wrap_stream(ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)),
                    Some(len),
                )),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(UploadOutcome::PermanentFailure {
                        reason: format!("artifact file {} is gone", path.display()),
                    })
                }
                Err(e) => Err(UploadOutcome::RetryableFailure {
                    reason: format!("failed to open {}: {e}", path.display()),
                }),
            }
        }
    }
}

impl Uploader for HttpUploader {
    fn upload<'a>(
        &'a self,
        request: &'a UploadRequest,
    ) -> Pin<Box<dyn Future<Output = UploadOutcome> + Send + 'a>> {
        Box::pin(self.send(request))
    }
}
