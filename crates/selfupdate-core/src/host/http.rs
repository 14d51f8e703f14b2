//! HTTP update source

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::capability::{ImageBody, UpdateCheck, UpdateOffer, UpdateSource};
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};

/// Request header carrying the running firmware version
pub const VERSION_HEADER: &str = "x-firmware-version";

/// Response header carrying the hex SHA-256 digest of the image
pub const CHECKSUM_HEADER: &str = "x-firmware-sha256";

/// Polls a single URL that answers 200 with an image or 304 when current
pub struct HttpUpdateSource {
    client: Client,
    url: String,
}

impl HttpUpdateSource {
    /// Source for `url`. `connect_timeout` bounds connection setup only; body
    /// reads are bounded per chunk by the fetch agent.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("selfupdate-core/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Source for the configured endpoint
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        Self::new(config.endpoint_url.clone(), config.request_timeout())
    }

    /// Endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn check_update(&self, current_version: &semver::Version) -> Result<UpdateCheck> {
        debug!("Checking {} for updates to {}", self.url, current_version);

        let response = self
            .client
            .get(&self.url)
            .header(VERSION_HEADER, current_version.to_string())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let content_length = response.content_length();
                let sha256 = response
                    .headers()
                    .get(CHECKSUM_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim().to_ascii_lowercase())
                    .filter(|v| !v.is_empty());

                Ok(UpdateCheck::Available(UpdateOffer {
                    content_length,
                    sha256,
                    body: Box::new(HttpImageBody {
                        stream: response.bytes_stream().boxed(),
                    }),
                }))
            }
            StatusCode::NOT_MODIFIED => Ok(UpdateCheck::UpToDate),
            other => Ok(UpdateCheck::Unexpected(other.as_u16())),
        }
    }
}

struct HttpImageBody {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
}

#[async_trait]
impl ImageBody for HttpImageBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.stream.next().await.transpose().map_err(UpdateError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source_for(server: &MockServer) -> anyhow::Result<HttpUpdateSource> {
        Ok(HttpUpdateSource::new(
            format!("{}/firmware.bin", server.uri()),
            Duration::from_secs(5),
        )?)
    }

    async fn drain(body: &mut dyn ImageBody) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_ok_response_offers_streamed_image() -> Result<()> {
        let server = MockServer::start().await;
        let image = vec![0xA5u8; 3000];

        Mock::given(method("GET"))
            .and(path("/firmware.bin"))
            .and(header(VERSION_HEADER, "1.2.3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(CHECKSUM_HEADER, "ABCDEF")
                    .set_body_bytes(image.clone()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server)?;
        let check = source.check_update(&semver::Version::new(1, 2, 3)).await?;

        let mut offer = match check {
            UpdateCheck::Available(offer) => offer,
            other => panic!("expected an offer, got {other:?}"),
        };
        assert_eq!(offer.content_length, Some(3000));
        assert_eq!(offer.sha256.as_deref(), Some("abcdef"));
        assert_eq!(drain(offer.body.as_mut()).await?, image);
        Ok(())
    }

    #[tokio::test]
    async fn test_not_modified_means_up_to_date() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let source = source_for(&server)?;
        let check = source.check_update(&semver::Version::new(1, 0, 0)).await?;
        assert!(matches!(check, UpdateCheck::UpToDate));
        Ok(())
    }

    #[tokio::test]
    async fn test_other_status_is_unexpected() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source = source_for(&server)?;
        let check = source.check_update(&semver::Version::new(1, 0, 0)).await?;
        assert!(matches!(check, UpdateCheck::Unexpected(500)));
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_failure_is_transient_network_error() -> Result<()> {
        let server = MockServer::start().await;
        let url = format!("{}/firmware.bin", server.uri());
        drop(server);

        let source = HttpUpdateSource::new(url, Duration::from_secs(1))?;
        let result = source.check_update(&semver::Version::new(1, 0, 0)).await;

        match result {
            Err(e @ UpdateError::Network(_)) => {
                assert_eq!(e.class(), crate::error::ErrorClass::Transient)
            }
            other => panic!("expected network error, got {other:?}"),
        }
        Ok(())
    }
}
