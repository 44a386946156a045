//! Loading resources over HTTP.

use std::io;

use anyhow::{Context, bail};
use async_trait::async_trait;
use futures::TryStreamExt;
use immcache::{Loaded, Loader};
use reqwest::{Client, Url};
use tokio_util::io::StreamReader;

/// A [`Loader`] that treats keys as URLs and downloads them.
///
/// The size of a loaded resource is taken from the response, so resources served without a
/// `Content-Length` are handed out but never cached.
#[derive(Clone, Debug, Default)]
pub struct HttpLoader {
    client: Client,
}

impl HttpLoader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Loader for HttpLoader {
    async fn load(&self, key: &str) -> anyhow::Result<Loaded> {
        let url = Url::parse(key).context("invalid resource URL")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {key}"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("unexpected HTTP response {status} for {key}");
        }

        let size = response.content_length();
        tracing::trace!(url = key, ?size, "Fetching resource");

        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Loaded::new(size, StreamReader::new(Box::pin(stream))))
    }
}
