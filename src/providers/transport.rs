use std::pin::Pin;
use std::time::Duration;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::{debug, error, trace};

/// Raw body chunks of a streamed reply. Dropping it releases the
/// underlying connection.
pub type ByteStream
  = Pin<Box<dyn Stream<Item = crate::Result<Vec<u8>>> + Send>>;

/// Cap on how much of an error reply body is read
pub const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Buffered HTTP reply
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse
{   pub status: u16
  , pub body: String
}

/// HTTP reply whose body is read incrementally
pub struct RawStream
{   pub status: u16
  , pub body: ByteStream
}

impl RawStream
{   /// Drain at most `limit` bytes of the body into a string, used
    /// for error replies
    pub async fn into_text(mut self, limit: usize) -> String
    {   let mut bytes = Vec::new();
        while bytes.len() < limit
        {   match self.body.next().await
            {   Some(Ok(part)) => {
                  let take = part.len().min(limit - bytes.len());
                  bytes.extend_from_slice(&part[..take]);
                }
              , Some(Err(_)) | None => break
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Wire seam between the dispatcher and the network.
///
/// Implementations report connection failures and timeouts as
/// `Error::TransientServerError`; any HTTP status is returned as-is
/// and classified by the caller.
#[async_trait]
pub trait Transport: Send + Sync
{   /// POST a JSON body and read the whole reply
    async fn post_json(
      &self
    , path: &str
    , body: &serde_json::Value
    , timeout: Duration
    ) -> crate::Result<RawResponse>;

    /// POST a JSON body and hand back the reply body as a stream
    async fn open_stream(
      &self
    , path: &str
    , body: &serde_json::Value
    , timeout: Duration
    ) -> crate::Result<RawStream>;
}

/// reqwest-backed transport with bearer authentication
pub struct HttpTransport
{   base_url: String
  , api_key: Option<String>
  , http_client: reqwest::Client
}

impl HttpTransport
{   pub fn new(
      base_url: impl Into<String>
    , api_key: Option<String>
    ) -> Self
    {   debug!("Creating HttpTransport");
        HttpTransport
        {   base_url: base_url.into()
          , api_key
          , http_client: reqwest::Client::new()
        }
    }

    pub fn from_config(config: &crate::DispatcherConfig) -> Self
    {   HttpTransport::new(
          config.base_url.clone(),
          config.api_key.clone()
        )
    }

    fn url(&self, path: &str) -> String
    {   format!(
          "{}/{}",
          self.base_url.trim_end_matches('/'),
          path.trim_start_matches('/')
        )
    }

    fn api_key(&self) -> crate::Result<&str>
    {   match self.api_key.as_deref()
        {   Some(key) if !key.trim().is_empty() => Ok(key)
          , _ => {
              error!("No API key configured");
              Err(crate::Error::AuthenticationError(
                "missing API key".to_string()
              ))
            }
        }
    }

    async fn post(
      &self
    , path: &str
    , body: &serde_json::Value
    , timeout: Option<Duration>
    ) -> crate::Result<reqwest::Response>
    {   let api_key = self.api_key()?;
        let url = self.url(path);
        trace!("POST {}: {}", url, body);

        let mut builder = self.http_client
          .post(url)
          .bearer_auth(api_key)
          .header("Content-Type", "application/json");
        // A whole-request timeout would cut long streams short
        if let Some(timeout) = timeout
        {   builder = builder.timeout(timeout);
        }
        builder
          .json(body)
          .send()
          .await
          .map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> crate::Error
{   error!("HTTP error: {}", e);
    if e.is_timeout()
    {   crate::Error::timeout()
    } else
    {   crate::Error::connection(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport
{   async fn post_json(
      &self
    , path: &str
    , body: &serde_json::Value
    , timeout: Duration
    ) -> crate::Result<RawResponse>
    {   let response = self.post(path, body, Some(timeout)).await?;
        let status = response.status().as_u16();
        trace!("Response status: {}", status);

        let body = response.text().await
          .map_err(map_reqwest_error)?;
        Ok(RawResponse { status, body })
    }

    async fn open_stream(
      &self
    , path: &str
    , body: &serde_json::Value
    , timeout: Duration
    ) -> crate::Result<RawStream>
    {   let response = tokio::time::timeout(
          timeout,
          self.post(path, body, None)
        )
          .await
          .map_err(|_| crate::Error::timeout())??;
        let status = response.status().as_u16();
        trace!("Stream response status: {}", status);

        let body = response
          .bytes_stream()
          .map(|chunk| {
            chunk
              .map(|bytes| bytes.to_vec())
              .map_err(map_reqwest_error)
          })
          .boxed();
        Ok(RawStream { status, body })
    }
}
