use std::pin::Pin;
use std::time::Duration;
use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use crate::config::DispatcherConfig;
use crate::providers::openai::{self, WireChatRequest, CHAT_COMPLETIONS_PATH};
use crate::providers::sse::{SseDecoder, SseEvent};
use crate::providers::transport::MAX_ERROR_BODY_BYTES;
use crate::providers::{ByteStream, HttpTransport, Transport};
use crate::request::{ChatRequest, ChatResult, StreamFragment};
use crate::retry::{run_with_retry, RetryState};
use crate::{ConversationHistory, Error, ModelSpec, Role};

/// Lazily produced fragments of one streamed reply. Not restartable;
/// dropping it early releases the connection.
pub type FragmentStream
  = Pin<Box<dyn Stream<Item = crate::Result<StreamFragment>> + Send>>;

/// Validates chat requests, sends them to the gateway and retries
/// transient failures. Holds no state besides its own config.
pub struct RequestDispatcher<T: Transport = HttpTransport>
{   config: DispatcherConfig
  , transport: T
}

impl RequestDispatcher<HttpTransport>
{   /// Dispatcher talking HTTP to `config.base_url`
    pub fn new(config: DispatcherConfig) -> crate::Result<Self>
    {   let transport = HttpTransport::from_config(&config);
        RequestDispatcher::with_transport(config, transport)
    }
}

impl<T: Transport> RequestDispatcher<T>
{   pub fn with_transport(
      config: DispatcherConfig
    , transport: T
    ) -> crate::Result<Self>
    {   config.validate()?;
        debug!(
          "Creating RequestDispatcher for {} with {} models",
          config.base_url, config.models.len()
        );
        Ok(RequestDispatcher
        {   config
          , transport
        })
    }

    pub fn config(&self) -> &DispatcherConfig
    {   &self.config
    }

    pub fn transport(&self) -> &T
    {   &self.transport
    }

    pub fn model(&self, name: &str) -> Option<&ModelSpec>
    {   self.config.model(name)
    }

    /// Family label of an allow-listed model, for logs and output
    pub fn provider_label(&self, model: &str) -> &'static str
    {   self.model(model)
          .map(|m| m.provider.label())
          .unwrap_or("unknown")
    }

    /// Fresh retry state from the configured policy
    pub fn retry_state(&self) -> RetryState
    {   RetryState::from(&self.config.retry)
    }

    /// Check a request without touching the network
    pub fn validate(&self, request: &ChatRequest) -> crate::Result<()>
    {   self.validate_for(request, request.stream)
    }

    fn validate_for(
      &self
    , request: &ChatRequest
    , streaming: bool
    ) -> crate::Result<()>
    {   let spec = self.model(&request.model)
          .ok_or_else(|| {
            debug!("Rejected model: {}", request.model);
            Error::InvalidModel(request.model.clone())
          })?;

        match request.messages.last()
        {   Some(last) if !last.content.trim().is_empty() => {}
          , _ => return Err(Error::EmptyInput)
        }

        let length = request.input_chars();
        let limit = self.config.max_input_chars;
        if length > limit
        {   return Err(Error::InputTooLong { length, limit });
        }

        if request.messages
          .iter()
          .any(|m| m.role == Role::User && m.content.trim().is_empty())
        {   return Err(Error::EmptyInput);
        }

        if !(0.0..=2.0).contains(&request.temperature)
        {   return Err(Error::InvalidParameter(format!(
              "temperature {} outside [0, 2]",
              request.temperature
            )));
        }
        if request.max_output_tokens == Some(0)
        {   return Err(Error::InvalidParameter(
              "max_output_tokens must be positive".to_string()
            ));
        }
        if request.response_format
            == Some(crate::ResponseFormat::JsonObject)
          && !spec.supports_json_mode
        {   return Err(Error::InvalidParameter(format!(
              "{} does not support JSON mode", spec.name
            )));
        }
        if streaming && !spec.supports_streaming
        {   return Err(Error::InvalidParameter(format!(
              "{} does not support streaming", spec.name
            )));
        }
        Ok(())
    }

    fn wire_body(
      &self
    , request: &ChatRequest
    , stream: bool
    ) -> crate::Result<serde_json::Value>
    {   WireChatRequest::new(request, self.model(&request.model), stream)
          .to_value()
    }

    /// One buffered round trip, no retries
    pub async fn send(&self, request: &ChatRequest)
      -> crate::Result<ChatResult>
    {   self.validate_for(request, false)?;
        self.send_validated(request).await
    }

    async fn send_validated(&self, request: &ChatRequest)
      -> crate::Result<ChatResult>
    {   let body = self.wire_body(request, false)?;
        let timeout = self.config.timeout();
        debug!(
          "Sending request for model: {} ({})",
          request.model, self.provider_label(&request.model)
        );

        let response = tokio::time::timeout(
          timeout,
          self.transport.post_json(CHAT_COMPLETIONS_PATH, &body, timeout)
        )
          .await
          .map_err(|_| {
            warn!("Request timed out after {:?}", timeout);
            Error::timeout()
          })??;

        if !(200..300).contains(&response.status)
        {   let e = Error::from_status(response.status, &response.body);
            error!("Gateway error {}: {}", response.status, e);
            return Err(e);
        }

        let result = openai::parse_completion(&response.body)?;
        if let Some(usage) = &result.usage
        {   debug!(
              "Usage: {} prompt + {} completion = {} tokens",
              usage.prompt_tokens,
              usage.completion_tokens,
              usage.total_tokens
            );
        }
        Ok(result)
    }

    /// Open a streamed reply and return its fragments in arrival order
    pub async fn send_streaming(&self, request: &ChatRequest)
      -> crate::Result<FragmentStream>
    {   self.validate_for(request, true)?;
        self.open_validated(request).await
    }

    async fn open_validated(&self, request: &ChatRequest)
      -> crate::Result<FragmentStream>
    {   let body = self.wire_body(request, true)?;
        let timeout = self.config.timeout();
        debug!(
          "Opening stream for model: {} ({})",
          request.model, self.provider_label(&request.model)
        );

        let raw = tokio::time::timeout(
          timeout,
          self.transport.open_stream(CHAT_COMPLETIONS_PATH, &body, timeout)
        )
          .await
          .map_err(|_| {
            warn!("Opening stream timed out after {:?}", timeout);
            Error::timeout()
          })??;

        if !(200..300).contains(&raw.status)
        {   let status = raw.status;
            // A stalled error body is classified from the status alone
            let text = tokio::time::timeout(
              timeout,
              raw.into_text(MAX_ERROR_BODY_BYTES)
            )
              .await
              .unwrap_or_else(|_| {
                warn!("Error body for status {} stalled", status);
                String::new()
              });
            let e = Error::from_status(status, &text);
            error!("Gateway error {}: {}", status, e);
            return Err(e);
        }

        Ok(fragment_stream(raw.body, timeout))
    }

    /// `send` wrapped in the retry state machine. Validation runs
    /// once, before any attempt.
    pub async fn dispatch_with_retry(
      &self
    , request: &ChatRequest
    , state: &mut RetryState
    ) -> crate::Result<ChatResult>
    {   self.validate_for(request, false)?;
        let result = run_with_retry(state, || self.send_validated(request))
          .await;
        if result.is_ok() && state.attempt > 0
        {   info!("Request succeeded after {} attempts", state.attempt + 1);
        }
        result
    }

    /// Retry opening a stream. Once fragments flow, failures surface
    /// as `StreamInterrupted` and are not retried.
    pub async fn send_streaming_with_retry(
      &self
    , request: &ChatRequest
    , state: &mut RetryState
    ) -> crate::Result<FragmentStream>
    {   self.validate_for(request, true)?;
        run_with_retry(state, || self.open_validated(request)).await
    }

    /// Send the current history to `model` with the configured retry
    /// policy. The caller records the reply in the history.
    pub async fn chat(
      &self
    , history: &ConversationHistory
    , model: &str
    ) -> crate::Result<ChatResult>
    {   let request = history.request(model);
        let mut state = self.retry_state();
        self.dispatch_with_retry(&request, &mut state).await
    }
}

/// Decode event stream frames into fragments. The body is released
/// when the stream ends, errors, or is dropped by the consumer.
fn fragment_stream(mut body: ByteStream, idle_timeout: Duration)
  -> FragmentStream
{   Box::pin(async_stream::stream! {
      let mut decoder = SseDecoder::new();
      let mut finished = false;

      'frames: loop
      {   let (events, at_eof) = match tokio::time::timeout(
            idle_timeout,
            body.next()
          ).await
          {   Ok(Some(Ok(chunk))) => (decoder.push(&chunk), false)
            , Ok(Some(Err(e))) => {
                warn!("Transport failed mid-stream: {}", e);
                yield Err(Error::StreamInterrupted(e.to_string()));
                break 'frames;
              }
            , Ok(None) => (decoder.finish().into_iter().collect(), true)
            , Err(_) => {
                warn!("No stream data for {:?}", idle_timeout);
                yield Err(Error::StreamInterrupted(format!(
                  "no data received for {:?}", idle_timeout
                )));
                break 'frames;
              }
          };

          for event in events
          {   match event
              {   SseEvent::Done => break 'frames
                , SseEvent::Data(data) => {
                    match openai::parse_chunk(&data)
                    {   Ok(Some(fragment)) => {
                          finished |= fragment.finish_reason.is_some();
                          yield Ok(fragment);
                        }
                      , Ok(None) => {}
                      , Err(e) => {
                          yield Err(e);
                          break 'frames;
                        }
                    }
                  }
              }
          }

          if at_eof
          {   if !finished
              {   warn!("Stream ended without a finish reason");
                  yield Err(Error::StreamInterrupted(
                    "connection closed before the reply finished"
                      .to_string()
                  ));
              }
              break 'frames;
          }
      }

      drop(body);
      debug!("Stream closed");
    })
}
