use serde::{Deserialize, Serialize};
use log::{debug, error, trace, warn};
use crate::request::{
  ChatRequest, ChatResult, FinishReason, ResponseFormat,
  StreamFragment, Usage,
};

pub const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

// ===== Request Types =====

#[derive(Debug, Clone, Serialize)]
pub struct WireResponseFormat
{   #[serde(rename = "type")]
    pub kind: ResponseFormat
}

#[derive(Debug, Clone, Serialize)]
pub struct WireStreamOptions
{   pub include_usage: bool
}

#[derive(Debug, Clone, Serialize)]
pub struct WireChatRequest<'a>
{   pub model: &'a str
  , pub messages: &'a [crate::Message]
  , pub temperature: f32
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>
  , pub stream: bool
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<WireResponseFormat>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<WireStreamOptions>
}

impl<'a> WireChatRequest<'a>
{   /// `stream` comes from the dispatch method, not the request flag
    pub fn new(
      request: &'a ChatRequest
    , model: Option<&crate::ModelSpec>
    , stream: bool
    ) -> Self
    {   WireChatRequest
        {   model: &request.model
          , messages: &request.messages
          , temperature: request.temperature
          , max_tokens: request.max_output_tokens
              .or_else(|| model.and_then(|m| m.default_max_tokens))
          , stream
          , response_format: request.response_format
              .map(|kind| WireResponseFormat { kind })
          , stream_options: stream.then_some(
              WireStreamOptions { include_usage: true }
            )
        }
    }

    pub fn to_value(&self) -> crate::Result<serde_json::Value>
    {   Ok(serde_json::to_value(self)?)
    }
}

// ===== Response Types =====

/// Error object a 2xx body or a stream frame may carry in place of choices
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireError
{   Detailed
    {   #[serde(default)]
        message: Option<String>
      , #[serde(default)]
        code: Option<serde_json::Value>
    }
  , Plain(String)
}

impl WireError
{   pub fn message(&self) -> String
    {   match self
        {   WireError::Detailed { message: Some(m), .. } if !m.is_empty()
              => m.clone()
          , WireError::Detailed { .. } => "upstream error".to_string()
          , WireError::Plain(m) => m.clone()
        }
    }

    /// HTTP-like status from a numeric `code`, else 502
    pub fn status(&self) -> u16
    {   let code = match self
        {   WireError::Detailed { code: Some(code), .. } => code
          , _ => return 502
        };
        let number = code.as_u64()
          .or_else(|| code.as_str().and_then(|s| s.parse().ok()));
        match number
        {   Some(n) if (400..=599).contains(&n) => n as u16
          , _ => 502
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse
{   #[serde(default)]
    pub choices: Vec<Choice>
  , #[serde(default)]
    pub usage: Option<Usage>
  , #[serde(default)]
    pub error: Option<WireError>
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice
{   pub message: ChoiceMessage
  , #[serde(default)]
    pub finish_reason: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage
{   #[serde(default)]
    pub content: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChunk
{   #[serde(default)]
    pub choices: Vec<ChunkChoice>
  , #[serde(default)]
    pub usage: Option<Usage>
  , #[serde(default)]
    pub error: Option<WireError>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice
{   #[serde(default)]
    pub delta: Delta
  , #[serde(default)]
    pub finish_reason: Option<String>
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta
{   #[serde(default)]
    pub content: Option<String>
}

/// Parse a buffered completion body into the first choice
pub fn parse_completion(body: &str) -> crate::Result<ChatResult>
{   let response: ChatCompletionResponse
      = serde_json::from_str(body).map_err(|e| {
        error!("Parse error: {}", e);
        crate::Error::ParseError(e.to_string())
      })?;

    if let Some(wire) = &response.error
    {   let message = wire.message();
        let e = crate::Error::from_status(wire.status(), &message);
        error!("Error envelope in completion body: {}", e);
        return Err(e);
    }

    let choice = response.choices.into_iter().next()
      .ok_or_else(|| {
        error!("No choices in response");
        crate::Error::NoChoicesInResponse
      })?;

    let finish_reason = match choice.finish_reason.as_deref()
    {   Some(reason) => FinishReason::from_wire(reason)
      , None => {
          debug!("No finish reason in response, assuming stop");
          FinishReason::Stop
        }
    };

    Ok(ChatResult
    {   content: choice.message.content.unwrap_or_default()
      , finish_reason
      , usage: response.usage
    })
}

/// Parse one `data:` payload of a streamed completion.
/// Returns None for chunks that carry nothing for the caller.
pub fn parse_chunk(data: &str) -> crate::Result<Option<StreamFragment>>
{   let chunk: CompletionChunk
      = serde_json::from_str(data).map_err(|e| {
        error!("Parsing completion chunk failed for {}: {}", data, e);
        crate::Error::ParseError(e.to_string())
      })?;
    trace!("Chunk: {:?}", chunk);

    if let Some(wire) = &chunk.error
    {   let message = wire.message();
        warn!("Error frame in stream: {}", message);
        return Err(crate::Error::StreamInterrupted(message));
    }

    let (delta_text, finish_reason) = match chunk.choices.into_iter().next()
    {   Some(choice) => (
          choice.delta.content.unwrap_or_default()
        , choice.finish_reason.as_deref().map(FinishReason::from_wire)
        )
      , None => (String::new(), None)
    };

    if delta_text.is_empty()
      && finish_reason.is_none()
      && chunk.usage.is_none()
    {   return Ok(None);
    }

    Ok(Some(StreamFragment
    {   delta_text
      , finish_reason
      , usage: chunk.usage
    }))
}
