//! Chat request, result and stream fragment types

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use crate::{Message, Role};

/// Output format requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat
{   Text
  , JsonObject
}

/// A chat completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest
{   /// Allow-listed model name
    pub model: String
  , /// Ordered conversation, oldest first
    pub messages: Vec<Message>
  , /// Sampling temperature in [0, 2]
    pub temperature: f32
  , /// Max tokens to generate
    pub max_output_tokens: Option<u32>
  , /// Whether the caller wants fragments
    pub stream: bool
  , /// Text or JSON output
    pub response_format: Option<ResponseFormat>
}

impl ChatRequest
{   pub fn new(
      model: impl Into<String>
    , messages: Vec<Message>
    ) -> Self
    {   ChatRequest
        {   model: model.into()
          , messages
          , temperature: 1.0
          , max_output_tokens: None
          , stream: false
          , response_format: None
        }
    }

    /// Single user message request
    pub fn prompt(
      model: impl Into<String>
    , prompt: impl Into<String>
    ) -> Self
    {   ChatRequest::new(model, vec![Message::user(prompt)])
    }

    /// Build a request from the "responses" input shape: a bare
    /// string or a message list, plus optional instructions that
    /// act as a leading system prompt
    pub fn from_responses(
      model: impl Into<String>
    , input: ResponsesInput
    , instructions: Option<String>
    ) -> Self
    {   let mut messages = Vec::new();
        if let Some(instructions) = instructions
        {   messages.push(Message::system(instructions));
        }
        match input
        {   ResponsesInput::Text(text) => {
              messages.push(Message::user(text));
            }
          , ResponsesInput::Messages(list) => {
              messages.extend(list);
            }
        }
        ChatRequest::new(model, messages)
    }

    pub fn temperature(mut self, temperature: f32) -> Self
    {   self.temperature = temperature;
        self
    }

    pub fn max_output_tokens(mut self, max: u32) -> Self
    {   self.max_output_tokens = Some(max);
        self
    }

    pub fn json_mode(mut self) -> Self
    {   self.response_format = Some(ResponseFormat::JsonObject);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self
    {   self.stream = stream;
        self
    }

    /// Characters across every message
    pub fn input_chars(&self) -> usize
    {   self.messages
          .iter()
          .map(|m| m.content.chars().count())
          .sum()
    }

    /// Content of the system prompt, if any
    pub fn system_prompt(&self) -> Option<&str>
    {   self.messages
          .iter()
          .find(|m| m.role == Role::System)
          .map(|m| m.content.as_str())
    }
}

/// The "responses" input shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput
{   Text(String)
  , Messages(Vec<Message>)
}

impl From<&str> for ResponsesInput
{   fn from(s: &str) -> Self
    {   ResponsesInput::Text(s.to_string())
    }
}

impl From<Vec<Message>> for ResponsesInput
{   fn from(messages: Vec<Message>) -> Self
    {   ResponsesInput::Messages(messages)
    }
}

/// Why generation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason
{   Stop
  , Length
  , ContentFilter
  , Error
  , Other(String)
}

impl FinishReason
{   /// Normalise the provider-specific strings the gateway passes on
    pub fn from_wire(reason: &str) -> Self
    {   match reason
        {   "stop" | "end_turn" | "stop_sequence" => FinishReason::Stop
          , "length" | "max_tokens" => FinishReason::Length
          , "content_filter" | "safety" => FinishReason::ContentFilter
          , "error" => FinishReason::Error
          , other => FinishReason::Other(other.to_string())
        }
    }
}

/// Token accounting for one request. Counts the gateway leaves out
/// read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage
{   #[serde(default)]
    pub prompt_tokens: u32
  , #[serde(default)]
    pub completion_tokens: u32
  , #[serde(default)]
    pub total_tokens: u32
  , /// Gateway billing units (Rials on Hibana)
    #[serde(default, alias = "cost_rial")]
    pub cost_units: Option<f64>
}

/// Complete result of a buffered request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResult
{   pub content: String
  , pub finish_reason: FinishReason
  , pub usage: Option<Usage>
}

impl ChatResult
{   /// Parse JSON-mode content into `T`
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T>
    {   Ok(serde_json::from_str(&self.content)?)
    }
}

/// One incremental piece of a streamed response
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFragment
{   pub delta_text: String
  , pub finish_reason: Option<FinishReason>
  , /// Only on the trailing usage chunk
    pub usage: Option<Usage>
}

/// Concatenate the text of a sequence of fragments
pub fn collect_text<'a, I>(fragments: I) -> String
where
  I: IntoIterator<Item = &'a StreamFragment>,
{   fragments
      .into_iter()
      .map(|f| f.delta_text.as_str())
      .collect()
}
