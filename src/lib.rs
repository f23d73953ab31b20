pub mod error;
pub mod config;
pub mod providers;
pub mod request;
pub mod retry;
pub mod client;
use serde::{Deserialize, Serialize};

/*

hibana is a small async client for the Hibana gateway, which puts
OpenAI, Anthropic, DeepSeek and Google models behind one
OpenAI-compatible chat completions API. Requests are validated
locally, then sent either buffered or as a fragment stream, and
transient failures are retried with exponential backoff.

hibana/
├── Cargo.toml
├── src/
│   ├── lib.rs          # Re-exports and shared domain types
│   ├── error.rs        # Error taxonomy and HTTP classification
│   ├── config.rs       # DispatcherConfig
│   ├── request.rs      # Request / result / fragment types
│   ├── retry.rs        # Retry state and backoff
│   ├── client.rs       # RequestDispatcher
│   ├── providers/      # Transport seam and wire format
│   │   ├── mod.rs
│   │   ├── transport.rs
│   │   ├── openai.rs   # OpenAI-compatible wire types
│   │   └── sse.rs      # Event stream frame decoder
│   └── bin/
│       └── hibana_demo.rs
└── tests/

*/

pub use client::RequestDispatcher;
pub use config::{DispatcherConfig, RetryConfig};
pub use error::{Error, Result, TransientKind};
pub use request::{
  ChatRequest, ChatResult, FinishReason, ResponseFormat,
  ResponsesInput, StreamFragment, Usage,
};
pub use retry::RetryState;

/// HIBANA STRUCTURES:

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   System
  , User
  , Assistant
}

/// One entry of a conversation. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message
{   pub role: Role
  , pub content: String
}

impl Message
{   pub fn new(role: Role, content: impl Into<String>) -> Self
    {   Message
        {   role
          , content: content.into()
        }
    }

    pub fn system(content: impl Into<String>) -> Self
    {   Message::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self
    {   Message::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self
    {   Message::new(Role::Assistant, content)
    }
}

/// Upstream model family served through the gateway.
/// Always set explicitly in configuration, never guessed from
/// the model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Hash)]
pub enum ProviderCapability
{   /// OpenAI (gpt-5-nano, ...)
    OpenAi
  , /// Anthropic (claude-haiku-4-5, ...)
    Anthropic
  , /// DeepSeek (deepseek-chat, ...)
    DeepSeek
  , /// Google (gemini-2.5-flash-lite, ...)
    Google
}

impl ProviderCapability
{   pub fn label(&self) -> &'static str
    {   match self
        {   ProviderCapability::OpenAi => "OpenAI"
          , ProviderCapability::Anthropic => "Anthropic"
          , ProviderCapability::DeepSeek => "DeepSeek"
          , ProviderCapability::Google => "Google"
        }
    }
}

/// Allow-listed model and what it can do
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelSpec
{   /// Gateway model identifier (e.g., "gpt-5-nano")
    pub name: String
  , /// Model family
    pub provider: ProviderCapability
  , /// Whether `response_format: json_object` is honoured
    #[serde(default = "default_true")]
    pub supports_json_mode: bool
  , /// Whether streamed responses are available
    #[serde(default = "default_true")]
    pub supports_streaming: bool
  , /// max_tokens sent when the request leaves it unset
    #[serde(default)]
    pub default_max_tokens: Option<u32>
}

fn default_true() -> bool
{   true
}

impl ModelSpec
{   pub fn new(
      name: impl Into<String>
    , provider: ProviderCapability
    ) -> Self
    {   ModelSpec
        {   name: name.into()
          , provider
          , supports_json_mode: true
          , supports_streaming: true
          , default_max_tokens: None
        }
    }

    pub fn with_default_max_tokens(mut self, max: u32) -> Self
    {   self.default_max_tokens = Some(max);
        self
    }
}

/// Caller-owned transcript of a multi-turn chat.
///
/// The dispatcher only reads snapshots of it; the caller appends
/// each assistant reply. History grows without limit unless a
/// window is chosen explicitly with [`ConversationHistory::with_window`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory
{   messages: Vec<Message>
  , window: Option<usize>
}

impl ConversationHistory
{   pub fn new() -> Self
    {   ConversationHistory::default()
    }

    /// Start a conversation with a system prompt
    pub fn with_system(prompt: impl Into<String>) -> Self
    {   let mut history = ConversationHistory::new();
        history.push(Message::system(prompt));
        history
    }

    /// Keep system messages plus the latest `max_messages` others
    pub fn with_window(mut self, max_messages: usize) -> Self
    {   self.window = Some(max_messages);
        self.apply_window();
        self
    }

    pub fn push(&mut self, message: Message)
    {   self.messages.push(message);
        self.apply_window();
    }

    pub fn push_user(&mut self, content: impl Into<String>)
    {   self.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>)
    {   self.push(Message::assistant(content));
    }

    /// Append the assistant side of a completed round trip
    pub fn record_reply(&mut self, result: &ChatResult)
    {   self.push_assistant(result.content.clone());
    }

    pub fn messages(&self) -> &[Message]
    {   &self.messages
    }

    pub fn len(&self) -> usize
    {   self.messages.len()
    }

    pub fn is_empty(&self) -> bool
    {   self.messages.is_empty()
    }

    /// Snapshot the history into a request for `model`
    pub fn request(&self, model: impl Into<String>) -> ChatRequest
    {   ChatRequest::new(model, self.messages.clone())
    }

    fn apply_window(&mut self)
    {   let Some(max) = self.window else { return };
        let others = self.messages
          .iter()
          .filter(|m| m.role != Role::System)
          .count();
        if others <= max
        {   return;
        }
        let mut to_drop = others - max;
        self.messages.retain(|m| {
          if m.role == Role::System || to_drop == 0
          {   true
          } else
          {   to_drop -= 1;
              false
          }
        });
    }
}
