//! Configuration for a RequestDispatcher

use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::debug;
use crate::{ModelSpec, ProviderCapability};

pub const HIBANA_API_BASE: &str
  = "https://api-ai.hibanacloud.com/v1";

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig
{   /// Attempts including the first one
    pub max_attempts: usize
  , /// Backoff before the second attempt, doubled after each retry
    pub base_delay_ms: u64
}

impl RetryConfig
{   pub fn base_delay(&self) -> Duration
    {   Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for RetryConfig
{   fn default() -> Self
    {   RetryConfig
        {   max_attempts: 3
          , base_delay_ms: 1000
        }
    }
}

/// Dispatcher configuration. Each dispatcher owns its own copy.
#[derive(Clone, Serialize, Deserialize)]
pub struct DispatcherConfig
{   /// API base URL, including the `/v1` prefix
    #[serde(default = "default_base_url")]
    pub base_url: String
  , /// Bearer credential
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>
  , /// Allow-listed models
    pub models: Vec<ModelSpec>
  , /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64
  , /// Ceiling on total input characters
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize
  , /// Retry behaviour for dispatch_with_retry
    #[serde(default)]
    pub retry: RetryConfig
}

fn default_base_url() -> String
{   HIBANA_API_BASE.to_string()
}

fn default_timeout_secs() -> u64
{   60
}

fn default_max_input_chars() -> usize
{   10_000
}

impl std::fmt::Debug for DispatcherConfig
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
      -> std::fmt::Result
    {   f.debug_struct("DispatcherConfig")
          .field("base_url", &self.base_url)
          .field("api_key", &self.api_key.as_ref().map(|_| "***"))
          .field("models", &self.models)
          .field("timeout_secs", &self.timeout_secs)
          .field("max_input_chars", &self.max_input_chars)
          .field("retry", &self.retry)
          .finish()
    }
}

impl Default for DispatcherConfig
{   fn default() -> Self
    {   DispatcherConfig
        {   base_url: default_base_url()
          , api_key: None
          , models: vec![
              ModelSpec::new("gpt-5-nano", ProviderCapability::OpenAi)
            , ModelSpec::new(
                "claude-haiku-4-5",
                ProviderCapability::Anthropic
              )
            , ModelSpec::new(
                "deepseek-chat",
                ProviderCapability::DeepSeek
              )
            , ModelSpec::new(
                "gemini-2.5-flash-lite",
                ProviderCapability::Google
              )
            ]
          , timeout_secs: default_timeout_secs()
          , max_input_chars: default_max_input_chars()
          , retry: RetryConfig::default()
        }
    }
}

impl DispatcherConfig
{   /// Default config with the given credential
    pub fn with_api_key(api_key: impl Into<String>) -> Self
    {   DispatcherConfig
        {   api_key: Some(api_key.into())
          , ..DispatcherConfig::default()
        }
    }

    /// Read HIBANA_API_KEY, HIBANA_BASE_URL and HIBANA_TIMEOUT_SECS
    /// on top of the defaults
    pub fn from_env() -> crate::Result<Self>
    {   let mut config = DispatcherConfig::default();
        if let Ok(key) = std::env::var("HIBANA_API_KEY")
        {   config.api_key = Some(key);
        }
        if let Ok(base) = std::env::var("HIBANA_BASE_URL")
        {   debug!("Using base url from environment: {}", base);
            config.base_url = base;
        }
        if let Ok(secs) = std::env::var("HIBANA_TIMEOUT_SECS")
        {   config.timeout_secs = secs.parse().map_err(|_| {
              crate::Error::InvalidConfiguration(format!(
                "HIBANA_TIMEOUT_SECS is not a number: {}", secs
              ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config document
    pub fn from_json(json: &str) -> crate::Result<Self>
    {   let config: DispatcherConfig = serde_json::from_str(json)
          .map_err(|e| {
            crate::Error::InvalidConfiguration(e.to_string())
          })?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration
    {   Duration::from_secs(self.timeout_secs)
    }

    /// Look up an allow-listed model
    pub fn model(&self, name: &str) -> Option<&ModelSpec>
    {   self.models.iter().find(|m| m.name == name)
    }

    pub fn validate(&self) -> crate::Result<()>
    {   let invalid = |msg: &str| {
          Err(crate::Error::InvalidConfiguration(msg.to_string()))
        };
        if self.models.is_empty()
        {   return invalid("model allow-list is empty");
        }
        if self.timeout_secs == 0
        {   return invalid("timeout_secs must be positive");
        }
        if self.max_input_chars == 0
        {   return invalid("max_input_chars must be positive");
        }
        if self.retry.max_attempts == 0
        {   return invalid("retry.max_attempts must be positive");
        }
        if self.base_url.trim().is_empty()
        {   return invalid("base_url is empty");
        }
        Ok(())
    }
}
