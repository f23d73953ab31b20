use std::fmt;
use serde::Deserialize;

/// Why a retryable server-side failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind
{   /// Gateway answered with a 5xx status
    Status(u16)
  , /// No answer within the configured timeout
    Timeout
  , /// Connection could not be established or was reset
    Connection
}

/// Error taxonomy for Hibana dispatch.
/// Implements Clone so results can travel through channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error
{   /// Model is not in the configured allow-list
    InvalidModel(String)
  , /// No messages, or a blank user message
    EmptyInput
  , /// Total input exceeds the character ceiling
    InputTooLong
    {   length: usize
      , limit: usize
    }
  , /// Request parameter outside its allowed range
    InvalidParameter(String)
  , /// Credential missing or rejected
    AuthenticationError(String)
  , /// Unknown model or endpoint on the gateway
    NotFound(String)
  , /// Gateway rejected the request parameters
    BadRequest(String)
  , /// Account balance cannot cover the request
    InsufficientBalance(String)
  , /// Too many requests
    RateLimited(String)
  , /// 5xx, timeout or dropped connection before a reply
    TransientServerError
    {   kind: TransientKind
      , message: String
    }
  , /// Transport dropped after fragments were delivered
    StreamInterrupted(String)
  , /// Failed to parse a gateway payload
    ParseError(String)
  , /// No choices in API response
    NoChoicesInResponse
  , /// Invalid configuration
    InvalidConfiguration(String)
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope
{   error: ErrorBody
}

#[derive(Debug, Deserialize)]
struct ErrorBody
{   message: String
}

impl Error
{   /// Rate limits and transient server faults may be retried
    pub fn is_retryable(&self) -> bool
    {   matches!(
          self,
          Error::RateLimited(_)
            | Error::TransientServerError { .. }
        )
    }

    /// Failures raised locally, before any network call
    pub fn is_validation(&self) -> bool
    {   matches!(
          self,
          Error::InvalidModel(_)
            | Error::EmptyInput
            | Error::InputTooLong { .. }
            | Error::InvalidParameter(_)
        )
    }

    pub fn timeout() -> Self
    {   Error::TransientServerError
        {   kind: TransientKind::Timeout
          , message: "request timed out".to_string()
        }
    }

    pub fn connection(message: impl Into<String>) -> Self
    {   Error::TransientServerError
        {   kind: TransientKind::Connection
          , message: message.into()
        }
    }

    /// Classify a non-success HTTP reply from the gateway
    pub fn from_status(status: u16, body: &str) -> Self
    {   let message = extract_message(body);
        let lowered = message.to_lowercase();
        let mentions_balance = lowered.contains("insufficient")
          || lowered.contains("balance");

        match status
        {   401 | 403 if !(status == 403 && mentions_balance) => {
              Error::AuthenticationError(message)
            }
          , 402 => Error::InsufficientBalance(message)
          , 400..=499 if mentions_balance => {
              Error::InsufficientBalance(message)
            }
          , 404 => Error::NotFound(message)
          , 408 => Error::TransientServerError
            {   kind: TransientKind::Timeout
              , message
            }
          , 429 => Error::RateLimited(message)
          , 400..=499 => Error::BadRequest(message)
          , _ => Error::TransientServerError
            {   kind: TransientKind::Status(status)
              , message
            }
        }
    }
}

/// Pull the human readable message out of an OpenAI style
/// `{"error": {"message": ..}}` envelope, else use the raw body
fn extract_message(body: &str) -> String
{   match serde_json::from_str::<ErrorEnvelope>(body)
    {   Ok(envelope) => envelope.error.message
      , Err(_) if body.trim().is_empty() => {
          "no error body".to_string()
        }
      , Err(_) => body.trim().to_string()
    }
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::InvalidModel(model) => {
              write!(f, "Model not in allow-list: {}", model)
            }
          , Error::EmptyInput => {
              write!(f, "Input is empty")
            }
          , Error::InputTooLong { length, limit } => {
              write!(f,
                "Input too long: {} characters (max {})",
                length, limit
              )
            }
          , Error::InvalidParameter(msg) => {
              write!(f, "Invalid parameter: {}", msg)
            }
          , Error::AuthenticationError(msg) => {
              write!(f, "Authentication failed: {}", msg)
            }
          , Error::NotFound(msg) => {
              write!(f, "Not found: {}", msg)
            }
          , Error::BadRequest(msg) => {
              write!(f, "Bad request: {}", msg)
            }
          , Error::InsufficientBalance(msg) => {
              write!(f, "Insufficient balance: {}", msg)
            }
          , Error::RateLimited(msg) => {
              write!(f, "Rate limited: {}", msg)
            }
          , Error::TransientServerError { kind, message } => {
              match kind
              {   TransientKind::Status(code) => write!(f,
                    "Server error {}: {}", code, message
                  )
                , TransientKind::Timeout => write!(f,
                    "Request timed out: {}", message
                  )
                , TransientKind::Connection => write!(f,
                    "Connection error: {}", message
                  )
              }
            }
          , Error::StreamInterrupted(msg) => {
              write!(f, "Stream interrupted: {}", msg)
            }
          , Error::ParseError(msg) => {
              write!(f, "Parse error: {}", msg)
            }
          , Error::NoChoicesInResponse => {
              write!(f, "API response contained no choices")
            }
          , Error::InvalidConfiguration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error
{   fn from(e: serde_json::Error) -> Self
    {   Error::ParseError(e.to_string())
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn classifies_statuses()
    {   assert!(matches!(
          Error::from_status(401, ""),
          Error::AuthenticationError(_)
        ));
        assert!(matches!(
          Error::from_status(404, "model not found"),
          Error::NotFound(_)
        ));
        assert!(matches!(
          Error::from_status(400, "bad temperature"),
          Error::BadRequest(_)
        ));
        assert!(matches!(
          Error::from_status(402, ""),
          Error::InsufficientBalance(_)
        ));
        assert!(matches!(
          Error::from_status(429, "slow down"),
          Error::RateLimited(_)
        ));
        assert_eq!(
          Error::from_status(503, "overloaded"),
          Error::TransientServerError
          {   kind: TransientKind::Status(503)
            , message: "overloaded".to_string()
          }
        );
    }

    #[test]
    fn balance_wording_wins_over_generic_4xx()
    {   let body = r#"{"error":{"message":"Insufficient balance for request","type":"billing"}}"#;
        assert_eq!(
          Error::from_status(400, body),
          Error::InsufficientBalance(
            "Insufficient balance for request".to_string()
          )
        );
        assert!(matches!(
          Error::from_status(403, body),
          Error::InsufficientBalance(_)
        ));
    }

    #[test]
    fn retryable_split()
    {   assert!(Error::RateLimited("x".into()).is_retryable());
        assert!(Error::timeout().is_retryable());
        assert!(Error::connection("reset").is_retryable());
        assert!(!Error::AuthenticationError("x".into()).is_retryable());
        assert!(!Error::InsufficientBalance("x".into()).is_retryable());
        assert!(!Error::StreamInterrupted("x".into()).is_retryable());
        assert!(Error::EmptyInput.is_validation());
        assert!(!Error::NotFound("x".into()).is_validation());
    }
}
