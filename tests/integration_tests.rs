use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_test::{assert_err, assert_ok};

use hibana::providers::{RawResponse, RawStream, Transport};
use hibana::request::collect_text;
use hibana::{
  ChatRequest, ConversationHistory, DispatcherConfig, Error,
  FinishReason, Message, RequestDispatcher, RetryState, StreamFragment,
  TransientKind,
};

fn init_logging()
{   let _ = env_logger::builder().is_test(true).try_init();
}

// ===== Scripted transport =====

/// What the transport does on its next call
enum Outcome
{   /// Reply with a status and a body
    Reply(u16, String)
  , /// Stream these chunks with status 200
    Frames(Vec<Result<Vec<u8>, Error>>)
  , /// Transport-level failure
    Fail(Error)
  , /// Never answer
    Hang
  , /// Answer with a status whose body never arrives
    Stalled(u16)
}

/// Body stream that counts how often it is released
struct TrackedBody
{   chunks: VecDeque<Result<Vec<u8>, Error>>
  , closes: Arc<AtomicUsize>
  , stalled: bool
}

impl Stream for TrackedBody
{   type Item = Result<Vec<u8>, Error>;

    fn poll_next(
      mut self: Pin<&mut Self>
    , _cx: &mut Context<'_>
    ) -> Poll<Option<Self::Item>>
    {   match self.chunks.pop_front()
        {   None if self.stalled => Poll::Pending
          , next => Poll::Ready(next)
        }
    }
}

impl Drop for TrackedBody
{   fn drop(&mut self)
    {   self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedTransport
{   outcomes: Mutex<VecDeque<Outcome>>
  , calls: AtomicUsize
  , closes: Arc<AtomicUsize>
  , bodies: Mutex<Vec<serde_json::Value>>
}

impl ScriptedTransport
{   fn new(outcomes: Vec<Outcome>) -> Self
    {   ScriptedTransport
        {   outcomes: Mutex::new(outcomes.into())
          , ..ScriptedTransport::default()
        }
    }

    fn calls(&self) -> usize
    {   self.calls.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize
    {   self.closes.load(Ordering::SeqCst)
    }

    fn bodies(&self) -> Vec<serde_json::Value>
    {   self.bodies.lock().unwrap().clone()
    }

    fn next_outcome(&self, body: &serde_json::Value) -> Outcome
    {   self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body.clone());
        self.outcomes.lock().unwrap()
          .pop_front()
          .expect("transport called more often than scripted")
    }

    fn tracked(&self, chunks: Vec<Result<Vec<u8>, Error>>) -> TrackedBody
    {   TrackedBody
        {   chunks: chunks.into()
          , closes: self.closes.clone()
          , stalled: false
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport
{   async fn post_json(
      &self
    , _path: &str
    , body: &serde_json::Value
    , _timeout: Duration
    ) -> hibana::Result<RawResponse>
    {   match self.next_outcome(body)
        {   Outcome::Reply(status, body) => Ok(RawResponse { status, body })
          , Outcome::Frames(_) | Outcome::Stalled(_) => {
              panic!("buffered call got stream frames")
            }
          , Outcome::Fail(e) => Err(e)
          , Outcome::Hang => {
              tokio::time::sleep(Duration::from_secs(3600)).await;
              Err(Error::connection("hung"))
            }
        }
    }

    async fn open_stream(
      &self
    , _path: &str
    , body: &serde_json::Value
    , _timeout: Duration
    ) -> hibana::Result<RawStream>
    {   match self.next_outcome(body)
        {   Outcome::Reply(status, body) => Ok(RawStream
            {   status
              , body: Box::pin(self.tracked(vec![Ok(body.into_bytes())]))
            })
          , Outcome::Frames(chunks) => Ok(RawStream
            {   status: 200
              , body: Box::pin(self.tracked(chunks))
            })
          , Outcome::Fail(e) => Err(e)
          , Outcome::Hang => {
              tokio::time::sleep(Duration::from_secs(3600)).await;
              Err(Error::connection("hung"))
            }
          , Outcome::Stalled(status) => {
              let mut body = self.tracked(vec![]);
              body.stalled = true;
              Ok(RawStream { status, body: Box::pin(body) })
            }
        }
    }
}

// ===== Fixtures =====

fn completion_body(content: &str) -> String
{   serde_json::json!({
      "id": "chatcmpl-1",
      "choices": [{
        "index": 0,
        "message": {"role": "assistant", "content": content},
        "finish_reason": "stop"
      }],
      "usage": {
        "prompt_tokens": 12,
        "completion_tokens": 3,
        "total_tokens": 15,
        "cost_rial": 50
      }
    }).to_string()
}

fn chunk(content: &str, finish: Option<&str>) -> Result<Vec<u8>, Error>
{   let frame = serde_json::json!({
      "id": "chunk",
      "choices": [{
        "index": 0,
        "delta": {"content": content},
        "finish_reason": finish
      }]
    });
    Ok(format!("data: {}\n\n", frame).into_bytes())
}

fn done() -> Result<Vec<u8>, Error>
{   Ok(b"data: [DONE]\n\n".to_vec())
}

fn hello_world_frames() -> Vec<Result<Vec<u8>, Error>>
{   vec![
      chunk("Hello", None)
    , chunk(" World", None)
    , chunk("!", Some("stop"))
    , done()
    ]
}

fn rate_limited() -> Outcome
{   Outcome::Reply(
      429,
      r#"{"error":{"message":"Rate limit reached","type":"rate_limit"}}"#
        .to_string()
    )
}

fn dispatcher(outcomes: Vec<Outcome>)
  -> RequestDispatcher<ScriptedTransport>
{   init_logging();
    RequestDispatcher::with_transport(
      DispatcherConfig::with_api_key("test-key"),
      ScriptedTransport::new(outcomes)
    ).unwrap()
}

fn hello() -> ChatRequest
{   ChatRequest::prompt("gpt-5-nano", "Hello")
}

// ===== Buffered dispatch =====

#[tokio::test]
async fn test_send_parses_first_choice()
{   let d = dispatcher(vec![
      Outcome::Reply(200, completion_body("Hi there"))
    ]);
    let result = assert_ok!(d.send(&hello()).await);

    assert_eq!(result.content, "Hi there");
    assert_eq!(result.finish_reason, FinishReason::Stop);
    let usage = result.usage.unwrap();
    assert_eq!(usage.total_tokens, 15);
    assert_eq!(usage.cost_units, Some(50.0));
    assert_eq!(d.transport().calls(), 1);
    assert_eq!(d.transport().bodies()[0]["stream"], false);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_twice_then_success()
{   let d = dispatcher(vec![
      rate_limited()
    , rate_limited()
    , Outcome::Reply(200, completion_body("third time lucky"))
    ]);
    let mut state = RetryState::new(3, Duration::from_secs(1));
    let started = tokio::time::Instant::now();

    let result = d.dispatch_with_retry(&hello(), &mut state).await;

    assert_eq!(assert_ok!(result).content, "third time lucky");
    assert_eq!(d.transport().calls(), 3);
    assert_eq!(
      state.waits(),
      &[Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_until_exhausted()
{   let d = dispatcher(vec![
      rate_limited()
    , rate_limited()
    , rate_limited()
    ]);
    let mut state = RetryState::new(3, Duration::from_secs(1));

    let result = d.dispatch_with_retry(&hello(), &mut state).await;

    assert_eq!(
      result,
      Err(Error::RateLimited("Rate limit reached".to_string()))
    );
    assert_eq!(d.transport().calls(), 3);
    assert_eq!(state.attempts_made(), 3);
    assert_eq!(state.waits().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_error_is_not_retried()
{   let d = dispatcher(vec![
      Outcome::Reply(
        401,
        r#"{"error":{"message":"Invalid API key"}}"#.to_string()
      )
    ]);
    let mut state = d.retry_state();
    let started = tokio::time::Instant::now();

    let result = d.dispatch_with_retry(&hello(), &mut state).await;

    assert_eq!(
      result,
      Err(Error::AuthenticationError("Invalid API key".to_string()))
    );
    assert_eq!(d.transport().calls(), 1);
    assert!(state.waits().is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_terminal_errors_propagate_on_first_occurrence()
{   for (status, body) in [
      (404, "model not found")
    , (400, "temperature is invalid")
    , (402, "payment required")
    ]
    {   let d = dispatcher(vec![Outcome::Reply(status, body.to_string())]);
        let mut state = d.retry_state();
        let e = assert_err!(d.dispatch_with_retry(&hello(), &mut state).await);
        assert!(!e.is_retryable(), "{} should be terminal", e);
        assert_eq!(d.transport().calls(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_and_timeouts_are_retried()
{   let mut config = DispatcherConfig::with_api_key("test-key");
    config.timeout_secs = 5;
    let d = RequestDispatcher::with_transport(
      config,
      ScriptedTransport::new(vec![
        Outcome::Reply(503, "upstream overloaded".to_string())
      , Outcome::Hang
      , Outcome::Fail(Error::connection("reset by peer"))
      ])
    ).unwrap();
    let mut state = RetryState::new(3, Duration::from_millis(10));

    let result = d.dispatch_with_retry(&hello(), &mut state).await;

    assert_eq!(result, Err(Error::connection("reset by peer")));
    assert_eq!(d.transport().calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_surfaces_as_transient_error()
{   let d = dispatcher(vec![Outcome::Hang]);
    let e = assert_err!(d.send(&hello()).await);
    assert_eq!(
      e,
      Error::TransientServerError
      {   kind: TransientKind::Timeout
        , message: "request timed out".to_string()
      }
    );
}

#[tokio::test(start_paused = true)]
async fn test_error_envelope_in_success_body_is_classified()
{   let d = dispatcher(vec![
      Outcome::Reply(
        200,
        r#"{"error":{"message":"upstream provider failed"}}"#.to_string()
      )
    , Outcome::Reply(200, completion_body("Recovered"))
    ]);
    let mut state = RetryState::new(3, Duration::from_millis(10));

    let result = assert_ok!(d.dispatch_with_retry(&hello(), &mut state).await);
    assert_eq!(result.content, "Recovered");
    assert_eq!(d.transport().calls(), 2);

    let d = dispatcher(vec![
      Outcome::Reply(
        200,
        r#"{"error":{"message":"Invalid API key","code":401}}"#.to_string()
      )
    ]);
    assert!(matches!(
      d.dispatch_with_retry(&hello(), &mut d.retry_state()).await,
      Err(Error::AuthenticationError(_))
    ));
    assert_eq!(d.transport().calls(), 1);
}

#[tokio::test]
async fn test_partial_usage_still_parses()
{   let body = serde_json::json!({
      "choices": [{
        "index": 0,
        "message": {"role": "assistant", "content": "Hi"},
        "finish_reason": "stop"
      }],
      "usage": {"prompt_tokens": 12, "completion_tokens": 3}
    }).to_string();
    let d = dispatcher(vec![Outcome::Reply(200, body)]);

    let result = assert_ok!(d.send(&hello()).await);
    assert_eq!(result.content, "Hi");
    let usage = result.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 12);
    assert_eq!(usage.total_tokens, 0);
}

#[tokio::test]
async fn test_malformed_success_body()
{   let d = dispatcher(vec![
      Outcome::Reply(200, "<html>gateway</html>".to_string())
    ]);
    assert!(matches!(
      d.send(&hello()).await,
      Err(Error::ParseError(_))
    ));
}

// ===== Streaming =====

#[tokio::test]
async fn test_stream_matches_buffered_content()
{   let d = dispatcher(vec![
      Outcome::Reply(200, completion_body("Hello World!"))
    , Outcome::Frames(hello_world_frames())
    ]);
    let buffered = assert_ok!(d.send(&hello()).await);

    let stream = assert_ok!(
      d.send_streaming(&hello().streaming(true)).await
    );
    let fragments: Vec<StreamFragment> = stream
      .map(|f| f.unwrap())
      .collect()
      .await;

    assert_eq!(fragments.len(), 3);
    assert_eq!(collect_text(&fragments), buffered.content);
    assert_eq!(
      fragments.last().unwrap().finish_reason,
      Some(FinishReason::Stop)
    );
    assert_eq!(d.transport().bodies()[1]["stream"], true);
    assert_eq!(d.transport().closes(), 1);
}

#[tokio::test]
async fn test_stream_fragments_split_across_chunks()
{   let frames = String::from_utf8(
      hello_world_frames()
        .into_iter()
        .flat_map(|c| c.unwrap())
        .collect()
    ).unwrap();
    let bytes = frames.into_bytes();
    let chunks = bytes.chunks(7).map(|c| Ok(c.to_vec())).collect();

    let d = dispatcher(vec![Outcome::Frames(chunks)]);
    let stream = assert_ok!(d.send_streaming(&hello()).await);
    let fragments: Vec<StreamFragment> = stream
      .map(|f| f.unwrap())
      .collect()
      .await;

    assert_eq!(collect_text(&fragments), "Hello World!");
}

#[tokio::test]
async fn test_early_cancel_releases_connection_once()
{   let d = dispatcher(vec![Outcome::Frames(hello_world_frames())]);
    let mut stream = assert_ok!(d.send_streaming(&hello()).await);

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.delta_text, "Hello");
    assert_eq!(d.transport().closes(), 0);

    drop(stream);
    assert_eq!(d.transport().closes(), 1);
}

#[tokio::test]
async fn test_usage_chunk_after_finish()
{   let usage = serde_json::json!({
      "choices": [],
      "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}
    });
    let d = dispatcher(vec![Outcome::Frames(vec![
      chunk("Hi", Some("stop"))
    , Ok(format!("data: {}\n\n", usage).into_bytes())
    , done()
    ])]);

    let fragments: Vec<StreamFragment> = assert_ok!(
      d.send_streaming(&hello()).await
    )
      .map(|f| f.unwrap())
      .collect()
      .await;

    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[1].delta_text, "");
    assert_eq!(fragments[1].usage.as_ref().unwrap().total_tokens, 7);
}

#[tokio::test]
async fn test_transport_drop_mid_stream()
{   let d = dispatcher(vec![Outcome::Frames(vec![
      chunk("partial", None)
    , Err(Error::connection("reset"))
    , chunk("never seen", None)
    ])]);
    let mut stream = assert_ok!(d.send_streaming(&hello()).await);

    assert_eq!(stream.next().await.unwrap().unwrap().delta_text, "partial");
    assert!(matches!(
      stream.next().await,
      Some(Err(Error::StreamInterrupted(_)))
    ));
    assert!(stream.next().await.is_none());
    assert_eq!(d.transport().closes(), 1);
    assert_eq!(d.transport().calls(), 1);
}

#[tokio::test]
async fn test_stream_closed_before_finish()
{   let d = dispatcher(vec![Outcome::Frames(vec![
      chunk("Once upon", None)
    ])]);
    let results: Vec<_> = assert_ok!(d.send_streaming(&hello()).await)
      .collect()
      .await;

    assert_eq!(results.len(), 2);
    assert!(matches!(results[1], Err(Error::StreamInterrupted(_))));
}

#[tokio::test]
async fn test_error_frame_mid_stream()
{   let d = dispatcher(vec![Outcome::Frames(vec![
      chunk("Hel", None)
    , Ok(b"data: {\"error\":{\"message\":\"upstream provider failed\"}}\n\n"
        .to_vec())
    , done()
    ])]);
    let mut stream = assert_ok!(d.send_streaming(&hello()).await);

    assert_eq!(stream.next().await.unwrap().unwrap().delta_text, "Hel");
    assert_eq!(
      stream.next().await,
      Some(Err(Error::StreamInterrupted(
        "upstream provider failed".to_string()
      )))
    );
    assert!(stream.next().await.is_none());
    assert_eq!(d.transport().closes(), 1);
    assert_eq!(d.transport().calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_error_body_is_bounded()
{   let d = dispatcher(vec![
      Outcome::Stalled(503)
    , Outcome::Stalled(503)
    , Outcome::Stalled(503)
    ]);
    let mut state = RetryState::new(3, Duration::from_millis(10));

    let result = d.send_streaming_with_retry(&hello(), &mut state).await;
    assert!(matches!(
      result,
      Err(Error::TransientServerError
      {   kind: TransientKind::Status(503), ..
      })
    ));
    assert_eq!(d.transport().calls(), 3);
    assert_eq!(d.transport().closes(), 3);
}

#[tokio::test]
async fn test_stream_rejected_with_status()
{   let d = dispatcher(vec![
      Outcome::Reply(
        404,
        r#"{"error":{"message":"The model does not exist"}}"#.to_string()
      )
    ]);
    let result = d.send_streaming(&hello()).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(d.transport().closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_open_is_retried()
{   let d = dispatcher(vec![
      Outcome::Reply(502, "bad gateway".to_string())
    , Outcome::Frames(hello_world_frames())
    ]);
    let mut state = RetryState::new(3, Duration::from_secs(1));

    let stream = assert_ok!(
      d.send_streaming_with_retry(&hello(), &mut state).await
    );
    let fragments: Vec<StreamFragment> = stream
      .map(|f| f.unwrap())
      .collect()
      .await;

    assert_eq!(collect_text(&fragments), "Hello World!");
    assert_eq!(state.waits(), &[Duration::from_secs(1)]);
    assert_eq!(d.transport().calls(), 2);
}

// ===== Conversation =====

#[tokio::test]
async fn test_multi_turn_history_is_caller_owned()
{   let d = dispatcher(vec![
      Outcome::Reply(200, completion_body("Nice to meet you, Ali!"))
    , Outcome::Reply(200, completion_body("Your name is Ali."))
    ]);
    let mut history = ConversationHistory::with_system("Be friendly");

    history.push_user("Hi, my name is Ali.");
    let first = assert_ok!(d.chat(&history, "deepseek-chat").await);
    assert_eq!(history.len(), 2);
    history.record_reply(&first);

    history.push_user("What is my name?");
    let second = assert_ok!(d.chat(&history, "deepseek-chat").await);
    history.record_reply(&second);

    assert_eq!(history.len(), 5);
    let sent = d.transport().bodies();
    assert_eq!(sent[1]["messages"].as_array().unwrap().len(), 4);
    assert_eq!(sent[1]["messages"][2]["role"], "assistant");
    assert_eq!(history.messages()[4], Message::assistant("Your name is Ali."));
}

#[tokio::test]
async fn test_invalid_model_never_reaches_transport()
{   let d = dispatcher(vec![]);
    let mut state = d.retry_state();
    let request = ChatRequest::prompt("non-existent-model-xyz", "Hello");

    assert_eq!(
      d.dispatch_with_retry(&request, &mut state).await,
      Err(Error::InvalidModel("non-existent-model-xyz".to_string()))
    );
    assert_eq!(d.transport().calls(), 0);
}

// ===== HTTP transport against a local server =====

fn http_dispatcher(server: &mockito::Server, key: Option<&str>)
  -> RequestDispatcher
{   init_logging();
    let config = DispatcherConfig
    {   base_url: format!("{}/v1", server.url())
      , api_key: key.map(str::to_string)
      , ..DispatcherConfig::default()
    };
    RequestDispatcher::new(config).unwrap()
}

#[tokio::test]
async fn test_http_send_with_bearer_auth()
{   let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/v1/chat/completions")
      .match_header("authorization", "Bearer test-key")
      .match_body(mockito::Matcher::PartialJson(serde_json::json!({
        "model": "claude-haiku-4-5",
        "stream": false,
        "response_format": {"type": "json_object"}
      })))
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(completion_body(r#"{"title":"Dune"}"#))
      .create_async()
      .await;

    let d = http_dispatcher(&server, Some("test-key"));
    let request = ChatRequest::new(
      "claude-haiku-4-5",
      vec![
        Message::system("You output JSON.")
      , Message::user("Make up a book.")
      ]
    ).json_mode();
    let result = assert_ok!(d.send(&request).await);

    mock.assert_async().await;
    let book: serde_json::Value = result.json().unwrap();
    assert_eq!(book["title"], "Dune");
}

#[tokio::test]
async fn test_http_status_classification()
{   let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/v1/chat/completions")
      .with_status(400)
      .with_body(r#"{"error":{"message":"Insufficient balance"}}"#)
      .create_async()
      .await;

    let d = http_dispatcher(&server, Some("test-key"));
    let mut state = d.retry_state();
    let result = d.dispatch_with_retry(&hello(), &mut state).await;

    mock.assert_async().await;
    assert_eq!(
      result,
      Err(Error::InsufficientBalance("Insufficient balance".to_string()))
    );
}

#[tokio::test]
async fn test_http_missing_key_fails_locally()
{   let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/v1/chat/completions")
      .expect(0)
      .create_async()
      .await;

    let d = http_dispatcher(&server, None);
    let result = d.send(&hello()).await;

    mock.assert_async().await;
    assert!(matches!(result, Err(Error::AuthenticationError(_))));
}

#[tokio::test]
async fn test_http_streaming()
{   let sse = hello_world_frames()
      .into_iter()
      .flat_map(|c| c.unwrap())
      .collect::<Vec<u8>>();

    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/v1/chat/completions")
      .match_body(mockito::Matcher::PartialJson(serde_json::json!({
        "stream": true,
        "stream_options": {"include_usage": true}
      })))
      .with_status(200)
      .with_header("content-type", "text/event-stream")
      .with_body(sse)
      .create_async()
      .await;

    let d = http_dispatcher(&server, Some("test-key"));
    let fragments: Vec<StreamFragment> = assert_ok!(
      d.send_streaming(&hello()).await
    )
      .map(|f| f.unwrap())
      .collect()
      .await;

    mock.assert_async().await;
    assert_eq!(collect_text(&fragments), "Hello World!");
}
