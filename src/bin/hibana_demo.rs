//! Walk through the gateway from the command line.
//!
//! ```text
//! HIBANA_API_KEY=... hibana_demo [simple|stream|json|conversation] [prompt...]
//! ```

use std::io::Write;
use futures::StreamExt;
use log::{debug, error};
use hibana::{
  ChatRequest, ChatResult, ConversationHistory, DispatcherConfig,
  RequestDispatcher,
};

const DEFAULT_MODEL: &str = "gpt-5-nano";

fn print_result(provider: &str, model: &str, result: &ChatResult)
{   println!("{}", "=".repeat(60));
    println!("Response from {} ({}):", model, provider);
    println!("{}", "=".repeat(60));
    println!("{}", result.content);
    println!("{}", "=".repeat(60));
    println!("\nFinish reason: {:?}", result.finish_reason);
    if let Some(usage) = &result.usage
    {   println!("\nToken Usage:");
        println!("  Prompt tokens: {}", usage.prompt_tokens);
        println!("  Completion tokens: {}", usage.completion_tokens);
        println!("  Total tokens: {}", usage.total_tokens);
        if let Some(cost) = usage.cost_units
        {   println!("  Cost: {} Rials", cost);
        }
    }
}

async fn simple(
  dispatcher: &RequestDispatcher
, model: &str
, prompt: String
) -> hibana::Result<()>
{   let request = ChatRequest::prompt(model, prompt);
    let mut state = dispatcher.retry_state();
    let result = dispatcher.dispatch_with_retry(&request, &mut state)
      .await?;
    print_result(dispatcher.provider_label(model), model, &result);
    Ok(())
}

async fn stream(
  dispatcher: &RequestDispatcher
, model: &str
, prompt: String
) -> hibana::Result<()>
{   let request = ChatRequest::prompt(model, prompt).streaming(true);
    let mut state = dispatcher.retry_state();
    let mut fragments = dispatcher
      .send_streaming_with_retry(&request, &mut state)
      .await?;

    print!("Assistant (streaming): ");
    let mut received = 0;
    while let Some(fragment) = fragments.next().await
    {   let fragment = fragment?;
        received += fragment.delta_text.chars().count();
        print!("{}", fragment.delta_text);
        let _ = std::io::stdout().flush();
        if let Some(reason) = fragment.finish_reason
        {   debug!("Finish reason: {:?}", reason);
        }
    }
    println!("\n\nTotal characters received: {}", received);
    Ok(())
}

async fn json(
  dispatcher: &RequestDispatcher
, model: &str
, prompt: String
) -> hibana::Result<()>
{   let request = ChatRequest::new(model, vec![
      hibana::Message::system(
        "You are a helpful assistant that outputs data in JSON format."
      )
    , hibana::Message::user(prompt)
    ])
      .temperature(0.8)
      .json_mode();
    let result = dispatcher.dispatch_with_retry(
      &request,
      &mut dispatcher.retry_state()
    ).await?;

    let value: serde_json::Value = result.json()?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn conversation(
  dispatcher: &RequestDispatcher
, model: &str
, prompt: String
) -> hibana::Result<()>
{   let mut history = ConversationHistory::with_system(
      "You are a helpful assistant. Keep answers short."
    );
    for question in [prompt, "Can you summarise that in one sentence?".to_string()]
    {   println!("\nUser: {}", question);
        history.push_user(question);
        let reply = dispatcher.chat(&history, model).await?;
        println!("Assistant: {}", reply.content);
        history.record_reply(&reply);
    }
    println!("\nConversation has {} messages", history.len());
    Ok(())
}

#[tokio::main]
async fn main()
{   env_logger::init();

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "simple".to_string());
    let rest: Vec<String> = args.collect();
    let prompt = if rest.is_empty()
    {   "Hello! Please introduce yourself in one sentence.".to_string()
    } else
    {   rest.join(" ")
    };
    let model = std::env::var("HIBANA_MODEL")
      .unwrap_or_else(|_| DEFAULT_MODEL.to_string());

    let dispatcher = match DispatcherConfig::from_env()
      .and_then(RequestDispatcher::new)
    {   Ok(d) => d
      , Err(e) => {
          error!("Failed to configure dispatcher: {}", e);
          eprintln!("Error: {}", e);
          std::process::exit(2);
        }
    };

    let result = match mode.as_str()
    {   "simple" => simple(&dispatcher, &model, prompt).await
      , "stream" => stream(&dispatcher, &model, prompt).await
      , "json" => json(&dispatcher, &model, prompt).await
      , "conversation" => conversation(&dispatcher, &model, prompt).await
      , other => {
          eprintln!(
            "Unknown mode: {} (expected simple, stream, json or conversation)",
            other
          );
          std::process::exit(2);
        }
    };

    if let Err(e) = result
    {   eprintln!("Error: {}", e);
        match e
        {   hibana::Error::AuthenticationError(_) => {
              eprintln!("Check that HIBANA_API_KEY is correct.");
            }
          , hibana::Error::InvalidModel(_) | hibana::Error::NotFound(_) => {
              eprintln!("Model may not exist or be unavailable.");
            }
          , hibana::Error::InsufficientBalance(_) => {
              eprintln!("Recharge your account or use a lower-cost model.");
            }
          , hibana::Error::RateLimited(_) => {
              eprintln!("Too many requests. Please wait and try again.");
            }
          , _ => {}
        }
        std::process::exit(1);
    }
}
