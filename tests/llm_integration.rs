//! Integration tests against the real OpenRouter API.
//!
//! Run with: OPENROUTER_API_KEY=your_key cargo test --test llm_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use docforge::evaluation::{Judge, LlmJudge, Submission};
use docforge::generation::{Backend, InvokeRequest, LlmBackend};
use docforge::llm::{GenerationRequest, LlmProvider, Message, OpenRouterProvider};

const MODEL: &str = "openai/gpt-4o-mini";

fn provider() -> Arc<dyn LlmProvider> {
    let key = std::env::var("OPENROUTER_API_KEY")
        .expect("OPENROUTER_API_KEY environment variable must be set for integration tests");
    Arc::new(OpenRouterProvider::new(key).expect("provider"))
}

#[tokio::test]
#[ignore]
async fn test_simple_generation() {
    let request = GenerationRequest::new(
        MODEL,
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = provider().generate(request).await.expect("generation");
    let content = response.first_content().expect("content");
    assert!(content.contains('4'), "unexpected reply: {}", content);
}

#[tokio::test]
#[ignore]
async fn test_backend_reports_usage() {
    let backend = LlmBackend::new("openrouter", provider());
    let response = backend
        .invoke(&InvokeRequest::new(
            MODEL,
            "Write one sentence about rivers.",
            Duration::from_secs(60),
        ))
        .await
        .expect("invoke");

    assert!(response.content.is_some_and(|c| !c.trim().is_empty()));
    assert!(response.metadata.output_tokens.is_some());
}

#[tokio::test]
#[ignore]
async fn test_judge_scores_every_criterion() {
    let judge = LlmJudge::new(MODEL, provider());
    let criteria = vec!["clarity".to_string(), "accuracy".to_string()];
    let scores = judge
        .score(
            Submission::new("doc-1", "Water boils at 100 degrees Celsius at sea level."),
            &criteria,
        )
        .await
        .expect("score");

    for criterion in &criteria {
        let score = scores.get(criterion).copied().expect("criterion scored");
        assert!((1.0..=10.0).contains(&score));
    }
}
