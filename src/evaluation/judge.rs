//! Judge boundary and the LLM-backed judge.
//!
//! Only the scoring protocol lives here: the judge is asked for a JSON
//! object and the reply is parsed and range-checked.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::EvaluationError;
use crate::llm::{GenerationRequest, LlmProvider, Message};

use super::{Submission, Winner, MAX_SCORE, MIN_SCORE};

/// A judge's head-to-head decision, before it is keyed and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseVerdict {
    pub winner: Winner,
    pub confidence: f64,
    pub reason: Option<String>,
}

#[async_trait]
pub trait Judge: Send + Sync {
    /// Stable identifier used in record keys.
    fn id(&self) -> &str;

    /// Scores one document, returning one value per requested criterion.
    async fn score(
        &self,
        document: Submission<'_>,
        criteria: &[String],
    ) -> Result<BTreeMap<String, f64>, EvaluationError>;

    async fn compare(
        &self,
        a: Submission<'_>,
        b: Submission<'_>,
    ) -> Result<PairwiseVerdict, EvaluationError>;
}

/// Checks that every criterion is present and within 1-10.
pub fn check_scores(
    scores: &BTreeMap<String, f64>,
    criteria: &[String],
) -> Result<(), EvaluationError> {
    for criterion in criteria {
        let score = scores.get(criterion).copied().ok_or_else(|| {
            EvaluationError::Parse(format!("missing score for criterion '{}'", criterion))
        })?;
        if !(MIN_SCORE..=MAX_SCORE).contains(&score) || score.is_nan() {
            return Err(EvaluationError::ScoreOutOfRange {
                criterion: criterion.clone(),
                score,
            });
        }
    }
    Ok(())
}

// ============================================================================
// JSON reply extraction
// ============================================================================

/// Index of the brace closing the object that starts at `s[0]`.
fn closing_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn fenced_block(reply: &str) -> Option<&str> {
    let start = reply.find("```")?;
    let after = &reply[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Pulls the JSON object out of a judge reply.
///
/// Tries a fenced code block first, then the last balanced object in the
/// text (reasoning models tend to think before answering).
pub fn extract_json_object(reply: &str) -> Option<serde_json::Value> {
    let trimmed = reply.trim();

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(block) {
            return Some(value);
        }
    }

    let mut best = None;
    for (start, _) in trimmed.match_indices('{') {
        let candidate = &trimmed[start..];
        if let Some(end) = closing_brace(candidate) {
            if let Ok(value @ serde_json::Value::Object(_)) =
                serde_json::from_str(&candidate[..=end])
            {
                best = Some((start, value));
            }
        }
    }
    best.map(|(_, value)| value)
}

// ============================================================================
// LLM judge
// ============================================================================

const SCORE_SYSTEM: &str = "You are an impartial document reviewer. Score strictly and reply with JSON only.";
const COMPARE_SYSTEM: &str = "You are an impartial document reviewer comparing two documents. Reply with JSON only.";

#[derive(Debug, Deserialize)]
struct ScoreReply {
    scores: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct CompareReply {
    winner: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
}

pub struct LlmJudge {
    id: String,
    model: String,
    provider: Arc<dyn LlmProvider>,
    temperature: f64,
}

impl LlmJudge {
    pub fn new(model: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        let model = model.into();
        Self {
            id: model.clone(),
            model,
            provider,
            temperature: 0.0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    fn score_prompt(document: Submission<'_>, criteria: &[String]) -> String {
        format!(
            "Score the document below from 1 to 10 on each criterion: {}.\n\
             Reply as {{\"scores\": {{\"<criterion>\": <number>, ...}}}}.\n\n\
             --- DOCUMENT {} ---\n{}\n--- END DOCUMENT ---",
            criteria.join(", "),
            document.id,
            document.content
        )
    }

    fn compare_prompt(a: Submission<'_>, b: Submission<'_>) -> String {
        format!(
            "Which document better fulfils its purpose? A tie is an acceptable answer.\n\
             Reply as {{\"winner\": \"A\" | \"B\" | \"tie\", \"confidence\": <0..1>, \"reason\": \"...\"}}.\n\n\
             --- DOCUMENT A ---\n{}\n--- END DOCUMENT A ---\n\n\
             --- DOCUMENT B ---\n{}\n--- END DOCUMENT B ---",
            a.content, b.content
        )
    }

    async fn ask(&self, system: &str, prompt: String) -> Result<serde_json::Value, EvaluationError> {
        let request = GenerationRequest::new(
            self.model.clone(),
            vec![Message::system(system), Message::user(prompt)],
        )
        .with_temperature(self.temperature);

        let response = self
            .provider
            .generate(request)
            .await
            .map_err(|e| EvaluationError::Judge(e.to_string()))?;
        let reply = response
            .first_content()
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| EvaluationError::Judge(format!("judge {} returned no content", self.id)))?;
        extract_json_object(reply)
            .ok_or_else(|| EvaluationError::Parse(format!("no JSON object in reply from {}", self.id)))
    }
}

#[async_trait]
impl Judge for LlmJudge {
    fn id(&self) -> &str {
        &self.id
    }

    async fn score(
        &self,
        document: Submission<'_>,
        criteria: &[String],
    ) -> Result<BTreeMap<String, f64>, EvaluationError> {
        let value = self
            .ask(SCORE_SYSTEM, Self::score_prompt(document, criteria))
            .await?;
        let reply: ScoreReply =
            serde_json::from_value(value).map_err(|e| EvaluationError::Parse(e.to_string()))?;
        let scores: BTreeMap<String, f64> = reply
            .scores
            .into_iter()
            .map(|(criterion, score)| (criterion.to_lowercase(), score))
            .filter(|(criterion, _)| criteria.contains(criterion))
            .collect();
        check_scores(&scores, criteria)?;
        Ok(scores)
    }

    async fn compare(
        &self,
        a: Submission<'_>,
        b: Submission<'_>,
    ) -> Result<PairwiseVerdict, EvaluationError> {
        let value = self.ask(COMPARE_SYSTEM, Self::compare_prompt(a, b)).await?;
        let reply: CompareReply =
            serde_json::from_value(value).map_err(|e| EvaluationError::Parse(e.to_string()))?;
        let winner = reply.winner.parse::<Winner>().map_err(EvaluationError::Parse)?;
        Ok(PairwiseVerdict {
            winner,
            confidence: reply.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            reason: reply.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationResponse};
    use std::sync::Mutex;

    struct CannedProvider {
        replies: Mutex<Vec<String>>,
    }

    impl CannedProvider {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            let reply = self
                .replies
                .lock()
                .expect("lock poisoned")
                .pop()
                .ok_or_else(|| LlmError::RequestFailed("no more replies".into()))?;
            Ok(GenerationResponse {
                id: "r".into(),
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(reply),
                    finish_reason: "stop".into(),
                }],
                usage: None,
            })
        }
    }

    fn criteria() -> Vec<String> {
        vec!["accuracy".to_string(), "clarity".to_string()]
    }

    #[test]
    fn test_extract_from_fence() {
        let reply = "Sure.\n```json\n{\"winner\": \"A\"}\n```\nDone.";
        let value = extract_json_object(reply).expect("json");
        assert_eq!(value["winner"], "A");
    }

    #[test]
    fn test_extract_last_object_after_reasoning() {
        let reply = "I think {maybe} the first is better.\n{\"winner\": \"B\", \"confidence\": 0.7}";
        let value = extract_json_object(reply).expect("json");
        assert_eq!(value["winner"], "B");
    }

    #[test]
    fn test_extract_none() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{\"unterminated\": ").is_none());
    }

    #[test]
    fn test_check_scores_range() {
        let mut scores = BTreeMap::from([("accuracy".to_string(), 7.0), ("clarity".to_string(), 11.0)]);
        assert!(matches!(
            check_scores(&scores, &criteria()),
            Err(EvaluationError::ScoreOutOfRange { .. })
        ));
        scores.insert("clarity".into(), 10.0);
        assert!(check_scores(&scores, &criteria()).is_ok());
        scores.remove("accuracy");
        assert!(matches!(
            check_scores(&scores, &criteria()),
            Err(EvaluationError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_llm_judge_score() {
        let provider = CannedProvider::new(&[
            "```json\n{\"scores\": {\"Accuracy\": 8, \"clarity\": 6, \"extra\": 3}}\n```",
        ]);
        let judge = LlmJudge::new("judge-model", provider);
        let scores = judge
            .score(Submission::new("d1", "text"), &criteria())
            .await
            .expect("scores");
        assert_eq!(scores.len(), 2);
        assert_eq!(scores["accuracy"], 8.0);
    }

    #[tokio::test]
    async fn test_llm_judge_compare_tie() {
        let provider = CannedProvider::new(&["{\"winner\": \"tie\", \"confidence\": 1.4}"]);
        let judge = LlmJudge::new("judge-model", provider).with_id("j1");
        assert_eq!(judge.id(), "j1");
        let verdict = judge
            .compare(Submission::new("a", "x"), Submission::new("b", "y"))
            .await
            .expect("verdict");
        assert_eq!(verdict.winner, Winner::Tie);
        assert_eq!(verdict.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_llm_judge_empty_reply() {
        let provider = CannedProvider::new(&["   "]);
        let judge = LlmJudge::new("judge-model", provider);
        assert!(matches!(
            judge
                .compare(Submission::new("a", "x"), Submission::new("b", "y"))
                .await,
            Err(EvaluationError::Judge(_))
        ));
    }
}
