//! Dataset assembly for the Fine-Tuning Orchestrator (§4.9 steps 2-6):
//! log→example transform, quality filter, seed merge/dedupe, deterministic
//! train/validation split, and chat-template formatting.

use sha2::{Digest, Sha256};

use crate::historylog::compute_quality;
use crate::types::InferenceLog;

const QUALITY_THRESHOLD: f64 = 0.7;
const TRAIN_FRACTION: f64 = 0.8;

/// One (input, output, quality) training example before formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub input: String,
    pub output: String,
    pub quality: f64,
}

impl TrainingExample {
    fn dedupe_key(&self) -> String {
        let normalized = self.input.trim().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// §4.2's log→example rule, applied per example (§4.9 step 2).
pub fn transform(log: &InferenceLog) -> TrainingExample {
    let output = log
        .corrected_output
        .clone()
        .unwrap_or_else(|| log.generated_output.clone());
    TrainingExample {
        input: log.prompt.clone(),
        output,
        quality: compute_quality(log),
    }
}

/// §4.9 step 3: keep only examples meeting the quality bar.
pub fn filter_by_quality(examples: Vec<TrainingExample>) -> Vec<TrainingExample> {
    examples
        .into_iter()
        .filter(|e| e.quality >= QUALITY_THRESHOLD)
        .collect()
}

/// §4.9 step 4: merge transformed examples with hand-authored seed
/// examples, deduping by a hash of the normalized input so the same
/// prompt contributed by both sources only counts once.
pub fn merge_and_dedupe(
    mut examples: Vec<TrainingExample>,
    seed_examples: Vec<TrainingExample>,
) -> Vec<TrainingExample> {
    examples.extend(seed_examples);

    let mut seen = std::collections::HashSet::new();
    examples.retain(|e| seen.insert(e.dedupe_key()));
    examples
}

/// A seeded, deterministic Fisher-Yates shuffle. `seed` is derived from the
/// job id so repeated calls for the same job produce the same split, which
/// keeps retraining-on-failure (§4.9 step 11) reproducible.
fn deterministic_shuffle<T>(mut items: Vec<T>, seed: u64) -> Vec<T> {
    let mut state = seed.max(1);
    let mut next = move || {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    let len = items.len();
    for i in (1..len).rev() {
        let j = (next() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
    items
}

pub fn seed_from_job_id(job_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

/// §4.9 step 5: deterministic shuffle then an 80/20 train/validation split.
pub fn split(examples: Vec<TrainingExample>, seed: u64) -> (Vec<TrainingExample>, Vec<TrainingExample>) {
    let shuffled = deterministic_shuffle(examples, seed);
    let split_at = ((shuffled.len() as f64) * TRAIN_FRACTION).round() as usize;
    let mut train = shuffled;
    let validation = train.split_off(split_at.min(train.len()));
    (train, validation)
}

/// Chat template family, detected from the base model name (§4.9 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    Llama,
    Mistral,
    Generic,
}

impl ChatTemplate {
    pub fn detect(base_model_name: &str) -> Self {
        let lower = base_model_name.to_lowercase();
        if lower.contains("llama") {
            ChatTemplate::Llama
        } else if lower.contains("mistral") || lower.contains("mixtral") {
            ChatTemplate::Mistral
        } else {
            ChatTemplate::Generic
        }
    }

    /// Formats one example as a single JSONL record string.
    pub fn format(&self, example: &TrainingExample) -> String {
        let value = match self {
            ChatTemplate::Llama => serde_json::json!({
                "text": format!(
                    "[INST] {} [/INST] {}",
                    example.input, example.output
                ),
            }),
            ChatTemplate::Mistral => serde_json::json!({
                "text": format!("<s>[INST] {} [/INST] {}</s>", example.input, example.output),
            }),
            ChatTemplate::Generic => serde_json::json!({
                "messages": [
                    {"role": "user", "content": example.input},
                    {"role": "assistant", "content": example.output},
                ],
            }),
        };
        value.to_string()
    }
}

/// Renders a set of examples as a JSONL blob (one JSON object per line).
pub fn to_jsonl(examples: &[TrainingExample], template: ChatTemplate) -> String {
    examples
        .iter()
        .map(|e| template.format(e))
        .collect::<Vec<_>>()
        .join("\n")
}
