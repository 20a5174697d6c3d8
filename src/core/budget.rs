use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

/// Longest piece, in characters, a single pre-token can produce.
const MAX_PIECE_CHARS: usize = 4;

/// Splits text into a token sequence. Counting and truncation go through the
/// same `encode`, so a truncated text always re-counts to the budget it was
/// cut to.
pub trait Tokenizer: Send + Sync {
    /// Token pieces in order. Concatenating them reproduces `text` exactly.
    fn encode<'a>(&self, text: &'a str) -> Vec<&'a str>;

    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    /// Keep the first `max_tokens` tokens. Returns the kept text and how many
    /// tokens were discarded; text already within budget comes back as is.
    fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> (String, usize) {
        let pieces = self.encode(text);
        if pieces.len() <= max_tokens {
            return (text.to_string(), 0);
        }
        let removed = pieces.len() - max_tokens;
        (pieces[..max_tokens].concat(), removed)
    }
}

fn pre_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r" ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+").expect("static regex")
    })
}

/// Deterministic word-piece tokenizer. Text is pre-split into runs of
/// letters, digits, punctuation (each optionally led by one space) and
/// whitespace; every run is then cut into pieces of at most four characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordPieceTokenizer;

impl Tokenizer for WordPieceTokenizer {
    fn encode<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut pieces = Vec::new();
        for m in pre_token_regex().find_iter(text) {
            let run = m.as_str();
            let mut start = 0;
            let mut chars = 0;
            for (idx, _) in run.char_indices() {
                if chars == MAX_PIECE_CHARS {
                    pieces.push(&run[start..idx]);
                    start = idx;
                    chars = 0;
                }
                chars += 1;
            }
            if start < run.len() {
                pieces.push(&run[start..]);
            }
        }
        pieces
    }
}

/// A prompt pair fitted to an input budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FittedPrompt {
    pub system_role: String,
    pub prompt_text: String,
    /// Actual total when under budget, otherwise the budget itself.
    pub input_tokens_used: i64,
    pub tokens_removed: usize,
}

/// Fit `system_role + prompt_text` into `max_input_tokens`. Only the prompt
/// body is ever cut; the system role is sent whole.
pub fn fit_prompt(
    tokenizer: &dyn Tokenizer,
    system_role: &str,
    prompt_text: &str,
    max_input_tokens: i64,
) -> FittedPrompt {
    let max_input = max_input_tokens.max(0) as usize;
    let system_tokens = tokenizer.count_tokens(system_role);
    let prompt_tokens = tokenizer.count_tokens(prompt_text);

    if system_tokens + prompt_tokens <= max_input {
        return FittedPrompt {
            system_role: system_role.to_string(),
            prompt_text: prompt_text.to_string(),
            input_tokens_used: (system_tokens + prompt_tokens) as i64,
            tokens_removed: 0,
        };
    }

    if system_tokens >= max_input {
        warn!(
            "System role alone uses {} of {} input tokens; prompt body dropped",
            system_tokens, max_input
        );
    }
    let prompt_budget = max_input.saturating_sub(system_tokens);
    let (truncated, removed) = tokenizer.truncate_to_tokens(prompt_text, prompt_budget);
    FittedPrompt {
        system_role: system_role.to_string(),
        prompt_text: truncated,
        input_tokens_used: max_input as i64,
        tokens_removed: removed,
    }
}
