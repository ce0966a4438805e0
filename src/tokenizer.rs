use tiktoken_rs::CoreBPE;

/// Approximate token counter used for tier heuristics and prompt-size
/// accounting. Prefers the real `cl100k_base` encoding (the GPT-3.5/4
/// family's tokenizer, close enough for every other model this gateway
/// talks to) and falls back to a cheap `len/4` heuristic if the encoder
/// fails to initialize so a missing tokenizer data file never breaks a
/// request it only needs an estimate for.
pub struct Tokenizer {
    bpe: Option<CoreBPE>,
}

impl Tokenizer {
    pub fn new() -> Self {
        let bpe = tiktoken_rs::cl100k_base().ok();
        if bpe.is_none() {
            tracing::warn!("failed to load cl100k_base tokenizer, falling back to char heuristic");
        }
        Self { bpe }
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.chars().count().div_ceil(4),
        }
    }

    pub fn count_messages(&self, texts: impl IntoIterator<Item = impl AsRef<str>>) -> usize {
        texts.into_iter().map(|t| self.count(t.as_ref())).sum()
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}
