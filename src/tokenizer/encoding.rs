//! Tokenizer encoding selection.

use serde::{Deserialize, Serialize};

/// Tokenizer encoding type
///
/// Different models use different tokenizers. The encoding type determines
/// which tokenizer to use for accurate token counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Encoding {
    /// OpenAI cl100k_base encoding (GPT-3.5, GPT-4) - via tiktoken
    #[default]
    Cl100kBase,
    /// OpenAI o200k_base encoding (GPT-4o, o1, o3) - via tiktoken
    O200kBase,
    /// Heuristic fallback (~4 characters per token)
    Heuristic,
}

impl Encoding {
    /// Infer encoding from a model name
    ///
    /// # Examples
    /// ```
    /// use relay::tokenizer::Encoding;
    ///
    /// assert_eq!(Encoding::infer_from_id("gpt-4o-mini"), Encoding::O200kBase);
    /// assert_eq!(Encoding::infer_from_id("gpt-4"), Encoding::Cl100kBase);
    /// assert_eq!(Encoding::infer_from_id("claude-3-haiku"), Encoding::Heuristic);
    /// ```
    pub fn infer_from_id(id: &str) -> Self {
        let id_lower = id.to_lowercase();
        let bare = id_lower.rsplit('/').next().unwrap_or(&id_lower);

        // O200k models: GPT-4o family, o1, o3
        if bare.contains("gpt-4o")
            || bare.starts_with("o1")
            || bare.starts_with("o3")
            || bare.starts_with("o4")
        {
            return Encoding::O200kBase;
        }

        // Cl100k models: GPT-3.5, GPT-4 (non-o), embeddings
        if bare.contains("gpt-3") || bare.contains("gpt-4") || bare.contains("text-embedding") {
            return Encoding::Cl100kBase;
        }

        // Everything else uses heuristic
        Encoding::Heuristic
    }

    /// Get encoding name as string
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::O200kBase => "o200k_base",
            Encoding::Heuristic => "heuristic",
        }
    }
}
