mod error;
mod prompt;
mod summarizer;

pub use error::AiError;
pub use prompt::{build_prompt, MAX_BODY_CHARS, SYSTEM_PROMPT};
pub use summarizer::{OpenAiSummarizer, Summarizer, SummarizerConfig};
