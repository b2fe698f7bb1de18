pub mod client;
pub mod extract;
pub mod prompts;
pub mod stream;

pub use client::{CompletionOptions, StreamingCompletionClient};
pub use extract::{extract, extract_detailed, ExtractionOutcome, Strategy};
pub use stream::CompletionResult;
