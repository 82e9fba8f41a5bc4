//! External services consumed by the companion: text completion and speech.
//! Both sit behind traits so sessions and analyzers can run against fakes.

mod completion;
mod speech;

pub use completion::{strip_reasoning, ChatCompletionClient, CompletionRequest, CompletionService};
pub use speech::{build_ssml, clean_text_for_speech, AzureSpeechClient, SpeechService};
