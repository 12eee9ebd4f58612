//! Turns the analysis of a child's drawing into an illustrated story whose
//! main character looks and speaks the same on every page.

pub mod core;
pub mod services;
pub mod utils;

pub use crate::core::config::Config;
pub use crate::core::error::{StoryError, StoryResult};
pub use crate::core::story::{AnalysisInsights, Emotion, GenerationRequest, Mood, StoryPage};
pub use crate::services::consistency::{ConsistencyCheckResult, ConsistencyEngine};
pub use crate::services::llm::{LlmClient, LlmError};
pub use crate::services::workflow::{GeneratedStory, StoryPipeline};
