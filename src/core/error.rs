use thiserror::Error;

/// Pipeline stage that produced a completion payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Outline,
    SceneExpansion,
    DialogueEnhancement,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Outline => write!(f, "outline"),
            Stage::SceneExpansion => write!(f, "scene expansion"),
            Stage::DialogueEnhancement => write!(f, "dialogue enhancement"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoryError {
    #[error("outline generation failed: {reason}")]
    OutlineGenerationFailed { reason: String },

    #[error("scene expansion degraded on page {page}: {reason}")]
    SceneExpansionDegraded { page: u32, reason: String },

    #[error("dialogue enhancement skipped on page {page}: {reason}")]
    DialogueEnhancementSkipped { page: u32, reason: String },

    #[error("malformed {stage} payload: {reason}")]
    MalformedCompletionPayload { stage: Stage, reason: String },

    #[error("consistency score {score} is below the threshold of {threshold}")]
    ConsistencyThresholdNotMet { score: u32, threshold: u32 },

    #[error("story generation was cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("page {0} is not part of this story")]
    PageOutOfRange(u32),
}

impl StoryError {
    /// Fatal errors abort the request. Everything else is carried as a warning
    /// next to a complete result.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoryError::OutlineGenerationFailed { .. }
            | StoryError::Cancelled
            | StoryError::Config(_)
            | StoryError::PageOutOfRange(_) => true,
            StoryError::MalformedCompletionPayload { stage, .. } => *stage == Stage::Outline,
            StoryError::SceneExpansionDegraded { .. }
            | StoryError::DialogueEnhancementSkipped { .. }
            | StoryError::ConsistencyThresholdNotMet { .. } => false,
        }
    }

    pub fn page(&self) -> Option<u32> {
        match self {
            StoryError::SceneExpansionDegraded { page, .. }
            | StoryError::DialogueEnhancementSkipped { page, .. } => Some(*page),
            _ => None,
        }
    }

    /// Resolves a malformed payload into the failure policy of the stage that
    /// produced it: fatal for the outline, a per-page degradation otherwise.
    pub fn escalate(self, page: u32) -> StoryError {
        if let StoryError::MalformedCompletionPayload { stage, .. } = &self {
            let stage = *stage;
            let reason = self.to_string();
            return match stage {
                Stage::Outline => StoryError::OutlineGenerationFailed { reason },
                Stage::SceneExpansion => StoryError::SceneExpansionDegraded { page, reason },
                Stage::DialogueEnhancement => StoryError::DialogueEnhancementSkipped { page, reason },
            };
        }
        self
    }
}

pub type StoryResult<T> = std::result::Result<T, StoryError>;

/// Output of a stage that degrades instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput<T> {
    pub value: T,
    pub warning: Option<StoryError>,
}

impl<T> StageOutput<T> {
    pub fn ok(value: T) -> Self {
        Self { value, warning: None }
    }

    pub fn degraded(value: T, warning: StoryError) -> Self {
        Self {
            value,
            warning: Some(warning),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(StoryError::OutlineGenerationFailed { reason: "x".into() }.is_fatal());
        assert!(StoryError::Cancelled.is_fatal());
        assert!(!StoryError::SceneExpansionDegraded { page: 2, reason: "x".into() }.is_fatal());
        assert!(!StoryError::DialogueEnhancementSkipped { page: 2, reason: "x".into() }.is_fatal());
        assert!(!StoryError::ConsistencyThresholdNotMet { score: 50, threshold: 70 }.is_fatal());
        assert!(StoryError::MalformedCompletionPayload { stage: Stage::Outline, reason: "x".into() }.is_fatal());
        assert!(!StoryError::MalformedCompletionPayload { stage: Stage::SceneExpansion, reason: "x".into() }.is_fatal());
    }

    #[test]
    fn test_display_names_the_stage() {
        let err = StoryError::MalformedCompletionPayload {
            stage: Stage::DialogueEnhancement,
            reason: "not json".into(),
        };
        assert_eq!(err.to_string(), "malformed dialogue enhancement payload: not json");
    }

    #[test]
    fn test_malformed_payload_escalates_by_stage() {
        let outline = StoryError::MalformedCompletionPayload { stage: Stage::Outline, reason: "x".into() }.escalate(0);
        assert!(matches!(outline, StoryError::OutlineGenerationFailed { .. }));
        assert!(outline.is_fatal());

        let scene = StoryError::MalformedCompletionPayload { stage: Stage::SceneExpansion, reason: "x".into() }.escalate(3);
        assert_eq!(scene.page(), Some(3));
        assert!(!scene.is_fatal());

        let other = StoryError::Cancelled.escalate(1);
        assert_eq!(other, StoryError::Cancelled);
    }
}
