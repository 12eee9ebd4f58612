use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven emotion tags a scene can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Happy,
    Excited,
    Curious,
    Worried,
    Sad,
    Brave,
    Calm,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Happy,
        Emotion::Excited,
        Emotion::Curious,
        Emotion::Worried,
        Emotion::Sad,
        Emotion::Brave,
        Emotion::Calm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Excited => "excited",
            Emotion::Curious => "curious",
            Emotion::Worried => "worried",
            Emotion::Sad => "sad",
            Emotion::Brave => "brave",
            Emotion::Calm => "calm",
        }
    }

    /// Lenient parse of a backend-supplied tag, accepting a few common synonyms.
    pub fn parse(raw: &str) -> Option<Emotion> {
        match raw.trim().to_lowercase().as_str() {
            "happy" | "joyful" | "glad" | "cheerful" => Some(Emotion::Happy),
            "excited" | "thrilled" | "eager" => Some(Emotion::Excited),
            "curious" | "wondering" | "interested" => Some(Emotion::Curious),
            "worried" | "nervous" | "scared" | "afraid" | "anxious" => Some(Emotion::Worried),
            "sad" | "unhappy" | "lonely" => Some(Emotion::Sad),
            "brave" | "determined" | "proud" | "confident" => Some(Emotion::Brave),
            "calm" | "peaceful" | "relaxed" | "content" => Some(Emotion::Calm),
            _ => None,
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall tone of a story, chosen from the drawing analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Playful,
    Adventurous,
    #[default]
    Gentle,
    Hopeful,
    Reassuring,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Playful => "playful",
            Mood::Adventurous => "adventurous",
            Mood::Gentle => "gentle",
            Mood::Hopeful => "hopeful",
            Mood::Reassuring => "reassuring",
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub child_age: u8,
    pub language: String,
    #[serde(default)]
    pub child_name: Option<String>,
    #[serde(default)]
    pub child_gender: Option<String>,
    #[serde(default)]
    pub sensitive_category: Option<String>,
    /// Free text description of what the child drew.
    #[serde(default)]
    pub visual_description: Option<String>,
}

impl GenerationRequest {
    pub fn new(child_age: u8, language: &str) -> Self {
        Self {
            child_age,
            language: language.to_string(),
            child_name: None,
            child_gender: None,
            sensitive_category: None,
            visual_description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraumaLevel {
    None,
    Low,
    Moderate,
    High,
}

/// Read-only summary handed over by the drawing analysis service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisInsights {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub dominant_emotions: Vec<String>,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub trauma_level: Option<TraumaLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthArc {
    pub start: String,
    pub middle: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    pub species: String,
    pub gender: String,
    pub age: u8,
    pub appearance: String,
    pub personality_traits: Vec<String>,
    pub speech_style: String,
    #[serde(default)]
    pub growth_arc: GrowthArc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryOutline {
    pub theme: String,
    pub educational_takeaway: String,
    pub mood: Mood,
    pub main_character: CharacterProfile,
    /// One concrete event per page, in page order.
    pub story_beats: Vec<String>,
    /// Planned emotion for each beat, same length as `story_beats`.
    #[serde(default)]
    pub beat_emotions: Vec<Emotion>,
}

impl StoryOutline {
    /// Planned emotion for a 1-based page. Falls back to the mood's arc when
    /// the outline carries no plan for that page.
    pub fn planned_emotion(&self, page_number: u32) -> Emotion {
        let index = page_number.saturating_sub(1) as usize;
        if let Some(emotion) = self.beat_emotions.get(index) {
            return *emotion;
        }
        crate::core::policy::emotion_arc(self.story_beats.len(), self.mood)
            .get(index)
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub speaker: String,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub page_number: u32,
    pub text: String,
    pub emotion: Emotion,
    pub visual_elements: Vec<String>,
    #[serde(default)]
    pub dialogue: Vec<DialogueLine>,
}

impl Scene {
    /// Minimal scene built straight from a beat when expansion fails.
    pub fn from_beat(page_number: u32, beat: &str) -> Self {
        Self {
            page_number,
            text: beat.trim().to_string(),
            emotion: Emotion::default(),
            visual_elements: Vec::new(),
            dialogue: Vec::new(),
        }
    }

    /// Short description of what the page shows, used by document assembly.
    pub fn description(&self) -> String {
        if self.visual_elements.is_empty() {
            format!("A {} moment: {}", self.emotion, first_sentence(&self.text))
        } else {
            format!("A {} moment featuring {}", self.emotion, self.visual_elements.join(", "))
        }
    }
}

fn first_sentence(text: &str) -> &str {
    let end = text
        .find(|c| matches!(c, '.' | '!' | '?'))
        .map(|i| i + 1)
        .unwrap_or(text.len());
    text[..end].trim()
}

/// A finished page, consumed by the image renderer as (`visual_prompt`, `seed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryPage {
    pub page_number: u32,
    pub text: String,
    pub scene_description: String,
    pub visual_prompt: String,
    pub seed: u32,
    pub emotion: Emotion,
}
