//! Per-page image prompt assembly.
//!
//! Section order is fixed: anchor tags, medium, scene elements, atmosphere,
//! composition, style/mood, quality. Image models weight early tokens most,
//! so the anchor tags must stay first and identical on every page.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::policy::AgeParameters;
use crate::core::story::{Emotion, Mood};
use crate::services::identity::CharacterIdentity;
use crate::utils::text::dedup_ordered;

pub const MAX_SCENE_ELEMENTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualStyleConfig {
    #[serde(default = "default_medium")]
    pub medium: String,
    #[serde(default = "default_atmospheres")]
    pub atmospheres: BTreeMap<Emotion, String>,
    /// Used for any emotion missing from `atmospheres`.
    #[serde(default = "default_atmosphere")]
    pub default_atmosphere: String,
    #[serde(default = "default_quality_directives")]
    pub quality_directives: Vec<String>,
}

fn default_medium() -> String {
    "children's picture book illustration".to_string()
}

fn default_atmosphere() -> String {
    "friendly gentle atmosphere, soft light".to_string()
}

fn default_atmospheres() -> BTreeMap<Emotion, String> {
    [
        (Emotion::Happy, "bright cheerful atmosphere, warm sunlight, smiling expression"),
        (Emotion::Excited, "energetic lively atmosphere, dynamic pose, sparkling highlights"),
        (Emotion::Curious, "wondrous atmosphere, soft glowing light, wide eyes exploring"),
        (Emotion::Worried, "slightly dim cozy light, gentle shadows, concerned but safe expression"),
        (Emotion::Sad, "muted soft colors, gentle rain or dusk light, comforting space"),
        (Emotion::Brave, "heroic uplifting light, confident stance, clear sky"),
        (Emotion::Calm, "peaceful serene atmosphere, soft pastel light, relaxed expression"),
    ]
    .into_iter()
    .map(|(e, s)| (e, s.to_string()))
    .collect()
}

fn default_quality_directives() -> Vec<String> {
    vec![
        "high quality".to_string(),
        "clean consistent linework".to_string(),
        "consistent character proportions".to_string(),
        "no text or letters".to_string(),
    ]
}

impl Default for VisualStyleConfig {
    fn default() -> Self {
        Self {
            medium: default_medium(),
            atmospheres: default_atmospheres(),
            default_atmosphere: default_atmosphere(),
            quality_directives: default_quality_directives(),
        }
    }
}

/// Where a page sits in the story, which drives the composition hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePosition {
    Introduction,
    Progression,
    Resolution,
}

impl PagePosition {
    pub fn of(page_number: u32, total_pages: u32) -> Self {
        if page_number <= 1 {
            PagePosition::Introduction
        } else if page_number >= total_pages {
            PagePosition::Resolution
        } else {
            PagePosition::Progression
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptRequest<'a> {
    pub page_number: u32,
    pub total_pages: u32,
    pub scene_elements: &'a [String],
    pub emotion: Emotion,
    pub mood: Mood,
}

#[derive(Debug, Clone)]
pub struct VisualPromptComposer {
    style: VisualStyleConfig,
}

impl VisualPromptComposer {
    pub fn new(style: VisualStyleConfig) -> Self {
        Self { style }
    }

    pub fn atmosphere(&self, emotion: Emotion) -> &str {
        self.style
            .atmospheres
            .get(&emotion)
            .map(|s| s.as_str())
            .unwrap_or(self.style.default_atmosphere.as_str())
    }

    fn composition(position: PagePosition, name: &str) -> String {
        match position {
            PagePosition::Introduction => {
                format!("establishing wide shot introducing {} in their world", name)
            }
            PagePosition::Progression => {
                format!("medium shot of {} in action as the story unfolds", name)
            }
            PagePosition::Resolution => {
                format!("warm closing shot of {} at peace, story resolved", name)
            }
        }
    }

    /// The prompt sections in their contractual order. Empty sections are omitted.
    pub fn sections(
        &self,
        identity: &CharacterIdentity,
        character_name: &str,
        age: &AgeParameters,
        request: &PromptRequest<'_>,
    ) -> Vec<String> {
        let mut sections = vec![
            identity.anchor_prefix(),
            format!("{}, {}", self.style.medium, age.art_style),
        ];

        let elements: Vec<String> = dedup_ordered(request.scene_elements)
            .into_iter()
            .take(MAX_SCENE_ELEMENTS)
            .collect();
        if !elements.is_empty() {
            sections.push(elements.join(", "));
        }

        sections.push(self.atmosphere(request.emotion).to_string());
        sections.push(Self::composition(
            PagePosition::of(request.page_number, request.total_pages),
            character_name,
        ));
        sections.push(format!("{}, {} mood", age.palette, request.mood));
        if !self.style.quality_directives.is_empty() {
            sections.push(self.style.quality_directives.join(", "));
        }
        sections
    }

    pub fn compose(
        &self,
        identity: &CharacterIdentity,
        character_name: &str,
        age: &AgeParameters,
        request: &PromptRequest<'_>,
    ) -> String {
        self.sections(identity, character_name, age, request).join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> CharacterIdentity {
        CharacterIdentity {
            hash: "abc".to_string(),
            consistency_seed: 42,
            anchor_tags: vec!["(Milo the fox:1.3)".to_string(), "(orange fur:1.2)".to_string()],
            color_signature: vec!["orange".to_string()],
            unique_features: vec![],
        }
    }

    fn request<'a>(page: u32, elements: &'a [String], emotion: Emotion) -> PromptRequest<'a> {
        PromptRequest {
            page_number: page,
            total_pages: 5,
            scene_elements: elements,
            emotion,
            mood: Mood::Playful,
        }
    }

    #[test]
    fn test_sections_follow_fixed_order() {
        let composer = VisualPromptComposer::new(VisualStyleConfig::default());
        let age = AgeParameters::for_age(5);
        let elements = vec!["red kite".to_string(), "hilltop".to_string()];
        let sections = composer.sections(&identity(), "Milo", &age, &request(3, &elements, Emotion::Curious));

        assert_eq!(sections[0], "(Milo the fox:1.3), (orange fur:1.2)");
        assert!(sections[1].starts_with("children's picture book illustration"));
        assert_eq!(sections[2], "red kite, hilltop");
        assert!(sections[3].starts_with("wondrous atmosphere"));
        assert!(sections[4].contains("as the story unfolds"));
        assert_eq!(sections[5], "warm cheerful pastels, playful mood");
        assert!(sections[6].contains("no text"));
    }

    #[test]
    fn test_prompt_starts_with_anchor_prefix_on_every_page() {
        let composer = VisualPromptComposer::new(VisualStyleConfig::default());
        let age = AgeParameters::for_age(5);
        let id = identity();
        for page in 1..=5 {
            let prompt = composer.compose(&id, "Milo", &age, &request(page, &[], Emotion::Happy));
            assert!(prompt.starts_with(&id.anchor_prefix()));
        }
    }

    #[test]
    fn test_at_most_three_deduplicated_elements() {
        let composer = VisualPromptComposer::new(VisualStyleConfig::default());
        let age = AgeParameters::for_age(8);
        let elements: Vec<String> = ["pond", "Pond", "lily pads", "frog", "willow tree"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let sections = composer.sections(&identity(), "Milo", &age, &request(2, &elements, Emotion::Calm));
        assert_eq!(sections[2], "pond, lily pads, frog");
    }

    #[test]
    fn test_composition_by_page_position() {
        assert_eq!(PagePosition::of(1, 5), PagePosition::Introduction);
        assert_eq!(PagePosition::of(3, 5), PagePosition::Progression);
        assert_eq!(PagePosition::of(5, 5), PagePosition::Resolution);
        assert_eq!(PagePosition::of(1, 1), PagePosition::Introduction);
    }

    #[test]
    fn test_missing_atmosphere_falls_back_to_default() {
        let mut style = VisualStyleConfig::default();
        style.atmospheres.remove(&Emotion::Sad);
        let composer = VisualPromptComposer::new(style);
        assert_eq!(composer.atmosphere(Emotion::Sad), "friendly gentle atmosphere, soft light");
        assert!(composer.atmosphere(Emotion::Brave).starts_with("heroic"));
    }

    #[test]
    fn test_default_table_covers_all_emotions() {
        let style = VisualStyleConfig::default();
        for emotion in Emotion::ALL {
            assert!(style.atmospheres.contains_key(&emotion));
        }
    }
}
