use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;

use crate::core::error::{Stage, StoryError, StoryResult};
use crate::core::guidance::SensitiveContentGuide;
use crate::core::policy::{emotion_arc, mood_for, AgeParameters};
use crate::core::story::{AnalysisInsights, CharacterProfile, Emotion, GenerationRequest, GrowthArc, Mood, StoryOutline};
use crate::services::consistency::normalize_character;
use crate::services::llm::LlmClient;
use crate::services::payload::{decode_payload, Validate};
use crate::utils::text::count_words;

/// A beat shorter than this cannot describe who does what, where.
pub const MIN_BEAT_WORDS: usize = 5;

#[derive(Debug, Deserialize)]
struct CharacterPayload {
    name: String,
    #[serde(default)]
    species: String,
    #[serde(default)]
    gender: String,
    appearance: String,
    #[serde(default)]
    personality_traits: Vec<String>,
    #[serde(default)]
    speech_style: String,
    #[serde(default)]
    growth_arc: GrowthArc,
}

#[derive(Debug, Deserialize)]
struct OutlinePayload {
    theme: String,
    #[serde(default)]
    educational_takeaway: String,
    main_character: CharacterPayload,
    story_beats: Vec<String>,
    #[serde(default)]
    beat_emotions: Vec<String>,
}

impl Validate for OutlinePayload {
    fn validate(&self) -> Result<(), String> {
        if self.theme.trim().is_empty() {
            return Err("theme is empty".to_string());
        }
        if self.main_character.name.trim().is_empty() {
            return Err("main character has no name".to_string());
        }
        if self.main_character.appearance.trim().is_empty() {
            return Err("main character has no appearance".to_string());
        }
        if let Some((i, _)) = self
            .story_beats
            .iter()
            .enumerate()
            .find(|(_, b)| count_words(b) < MIN_BEAT_WORDS)
        {
            return Err(format!("beat {} is not a concrete event", i + 1));
        }
        Ok(())
    }
}

/// Stage 1: turns the drawing analysis into a fixed-length story outline.
#[derive(Debug, Clone)]
pub struct OutlineGenerator {
    guide: Arc<SensitiveContentGuide>,
}

impl OutlineGenerator {
    pub fn new(guide: Arc<SensitiveContentGuide>) -> Self {
        Self { guide }
    }

    pub fn system_prompt(&self) -> String {
        "You are an award-winning children's picture book author and child development expert. \
         You plan stories that are warm, age-appropriate and emotionally safe. \
         Reply with a single valid JSON object and nothing else."
            .to_string()
    }

    pub fn build_prompt(
        &self,
        request: &GenerationRequest,
        insights: &AnalysisInsights,
        params: &AgeParameters,
        mood: Mood,
    ) -> String {
        let mut prompt = format!(
            "Plan a picture book for a {age}-year-old reader, written in language \"{lang}\".\n\
             Exactly {pages} pages, one story beat per page.\n\
             Each page will have about {words} words in {sentences} sentences.\n\
             Vocabulary: {vocab}.\n\
             Overall mood: {mood}.\n",
            age = request.child_age,
            lang = request.language,
            pages = params.page_count,
            words = params.target_words,
            sentences = params.target_sentences,
            vocab = params.vocabulary_ceiling,
            mood = mood,
        );

        prompt.push_str("\nWHAT THE CHILD DREW\n");
        if let Some(description) = &request.visual_description {
            prompt.push_str(&format!("Drawing: {}\n", description.trim()));
        }
        if !insights.summary.trim().is_empty() {
            prompt.push_str(&format!("Analysis: {}\n", insights.summary.trim()));
        }
        if !insights.dominant_emotions.is_empty() {
            prompt.push_str(&format!("Dominant emotions: {}\n", insights.dominant_emotions.join(", ")));
        }
        if let Some(name) = &request.child_name {
            prompt.push_str(&format!(
                "The reader is called {}; they may appear as the hero's friend.\n",
                name.trim()
            ));
        }

        if let Some(category) = &request.sensitive_category {
            match self.guide.get(category) {
                Some(guidance) => {
                    prompt.push('\n');
                    prompt.push_str(&guidance.to_prompt_block(category));
                }
                None => debug!("No guidance for sensitive category '{}'", category),
            }
        }

        prompt.push_str(&format!(
            "\nRULES\n\
             1. Every beat is one concrete event: who does what, where, and what happens.\n\
             2. The main character is {age} years old and appears on every page.\n\
             3. Give the character a vivid, drawable appearance (colors, clothing, distinctive features).\n\
             4. At least two personality traits and a growth arc from start to end.\n\
             5. Give each beat one feeling from: {emotions}. Feelings change gradually from page to page.\n\
             6. Never use these words: {forbidden}.\n\
             \nReturn JSON:\n\
             {{\"theme\": \"...\", \"educational_takeaway\": \"...\", \
             \"main_character\": {{\"name\": \"...\", \"species\": \"...\", \"gender\": \"...\", \
             \"appearance\": \"...\", \"personality_traits\": [\"...\"], \"speech_style\": \"...\", \
             \"growth_arc\": {{\"start\": \"...\", \"middle\": \"...\", \"end\": \"...\"}}}}, \
             \"story_beats\": [\"...\"], \"beat_emotions\": [\"...\"]}}",
            age = request.child_age,
            emotions = Emotion::ALL.map(|e| e.as_str()).join(", "),
            forbidden = params.forbidden_terms.join(", "),
        ));
        prompt
    }

    /// Decodes and validates an outline. Any failure here is fatal for the request.
    pub fn parse_response(
        &self,
        response: &str,
        request: &GenerationRequest,
        params: &AgeParameters,
        mood: Mood,
    ) -> StoryResult<StoryOutline> {
        let payload: OutlinePayload = decode_payload(response).map_err(|e| {
            StoryError::MalformedCompletionPayload {
                stage: Stage::Outline,
                reason: e.to_string(),
            }
            .escalate(0)
        })?;

        let mut beats: Vec<String> = payload.story_beats.iter().map(|b| b.trim().to_string()).collect();
        if beats.len() < params.page_count {
            return Err(StoryError::OutlineGenerationFailed {
                reason: format!("expected {} story beats, got {}", params.page_count, beats.len()),
            });
        }
        if beats.len() > params.page_count {
            warn!(
                "Outline returned {} beats, keeping the first {}",
                beats.len(),
                params.page_count
            );
            beats.truncate(params.page_count);
        }

        let planned = emotion_arc(beats.len(), mood);
        let beat_emotions: Vec<Emotion> = planned
            .iter()
            .enumerate()
            .map(|(i, fallback)| {
                payload
                    .beat_emotions
                    .get(i)
                    .and_then(|raw| Emotion::parse(raw))
                    .unwrap_or(*fallback)
            })
            .collect();

        let c = payload.main_character;
        let character = normalize_character(
            CharacterProfile {
                name: c.name,
                species: c.species,
                gender: c.gender,
                age: request.child_age,
                appearance: c.appearance,
                personality_traits: c.personality_traits,
                speech_style: c.speech_style,
                growth_arc: c.growth_arc,
            },
            request.child_age,
            params,
        );

        Ok(StoryOutline {
            theme: payload.theme.trim().to_string(),
            educational_takeaway: payload.educational_takeaway.trim().to_string(),
            mood,
            main_character: character,
            story_beats: beats,
            beat_emotions,
        })
    }

    pub async fn generate(
        &self,
        llm: &dyn LlmClient,
        request: &GenerationRequest,
        insights: &AnalysisInsights,
    ) -> StoryResult<StoryOutline> {
        let params = AgeParameters::for_age(request.child_age);
        let mood = mood_for(insights);
        info!(
            "Generating outline: age {}, {} pages, mood {}",
            request.child_age, params.page_count, mood
        );

        let prompt = self.build_prompt(request, insights, &params, mood);
        let response = llm
            .chat(&self.system_prompt(), &prompt)
            .await
            .map_err(|e| StoryError::OutlineGenerationFailed { reason: e.to_string() })?;

        let outline = self.parse_response(&response, request, &params, mood)?;
        info!(
            "Outline ready: \"{}\" starring {} ({} beats)",
            outline.theme,
            outline.main_character.name,
            outline.story_beats.len()
        );
        Ok(outline)
    }
}
