use log::{debug, warn};
use serde::Deserialize;

use crate::core::error::{Stage, StageOutput, StoryError};
use crate::core::policy::AgeParameters;
use crate::core::story::{CharacterProfile, DialogueLine, Scene};
use crate::services::llm::LlmClient;
use crate::services::payload::{decode_payload, Validate};
use crate::utils::text::{contains_ignore_case, count_quoted_spans, count_words};

#[derive(Debug, Deserialize)]
struct DialoguePayload {
    text: String,
    #[serde(default)]
    dialogue: Vec<DialogueLine>,
}

impl Validate for DialoguePayload {
    fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("enhanced text is empty".to_string());
        }
        if self.dialogue.is_empty() {
            return Err("no dialogue lines".to_string());
        }
        if self
            .dialogue
            .iter()
            .any(|d| d.speaker.trim().is_empty() || d.line.trim().is_empty())
        {
            return Err("dialogue line without speaker or words".to_string());
        }
        Ok(())
    }
}

/// Stage 3: weaves a few short lines of speech into a finished scene.
#[derive(Debug, Clone)]
pub struct DialogueEnhancer {
    min_age: u8,
    max_lines: usize,
}

impl DialogueEnhancer {
    pub fn new(min_age: u8, max_lines: usize) -> Self {
        Self { min_age, max_lines }
    }

    pub fn system_prompt(&self) -> String {
        "You add short, natural dialogue to children's picture book pages without changing what happens. \
         Reply with a single valid JSON object and nothing else."
            .to_string()
    }

    pub fn build_prompt(&self, scene: &Scene, character: &CharacterProfile, params: &AgeParameters, language: &str) -> String {
        format!(
            "Add at most {max} short lines of dialogue to this page, in language \"{lang}\".\n\
             {name} speaks in this style: {speech}.\n\
             Keep the events, the {emotion} feeling and the length (about {words} words) the same.\n\
             Vocabulary: {vocab}. Never use these words: {forbidden}.\n\
             \nPAGE\n{text}\n\
             \nReturn JSON: {{\"text\": \"the page with dialogue woven in\", \
             \"dialogue\": [{{\"speaker\": \"...\", \"line\": \"...\"}}]}}",
            max = self.max_lines,
            lang = language,
            name = character.name,
            speech = character.speech_style,
            emotion = scene.emotion,
            words = params.target_words,
            vocab = params.vocabulary_ceiling,
            forbidden = params.forbidden_terms.join(", "),
            text = scene.text,
        )
    }

    fn parse_response(
        &self,
        response: &str,
        scene: &Scene,
        character: &CharacterProfile,
        params: &AgeParameters,
    ) -> Result<Scene, StoryError> {
        let page = scene.page_number;
        let payload: DialoguePayload = decode_payload(response).map_err(|e| {
            StoryError::MalformedCompletionPayload {
                stage: Stage::DialogueEnhancement,
                reason: e.to_string(),
            }
            .escalate(page)
        })?;

        let skipped = |reason: String| StoryError::DialogueEnhancementSkipped { page, reason };

        if let Some(term) = params.find_forbidden_term(&payload.text) {
            return Err(skipped(format!("enhanced text introduced \"{}\"", term)));
        }
        if payload.dialogue.len() > self.max_lines {
            return Err(skipped(format!(
                "{} dialogue lines, at most {} allowed",
                payload.dialogue.len(),
                self.max_lines
            )));
        }
        let added_speech = count_quoted_spans(&payload.text).saturating_sub(count_quoted_spans(&scene.text));
        if added_speech > self.max_lines {
            return Err(skipped(format!(
                "enhanced text adds {} spoken lines, at most {} allowed",
                added_speech, self.max_lines
            )));
        }
        if contains_ignore_case(&scene.text, &character.name) && !contains_ignore_case(&payload.text, &character.name) {
            return Err(skipped(format!("enhanced text no longer names {}", character.name)));
        }
        let words = count_words(&payload.text);
        if words > params.max_words() && count_words(&scene.text) <= params.max_words() {
            return Err(skipped(format!(
                "enhanced text has {} words, at most {} allowed",
                words,
                params.max_words()
            )));
        }

        Ok(Scene {
            text: payload.text.trim().to_string(),
            dialogue: payload.dialogue,
            ..scene.clone()
        })
    }

    /// Never fails. Young readers and scenes that already have dialogue come
    /// back unchanged without a backend call.
    pub async fn enhance(
        &self,
        llm: &dyn LlmClient,
        scene: &Scene,
        character: &CharacterProfile,
        params: &AgeParameters,
        language: &str,
    ) -> StageOutput<Scene> {
        if character.age < self.min_age {
            debug!("Page {}: reader age {} is below dialogue age, skipping", scene.page_number, character.age);
            return StageOutput::ok(scene.clone());
        }
        if !scene.dialogue.is_empty() {
            debug!("Page {}: scene already has dialogue", scene.page_number);
            return StageOutput::ok(scene.clone());
        }

        let prompt = self.build_prompt(scene, character, params, language);
        let result = match llm.chat(&self.system_prompt(), &prompt).await {
            Ok(response) => self.parse_response(&response, scene, character, params),
            Err(e) => Err(StoryError::DialogueEnhancementSkipped {
                page: scene.page_number,
                reason: e.to_string(),
            }),
        };

        match result {
            Ok(enhanced) => StageOutput::ok(enhanced),
            Err(e) => {
                warn!("Page {}: keeping scene without dialogue ({})", scene.page_number, e);
                StageOutput::degraded(scene.clone(), e)
            }
        }
    }
}
