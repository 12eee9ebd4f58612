use log::{debug, warn};
use serde::Deserialize;

use crate::core::error::{Stage, StageOutput, StoryError};
use crate::core::policy::AgeParameters;
use crate::core::story::{CharacterProfile, DialogueLine, Emotion, Mood, Scene};
use crate::services::consistency::TextGuidelines;
use crate::services::llm::LlmClient;
use crate::services::payload::{decode_payload, Validate};
use crate::utils::text::{count_sentences, dedup_ordered, BudgetCheck};

#[derive(Debug, Deserialize)]
struct ScenePayload {
    text: String,
    #[serde(default)]
    emotion: String,
    #[serde(default)]
    visual_elements: Vec<String>,
    #[serde(default)]
    dialogue: Vec<DialogueLine>,
}

impl Validate for ScenePayload {
    fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("scene text is empty".to_string());
        }
        if count_sentences(&self.text) < 2 {
            return Err("scene text is a one-line summary".to_string());
        }
        Ok(())
    }
}

/// Everything needed to expand one beat.
#[derive(Debug, Clone, Copy)]
pub struct SceneRequest<'a> {
    pub page_number: u32,
    pub total_pages: u32,
    pub beat: &'a str,
    pub character: &'a CharacterProfile,
    pub params: &'a AgeParameters,
    pub mood: Mood,
    pub language: &'a str,
    pub guidelines: Option<&'a TextGuidelines>,
}

impl SceneRequest<'_> {
    /// Emotion the page was planned with, used whenever the backend gives none.
    pub fn planned_emotion(&self) -> Emotion {
        self.guidelines.map(|g| g.emotion).unwrap_or_default()
    }
}

/// Stage 2: turns one beat into a full page of text.
#[derive(Debug, Clone, Default)]
pub struct SceneExpander {
    enforce_word_budget: bool,
}

impl SceneExpander {
    pub fn new(enforce_word_budget: bool) -> Self {
        Self { enforce_word_budget }
    }

    pub fn system_prompt(&self) -> String {
        "You write single pages of children's picture books. \
         Each page is vivid, concrete and gentle. \
         Reply with a single valid JSON object and nothing else."
            .to_string()
    }

    pub fn build_prompt(&self, req: &SceneRequest<'_>) -> String {
        let c = req.character;
        let p = req.params;
        let emotions: Vec<&str> = Emotion::ALL.iter().map(|e| e.as_str()).collect();

        let mut prompt = format!(
            "Write page {page} of {total} in language \"{lang}\".\n\
             Story beat: {beat}\n\
             \nMAIN CHARACTER\n\
             {name}, a {age}-year-old {species}. Looks: {appearance}.\n\
             Personality: {traits}. Speech style: {speech}.\n\
             \nREQUIREMENTS\n\
             - Between {min} and {max} words, about {sentences} sentences.\n\
             - Include an opening that sets the place, an action, a sensory detail \
             (sound, smell, touch or color) and {name}'s emotional reaction.\n\
             - Mention {name} by name.\n\
             - Mood: {mood}. Vocabulary: {vocab}.\n\
             - Never use these words: {forbidden}.\n",
            page = req.page_number,
            total = req.total_pages,
            lang = req.language,
            beat = req.beat,
            name = c.name,
            age = c.age,
            species = c.species,
            appearance = c.appearance,
            traits = c.personality_traits.join(", "),
            speech = c.speech_style,
            min = p.min_words(),
            max = p.max_words(),
            sentences = p.target_sentences,
            mood = req.mood,
            vocab = p.vocabulary_ceiling,
            forbidden = p.forbidden_terms.join(", "),
        );

        if let Some(guidelines) = req.guidelines {
            prompt.push_str("\nCONTINUITY\n");
            prompt.push_str(&guidelines.to_prompt_block());
        }

        prompt.push_str(&format!(
            "\nReturn JSON: {{\"text\": \"...\", \"emotion\": \"one of {}\", \
             \"visual_elements\": [\"up to five concrete things to draw\"]}}",
            emotions.join("|")
        ));
        prompt
    }

    fn parse_response(&self, response: &str, page_number: u32, planned: Emotion) -> Result<Scene, StoryError> {
        let payload: ScenePayload = decode_payload(response).map_err(|e| {
            StoryError::MalformedCompletionPayload {
                stage: Stage::SceneExpansion,
                reason: e.to_string(),
            }
            .escalate(page_number)
        })?;

        let emotion = Emotion::parse(&payload.emotion).unwrap_or_else(|| {
            debug!("Page {}: unknown emotion '{}', using {}", page_number, payload.emotion, planned);
            planned
        });

        Ok(Scene {
            page_number,
            text: payload.text.trim().to_string(),
            emotion,
            visual_elements: dedup_ordered(&payload.visual_elements),
            dialogue: payload.dialogue,
        })
    }

    fn budget(&self, scene: &Scene, params: &AgeParameters) -> BudgetCheck {
        BudgetCheck::measure(&scene.text, params.target_words, params.word_tolerance, params.target_sentences)
    }

    async fn attempt(&self, llm: &dyn LlmClient, prompt: &str, req: &SceneRequest<'_>) -> Result<Scene, StoryError> {
        let page_number = req.page_number;
        let response = llm
            .chat(&self.system_prompt(), prompt)
            .await
            .map_err(|e| StoryError::SceneExpansionDegraded {
                page: page_number,
                reason: e.to_string(),
            })?;
        self.parse_response(&response, page_number, req.planned_emotion())
    }

    /// Never fails: any problem yields a minimal scene built from the beat plus a warning.
    pub async fn expand(&self, llm: &dyn LlmClient, req: &SceneRequest<'_>) -> StageOutput<Scene> {
        let page = req.page_number;
        let prompt = self.build_prompt(req);

        let mut scene = match self.attempt(llm, &prompt, req).await {
            Ok(scene) => scene,
            Err(e) => return self.fallback(req, e),
        };

        let check = self.budget(&scene, req.params);
        if check.is_within() {
            return StageOutput::ok(scene);
        }

        warn!(
            "Page {}: {} words / {} sentences, expected {}-{} words / ~{} sentences",
            page, check.words, check.sentences, check.min_words, check.max_words, check.target_sentences
        );
        if !self.enforce_word_budget {
            return StageOutput::ok(scene);
        }

        let retry_prompt = format!(
            "{}\n\nYour previous attempt had {} words and {} sentences. \
             Rewrite it with {}-{} words and about {} sentences.",
            prompt, check.words, check.sentences, check.min_words, check.max_words, check.target_sentences
        );
        scene = match self.attempt(llm, &retry_prompt, req).await {
            Ok(scene) => scene,
            Err(e) => return self.fallback(req, e),
        };

        let check = self.budget(&scene, req.params);
        if check.is_within() {
            StageOutput::ok(scene)
        } else {
            self.fallback(
                req,
                StoryError::SceneExpansionDegraded {
                    page,
                    reason: format!("text has {} words and {} sentences after a retry", check.words, check.sentences),
                },
            )
        }
    }

    fn fallback(&self, req: &SceneRequest<'_>, error: StoryError) -> StageOutput<Scene> {
        warn!("Page {}: falling back to the raw beat ({})", req.page_number, error);
        let scene = Scene {
            emotion: req.planned_emotion(),
            ..Scene::from_beat(req.page_number, req.beat)
        };
        StageOutput::degraded(scene, error)
    }
}
