//! Session-scoped consistency engine.
//!
//! One engine is created per generation request and owned by that request's
//! pipeline run. It hands out per-page guidance while pages are generated and
//! scores the finished story afterwards.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::error::StoryError;
use crate::core::policy::{allowed_transitions, is_transition_allowed, AgeParameters};
use crate::core::state::{ConsistencyState, NarrativeElementKind};
use crate::core::story::{CharacterProfile, Emotion, Mood, StoryPage};
use crate::services::identity::{derive_identity, CharacterIdentity};
use crate::services::visual::{PromptRequest, VisualPromptComposer, VisualStyleConfig};
use crate::utils::text::{contains_ignore_case, dedup_ordered, normalize_whitespace};

const FALLBACK_TRAITS: &[&str] = &["kind", "curious", "brave"];
const AVOID_LIST_LEN: usize = 8;

/// Penalties and threshold used by [`ConsistencyEngine::validate_consistency`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    #[serde(default = "default_visual_anchor_penalty")]
    pub visual_anchor_penalty: u32,
    #[serde(default = "default_missing_name_penalty")]
    pub missing_name_penalty: u32,
    #[serde(default = "default_forbidden_term_penalty")]
    pub forbidden_term_penalty: u32,
    #[serde(default = "default_emotion_jump_penalty")]
    pub emotion_jump_penalty: u32,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: u32,
}

fn default_visual_anchor_penalty() -> u32 {
    20
}

fn default_missing_name_penalty() -> u32 {
    10
}

fn default_forbidden_term_penalty() -> u32 {
    15
}

fn default_emotion_jump_penalty() -> u32 {
    5
}

fn default_pass_threshold() -> u32 {
    70
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            visual_anchor_penalty: default_visual_anchor_penalty(),
            missing_name_penalty: default_missing_name_penalty(),
            forbidden_term_penalty: default_forbidden_term_penalty(),
            emotion_jump_penalty: default_emotion_jump_penalty(),
            pass_threshold: default_pass_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualPrompt {
    pub prompt: String,
    pub seed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextGuidelines {
    pub page_number: u32,
    pub emotion: Emotion,
    pub language: String,
    pub speech_style: String,
    pub vocabulary_ceiling: String,
    pub suggested_unused_phrase: Option<String>,
    pub reaction_pattern: String,
    pub avoid_repetition: Vec<String>,
    pub narrative_context: String,
    /// Set when the requested emotion does not follow naturally from the previous page.
    pub transition_warning: Option<String>,
}

impl TextGuidelines {
    /// Renders the guidelines as an instruction block for a completion prompt.
    pub fn to_prompt_block(&self) -> String {
        let mut block = format!(
            "Feeling on this page: {}\nSpeech style: {}\nVocabulary: {}\nEmotional reaction: {}\n",
            self.emotion, self.speech_style, self.vocabulary_ceiling, self.reaction_pattern
        );
        if let Some(note) = &self.transition_warning {
            block.push_str(&format!("Transition: {}\n", note));
        }
        if let Some(phrase) = &self.suggested_unused_phrase {
            block.push_str(&format!("You may use this fresh phrase: \"{}\"\n", phrase));
        }
        if !self.avoid_repetition.is_empty() {
            block.push_str(&format!("Do not repeat these phrases: {}\n", self.avoid_repetition.join("; ")));
        }
        if !self.narrative_context.is_empty() {
            block.push_str(&format!("Story so far: {}\n", self.narrative_context));
        }
        block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueCategory {
    Visual,
    Text,
    Emotional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingAnchorTags,
    MissingCharacterName,
    ForbiddenVocabulary,
    EmotionJump,
}

impl IssueKind {
    pub fn category(&self) -> IssueCategory {
        match self {
            IssueKind::MissingAnchorTags => IssueCategory::Visual,
            IssueKind::MissingCharacterName | IssueKind::ForbiddenVocabulary => IssueCategory::Text,
            IssueKind::EmotionJump => IssueCategory::Emotional,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IssueKind::MissingAnchorTags | IssueKind::ForbiddenVocabulary => Severity::High,
            IssueKind::MissingCharacterName => Severity::Medium,
            IssueKind::EmotionJump => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub page: u32,
    pub message: String,
    pub fix: Option<String>,
}

impl ConsistencyIssue {
    fn new(kind: IssueKind, page: u32, message: String, fix: Option<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            page,
            message,
            fix,
        }
    }

    pub fn category(&self) -> IssueCategory {
        self.kind.category()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyCheckResult {
    pub is_consistent: bool,
    pub score: u32,
    pub visual_score: u32,
    pub text_score: u32,
    pub emotional_score: u32,
    pub threshold: u32,
    pub issues: Vec<ConsistencyIssue>,
    pub suggestions: Vec<String>,
}

impl ConsistencyCheckResult {
    pub fn issues_in(&self, category: IssueCategory) -> impl Iterator<Item = &ConsistencyIssue> {
        self.issues.iter().filter(move |i| i.category() == category)
    }

    /// Advisory warning when the score is under the pass threshold.
    pub fn threshold_warning(&self) -> Option<StoryError> {
        (!self.is_consistent).then_some(StoryError::ConsistencyThresholdNotMet {
            score: self.score,
            threshold: self.threshold,
        })
    }
}

/// Fills in what a usable main character needs: the requested age, a speech
/// style and at least two distinct personality traits.
pub fn normalize_character(mut character: CharacterProfile, age: u8, params: &AgeParameters) -> CharacterProfile {
    character.name = normalize_whitespace(&character.name);
    character.species = normalize_whitespace(&character.species);
    character.age = age;
    if character.speech_style.trim().is_empty() {
        character.speech_style = params.default_speech_style.to_string();
    }

    let mut traits = dedup_ordered(character.personality_traits.iter().map(|t| t.trim()));
    for fallback in FALLBACK_TRAITS {
        if traits.len() >= 2 {
            break;
        }
        if !traits.iter().any(|t| t.eq_ignore_ascii_case(fallback)) {
            traits.push(fallback.to_string());
        }
    }
    character.personality_traits = traits;
    character
}

fn phrase_bank(emotion: Emotion) -> &'static [&'static str] {
    match emotion {
        Emotion::Happy => &[
            "a big smile spread across {name}'s face",
            "{name} giggled with delight",
            "felt warm and sunny inside",
            "bounced up and down on tiptoes",
        ],
        Emotion::Excited => &[
            "{name}'s heart went thump-thump with excitement",
            "could hardly stand still",
            "eyes sparkled like stars",
            "clapped with glee",
        ],
        Emotion::Curious => &[
            "{name} tilted their head and wondered",
            "leaned in for a closer look",
            "what could it be?",
            "a little question popped into {name}'s mind",
        ],
        Emotion::Worried => &[
            "{name}'s tummy felt fluttery",
            "took a small, careful step",
            "held on a little tighter",
            "whispered, \"What if...?\"",
        ],
        Emotion::Sad => &[
            "a tear rolled down {name}'s cheek",
            "felt heavy like a rainy day",
            "sat quietly for a while",
            "missed it very much",
        ],
        Emotion::Brave => &[
            "{name} took a deep breath and stood tall",
            "said, \"I can do this!\"",
            "stepped forward with a steady heart",
            "chose to try anyway",
        ],
        Emotion::Calm => &[
            "{name} breathed slowly in and out",
            "everything felt soft and quiet",
            "snuggled up, cozy and safe",
            "smiled a small, peaceful smile",
        ],
    }
}

fn reaction_pattern(emotion: Emotion) -> &'static str {
    match emotion {
        Emotion::Happy => "show joy through the body (smiling, bouncing) and share it with someone",
        Emotion::Excited => "quick energetic actions, then a spoken exclamation",
        Emotion::Curious => "notice a detail, ask a question, move closer to find out",
        Emotion::Worried => "name the worry in the body (tummy, small steps), then a comforting thought",
        Emotion::Sad => "a quiet pause, a gentle sign of sadness, and someone or something that comforts",
        Emotion::Brave => "a deep breath, a decision said out loud, then a small courageous action",
        Emotion::Calm => "slow breathing, soft surroundings, a peaceful observation",
    }
}

/// Per-request consistency session. Never shared between requests.
#[derive(Debug, Clone)]
pub struct ConsistencyEngine {
    character: CharacterProfile,
    identity: CharacterIdentity,
    params: AgeParameters,
    language: String,
    mood: Mood,
    composer: VisualPromptComposer,
    scoring: ScoringPolicy,
    state: ConsistencyState,
    planned_emotions: BTreeMap<u32, Emotion>,
    page_seeds: BTreeMap<u32, u32>,
}

impl ConsistencyEngine {
    pub fn initialize(character: CharacterProfile, age: u8, language: &str) -> Self {
        let params = AgeParameters::for_age(age);
        let character = normalize_character(character, age, &params);
        let identity = derive_identity(&character);
        debug!(
            "Consistency session for {} ({}), seed {}",
            character.name, identity.hash, identity.consistency_seed
        );
        Self {
            character,
            identity,
            params,
            language: language.to_string(),
            mood: Mood::default(),
            composer: VisualPromptComposer::new(VisualStyleConfig::default()),
            scoring: ScoringPolicy::default(),
            state: ConsistencyState::default(),
            planned_emotions: BTreeMap::new(),
            page_seeds: BTreeMap::new(),
        }
    }

    pub fn with_mood(mut self, mood: Mood) -> Self {
        self.mood = mood;
        self
    }

    pub fn with_visual_style(mut self, style: VisualStyleConfig) -> Self {
        self.composer = VisualPromptComposer::new(style);
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringPolicy) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn character(&self) -> &CharacterProfile {
        &self.character
    }

    pub fn identity(&self) -> &CharacterIdentity {
        &self.identity
    }

    pub fn age_parameters(&self) -> &AgeParameters {
        &self.params
    }

    pub fn mood(&self) -> Mood {
        self.mood
    }

    pub fn state(&self) -> &ConsistencyState {
        &self.state
    }

    /// Emotion of the closest earlier page. A finished page wins over a plan
    /// for the same page.
    fn previous_emotion(&self, page: u32) -> Option<Emotion> {
        let recorded = self.state.emotion_history().range(..page).next_back();
        let planned = self.planned_emotions.range(..page).next_back();
        match (recorded, planned) {
            (Some((rp, re)), Some((pp, pe))) => Some(if pp > rp { *pe } else { *re }),
            (Some((_, e)), None) | (None, Some((_, e))) => Some(*e),
            (None, None) => None,
        }
    }

    fn check_transition(&self, page: u32, emotion: Emotion) -> Option<String> {
        let previous = self.previous_emotion(page)?;
        if is_transition_allowed(previous, emotion) {
            return None;
        }
        Some(format!(
            "page {} moves from {} to {}; add a bridging moment",
            page, previous, emotion
        ))
    }

    /// Composes the page prompt, records the emotion and caches the page seed.
    pub fn get_visual_prompt(
        &mut self,
        page: u32,
        total_pages: u32,
        scene_elements: &[String],
        emotion: Emotion,
    ) -> VisualPrompt {
        if let Some(note) = self.check_transition(page, emotion) {
            warn!("Emotion transition: {}", note);
        }
        self.state.record_emotion(page, emotion);

        let identity = &self.identity;
        let seed = *self
            .page_seeds
            .entry(page)
            .or_insert_with(|| identity.page_seed(page));

        let request = PromptRequest {
            page_number: page,
            total_pages,
            scene_elements,
            emotion,
            mood: self.mood,
        };
        let prompt = self
            .composer
            .compose(&self.identity, &self.character.name, &self.params, &request);
        VisualPrompt { prompt, seed }
    }

    /// Replays an already finished page into the session, e.g. before
    /// regenerating one of its neighbours.
    pub fn record_page(&mut self, page: &StoryPage) {
        self.state.record_emotion(page.page_number, page.emotion);
        self.page_seeds.insert(page.page_number, page.seed);
    }

    /// Guidance for writing one page with its planned emotion. The emotion is
    /// kept as the page's plan for later transition checks. The suggested
    /// phrase is recorded as used, so the next call suggests a different one;
    /// once the emotion's own phrases are used up, neighbouring emotions lend theirs.
    pub fn get_text_guidelines(&mut self, page: u32, emotion: Emotion, context: &str) -> TextGuidelines {
        let transition_warning = self.check_transition(page, emotion);
        if let Some(note) = &transition_warning {
            warn!("Emotion transition: {}", note);
        }
        self.planned_emotions.insert(page, emotion);

        let name = self.character.name.clone();
        let suggested_unused_phrase = std::iter::once(emotion)
            .chain(allowed_transitions(emotion).iter().copied())
            .flat_map(phrase_bank)
            .map(|p| p.replace("{name}", &name))
            .find(|p| !self.state.is_phrase_used(p));
        let avoid_repetition: Vec<String> = self
            .state
            .used_phrases()
            .iter()
            .rev()
            .take(AVOID_LIST_LEN)
            .cloned()
            .collect();
        if let Some(phrase) = &suggested_unused_phrase {
            self.state.record_used_phrase(phrase);
        }

        TextGuidelines {
            page_number: page,
            emotion,
            language: self.language.clone(),
            speech_style: self.character.speech_style.clone(),
            vocabulary_ceiling: self.params.vocabulary_ceiling.to_string(),
            suggested_unused_phrase,
            reaction_pattern: reaction_pattern(emotion).to_string(),
            avoid_repetition,
            narrative_context: self.narrative_context(context),
            transition_warning,
        }
    }

    fn narrative_context(&self, context: &str) -> String {
        let elements = self.state.narrative_elements();
        let mut parts = Vec::new();
        let join = |set: &std::collections::BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(", ");
        if !elements.introduced_characters.is_empty() {
            parts.push(format!("characters met: {}", join(&elements.introduced_characters)));
        }
        if !elements.visited_locations.is_empty() {
            parts.push(format!("places visited: {}", join(&elements.visited_locations)));
        }
        if !elements.mentioned_objects.is_empty() {
            parts.push(format!("objects seen: {}", join(&elements.mentioned_objects)));
        }
        let context = context.trim();
        if !context.is_empty() {
            parts.push(context.to_string());
        }
        parts.join(". ")
    }

    pub fn record_used_phrase(&mut self, phrase: &str) -> bool {
        self.state.record_used_phrase(phrase)
    }

    pub fn record_narrative_element(&mut self, kind: NarrativeElementKind, value: &str) -> bool {
        self.state.record_narrative_element(kind, value)
    }

    /// Scores a finished story. Never fails; problems are reported as issues.
    pub fn validate_consistency(&self, pages: &[StoryPage]) -> ConsistencyCheckResult {
        let prefix = self.identity.anchor_prefix();
        let name = &self.character.name;
        let mut visual = 100u32;
        let mut text = 100u32;
        let mut emotional = 100u32;
        let mut issues = Vec::new();

        for (i, page) in pages.iter().enumerate() {
            let n = page.page_number;

            if !page.visual_prompt.contains(&prefix) {
                visual = visual.saturating_sub(self.scoring.visual_anchor_penalty);
                issues.push(ConsistencyIssue::new(
                    IssueKind::MissingAnchorTags,
                    n,
                    format!("page {} prompt is missing the character anchor tags", n),
                    Some(format!("start the prompt with \"{}\"", prefix)),
                ));
            }

            if !contains_ignore_case(&page.text, name) {
                text = text.saturating_sub(self.scoring.missing_name_penalty);
                issues.push(ConsistencyIssue::new(
                    IssueKind::MissingCharacterName,
                    n,
                    format!("page {} never mentions {}", n, name),
                    Some(format!("mention {} by name at least once", name)),
                ));
            }

            if let Some(term) = self.params.find_forbidden_term(&page.text) {
                text = text.saturating_sub(self.scoring.forbidden_term_penalty);
                issues.push(ConsistencyIssue::new(
                    IssueKind::ForbiddenVocabulary,
                    n,
                    format!("page {} uses \"{}\", which is not suitable for this age", n, term),
                    Some(format!("replace \"{}\" with gentler wording", term)),
                ));
            }

            if i > 0 {
                let previous = pages[i - 1].emotion;
                if !is_transition_allowed(previous, page.emotion) {
                    emotional = emotional.saturating_sub(self.scoring.emotion_jump_penalty);
                    issues.push(ConsistencyIssue::new(
                        IssueKind::EmotionJump,
                        n,
                        format!("page {} jumps from {} to {}", n, previous, page.emotion),
                        None,
                    ));
                }
            }
        }

        let score = ((visual + text + emotional) as f64 / 3.0).round() as u32;
        let is_consistent = score >= self.scoring.pass_threshold;

        let mut seen = Vec::new();
        let mut suggestions = Vec::new();
        for issue in &issues {
            let category = issue.category();
            if seen.contains(&category) {
                continue;
            }
            seen.push(category);
            suggestions.push(suggestion_for(category, name).to_string());
        }

        ConsistencyCheckResult {
            is_consistent,
            score,
            visual_score: visual,
            text_score: text,
            emotional_score: emotional,
            threshold: self.scoring.pass_threshold,
            issues,
            suggestions,
        }
    }
}

fn suggestion_for(category: IssueCategory, name: &str) -> String {
    match category {
        IssueCategory::Visual => {
            "Regenerate the flagged pages' prompts so the character anchor tags come first".to_string()
        }
        IssueCategory::Text => format!(
            "Rewrite the flagged pages so {} is named and the wording suits the reader's age",
            name
        ),
        IssueCategory::Emotional => {
            "Add bridging moments between pages whose emotions change abruptly".to_string()
        }
    }
}
