use anyhow::{Context, Result};
use futures_util::StreamExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::config::Config;
use crate::core::error::{StageOutput, StoryError, StoryResult};
use crate::core::guidance::SensitiveContentGuide;
use crate::core::policy::AgeParameters;
use crate::core::state::NarrativeElementKind;
use crate::core::story::{AnalysisInsights, CharacterProfile, GenerationRequest, Mood, Scene, StoryOutline, StoryPage};
use crate::services::consistency::{ConsistencyCheckResult, ConsistencyEngine, TextGuidelines};
use crate::services::dialogue::DialogueEnhancer;
use crate::services::identity::CharacterIdentity;
use crate::services::llm::{create_llm, LlmClient};
use crate::services::outline::OutlineGenerator;
use crate::services::resilience::{CircuitBreaker, ResilientLlm};
use crate::services::scene::{SceneExpander, SceneRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pages expanded at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_dialogue_min_age")]
    pub dialogue_min_age: u8,
    #[serde(default = "default_max_dialogue_lines")]
    pub max_dialogue_lines: usize,
    /// Re-prompt, then fall back to the beat, when a page misses its word budget.
    #[serde(default)]
    pub enforce_word_budget: bool,
}

fn default_max_concurrency() -> usize {
    7
}

fn default_dialogue_min_age() -> u8 {
    4
}

fn default_max_dialogue_lines() -> usize {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            dialogue_min_age: default_dialogue_min_age(),
            max_dialogue_lines: default_max_dialogue_lines(),
            enforce_word_budget: false,
        }
    }
}

/// A finished (or aborted) story with its consistency report.
#[derive(Debug, Clone)]
pub struct GeneratedStory {
    pub request: GenerationRequest,
    pub outline: StoryOutline,
    pub identity: CharacterIdentity,
    /// Ascending page order.
    pub pages: Vec<StoryPage>,
    pub consistency: ConsistencyCheckResult,
    /// Non-fatal problems, one entry per degraded stage.
    pub warnings: Vec<StoryError>,
    /// Set when the request was cancelled during page generation.
    pub aborted: bool,
}

impl GeneratedStory {
    pub fn page(&self, page_number: u32) -> Option<&StoryPage> {
        self.pages.iter().find(|p| p.page_number == page_number)
    }
}

/// Stages 2 and 3 for one page.
struct PageDraft {
    scene: Scene,
    warnings: Vec<StoryError>,
}

pub struct StoryPipeline {
    config: Config,
    llm: Arc<dyn LlmClient>,
    outline: OutlineGenerator,
    scenes: SceneExpander,
    dialogue: DialogueEnhancer,
}

impl StoryPipeline {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>) -> Result<Self> {
        config.validate()?;

        let mut guide = SensitiveContentGuide::default();
        if let Some(path) = &config.sensitive_guide_path {
            let extra = SensitiveContentGuide::load(path)
                .with_context(|| format!("Failed to load sensitive content guide from {}", path))?;
            info!("Loaded {} sensitive content categories from {}", extra.len(), path);
            guide.extend(extra);
        }

        Ok(Self {
            outline: OutlineGenerator::new(Arc::new(guide)),
            scenes: SceneExpander::new(config.pipeline.enforce_word_budget),
            dialogue: DialogueEnhancer::new(config.pipeline.dialogue_min_age, config.pipeline.max_dialogue_lines),
            config,
            llm,
        })
    }

    /// Builds the configured backend behind a circuit breaker and retries.
    pub fn from_config(config: Config) -> Result<Self> {
        let backend: Arc<dyn LlmClient> = Arc::from(create_llm(&config.llm)?);
        let breaker = Arc::new(CircuitBreaker::from_config(&config.resilience));
        let llm: Arc<dyn LlmClient> = Arc::new(ResilientLlm::new(backend, breaker, &config.resilience));
        Self::new(config, llm)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn start_session(&self, character: CharacterProfile, request: &GenerationRequest, mood: Mood) -> ConsistencyEngine {
        ConsistencyEngine::initialize(character, request.child_age, &request.language)
            .with_mood(mood)
            .with_visual_style(self.config.visual.clone())
            .with_scoring(self.config.scoring.clone())
    }

    async fn draft_page(
        &self,
        request: &SceneRequest<'_>,
        character: &CharacterProfile,
        language: &str,
    ) -> PageDraft {
        let StageOutput { value: scene, warning } = self.scenes.expand(self.llm.as_ref(), request).await;
        if let Some(warning) = warning {
            // A fallback scene is the bare beat; leave it as is.
            return PageDraft {
                scene,
                warnings: vec![warning],
            };
        }

        let StageOutput { value: scene, warning } = self
            .dialogue
            .enhance(self.llm.as_ref(), &scene, character, request.params, language)
            .await;

        PageDraft {
            scene,
            warnings: warning.into_iter().collect(),
        }
    }

    fn finish_page(engine: &mut ConsistencyEngine, scene: &Scene, total_pages: u32) -> StoryPage {
        if let Some(location) = scene.visual_elements.first() {
            engine.record_narrative_element(NarrativeElementKind::Location, location);
        }
        for element in &scene.visual_elements {
            engine.record_narrative_element(NarrativeElementKind::Object, element);
        }

        let visual = engine.get_visual_prompt(scene.page_number, total_pages, &scene.visual_elements, scene.emotion);
        StoryPage {
            page_number: scene.page_number,
            text: scene.text.clone(),
            scene_description: scene.description(),
            visual_prompt: visual.prompt,
            seed: visual.seed,
            emotion: scene.emotion,
        }
    }

    fn score(engine: &ConsistencyEngine, pages: &[StoryPage], warnings: &mut Vec<StoryError>) -> ConsistencyCheckResult {
        let consistency = engine.validate_consistency(pages);
        info!(
            "Consistency score {} (visual {}, text {}, emotional {}), {} issue(s)",
            consistency.score,
            consistency.visual_score,
            consistency.text_score,
            consistency.emotional_score,
            consistency.issues.len()
        );
        if let Some(warning) = consistency.threshold_warning() {
            warn!("{}", warning);
            warnings.push(warning);
        }
        consistency
    }

    /// Runs all four stages for one request.
    ///
    /// Returns an error only for fatal failures: the outline could not be
    /// produced, or the request was cancelled before it was. Cancelling during
    /// page generation returns the pages finished so far with `aborted` set.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        insights: &AnalysisInsights,
        cancel: &CancellationToken,
    ) -> StoryResult<GeneratedStory> {
        if cancel.is_cancelled() {
            return Err(StoryError::Cancelled);
        }

        let mut outline = tokio::select! {
            _ = cancel.cancelled() => return Err(StoryError::Cancelled),
            outline = self.outline.generate(self.llm.as_ref(), request, insights) => outline?,
        };

        let mut engine = self.start_session(outline.main_character.clone(), request, outline.mood);
        outline.main_character = engine.character().clone();
        let character = engine.character().clone();
        let identity = engine.identity().clone();
        let params = AgeParameters::for_age(request.child_age);
        let total_pages = outline.story_beats.len() as u32;
        engine.record_narrative_element(NarrativeElementKind::Character, &character.name);

        let guidelines: Vec<TextGuidelines> = outline
            .story_beats
            .iter()
            .enumerate()
            .map(|(i, beat)| {
                let page = i as u32 + 1;
                engine.get_text_guidelines(page, outline.planned_emotion(page), beat)
            })
            .collect();

        info!(
            "Expanding {} pages for {} (concurrency {})",
            total_pages, character.name, self.config.pipeline.max_concurrency
        );

        let mut drafts: Vec<PageDraft> = Vec::with_capacity(outline.story_beats.len());
        let mut aborted = false;
        {
            let mut stream = futures_util::stream::iter(outline.story_beats.iter().zip(guidelines.iter()).enumerate())
                .map(|(i, (beat, guidelines))| {
                    let req = SceneRequest {
                        page_number: i as u32 + 1,
                        total_pages,
                        beat,
                        character: &character,
                        params: &params,
                        mood: outline.mood,
                        language: &request.language,
                        guidelines: Some(guidelines),
                    };
                    let character = &character;
                    let language = request.language.as_str();
                    async move { self.draft_page(&req, character, language).await }
                })
                .buffer_unordered(self.config.pipeline.max_concurrency.max(1));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!("Generation cancelled with {}/{} pages finished", drafts.len(), total_pages);
                        aborted = true;
                        break;
                    }
                    next = stream.next() => match next {
                        Some(draft) => drafts.push(draft),
                        None => break,
                    },
                }
            }
        }

        drafts.sort_by_key(|d| d.scene.page_number);

        let mut warnings = Vec::new();
        let mut pages = Vec::with_capacity(drafts.len());
        for draft in drafts {
            warnings.extend(draft.warnings);
            pages.push(Self::finish_page(&mut engine, &draft.scene, total_pages));
        }

        let consistency = Self::score(&engine, &pages, &mut warnings);
        info!(
            "Story \"{}\" ready: {} page(s), {} warning(s){}",
            outline.theme,
            pages.len(),
            warnings.len(),
            if aborted { ", aborted" } else { "" }
        );

        Ok(GeneratedStory {
            request: request.clone(),
            outline,
            identity,
            pages,
            consistency,
            warnings,
            aborted,
        })
    }

    /// Re-expands and re-composes one page of an existing story. The page keeps
    /// its original seed, so the renderer can redraw just that image.
    pub async fn regenerate_page(&self, story: &GeneratedStory, page_number: u32) -> StoryResult<GeneratedStory> {
        let total_pages = story.outline.story_beats.len() as u32;
        if page_number == 0 || page_number > total_pages {
            return Err(StoryError::PageOutOfRange(page_number));
        }
        let beat = &story.outline.story_beats[page_number as usize - 1];
        info!("Regenerating page {} of \"{}\"", page_number, story.outline.theme);

        let request = &story.request;
        let mut engine = self.start_session(story.outline.main_character.clone(), request, story.outline.mood);
        let character = engine.character().clone();
        let params = AgeParameters::for_age(request.child_age);
        engine.record_narrative_element(NarrativeElementKind::Character, &character.name);
        for page in story.pages.iter().filter(|p| p.page_number != page_number) {
            engine.record_page(page);
        }

        let emotion = story
            .page(page_number)
            .map(|p| p.emotion)
            .unwrap_or_else(|| story.outline.planned_emotion(page_number));
        let guidelines = engine.get_text_guidelines(page_number, emotion, beat);
        let req = SceneRequest {
            page_number,
            total_pages,
            beat,
            character: &character,
            params: &params,
            mood: story.outline.mood,
            language: &request.language,
            guidelines: Some(&guidelines),
        };
        let draft = self.draft_page(&req, &character, &request.language).await;
        let page = Self::finish_page(&mut engine, &draft.scene, total_pages);

        let mut updated = story.clone();
        updated.warnings.retain(|w| {
            w.page() != Some(page_number) && !matches!(w, StoryError::ConsistencyThresholdNotMet { .. })
        });
        updated.warnings.extend(draft.warnings);
        updated.pages.retain(|p| p.page_number != page_number);
        updated.pages.push(page);
        updated.pages.sort_by_key(|p| p.page_number);
        updated.consistency = Self::score(&engine, &updated.pages, &mut updated.warnings);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::story::Emotion;
    use crate::services::llm::{LlmError, LlmResult};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    const EMOTIONS: [&str; 7] = ["happy", "curious", "worried", "brave", "happy", "calm", "happy"];

    fn between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
        let from = s.find(start)? + start.len();
        let to = s[from..].find(end)? + from;
        Some(&s[from..to])
    }

    fn page_text(page: u32) -> String {
        format!(
            "Luna hopped into the meadow on page {} as the morning sun warmed her long ears. \
             She heard bees humming softly and smelled sweet clover all around the old stone wall. \
             A bright blue feather drifted down and landed right beside her fluffy white paws. \
             Luna felt a happy tingle and decided to follow the feather to see where it would lead next.",
            page
        )
    }

    // Routes by prompt content, the way a real backend would see it.
    #[derive(Debug, Default)]
    struct StoryLlm {
        beats: usize,
        delays_ms: HashMap<u32, u64>,
        broken_pages: HashSet<u32>,
        fail_outline: bool,
        calls: Arc<Mutex<usize>>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl StoryLlm {
        fn new(beats: usize) -> Self {
            Self {
                beats,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl LlmClient for StoryLlm {
        async fn chat(&self, _system: &str, user: &str) -> LlmResult<String> {
            *self.calls.lock().unwrap() += 1;
            self.prompts.lock().unwrap().push(user.to_string());

            if user.contains("Plan a picture book") {
                if self.fail_outline {
                    return Err(LlmError::Client { status: 401, body: "bad key".to_string() });
                }
                let beats: Vec<String> = (1..=self.beats)
                    .map(|i| format!("Luna follows the blue feather to place number {}", i))
                    .collect();
                return Ok(serde_json::json!({
                    "theme": "Following curiosity",
                    "educational_takeaway": "Curiosity leads to friends",
                    "main_character": {
                        "name": "Luna",
                        "species": "rabbit",
                        "gender": "girl",
                        "appearance": "white fluffy fur, long ears, wearing a yellow raincoat",
                        "personality_traits": ["curious", "gentle"],
                        "speech_style": "soft and wondering"
                    },
                    "story_beats": beats
                })
                .to_string());
            }

            if let Some(page) = between(user, "Write page ", " of").and_then(|n| n.parse::<u32>().ok()) {
                if let Some(ms) = self.delays_ms.get(&page) {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                }
                if self.broken_pages.contains(&page) {
                    return Ok("I'd love to help! Here is a lovely page.".to_string());
                }
                let emotion = EMOTIONS[(page as usize - 1) % EMOTIONS.len()];
                return Ok(serde_json::json!({
                    "text": page_text(page),
                    "emotion": emotion,
                    "visual_elements": ["sunny meadow", format!("feather {}", page)]
                })
                .to_string());
            }

            if let Some(text) = between(user, "\nPAGE\n", "\n\nReturn JSON") {
                return Ok(serde_json::json!({
                    "text": format!("{} \"Hello!\" said Luna.", text),
                    "dialogue": [{"speaker": "Luna", "line": "Hello!"}]
                })
                .to_string());
            }

            Err(LlmError::InvalidResponse("unexpected prompt".to_string()))
        }
    }

    fn pipeline(llm: StoryLlm) -> StoryPipeline {
        StoryPipeline::new(Config::default(), Arc::new(llm)).unwrap()
    }

    #[tokio::test]
    async fn test_pages_come_back_in_order_despite_latency() -> Result<()> {
        let orders: [[u64; 5]; 4] = [
            [120, 90, 60, 30, 0],
            [30, 60, 90, 120, 0],
            [0, 120, 30, 90, 60],
            [90, 0, 120, 60, 30],
        ];
        for delays in orders {
            let mut llm = StoryLlm::new(5);
            llm.delays_ms = (1..=5).zip(delays).collect();
            let story = pipeline(llm)
                .generate(&GenerationRequest::new(5, "en"), &AnalysisInsights::default(), &CancellationToken::new())
                .await?;

            let numbers: Vec<u32> = story.pages.iter().map(|p| p.page_number).collect();
            assert_eq!(numbers, vec![1, 2, 3, 4, 5], "delays {:?}", delays);
            assert!(!story.aborted);
            assert!(story.warnings.is_empty(), "{:?}", story.warnings);

            let prefix = story.identity.anchor_prefix();
            assert!(story.pages.iter().all(|p| p.visual_prompt.starts_with(&prefix)));
            for page in &story.pages {
                assert_eq!(page.seed, story.identity.page_seed(page.page_number));
                assert!(page.text.contains(&format!("on page {} ", page.page_number)));
            }
            let seeds: HashSet<u32> = story.pages.iter().map(|p| p.seed).collect();
            assert_eq!(seeds.len(), 5);
            assert!(story.pages.iter().all(|p| p.text.contains("\"Hello!\" said Luna.")));
            assert_eq!(story.pages[2].emotion, Emotion::Worried);
            assert!(story.consistency.score >= 70);
            assert!(story.consistency.is_consistent);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_each_page_is_guided_by_its_planned_emotion() -> Result<()> {
        let llm = StoryLlm::new(7);
        let prompts = llm.prompts.clone();
        let insights = AnalysisInsights {
            dominant_emotions: vec!["sad".to_string(), "scared".to_string()],
            ..AnalysisInsights::default()
        };
        let story = pipeline(llm)
            .generate(&GenerationRequest::new(11, "en"), &insights, &CancellationToken::new())
            .await?;
        assert_eq!(story.pages.len(), 7);
        assert_eq!(story.outline.beat_emotions.len(), 7);

        let prompts = prompts.lock().unwrap();
        let scene_prompts: Vec<&String> = prompts.iter().filter(|p| p.contains("Write page ")).collect();
        assert_eq!(scene_prompts.len(), 7);

        let reactions: HashSet<&str> = scene_prompts
            .iter()
            .filter_map(|p| between(p, "Emotional reaction: ", "\n"))
            .collect();
        assert!(reactions.len() >= 4, "{:?}", reactions);
        assert!(scene_prompts.iter().all(|p| p.contains("You may use this fresh phrase")));

        let fresh: HashSet<&str> = scene_prompts
            .iter()
            .filter_map(|p| between(p, "You may use this fresh phrase: \"", "\"\n"))
            .collect();
        assert_eq!(fresh.len(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_one_bad_page_does_not_fail_the_story() -> Result<()> {
        let mut llm = StoryLlm::new(5);
        llm.broken_pages.insert(3);
        let story = pipeline(llm)
            .generate(&GenerationRequest::new(5, "en"), &AnalysisInsights::default(), &CancellationToken::new())
            .await?;

        assert_eq!(story.pages.len(), 5);
        assert_eq!(story.pages[2].text, "Luna follows the blue feather to place number 3");
        assert!(story
            .warnings
            .iter()
            .any(|w| matches!(w, StoryError::SceneExpansionDegraded { page: 3, .. })));
        assert!(story.warnings.iter().all(|w| !w.is_fatal()));
        Ok(())
    }

    #[tokio::test]
    async fn test_outline_failure_is_fatal() {
        let mut llm = StoryLlm::new(5);
        llm.fail_outline = true;
        let calls = llm.calls.clone();
        let err = pipeline(llm)
            .generate(&GenerationRequest::new(5, "en"), &AnalysisInsights::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StoryError::OutlineGenerationFailed { .. }));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let llm = StoryLlm::new(5);
        let calls = llm.calls.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline(llm)
            .generate(&GenerationRequest::new(5, "en"), &AnalysisInsights::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, StoryError::Cancelled);
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_fan_out_returns_partial_story() -> Result<()> {
        let mut llm = StoryLlm::new(5);
        llm.delays_ms = HashMap::from([(2, 10_000), (3, 10_000), (4, 10_000), (5, 10_000)]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let story = pipeline(llm)
            .generate(&GenerationRequest::new(5, "en"), &AnalysisInsights::default(), &cancel)
            .await?;

        assert!(story.aborted);
        assert_eq!(story.pages.len(), 1);
        assert_eq!(story.pages[0].page_number, 1);
        assert_eq!(story.outline.story_beats.len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_regenerate_page_keeps_seed() -> Result<()> {
        let mut llm = StoryLlm::new(5);
        llm.broken_pages.insert(4);
        let story = pipeline(llm)
            .generate(&GenerationRequest::new(5, "en"), &AnalysisInsights::default(), &CancellationToken::new())
            .await?;
        let original_seed = story.pages[3].seed;
        assert_eq!(story.warnings.len(), 1);

        let fixed = pipeline(StoryLlm::new(5)).regenerate_page(&story, 4).await?;
        assert_eq!(fixed.pages.len(), 5);
        assert_eq!(fixed.pages[3].seed, original_seed);
        assert!(fixed.pages[3].text.contains("on page 4"));
        assert!(fixed.warnings.is_empty());
        assert_eq!(fixed.pages[0], story.pages[0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_regenerate_page_out_of_range() -> Result<()> {
        let pipeline = pipeline(StoryLlm::new(5));
        let story = pipeline
            .generate(&GenerationRequest::new(5, "en"), &AnalysisInsights::default(), &CancellationToken::new())
            .await?;
        let err = pipeline.regenerate_page(&story, 6).await.unwrap_err();
        assert_eq!(err, StoryError::PageOutOfRange(6));
        Ok(())
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.pipeline.max_concurrency = 0;
        assert!(StoryPipeline::new(config, Arc::new(StoryLlm::new(5))).is_err());
    }

    #[test]
    fn test_extra_guide_file_is_loaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("guide.yml");
        std::fs::write(&path, "moving abroad:\n  principles: [\"Home travels with you\"]\n  arc_template: [\"news\", \"journey\", \"arrival\"]\n")?;
        let mut config = Config::default();
        config.sensitive_guide_path = Some(path.to_string_lossy().to_string());
        assert!(StoryPipeline::new(config.clone(), Arc::new(StoryLlm::new(5))).is_ok());

        config.sensitive_guide_path = Some(dir.path().join("missing.yml").to_string_lossy().to_string());
        assert!(StoryPipeline::new(config, Arc::new(StoryLlm::new(5))).is_err());
        Ok(())
    }
}
