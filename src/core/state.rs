use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::core::story::Emotion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeElementKind {
    Character,
    Location,
    Object,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeElements {
    pub introduced_characters: BTreeSet<String>,
    pub visited_locations: BTreeSet<String>,
    pub mentioned_objects: BTreeSet<String>,
}

impl NarrativeElements {
    pub fn insert(&mut self, kind: NarrativeElementKind, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        let set = match kind {
            NarrativeElementKind::Character => &mut self.introduced_characters,
            NarrativeElementKind::Location => &mut self.visited_locations,
            NarrativeElementKind::Object => &mut self.mentioned_objects,
        };
        set.insert(value.to_string())
    }
}

/// Per-session consistency bookkeeping. Owned by exactly one request.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyState {
    current_emotion: Emotion,
    emotion_history: BTreeMap<u32, Emotion>,
    used_phrases: Vec<String>,
    used_phrase_keys: HashSet<String>,
    narrative: NarrativeElements,
}

impl ConsistencyState {
    pub fn new(starting_emotion: Emotion) -> Self {
        Self {
            current_emotion: starting_emotion,
            ..Self::default()
        }
    }

    pub fn current_emotion(&self) -> Emotion {
        self.current_emotion
    }

    pub fn emotion_history(&self) -> &BTreeMap<u32, Emotion> {
        &self.emotion_history
    }

    /// The emotion of the closest earlier page, if any.
    pub fn previous_emotion(&self, page: u32) -> Option<Emotion> {
        self.emotion_history.range(..page).next_back().map(|(_, e)| *e)
    }

    /// Appends `page -> emotion` and advances the current emotion.
    /// History is append-only: an already recorded page keeps its first entry.
    pub fn record_emotion(&mut self, page: u32, emotion: Emotion) -> bool {
        self.current_emotion = emotion;
        if self.emotion_history.contains_key(&page) {
            return false;
        }
        self.emotion_history.insert(page, emotion);
        true
    }

    /// Insertion-ordered, case-insensitive set insert.
    pub fn record_used_phrase(&mut self, phrase: &str) -> bool {
        let phrase = phrase.trim();
        if phrase.is_empty() || !self.used_phrase_keys.insert(phrase.to_lowercase()) {
            return false;
        }
        self.used_phrases.push(phrase.to_string());
        true
    }

    pub fn is_phrase_used(&self, phrase: &str) -> bool {
        self.used_phrase_keys.contains(&phrase.trim().to_lowercase())
    }

    pub fn used_phrases(&self) -> &[String] {
        &self.used_phrases
    }

    pub fn record_narrative_element(&mut self, kind: NarrativeElementKind, value: &str) -> bool {
        self.narrative.insert(kind, value)
    }

    pub fn narrative_elements(&self) -> &NarrativeElements {
        &self.narrative
    }
}
