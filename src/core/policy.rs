//! Static age and mood policy tables.

use crate::core::story::{AnalysisInsights, Emotion, Mood, TraumaLevel};

pub const WORD_TOLERANCE: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgeBucket {
    /// 3 and under
    Toddler,
    /// 4 to 6
    Early,
    /// 7 to 9
    Middle,
    /// 10 and up
    Older,
}

impl AgeBucket {
    pub fn for_age(age: u8) -> Self {
        match age {
            0..=3 => AgeBucket::Toddler,
            4..=6 => AgeBucket::Early,
            7..=9 => AgeBucket::Middle,
            _ => AgeBucket::Older,
        }
    }
}

/// Everything that depends on the reader's age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeParameters {
    pub bucket: AgeBucket,
    pub page_count: usize,
    pub target_words: usize,
    pub word_tolerance: usize,
    pub target_sentences: usize,
    pub vocabulary_ceiling: &'static str,
    pub default_speech_style: &'static str,
    pub forbidden_terms: &'static [&'static str],
    pub art_style: &'static str,
    pub palette: &'static str,
}

impl AgeParameters {
    pub fn for_age(age: u8) -> Self {
        match AgeBucket::for_age(age) {
            AgeBucket::Toddler => Self {
                bucket: AgeBucket::Toddler,
                page_count: 4,
                target_words: 40,
                word_tolerance: WORD_TOLERANCE,
                target_sentences: 3,
                vocabulary_ceiling: "only very simple one and two syllable words a toddler hears every day",
                default_speech_style: "short happy exclamations and sound words",
                forbidden_terms: &["death", "dead", "blood", "kill", "weapon", "monster", "ghost", "scary", "hurt"],
                art_style: "soft rounded shapes, thick outlines, board book style",
                palette: "bright primary colors",
            },
            AgeBucket::Early => Self {
                bucket: AgeBucket::Early,
                page_count: 5,
                target_words: 60,
                word_tolerance: WORD_TOLERANCE,
                target_sentences: 4,
                vocabulary_ceiling: "simple everyday words with at most one new word per page",
                default_speech_style: "simple cheerful sentences with gentle questions",
                forbidden_terms: &["death", "blood", "kill", "weapon", "murder", "terrifying"],
                art_style: "warm watercolor picture book style",
                palette: "warm cheerful pastels",
            },
            AgeBucket::Middle => Self {
                bucket: AgeBucket::Middle,
                page_count: 6,
                target_words: 90,
                word_tolerance: WORD_TOLERANCE,
                target_sentences: 5,
                vocabulary_ceiling: "grade school vocabulary with a few descriptive words",
                default_speech_style: "lively curious talk with playful jokes",
                forbidden_terms: &["blood", "kill", "murder", "gore", "corpse"],
                art_style: "detailed storybook illustration with gouache texture",
                palette: "rich harmonious colors",
            },
            AgeBucket::Older => Self {
                bucket: AgeBucket::Older,
                page_count: 7,
                target_words: 120,
                word_tolerance: WORD_TOLERANCE,
                target_sentences: 6,
                vocabulary_ceiling: "rich middle grade vocabulary, no jargon",
                default_speech_style: "thoughtful expressive dialogue with wit",
                forbidden_terms: &["gore", "murder", "corpse", "torture"],
                art_style: "cinematic illustrated novel style with soft painterly lighting",
                palette: "nuanced natural colors with strong accents",
            },
        }
    }

    pub fn min_words(&self) -> usize {
        self.target_words.saturating_sub(self.word_tolerance)
    }

    pub fn max_words(&self) -> usize {
        self.target_words + self.word_tolerance
    }

    /// First forbidden term found in `text`, compared case-insensitively.
    pub fn find_forbidden_term(&self, text: &str) -> Option<&'static str> {
        let lowered = text.to_lowercase();
        self.forbidden_terms.iter().copied().find(|term| lowered.contains(term))
    }
}

/// Maps drawing analysis signals to a story mood.
pub fn mood_for(insights: &AnalysisInsights) -> Mood {
    if matches!(insights.trauma_level, Some(TraumaLevel::Moderate | TraumaLevel::High))
        || !insights.risk_flags.is_empty()
    {
        return Mood::Reassuring;
    }

    if mentions(insights, &["sad", "lonely", "anxious", "fear", "worried", "angry"]) {
        Mood::Hopeful
    } else if mentions(insights, &["joy", "happy", "energetic", "excited", "playful"]) {
        Mood::Playful
    } else if mentions(insights, &["curious", "wonder", "adventur", "imaginative"]) {
        Mood::Adventurous
    } else {
        Mood::Gentle
    }
}

fn mentions(insights: &AnalysisInsights, words: &[&str]) -> bool {
    insights
        .dominant_emotions
        .iter()
        .any(|e| words.iter().any(|w| e.to_lowercase().contains(w)))
}

/// Emotion transitions that read naturally from one page to the next.
/// Staying in the same emotion is always allowed.
pub fn allowed_transitions(from: Emotion) -> &'static [Emotion] {
    use Emotion::*;
    match from {
        Happy => &[Excited, Curious, Calm, Worried, Brave],
        Excited => &[Happy, Curious, Worried, Brave],
        Curious => &[Excited, Worried, Happy, Brave, Calm],
        Worried => &[Brave, Sad, Curious, Calm],
        Sad => &[Worried, Calm, Brave, Happy],
        Brave => &[Happy, Excited, Worried, Calm],
        Calm => &[Happy, Curious, Sad],
    }
}

pub fn is_transition_allowed(from: Emotion, to: Emotion) -> bool {
    from == to || allowed_transitions(from).contains(&to)
}

/// Planned emotion for every page of a story: an opening that fits the mood,
/// then discovery, a challenge, a brave turn and a mood-fitting ending.
/// Consecutive pages always follow [`allowed_transitions`].
pub fn emotion_arc(total_pages: usize, mood: Mood) -> Vec<Emotion> {
    let (opening, closing) = match mood {
        Mood::Playful => (Emotion::Happy, Emotion::Happy),
        Mood::Adventurous => (Emotion::Excited, Emotion::Happy),
        Mood::Gentle => (Emotion::Calm, Emotion::Calm),
        Mood::Hopeful => (Emotion::Sad, Emotion::Happy),
        Mood::Reassuring => (Emotion::Calm, Emotion::Calm),
    };
    let phases = [opening, Emotion::Curious, Emotion::Worried, Emotion::Brave, closing];
    let last_phase = phases.len() - 1;

    let mut arc: Vec<Emotion> = Vec::with_capacity(total_pages);
    for i in 0..total_pages {
        let target = if total_pages == 1 {
            opening
        } else {
            let span = total_pages - 1;
            phases[(i * last_phase + span / 2) / span]
        };
        let emotion = match arc.last() {
            Some(&previous) if !is_transition_allowed(previous, target) => allowed_transitions(previous)
                .iter()
                .copied()
                .find(|bridge| is_transition_allowed(*bridge, target))
                .unwrap_or(previous),
            _ => target,
        };
        arc.push(emotion);
    }
    arc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_ages_select_lower_bucket() {
        assert_eq!(AgeBucket::for_age(3), AgeBucket::Toddler);
        assert_eq!(AgeBucket::for_age(4), AgeBucket::Early);
        assert_eq!(AgeBucket::for_age(6), AgeBucket::Early);
        assert_eq!(AgeBucket::for_age(7), AgeBucket::Middle);
        assert_eq!(AgeBucket::for_age(9), AgeBucket::Middle);
        assert_eq!(AgeBucket::for_age(10), AgeBucket::Older);
    }

    #[test]
    fn test_word_budget_windows() {
        let toddler = AgeParameters::for_age(2);
        assert_eq!((toddler.min_words(), toddler.max_words()), (25, 55));
        let older = AgeParameters::for_age(11);
        assert_eq!((older.min_words(), older.max_words()), (105, 135));
        let five = AgeParameters::for_age(5);
        assert_eq!(five.page_count, 5);
        assert_eq!(five.target_words, 60);
        assert_eq!(five.target_sentences, 4);
    }

    #[test]
    fn test_forbidden_term_lookup_is_case_insensitive() {
        let params = AgeParameters::for_age(5);
        assert_eq!(params.find_forbidden_term("A WEAPON lay there"), Some("weapon"));
        assert_eq!(params.find_forbidden_term("A sunny picnic"), None);
    }

    #[test]
    fn test_mood_mapping() {
        let mut insights = AnalysisInsights::default();
        assert_eq!(mood_for(&insights), Mood::Gentle);

        insights.dominant_emotions = vec!["Joyful".into()];
        assert_eq!(mood_for(&insights), Mood::Playful);

        insights.dominant_emotions = vec!["lonely".into()];
        assert_eq!(mood_for(&insights), Mood::Hopeful);

        insights.trauma_level = Some(TraumaLevel::High);
        assert_eq!(mood_for(&insights), Mood::Reassuring);
    }

    #[test]
    fn test_emotion_arc_follows_transitions_for_every_mood() {
        let moods = [Mood::Playful, Mood::Adventurous, Mood::Gentle, Mood::Hopeful, Mood::Reassuring];
        for mood in moods {
            for pages in 0..=7 {
                let arc = emotion_arc(pages, mood);
                assert_eq!(arc.len(), pages);
                for pair in arc.windows(2) {
                    assert!(is_transition_allowed(pair[0], pair[1]), "{:?} {:?}", mood, pair);
                }
            }
        }
    }

    #[test]
    fn test_seven_page_arc_rises_and_resolves() {
        let arc = emotion_arc(7, Mood::Playful);
        assert_eq!(arc[0], Emotion::Happy);
        assert_eq!(arc[6], Emotion::Happy);
        assert!(arc.contains(&Emotion::Worried));
        assert!(arc.contains(&Emotion::Brave));
        let distinct: std::collections::HashSet<Emotion> = arc.iter().copied().collect();
        assert!(distinct.len() >= 4);

        let hopeful = emotion_arc(5, Mood::Hopeful);
        assert_eq!(hopeful[0], Emotion::Sad);
        assert_eq!(hopeful[4], Emotion::Happy);
    }

    #[test]
    fn test_transition_table() {
        assert!(is_transition_allowed(Emotion::Happy, Emotion::Happy));
        assert!(is_transition_allowed(Emotion::Happy, Emotion::Excited));
        assert!(is_transition_allowed(Emotion::Excited, Emotion::Curious));
        assert!(is_transition_allowed(Emotion::Curious, Emotion::Worried));
        assert!(!is_transition_allowed(Emotion::Happy, Emotion::Sad));
    }
}
