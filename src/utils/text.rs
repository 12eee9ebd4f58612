use std::collections::HashSet;

/// Counts whitespace separated tokens that carry at least one alphanumeric char.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace()
        .filter(|w| w.chars().any(|c| c.is_alphanumeric()))
        .count()
}

/// Counts sentences terminated by `.`, `!` or `?` (runs like `?!` or `...` count once).
/// Trailing text without a terminator counts as one more sentence.
pub fn count_sentences(text: &str) -> usize {
    let mut count = 0;
    let mut has_content = false;
    for c in text.chars() {
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            if has_content {
                count += 1;
                has_content = false;
            }
        } else if c.is_alphanumeric() {
            has_content = true;
        }
    }
    if has_content {
        count += 1;
    }
    count
}

/// Counts quoted stretches of speech: pairs of straight double quotes plus
/// opening curly, corner or guillemet quotes.
pub fn count_quoted_spans(text: &str) -> usize {
    let straight = text.chars().filter(|c| *c == '"').count() / 2;
    let paired = text.chars().filter(|c| matches!(c, '“' | '「' | '«')).count();
    straight + paired
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Keeps the first occurrence of every entry (compared case-insensitively after trimming),
/// preserving order and dropping blanks.
pub fn dedup_ordered<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let trimmed = normalize_whitespace(item.as_ref());
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            out.push(trimmed);
        }
    }
    out
}

/// Result of measuring a scene text against its age bucket budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetCheck {
    pub words: usize,
    pub sentences: usize,
    pub min_words: usize,
    pub max_words: usize,
    pub target_sentences: usize,
}

impl BudgetCheck {
    pub fn measure(text: &str, target_words: usize, tolerance: usize, target_sentences: usize) -> Self {
        Self {
            words: count_words(text),
            sentences: count_sentences(text),
            min_words: target_words.saturating_sub(tolerance),
            max_words: target_words + tolerance,
            target_sentences,
        }
    }

    pub fn words_within(&self) -> bool {
        (self.min_words..=self.max_words).contains(&self.words)
    }

    /// Sentence count may drift by one either way.
    pub fn sentences_within(&self) -> bool {
        self.sentences + 1 >= self.target_sentences && self.sentences <= self.target_sentences + 1
    }

    pub fn is_within(&self) -> bool {
        self.words_within() && self.sentences_within()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_spans() {
        assert_eq!(count_quoted_spans("No speech here."), 0);
        assert_eq!(count_quoted_spans("\"Hi!\" said Bea. \"Bye!\""), 2);
        assert_eq!(count_quoted_spans("“Look,” he said. 「Wow」"), 2);
        assert_eq!(count_quoted_spans("An \"unclosed quote"), 0);
    }

    #[test]
    fn test_count_words_ignores_punctuation_tokens() {
        assert_eq!(count_words("Luna hops - over the log !"), 5);
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("   "), 0);
    }

    #[test]
    fn test_count_sentences() {
        assert_eq!(count_sentences("One. Two! Three?"), 3);
        assert_eq!(count_sentences("Wait... what?!"), 2);
        assert_eq!(count_sentences("No terminator here"), 1);
        assert_eq!(count_sentences("..."), 0);
    }

    #[test]
    fn test_dedup_ordered_is_case_insensitive() {
        let out = dedup_ordered(["Red Kite", "  red   kite ", "", "Oak tree", "oak TREE", "river"]);
        assert_eq!(out, vec!["Red Kite", "Oak tree", "river"]);
    }

    #[test]
    fn test_budget_check_bounds() {
        let text = vec!["word"; 25].join(" ") + ".";
        let check = BudgetCheck::measure(&text, 40, 15, 1);
        assert!(check.words_within());
        assert_eq!(check.min_words, 25);
        assert_eq!(check.max_words, 55);

        let short = vec!["word"; 24].join(" ");
        assert!(!BudgetCheck::measure(&short, 40, 15, 1).words_within());
    }

    #[test]
    fn test_contains_ignore_case() {
        assert!(contains_ignore_case("Luna found a SHELL", "shell"));
        assert!(!contains_ignore_case("Luna", "Milo"));
    }
}
