//! Narrative guidance for sensitive topics a drawing may surface.
//!
//! This is policy data, not logic: the built-in table can be replaced,
//! extended or localized from YAML without touching pipeline code.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryGuidance {
    pub principles: Vec<String>,
    /// Ordered stages of the story arc.
    pub arc_template: Vec<String>,
    #[serde(default)]
    pub avoid: Vec<String>,
}

impl CategoryGuidance {
    /// Renders the guidance as an instruction block for the outline prompt.
    pub fn to_prompt_block(&self, category: &str) -> String {
        let mut block = format!("SENSITIVE TOPIC: {}\nNarrative principles:\n", category);
        for p in &self.principles {
            block.push_str(&format!("- {}\n", p));
        }
        block.push_str(&format!("Story arc: {}\n", self.arc_template.join(" -> ")));
        if !self.avoid.is_empty() {
            block.push_str(&format!("Never include: {}\n", self.avoid.join(", ")));
        }
        block
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensitiveContentGuide {
    categories: BTreeMap<String, CategoryGuidance>,
}

impl SensitiveContentGuide {
    pub fn empty() -> Self {
        Self { categories: BTreeMap::new() }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let parsed: SensitiveContentGuide =
            serde_yaml_ng::from_str(content).context("Failed to parse sensitive content guide")?;
        let mut guide = Self::empty();
        guide.extend(parsed);
        Ok(guide)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read guide file {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// Adds or replaces a category.
    pub fn insert(&mut self, category: &str, guidance: CategoryGuidance) {
        self.categories.insert(normalize_key(category), guidance);
    }

    /// Merges `other` on top of this guide.
    pub fn extend(&mut self, other: SensitiveContentGuide) {
        for (k, v) in other.categories {
            self.categories.insert(normalize_key(&k), v);
        }
    }

    pub fn get(&self, category: &str) -> Option<&CategoryGuidance> {
        self.categories.get(&normalize_key(category))
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

fn normalize_key(category: &str) -> String {
    category.trim().to_lowercase().replace([' ', '-'], "_")
}

fn entry(principles: &[&str], arc: &[&str], avoid: &[&str]) -> CategoryGuidance {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    CategoryGuidance {
        principles: owned(principles),
        arc_template: owned(arc),
        avoid: owned(avoid),
    }
}

impl Default for SensitiveContentGuide {
    fn default() -> Self {
        let mut guide = Self::empty();
        guide.insert("divorce", entry(
            &["Both parents still love the child", "The separation is never the child's fault", "Show two homes as two safe places"],
            &["life changes", "confusing feelings", "talking with a trusted adult", "new routines feel safe"],
            &["blaming a parent", "fighting scenes", "choosing sides"],
        ));
        guide.insert("grief", entry(
            &["Sadness is a normal way of loving someone", "Memories keep loved ones close", "Use gentle, concrete language"],
            &["missing someone", "remembering together", "sharing feelings", "carrying love forward"],
            &["graphic illness", "euphemisms like sleeping forever", "sudden scary events"],
        ));
        guide.insert("pet_loss", entry(
            &["Honour the bond with the pet", "It is okay to cry and to smile again"],
            &["a special friend", "saying goodbye", "a memory box", "warm remembering"],
            &["describing injury", "replacing the pet immediately"],
        ));
        guide.insert("new_sibling", entry(
            &["Love grows, it does not divide", "Big feelings about change are okay"],
            &["waiting for the baby", "feeling left out", "finding a helper role", "being a proud sibling"],
            &["jealousy punished", "parents ignoring the child"],
        ));
        guide.insert("moving_house", entry(
            &["Familiar things come along", "New places hold new friends"],
            &["packing up", "saying goodbye", "exploring the new place", "feeling at home"],
            &["getting lost", "losing belongings forever"],
        ));
        guide.insert("starting_school", entry(
            &["Nervousness is normal", "Grown-ups come back at the end of the day"],
            &["worried morning", "first brave step", "making a friend", "excited to return"],
            &["strict punishment", "being laughed at without repair"],
        ));
        guide.insert("bullying", entry(
            &["The child deserves kindness", "Telling a trusted adult is brave, not tattling", "Focus on support, not revenge"],
            &["an unkind moment", "feeling small", "asking for help", "friends stand together"],
            &["physical violence", "revenge", "humiliation in detail"],
        ));
        guide.insert("fear_of_dark", entry(
            &["The dark is the same room with the lights off", "Comfort objects help"],
            &["shadows at bedtime", "investigating with a light", "discovering harmless things", "sleeping peacefully"],
            &["monsters that turn out real", "being left alone while scared"],
        ));
        guide.insert("nightmares", entry(
            &["Dreams are not real and cannot hurt", "Comfort is always nearby"],
            &["a bad dream", "waking up safe", "being comforted", "dreaming a happy ending"],
            &["graphic dream content", "dismissing the fear"],
        ));
        guide.insert("anxiety", entry(
            &["Worries can be named and made smaller", "Breathing and helpers calm the body"],
            &["a big worry", "noticing the feeling", "a calming tool", "feeling steady"],
            &["catastrophic outcomes", "shaming worry"],
        ));
        guide.insert("anger", entry(
            &["Anger is a feeling, not a bad child", "Show safe ways to let anger out"],
            &["something unfair", "hot angry feelings", "a cool-down strategy", "making things right"],
            &["hurting others", "destroying things without consequence"],
        ));
        guide.insert("loneliness", entry(
            &["Everyone feels lonely sometimes", "Small brave steps lead to connection"],
            &["feeling alone", "noticing someone else", "reaching out", "a new friendship"],
            &["permanent isolation", "rejection without hope"],
        ));
        guide.insert("hospital_stay", entry(
            &["Doctors and nurses are helpers", "Explain what happens in simple steps"],
            &["a visit to the hospital", "meeting the helpers", "being brave", "going home stronger"],
            &["needles in detail", "pain descriptions", "death"],
        ));
        guide.insert("family_illness", entry(
            &["The child did not cause the illness", "Love continues during hard times"],
            &["someone feels unwell", "helping in small ways", "spending time together", "hopeful days"],
            &["graphic symptoms", "promises of certain recovery"],
        ));
        guide.insert("parent_deployment", entry(
            &["Distance does not stop love", "Rituals keep families connected"],
            &["saying goodbye", "counting the days", "sending messages", "joyful reunion"],
            &["combat", "danger to the parent"],
        ));
        guide.insert("adoption", entry(
            &["Families are made in many ways", "The child's story is worth celebrating"],
            &["where I come from", "questions and feelings", "belonging", "celebrating family"],
            &["being unwanted", "secrecy as shame"],
        ));
        guide.insert("disability", entry(
            &["Show strengths and abilities", "Differences are part of who we are", "Avoid pity framing"],
            &["an everyday challenge", "a creative solution", "friends adapt together", "shared success"],
            &["being fixed or cured", "pity", "mockery"],
        ));
        guide.insert("friendship_conflict", entry(
            &["Friends can disagree and make up", "Both sides have feelings"],
            &["a disagreement", "hurt feelings", "listening", "playing together again"],
            &["permanent exclusion", "name calling in detail"],
        ));
        guide.insert("natural_disaster", entry(
            &["Helpers keep people safe", "Rebuilding brings people together"],
            &["a big storm", "staying with grown-ups", "community helpers", "rebuilding together"],
            &["injury or loss of life", "destruction in detail"],
        ));
        guide.insert("body_image", entry(
            &["Bodies are for doing, not for judging", "Every body is a good body"],
            &["an unkind comment", "noticing what the body can do", "celebrating differences", "feeling proud"],
            &["dieting", "weight talk", "appearance ranking"],
        ));
        guide
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_table_has_twenty_categories() {
        let guide = SensitiveContentGuide::default();
        assert_eq!(guide.len(), 20);
        for key in guide.categories() {
            let g = guide.get(key).unwrap();
            assert!(!g.principles.is_empty(), "{} has no principles", key);
            assert!(g.arc_template.len() >= 3, "{} arc too short", key);
        }
    }

    #[test]
    fn test_lookup_normalizes_keys() {
        let guide = SensitiveContentGuide::default();
        assert!(guide.get("Fear of Dark").is_some());
        assert!(guide.get("pet-loss").is_some());
        assert!(guide.get("time_travel").is_none());
    }

    #[test]
    fn test_prompt_block_lists_avoidances() {
        let guide = SensitiveContentGuide::default();
        let block = guide.get("divorce").unwrap().to_prompt_block("divorce");
        assert!(block.contains("SENSITIVE TOPIC: divorce"));
        assert!(block.contains("life changes -> confusing feelings"));
        assert!(block.contains("Never include: blaming a parent"));
    }

    #[test]
    fn test_load_and_extend_from_yaml() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "grief:\n  principles: [\"Le chagrin est normal\"]\n  arc_template: [\"manque\", \"souvenir\", \"amour\"]\nmoving abroad:\n  principles: [\"Home travels with you\"]\n  arc_template: [\"news\", \"journey\", \"arrival\"]\n"
        )?;

        let overrides = SensitiveContentGuide::load(file.path())?;
        assert_eq!(overrides.len(), 2);

        let mut guide = SensitiveContentGuide::default();
        guide.extend(overrides);
        assert_eq!(guide.len(), 21);
        assert_eq!(guide.get("grief").unwrap().principles, vec!["Le chagrin est normal"]);
        assert!(guide.get("grief").unwrap().avoid.is_empty());
        assert!(guide.get("moving_abroad").is_some());
        Ok(())
    }
}
