//! Deterministic character fingerprint ("DNA").
//!
//! The same profile content always produces the same hash, seed and anchor
//! tags. Anchor tags lead every image prompt, so their order and wording are
//! part of the contract.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::story::CharacterProfile;
use crate::utils::text::{dedup_ordered, normalize_whitespace};

pub const MAX_COLORS: usize = 4;
pub const MAX_FEATURES: usize = 3;
const MAX_APPEARANCE_TAGS: usize = 4;
const SEED_MASK: u32 = 0x7FFF_FFFF;
/// Odd, so stepping by it is a bijection modulo 2^31 and page seeds never collide.
const PAGE_SEED_STRIDE: u32 = 7919;

const COLOR_WORDS: &[&str] = &[
    "red", "orange", "yellow", "green", "blue", "purple", "violet", "pink", "brown", "black",
    "white", "gray", "grey", "golden", "gold", "silver", "teal", "turquoise", "beige", "cream",
    "lavender", "mint", "coral", "navy",
];

const FALLBACK_PALETTE: &[&str] = &[
    "sunny yellow", "sky blue", "leaf green", "coral pink", "warm orange", "soft lavender",
    "cocoa brown", "mint green",
];

const FEATURE_HINTS: &[&str] = &[
    "wearing", "with", "scarf", "hat", "glasses", "spots", "stripes", "wings", "tail", "ears",
    "bow", "boots", "cape", "patch", "freckles", "backpack", "horn", "crown", "necklace",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterIdentity {
    pub hash: String,
    pub consistency_seed: u32,
    pub anchor_tags: Vec<String>,
    pub color_signature: Vec<String>,
    pub unique_features: Vec<String>,
}

impl CharacterIdentity {
    /// The exact prefix every page prompt starts with.
    pub fn anchor_prefix(&self) -> String {
        self.anchor_tags.join(", ")
    }

    pub fn page_seed(&self, page_number: u32) -> u32 {
        page_seed(self.consistency_seed, page_number)
    }
}

/// Pure function of (seed, page): reproducible per pair, distinct across pages.
pub fn page_seed(consistency_seed: u32, page_number: u32) -> u32 {
    consistency_seed
        .wrapping_add(page_number.wrapping_mul(PAGE_SEED_STRIDE))
        & SEED_MASK
}

#[derive(Serialize)]
struct CanonicalProfile<'a> {
    name: &'a str,
    species: &'a str,
    gender: &'a str,
    age: u8,
    appearance: &'a str,
}

fn canonical(s: &str) -> String {
    normalize_whitespace(s).to_lowercase()
}

/// Every field that ends up in the anchor tags is hashed in exactly the form
/// the tags use, so equal hashes always mean equal prompts. The name keeps its
/// casing because it is rendered as written.
pub fn derive_identity(profile: &CharacterProfile) -> CharacterIdentity {
    let name = normalize_whitespace(&profile.name);
    let species = canonical(&profile.species);
    let gender = canonical(&profile.gender);
    let appearance = canonical(&profile.appearance);

    let canonical_json = serde_json::to_vec(&CanonicalProfile {
        name: &name,
        species: &species,
        gender: &gender,
        age: profile.age,
        appearance: &appearance,
    })
    .unwrap_or_default();

    let digest = Sha256::digest(&canonical_json);
    let consistency_seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & SEED_MASK;

    let phrases = appearance_phrases(&appearance);
    let color_signature = color_signature(&appearance, &digest);
    let unique_features = unique_features(&phrases);

    let mut anchor_tags = Vec::new();
    let subject = if species.is_empty() {
        name.clone()
    } else {
        format!("{} the {}", name, species)
    };
    anchor_tags.push(format!("({}:1.3)", subject));
    for phrase in phrases.iter().take(MAX_APPEARANCE_TAGS) {
        anchor_tags.push(format!("({}:1.2)", phrase));
    }
    if !color_signature.is_empty() {
        anchor_tags.push(format!("(color palette {}:1.1)", color_signature.join(" and ")));
    }
    anchor_tags.push("same character design on every page".to_string());

    CharacterIdentity {
        hash: hex::encode(digest),
        consistency_seed,
        anchor_tags,
        color_signature,
        unique_features,
    }
}

fn appearance_phrases(appearance: &str) -> Vec<String> {
    let pieces = appearance
        .split([',', ';', '.'])
        .flat_map(|p| p.split(" and "))
        .map(|p| p.trim().trim_start_matches("a ").trim_start_matches("an ").to_string());
    dedup_ordered(pieces)
}

fn color_signature(appearance: &str, digest: &[u8]) -> Vec<String> {
    let words = appearance
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| COLOR_WORDS.contains(w));
    let mut colors = dedup_ordered(words);
    colors.truncate(MAX_COLORS);

    if colors.is_empty() {
        let first = digest[4] as usize % FALLBACK_PALETTE.len();
        let mut second = digest[5] as usize % FALLBACK_PALETTE.len();
        if second == first {
            second = (second + 1) % FALLBACK_PALETTE.len();
        }
        colors = vec![FALLBACK_PALETTE[first].to_string(), FALLBACK_PALETTE[second].to_string()];
    }
    colors
}

fn unique_features(phrases: &[String]) -> Vec<String> {
    let mut features: Vec<String> = phrases
        .iter()
        .filter(|p| {
            p.split_whitespace()
                .any(|w| FEATURE_HINTS.iter().any(|hint| w.starts_with(hint)))
        })
        .take(MAX_FEATURES)
        .cloned()
        .collect();
    if features.is_empty() {
        features = phrases.iter().take(2).cloned().collect();
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::story::GrowthArc;
    use std::collections::HashSet;

    fn luna() -> CharacterProfile {
        CharacterProfile {
            name: "Luna".to_string(),
            species: "Rabbit".to_string(),
            gender: "female".to_string(),
            age: 5,
            appearance: "white fluffy fur, long floppy ears, wearing a red scarf and blue boots".to_string(),
            personality_traits: vec!["curious".into(), "kind".into()],
            speech_style: "cheerful questions".to_string(),
            growth_arc: GrowthArc::default(),
        }
    }

    #[test]
    fn test_identity_is_deterministic() {
        let a = derive_identity(&luna());
        let b = derive_identity(&luna());
        assert_eq!(a, b);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn test_whitespace_and_case_do_not_change_identity() {
        let mut noisy = luna();
        noisy.appearance = "  White fluffy   fur, long floppy ears, wearing a RED scarf and blue boots ".to_string();
        noisy.species = "rabbit".to_string();
        assert_eq!(derive_identity(&luna()).hash, derive_identity(&noisy).hash);
    }

    #[test]
    fn test_name_is_hashed_as_rendered() {
        let mut spaced = luna();
        spaced.name = "  Luna ".to_string();
        assert_eq!(derive_identity(&luna()), derive_identity(&spaced));

        let mut lower = luna();
        lower.name = "luna".to_string();
        let a = derive_identity(&luna());
        let b = derive_identity(&lower);
        assert_ne!(a.anchor_prefix(), b.anchor_prefix());
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.consistency_seed, b.consistency_seed);
    }

    #[test]
    fn test_different_appearance_changes_identity() {
        let mut other = luna();
        other.appearance = "brown fur, green hat".to_string();
        assert_ne!(derive_identity(&luna()).hash, derive_identity(&other).hash);
    }

    #[test]
    fn test_anchor_tags_lead_with_subject() {
        let id = derive_identity(&luna());
        assert_eq!(id.anchor_tags[0], "(Luna the rabbit:1.3)");
        assert_eq!(id.anchor_tags[1], "(white fluffy fur:1.2)");
        assert!(id.anchor_prefix().starts_with("(Luna the rabbit:1.3), (white fluffy fur:1.2)"));
        assert_eq!(id.color_signature, vec!["white", "red", "blue"]);
        assert!(id.unique_features.contains(&"long floppy ears".to_string()));
        assert!(id.unique_features.len() <= MAX_FEATURES);
    }

    #[test]
    fn test_fallback_palette_when_no_colors() {
        let mut plain = luna();
        plain.appearance = "fluffy fur, long ears".to_string();
        let id = derive_identity(&plain);
        assert_eq!(id.color_signature.len(), 2);
        assert_ne!(id.color_signature[0], id.color_signature[1]);
    }

    #[test]
    fn test_page_seeds_are_distinct_and_reproducible() {
        let id = derive_identity(&luna());
        let seeds: Vec<u32> = (1..=7).map(|p| id.page_seed(p)).collect();
        let unique: HashSet<_> = seeds.iter().collect();
        assert_eq!(unique.len(), seeds.len());
        assert_eq!(id.page_seed(3), page_seed(id.consistency_seed, 3));
        assert!(seeds.iter().all(|s| *s <= SEED_MASK));
    }

    #[test]
    fn test_page_seed_wraps_without_collision() {
        let seeds: HashSet<u32> = (1..=50).map(|p| page_seed(SEED_MASK, p)).collect();
        assert_eq!(seeds.len(), 50);
    }
}
