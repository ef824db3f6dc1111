//! Local word-list classifier.
//!
//! Deterministic and offline. Used when no remote classifier is configured,
//! and as the reference classifier in tests. Text is lowercased, common digit
//! substitutions are undone and punctuation is dropped before matching whole
//! words and phrases.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::moderation::{Classification, Classifier, ClassifierError};

const PROFANITY: &[&str] = &[
    "fuck", "fucking", "fucker", "motherfucker", "shit", "bullshit", "bitch", "bastard",
    "asshole", "dick", "cunt", "prick", "twat", "wanker",
];

const INSULTS: &[&str] = &[
    "idiot", "moron", "stupid", "loser", "pathetic", "worthless", "ugly", "retard", "freak",
];

const THREATS: &[&str] = &[
    "kill you",
    "hurt you",
    "find you",
    "beat you",
    "watch your back",
    "you will pay",
    "kill yourself",
    "go die",
];

/// Classifier backed by fixed word and phrase lists.
#[derive(Debug, Clone)]
pub struct BlocklistClassifier {
    words: HashSet<String>,
    threats: Vec<String>,
}

impl BlocklistClassifier {
    /// Classifier with the built-in lists.
    pub fn new() -> Self {
        Self {
            words: PROFANITY.iter().chain(INSULTS).map(|w| (*w).to_string()).collect(),
            threats: THREATS.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    /// Add extra blocked words.
    pub fn with_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.words.extend(words.into_iter().map(|w| normalize(w.as_ref())));
        self
    }

    /// Classify synchronously.
    pub fn check(&self, text: &str) -> Classification {
        let normalized = normalize(text);

        if let Some(word) = normalized.split(' ').find(|w| self.words.contains(*w)) {
            let reason = format!("contains blocked word {word:?}");
            return Classification::Inadmissible { reason };
        }

        let padded = format!(" {normalized} ");
        if let Some(phrase) = self.threats.iter().find(|p| padded.contains(&format!(" {p} "))) {
            let reason = format!("threatening phrase {phrase:?}");
            return Classification::Inadmissible { reason };
        }

        Classification::Admissible
    }
}

impl Default for BlocklistClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Classifier for BlocklistClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        Ok(self.check(text))
    }
}

/// Lowercase, undo digit substitutions, collapse non-letters into single
/// spaces.
fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            '0' => 'o',
            '1' => 'i',
            '3' => 'e',
            '4' | '@' => 'a',
            '5' | '$' => 's',
            '7' => 't',
            c if c.is_alphabetic() => c,
            _ => ' ',
        })
        .collect();

    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(text: &str) -> bool {
        matches!(BlocklistClassifier::new().check(text), Classification::Inadmissible { .. })
    }

    #[test]
    fn profanity_is_rejected() {
        assert!(rejected("fuck you"));
        assert!(rejected("You are a B1TCH!!"));
        assert!(rejected("what an idiot."));
    }

    #[test]
    fn threats_are_rejected() {
        assert!(rejected("I will find you"));
        assert!(rejected("watch your back, pal"));
    }

    #[test]
    fn polite_text_is_admitted() {
        assert!(!rejected("Thank you for your help"));
        assert!(!rejected("Your talk was great, 10/10"));
        assert!(!rejected("I killed it at the exam, you should try the class"));
    }

    #[test]
    fn words_match_whole_tokens_only() {
        // "scunthorpe" and "dickens" contain blocked substrings
        assert!(!rejected("Reading Dickens in Scunthorpe"));
    }

    #[test]
    fn extra_words_are_normalized() {
        let classifier = BlocklistClassifier::new().with_words(["Spoiler"]);
        let verdict = classifier.check("no SPOILER please");
        assert!(matches!(verdict, Classification::Inadmissible { .. }));
    }
}
