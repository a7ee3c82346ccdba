// ABOUTME: Keyword policy — resolves "<phrase> code <n>" utterances into grant requests.
// ABOUTME: Exact-phrase matching, duration-code rules, and the persisted per-mode phrase file.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::GrantMode;
use crate::config::GrantsConfig;

/// The word separating a phrase from its duration code.
pub const CODE_WORD: &str = "code";

/// Phrases shorter than this are too easy to trigger by accident.
pub const MIN_PHRASE_LEN: usize = 3;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeywordError {
    #[error("invalid duration code '{0}'")]
    InvalidDurationCode(String),
    #[error("invalid phrase: {0}")]
    InvalidPhrase(String),
    #[error("phrase '{phrase}' conflicts with the {other} phrase")]
    AmbiguousPhrase { phrase: String, other: GrantMode },
    #[error("more than one phrase configured for {0}")]
    DuplicateMode(GrantMode),
}

/// A request for a grant derived from a matched utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantRequest {
    pub mode: GrantMode,
    /// The code spoken after the phrase.
    pub code: u64,
    /// The resolved grant duration in seconds.
    pub duration_seconds: u64,
}

/// Outcome of resolving an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Grant(GrantRequest),
    NoMatch,
}

/// The spoken phrase configured for one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordConfig {
    pub mode: GrantMode,
    pub phrase: String,
}

/// Persisted keyword configuration, one entry per mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordsFile {
    pub version: u32,
    pub keywords: Vec<KeywordConfig>,
}

impl Default for KeywordsFile {
    fn default() -> Self {
        Self {
            version: 1,
            keywords: vec![
                KeywordConfig {
                    mode: GrantMode::Sudo,
                    phrase: "sudo".to_string(),
                },
                KeywordConfig {
                    mode: GrantMode::Debug,
                    phrase: "debugmode".to_string(),
                },
            ],
        }
    }
}

impl KeywordsFile {
    /// Load the keyword file from disk. Returns defaults if the file doesn't exist.
    ///
    /// Entries are held to the same rules as `KeywordPolicy::set_phrase`; a file that
    /// breaks them is an error rather than something to resolve first-match.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let mut file: Self = serde_json::from_str(&content)?;
        // Normalize on load so a hand-edited file can't smuggle in odd spacing.
        for kw in &mut file.keywords {
            kw.phrase = normalize(&kw.phrase);
        }
        file.validate()
            .with_context(|| format!("invalid keyword file {}", path.display()))?;
        Ok(file)
    }

    /// At most one entry per mode, and every phrase valid and unambiguous.
    pub fn validate(&self) -> Result<(), KeywordError> {
        for (i, kw) in self.keywords.iter().enumerate() {
            if self.keywords[..i].iter().any(|k| k.mode == kw.mode) {
                return Err(KeywordError::DuplicateMode(kw.mode));
            }
            check_phrase(&kw.phrase, kw.mode, &self.keywords)?;
        }
        Ok(())
    }

    /// Save atomically (tmp + rename), creating parent directories as needed.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        crate::config::write_atomic(path, &serde_json::to_string_pretty(self)?)
    }

    pub fn phrase(&self, mode: GrantMode) -> Option<&str> {
        self.keywords
            .iter()
            .find(|k| k.mode == mode)
            .map(|k| k.phrase.as_str())
    }
}

/// Lowercase and collapse whitespace runs to single spaces.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map a spoken duration code to seconds.
///
/// Code 0 selects the default; anything else is clamped into `[min, max]`.
pub fn duration_for_code(code: u64, grants: &GrantsConfig) -> u64 {
    if code == 0 {
        grants.default_seconds
    } else {
        code.clamp(grants.min_seconds, grants.max_seconds)
    }
}

/// Resolves utterances against the configured per-mode phrases.
#[derive(Debug, Clone)]
pub struct KeywordPolicy {
    keywords: KeywordsFile,
    grants: GrantsConfig,
}

impl KeywordPolicy {
    pub fn new(keywords: KeywordsFile, grants: GrantsConfig) -> Self {
        Self { keywords, grants }
    }

    pub fn keywords(&self) -> &KeywordsFile {
        &self.keywords
    }

    /// Resolve an utterance of the form `<phrase> code <n>`.
    ///
    /// Matching is exact on the normalized phrase. An utterance that names a
    /// phrase and the code word but carries a non-numeric, negative, overflowing,
    /// missing, or trailing-garbage code fails instead of falling back to a bound.
    pub fn resolve(&self, utterance: &str) -> Result<Resolution, KeywordError> {
        let normalized = normalize(utterance);
        let words: Vec<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();

        for kw in &self.keywords.keywords {
            let phrase_words: Vec<&str> = kw.phrase.split(' ').collect();
            if kw.phrase.is_empty() || !words.starts_with(&phrase_words) {
                continue;
            }
            let rest = &words[phrase_words.len()..];
            if rest.first() != Some(&CODE_WORD) {
                continue;
            }
            let code_tokens = &rest[1..];
            let token = code_tokens.join(" ");
            if code_tokens.len() != 1 {
                return Err(KeywordError::InvalidDurationCode(token));
            }
            let code: u64 = token
                .parse()
                .map_err(|_| KeywordError::InvalidDurationCode(token.clone()))?;
            return Ok(Resolution::Grant(GrantRequest {
                mode: kw.mode,
                code,
                duration_seconds: duration_for_code(code, &self.grants),
            }));
        }
        Ok(Resolution::NoMatch)
    }

    /// Check that `phrase` could be used for `mode` without creating ambiguity.
    ///
    /// Returns the normalized phrase.
    pub fn validate_phrase(&self, mode: GrantMode, phrase: &str) -> Result<String, KeywordError> {
        let phrase = normalize(phrase);
        check_phrase(&phrase, mode, &self.keywords.keywords)?;
        Ok(phrase)
    }

    /// Replace the phrase for `mode` after validation. Returns the previous phrase.
    pub fn set_phrase(&mut self, mode: GrantMode, phrase: &str) -> Result<Option<String>, KeywordError> {
        let phrase = self.validate_phrase(mode, phrase)?;
        let previous = match self.keywords.keywords.iter_mut().find(|k| k.mode == mode) {
            Some(existing) => Some(std::mem::replace(&mut existing.phrase, phrase)),
            None => {
                self.keywords.keywords.push(KeywordConfig { mode, phrase });
                None
            }
        };
        Ok(previous)
    }
}

/// Rules for a normalized phrase intended for `mode`, checked against the other modes' entries.
fn check_phrase(phrase: &str, mode: GrantMode, entries: &[KeywordConfig]) -> Result<(), KeywordError> {
    if phrase.chars().count() < MIN_PHRASE_LEN {
        return Err(KeywordError::InvalidPhrase(format!(
            "must be at least {MIN_PHRASE_LEN} characters"
        )));
    }
    if phrase.split(' ').any(|w| w == CODE_WORD) {
        return Err(KeywordError::InvalidPhrase(format!(
            "must not contain the word '{CODE_WORD}'"
        )));
    }
    for other in entries.iter().filter(|k| k.mode != mode) {
        if is_word_prefix(phrase, &other.phrase) || is_word_prefix(&other.phrase, phrase) {
            return Err(KeywordError::AmbiguousPhrase {
                phrase: phrase.to_string(),
                other: other.mode,
            });
        }
    }
    Ok(())
}

/// Whether `prefix`'s words are a leading run of `phrase`'s words (equality included).
fn is_word_prefix(prefix: &str, phrase: &str) -> bool {
    let p: Vec<&str> = prefix.split(' ').collect();
    let w: Vec<&str> = phrase.split(' ').collect();
    w.starts_with(&p)
}
