//! Story ↔ issue pairing.
//!
//! 1. Exact key: a story carrying `external_key` claims that issue outright.
//! 2. Fuzzy title: every remaining story is scored against every unclaimed
//!    issue; pairs are assigned greedily, highest score first, ties going to
//!    the earlier story and then the earlier issue.
//! 3. Pairs under the threshold are rejected and the story is `unmatched`.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use similar::TextDiff;

use epicsync_core::config::SimilarityKind;
use epicsync_core::issue::TrackerIssue;
use epicsync_core::types::{IssueKey, Story, StoryId, Subtask};

/// How a pairing was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMethod {
    ExactKey,
    FuzzyTitle,
    Unmatched,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMethod::ExactKey => write!(f, "exact-key"),
            MatchMethod::FuzzyTitle => write!(f, "fuzzy-title"),
            MatchMethod::Unmatched => write!(f, "unmatched"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Story (or subtask) local id.
    pub story: StoryId,
    pub issue: Option<IssueKey>,
    /// In `[0, 1]`; 1.0 for exact-key, 0.0 for unmatched.
    pub confidence: f64,
    pub method: MatchMethod,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        self.issue.is_some()
    }
}

/// Title similarity policy. Scores must be in `[0, 1]` and symmetric
/// enough that repeated calls give identical results.
pub trait Similarity: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Jaro-Winkler over normalised titles. Rewards shared prefixes, so
/// `Login` vs `Login Page` scores about 0.9.
#[derive(Debug, Default, Clone, Copy)]
pub struct JaroWinkler;

impl Similarity for JaroWinkler {
    fn score(&self, a: &str, b: &str) -> f64 {
        strsim::jaro_winkler(&normalize_title(a), &normalize_title(b))
    }
}

/// Character-level ratio `2·M / T` over normalised titles. Stricter than
/// [`JaroWinkler`] for titles that only share a prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharRatio;

impl Similarity for CharRatio {
    fn score(&self, a: &str, b: &str) -> f64 {
        let a = normalize_title(a);
        let b = normalize_title(b);
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        f64::from(TextDiff::from_chars(a.as_str(), b.as_str()).ratio())
    }
}

/// Lowercase and collapse whitespace runs to a single space.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

struct Candidate<'a> {
    id: &'a StoryId,
    key: Option<&'a IssueKey>,
    title: &'a str,
}

pub struct Matcher {
    threshold: f64,
    similarity: Box<dyn Similarity>,
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(0.75)
    }
}

impl Matcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            similarity: Box::new(JaroWinkler),
        }
    }

    pub fn with_similarity(mut self, similarity: impl Similarity + 'static) -> Self {
        self.similarity = Box::new(similarity);
        self
    }

    /// Select one of the built-in similarity functions by name.
    pub fn with_kind(self, kind: SimilarityKind) -> Self {
        match kind {
            SimilarityKind::JaroWinkler => self.with_similarity(JaroWinkler),
            SimilarityKind::CharRatio => self.with_similarity(CharRatio),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// One result per story, in document order.
    pub fn match_stories(&self, stories: &[Story], issues: &[TrackerIssue]) -> Vec<MatchResult> {
        let candidates: Vec<Candidate<'_>> = stories
            .iter()
            .map(|s| Candidate {
                id: &s.id,
                key: s.external_key.as_ref(),
                title: &s.title,
            })
            .collect();
        self.assign(&candidates, issues)
    }

    /// Same algorithm, scoped to one parent's subtasks.
    pub fn match_subtasks(&self, subtasks: &[Subtask], issues: &[TrackerIssue]) -> Vec<MatchResult> {
        let candidates: Vec<Candidate<'_>> = subtasks
            .iter()
            .map(|s| Candidate {
                id: &s.id,
                key: s.external_key.as_ref(),
                title: &s.title,
            })
            .collect();
        self.assign(&candidates, issues)
    }

    fn assign(&self, candidates: &[Candidate<'_>], issues: &[TrackerIssue]) -> Vec<MatchResult> {
        let mut results: Vec<Option<MatchResult>> = vec![None; candidates.len()];
        let mut claimed: HashSet<&IssueKey> = HashSet::new();

        for (i, cand) in candidates.iter().enumerate() {
            let Some(key) = cand.key else { continue };
            if claimed.contains(key) {
                continue;
            }
            if let Some(issue) = issues.iter().find(|issue| &issue.key == key) {
                claimed.insert(&issue.key);
                results[i] = Some(MatchResult {
                    story: cand.id.clone(),
                    issue: Some(issue.key.clone()),
                    confidence: 1.0,
                    method: MatchMethod::ExactKey,
                });
            }
        }

        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (i, cand) in candidates.iter().enumerate() {
            if results[i].is_some() {
                continue;
            }
            for (j, issue) in issues.iter().enumerate() {
                if claimed.contains(&issue.key) {
                    continue;
                }
                let score = self.similarity.score(cand.title, &issue.summary);
                if score >= self.threshold {
                    pairs.push((score, i, j));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for (score, i, j) in pairs {
            let issue = &issues[j];
            if results[i].is_some() || claimed.contains(&issue.key) {
                continue;
            }
            claimed.insert(&issue.key);
            results[i] = Some(MatchResult {
                story: candidates[i].id.clone(),
                issue: Some(issue.key.clone()),
                confidence: score,
                method: MatchMethod::FuzzyTitle,
            });
        }

        results
            .into_iter()
            .zip(candidates)
            .map(|(result, cand)| {
                result.unwrap_or_else(|| MatchResult {
                    story: cand.id.clone(),
                    issue: None,
                    confidence: 0.0,
                    method: MatchMethod::Unmatched,
                })
            })
            .collect()
    }
}
