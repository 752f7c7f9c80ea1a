//! Fuzzy matching of a requested document name against noisy search hits.
//!
//! Normalizes titles, scores candidates, and applies a validity-first
//! selection policy so a superseded document never beats an in-force one.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

/// Validity status a source reported for a candidate document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    InForce,
    Superseded,
    Repealed,
}

/// One unverified search hit produced by a strategy's search step.
///
/// Ephemeral: produced and consumed within a single resolution call.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    /// Title as reported by the source.
    pub title: String,
    /// Opaque reference the owning strategy can turn into a detail fetch
    /// (an API id, a URL, ...).
    pub source_ref: String,
    /// Landing URL, when the source exposes one.
    pub url: Option<String>,
    /// Validity status, when the source reports one. `None` means the
    /// candidate is not confirmed valid.
    pub validity: Option<Validity>,
    /// Publication date used as a late tie-breaker.
    pub published: Option<chrono::NaiveDate>,
    /// Strategy-owned payload carried through to the detail fetch.
    pub extra: Value,
}

impl MatchCandidate {
    pub fn new(title: impl Into<String>, source_ref: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source_ref: source_ref.into(),
            url: None,
            validity: None,
            published: None,
            extra: Value::Null,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = Some(validity);
        self
    }
}

/// Winning candidate plus the score that selected it.
#[derive(Debug, Clone)]
pub struct ResolvedMatch<'a> {
    pub candidate: &'a MatchCandidate,
    pub score: f64,
    pub confirmed_valid: bool,
}

/// Scoring knobs. The defaults mirror the thresholds the acquisition
/// sources were tuned against.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Scores below this are rejected even when they are the best on offer.
    pub accept_threshold: f64,
    /// Bonus per shared meaningful keyword.
    pub keyword_bonus: f64,
    /// Cap on the total keyword bonus.
    pub keyword_bonus_cap: f64,
    /// Multiplier applied when the candidate's document class differs from
    /// the one the target implies.
    pub class_mismatch_penalty: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.6,
            keyword_bonus: 0.03,
            keyword_bonus_cap: 0.12,
            class_mismatch_penalty: 0.3,
        }
    }
}

/// Document classes that disqualify superficially similar titles: a notice
/// *about* a statute is not the statute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentClass {
    Interpretation,
    Notice,
    Opinion,
    Reply,
}

static CLASS_MARKERS: &[(DocumentClass, &[&str])] = &[
    (DocumentClass::Interpretation, &["解释", "interpretation"]),
    (DocumentClass::Notice, &["通知", "公告", "notice", "announcement"]),
    (DocumentClass::Opinion, &["意见", "opinion"]),
    (DocumentClass::Reply, &["批复", "答复", "reply"]),
];

/// Country-name boilerplate prefixes stripped during normalization.
static BOILERPLATE_PREFIXES: &[&str] = &["中华人民共和国", "people's republic of china"];

static AMENDMENT_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"\s*\((\d{4}\s*年?)?\s*(修订|修正|amendment|revision|revised|amended)[^)]*\)\s*$",
    )
    .case_insensitive(true)
    .build()
    .expect("amendment suffix regex")
});

static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w一-鿿]+").expect("token regex"));

/// Stopwords excluded from the meaningful-keyword overlap count.
static STOPWORDS: &[&str] = &[
    "the", "of", "on", "for", "and", "to", "law", "act", "regulation", "regulations",
    "measures", "provisions", "法", "条例", "办法", "规定", "细则", "的", "和", "与", "及",
    "关于", "实施", "管理", "有关",
];

/// Normalize a document title for comparison.
///
/// Collapses whitespace, unifies fullwidth brackets, strips administrative
/// boilerplate prefixes, and removes trailing revision annotations.
/// Idempotent: normalizing an already-normalized title is a no-op.
pub fn normalize_title(raw: &str) -> String {
    let mut name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    name = name
        .replace('（', "(")
        .replace('）', ")")
        .replace('【', "[")
        .replace('】', "]");

    let lowered = name.to_lowercase();
    for prefix in BOILERPLATE_PREFIXES {
        if lowered.starts_with(prefix) {
            name = name[prefix.len()..].trim_start().to_string();
            break;
        }
    }

    loop {
        let stripped = AMENDMENT_SUFFIX_RE.replace(&name, "").trim_end().to_string();
        if stripped == name {
            break;
        }
        name = stripped;
    }

    name.trim().to_string()
}

/// Extract meaningful keywords from a normalized title.
///
/// ASCII text tokenizes on word boundaries; CJK runs contribute character
/// bigrams since there is no whitespace to split on.
pub fn keywords(normalized: &str) -> Vec<String> {
    let mut out = Vec::new();
    for token in NON_WORD_RE.split(&normalized.to_lowercase()) {
        if token.is_empty() {
            continue;
        }
        if token.chars().any(is_cjk) {
            let chars: Vec<char> = token.chars().collect();
            for pair in chars.windows(2) {
                let bigram: String = pair.iter().collect();
                if !STOPWORDS.contains(&bigram.as_str()) {
                    out.push(bigram);
                }
            }
        } else if token.chars().count() >= 2 && !STOPWORDS.contains(&token) {
            out.push(token.to_string());
        }
    }
    out.sort();
    out.dedup();
    out
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn document_class(normalized: &str) -> Option<DocumentClass> {
    let lowered = normalized.to_lowercase();
    for (class, markers) in CLASS_MARKERS {
        if markers.iter().any(|m| lowered.contains(m)) {
            return Some(*class);
        }
    }
    None
}

/// Character-level Levenshtein distance, two-row variant.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

fn edit_similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

/// Resolves the best candidate record from noisy search results.
#[derive(Debug, Clone, Default)]
pub struct MatchResolver {
    config: ResolverConfig,
}

impl MatchResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Score one candidate title against the target name. Both inputs are
    /// raw; normalization happens here.
    pub fn score(&self, target: &str, candidate_title: &str) -> f64 {
        let target_norm = normalize_title(target);
        let candidate_norm = normalize_title(candidate_title);
        if target_norm.is_empty() || candidate_norm.is_empty() {
            return 0.0;
        }

        let target_cmp = target_norm.to_lowercase();
        let candidate_cmp = candidate_norm.to_lowercase();

        let mut score = if target_cmp == candidate_cmp {
            1.0
        } else if candidate_cmp.contains(&target_cmp) {
            let ratio = target_cmp.chars().count() as f64 / candidate_cmp.chars().count() as f64;
            0.8 + ratio * 0.2
        } else if target_cmp.contains(&candidate_cmp) {
            let ratio = candidate_cmp.chars().count() as f64 / target_cmp.chars().count() as f64;
            0.8 + ratio * 0.2
        } else {
            edit_similarity(&target_cmp, &candidate_cmp)
        };

        if score < 1.0 {
            let target_keywords = keywords(&target_norm);
            let shared = keywords(&candidate_norm)
                .iter()
                .filter(|k| target_keywords.contains(k))
                .count();
            score += (shared as f64 * self.config.keyword_bonus).min(self.config.keyword_bonus_cap);
        }

        if document_class(&candidate_norm) != document_class(&target_norm) {
            score *= self.config.class_mismatch_penalty;
        }

        score.min(1.0)
    }

    /// Pick the best candidate for `target`, or `None` when nothing clears
    /// the acceptance threshold.
    ///
    /// Among accepted candidates a confirmed in-force document always beats
    /// a superseded or unconfirmed one; score only breaks ties within the
    /// same validity class.
    pub fn resolve<'a>(
        &self,
        target: &str,
        candidates: &'a [MatchCandidate],
    ) -> Option<ResolvedMatch<'a>> {
        let mut best: Option<ResolvedMatch<'a>> = None;

        for candidate in candidates {
            let score = self.score(target, &candidate.title);
            if score < self.config.accept_threshold {
                continue;
            }
            let confirmed_valid = candidate.validity == Some(Validity::InForce);
            let challenger = ResolvedMatch {
                candidate,
                score,
                confirmed_valid,
            };
            best = Some(match best.take() {
                None => challenger,
                Some(current) => {
                    if prefers(&challenger, &current) {
                        challenger
                    } else {
                        current
                    }
                }
            });
        }

        best
    }
}

/// Ordering policy: validity before score before publication recency.
fn prefers(challenger: &ResolvedMatch<'_>, incumbent: &ResolvedMatch<'_>) -> bool {
    if challenger.confirmed_valid != incumbent.confirmed_valid {
        return challenger.confirmed_valid;
    }
    if (challenger.score - incumbent.score).abs() > f64::EPSILON {
        return challenger.score > incumbent.score;
    }
    match (challenger.candidate.published, incumbent.candidate.published) {
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, validity: Option<Validity>) -> MatchCandidate {
        let mut c = MatchCandidate::new(title, title);
        c.validity = validity;
        c
    }

    #[test]
    fn normalization_is_idempotent() {
        let cases = [
            "中华人民共和国反洗钱法（2024修订）",
            "Consumer Protection Law (2013 Amendment)",
            "  spaced   out  name ",
        ];
        for raw in cases {
            let once = normalize_title(raw);
            assert_eq!(normalize_title(&once), once, "normalize({raw:?})");
        }
    }

    #[test]
    fn strips_boilerplate_and_amendments() {
        assert_eq!(normalize_title("中华人民共和国统计法（2024修正）"), "统计法");
        assert_eq!(
            normalize_title("Consumer Protection Law (2013 Amendment)"),
            "Consumer Protection Law"
        );
    }

    #[test]
    fn in_force_beats_higher_scoring_superseded() {
        let resolver = MatchResolver::default();
        let candidates = vec![
            candidate(
                "Consumer Protection Law (2013 Amendment)",
                Some(Validity::Superseded),
            ),
            candidate("Consumer Protection Law", Some(Validity::InForce)),
        ];
        let winner = resolver
            .resolve("Consumer Protection Law", &candidates)
            .expect("should resolve");
        assert_eq!(winner.candidate.title, "Consumer Protection Law");
        assert!(winner.confirmed_valid);
    }

    #[test]
    fn unknown_validity_loses_tiebreak_but_competes_on_score() {
        let resolver = MatchResolver::default();
        let candidates = vec![
            candidate("Statistics Law", None),
            candidate("Statistics Law", Some(Validity::InForce)),
        ];
        let winner = resolver.resolve("Statistics Law", &candidates).unwrap();
        assert!(winner.confirmed_valid);

        let only_unknown = vec![candidate("Statistics Law", None)];
        let winner = resolver.resolve("Statistics Law", &only_unknown).unwrap();
        assert!(!winner.confirmed_valid);
    }

    #[test]
    fn weak_keyword_overlap_is_rejected() {
        let resolver = MatchResolver::default();
        let candidates = vec![candidate("Urban Water Supply Pricing Rules", None)];
        assert!(resolver
            .resolve("Consumer Protection Law", &candidates)
            .is_none());
    }

    #[test]
    fn empty_candidate_list_resolves_to_none() {
        let resolver = MatchResolver::default();
        assert!(resolver.resolve("Anything", &[]).is_none());
    }

    #[test]
    fn different_document_class_is_penalized() {
        let resolver = MatchResolver::default();
        let statute = resolver.score("证券法", "证券法");
        let notice = resolver.score("证券法", "关于证券法施行的通知");
        assert!(statute > 0.9);
        assert!(notice < resolver.config.accept_threshold);
    }

    #[test]
    fn containment_scales_with_length_ratio() {
        let resolver = MatchResolver::default();
        let close = resolver.score("会计法", "会计法实施细则");
        let loose = resolver.score("会计法", "会计法及其他若干财政事项的综合性实施细则汇编");
        assert!(close > loose);
    }
}
