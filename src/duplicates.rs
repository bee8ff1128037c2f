//! Cross-registry duplicate detection.
//!
//! Samples are blocked by `(cancer_type, organism)` and scored pairwise inside each
//! block. Pairs above the threshold are merged with union-find so group membership
//! is the transitive closure of the pairwise relation. Nothing is merged in the
//! data itself; groups only feed the report and the manifest's group column.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write;

use serde::Serialize;

use crate::config::DuplicateConfig;
use crate::domain::{CancerType, Sample, SampleKey};
use crate::normalize::normalized_words;

const TITLE_WEIGHT: f64 = 0.6;
const READ_LENGTH_WEIGHT: f64 = 0.15;
const BASE_COUNT_WEIGHT: f64 = 0.15;
const EXACT_MATCH_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct PairEvidence {
    pub left: SampleKey,
    pub right: SampleKey,
    pub title_similarity: f64,
    /// `None` when either side lacks the value.
    pub read_length_close: Option<bool>,
    pub base_count_close: Option<bool>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub id: String,
    pub cancer_type: CancerType,
    pub organism: String,
    pub members: Vec<SampleKey>,
    pub evidence: Vec<PairEvidence>,
    /// Distinct registry labels carried by the members.
    pub source_labels: Vec<String>,
}

impl DuplicateGroup {
    pub fn labels_disagree(&self) -> bool {
        self.source_labels.len() > 1
    }
}

/// Near-identical samples that the registries filed under different cancer types.
#[derive(Debug, Clone, Serialize)]
pub struct LabelConflict {
    pub left: SampleKey,
    pub left_type: CancerType,
    pub right: SampleKey,
    pub right_type: CancerType,
    pub title_similarity: f64,
}

#[derive(Debug, Default, Serialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
    pub assignments: BTreeMap<SampleKey, String>,
    pub conflicts: Vec<LabelConflict>,
}

impl DuplicateReport {
    pub fn group_of(&self, key: &SampleKey) -> Option<&str> {
        self.assignments.get(key).map(String::as_str)
    }
}

/// Union-find with path compression and union by rank.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn find(&mut self, item: usize) -> usize {
        let mut root = item;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = item;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Returns `false` when both items were already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a == root_b {
            return false;
        }
        match self.rank[root_a].cmp(&self.rank[root_b]) {
            std::cmp::Ordering::Less => self.parent[root_a] = root_b,
            std::cmp::Ordering::Greater => self.parent[root_b] = root_a,
            std::cmp::Ordering::Equal => {
                self.parent[root_b] = root_a;
                self.rank[root_a] += 1;
            }
        }
        true
    }
}

pub struct DuplicateDetector {
    config: DuplicateConfig,
}

impl DuplicateDetector {
    pub fn new(config: DuplicateConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, left: &Sample, right: &Sample) -> PairEvidence {
        self.score_words(left, right, &word_set(&left.title), &word_set(&right.title))
    }

    fn score_words(
        &self,
        left: &Sample,
        right: &Sample,
        left_words: &HashSet<String>,
        right_words: &HashSet<String>,
    ) -> PairEvidence {
        let title_similarity = jaccard(left_words, right_words);
        let read_length_close = closeness(
            left.read_length,
            right.read_length,
            self.config.numeric_tolerance,
        );
        let base_count_close = closeness(
            left.base_count,
            right.base_count,
            self.config.numeric_tolerance,
        );

        let mut weighted = TITLE_WEIGHT * title_similarity;
        let mut available = TITLE_WEIGHT;
        for (close, weight) in [
            (read_length_close, READ_LENGTH_WEIGHT),
            (base_count_close, BASE_COUNT_WEIGHT),
        ] {
            if let Some(close) = close {
                available += weight;
                if close {
                    weighted += weight;
                }
            }
        }
        if same_block(left, right) {
            weighted += EXACT_MATCH_WEIGHT;
        }
        available += EXACT_MATCH_WEIGHT;

        PairEvidence {
            left: left.key().clone(),
            right: right.key().clone(),
            title_similarity,
            read_length_close,
            base_count_close,
            score: weighted / available,
        }
    }

    pub fn detect(&self, samples: &[Sample]) -> DuplicateReport {
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.sort_by(|a, b| samples[*a].key().cmp(samples[*b].key()));

        let mut blocks: BTreeMap<(CancerType, String), Vec<usize>> = BTreeMap::new();
        for &index in &order {
            let sample = &samples[index];
            blocks
                .entry((sample.cancer_type, sample.organism.to_lowercase()))
                .or_default()
                .push(index);
        }

        let words: Vec<HashSet<String>> = samples
            .iter()
            .map(|sample| word_set(&sample.title))
            .collect();
        let mut sets = DisjointSet::new(samples.len());
        let mut candidates = Vec::new();
        for members in blocks.values() {
            for (offset, &left) in members.iter().enumerate() {
                for &right in &members[offset + 1..] {
                    let evidence = self.score_words(
                        &samples[left],
                        &samples[right],
                        &words[left],
                        &words[right],
                    );
                    if evidence.score > self.config.threshold {
                        tracing::debug!(
                            left = %evidence.left,
                            right = %evidence.right,
                            score = evidence.score,
                            "duplicate candidate"
                        );
                        sets.union(left, right);
                        candidates.push((left, evidence));
                    }
                }
            }
        }

        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &index in &order {
            by_root.entry(sets.find(index)).or_default().push(index);
        }
        let mut clusters: Vec<Vec<usize>> = by_root
            .into_values()
            .filter(|members| members.len() > 1)
            .collect();
        clusters.sort_by(|a, b| samples[a[0]].key().cmp(samples[b[0]].key()));

        let mut report = DuplicateReport::default();
        for (number, members) in clusters.into_iter().enumerate() {
            let id = format!("DG{:04}", number + 1);
            let root = sets.find(members[0]);
            let evidence = candidates
                .iter()
                .filter(|(left, _)| sets.find(*left) == root)
                .map(|(_, evidence)| evidence.clone())
                .collect();
            let source_labels = members
                .iter()
                .filter_map(|index| samples[*index].source_label.as_deref())
                .map(|label| label.trim().to_lowercase())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let first = &samples[members[0]];
            let group = DuplicateGroup {
                id: id.clone(),
                cancer_type: first.cancer_type,
                organism: first.organism.clone(),
                members: members
                    .iter()
                    .map(|index| samples[*index].key().clone())
                    .collect(),
                evidence,
                source_labels,
            };
            for key in &group.members {
                report.assignments.insert(key.clone(), id.clone());
            }
            tracing::warn!(
                group = %group.id,
                members = group.members.len(),
                "potential duplicate group"
            );
            report.groups.push(group);
        }

        if self.config.report_label_conflicts {
            report.conflicts = self.label_conflicts(samples, &words, &order);
        }
        report
    }

    fn label_conflicts(
        &self,
        samples: &[Sample],
        words: &[HashSet<String>],
        order: &[usize],
    ) -> Vec<LabelConflict> {
        let threshold = self.config.conflict_title_similarity;
        let mut by_organism: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for &index in order {
            by_organism
                .entry(samples[index].organism.to_lowercase())
                .or_default()
                .push(index);
        }

        let mut conflicts = Vec::new();
        for members in by_organism.values() {
            for (left, right) in similar_title_pairs(members, words, threshold) {
                let (a, b) = (&samples[left], &samples[right]);
                if a.cancer_type == b.cancer_type {
                    continue;
                }
                let similarity = jaccard(&words[left], &words[right]);
                if similarity >= threshold {
                    tracing::warn!(
                        left = %a.key(),
                        right = %b.key(),
                        "near-identical samples with different cancer types"
                    );
                    conflicts.push(LabelConflict {
                        left: a.key().clone(),
                        left_type: a.cancer_type,
                        right: b.key().clone(),
                        right_type: b.cancer_type,
                        title_similarity: similarity,
                    });
                }
            }
        }
        conflicts
    }
}

/// Pairs of `members` (earlier first) whose titles may reach `threshold` Jaccard
/// similarity.
///
/// Prefix filtering: each title's words are ranked rarest first, and two sets with
/// similarity `t` share at least `ceil(t * |x|)` words, so they must share a word
/// within the first `|x| - ceil(t * |x|) + 1` of either ranking. Titles with no
/// shared word are never paired.
fn similar_title_pairs(
    members: &[usize],
    words: &[HashSet<String>],
    threshold: f64,
) -> Vec<(usize, usize)> {
    let mut frequency: HashMap<&str, usize> = HashMap::new();
    for &index in members {
        for word in &words[index] {
            *frequency.entry(word.as_str()).or_default() += 1;
        }
    }

    let mut postings: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut pairs = BTreeSet::new();
    for (position, &index) in members.iter().enumerate() {
        let mut ranked: Vec<&str> = words[index].iter().map(String::as_str).collect();
        ranked.sort_by(|a, b| frequency[a].cmp(&frequency[b]).then_with(|| a.cmp(b)));
        let prefix = &ranked[..prefix_len(ranked.len(), threshold)];
        for word in prefix {
            if let Some(earlier) = postings.get(word) {
                pairs.extend(earlier.iter().map(|&other| (other, position)));
            }
        }
        for &word in prefix {
            postings.entry(word).or_default().push(position);
        }
    }
    pairs
        .into_iter()
        .map(|(left, right)| (members[left], members[right]))
        .collect()
}

fn prefix_len(len: usize, threshold: f64) -> usize {
    if threshold <= 0.0 {
        return len;
    }
    // Rounding must never shorten the prefix.
    let required = ((threshold.min(1.0) * len as f64 - 1e-9).ceil() as usize).max(1);
    (len + 1).saturating_sub(required).min(len)
}

fn same_block(left: &Sample, right: &Sample) -> bool {
    left.cancer_type == right.cancer_type && left.organism.eq_ignore_ascii_case(&right.organism)
}

fn word_set(text: &str) -> HashSet<String> {
    normalized_words(text).into_iter().collect()
}

pub fn jaccard(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    let union = left.union(right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(right).count() as f64 / union as f64
}

/// Relative difference against the larger value.
pub fn closeness(left: Option<f64>, right: Option<f64>, tolerance: f64) -> Option<bool> {
    let (left, right) = (left?, right?);
    let larger = left.max(right);
    if larger == 0.0 {
        return Some(true);
    }
    Some((left - right).abs() / larger <= tolerance)
}

pub fn render_report(report: &DuplicateReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Duplicate Sample Detection Report");
    let _ = writeln!(out, "{}", "=".repeat(50));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Total duplicate groups detected: {}",
        report.groups.len()
    );
    let _ = writeln!(out);

    for group in &report.groups {
        let _ = writeln!(
            out,
            "{} ({}, {}): {} samples",
            group.id,
            group.cancer_type,
            group.organism,
            group.members.len()
        );
        for member in &group.members {
            let _ = writeln!(out, "  - {member}");
        }
        for evidence in &group.evidence {
            let _ = writeln!(
                out,
                "  evidence {} ~ {}: score={:.3} title_jaccard={:.3} read_length={} base_count={}",
                evidence.left,
                evidence.right,
                evidence.score,
                evidence.title_similarity,
                describe_closeness(evidence.read_length_close),
                describe_closeness(evidence.base_count_close),
            );
        }
        if group.labels_disagree() {
            let _ = writeln!(
                out,
                "  AMBIGUOUS: registries disagree on cancer label ({}); review manually",
                group.source_labels.join(", ")
            );
        }
        let _ = writeln!(out);
    }

    if !report.conflicts.is_empty() {
        let _ = writeln!(out, "Cancer-type conflicts (not grouped, review manually):");
        for conflict in &report.conflicts {
            let _ = writeln!(
                out,
                "  - {} [{}] vs {} [{}]: title_jaccard={:.3}",
                conflict.left,
                conflict.left_type,
                conflict.right,
                conflict.right_type,
                conflict.title_similarity
            );
        }
    }
    out
}

fn describe_closeness(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "close",
        Some(false) => "far",
        None => "n/a",
    }
}
