//! Entity and relation extraction.
//!
//! Two paths produce the same [`Extraction`] shape:
//!
//! - **LLM**: a chat completion returning a strict JSON record
//!   `{entities: [{name, label}], relations: [{source_name, target_name,
//!   relation, confidence}]}`, validated and normalized before use.
//! - **Heuristic**: a deterministic scanner over capitalized token runs
//!   with keyword-based classification enrichment.
//!
//! If the LLM is configured but fails (or is not configured at all while
//! `llm` mode is requested), extraction falls back to the heuristic and the
//! result is tagged `heuristic_fallback`. Derived relations:
//!
//! - `ROLE_AT` for a Role and an Organization in the same sentence
//!   (emitted here, since sentence boundaries are visible to the extractor);
//! - `CO_OCCURS` per chunk and `USES_TECH` per section are derived by the
//!   ingestion pipeline, which owns chunk/section grouping.

use serde::Deserialize;

use crate::chunker::split_sentences;
use crate::llm::{extract_json_object, LlmClient};
use crate::models::{relation, NodeLabel};

/// Extraction mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    /// LLM primary, heuristic fallback.
    Llm,
    /// Bypass the LLM entirely (`force_heuristic`).
    ForceHeuristic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub label: NodeLabel,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelation {
    pub source_name: String,
    pub target_name: String,
    pub relation: String,
    pub confidence: f64,
}

/// Result of extracting one chunk of text.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
    /// `llm`, `heuristic`, or `heuristic_fallback`.
    pub mode_used: &'static str,
}

const MAX_ENTITIES_PER_CHUNK: usize = 80;
const HEURISTIC_CONFIDENCE: f64 = 0.5;
const PATTERN_CONFIDENCE: f64 = 0.65;
const DEFAULT_LLM_CONFIDENCE: f64 = 0.7;

const TECH_TERMS: &[&str] = &[
    "python", "typescript", "javascript", "rust", "react", "vue", "angular", "docker",
    "kubernetes", "aws", "gcp", "azure", "postgres", "postgresql", "mysql", "sqlite", "redis",
    "kafka", "spark", "airflow", "pytorch", "tensorflow", "transformer", "langchain", "neo4j",
    "k8s", "helm", "terraform", "ansible", "sql", "graphql", "fastapi", "django", "flask",
    "pandas", "numpy", "hadoop", "elasticsearch", "grpc", "tokio", "axum",
];

const ORG_SUFFIXES: &[&str] = &[
    "inc", "inc.", "corp", "corp.", "corporation", "llc", "ltd", "ltd.", "company",
    "university", "labs", "institute", "systems", "foundation",
];

const ORG_KEYWORDS: &[&str] = &[
    "google", "microsoft", "amazon", "openai", "anthropic", "meta", "ibm", "oracle", "netflix",
    "apple", "nvidia", "intel", "salesforce",
];

const ROLE_KEYWORDS: &[&str] = &[
    "engineer", "developer", "scientist", "manager", "lead", "architect", "director",
    "specialist", "analyst", "researcher", "consultant", "founder", "cto", "ceo", "head",
    "principal",
];

const ACHIEVEMENT_KEYWORDS: &[&str] = &[
    "award", "awarded", "patent", "publication", "certified", "certification", "keynote",
];

const ACHIEVEMENT_VERBS: &[&str] = &["launched", "shipped", "led", "awarded"];

/// Sentence-initial words that are capitalization noise, not entities.
const STOPWORDS: &[&str] = &[
    "the", "this", "that", "these", "those", "it", "he", "she", "they", "we", "i", "a", "an",
    "in", "on", "at", "but", "and", "or", "if", "when", "while", "after", "before", "his",
    "her", "its", "our", "their", "there", "here", "as", "is", "was", "are", "were", "be",
    "been", "for", "with", "from", "by", "to", "of", "not", "no", "yes", "also", "however",
];

pub struct Extractor {
    llm: Option<std::sync::Arc<LlmClient>>,
}

impl Extractor {
    pub fn new(llm: Option<std::sync::Arc<LlmClient>>) -> Self {
        Self { llm }
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Extract entities and relations from one chunk of text. Never fails;
    /// provider problems degrade to the heuristic path.
    pub async fn extract_chunk(&self, text: &str, mode: ExtractionMode) -> Extraction {
        if mode == ExtractionMode::ForceHeuristic {
            return self.heuristic(text, "heuristic");
        }
        match &self.llm {
            Some(client) => match self.extract_with_llm(client, text).await {
                Ok(extraction) => extraction,
                Err(e) => {
                    tracing::warn!(error = %e, "llm extraction failed, falling back to heuristic");
                    self.heuristic(text, "heuristic_fallback")
                }
            },
            None => self.heuristic(text, "heuristic_fallback"),
        }
    }

    async fn extract_with_llm(
        &self,
        client: &LlmClient,
        text: &str,
    ) -> crate::error::Result<Extraction> {
        let system = "You are a knowledge graph extraction system. \
                      Extract entities and relations from text. Output only valid JSON.";
        let user = build_extraction_prompt(text);
        let response = client.chat(system, &user, Some(900)).await?;
        let raw = parse_llm_extraction(&response)?;
        let mut extraction = validate_llm_extraction(raw);
        extraction.mode_used = "llm";
        // The LLM sees the whole chunk but not sentence structure; derive
        // sentence-scoped relations the same way the heuristic path does.
        let derived = derive_sentence_relations(text, &extraction.entities);
        merge_relations(&mut extraction.relations, derived);
        Ok(extraction)
    }

    /// Deterministic extraction: capitalized token runs (1–5 tokens) become
    /// candidate entities, classified by keyword families.
    pub fn heuristic(&self, text: &str, mode_used: &'static str) -> Extraction {
        let mut entities: Vec<ExtractedEntity> = Vec::new();
        let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

        for sentence in split_sentences(text) {
            for candidate in capitalized_runs(sentence) {
                if entities.len() >= MAX_ENTITIES_PER_CHUNK {
                    break;
                }
                let key = candidate.to_lowercase();
                if seen.contains_key(&key) {
                    continue;
                }
                let label = classify(&candidate);
                let confidence = if label == NodeLabel::Entity {
                    HEURISTIC_CONFIDENCE
                } else {
                    PATTERN_CONFIDENCE
                };
                seen.insert(key, entities.len());
                entities.push(ExtractedEntity {
                    name: candidate,
                    label,
                    confidence,
                });
            }
        }

        apply_verb_patterns(text, &mut entities, &mut seen);

        let relations = derive_sentence_relations(text, &entities);
        Extraction {
            entities,
            relations,
            mode_used,
        }
    }
}

fn build_extraction_prompt(text: &str) -> String {
    format!(
        r#"Extract named entities and relations from the text below.

VALID LABELS: Entity, Technology, Organization, Role, Achievement
VALID RELATIONS: CO_OCCURS, ROLE_AT, USES_TECH, RELATED_TO (or an UPPER_SNAKE label you infer)

EXAMPLE
Input: "Maria Chen is a Data Engineer at Nortech Ltd and uses Kafka daily."
Output:
{{"entities": [
  {{"name": "Maria Chen", "label": "Entity"}},
  {{"name": "Data Engineer", "label": "Role"}},
  {{"name": "Nortech Ltd", "label": "Organization"}},
  {{"name": "Kafka", "label": "Technology"}}
], "relations": [
  {{"source_name": "Data Engineer", "target_name": "Nortech Ltd", "relation": "ROLE_AT", "confidence": 0.9}},
  {{"source_name": "Nortech Ltd", "target_name": "Kafka", "relation": "USES_TECH", "confidence": 0.8}}
]}}

TEXT
{}

Return ONLY the JSON object, no markdown fences, no commentary."#,
        text
    )
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relations: Vec<RawRelation>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelation {
    source_name: String,
    target_name: String,
    #[serde(default)]
    relation: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

fn parse_llm_extraction(response: &str) -> crate::error::Result<RawExtraction> {
    let json = extract_json_object(response).ok_or_else(|| {
        crate::error::GraphLoomError::ProviderFailure(
            "no JSON object found in extraction response".to_string(),
        )
    })?;
    serde_json::from_str(json).map_err(|e| {
        crate::error::GraphLoomError::ProviderFailure(format!("invalid extraction JSON: {}", e))
    })
}

/// Drop empty names, normalize labels to the closed set, clamp confidence,
/// and deduplicate by lowercased name.
fn validate_llm_extraction(raw: RawExtraction) -> Extraction {
    let mut entities: Vec<ExtractedEntity> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for e in raw.entities {
        let name = e.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        let key = name.to_lowercase();
        if !seen.insert(key) {
            continue;
        }
        let label = e
            .label
            .as_deref()
            .map(NodeLabel::parse)
            .unwrap_or(NodeLabel::Entity);
        entities.push(ExtractedEntity {
            name,
            label,
            confidence: DEFAULT_LLM_CONFIDENCE,
        });
        if entities.len() >= MAX_ENTITIES_PER_CHUNK {
            break;
        }
    }

    let known: std::collections::HashSet<String> =
        entities.iter().map(|e| e.name.to_lowercase()).collect();
    let mut relations = Vec::new();
    for r in raw.relations {
        let source = r.source_name.trim();
        let target = r.target_name.trim();
        if source.is_empty() || target.is_empty() {
            continue;
        }
        if !known.contains(&source.to_lowercase()) || !known.contains(&target.to_lowercase()) {
            continue;
        }
        relations.push(ExtractedRelation {
            source_name: source.to_string(),
            target_name: target.to_string(),
            relation: r
                .relation
                .as_deref()
                .unwrap_or(relation::RELATED_TO)
                .to_uppercase(),
            confidence: r.confidence.unwrap_or(DEFAULT_LLM_CONFIDENCE).clamp(0.0, 1.0),
        });
    }

    Extraction {
        entities,
        relations,
        mode_used: "llm",
    }
}

/// Classify an entity name into the closed label set using keyword
/// families; unmatched names stay `Entity`.
pub fn classify(name: &str) -> NodeLabel {
    let lower = name.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    if TECH_TERMS.contains(&lower.as_str())
        || words.iter().any(|w| TECH_TERMS.contains(w))
        || lower.ends_with(".js")
        || name.ends_with("DB")
    {
        return NodeLabel::Technology;
    }
    if words
        .last()
        .map(|w| ORG_SUFFIXES.contains(w))
        .unwrap_or(false)
        || ORG_KEYWORDS.contains(&lower.as_str())
    {
        return NodeLabel::Organization;
    }
    if words.iter().any(|w| ROLE_KEYWORDS.contains(w)) {
        return NodeLabel::Role;
    }
    if words.iter().any(|w| ACHIEVEMENT_KEYWORDS.contains(w)) {
        return NodeLabel::Achievement;
    }
    NodeLabel::Entity
}

struct Token {
    text: String,
    sentence_initial: bool,
}

fn tokenize(sentence: &str) -> Vec<Token> {
    sentence
        .split_whitespace()
        .enumerate()
        .map(|(i, raw)| Token {
            text: raw
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '.')
                .trim_end_matches('.')
                .to_string(),
            sentence_initial: i == 0,
        })
        .filter(|t| !t.text.is_empty())
        .collect()
}

fn is_capitalized(token: &str) -> bool {
    token
        .chars()
        .find(|c| c.is_alphabetic())
        .map(|c| c.is_uppercase())
        .unwrap_or(false)
}

fn has_inner_uppercase(token: &str) -> bool {
    token.chars().skip(1).any(|c| c.is_uppercase())
}

fn is_acronym(token: &str) -> bool {
    token.len() >= 2 && token.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Candidate entity phrases: runs of 1–5 consecutive capitalized tokens.
/// A single-token run that only ever opens a sentence is skipped unless the
/// token itself signals an entity (inner uppercase, acronym, or a known
/// keyword) — plain sentence-initial capitalization is not evidence.
fn capitalized_runs(sentence: &str) -> Vec<String> {
    let tokens = tokenize(sentence);
    let mut out = Vec::new();
    let mut run: Vec<&Token> = Vec::new();

    let mut flush = |run: &mut Vec<&Token>, out: &mut Vec<String>| {
        // Trim leading stopwords such as "The" from the run.
        while let Some(first) = run.first() {
            if STOPWORDS.contains(&first.text.to_lowercase().as_str()) {
                run.remove(0);
            } else {
                break;
            }
        }
        if run.is_empty() || run.len() > 5 {
            run.clear();
            return;
        }
        if run.len() == 1 {
            let t = run[0];
            let lower = t.text.to_lowercase();
            let strong = has_inner_uppercase(&t.text)
                || is_acronym(&t.text)
                || TECH_TERMS.contains(&lower.as_str())
                || ORG_KEYWORDS.contains(&lower.as_str());
            if t.sentence_initial && !strong {
                run.clear();
                return;
            }
            if STOPWORDS.contains(&lower.as_str()) || t.text.len() < 2 {
                run.clear();
                return;
            }
        }
        out.push(
            run.iter()
                .map(|t| t.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
        run.clear();
    };

    for token in &tokens {
        if is_capitalized(&token.text) {
            run.push(token);
        } else {
            flush(&mut run, &mut out);
        }
    }
    flush(&mut run, &mut out);
    out
}

/// Verb patterns refine labels beyond keyword families:
/// `<X> works at <Y>` marks X a Role holder and Y an Organization;
/// `<X> uses <Y>` marks Y a Technology; achievement verbs mark their
/// object an Achievement. A subject the run scanner skipped (plain
/// sentence-initial capitalization) is added here — appearing in one of
/// these patterns is entity evidence on its own.
fn apply_verb_patterns(
    text: &str,
    entities: &mut Vec<ExtractedEntity>,
    seen: &mut std::collections::HashMap<String, usize>,
) {
    fn promote(
        seen: &mut std::collections::HashMap<String, usize>,
        entities: &mut Vec<ExtractedEntity>,
        name: &str,
        label: NodeLabel,
    ) {
        let key = name.to_lowercase();
        if STOPWORDS.contains(&key.as_str()) {
            return;
        }
        match seen.get(&key).copied() {
            Some(idx) => {
                if entities[idx].label == NodeLabel::Entity {
                    entities[idx].label = label;
                    entities[idx].confidence = entities[idx].confidence.max(PATTERN_CONFIDENCE);
                }
            }
            None => {
                if entities.len() >= MAX_ENTITIES_PER_CHUNK {
                    return;
                }
                seen.insert(key, entities.len());
                entities.push(ExtractedEntity {
                    name: name.to_string(),
                    label,
                    confidence: PATTERN_CONFIDENCE,
                });
            }
        }
    }

    for sentence in split_sentences(text) {
        let tokens = tokenize(sentence);
        let words: Vec<String> = tokens.iter().map(|t| t.text.to_lowercase()).collect();

        for i in 0..words.len() {
            match words[i].as_str() {
                "works" | "worked" | "working" => {
                    if i + 2 < words.len() && (words[i + 1] == "at" || words[i + 1] == "for") {
                        if let (Some(subject), Some(object)) = (
                            run_ending_at(&tokens, i),
                            run_starting_at(&tokens, i + 2),
                        ) {
                            promote(seen, entities, &subject, NodeLabel::Role);
                            promote(seen, entities, &object, NodeLabel::Organization);
                        }
                    }
                }
                "uses" | "using" | "used" | "adopts" | "adopted" => {
                    if let Some(object) = run_starting_at(&tokens, i + 1) {
                        promote(seen, entities, &object, NodeLabel::Technology);
                    }
                }
                w if ACHIEVEMENT_VERBS.contains(&w) => {
                    if let Some(object) = run_starting_at(&tokens, i + 1) {
                        promote(seen, entities, &object, NodeLabel::Achievement);
                    }
                }
                _ => {}
            }
        }
    }
}

fn run_ending_at(tokens: &[Token], verb_index: usize) -> Option<String> {
    if verb_index == 0 {
        return None;
    }
    let mut start = verb_index;
    while start > 0 && is_capitalized(&tokens[start - 1].text) {
        start -= 1;
    }
    if start == verb_index {
        return None;
    }
    Some(
        tokens[start..verb_index]
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn run_starting_at(tokens: &[Token], from: usize) -> Option<String> {
    let mut end = from;
    while end < tokens.len() && is_capitalized(&tokens[end].text) && end - from < 5 {
        end += 1;
    }
    if end == from {
        return None;
    }
    Some(
        tokens[from..end]
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// ROLE_AT edges for each (Role, Organization) pair appearing in the same
/// sentence. Runs on the final entity set regardless of extraction path.
pub fn derive_sentence_relations(
    text: &str,
    entities: &[ExtractedEntity],
) -> Vec<ExtractedRelation> {
    let mut out = Vec::new();
    let mut emitted: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

    for sentence in split_sentences(text) {
        let lower = sentence.to_lowercase();
        let present: Vec<&ExtractedEntity> = entities
            .iter()
            .filter(|e| lower.contains(&e.name.to_lowercase()))
            .collect();
        let roles: Vec<&&ExtractedEntity> =
            present.iter().filter(|e| e.label == NodeLabel::Role).collect();
        let orgs: Vec<&&ExtractedEntity> = present
            .iter()
            .filter(|e| e.label == NodeLabel::Organization)
            .collect();
        for role in &roles {
            for org in &orgs {
                let key = (role.name.clone(), org.name.clone());
                if emitted.insert(key) {
                    out.push(ExtractedRelation {
                        source_name: role.name.clone(),
                        target_name: org.name.clone(),
                        relation: relation::ROLE_AT.to_string(),
                        confidence: PATTERN_CONFIDENCE,
                    });
                }
            }
        }
    }
    out
}

fn merge_relations(into: &mut Vec<ExtractedRelation>, extra: Vec<ExtractedRelation>) {
    let existing: std::collections::HashSet<(String, String, String)> = into
        .iter()
        .map(|r| {
            (
                r.source_name.to_lowercase(),
                r.target_name.to_lowercase(),
                r.relation.clone(),
            )
        })
        .collect();
    for r in extra {
        let key = (
            r.source_name.to_lowercase(),
            r.target_name.to_lowercase(),
            r.relation.clone(),
        );
        if !existing.contains(&key) {
            into.push(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heuristic(text: &str) -> Extraction {
        Extractor::new(None).heuristic(text, "heuristic")
    }

    fn names(extraction: &Extraction) -> Vec<&str> {
        extraction.entities.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_extracts_known_org_names() {
        let e = heuristic("OpenAI collaborates with Microsoft and Google on AI safety.");
        let found = names(&e);
        assert!(found.contains(&"OpenAI"), "missing OpenAI in {:?}", found);
        assert!(found.contains(&"Microsoft"));
        assert!(found.contains(&"Google"));
    }

    #[test]
    fn test_sentence_initial_plain_word_skipped() {
        let e = heuristic("Yesterday the team met. Progress was reviewed.");
        let found = names(&e);
        assert!(!found.contains(&"Yesterday"), "got {:?}", found);
        assert!(!found.contains(&"Progress"), "got {:?}", found);
    }

    #[test]
    fn test_multiword_phrase_captured() {
        let e = heuristic("She presented the Machine Learning Platform at the summit.");
        assert!(names(&e).contains(&"Machine Learning Platform"));
    }

    #[test]
    fn test_classification_families() {
        assert_eq!(classify("Kafka"), NodeLabel::Technology);
        assert_eq!(classify("Node.js"), NodeLabel::Technology);
        assert_eq!(classify("MongoDB"), NodeLabel::Technology);
        assert_eq!(classify("Acme Inc"), NodeLabel::Organization);
        assert_eq!(classify("Stanford University"), NodeLabel::Organization);
        assert_eq!(classify("Senior Data Engineer"), NodeLabel::Role);
        assert_eq!(classify("Best Paper Award"), NodeLabel::Achievement);
        assert_eq!(classify("Quarterly Report"), NodeLabel::Entity);
    }

    #[test]
    fn test_works_at_pattern_promotes_labels() {
        let e = heuristic("Alice works at Acme. Acme uses Kafka.");
        let alice = e.entities.iter().find(|x| x.name == "Alice").unwrap();
        let acme = e.entities.iter().find(|x| x.name == "Acme").unwrap();
        let kafka = e.entities.iter().find(|x| x.name == "Kafka").unwrap();
        assert_eq!(alice.label, NodeLabel::Role);
        assert_eq!(acme.label, NodeLabel::Organization);
        assert_eq!(kafka.label, NodeLabel::Technology);
        // ROLE_AT derived from the first sentence.
        assert!(e
            .relations
            .iter()
            .any(|r| r.relation == "ROLE_AT"
                && r.source_name == "Alice"
                && r.target_name == "Acme"));
    }

    #[test]
    fn test_dedup_by_lowercased_name() {
        let e = heuristic("Kafka is fast. KAFKA is everywhere. Kafka again.");
        let kafka_count = e
            .entities
            .iter()
            .filter(|x| x.name.to_lowercase() == "kafka")
            .count();
        assert_eq!(kafka_count, 1);
    }

    #[test]
    fn test_heuristic_is_deterministic() {
        let text = "Dr. Vasquez leads the Quantum Computing Lab at Helios Corp using Rust.";
        let a = heuristic(text);
        let b = heuristic(text);
        assert_eq!(a.entities, b.entities);
        assert_eq!(a.relations, b.relations);
    }

    #[test]
    fn test_validate_llm_extraction_drops_and_clamps() {
        let raw = RawExtraction {
            entities: vec![
                RawEntity {
                    name: "  ".into(),
                    label: None,
                },
                RawEntity {
                    name: "Kafka".into(),
                    label: Some("tool".into()),
                },
                RawEntity {
                    name: "kafka".into(),
                    label: None,
                },
            ],
            relations: vec![
                RawRelation {
                    source_name: "Kafka".into(),
                    target_name: "Unknown Entity".into(),
                    relation: None,
                    confidence: None,
                },
                RawRelation {
                    source_name: "Kafka".into(),
                    target_name: "Kafka".into(),
                    relation: Some("related_to".into()),
                    confidence: Some(7.0),
                },
            ],
        };
        let e = validate_llm_extraction(raw);
        assert_eq!(e.entities.len(), 1);
        assert_eq!(e.entities[0].label, NodeLabel::Technology);
        // Relation to an unknown entity is dropped; the surviving one is
        // upper-cased and clamped.
        assert_eq!(e.relations.len(), 1);
        assert_eq!(e.relations[0].relation, "RELATED_TO");
        assert_eq!(e.relations[0].confidence, 1.0);
    }

    #[test]
    fn test_parse_llm_extraction_tolerates_prose() {
        let response = r#"Here is the result:
{"entities": [{"name": "Rust", "label": "Technology"}], "relations": []}
Hope that helps."#;
        let raw = parse_llm_extraction(response).unwrap();
        assert_eq!(raw.entities.len(), 1);
    }

    #[tokio::test]
    async fn test_force_heuristic_mode_tag() {
        let extractor = Extractor::new(None);
        let e = extractor
            .extract_chunk("Alice works at Acme.", ExtractionMode::ForceHeuristic)
            .await;
        assert_eq!(e.mode_used, "heuristic");
    }

    #[tokio::test]
    async fn test_llm_unconfigured_tags_fallback() {
        let extractor = Extractor::new(None);
        let e = extractor
            .extract_chunk("Alice works at Acme.", ExtractionMode::Llm)
            .await;
        assert_eq!(e.mode_used, "heuristic_fallback");
    }
}
