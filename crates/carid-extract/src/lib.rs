//! Pattern library, candidate scanner, field resolver and container ranker.
//!
//! Everything here is pure: the compiled [`PatternLibrary`] is immutable and
//! shared behind an `Arc`, so blocks can be scanned on any thread in any order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use carid_core::{
    parse_locale_number, Block, BlockId, Candidate, FieldKey, Language, NumberStyle, Span, Unit,
    ValueType,
};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod html;

pub use html::HtmlBlockSource;

pub const CRATE_NAME: &str = "carid-extract";

const BUILTIN_PATTERNS: &str = include_str!("../../../rules/patterns.yaml");

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("pattern `{id}` for field {field} does not compile: {source}")]
    Pattern {
        field: FieldKey,
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("pattern `{id}` for field {field} must set exactly one of `pattern` or `literals`")]
    Matcher { field: FieldKey, id: String },
    #[error("validator for pattern `{id}` is invalid: {reason}")]
    Validator { id: String, reason: String },
    #[error("field {0} has an empty pattern list")]
    EmptyField(FieldKey),
    #[error("selector `{selector}` is invalid: {reason}")]
    Selector { selector: String, reason: String },
    #[error("failed to parse pattern table: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to read pattern table {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Scoring knobs shared by every descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub length_bonus_per_char: f64,
    pub length_bonus_cap: f64,
    /// Characters inspected on each side of a match for context keywords.
    pub context_window_chars: usize,
    pub context_bonus_per_hit: f64,
    pub context_bonus_cap: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            length_bonus_per_char: 0.005,
            length_bonus_cap: 0.1,
            context_window_chars: 40,
            context_bonus_per_hit: 0.05,
            context_bonus_cap: 0.15,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatorSpec {
    #[default]
    None,
    Range {
        min: f64,
        max: f64,
    },
    AllowedSet {
        values: Vec<String>,
    },
    RegexConfirm {
        pattern: String,
    },
}

fn default_case_insensitive() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    pub id: String,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub literals: Option<Vec<String>>,
    pub base_score: f64,
    pub value_type: ValueType,
    #[serde(default)]
    pub unit: Option<Unit>,
    #[serde(default)]
    pub context_keywords: Vec<String>,
    #[serde(default)]
    pub validator: ValidatorSpec,
    #[serde(default = "default_case_insensitive")]
    pub case_insensitive: bool,
}

/// Serialized form of the pattern table (`rules/patterns.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternTable {
    #[serde(default)]
    pub scoring: ScoringConfig,
    pub fields: BTreeMap<FieldKey, Vec<PatternSpec>>,
}

impl PatternTable {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ExtractError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

#[derive(Debug, Clone)]
enum Validator {
    None,
    Range { min: f64, max: f64 },
    AllowedSet(BTreeSet<String>),
    RegexConfirm(Regex),
}

/// Compiled, immutable recognizer for one field.
#[derive(Debug, Clone)]
pub struct PatternDescriptor {
    pub id: String,
    pub field: FieldKey,
    pub language: Language,
    pub value_type: ValueType,
    pub base_score: f64,
    pub unit: Option<Unit>,
    context_keywords: Vec<String>,
    regex: Regex,
    validator: Validator,
}

impl PatternDescriptor {
    fn compile(field: FieldKey, spec: PatternSpec) -> Result<Self, ExtractError> {
        let source = match (&spec.pattern, &spec.literals) {
            (Some(pattern), None) => pattern.clone(),
            (None, Some(literals)) if !literals.is_empty() => literal_alternation(literals),
            _ => {
                return Err(ExtractError::Matcher {
                    field,
                    id: spec.id,
                })
            }
        };
        let regex = RegexBuilder::new(&source)
            .case_insensitive(spec.case_insensitive)
            .build()
            .map_err(|source| ExtractError::Pattern {
                field,
                id: spec.id.clone(),
                source,
            })?;

        let validator = match spec.validator {
            ValidatorSpec::None => Validator::None,
            ValidatorSpec::Range { min, max } => {
                if min.is_nan() || max.is_nan() || min > max {
                    return Err(ExtractError::Validator {
                        id: spec.id,
                        reason: format!("range min {min} exceeds max {max}"),
                    });
                }
                Validator::Range { min, max }
            }
            ValidatorSpec::AllowedSet { values } => Validator::AllowedSet(
                values.iter().map(|v| v.trim().to_lowercase()).collect(),
            ),
            ValidatorSpec::RegexConfirm { pattern } => {
                let confirm = Regex::new(&pattern).map_err(|err| ExtractError::Validator {
                    id: spec.id.clone(),
                    reason: err.to_string(),
                })?;
                Validator::RegexConfirm(confirm)
            }
        };

        Ok(Self {
            id: spec.id,
            field,
            language: spec.language,
            value_type: spec.value_type,
            base_score: spec.base_score,
            unit: spec.unit,
            context_keywords: spec
                .context_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            regex,
            validator,
        })
    }

    /// Apply the validator attached to this descriptor.
    pub fn accepts(&self, value: &str) -> bool {
        match &self.validator {
            Validator::None => true,
            Validator::Range { min, max } => {
                parse_locale_number(value, number_style(self.field, self.unit))
                    .is_some_and(|n| n >= *min && n <= *max)
            }
            Validator::AllowedSet(values) => values.contains(&value.trim().to_lowercase()),
            Validator::RegexConfirm(confirm) => confirm.is_match(value),
        }
    }
}

/// How numeric text for a field/unit pair is read by validators and the normalizer.
pub fn number_style(field: FieldKey, unit: Option<Unit>) -> NumberStyle {
    match (field, unit) {
        (_, Some(Unit::L | Unit::LPer100Km | Unit::Mpg | Unit::In)) => NumberStyle::Decimal,
        (FieldKey::FuelEconomy, _) => NumberStyle::Decimal,
        _ => NumberStyle::Integer,
    }
}

fn literal_alternation(literals: &[String]) -> String {
    let mut sorted: Vec<&String> = literals.iter().filter(|l| !l.trim().is_empty()).collect();
    // Longest first so leftmost-first alternation prefers "Plug-in hybrid" over "hybrid".
    sorted.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
    sorted.dedup();
    let alternatives = sorted
        .into_iter()
        .map(|literal| {
            let literal = literal.trim();
            let lead = if literal.chars().next().is_some_and(char::is_alphanumeric) {
                r"\b"
            } else {
                ""
            };
            let trail = if literal.chars().last().is_some_and(char::is_alphanumeric) {
                r"\b"
            } else {
                ""
            };
            format!("{lead}{}{trail}", regex::escape(literal))
        })
        .collect::<Vec<_>>()
        .join("|");
    format!("(?P<value>{alternatives})")
}

/// Immutable set of compiled descriptors, keyed by field.
#[derive(Debug, Clone)]
pub struct PatternLibrary {
    scoring: ScoringConfig,
    fields: BTreeMap<FieldKey, Vec<PatternDescriptor>>,
}

impl PatternLibrary {
    pub fn compile(table: PatternTable) -> Result<Self, ExtractError> {
        let mut fields = BTreeMap::new();
        for (field, specs) in table.fields {
            if specs.is_empty() {
                return Err(ExtractError::EmptyField(field));
            }
            let descriptors = specs
                .into_iter()
                .map(|spec| PatternDescriptor::compile(field, spec))
                .collect::<Result<Vec<_>, _>>()?;
            fields.insert(field, descriptors);
        }
        Ok(Self {
            scoring: table.scoring,
            fields,
        })
    }

    /// The pattern table shipped with the binaries.
    pub fn builtin() -> Result<Self, ExtractError> {
        Self::compile(PatternTable::from_yaml_str(BUILTIN_PATTERNS)?)
    }

    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ExtractError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::compile(PatternTable::from_yaml_str(&raw)?)
    }

    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldKey> + '_ {
        self.fields.keys().copied()
    }

    pub fn descriptors(&self, field: FieldKey) -> &[PatternDescriptor] {
        self.fields.get(&field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn descriptor(&self, field: FieldKey, pattern_id: &str) -> Option<&PatternDescriptor> {
        self.descriptors(field).iter().find(|d| d.id == pattern_id)
    }

    /// Run every descriptor registered for `field` over `text`.
    ///
    /// Language never biases priority; only the computed score does. Matches
    /// rejected by their validator are dropped, not down-weighted.
    pub fn scan(&self, text: &str, field: FieldKey, block_id: BlockId) -> Vec<Candidate> {
        let mut out = Vec::new();
        for descriptor in self.descriptors(field) {
            for caps in descriptor.regex.captures_iter(text) {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                if whole.as_str().trim().is_empty() {
                    continue;
                }
                let value = caps
                    .name("value")
                    .map(|m| m.as_str())
                    .unwrap_or_else(|| whole.as_str())
                    .trim();
                if value.is_empty() || !descriptor.accepts(value) {
                    continue;
                }
                let span = Span {
                    start: whole.start(),
                    end: whole.end(),
                };
                let score = descriptor.base_score
                    + self.length_bonus(whole.as_str())
                    + self.context_bonus(text, span, &descriptor.context_keywords);
                out.push(Candidate {
                    field,
                    pattern_id: descriptor.id.clone(),
                    language: descriptor.language,
                    raw: whole.as_str().trim().to_string(),
                    value: value.to_string(),
                    qualifier: caps.name("unit").map(|m| m.as_str().trim().to_string()),
                    unit: descriptor.unit,
                    span,
                    score,
                    block_id,
                });
            }
        }
        out
    }

    /// Scan a block for every known field.
    pub fn scan_all(&self, block: &Block) -> BTreeMap<FieldKey, Vec<Candidate>> {
        self.fields()
            .map(|field| (field, self.scan(&block.text, field, block.id)))
            .collect()
    }

    fn length_bonus(&self, matched: &str) -> f64 {
        let chars = matched.chars().count() as f64;
        (chars * self.scoring.length_bonus_per_char).min(self.scoring.length_bonus_cap)
    }

    fn context_bonus(&self, text: &str, span: Span, keywords: &[String]) -> f64 {
        if keywords.is_empty() {
            return 0.0;
        }
        let window = self.scoring.context_window_chars;
        let before_start = if window == 0 {
            span.start
        } else {
            text[..span.start]
                .char_indices()
                .rev()
                .nth(window - 1)
                .map(|(i, _)| i)
                .unwrap_or(0)
        };
        let after_end = text[span.end..]
            .char_indices()
            .nth(window)
            .map(|(i, _)| span.end + i)
            .unwrap_or(text.len());
        let context = format!(
            "{} {}",
            &text[before_start..span.start],
            &text[span.end..after_end]
        )
        .to_lowercase();
        let hits = keywords.iter().filter(|k| context.contains(k.as_str())).count();
        (hits as f64 * self.scoring.context_bonus_per_hit).min(self.scoring.context_bonus_cap)
    }
}

/// Total order used to pick a winner: score, then leftmost, then longest raw match.
///
/// The trailing keys only exist so the order is total over distinct candidates.
pub fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.span.start.cmp(&b.span.start))
        .then(b.raw.chars().count().cmp(&a.raw.chars().count()))
        .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        .then_with(|| a.value.cmp(&b.value))
        .then_with(|| a.span.end.cmp(&b.span.end))
        .then_with(|| a.qualifier.cmp(&b.qualifier))
}

/// Outcome of resolving one field; `winner == None` means null with zero confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub field: FieldKey,
    pub winner: Option<Candidate>,
    pub confidence: f64,
    /// Remaining candidates in resolution order, best first.
    pub alternates: Vec<Candidate>,
}

impl ResolvedField {
    pub fn null(field: FieldKey) -> Self {
        Self {
            field,
            winner: None,
            confidence: 0.0,
            alternates: Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.winner.is_none()
    }

    pub fn raw(&self) -> Option<&str> {
        self.winner.as_ref().map(|c| c.raw.as_str())
    }
}

/// Reduce the candidates for `field` to one value, independent of input order.
pub fn resolve(field: FieldKey, candidates: &[Candidate]) -> ResolvedField {
    let mut ranked: Vec<Candidate> = candidates
        .iter()
        .filter(|c| c.field == field)
        .cloned()
        .collect();
    if ranked.is_empty() {
        return ResolvedField::null(field);
    }
    ranked.sort_by(candidate_order);
    let winner = ranked.remove(0);
    ResolvedField {
        field,
        confidence: winner.score.clamp(0.0, 1.0),
        winner: Some(winner),
        alternates: ranked,
    }
}

/// Density weights per field; fields missing from the map use `default_weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceWeights {
    #[serde(default)]
    pub default_weight: f64,
    pub fields: BTreeMap<FieldKey, f64>,
}

impl ImportanceWeights {
    pub fn weight(&self, field: FieldKey) -> f64 {
        self.fields
            .get(&field)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        let fields = [
            (FieldKey::Title, 1.0),
            (FieldKey::Price, 1.0),
            (FieldKey::Year, 0.8),
            (FieldKey::Mileage, 0.8),
            (FieldKey::Vin, 0.8),
            (FieldKey::EnginePower, 0.6),
            (FieldKey::FuelType, 0.5),
            (FieldKey::Transmission, 0.5),
            (FieldKey::BodyType, 0.4),
            (FieldKey::EngineDisplacement, 0.4),
            (FieldKey::Color, 0.3),
            (FieldKey::Location, 0.3),
            (FieldKey::Length, 0.2),
            (FieldKey::CurbWeight, 0.2),
            (FieldKey::FuelEconomy, 0.2),
        ]
        .into_iter()
        .collect();
        Self {
            default_weight: 0.0,
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SelectionPolicy {
    TopK { k: usize },
    Threshold { min_density: f64 },
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::Threshold { min_density: 2.5 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankerConfig {
    #[serde(default)]
    pub importance: ImportanceWeights,
    #[serde(default)]
    pub selection: SelectionPolicy,
}

/// A block after every field has been scanned and resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredBlock {
    pub block: Block,
    pub density: f64,
    pub resolved: BTreeMap<FieldKey, ResolvedField>,
    #[serde(default)]
    pub timed_out: bool,
}

impl ScoredBlock {
    /// Placeholder for a block whose extraction was cancelled; it never ranks.
    pub fn timed_out(block: Block) -> Self {
        Self {
            block,
            density: 0.0,
            resolved: BTreeMap::new(),
            timed_out: true,
        }
    }

    pub fn id(&self) -> BlockId {
        self.block.id
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.values().filter(|r| !r.is_null()).count()
    }

    pub fn winner(&self, field: FieldKey) -> Option<&Candidate> {
        self.resolved.get(&field).and_then(|r| r.winner.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub block_id: BlockId,
    pub density: f64,
    /// A nested block with at least the same density, or two dense children,
    /// make this one redundant.
    pub dominated: bool,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSelection {
    /// Selected containers in document order.
    pub containers: Vec<ScoredBlock>,
    /// Every scored block, best first.
    pub ranking: Vec<RankEntry>,
}

impl ContainerSelection {
    pub fn container_ids(&self) -> Vec<BlockId> {
        self.containers.iter().map(ScoredBlock::id).collect()
    }
}

pub struct ContainerRanker {
    library: Arc<PatternLibrary>,
    config: RankerConfig,
}

impl ContainerRanker {
    pub fn new(library: Arc<PatternLibrary>, config: RankerConfig) -> Self {
        Self { library, config }
    }

    pub fn library(&self) -> &Arc<PatternLibrary> {
        &self.library
    }

    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    pub fn score_block(&self, block: &Block) -> ScoredBlock {
        let resolved: BTreeMap<FieldKey, ResolvedField> = self
            .library
            .scan_all(block)
            .into_iter()
            .map(|(field, candidates)| {
                let resolved = resolve(field, &candidates);
                if resolved.is_null() {
                    debug!(block = %block.id, field = %field, "field resolved to null");
                }
                (field, resolved)
            })
            .collect();
        let density = self.density(&resolved);
        ScoredBlock {
            block: block.clone(),
            density,
            resolved,
            timed_out: false,
        }
    }

    pub fn density(&self, resolved: &BTreeMap<FieldKey, ResolvedField>) -> f64 {
        resolved
            .values()
            .filter(|r| !r.is_null())
            .map(|r| self.config.importance.weight(r.field))
            .sum()
    }

    /// Pick listing containers from scored blocks given in any order.
    ///
    /// Ranking is density descending with document order as the tiebreak.
    /// Selected containers never overlap: when an ancestor and one of its
    /// descendants are both candidates, the innermost block with the highest
    /// density wins. A block with two or more children that each carry at
    /// least half of its density is a wrapper around several listings and
    /// never wins either.
    pub fn select(&self, mut scored: Vec<ScoredBlock>) -> ContainerSelection {
        scored.sort_by_key(ScoredBlock::id);
        let position: HashMap<BlockId, usize> = scored
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id(), i))
            .collect();
        let ancestors = |index: usize| -> Vec<usize> {
            let mut chain = Vec::new();
            let mut cursor = scored[index].block.parent;
            while let Some(parent) = cursor {
                let Some(&pi) = position.get(&parent) else {
                    break;
                };
                if chain.contains(&pi) || pi == index {
                    break;
                }
                chain.push(pi);
                cursor = scored[pi].block.parent;
            }
            chain
        };
        let chains: Vec<Vec<usize>> = (0..scored.len()).map(ancestors).collect();

        let mut dominated = vec![false; scored.len()];
        for (index, chain) in chains.iter().enumerate() {
            if scored[index].density <= 0.0 {
                continue;
            }
            for &ancestor in chain {
                if scored[index].density >= scored[ancestor].density {
                    dominated[ancestor] = true;
                }
            }
        }
        let mut heavy_children = vec![0usize; scored.len()];
        for (index, chain) in chains.iter().enumerate() {
            if let Some(&parent) = chain.first() {
                let density = scored[index].density;
                if density > 0.0 && density * 2.0 >= scored[parent].density {
                    heavy_children[parent] += 1;
                }
            }
        }
        for (index, count) in heavy_children.into_iter().enumerate() {
            if count >= 2 {
                dominated[index] = true;
            }
        }

        let mut order: Vec<usize> = (0..scored.len()).collect();
        order.sort_by(|&a, &b| {
            scored[b]
                .density
                .total_cmp(&scored[a].density)
                .then(scored[a].id().cmp(&scored[b].id()))
        });

        let overlaps = |a: usize, b: usize| chains[a].contains(&b) || chains[b].contains(&a);
        let mut chosen: Vec<usize> = Vec::new();
        for &index in &order {
            let density = scored[index].density;
            if density <= 0.0 || dominated[index] {
                continue;
            }
            match self.config.selection {
                SelectionPolicy::TopK { k } if chosen.len() >= k => break,
                SelectionPolicy::Threshold { min_density } if density < min_density => break,
                _ => {}
            }
            if chosen.iter().any(|&c| overlaps(c, index)) {
                continue;
            }
            chosen.push(index);
        }

        let ranking = order
            .iter()
            .map(|&i| RankEntry {
                block_id: scored[i].id(),
                density: scored[i].density,
                dominated: dominated[i],
                selected: chosen.contains(&i),
            })
            .collect();

        chosen.sort_unstable();
        let mut slots: Vec<Option<ScoredBlock>> = scored.into_iter().map(Some).collect();
        let containers: Vec<ScoredBlock> = chosen
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();
        if containers.is_empty() {
            warn!(
                policy = ?self.config.selection,
                "page yielded zero listing containers"
            );
        }
        ContainerSelection {
            containers,
            ranking,
        }
    }

    pub fn rank_and_select(&self, blocks: &[Block]) -> ContainerSelection {
        let scored = blocks.iter().map(|b| self.score_block(b)).collect();
        self.select(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> Arc<PatternLibrary> {
        Arc::new(PatternLibrary::builtin().expect("builtin patterns compile"))
    }

    const BMW_BLOCK: &str = "BMW M5 Competition 2019 г. 113 000 км Бензинов 625 к.с. Автоматична Седан 109 999 лв";
    const AUDI_BLOCK: &str =
        "Audi RS6 Avant 2020 г. 45 000 км Бензинов 600 к.с. Автоматична Комби 189 500 лв";

    fn winner(lib: &PatternLibrary, text: &str, field: FieldKey) -> Option<Candidate> {
        resolve(field, &lib.scan(text, field, BlockId(0))).winner
    }

    #[test]
    fn bulgarian_horsepower_resolves_with_hp_unit() {
        let lib = library();
        let power = winner(&lib, "625 к.с.", FieldKey::EnginePower).expect("power");
        assert_eq!(power.value, "625");
        assert_eq!(power.unit, Some(Unit::Hp));
        assert_eq!(power.language, Language::Bg);
    }

    #[test]
    fn listing_block_resolves_eight_fields() {
        let lib = library();
        let ranker = ContainerRanker::new(lib, RankerConfig::default());
        let scored = ranker.score_block(&Block::new(0, BMW_BLOCK));
        assert_eq!(scored.resolved_count(), 8, "{:#?}", scored.resolved);
        assert_eq!(
            scored.winner(FieldKey::Title).map(|c| c.value.as_str()),
            Some("BMW M5 Competition")
        );
        assert_eq!(
            scored.winner(FieldKey::Year).map(|c| c.value.as_str()),
            Some("2019")
        );
        assert_eq!(
            scored.winner(FieldKey::Mileage).map(|c| c.value.as_str()),
            Some("113 000")
        );
        let price = scored.winner(FieldKey::Price).expect("price");
        assert_eq!(price.value, "109 999");
        assert_eq!(price.qualifier.as_deref(), Some("лв"));
    }

    #[test]
    fn validator_failures_discard_matches() {
        let lib = library();
        // 1890 is outside the plausible year range.
        assert!(winner(&lib, "1890 г.", FieldKey::Year).is_none());
        assert!(winner(&lib, "VIN: WBA1234567890123I", FieldKey::Vin).is_none());
        assert!(winner(&lib, "VIN: WBA12345678901234", FieldKey::Vin).is_some());
    }

    #[test]
    fn resolver_is_independent_of_candidate_order() {
        let lib = library();
        let text = "Цена 12 500 € или 24 400 лв, 12 500 EUR";
        let mut candidates = lib.scan(text, FieldKey::Price, BlockId(3));
        assert!(candidates.len() >= 3);
        let expected = resolve(FieldKey::Price, &candidates);
        for rotation in 0..candidates.len() {
            candidates.rotate_left(1);
            let mut reversed = candidates.clone();
            reversed.reverse();
            assert_eq!(resolve(FieldKey::Price, &candidates), expected, "rotation {rotation}");
            assert_eq!(resolve(FieldKey::Price, &reversed), expected);
        }
    }

    #[test]
    fn resolver_breaks_ties_by_position_then_length() {
        let make = |start: usize, raw: &str| Candidate {
            field: FieldKey::Color,
            pattern_id: "color_en".into(),
            language: Language::En,
            raw: raw.into(),
            value: raw.into(),
            qualifier: None,
            unit: None,
            span: Span {
                start,
                end: start + raw.len(),
            },
            score: 0.7,
            block_id: BlockId(0),
        };
        let resolved = resolve(
            FieldKey::Color,
            &[make(10, "red"), make(2, "blue"), make(2, "blue metallic")],
        );
        assert_eq!(resolved.winner.map(|c| c.raw), Some("blue metallic".into()));
        assert_eq!(resolved.alternates.len(), 2);
    }

    #[test]
    fn empty_candidates_resolve_to_null_with_zero_confidence() {
        let resolved = resolve(FieldKey::Vin, &[]);
        assert!(resolved.is_null());
        assert_eq!(resolved.confidence, 0.0);
    }

    #[test]
    fn top_two_selection_returns_dense_blocks_in_document_order() {
        let ranker = ContainerRanker::new(
            library(),
            RankerConfig {
                importance: ImportanceWeights::default(),
                selection: SelectionPolicy::TopK { k: 2 },
            },
        );
        let blocks = vec![
            Block::new(0, AUDI_BLOCK),
            Block::new(1, "Контакти: гр. София"),
            Block::new(2, BMW_BLOCK),
        ];
        let selection = ranker.rank_and_select(&blocks);
        assert_eq!(selection.container_ids(), vec![BlockId(0), BlockId(2)]);
        assert_eq!(selection.ranking.len(), 3);
        assert_eq!(selection.ranking[2].block_id, BlockId(1));

        // Completion order of the scoring step does not matter.
        let mut scored: Vec<ScoredBlock> = blocks.iter().map(|b| ranker.score_block(b)).collect();
        scored.reverse();
        assert_eq!(
            ranker.select(scored).container_ids(),
            vec![BlockId(0), BlockId(2)]
        );
    }

    #[test]
    fn nested_wrappers_yield_the_innermost_container() {
        let ranker = ContainerRanker::new(
            library(),
            RankerConfig {
                importance: ImportanceWeights::default(),
                selection: SelectionPolicy::Threshold { min_density: 2.0 },
            },
        );
        let blocks = vec![
            Block::new(0, format!("{AUDI_BLOCK} {BMW_BLOCK}")),
            Block::new(1, AUDI_BLOCK).with_parent(BlockId(0)),
            Block::new(2, BMW_BLOCK).with_parent(BlockId(0)),
        ];
        let selection = ranker.rank_and_select(&blocks);
        assert_eq!(selection.container_ids(), vec![BlockId(1), BlockId(2)]);
        assert!(selection.ranking.iter().any(|r| r.block_id == BlockId(0) && r.dominated));
    }

    #[test]
    fn wrappers_denser_than_each_listing_still_yield_the_listings() {
        let ranker = ContainerRanker::new(
            library(),
            RankerConfig {
                importance: ImportanceWeights::default(),
                selection: SelectionPolicy::Threshold { min_density: 2.5 },
            },
        );
        // The wrapper picks up a colour and a VIN that neither child has on its own.
        let blocks = vec![
            Block::new(0, format!("{AUDI_BLOCK} Черен {BMW_BLOCK} VIN: WBA12345678901234")),
            Block::new(1, AUDI_BLOCK).with_parent(BlockId(0)),
            Block::new(2, BMW_BLOCK).with_parent(BlockId(0)),
        ];
        let selection = ranker.rank_and_select(&blocks);
        assert_eq!(selection.container_ids(), vec![BlockId(1), BlockId(2)]);
        assert!(selection.ranking.iter().any(|r| r.block_id == BlockId(0) && r.dominated));
    }

    #[test]
    fn threshold_policy_can_select_nothing() {
        let ranker = ContainerRanker::new(
            library(),
            RankerConfig {
                importance: ImportanceWeights::default(),
                selection: SelectionPolicy::Threshold { min_density: 9.0 },
            },
        );
        let selection = ranker.rank_and_select(&[Block::new(0, BMW_BLOCK)]);
        assert!(selection.containers.is_empty());
        assert!(!selection.ranking[0].selected);
    }

    #[test]
    fn timed_out_blocks_never_rank() {
        let ranker = ContainerRanker::new(library(), RankerConfig::default());
        let scored = vec![ScoredBlock::timed_out(Block::new(0, BMW_BLOCK))];
        assert!(ranker.select(scored).containers.is_empty());
    }

    #[test]
    fn malformed_tables_fail_to_compile() {
        let table = PatternTable::from_yaml_str(
            r#"
fields:
  price:
    - id: broken
      pattern: '(?P<value>\d+'
      base_score: 0.5
      value_type: numeric
"#,
        )
        .expect("yaml parses");
        assert!(matches!(
            PatternLibrary::compile(table),
            Err(ExtractError::Pattern { .. })
        ));

        let table = PatternTable::from_yaml_str(
            r#"
fields:
  price:
    - id: both
      pattern: '\d+'
      literals: ['x']
      base_score: 0.5
      value_type: numeric
"#,
        )
        .expect("yaml parses");
        assert!(matches!(
            PatternLibrary::compile(table),
            Err(ExtractError::Matcher { .. })
        ));
    }

    #[test]
    fn context_keywords_raise_scores() {
        let lib = library();
        let plain = winner(&lib, "Черен", FieldKey::Color).expect("color");
        let labelled = winner(&lib, "Цвят: Черен", FieldKey::Color).expect("color");
        assert!(labelled.score > plain.score);
    }
}
