//! Core domain model and provenance types for carid.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "carid-core";

/// Stamped into every provenance record produced by the extraction stage.
pub const EXTRACTOR_VERSION: &str = "carid-extract/1";

/// Recognizable listing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Title,
    Price,
    Year,
    Mileage,
    EnginePower,
    EngineDisplacement,
    FuelType,
    Transmission,
    BodyType,
    Color,
    Location,
    Vin,
    Length,
    CurbWeight,
    FuelEconomy,
}

impl FieldKey {
    pub const ALL: [FieldKey; 15] = [
        FieldKey::Title,
        FieldKey::Price,
        FieldKey::Year,
        FieldKey::Mileage,
        FieldKey::EnginePower,
        FieldKey::EngineDisplacement,
        FieldKey::FuelType,
        FieldKey::Transmission,
        FieldKey::BodyType,
        FieldKey::Color,
        FieldKey::Location,
        FieldKey::Vin,
        FieldKey::Length,
        FieldKey::CurbWeight,
        FieldKey::FuelEconomy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKey::Title => "title",
            FieldKey::Price => "price",
            FieldKey::Year => "year",
            FieldKey::Mileage => "mileage",
            FieldKey::EnginePower => "engine_power",
            FieldKey::EngineDisplacement => "engine_displacement",
            FieldKey::FuelType => "fuel_type",
            FieldKey::Transmission => "transmission",
            FieldKey::BodyType => "body_type",
            FieldKey::Color => "color",
            FieldKey::Location => "location",
            FieldKey::Vin => "vin",
            FieldKey::Length => "length",
            FieldKey::CurbWeight => "curb_weight",
            FieldKey::FuelEconomy => "fuel_economy",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let needle = input.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|f| f.as_str() == needle)
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Language a pattern or enum token belongs to. `Any` marks language-neutral
/// recognizers (digits plus SI units, VINs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Bg,
    En,
    De,
    Fr,
    #[default]
    Any,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Bg => "bg",
            Language::En => "en",
            Language::De => "de",
            Language::Fr => "fr",
            Language::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Numeric,
    Enum,
    String,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Kw,
    Hp,
    Km,
    Mi,
    Mm,
    In,
    Kg,
    Lb,
    Cc,
    L,
    #[serde(rename = "l_per_100km")]
    LPer100Km,
    Mpg,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Kw => "kW",
            Unit::Hp => "HP",
            Unit::Km => "km",
            Unit::Mi => "mi",
            Unit::Mm => "mm",
            Unit::In => "in",
            Unit::Kg => "kg",
            Unit::Lb => "lb",
            Unit::Cc => "cc",
            Unit::L => "L",
            Unit::LPer100Km => "L/100km",
            Unit::Mpg => "mpg",
        }
    }
}

/// Document-order index of a block within its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Externally delimited page segment, as produced by a structural tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub text: String,
    /// Nearest enclosing block, if the tokenizer emitted nested segments.
    #[serde(default)]
    pub parent: Option<BlockId>,
    /// Link or identifier pointing at the listing this block describes.
    #[serde(default)]
    pub listing_ref: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

impl Block {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            id: BlockId(index),
            text: text.into(),
            parent: None,
            listing_ref: None,
            image_urls: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: BlockId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_listing_ref(mut self, listing_ref: impl Into<String>) -> Self {
        self.listing_ref = Some(listing_ref.into());
        self
    }
}

/// Byte range of a match inside the scanned block text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One scored pattern match for one field within one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub field: FieldKey,
    pub pattern_id: String,
    pub language: Language,
    /// Full matched text.
    pub raw: String,
    /// Captured value text (the `value` group, or the whole match).
    pub value: String,
    /// Captured `unit` group, e.g. a currency symbol.
    pub qualifier: Option<String>,
    pub unit: Option<Unit>,
    pub span: Span,
    pub score: f64,
    pub block_id: BlockId,
}

/// Provenance pointer attached to normalized values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub block_id: BlockId,
    pub pattern_id: String,
    pub language: Language,
    pub score: f64,
    pub snippet: String,
    pub extractor_version: String,
}

impl Provenance {
    pub fn from_candidate(candidate: &Candidate) -> Self {
        Self {
            block_id: candidate.block_id,
            pattern_id: candidate.pattern_id.clone(),
            language: candidate.language,
            score: candidate.score,
            snippet: candidate.raw.clone(),
            extractor_version: EXTRACTOR_VERSION.to_string(),
        }
    }
}

/// Normalized field wrapper with optional value + provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn with_value_and_provenance(value: T, provenance: Provenance) -> Self {
        Self {
            value: Some(value),
            provenance: Some(provenance),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn as_ref(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Bgn,
    Usd,
    Gbp,
    Chf,
    Pln,
    Ron,
}

impl Currency {
    pub fn iso_code(&self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Bgn => "BGN",
            Currency::Usd => "USD",
            Currency::Gbp => "GBP",
            Currency::Chf => "CHF",
            Currency::Pln => "PLN",
            Currency::Ron => "RON",
        }
    }

    pub fn from_iso(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "EUR" => Some(Currency::Eur),
            "BGN" => Some(Currency::Bgn),
            "USD" => Some(Currency::Usd),
            "GBP" => Some(Currency::Gbp),
            "CHF" => Some(Currency::Chf),
            "PLN" => Some(Currency::Pln),
            "RON" => Some(Currency::Ron),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Money {
    pub amount: f64,
    pub currency: Currency,
}

/// A single unit reading, either scraped verbatim or derived by an exact factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measured {
    pub value: f64,
    pub derived: bool,
}

/// Unit-aware quantity holding every unit the source exposed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Quantity {
    pub values: BTreeMap<Unit, Measured>,
}

impl Quantity {
    pub fn scraped(unit: Unit, value: f64) -> Self {
        let mut q = Self::default();
        q.insert_scraped(unit, value);
        q
    }

    /// Scraped readings always win over derived ones for the same unit.
    pub fn insert_scraped(&mut self, unit: Unit, value: f64) {
        self.values.insert(
            unit,
            Measured {
                value,
                derived: false,
            },
        );
    }

    /// Only fills a unit the source did not expose.
    pub fn insert_derived(&mut self, unit: Unit, value: f64) -> bool {
        if self.values.contains_key(&unit) {
            return false;
        }
        self.values.insert(
            unit,
            Measured {
                value,
                derived: true,
            },
        );
        true
    }

    pub fn value(&self, unit: Unit) -> Option<f64> {
        self.values.get(&unit).map(|m| m.value)
    }

    pub fn is_scraped(&self, unit: Unit) -> bool {
        self.values.get(&unit).is_some_and(|m| !m.derived)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuelType {
    Petrol,
    Diesel,
    Hybrid,
    PluginHybrid,
    Electric,
    Lpg,
    Cng,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transmission {
    Manual,
    Automatic,
    SemiAutomatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyType {
    Sedan,
    Coupe,
    Convertible,
    Hatchback,
    Estate,
    Suv,
    Pickup,
    Van,
    Minivan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Black,
    White,
    Blue,
    Red,
    Silver,
    Gray,
    Green,
    Yellow,
    Brown,
    Beige,
    Orange,
}

/// Enum token with no canonical mapping yet, kept for later table growth.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnmappedToken {
    pub field: FieldKey,
    pub language: Language,
    pub raw: String,
}

/// Typed, unit-aware listing fields produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub title: Field<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub price: Field<Money>,
    pub year: Field<i32>,
    pub mileage: Field<Quantity>,
    pub engine_power: Field<Quantity>,
    pub engine_displacement: Field<Quantity>,
    pub length: Field<Quantity>,
    pub curb_weight: Field<Quantity>,
    pub fuel_economy: Field<Quantity>,
    pub fuel_type: Field<FuelType>,
    pub transmission: Field<Transmission>,
    pub body_type: Field<BodyType>,
    pub color: Field<Color>,
    pub location: Field<String>,
    pub vin: Field<String>,
    #[serde(default)]
    pub extensions: Vec<UnmappedToken>,
}

impl NormalizedListing {
    pub fn present_field_count(&self) -> usize {
        [
            self.title.is_present(),
            self.price.is_present(),
            self.year.is_present(),
            self.mileage.is_present(),
            self.engine_power.is_present(),
            self.engine_displacement.is_present(),
            self.length.is_present(),
            self.curb_weight.is_present(),
            self.fuel_economy.is_present(),
            self.fuel_type.is_present(),
            self.transmission.is_present(),
            self.body_type.is_present(),
            self.color.is_present(),
            self.location.is_present(),
            self.vin.is_present(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

/// Natural identity of an ad: the site it was scraped from + the site's own id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdKey {
    pub source_site: String,
    pub source_id: String,
}

impl AdKey {
    pub fn new(source_site: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source_site: source_site.into(),
            source_id: source_id.into(),
        }
    }

    /// Deterministic record id so re-ingestion always lands on the same row.
    pub fn ad_id(&self) -> Uuid {
        let source = format!("carid-ad:{}:{}", self.source_site, self.source_id);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
    }
}

impl fmt::Display for AdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_site, self.source_id)
    }
}

/// One scraped advertisement, updated in place on re-scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdRecord {
    pub id: Uuid,
    pub key: AdKey,
    pub source_url: Option<String>,
    /// Raw resolved strings, exactly as scraped.
    pub raw: BTreeMap<FieldKey, String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Supplied by the external image pipeline; never computed here.
    #[serde(default)]
    pub image_checksums: BTreeSet<String>,
    pub normalized: NormalizedListing,
    pub content_hash: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AdRecord {
    pub fn new(key: AdKey, normalized: NormalizedListing, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: key.ad_id(),
            key,
            source_url: None,
            raw: BTreeMap::new(),
            image_urls: Vec::new(),
            image_checksums: BTreeSet::new(),
            normalized,
            content_hash: String::new(),
            first_seen: seen_at,
            last_seen: seen_at,
        }
    }

    pub fn profile(&self) -> VehicleProfile {
        let n = &self.normalized;
        VehicleProfile {
            vin: n.vin.value.clone(),
            title: n.title.value.clone(),
            make: n.make.clone(),
            model: n.model.clone(),
            year: n.year.value,
            price: n.price.value,
            mileage_km: n.mileage.value.as_ref().and_then(|q| q.value(Unit::Km)),
            power_hp: n.engine_power.value.as_ref().and_then(|q| q.value(Unit::Hp)),
            power_kw: n.engine_power.value.as_ref().and_then(|q| q.value(Unit::Kw)),
            fuel_type: n.fuel_type.value,
            transmission: n.transmission.value,
            body_type: n.body_type.value,
            color: n.color.value,
            location: n.location.value.clone(),
            image_checksums: self.image_checksums.clone(),
            observed_at: Some(self.last_seen),
        }
    }
}

/// Flattened comparison view of an ad or of a vehicle's representative.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleProfile {
    pub vin: Option<String>,
    pub title: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub price: Option<Money>,
    pub mileage_km: Option<f64>,
    /// Power is kept per unit as scraped; hp and kW are never converted.
    pub power_hp: Option<f64>,
    #[serde(default)]
    pub power_kw: Option<f64>,
    pub fuel_type: Option<FuelType>,
    pub transmission: Option<Transmission>,
    pub body_type: Option<BodyType>,
    pub color: Option<Color>,
    pub location: Option<String>,
    #[serde(default)]
    pub image_checksums: BTreeSet<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Active,
    Tombstoned,
}

/// Resolved identity of one physical car.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalVehicle {
    pub id: Uuid,
    pub vin: Option<String>,
    /// `None` means the variant is unknown.
    pub variant: Option<String>,
    pub scope: String,
    pub representative: VehicleProfile,
    pub members: BTreeSet<Uuid>,
    pub status: VehicleStatus,
    pub merged_into: Option<Uuid>,
    /// Bumped on every mutation; used to detect stale merge decisions.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalVehicle {
    pub fn is_active(&self) -> bool {
        self.status == VehicleStatus::Active
    }
}

/// Cluster membership state of a single ad.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Unlinked,
    CandidateMatched {
        vehicle_id: Uuid,
        score: f64,
    },
    Linked {
        vehicle_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EdgeEndpoint {
    Ad(Uuid),
    Vehicle(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Veto {
    VinMismatch,
    YearMismatch,
}

/// Per-signal contributions; `None` means the signal was unavailable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub vin_match: bool,
    pub image: Option<f64>,
    pub text: Option<f64>,
    pub price: Option<f64>,
    pub mileage: Option<f64>,
    pub year: Option<f64>,
    pub location: Option<f64>,
    pub veto: Option<Veto>,
}

/// Append-only pairwise comparison record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub id: Uuid,
    pub a: EdgeEndpoint,
    pub b: EdgeEndpoint,
    pub score: f64,
    pub breakdown: SignalBreakdown,
    pub recorded_at: DateTime<Utc>,
}

/// How a lone separator followed by exactly three digits is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberStyle {
    /// Whole quantities (prices, mileage): `109.999` is one hundred nine thousand.
    Integer,
    /// Fractional quantities (litres, L/100km): `4.395` stays four point three.
    Decimal,
}

/// Parse a number written with locale-specific thousand/decimal separators.
pub fn parse_locale_number(raw: &str, style: NumberStyle) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\u{2009}' | '\'' | '\u{2019}'))
        .collect();
    if cleaned.is_empty()
        || !cleaned
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == ',')
        || !cleaned.chars().any(|c| c.is_ascii_digit())
    {
        return None;
    }

    let dots = cleaned.matches('.').count();
    let commas = cleaned.matches(',').count();
    let canonical = match (dots, commas) {
        (0, 0) => cleaned,
        (d, c) if d > 0 && c > 0 => {
            let last_dot = cleaned.rfind('.').unwrap_or(0);
            let last_comma = cleaned.rfind(',').unwrap_or(0);
            let (decimal, grouping) = if last_dot > last_comma { ('.', ',') } else { (',', '.') };
            if cleaned.matches(decimal).count() > 1 {
                return None;
            }
            cleaned
                .chars()
                .filter(|ch| *ch != grouping)
                .map(|ch| if ch == decimal { '.' } else { ch })
                .collect()
        }
        _ => {
            let sep = if dots > 0 { '.' } else { ',' };
            let occurrences = dots.max(commas);
            let fraction_len = cleaned
                .rsplit(sep)
                .next()
                .map(str::len)
                .unwrap_or_default();
            let is_grouping =
                occurrences > 1 || (style == NumberStyle::Integer && fraction_len == 3);
            if is_grouping {
                cleaned.chars().filter(|ch| *ch != sep).collect()
            } else {
                cleaned.replace(sep, ".")
            }
        }
    };

    canonical.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_numbers_strip_grouping_separators() {
        assert_eq!(parse_locale_number("132 885", NumberStyle::Integer), Some(132885.0));
        assert_eq!(parse_locale_number("132\u{a0}885", NumberStyle::Integer), Some(132885.0));
        assert_eq!(parse_locale_number("109.999", NumberStyle::Integer), Some(109999.0));
        assert_eq!(parse_locale_number("1,234,567", NumberStyle::Integer), Some(1234567.0));
        assert_eq!(parse_locale_number("1.234,56", NumberStyle::Integer), Some(1234.56));
        assert_eq!(parse_locale_number("1,234.56", NumberStyle::Decimal), Some(1234.56));
    }

    #[test]
    fn locale_numbers_keep_decimal_fractions() {
        assert_eq!(parse_locale_number("4.4", NumberStyle::Decimal), Some(4.4));
        assert_eq!(parse_locale_number("16,9", NumberStyle::Decimal), Some(16.9));
        assert_eq!(parse_locale_number("4.395", NumberStyle::Decimal), Some(4.395));
        assert_eq!(parse_locale_number("12,5", NumberStyle::Integer), Some(12.5));
    }

    #[test]
    fn locale_numbers_reject_garbage() {
        assert_eq!(parse_locale_number("", NumberStyle::Integer), None);
        assert_eq!(parse_locale_number("abc", NumberStyle::Integer), None);
        assert_eq!(parse_locale_number("1.2.3,4,5", NumberStyle::Integer), None);
        assert_eq!(parse_locale_number(".,", NumberStyle::Integer), None);
    }

    #[test]
    fn ad_ids_are_deterministic_per_key() {
        let a = AdKey::new("mobile.bg", "11712345");
        let b = AdKey::new("mobile.bg", "11712345");
        let c = AdKey::new("autoscout24", "11712345");
        assert_eq!(a.ad_id(), b.ad_id());
        assert_ne!(a.ad_id(), c.ad_id());
    }

    #[test]
    fn kilowatt_only_power_reaches_the_profile() {
        let listing = NormalizedListing {
            engine_power: Field {
                value: Some(Quantity::scraped(Unit::Kw, 460.0)),
                provenance: None,
            },
            ..NormalizedListing::default()
        };
        let seen = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let profile = AdRecord::new(AdKey::new("autoscout24", "77"), listing, seen).profile();
        assert_eq!(profile.power_kw, Some(460.0));
        assert_eq!(profile.power_hp, None);
    }

    #[test]
    fn derived_units_never_overwrite_scraped_values() {
        let mut q = Quantity::scraped(Unit::Km, 113000.0);
        q.insert_scraped(Unit::Mi, 70215.0);
        assert!(!q.insert_derived(Unit::Mi, 70214.5));
        assert_eq!(q.value(Unit::Mi), Some(70215.0));
        assert!(q.is_scraped(Unit::Mi));
    }

    #[test]
    fn field_keys_parse_from_cli_spelling() {
        assert_eq!(FieldKey::parse("engine-power"), Some(FieldKey::EnginePower));
        assert_eq!(FieldKey::parse("Price"), Some(FieldKey::Price));
        assert_eq!(FieldKey::parse("nope"), None);
    }
}
