//! Record normalizer: resolved raw strings -> typed, unit-aware listing fields.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use carid_core::{
    parse_locale_number, BodyType, Candidate, Color, Currency, Field, FieldKey, FuelType,
    Language, Money, NormalizedListing, NumberStyle, Provenance, Quantity, Transmission, Unit,
    UnmappedToken,
};
use carid_extract::{number_style, PatternLibrary, ResolvedField};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "carid-normalize";

const BUILTIN_TABLES: &str = include_str!("../../../rules/normalize.yaml");

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("failed to parse normalization tables: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to read normalization tables {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Raw token (lowercase) -> canonical value, per language.
pub type EnumTable<T> = BTreeMap<Language, BTreeMap<String, T>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizeTables {
    pub currencies: BTreeMap<String, Currency>,
    #[serde(default)]
    pub makes: BTreeMap<String, String>,
    #[serde(default)]
    pub fuel_type: EnumTable<FuelType>,
    #[serde(default)]
    pub transmission: EnumTable<Transmission>,
    #[serde(default)]
    pub body_type: EnumTable<BodyType>,
    #[serde(default)]
    pub color: EnumTable<Color>,
}

impl NormalizeTables {
    pub fn builtin() -> Result<Self, NormalizeError> {
        Self::from_yaml_str(BUILTIN_TABLES)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, NormalizeError> {
        let mut tables: NormalizeTables = serde_yaml::from_str(raw)?;
        tables.currencies = tables
            .currencies
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .collect();
        tables.makes = tables
            .makes
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .collect();
        Ok(tables)
    }

    pub fn load(path: &Path) -> Result<Self, NormalizeError> {
        let raw = std::fs::read_to_string(path).map_err(|source| NormalizeError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn currency(&self, symbol: &str) -> Option<Currency> {
        let key = symbol.trim().to_lowercase();
        self.currencies
            .get(&key)
            .or_else(|| self.currencies.get(key.trim_end_matches('.')))
            .copied()
            .or_else(|| Currency::from_iso(&key))
    }
}

/// Look a token up in its own language first, then the hint, then any table.
fn lookup_enum<T: Copy>(
    table: &EnumTable<T>,
    token: &str,
    language: Language,
    hint: Option<Language>,
) -> Option<T> {
    let key = token.trim().to_lowercase();
    let preferred = [Some(language), hint, Some(Language::Any)];
    preferred
        .into_iter()
        .flatten()
        .find_map(|lang| table.get(&lang).and_then(|t| t.get(&key)))
        .or_else(|| table.values().find_map(|t| t.get(&key)))
        .copied()
}

/// Parse an amount with an attached currency symbol or code, e.g. `132 885 €`.
pub fn parse_money(raw: &str, tables: &NormalizeTables) -> Option<Money> {
    let first = raw.find(|c: char| c.is_ascii_digit())?;
    let last = raw.rfind(|c: char| c.is_ascii_digit())?;
    let amount = parse_locale_number(&raw[first..=last], NumberStyle::Integer)?;
    let symbol = format!("{} {}", &raw[..first], &raw[last + 1..]);
    let currency = tables.currency(symbol.trim())?;
    Some(Money { amount, currency })
}

/// Exact conversion factor between two units of the same dimension.
///
/// Power (metric vs mechanical hp) and fuel economy (US vs imperial mpg) are
/// deliberately absent.
pub fn exact_factor(from: Unit, to: Unit) -> Option<f64> {
    let per = |unit: Unit| match unit {
        Unit::Mi => Some((Unit::Km, 1.609344)),
        Unit::In => Some((Unit::Mm, 25.4)),
        Unit::Lb => Some((Unit::Kg, 0.45359237)),
        Unit::L => Some((Unit::Cc, 1000.0)),
        _ => None,
    };
    match (per(from), per(to)) {
        (Some((base, f)), _) if base == to => Some(f),
        (_, Some((base, f))) if base == from => Some(1.0 / f),
        _ => None,
    }
}

/// Units that describe the same physical dimension.
pub fn same_dimension(a: Unit, b: Unit) -> bool {
    fn dimension(unit: Unit) -> u8 {
        match unit {
            Unit::Km | Unit::Mi => 0,
            Unit::Mm | Unit::In => 1,
            Unit::Kg | Unit::Lb => 2,
            Unit::Cc | Unit::L => 3,
            Unit::Kw | Unit::Hp => 4,
            Unit::LPer100Km | Unit::Mpg => 5,
        }
    }
    dimension(a) == dimension(b)
}

fn counterpart(unit: Unit) -> Option<Unit> {
    match unit {
        Unit::Km => Some(Unit::Mi),
        Unit::Mi => Some(Unit::Km),
        Unit::Mm => Some(Unit::In),
        Unit::In => Some(Unit::Mm),
        Unit::Kg => Some(Unit::Lb),
        Unit::Lb => Some(Unit::Kg),
        Unit::Cc => Some(Unit::L),
        Unit::L => Some(Unit::Cc),
        _ => None,
    }
}

/// Raw resolved strings, exactly as scraped, for the AdRecord.
pub fn raw_fields(resolved: &BTreeMap<FieldKey, ResolvedField>) -> BTreeMap<FieldKey, String> {
    resolved
        .iter()
        .filter_map(|(field, r)| r.raw().map(|raw| (*field, raw.to_string())))
        .collect()
}

pub struct RecordNormalizer {
    library: Arc<PatternLibrary>,
    tables: Arc<NormalizeTables>,
}

impl RecordNormalizer {
    pub fn new(library: Arc<PatternLibrary>, tables: Arc<NormalizeTables>) -> Self {
        Self { library, tables }
    }

    pub fn tables(&self) -> &NormalizeTables {
        &self.tables
    }

    pub fn normalize(
        &self,
        resolved: &BTreeMap<FieldKey, ResolvedField>,
        language_hint: Option<Language>,
    ) -> NormalizedListing {
        let mut listing = NormalizedListing::default();
        let winner = |field: FieldKey| -> Option<&Candidate> {
            let candidate = resolved.get(&field)?.winner.as_ref()?;
            if self.in_range(candidate) {
                Some(candidate)
            } else {
                debug!(field = %field, raw = %candidate.raw, "normalized value outside validator range");
                None
            }
        };

        if let Some(c) = winner(FieldKey::Title) {
            let title = collapse(&c.value);
            let (make, model) = self.split_title(&title);
            listing.make = make;
            listing.model = model;
            listing.title = provenanced(title, c);
        }
        if let Some(c) = winner(FieldKey::Price) {
            let money = match c.qualifier.as_deref() {
                Some(symbol) => parse_money(&format!("{} {symbol}", c.value), &self.tables),
                None => parse_money(&c.raw, &self.tables),
            };
            if let Some(money) = money {
                listing.price = provenanced(money, c);
            }
        }
        if let Some(c) = winner(FieldKey::Year) {
            if let Ok(year) = c.value.trim().parse::<i32>() {
                listing.year = provenanced(year, c);
            }
        }

        listing.mileage = self.quantity(resolved, FieldKey::Mileage);
        listing.engine_power = self.quantity(resolved, FieldKey::EnginePower);
        listing.engine_displacement = self.quantity(resolved, FieldKey::EngineDisplacement);
        listing.length = self.quantity(resolved, FieldKey::Length);
        listing.curb_weight = self.quantity(resolved, FieldKey::CurbWeight);
        listing.fuel_economy = self.quantity(resolved, FieldKey::FuelEconomy);

        let mut extensions = Vec::new();
        listing.fuel_type = self.enumerated(
            winner(FieldKey::FuelType),
            &self.tables.fuel_type,
            language_hint,
            &mut extensions,
        );
        listing.transmission = self.enumerated(
            winner(FieldKey::Transmission),
            &self.tables.transmission,
            language_hint,
            &mut extensions,
        );
        listing.body_type = self.enumerated(
            winner(FieldKey::BodyType),
            &self.tables.body_type,
            language_hint,
            &mut extensions,
        );
        listing.color = self.enumerated(
            winner(FieldKey::Color),
            &self.tables.color,
            language_hint,
            &mut extensions,
        );
        extensions.sort();
        extensions.dedup();
        listing.extensions = extensions;

        if let Some(c) = winner(FieldKey::Location) {
            listing.location = provenanced(collapse(&c.value), c);
        }
        if let Some(c) = winner(FieldKey::Vin) {
            listing.vin = provenanced(c.value.trim().to_uppercase(), c);
        }

        let missing: Vec<&str> = FieldKey::ALL
            .iter()
            .filter(|f| !is_present(&listing, **f))
            .map(FieldKey::as_str)
            .collect();
        if !missing.is_empty() {
            info!(
                present = listing.present_field_count(),
                missing = ?missing,
                "listing normalized with null fields"
            );
        }
        listing
    }

    fn in_range(&self, candidate: &Candidate) -> bool {
        self.library
            .descriptor(candidate.field, &candidate.pattern_id)
            .map_or(true, |d| d.accepts(&candidate.value))
    }

    /// Scraped reading of the winner, plus any other scraped unit of the same
    /// dimension; a missing counterpart is derived only by an exact factor.
    fn quantity(
        &self,
        resolved: &BTreeMap<FieldKey, ResolvedField>,
        field: FieldKey,
    ) -> Field<Quantity> {
        let Some(r) = resolved.get(&field) else {
            return Field::empty();
        };
        let Some(winner) = r.winner.as_ref().filter(|c| self.in_range(c)) else {
            return Field::empty();
        };
        let Some((unit, value)) = reading(winner) else {
            return Field::empty();
        };

        let mut quantity = Quantity::scraped(unit, value);
        for alternate in &r.alternates {
            let Some((alt_unit, alt_value)) = reading(alternate) else {
                continue;
            };
            if quantity.values.contains_key(&alt_unit)
                || !same_dimension(unit, alt_unit)
                || !self.in_range(alternate)
            {
                continue;
            }
            quantity.insert_scraped(alt_unit, alt_value);
        }

        let scraped: Vec<(Unit, f64)> = quantity
            .values
            .iter()
            .map(|(u, m)| (*u, m.value))
            .collect();
        for (source, value) in scraped {
            if let Some(target) = counterpart(source) {
                if let Some(factor) = exact_factor(source, target) {
                    quantity.insert_derived(target, value * factor);
                }
            }
        }
        provenanced(quantity, winner)
    }

    fn enumerated<T: Copy>(
        &self,
        winner: Option<&Candidate>,
        table: &EnumTable<T>,
        hint: Option<Language>,
        extensions: &mut Vec<UnmappedToken>,
    ) -> Field<T> {
        let Some(c) = winner else {
            return Field::empty();
        };
        match lookup_enum(table, &c.value, c.language, hint) {
            Some(value) => provenanced(value, c),
            None => {
                debug!(field = %c.field, raw = %c.value, "unmapped enum token kept as extension");
                extensions.push(UnmappedToken {
                    field: c.field,
                    language: c.language,
                    raw: c.value.trim().to_string(),
                });
                Field::empty()
            }
        }
    }

    /// Leading recognised make (longest alias first) and the token after it.
    pub fn split_title(&self, title: &str) -> (Option<String>, Option<String>) {
        let folded = fold_chars(title);
        let mut aliases: Vec<(&String, &String)> = self.tables.makes.iter().collect();
        aliases.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()).then(a.0.cmp(b.0)));
        for (alias, canonical) in aliases {
            let alias: Vec<char> = alias.chars().collect();
            if folded.len() < alias.len() || folded[..alias.len()] != alias[..] {
                continue;
            }
            let boundary = title
                .char_indices()
                .nth(alias.len())
                .map_or(title.len(), |(index, _)| index);
            let rest = &title[boundary..];
            if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
                continue;
            }
            let model = rest.split_whitespace().next().map(str::to_string);
            return (Some(canonical.clone()), model);
        }
        (None, None)
    }
}

fn reading(candidate: &Candidate) -> Option<(Unit, f64)> {
    let unit = candidate.unit?;
    let value = parse_locale_number(&candidate.value, number_style(candidate.field, Some(unit)))?;
    Some((unit, value))
}

fn provenanced<T>(value: T, candidate: &Candidate) -> Field<T> {
    Field::with_value_and_provenance(value, Provenance::from_candidate(candidate))
}

/// Lowercase one char at a time, keeping the char count of the input.
/// A char with a multi-char lowercase form (`İ` -> `i̇`) folds to its first char.
fn fold_chars(text: &str) -> Vec<char> {
    text.chars()
        .map(|c| c.to_lowercase().next().unwrap_or(c))
        .collect()
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_present(listing: &NormalizedListing, field: FieldKey) -> bool {
    match field {
        FieldKey::Title => listing.title.is_present(),
        FieldKey::Price => listing.price.is_present(),
        FieldKey::Year => listing.year.is_present(),
        FieldKey::Mileage => listing.mileage.is_present(),
        FieldKey::EnginePower => listing.engine_power.is_present(),
        FieldKey::EngineDisplacement => listing.engine_displacement.is_present(),
        FieldKey::FuelType => listing.fuel_type.is_present(),
        FieldKey::Transmission => listing.transmission.is_present(),
        FieldKey::BodyType => listing.body_type.is_present(),
        FieldKey::Color => listing.color.is_present(),
        FieldKey::Location => listing.location.is_present(),
        FieldKey::Vin => listing.vin.is_present(),
        FieldKey::Length => listing.length.is_present(),
        FieldKey::CurbWeight => listing.curb_weight.is_present(),
        FieldKey::FuelEconomy => listing.fuel_economy.is_present(),
    }
}
