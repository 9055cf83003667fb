//! Multi-signal similarity between a record and a vehicle representative.

use std::collections::BTreeSet;

use carid_core::{SignalBreakdown, VehicleProfile, Veto};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

use crate::ClusterError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalWeights {
    pub image: f64,
    pub text: f64,
    pub price: f64,
    pub mileage: f64,
    pub year: f64,
    pub location: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            image: 0.30,
            text: 0.25,
            price: 0.15,
            mileage: 0.15,
            year: 0.05,
            location: 0.10,
        }
    }
}

impl SignalWeights {
    fn total(&self) -> f64 {
        self.image + self.text + self.price + self.mileage + self.year + self.location
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityConfig {
    #[serde(default)]
    pub weights: SignalWeights,
    /// Relative price difference (percent) at which the price signal reaches zero.
    pub price_tolerance_pct: f64,
    /// Absolute mileage difference (km) at which the mileage signal reaches zero.
    pub mileage_tolerance_km: f64,
    /// Share of total signal weight that must be available for a full-strength score.
    pub min_coverage: f64,
    pub tau_low: f64,
    pub tau_high: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            price_tolerance_pct: 10.0,
            mileage_tolerance_km: 5000.0,
            min_coverage: 0.5,
            tau_low: 0.6,
            tau_high: 0.85,
        }
    }
}

impl SimilarityConfig {
    pub fn validate(&self) -> Result<(), ClusterError> {
        let w = &self.weights;
        let weights = [w.image, w.text, w.price, w.mileage, w.year, w.location];
        if weights.iter().any(|x| !x.is_finite() || *x < 0.0) || w.total() <= 0.0 {
            return Err(ClusterError::Config(
                "signal weights must be non-negative with a positive sum".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.tau_low)
            || !(0.0..=1.0).contains(&self.tau_high)
            || self.tau_low >= self.tau_high
        {
            return Err(ClusterError::Config(format!(
                "thresholds must satisfy 0 <= tau_low ({}) < tau_high ({}) <= 1",
                self.tau_low, self.tau_high
            )));
        }
        if self.price_tolerance_pct <= 0.0
            || self.mileage_tolerance_km <= 0.0
            || !(self.min_coverage > 0.0 && self.min_coverage <= 1.0)
        {
            return Err(ClusterError::Config(
                "tolerances must be positive and min_coverage in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScore {
    pub score: f64,
    pub breakdown: SignalBreakdown,
}

#[derive(Debug, Clone)]
pub struct SimilarityScorer {
    config: SimilarityConfig,
}

impl SimilarityScorer {
    pub fn new(config: SimilarityConfig) -> Result<Self, ClusterError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    /// Score in `[0, 1]`. Equal VINs short-circuit to 1; differing VINs or a
    /// year mismatch veto to 0. Otherwise the weighted mean of the signals
    /// both sides can provide, damped when too little weight was available.
    pub fn score(&self, a: &VehicleProfile, b: &VehicleProfile) -> SimilarityScore {
        let mut breakdown = SignalBreakdown::default();

        if let (Some(va), Some(vb)) = (a.vin.as_deref(), b.vin.as_deref()) {
            if va.trim().eq_ignore_ascii_case(vb.trim()) {
                breakdown.vin_match = true;
                return SimilarityScore {
                    score: 1.0,
                    breakdown,
                };
            }
            breakdown.veto = Some(Veto::VinMismatch);
            return SimilarityScore {
                score: 0.0,
                breakdown,
            };
        }

        if let (Some(ya), Some(yb)) = (a.year, b.year) {
            if ya != yb {
                breakdown.year = Some(0.0);
                breakdown.veto = Some(Veto::YearMismatch);
                return SimilarityScore {
                    score: 0.0,
                    breakdown,
                };
            }
            breakdown.year = Some(1.0);
        }

        breakdown.image = image_overlap(&a.image_checksums, &b.image_checksums);
        breakdown.text = text_similarity(a, b);
        breakdown.price = match (a.price, b.price) {
            (Some(pa), Some(pb)) if pa.currency == pb.currency => {
                let high = pa.amount.max(pb.amount);
                let diff_pct = if high > 0.0 {
                    (pa.amount - pb.amount).abs() / high * 100.0
                } else {
                    0.0
                };
                Some((1.0 - diff_pct / self.config.price_tolerance_pct).max(0.0))
            }
            _ => None,
        };
        breakdown.mileage = match (a.mileage_km, b.mileage_km) {
            (Some(ma), Some(mb)) => {
                Some((1.0 - (ma - mb).abs() / self.config.mileage_tolerance_km).max(0.0))
            }
            _ => None,
        };
        breakdown.location = match (a.location.as_deref(), b.location.as_deref()) {
            (Some(la), Some(lb)) => Some(jaro_winkler(
                &la.trim().to_lowercase(),
                &lb.trim().to_lowercase(),
            )),
            _ => None,
        };

        let w = &self.config.weights;
        let signals = [
            (breakdown.image, w.image),
            (breakdown.text, w.text),
            (breakdown.price, w.price),
            (breakdown.mileage, w.mileage),
            (breakdown.year, w.year),
            (breakdown.location, w.location),
        ];
        let (weighted, available) = signals
            .iter()
            .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
            .fold((0.0, 0.0), |(sum, avail), (v, weight)| (sum + v, avail + weight));
        if available <= 0.0 {
            return SimilarityScore {
                score: 0.0,
                breakdown,
            };
        }
        let coverage = (available / (self.config.min_coverage * w.total())).min(1.0);
        let score = (weighted / available * coverage).clamp(0.0, 1.0);
        SimilarityScore { score, breakdown }
    }
}

fn image_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<f64> {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return None;
    }
    Some(a.intersection(b).count() as f64 / smaller as f64)
}

fn tokens(profile: &VehicleProfile) -> BTreeSet<String> {
    [
        profile.title.as_deref(),
        profile.make.as_deref(),
        profile.model.as_deref(),
    ]
    .into_iter()
    .flatten()
    .flat_map(|text| {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    })
    .collect()
}

/// Token Jaccard blended with Jaro-Winkler on the titles.
fn text_similarity(a: &VehicleProfile, b: &VehicleProfile) -> Option<f64> {
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() || tb.is_empty() {
        return None;
    }
    let union = ta.union(&tb).count() as f64;
    let jaccard = ta.intersection(&tb).count() as f64 / union;
    match (a.title.as_deref(), b.title.as_deref()) {
        (Some(x), Some(y)) => {
            let jw = jaro_winkler(&x.to_lowercase(), &y.to_lowercase());
            Some((jaccard + jw) / 2.0)
        }
        _ => Some(jaccard),
    }
}
