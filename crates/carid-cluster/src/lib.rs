//! Incremental clustering of ad records into canonical vehicles.
//!
//! Every merge decision for a make/model scope runs under that scope's lock:
//! the pool is read, a plan is decided, and the plan is committed only if the
//! pieces of state it depended on are unchanged. A stale plan is discarded and
//! decided again from a fresh read.
//!
//! An unknown make or model is compatible with any value, so a plan reads every
//! compatible scope and is only committed while all of them are unchanged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use carid_core::{
    AdKey, AdRecord, CanonicalVehicle, EdgeEndpoint, LinkState, SimilarityEdge, VehicleProfile,
    VehicleStatus,
};
use carid_storage::{AdminAuthorization, AuditAction, AuditEntry, AuditSink, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod similarity;
pub mod variant;

pub use similarity::{SignalWeights, SimilarityConfig, SimilarityScore, SimilarityScorer};
pub use variant::{BoundedLookup, LookupError, StaticVariantTable, VariantLookup, VariantRule};

pub const CRATE_NAME: &str = "carid-cluster";

const UNKNOWN_SCOPE_PART: &str = "?";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster scope {scope} still contended after {attempts} attempts")]
    Contention { scope: String, attempts: u32 },
    #[error("unknown vehicle {0}")]
    UnknownVehicle(Uuid),
    #[error("unknown ad {0}")]
    UnknownAd(Uuid),
    #[error("ad {0} is not awaiting review")]
    NotPending(Uuid),
    #[error("ad {0} is not linked to a vehicle")]
    NotLinked(Uuid),
    #[error("ad {0} is the only member of its vehicle")]
    SoleMember(Uuid),
    #[error("vehicle {0} is tombstoned")]
    Tombstoned(Uuid),
    #[error("cannot merge vehicle {0} into itself")]
    SameVehicle(Uuid),
    #[error("vehicles {survivor} and {absorbed} claim different VINs")]
    VinConflict { survivor: Uuid, absorbed: Uuid },
    #[error("ad {ad} shares VIN {vin} with other members of vehicle {vehicle}")]
    SharedVin { ad: Uuid, vehicle: Uuid, vin: String },
    #[error("invalid cluster configuration: {0}")]
    Config(String),
    #[error("audit trail write failed: {0}")]
    Audit(#[from] StorageError),
    #[error("snapshotting cluster state: {0}")]
    Snapshot(#[from] serde_json::Error),
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub similarity: SimilarityConfig,
    /// Decide/commit rounds before a contended scope gives up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            similarity: SimilarityConfig::default(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Lock scope for an ad or vehicle: lowercased `make/model`, `?` when unknown.
///
/// Variants are compared inside compatible scopes, since an unknown variant
/// is compatible with every variant of the same model.
pub fn scope_key(profile: &VehicleProfile) -> String {
    let part = |value: Option<&str>| {
        value
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| UNKNOWN_SCOPE_PART.to_string())
    };
    format!(
        "{}/{}",
        part(profile.make.as_deref()),
        part(profile.model.as_deref())
    )
}

/// Two scopes can describe the same car unless a known make or a known model differs.
pub fn scopes_compatible(a: &str, b: &str) -> bool {
    let parts = |scope: &str| {
        scope
            .split_once('/')
            .map(|(make, model)| (make.to_string(), model.to_string()))
            .unwrap_or_else(|| (scope.to_string(), UNKNOWN_SCOPE_PART.to_string()))
    };
    let ((make_a, model_a), (make_b, model_b)) = (parts(a), parts(b));
    let part = |x: &str, y: &str| x == y || x == UNKNOWN_SCOPE_PART || y == UNKNOWN_SCOPE_PART;
    part(&make_a, &make_b) && part(&model_a, &model_b)
}

fn normalize_vin(vin: &str) -> String {
    vin.trim().to_ascii_uppercase()
}

fn variant_compatible(vehicle: Option<&str>, ad: Option<&str>) -> bool {
    match (vehicle, ad) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assignment {
    Created { vehicle_id: Uuid },
    AutoLinked { vehicle_id: Uuid, score: f64 },
    Pending { vehicle_id: Uuid, score: f64 },
    Refreshed { vehicle_id: Uuid },
}

impl Assignment {
    pub fn vehicle_id(&self) -> Uuid {
        match self {
            Assignment::Created { vehicle_id }
            | Assignment::AutoLinked { vehicle_id, .. }
            | Assignment::Pending { vehicle_id, .. }
            | Assignment::Refreshed { vehicle_id } => *vehicle_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignOutcome {
    pub ad_id: Uuid,
    pub assignment: Assignment,
    /// Vehicles absorbed by a VIN surfacing during this assignment.
    pub tombstoned: Vec<Uuid>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub ad_id: Uuid,
    pub key: AdKey,
    pub vehicle_id: Uuid,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Accept the proposed vehicle.
    Link,
    /// Refuse it; the ad founds its own vehicle.
    Reject,
}

#[derive(Debug, Clone)]
struct AdEntry {
    key: AdKey,
    scope: String,
    variant: Option<String>,
    profile: VehicleProfile,
    state: LinkState,
    version: u64,
}

#[derive(Debug, Clone, Default)]
struct Pool {
    vehicles: BTreeMap<Uuid, CanonicalVehicle>,
    /// Founding order; the older vehicle survives automatic merges.
    founded: HashMap<Uuid, u64>,
    next_seq: u64,
    vin_index: BTreeMap<String, Uuid>,
    ads: BTreeMap<Uuid, AdEntry>,
    generations: HashMap<String, u64>,
}

enum VinClaim {
    Held(Uuid),
    Merged { survivor: Uuid, absorbed: Uuid },
}

impl Pool {
    fn generation(&self, scope: &str) -> u64 {
        self.generations.get(scope).copied().unwrap_or(0)
    }

    /// Generation of every known scope an ad in `scope` may be compared against.
    fn compatible_generations(&self, scope: &str) -> BTreeMap<String, u64> {
        let mut seen: BTreeMap<String, u64> = self
            .generations
            .iter()
            .filter(|(other, _)| scopes_compatible(other, scope))
            .map(|(other, generation)| (other.clone(), *generation))
            .collect();
        seen.entry(scope.to_string())
            .or_insert_with(|| self.generation(scope));
        seen
    }

    fn touch(&mut self, scope: &str) {
        *self.generations.entry(scope.to_string()).or_default() += 1;
    }

    fn seq(&self, vehicle_id: Uuid) -> u64 {
        self.founded.get(&vehicle_id).copied().unwrap_or(u64::MAX)
    }

    fn observe_ad(
        &mut self,
        record: &AdRecord,
        profile: VehicleProfile,
        scope: &str,
        variant: Option<&str>,
    ) {
        let entry = self.ads.entry(record.id).or_insert_with(|| AdEntry {
            key: record.key.clone(),
            scope: scope.to_string(),
            variant: None,
            profile: VehicleProfile::default(),
            state: LinkState::Unlinked,
            version: 0,
        });
        let previous = std::mem::replace(&mut entry.scope, scope.to_string());
        entry.profile = profile;
        if variant.is_some() {
            entry.variant = variant.map(str::to_string);
        }
        entry.version += 1;
        self.touch(&previous);
        self.touch(scope);
    }

    fn set_state(&mut self, ad_id: Uuid, state: LinkState) {
        let Some(entry) = self.ads.get_mut(&ad_id) else {
            return;
        };
        entry.state = state;
        entry.version += 1;
        let scope = entry.scope.clone();
        self.touch(&scope);
    }

    fn found(&mut self, ad_id: Uuid, now: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let (scope, variant) = self
            .ads
            .get(&ad_id)
            .map(|a| (a.scope.clone(), a.variant.clone()))
            .unwrap_or_else(|| (format!("{UNKNOWN_SCOPE_PART}/{UNKNOWN_SCOPE_PART}"), None));
        self.vehicles.insert(
            id,
            CanonicalVehicle {
                id,
                vin: None,
                variant,
                scope,
                representative: VehicleProfile::default(),
                members: BTreeSet::from([ad_id]),
                status: VehicleStatus::Active,
                merged_into: None,
                revision: 0,
                created_at: now,
                updated_at: now,
            },
        );
        self.founded.insert(id, self.next_seq);
        self.next_seq += 1;
        self.set_state(ad_id, LinkState::Linked { vehicle_id: id });
        self.recompute(id, now);
        id
    }

    fn attach(&mut self, vehicle_id: Uuid, ad_id: Uuid, now: DateTime<Utc>) {
        let variant = self.ads.get(&ad_id).and_then(|a| a.variant.clone());
        if let Some(vehicle) = self.vehicles.get_mut(&vehicle_id) {
            vehicle.members.insert(ad_id);
            if vehicle.variant.is_none() {
                vehicle.variant = variant;
            }
        }
        self.set_state(ad_id, LinkState::Linked { vehicle_id });
        self.recompute(vehicle_id, now);
    }

    fn detach(&mut self, vehicle_id: Uuid, ad_id: Uuid, now: DateTime<Utc>) {
        if let Some(vehicle) = self.vehicles.get_mut(&vehicle_id) {
            vehicle.members.remove(&ad_id);
        }
        self.set_state(ad_id, LinkState::Unlinked);
        self.recompute(vehicle_id, now);
    }

    fn recompute(&mut self, vehicle_id: Uuid, now: DateTime<Utc>) {
        let Some(vehicle) = self.vehicles.get(&vehicle_id) else {
            return;
        };
        let mut profiles: Vec<&VehicleProfile> = vehicle
            .members
            .iter()
            .filter_map(|id| self.ads.get(id))
            .map(|entry| &entry.profile)
            .collect();
        profiles.sort_by_key(|p| p.observed_at);
        let representative = representative(vehicle.vin.as_deref(), &profiles);
        let scope = scope_key(&representative);

        let Some(vehicle) = self.vehicles.get_mut(&vehicle_id) else {
            return;
        };
        let previous = std::mem::replace(&mut vehicle.scope, scope.clone());
        vehicle.representative = representative;
        vehicle.revision += 1;
        vehicle.updated_at = now;
        self.touch(&previous);
        self.touch(&scope);
    }

    fn release_vin(&mut self, vehicle_id: Uuid) {
        let Some(vehicle) = self.vehicles.get_mut(&vehicle_id) else {
            return;
        };
        if let Some(vin) = vehicle.vin.take() {
            if self.vin_index.get(&vin) == Some(&vehicle_id) {
                self.vin_index.remove(&vin);
            }
        }
    }

    /// Attach `vin` to the vehicle. A VIN already held elsewhere proves the
    /// two vehicles are one car: the younger one is absorbed.
    fn claim_vin(
        &mut self,
        vehicle_id: Uuid,
        vin: &str,
        now: DateTime<Utc>,
    ) -> Result<VinClaim, ClusterError> {
        let vin = normalize_vin(vin);
        let current = self
            .vehicles
            .get(&vehicle_id)
            .ok_or(ClusterError::UnknownVehicle(vehicle_id))?
            .vin
            .clone();
        if let Some(existing) = current {
            if existing != vin {
                warn!(
                    vehicle = %vehicle_id,
                    claimed = %existing,
                    observed = %vin,
                    "member VIN differs from vehicle VIN; keeping existing claim"
                );
            }
            return Ok(VinClaim::Held(vehicle_id));
        }

        match self.vin_index.get(&vin).copied() {
            Some(owner) if owner != vehicle_id => {
                let (survivor, absorbed) = if self.seq(owner) <= self.seq(vehicle_id) {
                    (owner, vehicle_id)
                } else {
                    (vehicle_id, owner)
                };
                self.merge(survivor, absorbed, now)?;
                Ok(VinClaim::Merged { survivor, absorbed })
            }
            _ => {
                if let Some(vehicle) = self.vehicles.get_mut(&vehicle_id) {
                    vehicle.vin = Some(vin.clone());
                }
                self.vin_index.insert(vin, vehicle_id);
                self.recompute(vehicle_id, now);
                Ok(VinClaim::Held(vehicle_id))
            }
        }
    }

    /// Move every member of `absorbed` into `survivor`, then tombstone it.
    fn merge(
        &mut self,
        survivor: Uuid,
        absorbed: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ClusterError> {
        if !self.vehicles.contains_key(&survivor) {
            return Err(ClusterError::UnknownVehicle(survivor));
        }
        let Some(gone) = self.vehicles.get_mut(&absorbed) else {
            return Err(ClusterError::UnknownVehicle(absorbed));
        };
        let members = std::mem::take(&mut gone.members);
        gone.status = VehicleStatus::Tombstoned;
        gone.merged_into = Some(survivor);
        gone.revision += 1;
        gone.updated_at = now;
        let (gone_vin, gone_variant, gone_scope) =
            (gone.vin.clone(), gone.variant.clone(), gone.scope.clone());

        if let Some(kept) = self.vehicles.get_mut(&survivor) {
            kept.members.extend(members.iter().copied());
            if kept.vin.is_none() {
                kept.vin = gone_vin.clone();
            }
            if kept.variant.is_none() {
                kept.variant = gone_variant;
            }
        }
        if let Some(vin) = gone_vin {
            if self.vin_index.get(&vin) == Some(&absorbed) {
                self.vin_index.insert(vin, survivor);
            }
        }

        for ad_id in members {
            self.set_state(ad_id, LinkState::Linked { vehicle_id: survivor });
        }
        let pending: Vec<(Uuid, f64)> = self
            .ads
            .iter()
            .filter_map(|(id, entry)| match entry.state {
                LinkState::CandidateMatched { vehicle_id, score } if vehicle_id == absorbed => {
                    Some((*id, score))
                }
                _ => None,
            })
            .collect();
        for (ad_id, score) in pending {
            self.set_state(
                ad_id,
                LinkState::CandidateMatched {
                    vehicle_id: survivor,
                    score,
                },
            );
        }
        self.touch(&gone_scope);
        self.recompute(survivor, now);
        Ok(())
    }
}

/// Most frequent value; among equally frequent values the latest observation wins.
fn mode_latest<T: PartialEq>(values: impl Iterator<Item = Option<T>>) -> Option<T> {
    let mut tally: Vec<(T, usize, usize)> = Vec::new();
    for (position, value) in values.enumerate() {
        let Some(value) = value else { continue };
        match tally.iter_mut().find(|(seen, _, _)| *seen == value) {
            Some(entry) => {
                entry.1 += 1;
                entry.2 = position;
            }
            None => tally.push((value, 1, position)),
        }
    }
    tally
        .into_iter()
        .max_by_key(|(_, count, last)| (*count, *last))
        .map(|(value, _, _)| value)
}

/// `members` must be ordered oldest observation first.
fn representative(vin: Option<&str>, members: &[&VehicleProfile]) -> VehicleProfile {
    VehicleProfile {
        vin: vin.map(str::to_string),
        title: mode_latest(members.iter().map(|p| p.title.clone())),
        make: mode_latest(members.iter().map(|p| p.make.clone())),
        model: mode_latest(members.iter().map(|p| p.model.clone())),
        year: mode_latest(members.iter().map(|p| p.year)),
        price: members.iter().rev().find_map(|p| p.price),
        mileage_km: members.iter().filter_map(|p| p.mileage_km).reduce(f64::max),
        power_hp: mode_latest(members.iter().map(|p| p.power_hp)),
        power_kw: mode_latest(members.iter().map(|p| p.power_kw)),
        fuel_type: mode_latest(members.iter().map(|p| p.fuel_type)),
        transmission: mode_latest(members.iter().map(|p| p.transmission)),
        body_type: mode_latest(members.iter().map(|p| p.body_type)),
        color: mode_latest(members.iter().map(|p| p.color)),
        location: mode_latest(members.iter().map(|p| p.location.clone())),
        image_checksums: members
            .iter()
            .flat_map(|p| p.image_checksums.iter().cloned())
            .collect(),
        observed_at: members.iter().filter_map(|p| p.observed_at).max(),
    }
}

/// JSON view of the given vehicles plus the link state of their members and `extra_ads`.
fn snapshot(pool: &Pool, vehicle_ids: &[Uuid], extra_ads: &[Uuid]) -> Result<Value, ClusterError> {
    let vehicles: Vec<&CanonicalVehicle> = vehicle_ids
        .iter()
        .filter_map(|id| pool.vehicles.get(id))
        .collect();
    let ad_ids: BTreeSet<Uuid> = vehicles
        .iter()
        .flat_map(|v| v.members.iter().copied())
        .chain(extra_ads.iter().copied())
        .collect();
    let ads = ad_ids
        .into_iter()
        .map(|id| {
            let state = pool.ads.get(&id).map(|entry| entry.state);
            Ok(json!({ "ad_id": id, "state": serde_json::to_value(state)? }))
        })
        .collect::<Result<Vec<Value>, serde_json::Error>>()?;
    Ok(json!({ "vehicles": serde_json::to_value(vehicles)?, "ads": ads }))
}

fn edge(ad_id: Uuid, vehicle_id: Uuid, score: SimilarityScore, now: DateTime<Utc>) -> SimilarityEdge {
    SimilarityEdge {
        id: Uuid::new_v4(),
        a: EdgeEndpoint::Ad(ad_id),
        b: EdgeEndpoint::Vehicle(vehicle_id),
        score: score.score,
        breakdown: score.breakdown,
        recorded_at: now,
    }
}

#[derive(Debug)]
enum Plan {
    /// Already linked: membership is monotonic, so the ad is never re-scored.
    Refresh { vehicle_id: Uuid },
    /// Awaiting manual review; only an operator or a VIN resolves it.
    KeepPending { vehicle_id: Uuid, score: f64 },
    Link { vehicle_id: Uuid, score: f64, via_vin: bool },
    Pend { vehicle_id: Uuid, score: f64 },
    Create,
}

/// The state a plan was decided against.
#[derive(Debug)]
struct Observed {
    ad_id: Uuid,
    ad_version: Option<u64>,
    scope: String,
    generations: BTreeMap<String, u64>,
    vin: Option<(String, Option<Uuid>)>,
    target: Option<(Uuid, u64)>,
}

impl Observed {
    fn holds(&self, pool: &Pool) -> bool {
        pool.compatible_generations(&self.scope) == self.generations
            && pool.ads.get(&self.ad_id).map(|a| a.version) == self.ad_version
            && self
                .vin
                .as_ref()
                .map_or(true, |(vin, owner)| pool.vin_index.get(vin) == owner.as_ref())
            && self.target.map_or(true, |(id, revision)| {
                pool.vehicles
                    .get(&id)
                    .is_some_and(|v| v.is_active() && v.revision == revision)
            })
    }
}

#[derive(Debug)]
struct Decision {
    plan: Plan,
    edges: Vec<SimilarityEdge>,
    observed: Observed,
}

/// Canonical vehicle pool plus its audit and similarity-edge trails.
pub struct ClusterBuilder {
    scorer: SimilarityScorer,
    config: ClusterConfig,
    pool: RwLock<Pool>,
    scope_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    edges: RwLock<Vec<SimilarityEdge>>,
    audit_log: RwLock<Vec<AuditEntry>>,
    sink: Arc<dyn AuditSink>,
}

impl ClusterBuilder {
    pub fn new(config: ClusterConfig, sink: Arc<dyn AuditSink>) -> Result<Self, ClusterError> {
        if config.max_attempts == 0 {
            return Err(ClusterError::Config("max_attempts must be at least 1".into()));
        }
        Ok(Self {
            scorer: SimilarityScorer::new(config.similarity)?,
            config,
            pool: RwLock::new(Pool::default()),
            scope_locks: Mutex::new(HashMap::new()),
            edges: RwLock::new(Vec::new()),
            audit_log: RwLock::new(Vec::new()),
            sink,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Place a new or re-scraped ad into the pool.
    pub async fn assign(
        &self,
        record: &AdRecord,
        variant: Option<&str>,
    ) -> Result<AssignOutcome, ClusterError> {
        let profile = record.profile();
        let scope = scope_key(&profile);
        let span = info_span!("cluster_assign", ad = %record.key, scope = %scope);
        self.assign_in_scope(record, &profile, &scope, variant)
            .instrument(span)
            .await
    }

    async fn assign_in_scope(
        &self,
        record: &AdRecord,
        profile: &VehicleProfile,
        scope: &str,
        variant: Option<&str>,
    ) -> Result<AssignOutcome, ClusterError> {
        let lock = self.scope_lock(scope).await;
        let _guard = lock.lock().await;

        for attempt in 1..=self.config.max_attempts {
            let decision = {
                let pool = self.pool.read().await;
                self.decide(&pool, record.id, profile, scope, variant)
            };
            match self.commit(record, profile, scope, variant, decision).await? {
                Some(mut outcome) => {
                    outcome.attempts = attempt;
                    return Ok(outcome);
                }
                None => warn!(attempt, "vehicle pool changed under merge decision; retrying"),
            }
        }
        Err(ClusterError::Contention {
            scope: scope.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    async fn scope_lock(&self, scope: &str) -> Arc<Mutex<()>> {
        let mut locks = self.scope_locks.lock().await;
        locks.entry(scope.to_string()).or_default().clone()
    }

    fn decide(
        &self,
        pool: &Pool,
        ad_id: Uuid,
        profile: &VehicleProfile,
        scope: &str,
        variant: Option<&str>,
    ) -> Decision {
        let now = Utc::now();
        let existing = pool.ads.get(&ad_id);
        let vin = profile.vin.as_deref().map(normalize_vin);
        let vin_owner = vin.as_ref().and_then(|v| pool.vin_index.get(v).copied());
        let mut edges = Vec::new();

        let plan = match existing.map(|entry| entry.state) {
            Some(LinkState::Linked { vehicle_id }) => Plan::Refresh { vehicle_id },
            state => match vin_owner.and_then(|id| pool.vehicles.get(&id)) {
                Some(vehicle) => {
                    let score = self.scorer.score(profile, &vehicle.representative);
                    let value = score.score;
                    edges.push(edge(ad_id, vehicle.id, score, now));
                    Plan::Link {
                        vehicle_id: vehicle.id,
                        score: value,
                        via_vin: true,
                    }
                }
                None => match state {
                    Some(LinkState::CandidateMatched { vehicle_id, score }) => {
                        Plan::KeepPending { vehicle_id, score }
                    }
                    _ => self.compare(pool, ad_id, profile, scope, variant, now, &mut edges),
                },
            },
        };

        let target = match &plan {
            Plan::Refresh { vehicle_id }
            | Plan::Link { vehicle_id, .. }
            | Plan::Pend { vehicle_id, .. } => pool
                .vehicles
                .get(vehicle_id)
                .map(|v| (*vehicle_id, v.revision)),
            Plan::KeepPending { .. } | Plan::Create => None,
        };

        Decision {
            plan,
            edges,
            observed: Observed {
                ad_id,
                ad_version: existing.map(|entry| entry.version),
                scope: scope.to_string(),
                generations: pool.compatible_generations(scope),
                vin: vin.map(|v| (v, vin_owner)),
                target,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compare(
        &self,
        pool: &Pool,
        ad_id: Uuid,
        profile: &VehicleProfile,
        scope: &str,
        variant: Option<&str>,
        now: DateTime<Utc>,
        edges: &mut Vec<SimilarityEdge>,
    ) -> Plan {
        let mut best: Option<(Uuid, f64, u64)> = None;
        let comparable = pool.vehicles.values().filter(|v| {
            v.is_active()
                && scopes_compatible(&v.scope, scope)
                && variant_compatible(v.variant.as_deref(), variant)
        });
        for vehicle in comparable {
            let score = self.scorer.score(profile, &vehicle.representative);
            let seq = pool.seq(vehicle.id);
            let better = match best {
                None => true,
                Some((_, top, top_seq)) => score.score > top || (score.score == top && seq < top_seq),
            };
            if better {
                best = Some((vehicle.id, score.score, seq));
            }
            edges.push(edge(ad_id, vehicle.id, score, now));
        }

        let thresholds = self.scorer.config();
        match best {
            Some((vehicle_id, score, _)) if score >= thresholds.tau_high => Plan::Link {
                vehicle_id,
                score,
                via_vin: false,
            },
            Some((vehicle_id, score, _)) if score >= thresholds.tau_low => {
                Plan::Pend { vehicle_id, score }
            }
            _ => Plan::Create,
        }
    }

    /// Apply a decision if the state it was based on still holds. `None` means stale.
    async fn commit(
        &self,
        record: &AdRecord,
        profile: &VehicleProfile,
        scope: &str,
        variant: Option<&str>,
        decision: Decision,
    ) -> Result<Option<AssignOutcome>, ClusterError> {
        let mut pool = self.pool.write().await;
        if !decision.observed.holds(&pool) {
            return Ok(None);
        }

        let now = Utc::now();
        let ad_id = record.id;
        let vin = profile.vin.as_deref();
        let mut staged = pool.clone();
        staged.observe_ad(record, profile.clone(), scope, variant);
        let mut audits = Vec::new();
        let mut tombstoned = Vec::new();

        let assignment = match decision.plan {
            Plan::Refresh { vehicle_id } => {
                staged.recompute(vehicle_id, now);
                let vehicle_id =
                    settle_vin(&pool, &mut staged, vehicle_id, vin, now, &mut audits, &mut tombstoned)?;
                debug!(vehicle = %vehicle_id, "refreshed linked ad");
                Assignment::Refreshed { vehicle_id }
            }
            Plan::KeepPending { vehicle_id, score } => Assignment::Pending { vehicle_id, score },
            Plan::Pend { vehicle_id, score } => {
                staged.set_state(ad_id, LinkState::CandidateMatched { vehicle_id, score });
                info!(vehicle = %vehicle_id, score, "ad queued for manual review");
                Assignment::Pending { vehicle_id, score }
            }
            Plan::Link {
                vehicle_id,
                score,
                via_vin,
            } => {
                staged.attach(vehicle_id, ad_id, now);
                let survivor =
                    settle_vin(&pool, &mut staged, vehicle_id, vin, now, &mut audits, &mut tombstoned)?;
                audits.insert(
                    0,
                    AuditEntry::new(
                        AuditAction::AutoLink,
                        survivor,
                        None,
                        snapshot(&pool, &[vehicle_id], &[ad_id])?,
                        snapshot(&staged, &[survivor], &[ad_id])?,
                    ),
                );
                info!(vehicle = %survivor, score, via_vin, "ad auto-linked");
                Assignment::AutoLinked {
                    vehicle_id: survivor,
                    score,
                }
            }
            Plan::Create => {
                let founded = staged.found(ad_id, now);
                let vehicle_id =
                    settle_vin(&pool, &mut staged, founded, vin, now, &mut audits, &mut tombstoned)?;
                debug!(vehicle = %vehicle_id, "founded canonical vehicle");
                Assignment::Created { vehicle_id }
            }
        };

        self.publish(&mut pool, staged, audits, decision.edges).await?;
        Ok(Some(AssignOutcome {
            ad_id,
            assignment,
            tombstoned,
            attempts: 0,
        }))
    }

    /// Record audits first; the staged pool only replaces the live one once
    /// every entry is durable.
    async fn publish(
        &self,
        pool: &mut Pool,
        staged: Pool,
        audits: Vec<AuditEntry>,
        edges: Vec<SimilarityEdge>,
    ) -> Result<(), ClusterError> {
        for entry in &audits {
            self.sink.record(entry).await?;
        }
        *pool = staged;
        self.edges.write().await.extend(edges);
        self.audit_log.write().await.extend(audits);
        Ok(())
    }

    pub async fn pending_reviews(&self) -> Vec<PendingReview> {
        let pool = self.pool.read().await;
        let mut reviews: Vec<PendingReview> = pool
            .ads
            .iter()
            .filter_map(|(ad_id, entry)| match entry.state {
                LinkState::CandidateMatched { vehicle_id, score } => Some(PendingReview {
                    ad_id: *ad_id,
                    key: entry.key.clone(),
                    vehicle_id,
                    score,
                }),
                _ => None,
            })
            .collect();
        reviews.sort_by(|a, b| a.key.cmp(&b.key));
        reviews
    }

    /// Operator decision on a pending ad. Returns the vehicle the ad ends up in.
    pub async fn resolve_candidate(
        &self,
        ad_id: Uuid,
        resolution: Resolution,
        authorization: AdminAuthorization,
    ) -> Result<Uuid, ClusterError> {
        let mut pool = self.pool.write().await;
        let entry = pool.ads.get(&ad_id).ok_or(ClusterError::UnknownAd(ad_id))?;
        let LinkState::CandidateMatched { vehicle_id, .. } = entry.state else {
            return Err(ClusterError::NotPending(ad_id));
        };
        let vin = entry.profile.vin.clone();
        let now = Utc::now();
        let mut staged = pool.clone();
        let mut audits = Vec::new();
        let mut tombstoned = Vec::new();

        let (action, target) = match resolution {
            Resolution::Link => {
                if !pool.vehicles.get(&vehicle_id).is_some_and(|v| v.is_active()) {
                    return Err(ClusterError::Tombstoned(vehicle_id));
                }
                staged.attach(vehicle_id, ad_id, now);
                (AuditAction::ManualLink, vehicle_id)
            }
            Resolution::Reject => (AuditAction::ManualReject, staged.found(ad_id, now)),
        };
        let target = settle_vin(
            &pool,
            &mut staged,
            target,
            vin.as_deref(),
            now,
            &mut audits,
            &mut tombstoned,
        )?;
        audits.insert(
            0,
            AuditEntry::new(
                action,
                target,
                Some(authorization),
                snapshot(&pool, &[vehicle_id], &[ad_id])?,
                snapshot(&staged, &[target, vehicle_id], &[ad_id])?,
            ),
        );
        self.publish(&mut pool, staged, audits, Vec::new()).await?;
        info!(ad = %ad_id, vehicle = %target, action = action.as_str(), "pending ad resolved");
        Ok(target)
    }

    /// Operator merge of two active vehicles; `absorbed` is tombstoned.
    pub async fn merge_vehicles(
        &self,
        survivor: Uuid,
        absorbed: Uuid,
        authorization: AdminAuthorization,
    ) -> Result<(), ClusterError> {
        if survivor == absorbed {
            return Err(ClusterError::SameVehicle(survivor));
        }
        let mut pool = self.pool.write().await;
        let mut vins = Vec::with_capacity(2);
        for id in [survivor, absorbed] {
            let vehicle = pool
                .vehicles
                .get(&id)
                .ok_or(ClusterError::UnknownVehicle(id))?;
            if !vehicle.is_active() {
                return Err(ClusterError::Tombstoned(id));
            }
            vins.push(vehicle.vin.clone());
        }
        if let [Some(a), Some(b)] = vins.as_slice() {
            if a != b {
                return Err(ClusterError::VinConflict { survivor, absorbed });
            }
        }

        let now = Utc::now();
        let mut staged = pool.clone();
        staged.merge(survivor, absorbed, now)?;
        let audits = vec![AuditEntry::new(
            AuditAction::Merge,
            survivor,
            Some(authorization),
            snapshot(&pool, &[survivor, absorbed], &[])?,
            snapshot(&staged, &[survivor, absorbed], &[])?,
        )];
        self.publish(&mut pool, staged, audits, Vec::new()).await?;
        info!(survivor = %survivor, absorbed = %absorbed, "vehicles merged by operator; absorbed vehicle tombstoned");
        Ok(())
    }

    /// Operator split: the ad leaves its vehicle and founds a new one.
    pub async fn split_member(
        &self,
        ad_id: Uuid,
        authorization: AdminAuthorization,
    ) -> Result<Uuid, ClusterError> {
        let mut pool = self.pool.write().await;
        let entry = pool.ads.get(&ad_id).ok_or(ClusterError::UnknownAd(ad_id))?;
        let LinkState::Linked { vehicle_id } = entry.state else {
            return Err(ClusterError::NotLinked(ad_id));
        };
        let ad_vin = entry.profile.vin.as_deref().map(normalize_vin);
        let vehicle = pool
            .vehicles
            .get(&vehicle_id)
            .ok_or(ClusterError::UnknownVehicle(vehicle_id))?;
        if vehicle.members.len() <= 1 {
            return Err(ClusterError::SoleMember(ad_id));
        }

        let moves_vin = match (&ad_vin, &vehicle.vin) {
            (Some(ad), Some(held)) if ad == held => {
                let shared = vehicle.members.iter().filter(|m| **m != ad_id).any(|m| {
                    pool.ads
                        .get(m)
                        .and_then(|e| e.profile.vin.as_deref())
                        .map(normalize_vin)
                        .as_deref()
                        == Some(held.as_str())
                });
                if shared {
                    return Err(ClusterError::SharedVin {
                        ad: ad_id,
                        vehicle: vehicle_id,
                        vin: held.clone(),
                    });
                }
                true
            }
            _ => false,
        };

        let now = Utc::now();
        let mut staged = pool.clone();
        let mut audits = Vec::new();
        let mut tombstoned = Vec::new();
        staged.detach(vehicle_id, ad_id, now);
        if moves_vin {
            staged.release_vin(vehicle_id);
            staged.recompute(vehicle_id, now);
        }
        let founded = staged.found(ad_id, now);
        let new_vehicle = settle_vin(
            &pool,
            &mut staged,
            founded,
            ad_vin.as_deref(),
            now,
            &mut audits,
            &mut tombstoned,
        )?;
        audits.insert(
            0,
            AuditEntry::new(
                AuditAction::Split,
                vehicle_id,
                Some(authorization),
                snapshot(&pool, &[vehicle_id], &[ad_id])?,
                snapshot(&staged, &[vehicle_id, new_vehicle], &[ad_id])?,
            ),
        );
        self.publish(&mut pool, staged, audits, Vec::new()).await?;
        info!(ad = %ad_id, from = %vehicle_id, to = %new_vehicle, "ad split into its own vehicle");
        Ok(new_vehicle)
    }

    /// Every vehicle, tombstones included.
    pub async fn vehicles(&self) -> Vec<CanonicalVehicle> {
        self.pool.read().await.vehicles.values().cloned().collect()
    }

    pub async fn active_vehicles(&self) -> Vec<CanonicalVehicle> {
        self.pool
            .read()
            .await
            .vehicles
            .values()
            .filter(|v| v.is_active())
            .cloned()
            .collect()
    }

    pub async fn vehicle(&self, id: Uuid) -> Option<CanonicalVehicle> {
        self.pool.read().await.vehicles.get(&id).cloned()
    }

    pub async fn link_state(&self, ad_id: Uuid) -> LinkState {
        self.pool
            .read()
            .await
            .ads
            .get(&ad_id)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    pub async fn link_states(&self) -> BTreeMap<Uuid, LinkState> {
        self.pool
            .read()
            .await
            .ads
            .iter()
            .map(|(id, entry)| (*id, entry.state))
            .collect()
    }

    pub async fn edges(&self) -> Vec<SimilarityEdge> {
        self.edges.read().await.clone()
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit_log.read().await.clone()
    }
}

/// Claim the ad's VIN for `vehicle_id`, auditing any merge it forces.
/// Returns the vehicle that holds the ad afterwards.
fn settle_vin(
    before: &Pool,
    staged: &mut Pool,
    vehicle_id: Uuid,
    vin: Option<&str>,
    now: DateTime<Utc>,
    audits: &mut Vec<AuditEntry>,
    tombstoned: &mut Vec<Uuid>,
) -> Result<Uuid, ClusterError> {
    let Some(vin) = vin else {
        return Ok(vehicle_id);
    };
    match staged.claim_vin(vehicle_id, vin, now)? {
        VinClaim::Held(id) => Ok(id),
        VinClaim::Merged { survivor, absorbed } => {
            audits.push(AuditEntry::new(
                AuditAction::Tombstone,
                absorbed,
                None,
                snapshot(before, &[survivor, absorbed], &[])?,
                snapshot(staged, &[survivor, absorbed], &[])?,
            ));
            info!(
                survivor = %survivor,
                absorbed = %absorbed,
                vin,
                "shared VIN proved vehicles identical; absorbed vehicle tombstoned"
            );
            tombstoned.push(absorbed);
            Ok(survivor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use carid_core::{Currency, Field, Money, NormalizedListing, Quantity, Unit};
    use carid_storage::MemoryAuditLog;
    use chrono::Duration;

    fn present<T>(value: T) -> Field<T> {
        Field {
            value: Some(value),
            provenance: None,
        }
    }

    struct Ad<'a> {
        id: &'a str,
        titled: bool,
        vin: Option<&'a str>,
        year: i32,
        price: f64,
        mileage: f64,
        location: &'a str,
        minute: i64,
    }

    impl Default for Ad<'_> {
        fn default() -> Self {
            Self {
                id: "1",
                titled: true,
                vin: None,
                year: 2019,
                price: 109999.0,
                mileage: 113000.0,
                location: "София",
                minute: 0,
            }
        }
    }

    impl Ad<'_> {
        fn record(&self) -> AdRecord {
            let mut listing = NormalizedListing {
                year: present(self.year),
                price: present(Money {
                    amount: self.price,
                    currency: Currency::Bgn,
                }),
                mileage: present(Quantity::scraped(Unit::Km, self.mileage)),
                location: present(self.location.to_string()),
                ..NormalizedListing::default()
            };
            if self.titled {
                listing.title = present("BMW M5 Competition".to_string());
                listing.make = Some("BMW".into());
                listing.model = Some("M5".into());
            }
            if let Some(vin) = self.vin {
                listing.vin = present(vin.to_string());
            }
            let seen = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
                .expect("ts")
                .with_timezone(&Utc)
                + Duration::minutes(self.minute);
            AdRecord::new(AdKey::new("mobile.bg", self.id), listing, seen)
        }
    }

    fn builder() -> ClusterBuilder {
        ClusterBuilder::new(ClusterConfig::default(), Arc::new(MemoryAuditLog::new()))
            .expect("default config is valid")
    }

    fn ops() -> AdminAuthorization {
        AdminAuthorization::new("ops@carid", "reviewed photos")
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _entry: &AuditEntry) -> Result<(), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("audit volume is read-only")))
        }
    }

    const VIN: &str = "WBA12345678901234";

    fn vin_trio() -> [AdRecord; 3] {
        [
            Ad {
                id: "a",
                vin: Some(VIN),
                ..Ad::default()
            }
            .record(),
            Ad {
                id: "b",
                vin: Some(VIN),
                price: 89000.0,
                mileage: 140000.0,
                location: "Варна",
                minute: 5,
                ..Ad::default()
            }
            .record(),
            Ad {
                id: "c",
                titled: false,
                vin: Some(VIN),
                minute: 10,
                ..Ad::default()
            }
            .record(),
        ]
    }

    #[tokio::test]
    async fn shared_vin_converges_in_every_order() {
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let cluster = builder();
            let ads = vin_trio();
            for i in order {
                cluster.assign(&ads[i], None).await.expect("assign");
            }
            let active = cluster.active_vehicles().await;
            assert_eq!(active.len(), 1, "order {order:?}");
            let vehicle = &active[0];
            assert_eq!(vehicle.vin.as_deref(), Some(VIN));
            let expected: BTreeSet<Uuid> = ads.iter().map(|a| a.id).collect();
            assert_eq!(vehicle.members, expected, "order {order:?}");
            assert_eq!(vehicle.scope, "bmw/m5");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_vin_sightings_across_scopes_converge() {
        let cluster = Arc::new(builder());
        let ads = vin_trio();
        let mut tasks = tokio::task::JoinSet::new();
        for ad in ads.clone() {
            let cluster = Arc::clone(&cluster);
            tasks.spawn(async move { cluster.assign(&ad, None).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task").expect("assign");
        }
        let active = cluster.active_vehicles().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].members.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_sightings_create_one_vehicle() {
        let cluster = Arc::new(builder());
        let first = Ad {
            id: "11712345",
            ..Ad::default()
        }
        .record();
        let second = Ad {
            id: "11799999",
            ..Ad::default()
        }
        .record();
        let (a, b) = tokio::join!(
            {
                let cluster = Arc::clone(&cluster);
                async move { cluster.assign(&first, None).await }
            },
            {
                let cluster = Arc::clone(&cluster);
                async move { cluster.assign(&second, None).await }
            }
        );
        let (a, b) = (a.expect("first"), b.expect("second"));
        assert_eq!(a.assignment.vehicle_id(), b.assignment.vehicle_id());
        let active = cluster.active_vehicles().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].members.len(), 2);
    }

    #[tokio::test]
    async fn below_tau_low_never_merges_across_reingestion() {
        let cluster = builder();
        for round in 0..4 {
            let a = Ad {
                id: "a",
                minute: round,
                ..Ad::default()
            }
            .record();
            let b = Ad {
                id: "b",
                year: 2020,
                minute: round,
                ..Ad::default()
            }
            .record();
            cluster.assign(&a, None).await.expect("a");
            let outcome = cluster.assign(&b, None).await.expect("b");
            if round > 0 {
                assert!(matches!(outcome.assignment, Assignment::Refreshed { .. }));
            }
        }
        let active = cluster.active_vehicles().await;
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|v| v.members.len() == 1));
        let vetoed = cluster
            .edges()
            .await
            .into_iter()
            .filter(|e| e.breakdown.veto == Some(carid_core::Veto::YearMismatch))
            .count();
        assert_eq!(vetoed, 1);
    }

    #[tokio::test]
    async fn near_matches_wait_for_review_and_are_never_promoted() {
        let cluster = builder();
        let a = Ad::default().record();
        let b = Ad {
            id: "2",
            price: 104999.0,
            mileage: 115000.0,
            ..Ad::default()
        };
        let created = cluster.assign(&a, None).await.expect("a");
        let pending = cluster.assign(&b.record(), None).await.expect("b");
        let Assignment::Pending { vehicle_id, score } = pending.assignment else {
            panic!("expected pending, got {:?}", pending.assignment);
        };
        assert_eq!(vehicle_id, created.assignment.vehicle_id());
        assert!(score >= 0.6 && score < 0.85, "{score}");

        // Same values as the vehicle now: still not auto-promoted.
        let identical = Ad {
            id: "2",
            minute: 30,
            ..Ad::default()
        }
        .record();
        let again = cluster.assign(&identical, None).await.expect("again");
        assert!(matches!(again.assignment, Assignment::Pending { .. }));

        let reviews = cluster.pending_reviews().await;
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].key, AdKey::new("mobile.bg", "2"));
        let vehicle = cluster.vehicle(vehicle_id).await.expect("vehicle");
        assert_eq!(vehicle.members.len(), 1);
        assert!(cluster.audit_log().await.is_empty());
    }

    #[tokio::test]
    async fn manual_link_and_reject_are_audited() {
        let sink = Arc::new(MemoryAuditLog::new());
        let cluster = ClusterBuilder::new(ClusterConfig::default(), sink.clone()).expect("builder");
        let a = Ad::default().record();
        let b = Ad {
            id: "2",
            price: 104999.0,
            mileage: 115000.0,
            minute: 5,
            ..Ad::default()
        }
        .record();
        let vehicle = cluster.assign(&a, None).await.expect("a").assignment.vehicle_id();
        cluster.assign(&b, None).await.expect("b");

        let linked = cluster
            .resolve_candidate(b.id, Resolution::Link, ops())
            .await
            .expect("link");
        assert_eq!(linked, vehicle);
        assert_eq!(
            cluster.link_state(b.id).await,
            LinkState::Linked { vehicle_id: vehicle }
        );
        assert!(matches!(
            cluster.resolve_candidate(b.id, Resolution::Link, ops()).await,
            Err(ClusterError::NotPending(_))
        ));

        // The representative now carries b's price and the higher mileage.
        let c = Ad {
            id: "3",
            price: 104999.0,
            mileage: 115000.0,
            minute: 10,
            ..Ad::default()
        }
        .record();
        let outcome = cluster.assign(&c, None).await.expect("c");
        assert!(matches!(outcome.assignment, Assignment::AutoLinked { .. }));

        let d = Ad {
            id: "4",
            price: 99999.0,
            mileage: 118000.0,
            minute: 15,
            ..Ad::default()
        }
        .record();
        let outcome = cluster.assign(&d, None).await.expect("d");
        assert!(matches!(outcome.assignment, Assignment::Pending { .. }));
        let own = cluster
            .resolve_candidate(d.id, Resolution::Reject, ops())
            .await
            .expect("reject");
        assert_ne!(own, vehicle);
        assert_eq!(cluster.active_vehicles().await.len(), 2);
        assert!(cluster.pending_reviews().await.is_empty());

        let log = cluster.audit_log().await;
        let actions: Vec<AuditAction> = log.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::ManualLink,
                AuditAction::AutoLink,
                AuditAction::ManualReject
            ]
        );
        assert_eq!(log[0].authorization, Some(ops()));
        assert_ne!(log[0].before, log[0].after);
        assert_eq!(sink.entries().await, log);
    }

    #[tokio::test]
    async fn late_vin_merges_vehicles_and_tombstones_the_younger() {
        let cluster = builder();
        let a = Ad::default().record();
        // Same year but nothing else in common: too weak to link without the VIN.
        let vin_only = Ad {
            id: "2",
            titled: false,
            vin: Some(VIN),
            price: 60000.0,
            mileage: 160000.0,
            location: "Варна",
            minute: 5,
            ..Ad::default()
        }
        .record();
        let older = cluster.assign(&a, None).await.expect("a").assignment.vehicle_id();
        let younger = cluster
            .assign(&vin_only, None)
            .await
            .expect("vin only")
            .assignment
            .vehicle_id();
        assert_ne!(older, younger);

        let a_with_vin = Ad {
            vin: Some(VIN),
            minute: 20,
            ..Ad::default()
        }
        .record();
        let outcome = cluster.assign(&a_with_vin, None).await.expect("rescrape");
        assert_eq!(outcome.assignment, Assignment::Refreshed { vehicle_id: older });
        assert_eq!(outcome.tombstoned, vec![younger]);

        let survivor = cluster.vehicle(older).await.expect("survivor");
        assert_eq!(survivor.vin.as_deref(), Some(VIN));
        assert_eq!(survivor.members.len(), 2);
        let gone = cluster.vehicle(younger).await.expect("tombstone is kept");
        assert_eq!(gone.status, VehicleStatus::Tombstoned);
        assert_eq!(gone.merged_into, Some(older));
        assert!(gone.members.is_empty());
        assert_eq!(
            cluster.link_state(vin_only.id).await,
            LinkState::Linked { vehicle_id: older }
        );

        let log = cluster.audit_log().await;
        let tombstone = log
            .iter()
            .find(|e| e.action == AuditAction::Tombstone)
            .expect("tombstone audited");
        assert_eq!(tombstone.subject, younger);
        assert!(tombstone.authorization.is_none());
    }

    #[tokio::test]
    async fn untitled_ads_are_compared_with_titled_vehicles() {
        let cluster = builder();
        let titled = Ad::default().record();
        let untitled = Ad {
            id: "2",
            titled: false,
            minute: 5,
            ..Ad::default()
        }
        .record();
        let vehicle = cluster
            .assign(&titled, None)
            .await
            .expect("titled")
            .assignment
            .vehicle_id();
        let outcome = cluster.assign(&untitled, None).await.expect("untitled");
        let Assignment::AutoLinked { vehicle_id, score } = outcome.assignment else {
            panic!("expected auto-link, got {:?}", outcome.assignment);
        };
        assert_eq!(vehicle_id, vehicle);
        // Price, mileage, year and location only: 0.45 of the weight against 0.5 coverage.
        assert!((score - 0.9).abs() < 1e-9, "{score}");
        assert_eq!(cluster.active_vehicles().await.len(), 1);
        assert_eq!(cluster.edges().await.len(), 1);

        // The reverse direction: a titled ad finds a vehicle founded without a title.
        let other = builder();
        let founded = other
            .assign(&untitled, None)
            .await
            .expect("untitled")
            .assignment
            .vehicle_id();
        let outcome = other.assign(&titled, None).await.expect("titled");
        assert_eq!(outcome.assignment.vehicle_id(), founded);
        assert!(matches!(outcome.assignment, Assignment::AutoLinked { .. }));
    }

    #[tokio::test]
    async fn known_makes_that_differ_are_never_compared() {
        let cluster = builder();
        let bmw = Ad::default().record();
        let mut listing = Ad {
            id: "2",
            ..Ad::default()
        }
        .record();
        listing.normalized.make = Some("Audi".into());
        listing.normalized.model = Some("RS6".into());
        cluster.assign(&bmw, None).await.expect("bmw");
        let outcome = cluster.assign(&listing, None).await.expect("audi");
        assert!(matches!(outcome.assignment, Assignment::Created { .. }));
        assert!(cluster.edges().await.is_empty());
    }

    #[test]
    fn unknown_scope_parts_match_anything() {
        assert!(scopes_compatible("?/?", "bmw/m5"));
        assert!(scopes_compatible("bmw/?", "bmw/m5"));
        assert!(scopes_compatible("?/m5", "bmw/?"));
        assert!(!scopes_compatible("bmw/?", "audi/rs6"));
        assert!(!scopes_compatible("bmw/m5", "bmw/m3"));
    }

    #[tokio::test]
    async fn operators_can_merge_and_split() {
        let cluster = builder();
        let a = Ad::default().record();
        let b = Ad {
            id: "2",
            year: 2020,
            ..Ad::default()
        }
        .record();
        let va = cluster.assign(&a, None).await.expect("a").assignment.vehicle_id();
        let vb = cluster.assign(&b, None).await.expect("b").assignment.vehicle_id();

        assert!(matches!(
            cluster.merge_vehicles(va, va, ops()).await,
            Err(ClusterError::SameVehicle(_))
        ));
        assert!(matches!(
            cluster.split_member(a.id, ops()).await,
            Err(ClusterError::SoleMember(_))
        ));

        cluster.merge_vehicles(va, vb, ops()).await.expect("merge");
        assert_eq!(cluster.active_vehicles().await.len(), 1);
        assert!(matches!(
            cluster.merge_vehicles(va, vb, ops()).await,
            Err(ClusterError::Tombstoned(_))
        ));

        let split = cluster.split_member(b.id, ops()).await.expect("split");
        assert_ne!(split, va);
        assert_eq!(
            cluster.link_state(b.id).await,
            LinkState::Linked { vehicle_id: split }
        );
        assert_eq!(cluster.vehicle(va).await.expect("va").members.len(), 1);

        // Re-scraping the split ad does not fold it back.
        let outcome = cluster.assign(&b, None).await.expect("rescrape");
        assert_eq!(outcome.assignment, Assignment::Refreshed { vehicle_id: split });

        let actions: Vec<AuditAction> = cluster.audit_log().await.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Merge, AuditAction::Split]);
    }

    #[tokio::test]
    async fn split_carries_a_vin_only_its_ad_proves() {
        let cluster = builder();
        let a = Ad {
            vin: Some(VIN),
            ..Ad::default()
        }
        .record();
        let b = Ad {
            id: "2",
            ..Ad::default()
        }
        .record();
        let vehicle = cluster.assign(&a, None).await.expect("a").assignment.vehicle_id();
        cluster.assign(&b, None).await.expect("b");

        let split = cluster.split_member(a.id, ops()).await.expect("split");
        assert_eq!(cluster.vehicle(split).await.expect("new").vin.as_deref(), Some(VIN));
        assert_eq!(cluster.vehicle(vehicle).await.expect("old").vin, None);
    }

    #[tokio::test]
    async fn stale_decisions_are_discarded_and_retried() {
        let cluster = builder();
        let a = Ad::default().record();
        let b = Ad {
            id: "2",
            ..Ad::default()
        }
        .record();
        let c = Ad {
            id: "3",
            ..Ad::default()
        }
        .record();
        cluster.assign(&a, None).await.expect("a");

        let profile = b.profile();
        let scope = scope_key(&profile);
        let decision = {
            let pool = cluster.pool.read().await;
            cluster.decide(&pool, b.id, &profile, &scope, None)
        };
        assert!(matches!(decision.plan, Plan::Link { .. }));

        cluster.assign(&c, None).await.expect("intervening link");
        let committed = cluster
            .commit(&b, &profile, &scope, None, decision)
            .await
            .expect("commit");
        assert!(committed.is_none());
        assert_eq!(cluster.link_state(b.id).await, LinkState::Unlinked);

        let outcome = cluster.assign(&b, None).await.expect("retry");
        assert!(matches!(outcome.assignment, Assignment::AutoLinked { .. }));
        assert_eq!(cluster.active_vehicles().await[0].members.len(), 3);
    }

    #[tokio::test]
    async fn failed_audit_write_aborts_the_merge() {
        let cluster =
            ClusterBuilder::new(ClusterConfig::default(), Arc::new(FailingSink)).expect("builder");
        let a = Ad::default().record();
        let b = Ad {
            id: "2",
            ..Ad::default()
        }
        .record();
        cluster.assign(&a, None).await.expect("create needs no audit");
        let err = cluster.assign(&b, None).await.expect_err("auto-link must be audited");
        assert!(matches!(err, ClusterError::Audit(_)));
        assert_eq!(cluster.link_state(b.id).await, LinkState::Unlinked);
        assert_eq!(cluster.active_vehicles().await[0].members.len(), 1);
        assert!(cluster.audit_log().await.is_empty());
    }

    #[tokio::test]
    async fn distinct_known_variants_are_never_compared() {
        let cluster = builder();
        let a = Ad::default().record();
        let b = Ad {
            id: "2",
            ..Ad::default()
        }
        .record();
        let c = Ad {
            id: "3",
            ..Ad::default()
        }
        .record();
        let va = cluster
            .assign(&a, Some("bmw-m5-f90-competition"))
            .await
            .expect("a")
            .assignment
            .vehicle_id();
        let vb = cluster
            .assign(&b, Some("bmw-m5-f90"))
            .await
            .expect("b")
            .assignment
            .vehicle_id();
        assert_ne!(va, vb);
        // Unknown variant is compatible with both; the older vehicle wins the tie.
        let outcome = cluster.assign(&c, None).await.expect("c");
        assert_eq!(
            outcome.assignment,
            Assignment::AutoLinked {
                vehicle_id: va,
                score: 1.0
            }
        );
    }

    #[test]
    fn representative_prefers_frequent_then_recent_values() {
        let mut first = Ad::default().record().profile();
        first.location = Some("София".into());
        first.power_kw = Some(460.0);
        let mut second = first.clone();
        second.location = Some("Пловдив".into());
        second.mileage_km = Some(120000.0);
        let rep = representative(None, &[&first, &second]);
        assert_eq!(rep.location.as_deref(), Some("Пловдив"));
        assert_eq!(rep.mileage_km, Some(120000.0));
        assert_eq!(rep.power_kw, Some(460.0));

        let third = first.clone();
        let rep = representative(None, &[&first, &second, &third]);
        assert_eq!(rep.location.as_deref(), Some("София"));
    }

    #[test]
    fn scope_keys_fall_back_to_unknown() {
        let profile = VehicleProfile {
            make: Some("BMW".into()),
            ..VehicleProfile::default()
        };
        assert_eq!(scope_key(&profile), "bmw/?");
        assert_eq!(scope_key(&VehicleProfile::default()), "?/?");
    }

    #[test]
    fn zero_attempt_budget_is_rejected() {
        let config = ClusterConfig {
            max_attempts: 0,
            ..ClusterConfig::default()
        };
        assert!(matches!(
            ClusterBuilder::new(config, Arc::new(MemoryAuditLog::new())),
            Err(ClusterError::Config(_))
        ));
    }
}
