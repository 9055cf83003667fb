//! Page ingestion pipeline: tokenize, extract, normalize, store, cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use carid_cluster::{
    Assignment, BoundedLookup, ClusterBuilder, ClusterConfig, StaticVariantTable, VariantLookup,
};
use carid_core::{AdKey, AdRecord, Block, BlockId, FieldKey, Language};
use carid_extract::{
    ContainerRanker, HtmlBlockSource, PatternLibrary, RankEntry, RankerConfig, ScoredBlock,
    SelectionPolicy,
};
use carid_normalize::{raw_fields, NormalizeTables, RecordNormalizer};
use carid_storage::{AuditStore, RecordStore, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod snapshot;

pub use snapshot::{SnapshotManifest, SnapshotManifestFile};

pub const CRATE_NAME: &str = "carid-sync";

const BUILTIN_ENGINE: &str = include_str!("../../../rules/engine.yaml");

fn default_block_timeout_ms() -> u64 {
    2000
}

fn default_lookup_timeout_ms() -> u64 {
    500
}

/// Ranker, cluster and timeout tunables from `rules/engine.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub ranker: RankerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ranker: RankerConfig::default(),
            cluster: ClusterConfig::default(),
            block_timeout_ms: default_block_timeout_ms(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_ENGINE).context("parsing built-in engine config")
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("parsing engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        match self.ranker.selection {
            SelectionPolicy::TopK { k } => ensure!(k >= 1, "top_k selection needs k >= 1"),
            SelectionPolicy::Threshold { min_density } => ensure!(
                min_density.is_finite() && min_density >= 0.0,
                "threshold selection needs a finite, non-negative min_density"
            ),
        }
        let importance = &self.ranker.importance;
        if importance
            .fields
            .values()
            .chain(std::iter::once(&importance.default_weight))
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            bail!("field importance weights must be non-negative");
        }
        ensure!(self.block_timeout_ms > 0, "block_timeout_ms must be positive");
        ensure!(self.lookup_timeout_ms > 0, "lookup_timeout_ms must be positive");
        ensure!(
            self.cluster.max_attempts >= 1,
            "cluster max_attempts must be at least 1"
        );
        self.cluster
            .similarity
            .validate()
            .context("invalid similarity config")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub block_timeout_ms: Option<u64>,
    pub lookup_timeout_ms: Option<u64>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("CARID_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            reports_dir: std::env::var("CARID_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            audit_dir: std::env::var("CARID_AUDIT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("audit")),
            block_timeout_ms: std::env::var("CARID_BLOCK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            lookup_timeout_ms: std::env::var("CARID_LOOKUP_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            workspace_root,
        }
    }

    /// Defaults rooted at `root`, ignoring the environment.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            reports_dir: workspace_root.join("reports"),
            audit_dir: workspace_root.join("audit"),
            block_timeout_ms: None,
            lookup_timeout_ms: None,
            workspace_root,
        }
    }

    fn rule_file(&self, name: &str) -> Option<PathBuf> {
        let path = self.workspace_root.join("rules").join(name);
        path.is_file().then_some(path)
    }
}

/// Every rule table the pipeline needs, compiled once.
pub struct RuleSet {
    pub patterns: PatternLibrary,
    pub tables: NormalizeTables,
    pub engine: EngineConfig,
    pub variants: StaticVariantTable,
}

impl RuleSet {
    /// Workspace `rules/*.yaml` files replace the built-in copies one by one.
    pub fn load(config: &SyncConfig) -> Result<Self> {
        let patterns = match config.rule_file("patterns.yaml") {
            Some(path) => PatternLibrary::load(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PatternLibrary::builtin().context("compiling built-in patterns")?,
        };
        let tables = match config.rule_file("normalize.yaml") {
            Some(path) => NormalizeTables::load(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NormalizeTables::builtin().context("parsing built-in normalize tables")?,
        };
        let mut engine = match config.rule_file("engine.yaml") {
            Some(path) => EngineConfig::load(&path)?,
            None => EngineConfig::builtin()?,
        };
        if let Some(ms) = config.block_timeout_ms {
            engine.block_timeout_ms = ms;
        }
        if let Some(ms) = config.lookup_timeout_ms {
            engine.lookup_timeout_ms = ms;
        }
        engine.validate().context("engine config after overrides")?;
        let variants = match config.rule_file("variants.yaml") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                StaticVariantTable::from_yaml_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => StaticVariantTable::builtin().context("parsing built-in variant table")?,
        };
        Ok(Self {
            patterns,
            tables,
            engine,
            variants,
        })
    }
}

/// Image checksums come from an external image pipeline keyed by image URL.
#[async_trait]
pub trait ChecksumSource: Send + Sync {
    async fn checksums(&self, ad: &AdKey, image_urls: &[String]) -> Result<BTreeSet<String>>;
}

#[derive(Debug, Default)]
pub struct NoImageChecksums;

#[async_trait]
impl ChecksumSource for NoImageChecksums {
    async fn checksums(&self, _ad: &AdKey, _image_urls: &[String]) -> Result<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryChecksums {
    by_url: BTreeMap<String, String>,
}

impl InMemoryChecksums {
    pub fn new(by_url: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            by_url: by_url.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ChecksumSource for InMemoryChecksums {
    async fn checksums(&self, _ad: &AdKey, image_urls: &[String]) -> Result<BTreeSet<String>> {
        Ok(image_urls
            .iter()
            .filter_map(|url| self.by_url.get(url).cloned())
            .collect())
    }
}

#[derive(Debug, Clone)]
pub enum PageSource {
    Html {
        html: String,
        base_url: Option<String>,
    },
    /// Blocks already delimited by an external tokenizer.
    Blocks(Vec<Block>),
}

#[derive(Debug, Clone)]
pub struct PageInput {
    pub site: String,
    pub page_ref: String,
    pub source: PageSource,
    pub language_hint: Option<Language>,
    pub fetched_at: DateTime<Utc>,
}

impl PageInput {
    pub fn html(site: impl Into<String>, page_ref: impl Into<String>, html: impl Into<String>) -> Self {
        let site = site.into();
        Self {
            language_hint: language_hint(&site, None),
            site,
            page_ref: page_ref.into(),
            source: PageSource::Html {
                html: html.into(),
                base_url: None,
            },
            fetched_at: Utc::now(),
        }
    }

    pub fn blocks(site: impl Into<String>, page_ref: impl Into<String>, blocks: Vec<Block>) -> Self {
        let site = site.into();
        Self {
            language_hint: language_hint(&site, None),
            site,
            page_ref: page_ref.into(),
            source: PageSource::Blocks(blocks),
            fetched_at: Utc::now(),
        }
    }

    /// `.json` files hold a block array; anything else is read as HTML.
    pub async fn from_path(site: &str, path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let page_ref = path.display().to_string();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let blocks: Vec<Block> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing blocks from {}", path.display()))?;
            Ok(Self::blocks(site, page_ref, blocks))
        } else {
            Ok(Self::html(site, page_ref, raw))
        }
    }

    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        if self.language_hint.is_none() {
            self.language_hint = language_hint(&self.site, Some(&base));
        }
        if let PageSource::Html { base_url, .. } = &mut self.source {
            *base_url = Some(base);
        }
        self
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }
}

/// Guess the page language from a site name like `mobile-bg` or a base URL's TLD.
pub fn language_hint(site: &str, base_url: Option<&str>) -> Option<Language> {
    let from_suffix = |suffix: &str| match suffix.to_ascii_lowercase().as_str() {
        "bg" => Some(Language::Bg),
        "de" | "at" => Some(Language::De),
        "fr" => Some(Language::Fr),
        "uk" => Some(Language::En),
        _ => None,
    };
    let site_suffix = site.rsplit(['-', '.', '_']).next().unwrap_or_default();
    from_suffix(site_suffix).or_else(|| {
        let host = base_url?
            .split("://")
            .nth(1)?
            .split(['/', ':'])
            .next()?;
        from_suffix(host.rsplit('.').next()?)
    })
}

/// `(site, listing link without fragment)`, or a page-local id when the block has no link.
pub fn ad_key(site: &str, page_ref: &str, block: &Block) -> AdKey {
    let listing = block
        .listing_ref
        .as_deref()
        .map(|r| r.split('#').next().unwrap_or(r).trim())
        .filter(|r| !r.is_empty());
    match listing {
        Some(listing) => AdKey::new(site, listing),
        None => AdKey::new(site, format!("{page_ref}#block-{}", block.id.0)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Ingested {
        ad_id: Uuid,
        ad_key: String,
        upsert: UpsertOutcome,
        variant: Option<String>,
        assignment: Assignment,
        tombstoned: Vec<Uuid>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub block_id: BlockId,
    pub density: f64,
    pub present_fields: Vec<FieldKey>,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    pub site: String,
    pub page_ref: String,
    pub blocks: usize,
    /// Blocks whose extraction was abandoned.
    pub timed_out: usize,
    pub ranking: Vec<RankEntry>,
    pub items: Vec<ItemReport>,
}

impl PageReport {
    pub fn ingested(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Ingested { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.ingested()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_ingested: usize,
    pub pages_failed: usize,
    pub containers: usize,
    pub ingested: usize,
    pub failed: usize,
    pub active_vehicles: usize,
    pub pending_reviews: usize,
    #[serde(skip)]
    pub pages: Vec<PageReport>,
}

pub struct IngestPipeline {
    config: SyncConfig,
    engine: EngineConfig,
    tokenizer: HtmlBlockSource,
    ranker: Arc<ContainerRanker>,
    normalizer: RecordNormalizer,
    records: RecordStore,
    cluster: ClusterBuilder,
    variants: BoundedLookup,
    checksums: Arc<dyn ChecksumSource>,
}

impl IngestPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let rules = RuleSet::load(&config)?;
        Self::with_rules(config, rules)
    }

    pub fn with_rules(config: SyncConfig, rules: RuleSet) -> Result<Self> {
        let RuleSet {
            patterns,
            tables,
            engine,
            variants,
        } = rules;
        engine.validate()?;
        let library = Arc::new(patterns);
        let ranker = Arc::new(ContainerRanker::new(
            Arc::clone(&library),
            engine.ranker.clone(),
        ));
        let normalizer = RecordNormalizer::new(library, Arc::new(tables));
        let audit = Arc::new(AuditStore::new(config.audit_dir.clone()));
        let cluster =
            ClusterBuilder::new(engine.cluster, audit).context("building cluster builder")?;
        let variants = BoundedLookup::new(
            Arc::new(variants),
            Duration::from_millis(engine.lookup_timeout_ms),
        );
        Ok(Self {
            tokenizer: HtmlBlockSource::new().context("building html tokenizer")?,
            config,
            engine,
            ranker,
            normalizer,
            records: RecordStore::new(),
            cluster,
            variants,
            checksums: Arc::new(NoImageChecksums),
        })
    }

    pub fn with_checksums(mut self, checksums: Arc<dyn ChecksumSource>) -> Self {
        self.checksums = checksums;
        self
    }

    pub fn with_variant_lookup(mut self, lookup: Arc<dyn VariantLookup>) -> Self {
        self.variants = BoundedLookup::new(
            lookup,
            Duration::from_millis(self.engine.lookup_timeout_ms),
        );
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn cluster(&self) -> &ClusterBuilder {
        &self.cluster
    }

    /// Run one page end to end. Container failures are recorded in the
    /// report and never abort the rest of the page.
    pub async fn ingest_page(&self, input: PageInput) -> Result<PageReport> {
        let span = info_span!("ingest_page", site = %input.site, page = %input.page_ref);
        self.ingest_page_inner(input).instrument(span).await
    }

    async fn ingest_page_inner(&self, input: PageInput) -> Result<PageReport> {
        let blocks = match &input.source {
            PageSource::Html { html, base_url } => match base_url {
                Some(base) => HtmlBlockSource::new()
                    .context("building html tokenizer")?
                    .with_base_url(base)
                    .blocks(html),
                None => self.tokenizer.blocks(html),
            },
            PageSource::Blocks(blocks) => blocks.clone(),
        };
        let block_count = blocks.len();
        let scored = self.score_blocks(blocks).await;
        let timed_out = scored.iter().filter(|s| s.timed_out).count();
        let selection = self.ranker.select(scored);
        debug!(
            blocks = block_count,
            containers = selection.containers.len(),
            "containers selected"
        );

        let mut items = Vec::with_capacity(selection.containers.len());
        for container in &selection.containers {
            let outcome = match self.ingest_container(&input, container).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(block = %container.id(), error = %format!("{err:#}"), "container failed");
                    ItemOutcome::Failed {
                        reason: format!("{err:#}"),
                    }
                }
            };
            items.push(ItemReport {
                block_id: container.id(),
                density: container.density,
                present_fields: container
                    .resolved
                    .iter()
                    .filter(|(_, r)| !r.is_null())
                    .map(|(field, _)| *field)
                    .collect(),
                outcome,
            });
        }

        let report = PageReport {
            site: input.site.clone(),
            page_ref: input.page_ref.clone(),
            blocks: block_count,
            timed_out,
            ranking: selection.ranking,
            items,
        };
        info!(
            containers = report.items.len(),
            ingested = report.ingested(),
            failed = report.failed(),
            "page ingested"
        );
        Ok(report)
    }

    /// Score every block on the blocking pool, each under its own deadline.
    /// Results come back in completion order; selection restores document order.
    async fn score_blocks(&self, blocks: Vec<Block>) -> Vec<ScoredBlock> {
        let budget = Duration::from_millis(self.engine.block_timeout_ms);
        let mut tasks = JoinSet::new();
        for block in blocks {
            let ranker = Arc::clone(&self.ranker);
            tasks.spawn(async move {
                let work = {
                    let block = block.clone();
                    tokio::task::spawn_blocking(move || ranker.score_block(&block))
                };
                match tokio::time::timeout(budget, work).await {
                    Ok(Ok(scored)) => scored,
                    Ok(Err(err)) => {
                        warn!(block = %block.id, error = %err, "block extraction aborted");
                        ScoredBlock::timed_out(block)
                    }
                    Err(_) => {
                        warn!(
                            block = %block.id,
                            timeout_ms = budget.as_millis() as u64,
                            "block extraction timed out"
                        );
                        ScoredBlock::timed_out(block)
                    }
                }
            });
        }
        let mut scored = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(block) => scored.push(block),
                Err(err) => warn!(error = %err, "block scoring task failed"),
            }
        }
        scored
    }

    async fn ingest_container(&self, input: &PageInput, scored: &ScoredBlock) -> Result<ItemOutcome> {
        let block = &scored.block;
        let key = ad_key(&input.site, &input.page_ref, block);
        let normalized = self
            .normalizer
            .normalize(&scored.resolved, input.language_hint);

        let mut record = AdRecord::new(key.clone(), normalized, input.fetched_at);
        record.source_url = block
            .listing_ref
            .clone()
            .filter(|r| r.starts_with("http://") || r.starts_with("https://"));
        record.raw = raw_fields(&scored.resolved);
        record.image_urls = block.image_urls.clone();
        record.image_checksums = match self.checksums.checksums(&key, &block.image_urls).await {
            Ok(checksums) => checksums,
            Err(err) => {
                warn!(ad = %key, error = %format!("{err:#}"), "image checksums unavailable");
                BTreeSet::new()
            }
        };

        let upserted = self
            .records
            .upsert(record)
            .await
            .with_context(|| format!("storing ad {key}"))?;
        let profile = upserted.record.profile();
        let variant = self
            .variants
            .resolve(profile.make.as_deref(), profile.model.as_deref(), &block.text)
            .await;
        let assigned = self
            .cluster
            .assign(&upserted.record, variant.as_deref())
            .await
            .with_context(|| format!("clustering ad {key}"))?;

        Ok(ItemOutcome::Ingested {
            ad_id: upserted.record.id,
            ad_key: key.to_string(),
            upsert: upserted.outcome,
            variant,
            assignment: assigned.assignment,
            tombstoned: assigned.tombstoned,
        })
    }

    /// Ingest pages in order. A page that cannot be read is logged and counted.
    pub async fn run(&self, pages: Vec<PageInput>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut reports = Vec::with_capacity(pages.len());
        let mut pages_failed = 0usize;
        for page in pages {
            let page_ref = page.page_ref.clone();
            match self.ingest_page(page).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    pages_failed += 1;
                    warn!(page = %page_ref, error = %format!("{err:#}"), "page ingestion failed");
                }
            }
        }
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_ingested: reports.len(),
            pages_failed,
            containers: reports.iter().map(|r| r.items.len()).sum(),
            ingested: reports.iter().map(PageReport::ingested).sum(),
            failed: reports.iter().map(PageReport::failed).sum(),
            active_vehicles: self.cluster.active_vehicles().await.len(),
            pending_reviews: self.cluster.pending_reviews().await.len(),
            pages: reports,
        };
        info!(
            run_id = %summary.run_id,
            ingested = summary.ingested,
            active_vehicles = summary.active_vehicles,
            "run finished"
        );
        Ok(summary)
    }

    /// Write `run_summary.md` and `page_reports.json` under `reports/<run_id>/`.
    pub async fn write_run_report(&self, summary: &RunSummary) -> Result<PathBuf> {
        let run_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let mut site_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for page in &summary.pages {
            *site_counts.entry(page.site.as_str()).or_default() += page.ingested();
        }
        let failures = summary
            .pages
            .iter()
            .flat_map(|page| {
                page.items.iter().filter_map(move |item| match &item.outcome {
                    ItemOutcome::Failed { reason } => Some(format!(
                        "- {} {}: {}",
                        page.page_ref, item.block_id, reason
                    )),
                    ItemOutcome::Ingested { .. } => None,
                })
            })
            .collect::<Vec<_>>();

        let brief = format!(
            "# carid run summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Pages: {} ({} failed)\n- Containers: {}\n- Ingested ads: {}\n- Failed containers: {}\n- Active vehicles: {}\n- Pending reviews: {}\n\n## Ads per site\n{}\n\n## Failures\n{}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.pages_ingested,
            summary.pages_failed,
            summary.containers,
            summary.ingested,
            summary.failed,
            summary.active_vehicles,
            summary.pending_reviews,
            site_counts
                .iter()
                .map(|(site, count)| format!("- {site}: {count}"))
                .collect::<Vec<_>>()
                .join("\n"),
            if failures.is_empty() {
                "- none".to_string()
            } else {
                failures.join("\n")
            }
        );
        fs::write(run_dir.join("run_summary.md"), brief)
            .await
            .context("writing run_summary.md")?;

        let pages_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run": summary,
            "pages": summary.pages,
        }))
        .context("serializing page reports")?;
        fs::write(run_dir.join("page_reports.json"), pages_json)
            .await
            .context("writing page_reports.json")?;

        Ok(run_dir)
    }

    /// Export parquet snapshots of records, vehicles and edges into `<run_dir>/snapshots`.
    pub async fn export_snapshots(&self, run_dir: &Path) -> Result<PathBuf> {
        let records = self.records.all().await;
        let links = self.cluster.link_states().await;
        let vehicles = self.cluster.vehicles().await;
        let edges = self.cluster.edges().await;
        snapshot::export(run_dir, &records, &links, &vehicles, &edges).await
    }
}

/// Markdown digest of the most recent `runs` reports under `reports_root`.
pub fn report_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| (e.metadata().and_then(|m| m.modified()).ok(), e.file_name()));
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# carid runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let pages_path = dir.path().join("page_reports.json");
        let summary_path = dir.path().join("run_summary.md");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&pages_path)
                .with_context(|| format!("reading {}", pages_path.display()))?,
        )
        .with_context(|| format!("parsing {}", pages_path.display()))?;
        let count = |name: &str| {
            value
                .get("run")
                .and_then(|run| run.get(name))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- ingested ads: {}", count("ingested")));
        lines.push(format!("- failed containers: {}", count("failed")));
        lines.push(format!("- active vehicles: {}", count("active_vehicles")));
        lines.push(format!("- pending reviews: {}", count("pending_reviews")));
        lines.push(format!("- page reports: `{}`", pages_path.display()));
        if summary_path.exists() {
            lines.push(format!("- summary: `{}`", summary_path.display()));
        }
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
