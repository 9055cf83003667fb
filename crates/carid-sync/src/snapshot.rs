//! Parquet snapshots of the record store and the cluster pool.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    BooleanArray, Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use carid_core::{
    AdRecord, CanonicalVehicle, EdgeEndpoint, LinkState, SimilarityEdge, Veto, VehicleStatus,
};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

pub(crate) async fn export(
    run_dir: &Path,
    records: &[AdRecord],
    links: &BTreeMap<Uuid, LinkState>,
    vehicles: &[CanonicalVehicle],
    edges: &[SimilarityEdge],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let records_path = snapshot_dir.join("ad_records.parquet");
    let vehicles_path = snapshot_dir.join("canonical_vehicles.parquet");
    let edges_path = snapshot_dir.join("similarity_edges.parquet");

    write_ad_records_parquet(&records_path, records, links)?;
    write_vehicles_parquet(&vehicles_path, vehicles)?;
    write_edges_parquet(&edges_path, edges)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("ad_records", run_dir, &records_path, records.len())?,
            manifest_entry("canonical_vehicles", run_dir, &vehicles_path, vehicles.len())?,
            manifest_entry("similarity_edges", run_dir, &edges_path, edges.len())?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<T>(rows: &[T], f: impl Fn(&T) -> Option<String>) -> StringArray {
    StringArray::from(rows.iter().map(f).collect::<Vec<_>>())
}

fn link_columns(state: LinkState) -> (&'static str, Option<Uuid>) {
    match state {
        LinkState::Unlinked => ("unlinked", None),
        LinkState::CandidateMatched { vehicle_id, .. } => ("candidate_matched", Some(vehicle_id)),
        LinkState::Linked { vehicle_id } => ("linked", Some(vehicle_id)),
    }
}

fn write_ad_records_parquet(
    path: &Path,
    records: &[AdRecord],
    links: &BTreeMap<Uuid, LinkState>,
) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("ad_id", DataType::Utf8, false),
        ArrowField::new("source_site", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("make", DataType::Utf8, true),
        ArrowField::new("model", DataType::Utf8, true),
        ArrowField::new("year", DataType::Int32, true),
        ArrowField::new("price_amount", DataType::Float64, true),
        ArrowField::new("price_currency", DataType::Utf8, true),
        ArrowField::new("mileage_km", DataType::Float64, true),
        ArrowField::new("vin", DataType::Utf8, true),
        ArrowField::new("link_state", DataType::Utf8, false),
        ArrowField::new("vehicle_id", DataType::Utf8, true),
        ArrowField::new("content_hash", DataType::Utf8, false),
        ArrowField::new("first_seen", DataType::Utf8, false),
        ArrowField::new("last_seen", DataType::Utf8, false),
    ]));

    let profiles = records.iter().map(AdRecord::profile).collect::<Vec<_>>();
    let link_of = |r: &AdRecord| link_columns(links.get(&r.id).copied().unwrap_or_default());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(records, |r| Some(r.id.to_string()))),
            Arc::new(strings(records, |r| Some(r.key.source_site.clone()))),
            Arc::new(strings(records, |r| Some(r.key.source_id.clone()))),
            Arc::new(strings(records, |r| r.source_url.clone())),
            Arc::new(strings(&profiles, |p| p.title.clone())),
            Arc::new(strings(&profiles, |p| p.make.clone())),
            Arc::new(strings(&profiles, |p| p.model.clone())),
            Arc::new(Int32Array::from(
                profiles.iter().map(|p| p.year).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                profiles
                    .iter()
                    .map(|p| p.price.map(|m| m.amount))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(strings(&profiles, |p| {
                p.price.map(|m| m.currency.iso_code().to_string())
            })),
            Arc::new(Float64Array::from(
                profiles.iter().map(|p| p.mileage_km).collect::<Vec<_>>(),
            )),
            Arc::new(strings(&profiles, |p| p.vin.clone())),
            Arc::new(strings(records, |r| Some(link_of(r).0.to_string()))),
            Arc::new(strings(records, |r| link_of(r).1.map(|id| id.to_string()))),
            Arc::new(strings(records, |r| Some(r.content_hash.clone()))),
            Arc::new(strings(records, |r| Some(r.first_seen.to_rfc3339()))),
            Arc::new(strings(records, |r| Some(r.last_seen.to_rfc3339()))),
        ],
    )
    .context("building ad_records record batch")?;
    write_parquet(path, batch)
}

fn write_vehicles_parquet(path: &Path, vehicles: &[CanonicalVehicle]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("vehicle_id", DataType::Utf8, false),
        ArrowField::new("scope", DataType::Utf8, false),
        ArrowField::new("variant", DataType::Utf8, true),
        ArrowField::new("vin", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("merged_into", DataType::Utf8, true),
        ArrowField::new("member_count", DataType::UInt32, false),
        ArrowField::new("revision", DataType::UInt64, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("year", DataType::Int32, true),
        ArrowField::new("updated_at", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(vehicles, |v| Some(v.id.to_string()))),
            Arc::new(strings(vehicles, |v| Some(v.scope.clone()))),
            Arc::new(strings(vehicles, |v| v.variant.clone())),
            Arc::new(strings(vehicles, |v| v.vin.clone())),
            Arc::new(strings(vehicles, |v| {
                Some(
                    match v.status {
                        VehicleStatus::Active => "active",
                        VehicleStatus::Tombstoned => "tombstoned",
                    }
                    .to_string(),
                )
            })),
            Arc::new(strings(vehicles, |v| v.merged_into.map(|id| id.to_string()))),
            Arc::new(UInt32Array::from(
                vehicles
                    .iter()
                    .map(|v| v.members.len() as u32)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                vehicles.iter().map(|v| v.revision).collect::<Vec<_>>(),
            )),
            Arc::new(strings(vehicles, |v| v.representative.title.clone())),
            Arc::new(Int32Array::from(
                vehicles
                    .iter()
                    .map(|v| v.representative.year)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(strings(vehicles, |v| Some(v.updated_at.to_rfc3339()))),
        ],
    )
    .context("building canonical_vehicles record batch")?;
    write_parquet(path, batch)
}

fn endpoint(e: EdgeEndpoint) -> (&'static str, Uuid) {
    match e {
        EdgeEndpoint::Ad(id) => ("ad", id),
        EdgeEndpoint::Vehicle(id) => ("vehicle", id),
    }
}

fn write_edges_parquet(path: &Path, edges: &[SimilarityEdge]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("edge_id", DataType::Utf8, false),
        ArrowField::new("a_kind", DataType::Utf8, false),
        ArrowField::new("a_id", DataType::Utf8, false),
        ArrowField::new("b_kind", DataType::Utf8, false),
        ArrowField::new("b_id", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("vin_match", DataType::Boolean, false),
        ArrowField::new("veto", DataType::Utf8, true),
        ArrowField::new("recorded_at", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(edges, |e| Some(e.id.to_string()))),
            Arc::new(strings(edges, |e| Some(endpoint(e.a).0.to_string()))),
            Arc::new(strings(edges, |e| Some(endpoint(e.a).1.to_string()))),
            Arc::new(strings(edges, |e| Some(endpoint(e.b).0.to_string()))),
            Arc::new(strings(edges, |e| Some(endpoint(e.b).1.to_string()))),
            Arc::new(Float64Array::from(
                edges.iter().map(|e| e.score).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                edges
                    .iter()
                    .map(|e| e.breakdown.vin_match)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(strings(edges, |e| {
                e.breakdown.veto.map(|veto| {
                    match veto {
                        Veto::VinMismatch => "vin_mismatch",
                        Veto::YearMismatch => "year_mismatch",
                    }
                    .to_string()
                })
            })),
            Arc::new(strings(edges, |e| Some(e.recorded_at.to_rfc3339()))),
        ],
    )
    .context("building similarity_edges record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}
