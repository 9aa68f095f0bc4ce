//! Loader Service - Loads survey CSV extracts into the warehouse star schema
//!
//! Responsibilities:
//! - Classify incoming extract files by name (item group lookup, household
//!   consumption, CPI)
//! - Parse CSV content into typed rows with cell-level value normalization
//! - Upsert dimension rows without duplicates and resolve surrogate keys
//! - Assemble fact rows, dropping any row whose dimension lookup fails
//! - Load each file atomically, skipping fact tables that are already populated
//!
//! Usage:
//!   # Load extracts from the default store:
//!   cargo run --bin loader -- clean_cpi_data.csv
//!
//!   # Explicit store root, parse-only:
//!   cargo run --bin loader -- --data-dir ./data --dry-run \
//!       item_group_srl_no_household_consumption.csv \
//!       filtered_dataset_household_consumption.csv

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use tokio::fs;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads survey CSV extracts into the warehouse star schema")]
struct Args {
    /// Object keys of the extract files to process, in order
    #[arg(required = true)]
    files: Vec<String>,

    /// Root directory of the extract store (overrides DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Classify and parse only - don't write to the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    data_dir: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
        })
    }
}

// =============================================================================
// Extract Store
// =============================================================================

/// Filesystem-backed extract store: resolves an object key to UTF-8 content.
struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    fn open(root: PathBuf) -> Result<Self> {
        anyhow::ensure!(
            root.is_dir(),
            "data directory {} does not exist",
            root.display()
        );
        Ok(Self { root })
    }

    async fn fetch(&self, key: &str) -> Result<String> {
        let path = self.root.join(key);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        String::from_utf8(bytes)
            .with_context(|| format!("{} is not valid UTF-8", path.display()))
    }
}

// =============================================================================
// File Classification
// =============================================================================

const ITEM_GROUP_MARKER: &str = "item_group_srl_no";
const HOUSEHOLD_MARKER: &str = "household_consumption";
const CPI_MARKER: &str = "cpi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractType {
    ItemGroupDimension,
    HouseholdConsumption,
    Cpi,
}

impl ExtractType {
    /// Target fact table, if this extract feeds one. The item group lookup
    /// only populates a dimension.
    fn fact_table(self) -> Option<&'static str> {
        match self {
            ExtractType::ItemGroupDimension => None,
            ExtractType::HouseholdConsumption => Some("fact_household_consumption"),
            ExtractType::Cpi => Some("fact_cpi"),
        }
    }
}

/// Route a file name to its extract type by case-insensitive substring match.
/// Most specific marker first: the item group lookup file name contains the
/// household consumption marker as a substring.
fn classify(file_name: &str) -> Option<ExtractType> {
    let name = file_name.to_lowercase();
    if name.contains(ITEM_GROUP_MARKER) {
        Some(ExtractType::ItemGroupDimension)
    } else if name.contains(HOUSEHOLD_MARKER) {
        Some(ExtractType::HouseholdConsumption)
    } else if name.contains(CPI_MARKER) {
        Some(ExtractType::Cpi)
    } else {
        None
    }
}

// =============================================================================
// Cell Value Normalization
// =============================================================================

/// Convert a raw cell to a float, returning None for absent values, empty
/// strings, a case-insensitive "NaN" marker, or anything unparseable.
fn normalize_float(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Convert a raw cell to an integer with the same missing-value handling as
/// [`normalize_float`]. Parses through f64 first so values exported as "12.0"
/// still land as 12.
fn normalize_int(raw: &str) -> Option<i64> {
    normalize_float(raw).map(|v| v as i64)
}

// =============================================================================
// Typed Extract Rows
// =============================================================================

#[derive(Debug, Deserialize)]
struct ItemGroupRecord {
    #[serde(rename = "Value", default)]
    value: String,
    #[serde(rename = "Label", default)]
    label: String,
}

/// One row of the item group lookup extract. The label here is authoritative
/// and may overwrite an earlier fallback description.
#[derive(Debug, Clone, PartialEq)]
struct ItemGroupRow {
    serial: Option<i64>,
    description: String,
}

#[derive(Debug, Deserialize)]
struct HouseholdConsumptionRecord {
    #[serde(rename = "HHID", default)]
    hhid: String,
    #[serde(rename = "Sector", default)]
    sector: String,
    #[serde(rename = "Item_Group_Srl_No", default)]
    item_group_srl_no: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "District", default)]
    district: String,
    #[serde(rename = "District_Code", default)]
    district_code: String,
    #[serde(rename = "State_Region", default)]
    state_region: String,
    #[serde(rename = "Value_of_Consumption_Last_30_Day", default)]
    consumption_30: String,
    #[serde(rename = "Value_Consumption_Last_365_Days", default)]
    consumption_365: String,
}

#[derive(Debug, Clone, PartialEq)]
struct HouseholdConsumptionRow {
    hhid: String,
    sector: Option<i64>,
    item_group_srl_no: Option<i64>,
    state: String,
    district: String,
    district_code: String,
    state_region: String,
    consumption_30: Option<f64>,
    consumption_365: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CpiRecord {
    #[serde(rename = "BaseYear", default)]
    base_year: String,
    #[serde(rename = "Year", default)]
    year: String,
    #[serde(rename = "Month", default)]
    month: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Sector", default)]
    sector: String,
    #[serde(rename = "Group", default)]
    group: String,
    #[serde(rename = "SubGroup", default)]
    sub_group: String,
    #[serde(rename = "Index", default)]
    index: String,
    #[serde(rename = "Inflation (%)", default)]
    inflation: String,
}

#[derive(Debug, Clone, PartialEq)]
struct CpiRow {
    base_year: Option<i64>,
    year: Option<i64>,
    month: String,
    state: String,
    sector: String,
    group: String,
    sub_group: String,
    index_value: Option<f64>,
    inflation: Option<f64>,
}

fn csv_reader(content: &str) -> csv::Reader<&[u8]> {
    // Strip a UTF-8 BOM if present so the first header matches.
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes())
}

fn parse_item_group_csv(content: &str) -> Vec<ItemGroupRow> {
    let mut rows = Vec::new();
    for (idx, result) in csv_reader(content).deserialize().enumerate() {
        let record: ItemGroupRecord = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping malformed record at line {}: {}", idx + 2, e);
                continue;
            }
        };
        rows.push(ItemGroupRow {
            serial: normalize_int(&record.value),
            description: record.label.trim().to_string(),
        });
    }
    rows
}

fn parse_household_csv(content: &str) -> Vec<HouseholdConsumptionRow> {
    let mut rows = Vec::new();
    for (idx, result) in csv_reader(content).deserialize().enumerate() {
        let record: HouseholdConsumptionRecord = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping malformed record at line {}: {}", idx + 2, e);
                continue;
            }
        };
        rows.push(HouseholdConsumptionRow {
            hhid: record.hhid.trim().to_string(),
            sector: normalize_int(&record.sector),
            item_group_srl_no: normalize_int(&record.item_group_srl_no),
            state: record.state.trim().to_string(),
            district: record.district.trim().to_string(),
            district_code: record.district_code.trim().to_string(),
            state_region: record.state_region.trim().to_string(),
            consumption_30: normalize_float(&record.consumption_30),
            consumption_365: normalize_float(&record.consumption_365),
        });
    }
    rows
}

fn parse_cpi_csv(content: &str) -> Vec<CpiRow> {
    let mut rows = Vec::new();
    for (idx, result) in csv_reader(content).deserialize().enumerate() {
        let record: CpiRecord = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping malformed record at line {}: {}", idx + 2, e);
                continue;
            }
        };
        rows.push(CpiRow {
            base_year: normalize_int(&record.base_year),
            year: normalize_int(&record.year),
            month: record.month.trim().to_string(),
            state: record.state.trim().to_string(),
            sector: record.sector.trim().to_string(),
            group: record.group.trim().to_string(),
            sub_group: record.sub_group.trim().to_string(),
            index_value: normalize_float(&record.index),
            inflation: normalize_float(&record.inflation),
        });
    }
    rows
}

// =============================================================================
// Dimension Natural Keys
// =============================================================================

/// Natural key of a geography row. Missing components are canonicalized to
/// the empty string on both the insert and the lookup path, so the same
/// tuple always matches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct GeographyKey {
    state: String,
    district: String,
    district_code: String,
    state_region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct TimeKey {
    base_year: i64,
    year: i64,
    month: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct CpiContextKey {
    state: String,
    sector: String,
    group: String,
    sub_group: String,
}

impl HouseholdConsumptionRow {
    fn geography_key(&self) -> GeographyKey {
        GeographyKey {
            state: self.state.clone(),
            district: self.district.clone(),
            district_code: self.district_code.clone(),
            state_region: self.state_region.clone(),
        }
    }
}

impl CpiRow {
    /// None when either year component is missing; such rows cannot reference
    /// a time period and are dropped at assembly.
    fn time_key(&self) -> Option<TimeKey> {
        Some(TimeKey {
            base_year: self.base_year?,
            year: self.year?,
            month: self.month.clone(),
        })
    }

    fn context_key(&self) -> CpiContextKey {
        CpiContextKey {
            state: self.state.clone(),
            sector: self.sector.clone(),
            group: self.group.clone(),
            sub_group: self.sub_group.clone(),
        }
    }
}

fn sector_description(code: i64) -> String {
    format!("Sector {code}")
}

fn fallback_item_group_description(serial: i64) -> String {
    format!("Item Group {serial}")
}

// =============================================================================
// Dimension Collection
// =============================================================================

/// Distinct dimension tuples referenced by a household consumption extract.
/// Ordered sets keep the generated statements deterministic.
#[derive(Debug, Default, PartialEq)]
struct HouseholdDimensions {
    households: BTreeSet<String>,
    sectors: BTreeMap<i64, String>,
    item_groups: BTreeMap<i64, String>,
    geographies: BTreeSet<GeographyKey>,
}

fn collect_household_dimensions(rows: &[HouseholdConsumptionRow]) -> HouseholdDimensions {
    let mut dims = HouseholdDimensions::default();
    for row in rows {
        if !row.hhid.is_empty() {
            dims.households.insert(row.hhid.clone());
        }
        if let Some(code) = row.sector {
            dims.sectors.insert(code, sector_description(code));
        }
        if let Some(serial) = row.item_group_srl_no {
            dims.item_groups
                .entry(serial)
                .or_insert_with(|| fallback_item_group_description(serial));
        }
        dims.geographies.insert(row.geography_key());
    }
    dims
}

/// Authoritative serial -> label map. The last occurrence of a serial wins,
/// so a single upsert statement never updates the same row twice.
fn collect_item_groups(rows: &[ItemGroupRow]) -> BTreeMap<i64, String> {
    let mut groups = BTreeMap::new();
    for row in rows {
        if let Some(serial) = row.serial {
            groups.insert(serial, row.description.clone());
        }
    }
    groups
}

#[derive(Debug, Default, PartialEq)]
struct CpiDimensions {
    periods: BTreeSet<TimeKey>,
    contexts: BTreeSet<CpiContextKey>,
}

fn collect_cpi_dimensions(rows: &[CpiRow]) -> CpiDimensions {
    let mut dims = CpiDimensions::default();
    for row in rows {
        if let Some(key) = row.time_key() {
            dims.periods.insert(key);
        }
        dims.contexts.insert(row.context_key());
    }
    dims
}

// =============================================================================
// Warehouse Schema
// =============================================================================

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS dim_household (
        hhid VARCHAR(50) PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS dim_geography (
        geography_id BIGSERIAL PRIMARY KEY,
        state TEXT NOT NULL,
        district TEXT NOT NULL,
        district_code TEXT NOT NULL,
        state_region TEXT NOT NULL,
        UNIQUE (state, district, district_code, state_region)
    )",
    "CREATE TABLE IF NOT EXISTS dim_sector (
        sector BIGINT PRIMARY KEY,
        description TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dim_item_group (
        item_group_srl_no BIGINT PRIMARY KEY,
        description TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dim_time_cpi (
        time_id BIGSERIAL PRIMARY KEY,
        base_year BIGINT NOT NULL,
        year BIGINT NOT NULL,
        month TEXT NOT NULL,
        UNIQUE (base_year, year, month)
    )",
    "CREATE TABLE IF NOT EXISTS dim_cpi_context (
        context_id BIGSERIAL PRIMARY KEY,
        state TEXT NOT NULL,
        sector TEXT NOT NULL,
        group_name TEXT NOT NULL,
        sub_group TEXT NOT NULL,
        UNIQUE (state, sector, group_name, sub_group)
    )",
    "CREATE TABLE IF NOT EXISTS fact_household_consumption (
        consumption_id BIGSERIAL PRIMARY KEY,
        hhid VARCHAR(50) NOT NULL REFERENCES dim_household(hhid),
        geography_id BIGINT NOT NULL REFERENCES dim_geography(geography_id),
        sector BIGINT NOT NULL REFERENCES dim_sector(sector),
        item_group_srl_no BIGINT NOT NULL REFERENCES dim_item_group(item_group_srl_no),
        value_consumption_last_30_day DOUBLE PRECISION,
        value_consumption_last_365_days DOUBLE PRECISION
    )",
    "CREATE TABLE IF NOT EXISTS fact_cpi (
        cpi_id BIGSERIAL PRIMARY KEY,
        time_id BIGINT NOT NULL REFERENCES dim_time_cpi(time_id),
        context_id BIGINT NOT NULL REFERENCES dim_cpi_context(context_id),
        index_value DOUBLE PRECISION,
        inflation DOUBLE PRECISION
    )",
];

/// Create all warehouse tables if absent. Runs once at startup.
async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for ddl in SCHEMA {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .context("failed to create warehouse schema")?;
    }
    Ok(())
}

// =============================================================================
// Dimension Upserts and Key Resolution
// =============================================================================

/// Rows per batched INSERT statement; keeps bind counts well under the
/// Postgres protocol limit.
const INSERT_CHUNK: usize = 1000;

async fn upsert_households(
    conn: &mut PgConnection,
    households: &BTreeSet<String>,
) -> Result<()> {
    let hhids: Vec<&String> = households.iter().collect();
    for chunk in hhids.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO dim_household (hhid) ");
        qb.push_values(chunk, |mut b, hhid| {
            b.push_bind(hhid.as_str());
        });
        qb.push(" ON CONFLICT (hhid) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Insert-only: later occurrences never overwrite an existing description.
async fn upsert_sectors(
    conn: &mut PgConnection,
    sectors: &BTreeMap<i64, String>,
) -> Result<()> {
    let entries: Vec<(&i64, &String)> = sectors.iter().collect();
    for chunk in entries.chunks(INSERT_CHUNK) {
        let mut qb =
            QueryBuilder::<Postgres>::new("INSERT INTO dim_sector (sector, description) ");
        qb.push_values(chunk, |mut b, (code, description)| {
            b.push_bind(**code).push_bind(description.as_str());
        });
        qb.push(" ON CONFLICT (sector) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// The item group lookup extract is the authoritative source for labels and
/// may overwrite; the fallback labels synthesized from the consumption
/// extract must not, whichever file arrives first.
async fn upsert_item_groups(
    conn: &mut PgConnection,
    groups: &BTreeMap<i64, String>,
    authoritative: bool,
) -> Result<()> {
    let conflict = if authoritative {
        " ON CONFLICT (item_group_srl_no) DO UPDATE SET description = EXCLUDED.description"
    } else {
        " ON CONFLICT (item_group_srl_no) DO NOTHING"
    };
    let entries: Vec<(&i64, &String)> = groups.iter().collect();
    for chunk in entries.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO dim_item_group (item_group_srl_no, description) ",
        );
        qb.push_values(chunk, |mut b, (serial, description)| {
            b.push_bind(**serial).push_bind(description.as_str());
        });
        qb.push(conflict);
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn upsert_geographies(
    conn: &mut PgConnection,
    keys: &BTreeSet<GeographyKey>,
) -> Result<()> {
    let entries: Vec<&GeographyKey> = keys.iter().collect();
    for chunk in entries.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO dim_geography (state, district, district_code, state_region) ",
        );
        qb.push_values(chunk, |mut b, key| {
            b.push_bind(key.state.as_str())
                .push_bind(key.district.as_str())
                .push_bind(key.district_code.as_str())
                .push_bind(key.state_region.as_str());
        });
        qb.push(" ON CONFLICT (state, district, district_code, state_region) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn upsert_time_periods(
    conn: &mut PgConnection,
    periods: &BTreeSet<TimeKey>,
) -> Result<()> {
    let entries: Vec<&TimeKey> = periods.iter().collect();
    for chunk in entries.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO dim_time_cpi (base_year, year, month) ",
        );
        qb.push_values(chunk, |mut b, key| {
            b.push_bind(key.base_year)
                .push_bind(key.year)
                .push_bind(key.month.as_str());
        });
        qb.push(" ON CONFLICT (base_year, year, month) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn upsert_cpi_contexts(
    conn: &mut PgConnection,
    contexts: &BTreeSet<CpiContextKey>,
) -> Result<()> {
    let entries: Vec<&CpiContextKey> = contexts.iter().collect();
    for chunk in entries.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO dim_cpi_context (state, sector, group_name, sub_group) ",
        );
        qb.push_values(chunk, |mut b, key| {
            b.push_bind(key.state.as_str())
                .push_bind(key.sector.as_str())
                .push_bind(key.group.as_str())
                .push_bind(key.sub_group.as_str());
        });
        qb.push(" ON CONFLICT (state, sector, group_name, sub_group) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Batched inserts don't return generated keys, and keys may predate this run,
/// so the natural-key -> surrogate-key mapping is rebuilt from the table after
/// the upsert.
async fn geography_key_map(conn: &mut PgConnection) -> Result<HashMap<GeographyKey, i64>> {
    let rows: Vec<(i64, String, String, String, String)> = sqlx::query_as(
        "SELECT geography_id, state, district, district_code, state_region FROM dim_geography",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, state, district, district_code, state_region)| {
            (
                GeographyKey {
                    state,
                    district,
                    district_code,
                    state_region,
                },
                id,
            )
        })
        .collect())
}

async fn time_key_map(conn: &mut PgConnection) -> Result<HashMap<TimeKey, i64>> {
    let rows: Vec<(i64, i64, i64, String)> =
        sqlx::query_as("SELECT time_id, base_year, year, month FROM dim_time_cpi")
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(id, base_year, year, month)| {
            (
                TimeKey {
                    base_year,
                    year,
                    month,
                },
                id,
            )
        })
        .collect())
}

async fn cpi_context_key_map(conn: &mut PgConnection) -> Result<HashMap<CpiContextKey, i64>> {
    let rows: Vec<(i64, String, String, String, String)> = sqlx::query_as(
        "SELECT context_id, state, sector, group_name, sub_group FROM dim_cpi_context",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, state, sector, group, sub_group)| {
            (
                CpiContextKey {
                    state,
                    sector,
                    group,
                    sub_group,
                },
                id,
            )
        })
        .collect())
}

/// Upsert authoritative item group labels. Returns the distinct serial count.
async fn resolve_item_group_dimension(
    conn: &mut PgConnection,
    rows: &[ItemGroupRow],
) -> Result<usize> {
    let groups = collect_item_groups(rows);
    upsert_item_groups(conn, &groups, true).await?;
    Ok(groups.len())
}

/// Upsert every dimension a household consumption extract references and
/// return the geography key map needed for fact assembly. Households, sectors
/// and item groups are referenced by their natural key directly.
async fn resolve_household_dimensions(
    conn: &mut PgConnection,
    rows: &[HouseholdConsumptionRow],
) -> Result<HashMap<GeographyKey, i64>> {
    let dims = collect_household_dimensions(rows);
    upsert_households(conn, &dims.households).await?;
    upsert_sectors(conn, &dims.sectors).await?;
    upsert_item_groups(conn, &dims.item_groups, false).await?;
    upsert_geographies(conn, &dims.geographies).await?;
    geography_key_map(conn).await
}

async fn resolve_cpi_dimensions(
    conn: &mut PgConnection,
    rows: &[CpiRow],
) -> Result<(HashMap<TimeKey, i64>, HashMap<CpiContextKey, i64>)> {
    let dims = collect_cpi_dimensions(rows);
    upsert_time_periods(conn, &dims.periods).await?;
    upsert_cpi_contexts(conn, &dims.contexts).await?;
    Ok((time_key_map(conn).await?, cpi_context_key_map(conn).await?))
}

// =============================================================================
// Fact Assembly
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct HouseholdFact {
    hhid: String,
    geography_id: i64,
    sector: i64,
    item_group_srl_no: i64,
    consumption_30: Option<f64>,
    consumption_365: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct CpiFact {
    time_id: i64,
    context_id: i64,
    index_value: Option<f64>,
    inflation: Option<f64>,
}

/// Join each parsed row against the resolved dimension keys. A row with any
/// unresolvable reference is dropped and counted; no partial fact rows are
/// ever emitted. Input order is preserved.
fn assemble_household_facts(
    rows: &[HouseholdConsumptionRow],
    geographies: &HashMap<GeographyKey, i64>,
) -> (Vec<HouseholdFact>, usize) {
    let mut facts = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    for row in rows {
        if row.hhid.is_empty() {
            dropped += 1;
            continue;
        }
        let (Some(sector), Some(item_group_srl_no)) = (row.sector, row.item_group_srl_no)
        else {
            dropped += 1;
            continue;
        };
        let Some(&geography_id) = geographies.get(&row.geography_key()) else {
            dropped += 1;
            continue;
        };
        facts.push(HouseholdFact {
            hhid: row.hhid.clone(),
            geography_id,
            sector,
            item_group_srl_no,
            consumption_30: row.consumption_30,
            consumption_365: row.consumption_365,
        });
    }
    (facts, dropped)
}

fn assemble_cpi_facts(
    rows: &[CpiRow],
    periods: &HashMap<TimeKey, i64>,
    contexts: &HashMap<CpiContextKey, i64>,
) -> (Vec<CpiFact>, usize) {
    let mut facts = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    for row in rows {
        let Some(&time_id) = row.time_key().as_ref().and_then(|k| periods.get(k)) else {
            dropped += 1;
            continue;
        };
        let Some(&context_id) = contexts.get(&row.context_key()) else {
            dropped += 1;
            continue;
        };
        facts.push(CpiFact {
            time_id,
            context_id,
            index_value: row.index_value,
            inflation: row.inflation,
        });
    }
    (facts, dropped)
}

// =============================================================================
// Fact Loading
// =============================================================================

async fn insert_household_facts(
    conn: &mut PgConnection,
    facts: &[HouseholdFact],
) -> Result<()> {
    for chunk in facts.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO fact_household_consumption \
             (hhid, geography_id, sector, item_group_srl_no, \
              value_consumption_last_30_day, value_consumption_last_365_days) ",
        );
        qb.push_values(chunk, |mut b, fact| {
            b.push_bind(fact.hhid.as_str())
                .push_bind(fact.geography_id)
                .push_bind(fact.sector)
                .push_bind(fact.item_group_srl_no)
                .push_bind(fact.consumption_30)
                .push_bind(fact.consumption_365);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_cpi_facts(conn: &mut PgConnection, facts: &[CpiFact]) -> Result<()> {
    for chunk in facts.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO fact_cpi (time_id, context_id, index_value, inflation) ",
        );
        qb.push_values(chunk, |mut b, fact| {
            b.push_bind(fact.time_id)
                .push_bind(fact.context_id)
                .push_bind(fact.index_value)
                .push_bind(fact.inflation);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Fact tables are write-once per dataset: any existing rows mean the extract
/// was already loaded and the file is skipped.
async fn fact_table_row_count(pool: &PgPool, table: &str) -> Result<i64> {
    // `table` is a fixed name from ExtractType, never caller input.
    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// =============================================================================
// Per-File Load
// =============================================================================

#[derive(Debug)]
enum FileOutcome {
    Unrecognized,
    AlreadyLoaded,
    DryRun { rows: usize },
    Loaded { rows: usize, facts: usize, dropped: usize },
}

/// Process one extract file end to end. Dimension upserts and fact inserts
/// run in a single transaction, so a failure anywhere rolls the whole file
/// back and leaves the other files untouched.
async fn load_file(
    pool: &PgPool,
    store: &LocalStore,
    key: &str,
    dry_run: bool,
) -> Result<FileOutcome> {
    let Some(extract) = classify(key) else {
        return Ok(FileOutcome::Unrecognized);
    };
    info!("classified '{}' as {:?}", key, extract);

    if let Some(table) = extract.fact_table() {
        if fact_table_row_count(pool, table).await? > 0 {
            return Ok(FileOutcome::AlreadyLoaded);
        }
    }

    let content = store.fetch(key).await?;

    match extract {
        ExtractType::ItemGroupDimension => {
            let rows = parse_item_group_csv(&content);
            if dry_run {
                return Ok(FileOutcome::DryRun { rows: rows.len() });
            }
            let mut tx = pool.begin().await?;
            let distinct = resolve_item_group_dimension(&mut tx, &rows).await?;
            tx.commit().await?;
            info!("upserted {} item group labels from '{}'", distinct, key);
            Ok(FileOutcome::Loaded {
                rows: rows.len(),
                facts: 0,
                dropped: 0,
            })
        }
        ExtractType::HouseholdConsumption => {
            let rows = parse_household_csv(&content);
            if dry_run {
                return Ok(FileOutcome::DryRun { rows: rows.len() });
            }
            let mut tx = pool.begin().await?;
            let geographies = resolve_household_dimensions(&mut tx, &rows).await?;
            let (facts, dropped) = assemble_household_facts(&rows, &geographies);
            insert_household_facts(&mut tx, &facts).await?;
            tx.commit().await?;
            Ok(FileOutcome::Loaded {
                rows: rows.len(),
                facts: facts.len(),
                dropped,
            })
        }
        ExtractType::Cpi => {
            let rows = parse_cpi_csv(&content);
            if dry_run {
                return Ok(FileOutcome::DryRun { rows: rows.len() });
            }
            let mut tx = pool.begin().await?;
            let (periods, contexts) = resolve_cpi_dimensions(&mut tx, &rows).await?;
            let (facts, dropped) = assemble_cpi_facts(&rows, &periods, &contexts);
            insert_cpi_facts(&mut tx, &facts).await?;
            tx.commit().await?;
            Ok(FileOutcome::Loaded {
                rows: rows.len(),
                facts: facts.len(),
                dropped,
            })
        }
    }
}

// =============================================================================
// Entry Point
// =============================================================================

#[derive(Debug, Default)]
struct RunSummary {
    loaded: usize,
    skipped: usize,
    failed: usize,
    facts: usize,
    dropped: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let data_dir = args.data_dir.unwrap_or(config.data_dir);
    let store = LocalStore::open(data_dir)?;

    // One connection, reused serially across files.
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.db_url)
        .await
        .context("failed to connect to the warehouse database")?;

    ensure_schema(&pool).await?;

    let mut summary = RunSummary::default();
    for key in &args.files {
        match load_file(&pool, &store, key, args.dry_run).await {
            Ok(FileOutcome::Unrecognized) => {
                warn!("'{}' does not match any known extract type, skipping", key);
                summary.skipped += 1;
            }
            Ok(FileOutcome::AlreadyLoaded) => {
                info!("'{}' target fact table already populated, skipping", key);
                summary.skipped += 1;
            }
            Ok(FileOutcome::DryRun { rows }) => {
                info!("dry run: '{}' parsed {} rows", key, rows);
            }
            Ok(FileOutcome::Loaded {
                rows,
                facts,
                dropped,
            }) => {
                info!(
                    "loaded '{}': {} rows in, {} facts written, {} dropped",
                    key, rows, facts, dropped
                );
                summary.loaded += 1;
                summary.facts += facts;
                summary.dropped += dropped;
            }
            Err(e) => {
                error!("failed to load '{}': {:#}", key, e);
                summary.failed += 1;
            }
        }
    }

    info!(
        "run complete: {} loaded, {} skipped, {} failed, {} facts written, {} rows dropped",
        summary.loaded, summary.skipped, summary.failed, summary.facts, summary.dropped
    );

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // CELL NORMALIZATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_float_valid() {
        assert_eq!(normalize_float("120.5"), Some(120.5));
        assert_eq!(normalize_float("1400"), Some(1400.0));
        assert_eq!(normalize_float("-3.25"), Some(-3.25));
        assert_eq!(normalize_float("  7.5  "), Some(7.5));
    }

    #[test]
    fn test_normalize_float_missing_markers() {
        assert_eq!(normalize_float(""), None);
        assert_eq!(normalize_float("   "), None);
        assert_eq!(normalize_float("nan"), None);
        assert_eq!(normalize_float("NaN"), None);
        assert_eq!(normalize_float("NAN"), None);
    }

    #[test]
    fn test_normalize_float_unparseable() {
        assert_eq!(normalize_float("abc"), None);
        assert_eq!(normalize_float("12,5"), None);
        assert_eq!(normalize_float("--1"), None);
    }

    #[test]
    fn test_normalize_int_plain() {
        assert_eq!(normalize_int("12"), Some(12));
        assert_eq!(normalize_int(" 42 "), Some(42));
        assert_eq!(normalize_int("-7"), Some(-7));
    }

    #[test]
    fn test_normalize_int_through_float() {
        // Exports often write integer codes with a trailing ".0".
        assert_eq!(normalize_int("12.0"), Some(12));
        assert_eq!(normalize_int("12.7"), Some(12));
    }

    #[test]
    fn test_normalize_int_missing_or_bad() {
        assert_eq!(normalize_int(""), None);
        assert_eq!(normalize_int("nan"), None);
        assert_eq!(normalize_int("three"), None);
    }

    // -------------------------------------------------------------------------
    // FILE CLASSIFICATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_classify_each_extract() {
        assert_eq!(
            classify("item_group_srl_no_household_consumption.csv"),
            Some(ExtractType::ItemGroupDimension)
        );
        assert_eq!(
            classify("filtered_dataset_household_consumption.csv"),
            Some(ExtractType::HouseholdConsumption)
        );
        assert_eq!(classify("clean_cpi_data.csv"), Some(ExtractType::Cpi));
    }

    #[test]
    fn test_classify_marker_priority() {
        // The item group lookup file name also contains the household
        // consumption marker; the more specific marker must win.
        let name = "item_group_srl_no_household_consumption.csv";
        assert!(name.contains(HOUSEHOLD_MARKER));
        assert_eq!(classify(name), Some(ExtractType::ItemGroupDimension));
    }

    #[test]
    fn test_classify_case_insensitive() {
        assert_eq!(classify("CLEAN_CPI_DATA.CSV"), Some(ExtractType::Cpi));
        assert_eq!(
            classify("Filtered_Dataset_Household_Consumption.CSV"),
            Some(ExtractType::HouseholdConsumption)
        );
    }

    #[test]
    fn test_classify_unrecognized() {
        assert_eq!(classify("quarterly_report.pdf"), None);
        assert_eq!(classify(""), None);
    }

    // -------------------------------------------------------------------------
    // EXTRACT PARSING TESTS
    // -------------------------------------------------------------------------

    const HOUSEHOLD_HEADER: &str = "Sector,State_Region,District,Item_Group_Srl_No,State,District_Code,HHID,Value_of_Consumption_Last_30_Day,Value_Consumption_Last_365_Days";

    const CPI_HEADER: &str =
        "BaseYear,Year,Month,State,Sector,Group,SubGroup,Index,Inflation (%)";

    #[test]
    fn test_parse_item_group_rows() {
        let csv = "Value,Label\n3,Cereals\n4,Pulses\n";
        let rows = parse_item_group_csv(csv);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].serial, Some(3));
        assert_eq!(rows[0].description, "Cereals");
        assert_eq!(rows[1].serial, Some(4));
    }

    #[test]
    fn test_parse_item_group_bad_serial() {
        let csv = "Value,Label\nnot_a_number,Cereals\n";
        let rows = parse_item_group_csv(csv);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].serial, None);
    }

    #[test]
    fn test_parse_household_row() {
        let csv = format!("{HOUSEHOLD_HEADER}\n1,R1,D1,3,KA,01,H1,120.5,1400\n");
        let rows = parse_household_csv(&csv);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.hhid, "H1");
        assert_eq!(row.sector, Some(1));
        assert_eq!(row.item_group_srl_no, Some(3));
        assert_eq!(row.state, "KA");
        assert_eq!(row.district, "D1");
        assert_eq!(row.district_code, "01");
        assert_eq!(row.state_region, "R1");
        assert_eq!(row.consumption_30, Some(120.5));
        assert_eq!(row.consumption_365, Some(1400.0));
    }

    #[test]
    fn test_parse_household_missing_cells() {
        let csv = format!("{HOUSEHOLD_HEADER}\n,R1,D1,,KA,01,,nan,\n");
        let rows = parse_household_csv(&csv);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.hhid, "");
        assert_eq!(row.sector, None);
        assert_eq!(row.item_group_srl_no, None);
        assert_eq!(row.consumption_30, None);
        assert_eq!(row.consumption_365, None);
    }

    #[test]
    fn test_parse_cpi_nan_inflation() {
        let csv =
            format!("{CPI_HEADER}\n2012,2020,January,Karnataka,Rural,Food,Cereals,151.2,NaN\n");
        let rows = parse_cpi_csv(&csv);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.base_year, Some(2012));
        assert_eq!(row.year, Some(2020));
        assert_eq!(row.month, "January");
        assert_eq!(row.index_value, Some(151.2));
        assert_eq!(row.inflation, None);
    }

    #[test]
    fn test_parse_with_bom() {
        let csv = "\u{feff}Value,Label\n3,Cereals\n";
        let rows = parse_item_group_csv(csv);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].serial, Some(3));
    }

    // -------------------------------------------------------------------------
    // DIMENSION COLLECTION TESTS
    // -------------------------------------------------------------------------

    fn household_row(hhid: &str, state: &str, district: &str) -> HouseholdConsumptionRow {
        HouseholdConsumptionRow {
            hhid: hhid.to_string(),
            sector: Some(1),
            item_group_srl_no: Some(3),
            state: state.to_string(),
            district: district.to_string(),
            district_code: "01".to_string(),
            state_region: "R1".to_string(),
            consumption_30: Some(100.0),
            consumption_365: Some(1200.0),
        }
    }

    fn cpi_row(base_year: Option<i64>, year: Option<i64>, state: &str) -> CpiRow {
        CpiRow {
            base_year,
            year,
            month: "January".to_string(),
            state: state.to_string(),
            sector: "Rural".to_string(),
            group: "Food".to_string(),
            sub_group: "Cereals".to_string(),
            index_value: Some(151.2),
            inflation: Some(5.1),
        }
    }

    #[test]
    fn test_collect_household_dedup() {
        // Four rows over two distinct geography tuples.
        let rows = vec![
            household_row("H1", "KA", "D1"),
            household_row("H2", "KA", "D1"),
            household_row("H3", "KA", "D2"),
            household_row("H1", "KA", "D2"),
        ];
        let dims = collect_household_dimensions(&rows);
        assert_eq!(dims.geographies.len(), 2);
        assert_eq!(dims.households.len(), 3);
        assert_eq!(dims.sectors.len(), 1);
        assert_eq!(dims.item_groups.len(), 1);
    }

    #[test]
    fn test_collect_household_excludes_empty_hhid() {
        let rows = vec![household_row("", "KA", "D1"), household_row("H1", "KA", "D1")];
        let dims = collect_household_dimensions(&rows);
        assert_eq!(dims.households.len(), 1);
        assert!(dims.households.contains("H1"));
    }

    #[test]
    fn test_collect_household_derived_descriptions() {
        let rows = vec![household_row("H1", "KA", "D1")];
        let dims = collect_household_dimensions(&rows);
        assert_eq!(dims.sectors.get(&1).map(String::as_str), Some("Sector 1"));
        assert_eq!(
            dims.item_groups.get(&3).map(String::as_str),
            Some("Item Group 3")
        );
    }

    #[test]
    fn test_collect_item_groups_last_label_wins() {
        let rows = vec![
            ItemGroupRow {
                serial: Some(3),
                description: "Cereals".to_string(),
            },
            ItemGroupRow {
                serial: Some(3),
                description: "Cereals Updated".to_string(),
            },
        ];
        let groups = collect_item_groups(&rows);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups.get(&3).map(String::as_str), Some("Cereals Updated"));
    }

    #[test]
    fn test_collect_item_groups_skips_missing_serial() {
        let rows = vec![ItemGroupRow {
            serial: None,
            description: "Orphan".to_string(),
        }];
        assert!(collect_item_groups(&rows).is_empty());
    }

    #[test]
    fn test_collect_cpi_dimensions() {
        let rows = vec![
            cpi_row(Some(2012), Some(2020), "Karnataka"),
            cpi_row(Some(2012), Some(2020), "Karnataka"),
            cpi_row(Some(2012), Some(2021), "Karnataka"),
            cpi_row(None, Some(2020), "Kerala"),
        ];
        let dims = collect_cpi_dimensions(&rows);
        // The row without a base year cannot form a time key.
        assert_eq!(dims.periods.len(), 2);
        assert_eq!(dims.contexts.len(), 2);
    }

    // -------------------------------------------------------------------------
    // FACT ASSEMBLY TESTS
    // -------------------------------------------------------------------------

    fn geography_map_for(rows: &[HouseholdConsumptionRow]) -> HashMap<GeographyKey, i64> {
        collect_household_dimensions(rows)
            .geographies
            .into_iter()
            .zip(1..)
            .collect()
    }

    #[test]
    fn test_assemble_household_resolves_all_keys() {
        let rows = vec![household_row("H1", "KA", "D1")];
        let geographies = geography_map_for(&rows);
        let (facts, dropped) = assemble_household_facts(&rows, &geographies);
        assert_eq!(dropped, 0);
        assert_eq!(facts.len(), 1);
        let fact = &facts[0];
        assert_eq!(fact.hhid, "H1");
        assert_eq!(fact.sector, 1);
        assert_eq!(fact.item_group_srl_no, 3);
        assert_eq!(fact.consumption_30, Some(100.0));
        assert_eq!(fact.consumption_365, Some(1200.0));
        assert_eq!(
            fact.geography_id,
            geographies[&rows[0].geography_key()]
        );
    }

    #[test]
    fn test_assemble_household_drops_empty_hhid() {
        let rows = vec![household_row("", "KA", "D1"), household_row("H1", "KA", "D1")];
        let geographies = geography_map_for(&rows);
        let (facts, dropped) = assemble_household_facts(&rows, &geographies);
        assert_eq!(dropped, 1);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].hhid, "H1");
    }

    #[test]
    fn test_assemble_household_drops_missing_dimension_codes() {
        let mut no_sector = household_row("H1", "KA", "D1");
        no_sector.sector = None;
        let mut no_group = household_row("H2", "KA", "D1");
        no_group.item_group_srl_no = None;
        let rows = vec![no_sector, no_group];
        let geographies = geography_map_for(&rows);
        let (facts, dropped) = assemble_household_facts(&rows, &geographies);
        assert!(facts.is_empty());
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_assemble_household_drops_unresolved_geography() {
        let rows = vec![household_row("H1", "KA", "D1")];
        let (facts, dropped) = assemble_household_facts(&rows, &HashMap::new());
        assert!(facts.is_empty());
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_assemble_household_preserves_order() {
        let rows = vec![
            household_row("H1", "KA", "D1"),
            household_row("H2", "KA", "D2"),
            household_row("H3", "KA", "D1"),
        ];
        let geographies = geography_map_for(&rows);
        let (facts, dropped) = assemble_household_facts(&rows, &geographies);
        assert_eq!(dropped, 0);
        let order: Vec<&str> = facts.iter().map(|f| f.hhid.as_str()).collect();
        assert_eq!(order, vec!["H1", "H2", "H3"]);
    }

    #[test]
    fn test_assemble_cpi_facts() {
        let rows = vec![
            cpi_row(Some(2012), Some(2020), "Karnataka"),
            cpi_row(None, Some(2020), "Karnataka"),
        ];
        let dims = collect_cpi_dimensions(&rows);
        let periods: HashMap<TimeKey, i64> =
            dims.periods.into_iter().zip(1..).collect();
        let contexts: HashMap<CpiContextKey, i64> =
            dims.contexts.into_iter().zip(1..).collect();
        let (facts, dropped) = assemble_cpi_facts(&rows, &periods, &contexts);
        // The row without a base year has no time period to reference.
        assert_eq!(dropped, 1);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].index_value, Some(151.2));
        assert_eq!(facts[0].inflation, Some(5.1));
    }

    #[test]
    fn test_assemble_cpi_null_measures_kept() {
        let mut row = cpi_row(Some(2012), Some(2020), "Karnataka");
        row.inflation = None;
        let rows = vec![row];
        let dims = collect_cpi_dimensions(&rows);
        let periods: HashMap<TimeKey, i64> =
            dims.periods.into_iter().zip(1..).collect();
        let contexts: HashMap<CpiContextKey, i64> =
            dims.contexts.into_iter().zip(1..).collect();
        let (facts, dropped) = assemble_cpi_facts(&rows, &periods, &contexts);
        assert_eq!(dropped, 0);
        assert_eq!(facts[0].inflation, None);
        assert_eq!(facts[0].index_value, Some(151.2));
    }
}
