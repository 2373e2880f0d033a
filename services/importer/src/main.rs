//! Importer Service - Loads categorized WHO indicator exports
//!
//! Responsibilities:
//! - Parse the six WHO CSV exports (decorated headers, one metadata row)
//! - Derive demographic groups from the SEX / AGEGROUP dimensions
//! - Classify each indicator into a domain (disease / lifestyle /
//!   environment / financing) with first-match-wins keyword rules
//! - Upsert reference entities, then load the measurement tables
//!
//! Usage:
//!   cargo run --bin importer -- --csv-dir data/csv
//!   cargo run --bin importer -- --dry-run

use anyhow::{Context, Result};
use clap::Parser;
use csv::StringRecord;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports categorized WHO indicator CSVs")]
struct Args {
    /// Directory containing the WHO indicator CSV exports
    #[arg(long, default_value = "data/csv")]
    csv_dir: PathBuf,

    /// Dry run - parse and classify, don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    pg_host: String,
    pg_port: u16,
    pg_database: String,
    pg_user: String,
    pg_password: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            pg_host: std::env::var("PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
            pg_port: std::env::var("PG_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()
                .context("PG_PORT must be a port number")?,
            pg_database: std::env::var("PG_DATABASE")
                .unwrap_or_else(|_| "health_indicators".to_string()),
            pg_user: std::env::var("PG_USER").unwrap_or_else(|_| "warehouse".to_string()),
            pg_password: std::env::var("PG_PASSWORD")
                .unwrap_or_else(|_| "warehouse".to_string()),
        })
    }

    fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.pg_user, self.pg_password, self.pg_host, self.pg_port, self.pg_database
        )
    }
}

async fn connect_with_retry(url: &str, attempts: u32, delay: Duration) -> Result<PgPool> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match PgPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                eprintln!("  Connection attempt {}/{} failed: {}", attempt, attempts, e);
                last_err = Some(e);
                if attempt < attempts {
                    sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt").into())
}

// =============================================================================
// SOURCE FILES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsvFamily {
    Health,
    AirPollution,
    Environment,
    Alcohol,
    Financing,
    Nutrition,
}

impl CsvFamily {
    const ALL: [CsvFamily; 6] = [
        CsvFamily::Health,
        CsvFamily::AirPollution,
        CsvFamily::Environment,
        CsvFamily::Alcohol,
        CsvFamily::Financing,
        CsvFamily::Nutrition,
    ];

    fn file_name(self) -> &'static str {
        match self {
            CsvFamily::Health => "health_indicators_che.csv",
            CsvFamily::AirPollution => "air_pollution_indicators_che.csv",
            CsvFamily::Environment => "environment_and_health_indicators_che.csv",
            CsvFamily::Alcohol => {
                "global_information_system_on_alcohol_and_health_indicators_che.csv"
            }
            CsvFamily::Financing => "health_financing_indicators_che.csv",
            CsvFamily::Nutrition => "nutrition_indicators_che.csv",
        }
    }

    fn label(self) -> &'static str {
        match self {
            CsvFamily::Health => "health",
            CsvFamily::AirPollution => "air pollution",
            CsvFamily::Environment => "environment",
            CsvFamily::Alcohol => "alcohol",
            CsvFamily::Financing => "financing",
            CsvFamily::Nutrition => "nutrition",
        }
    }
}

// =============================================================================
// CSV PARSING
// =============================================================================
// WHO export headers are decorated, e.g. "GHO (CODE) + extra note" or
// "#Numeric". They normalize to stable snake_case names; rows are then read
// by header index rather than serde.

fn normalize_header(raw: &str) -> String {
    let cut = raw.split('+').next().unwrap_or(raw);
    let cleaned = cut.replace('#', "");
    let mut out = String::new();
    let mut prev_underscore = false;
    for ch in cleaned.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_underscore = false;
        } else if !prev_underscore && !out.is_empty() {
            out.push('_');
            prev_underscore = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

#[derive(Debug, Clone, Default)]
struct IndicatorRow {
    gho_code: Option<String>,
    gho_display: String,
    gho_url: String,
    year: Option<i32>,
    numeric: Option<f64>,
    value_text: Option<String>,
    low: Option<f64>,
    high: Option<f64>,
    dimension_type: Option<String>,
    dimension_code: Option<String>,
    dimension_name: Option<String>,
    region_code: Option<String>,
}

struct HeaderIndex(HashMap<String, usize>);

impl HeaderIndex {
    fn new(headers: &StringRecord) -> Self {
        Self(
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| (normalize_header(h), i))
                .collect(),
        )
    }

    fn text(&self, record: &StringRecord, name: &str) -> Option<String> {
        let value = record.get(*self.0.get(name)?)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn num(&self, record: &StringRecord, name: &str) -> Option<f64> {
        self.text(record, name)?.replace(' ', "").parse().ok()
    }

    fn int(&self, record: &StringRecord, name: &str) -> Option<i32> {
        // Some exports carry years as "2020.0".
        self.num(record, name).map(|v| v as i32)
    }
}

/// Parse one WHO export. The first data record is a machine-readable metadata
/// row and is skipped.
fn parse_indicator_csv(content: &str, file: &str) -> Result<Vec<IndicatorRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .with_context(|| format!("{}: unreadable header row", file))?
        .clone();
    let index = HeaderIndex::new(&headers);

    let mut rows = Vec::new();
    let mut bad = 0;
    for (i, result) in reader.records().enumerate() {
        if i == 0 {
            continue;
        }
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                bad += 1;
                if bad <= 3 {
                    eprintln!("  ! {}: skipping line {}: {}", file, i + 2, e);
                }
                continue;
            }
        };
        rows.push(IndicatorRow {
            gho_code: index.text(&record, "gho_code"),
            gho_display: index.text(&record, "gho_display").unwrap_or_default(),
            gho_url: index.text(&record, "gho_url").unwrap_or_default(),
            year: index.int(&record, "year_code"),
            numeric: index.num(&record, "numeric"),
            value_text: index.text(&record, "display_value"),
            low: index.num(&record, "low"),
            high: index.num(&record, "high"),
            dimension_type: index.text(&record, "dimension_type_code"),
            dimension_code: index.text(&record, "dimension_code"),
            dimension_name: index.text(&record, "dimension_name"),
            region_code: index.text(&record, "region_code"),
        });
    }
    if bad > 3 {
        eprintln!("  ! {}: {} unparsable lines in total", file, bad);
    }
    Ok(rows)
}

// =============================================================================
// DEMOGRAPHICS
// =============================================================================

/// Demographic slice of one measurement, defaulting to all/all.
#[derive(Debug, Clone, PartialEq)]
struct Demographic {
    age_band: &'static str,
    sex: &'static str,
    dimension_type: Option<String>,
    dimension_code: Option<String>,
    dimension_name: Option<String>,
}

type DemographicKey = (String, String, Option<String>, Option<String>);

impl Demographic {
    fn key(&self) -> DemographicKey {
        (
            self.age_band.to_string(),
            self.sex.to_string(),
            self.dimension_type.clone(),
            self.dimension_code.clone(),
        )
    }
}

/// Exact dictionary match on WHO sex codes. Substring tests would misread
/// FMLE as male, so only the three known codes map.
fn sex_of(code: &str) -> Option<&'static str> {
    match code {
        "MLE" => Some("male"),
        "FMLE" => Some("female"),
        "BTSX" => Some("all"),
        _ => None,
    }
}

const AGE_BANDS: &[(&str, &[&str])] = &[
    ("0-17", &["0-27", "neonatal", "0-4", "5-9", "10-14"]),
    ("18-34", &["15-19", "18-34", "adolescent", "20-24", "25-29", "30-34"]),
    ("35-49", &["35-39", "40-44", "45-49"]),
    ("50-64", &["50-54", "55-59", "60-64"]),
    ("65+", &["65", "70", "75"]),
];

fn age_band_of(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    AGE_BANDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(band, _)| *band)
}

fn demographic_of(row: &IndicatorRow) -> Demographic {
    let mut age_band = "all";
    let mut sex = "all";
    if let Some(dim_type) = row.dimension_type.as_deref() {
        match dim_type {
            "SEX" => {
                if let Some(mapped) = row.dimension_code.as_deref().and_then(sex_of) {
                    sex = mapped;
                }
            }
            "AGEGROUP" => {
                if let Some(band) = row.dimension_name.as_deref().and_then(age_band_of) {
                    age_band = band;
                }
            }
            _ => {}
        }
    }
    Demographic {
        age_band,
        sex,
        dimension_type: row.dimension_type.clone(),
        dimension_code: row.dimension_code.clone(),
        dimension_name: row.dimension_name.clone(),
    }
}

// =============================================================================
// CATEGORIZER
// =============================================================================
// First-match-wins keyword rules over the lowercased indicator name, routed
// by CSV family first. Every name lands in exactly one domain; disease names
// land in exactly one category.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DiseaseCategory {
    Infectious,
    Respiratory,
    Cardiovascular,
    Cancer,
    Metabolic,
    MaternalChild,
    Neuropsychiatric,
    Digestive,
    Other,
}

impl DiseaseCategory {
    fn code(self) -> &'static str {
        match self {
            DiseaseCategory::Infectious => "INFECTIOUS",
            DiseaseCategory::Respiratory => "RESPIRATORY",
            DiseaseCategory::Cardiovascular => "CARDIOVASCULAR",
            DiseaseCategory::Cancer => "CANCER",
            DiseaseCategory::Metabolic => "METABOLIC",
            DiseaseCategory::MaternalChild => "MATERNAL_CHILD",
            DiseaseCategory::Neuropsychiatric => "NEUROPSYCHIATRIC",
            DiseaseCategory::Digestive => "DIGESTIVE",
            DiseaseCategory::Other => "OTHER_DISEASE",
        }
    }

    fn name(self) -> &'static str {
        match self {
            DiseaseCategory::Infectious => "Infectious diseases",
            DiseaseCategory::Respiratory => "Respiratory diseases",
            DiseaseCategory::Cardiovascular => "Cardiovascular diseases",
            DiseaseCategory::Cancer => "Cancers",
            DiseaseCategory::Metabolic => "Metabolic disorders",
            DiseaseCategory::MaternalChild => "Maternal and child health",
            DiseaseCategory::Neuropsychiatric => "Neurological and mental health",
            DiseaseCategory::Digestive => "Digestive diseases",
            DiseaseCategory::Other => "Other diseases",
        }
    }

    fn severity(self) -> i32 {
        match self {
            DiseaseCategory::Infectious => 5,
            DiseaseCategory::Respiratory => 4,
            DiseaseCategory::Cardiovascular => 5,
            DiseaseCategory::Cancer => 5,
            DiseaseCategory::Metabolic => 4,
            DiseaseCategory::MaternalChild => 5,
            DiseaseCategory::Neuropsychiatric => 4,
            DiseaseCategory::Digestive => 4,
            DiseaseCategory::Other => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LifestyleCategory {
    Vaccination,
    Alcohol,
    Tobacco,
    Nutrition,
}

impl LifestyleCategory {
    fn code(self) -> &'static str {
        match self {
            LifestyleCategory::Vaccination => "VACCINATION",
            LifestyleCategory::Alcohol => "ALCOHOL",
            LifestyleCategory::Tobacco => "TOBACCO",
            LifestyleCategory::Nutrition => "NUTRITION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Disease {
        category: DiseaseCategory,
        measurement: Option<&'static str>,
    },
    Lifestyle(LifestyleCategory),
    Environment,
    Financing,
}

/// Ordered category rules. The first group whose keyword list matches wins,
/// so ordering is part of the contract (e.g. "obstructive pulmonary" must
/// reach RESPIRATORY before any later group could claim it).
const DISEASE_RULES: &[(DiseaseCategory, &[&str])] = &[
    (
        DiseaseCategory::Infectious,
        &[
            "hepatitis", "hiv", "aids", "malaria", "tuberculosis", "infection", "infectious",
            "covid", "influenza", "measles", "rubella", "tetanus", "pertussis",
        ],
    ),
    (
        DiseaseCategory::Respiratory,
        &[
            "respiratory", "pulmonary", "asthma", "copd", "pneumonia", "bronchitis",
            "lung disease",
        ],
    ),
    (
        DiseaseCategory::Cardiovascular,
        &[
            "cardiovascular", "heart", "stroke", "hypertension", "blood pressure", "cardiac",
            "ischaemic", "ischemic",
        ],
    ),
    (
        DiseaseCategory::Cancer,
        &["cancer", "carcinoma", "neoplasm", "tumour", "tumor", "malignant", "leukaemia"],
    ),
    (
        DiseaseCategory::Metabolic,
        &["diabetes", "metabolic", "glucose", "cholesterol"],
    ),
    (
        DiseaseCategory::MaternalChild,
        &[
            "maternal", "neonatal", "infant", "birth", "pregnancy", "perinatal",
            "child mortality", "under-five",
        ],
    ),
    (
        DiseaseCategory::Neuropsychiatric,
        &[
            "mental", "depression", "anxiety", "suicide", "neurological", "alzheimer",
            "dementia", "epilepsy",
        ],
    ),
    (
        DiseaseCategory::Digestive,
        &["digestive", "liver", "cirrhosis", "peptic", "bowel", "gastro"],
    ),
];

fn disease_category(lower: &str) -> DiseaseCategory {
    DISEASE_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(cat, _)| *cat)
        .unwrap_or(DiseaseCategory::Other)
}

fn measurement_type(lower: &str) -> Option<&'static str> {
    if lower.contains("mortality") || lower.contains("death") {
        Some("mortality")
    } else if lower.contains("incidence") {
        Some("incidence")
    } else if lower.contains("prevalence") {
        Some("prevalence")
    } else if lower.contains("cases") || lower.contains("number of") {
        Some("cases")
    } else {
        None
    }
}

const VACCINATION_KEYWORDS: &[&str] = &[
    "immunization", "immunisation", "vaccin", "diphtheria", "polio", "bcg", "hepb",
];
const ALCOHOL_KEYWORDS: &[&str] = &["alcohol", "drinkers", "drinking", "abstainers"];
const TOBACCO_KEYWORDS: &[&str] = &["tobacco", "smoking", "cigarette", "smokeless"];
const NUTRITION_KEYWORDS: &[&str] = &[
    "obesity", "overweight", "underweight", "bmi", "body mass", "thinness", "anaemia",
    "anemia", "nutrition", "malnutrition", "stunting", "wasting", "breastf",
];

fn classify(family: CsvFamily, name: &str) -> Classification {
    match family {
        CsvFamily::Financing => return Classification::Financing,
        CsvFamily::AirPollution | CsvFamily::Environment => return Classification::Environment,
        _ => {}
    }
    let lower = name.to_lowercase();
    if VACCINATION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Classification::Lifestyle(LifestyleCategory::Vaccination);
    }
    if family == CsvFamily::Alcohol || ALCOHOL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Classification::Lifestyle(LifestyleCategory::Alcohol);
    }
    if TOBACCO_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Classification::Lifestyle(LifestyleCategory::Tobacco);
    }
    if family == CsvFamily::Nutrition || NUTRITION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Classification::Lifestyle(LifestyleCategory::Nutrition);
    }
    Classification::Disease {
        category: disease_category(&lower),
        measurement: measurement_type(&lower),
    }
}

/// Truncate on a char boundary to a column width.
fn clip(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

// =============================================================================
// LOADER
// =============================================================================
// Phase-committed: each phase runs autocommit statements against the pool,
// so an abort in a later phase keeps earlier phases' work. Reference
// entities are get-or-create upserts cached in maps.

async fn get_or_create_demographic(
    pool: &PgPool,
    cache: &mut HashMap<DemographicKey, i32>,
    demo: &Demographic,
) -> Result<i32> {
    let key = demo.key();
    if let Some(id) = cache.get(&key) {
        return Ok(*id);
    }
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO demographic_groups (age_band, sex, dimension_type, dimension_code, dimension_name) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (age_band, sex, dimension_type, dimension_code) \
         DO UPDATE SET dimension_name = EXCLUDED.dimension_name \
         RETURNING demographic_id",
    )
    .bind(demo.age_band)
    .bind(demo.sex)
    .bind(demo.dimension_type.as_deref().unwrap_or(""))
    .bind(demo.dimension_code.as_deref().unwrap_or(""))
    .bind(demo.dimension_name.as_deref().map(|n| clip(n, 200)))
    .fetch_one(pool)
    .await
    .context("upserting demographic group")?;
    cache.insert(key, id);
    Ok(id)
}

async fn get_or_create_category(
    pool: &PgPool,
    cache: &mut HashMap<DiseaseCategory, i32>,
    category: DiseaseCategory,
) -> Result<i32> {
    if let Some(id) = cache.get(&category) {
        return Ok(*id);
    }
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO disease_categories (category_code, category_name, severity_level) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (category_code) DO UPDATE SET category_name = EXCLUDED.category_name \
         RETURNING category_id",
    )
    .bind(category.code())
    .bind(category.name())
    .bind(category.severity())
    .fetch_one(pool)
    .await
    .context("upserting disease category")?;
    cache.insert(category, id);
    Ok(id)
}

async fn get_or_create_disease(
    pool: &PgPool,
    cache: &mut HashMap<String, i32>,
    code: &str,
    name: &str,
    url: &str,
    category_id: i32,
) -> Result<i32> {
    if let Some(id) = cache.get(code) {
        return Ok(*id);
    }
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO diseases (code, name, category_id, source_url) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name, category_id = EXCLUDED.category_id \
         RETURNING disease_id",
    )
    .bind(code)
    .bind(clip(name, 500))
    .bind(category_id)
    .bind(clip(url, 500))
    .fetch_one(pool)
    .await
    .context("upserting disease")?;
    cache.insert(code.to_string(), id);
    Ok(id)
}

async fn get_or_create_lifestyle_factor(
    pool: &PgPool,
    cache: &mut HashMap<String, i32>,
    code: &str,
    name: &str,
    category: LifestyleCategory,
    url: &str,
) -> Result<i32> {
    if let Some(id) = cache.get(code) {
        return Ok(*id);
    }
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO lifestyle_factors (code, name, category, source_url) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name, category = EXCLUDED.category \
         RETURNING factor_id",
    )
    .bind(code)
    .bind(clip(name, 500))
    .bind(category.code())
    .bind(clip(url, 500))
    .fetch_one(pool)
    .await
    .context("upserting lifestyle factor")?;
    cache.insert(code.to_string(), id);
    Ok(id)
}

struct EntityCaches {
    demographics: HashMap<DemographicKey, i32>,
    categories: HashMap<DiseaseCategory, i32>,
    diseases: HashMap<String, i32>,
    lifestyle: HashMap<String, i32>,
}

#[derive(Debug, Default)]
struct FamilyReport {
    imported: usize,
    skipped: usize,
    errors: usize,
}

#[derive(Debug, Default)]
struct DomainTotals {
    disease: usize,
    lifestyle: usize,
    environment: usize,
    financing: usize,
}

async fn insert_measurement(
    pool: &PgPool,
    caches: &mut EntityCaches,
    family: CsvFamily,
    row: &IndicatorRow,
    totals: &mut DomainTotals,
) -> Result<()> {
    let code = row.gho_code.as_deref().context("missing indicator code")?;
    let year = row.year.context("missing year")?;
    let demographic_id =
        get_or_create_demographic(pool, &mut caches.demographics, &demographic_of(row)).await?;

    match classify(family, &row.gho_display) {
        Classification::Disease {
            category,
            measurement,
        } => {
            let category_id = get_or_create_category(pool, &mut caches.categories, category).await?;
            let disease_id = get_or_create_disease(
                pool,
                &mut caches.diseases,
                code,
                &row.gho_display,
                &row.gho_url,
                category_id,
            )
            .await?;
            sqlx::query(
                "INSERT INTO disease_measurements \
                 (disease_id, demographic_id, year, measurement_type, numeric_value, \
                  display_value, low_estimate, high_estimate, region_code) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(disease_id)
            .bind(demographic_id)
            .bind(year)
            .bind(measurement_type_or_default(measurement))
            .bind(row.numeric)
            .bind(row.value_text.as_deref().map(|v| clip(v, 200)))
            .bind(row.low)
            .bind(row.high)
            .bind(row.region_code.as_deref())
            .execute(pool)
            .await?;
            totals.disease += 1;
        }
        Classification::Lifestyle(category) => {
            let factor_id = get_or_create_lifestyle_factor(
                pool,
                &mut caches.lifestyle,
                code,
                &row.gho_display,
                category,
                &row.gho_url,
            )
            .await?;
            let alcohol_type = match row.dimension_type.as_deref() {
                Some("ALCOHOLTYPE") => row.dimension_name.as_deref(),
                _ => None,
            };
            sqlx::query(
                "INSERT INTO lifestyle_measurements \
                 (factor_id, demographic_id, year, measure_name, numeric_value, \
                  display_value, low_estimate, high_estimate, alcohol_type) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(factor_id)
            .bind(demographic_id)
            .bind(year)
            .bind(clip(&row.gho_display, 200))
            .bind(row.numeric)
            .bind(row.value_text.as_deref().map(|v| clip(v, 200)))
            .bind(row.low)
            .bind(row.high)
            .bind(alcohol_type.map(|a| clip(a, 100)))
            .execute(pool)
            .await?;
            totals.lifestyle += 1;
        }
        Classification::Environment => {
            sqlx::query(
                "INSERT INTO environmental_measurements \
                 (indicator_code, indicator_name, demographic_id, year, numeric_value, \
                  display_value, low_estimate, high_estimate, source_url) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(code)
            .bind(clip(&row.gho_display, 500))
            .bind(demographic_id)
            .bind(year)
            .bind(row.numeric)
            .bind(row.value_text.as_deref().map(|v| clip(v, 200)))
            .bind(row.low)
            .bind(row.high)
            .bind(clip(&row.gho_url, 500))
            .execute(pool)
            .await?;
            totals.environment += 1;
        }
        Classification::Financing => {
            // Indicator codes look like GHED_CHE-GDP_SHA2011: the middle
            // segment is the expense type.
            let expense_type = code.split('_').nth(1).unwrap_or("OTHER");
            sqlx::query(
                "INSERT INTO health_financing \
                 (indicator_code, indicator_name, expense_type, year, numeric_value, display_value) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (indicator_code, year, expense_type) DO NOTHING",
            )
            .bind(code)
            .bind(clip(&row.gho_display, 500))
            .bind(clip(expense_type, 100))
            .bind(year)
            .bind(row.numeric)
            .bind(row.value_text.as_deref().map(|v| clip(v, 200)))
            .execute(pool)
            .await?;
            totals.financing += 1;
        }
    }
    Ok(())
}

fn measurement_type_or_default(measurement: Option<&'static str>) -> &'static str {
    measurement.unwrap_or("other")
}

async fn truncate_destination(pool: &PgPool) -> Result<()> {
    // Measurement tables first, then entities, then reference tables.
    sqlx::query(
        "TRUNCATE TABLE disease_measurements, lifestyle_measurements, \
         environmental_measurements, health_financing RESTART IDENTITY CASCADE",
    )
    .execute(pool)
    .await?;
    sqlx::query("TRUNCATE TABLE diseases, lifestyle_factors RESTART IDENTITY CASCADE")
        .execute(pool)
        .await?;
    sqlx::query("TRUNCATE TABLE disease_categories, demographic_groups RESTART IDENTITY CASCADE")
        .execute(pool)
        .await?;
    Ok(())
}

// =============================================================================
// DRIVER
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== WHO Indicator Importer ===");
    println!("CSV dir: {}", args.csv_dir.display());

    let mut families: Vec<(CsvFamily, Vec<IndicatorRow>)> = Vec::new();
    for family in CsvFamily::ALL {
        let path = args.csv_dir.join(family.file_name());
        match fs::read_to_string(&path).await {
            Ok(content) => match parse_indicator_csv(&content, family.file_name()) {
                Ok(rows) => {
                    println!("  {} - {} rows", family.label(), rows.len());
                    families.push((family, rows));
                }
                Err(e) => eprintln!("  ! {} unparsable, family skipped: {:#}", path.display(), e),
            },
            Err(e) => eprintln!("  ! {} unreadable, family skipped: {}", path.display(), e),
        }
    }

    if args.dry_run {
        println!("\nDry run - classification summary only");
        let mut totals = DomainTotals::default();
        for (family, rows) in &families {
            for row in rows {
                match classify(*family, &row.gho_display) {
                    Classification::Disease { .. } => totals.disease += 1,
                    Classification::Lifestyle(_) => totals.lifestyle += 1,
                    Classification::Environment => totals.environment += 1,
                    Classification::Financing => totals.financing += 1,
                }
            }
        }
        print_domain_totals(&totals);
        return Ok(());
    }

    println!("\nConnecting to {}:{}...", config.pg_host, config.pg_port);
    let pool = connect_with_retry(&config.database_url(), 10, Duration::from_secs(5)).await?;

    println!("\n[1/3] Truncating destination tables...");
    truncate_destination(&pool).await?;

    let mut caches = EntityCaches {
        demographics: HashMap::new(),
        categories: HashMap::new(),
        diseases: HashMap::new(),
        lifestyle: HashMap::new(),
    };

    println!("\n[2/3] Registering demographic groups...");
    for (_, rows) in &families {
        for row in rows {
            get_or_create_demographic(&pool, &mut caches.demographics, &demographic_of(row))
                .await?;
        }
    }
    println!("  {} demographic groups", caches.demographics.len());

    println!("\n[3/3] Loading measurements...");
    let mut totals = DomainTotals::default();
    let mut overall_errors = 0;
    for (family, rows) in &families {
        let mut report = FamilyReport::default();
        for row in rows {
            if row.gho_code.is_none() || row.year.is_none() {
                report.skipped += 1;
                continue;
            }
            if let Err(e) = insert_measurement(&pool, &mut caches, *family, row, &mut totals).await
            {
                report.errors += 1;
                overall_errors += 1;
                if overall_errors <= 5 {
                    eprintln!("  ! {} row failed: {:#}", family.label(), e);
                }
                continue;
            }
            report.imported += 1;
        }
        println!(
            "  {} - imported {}, skipped {}, errors {}",
            family.label(),
            report.imported,
            report.skipped,
            report.errors
        );
    }

    println!("\n=== Import Complete ===");
    print_domain_totals(&totals);
    println!("Diseases:           {}", caches.diseases.len());
    println!("Lifestyle factors:  {}", caches.lifestyle.len());
    println!("Demographic groups: {}", caches.demographics.len());
    if overall_errors > 0 {
        println!("Row errors:         {}", overall_errors);
    }
    Ok(())
}

fn print_domain_totals(totals: &DomainTotals) {
    println!("Disease measurements:       {}", totals.disease);
    println!("Lifestyle measurements:     {}", totals.lifestyle);
    println!("Environmental measurements: {}", totals.environment);
    println!("Financing rows:             {}", totals.financing);
}

// =============================================================================
// TESTS
// =============================================================================
