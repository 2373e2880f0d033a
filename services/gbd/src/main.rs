//! GBD Service - Loads IHME GBD exports into per-indicator tables
//!
//! Every distinct cause and risk gets its own measurement table, created on
//! demand through the create_*_table stored routines. Diseases load first
//! because environment and lifestyle rows reference disease indicators.
//!
//! Usage:
//!   cargo run --bin gbd -- --csv-dir data/csv

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "gbd", about = "Imports GBD exports into per-indicator tables")]
struct Args {
    /// Directory scanned for IHME-GBD_2023_DATA-*.csv files
    #[arg(long, default_value = "data/csv")]
    csv_dir: PathBuf,

    /// Dry run - parse and categorize, don't touch the database
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
// INPUT
// =============================================================================

const GBD_FILE_PREFIX: &str = "IHME-GBD_2023_DATA-";

#[derive(Debug, Clone, Deserialize)]
struct GbdRow {
    sex_name: String,
    age_name: String,
    cause_id: i64,
    cause_name: String,
    #[serde(default)]
    rei_id: Option<i64>,
    #[serde(default)]
    rei_name: Option<String>,
    measure_name: String,
    metric_name: String,
    year: i32,
    #[serde(default)]
    val: Option<f64>,
}

impl GbdRow {
    fn rounded_value(&self) -> i64 {
        self.val.unwrap_or(0.0).round() as i64
    }
}

fn list_gbd_files(dir: &PathBuf) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(GBD_FILE_PREFIX) && name.ends_with(".csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn parse_gbd_rows(content: &str, file: &str) -> Vec<GbdRow> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let mut rows = Vec::new();
    let mut bad = 0;
    for (line, result) in reader.deserialize::<GbdRow>().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => {
                bad += 1;
                if bad <= 3 {
                    eprintln!("  ! {}: skipping line {}: {}", file, line + 2, e);
                }
            }
        }
    }
    if bad > 3 {
        eprintln!("  ! {}: {} unparsable lines in total", file, bad);
    }
    rows
}

// =============================================================================
// FILTERS
// =============================================================================

/// GBD aggregate causes; their constituents are already in the data, so
/// keeping them would double-count.
const AGGREGATE_NAMES: &[&str] = &[
    "all causes",
    "total cancer",
    "cardiovascular diseases",
    "chronic respiratory diseases",
    "digestive diseases",
    "neurological disorders",
    "mental disorders",
    "non-communicable diseases",
    "injuries",
    "neoplasms",
    "alcohol use disorders",
    "substance use disorders",
    "maternal and neonatal disorders",
    "respiratory infections",
    "enteric infections",
    "neglected tropical diseases",
    "hiv/aids and sexually transmitted infections",
];

fn is_aggregate(cause_name: &str) -> bool {
    let lower = cause_name.to_lowercase();
    AGGREGATE_NAMES.iter().any(|a| lower.contains(a))
}

/// Causes that are themselves substance-use conditions; pairing them with
/// the alcohol/drug risks would be circular.
const CIRCULAR_CAUSES: &[&str] = &[
    "alcohol use disorders",
    "drug use disorders",
    "eating disorders",
];

fn is_circular(cause_name: &str) -> bool {
    let lower = cause_name.to_lowercase();
    CIRCULAR_CAUSES.iter().any(|c| lower.contains(c))
}

// =============================================================================
// CATEGORIZATION
// =============================================================================
// Ordered first-match keyword rules, one set per domain. Risks that match no
// environment or lifestyle group are left out of that domain.

const DISEASE_GROUPS: &[(&str, &str, &[&str])] = &[
    ("CANCER", "Cancers", &["cancer", "carcinoma", "neoplasm", "leukemia", "lymphoma", "melanoma"]),
    ("CARDIO", "Cardiovascular diseases", &["heart", "stroke", "ischemic", "cardiovascular", "myocardial", "hypertensive"]),
    ("NEURO", "Neurological disorders", &["alzheimer", "dementia", "parkinson", "epilepsy", "sclerosis", "motor neuron"]),
    ("RESPIRATORY", "Respiratory diseases", &["respiratory", "pulmonary", "copd", "asthma", "pneumonia", "bronch", "lung"]),
    ("METABOLIC", "Metabolic and kidney diseases", &["diabetes", "kidney", "renal"]),
    ("INFECTIOUS", "Infectious diseases", &["infection", "hepatitis", "tuberculosis", "hiv", "aids", "malaria"]),
    ("DIGESTIVE", "Digestive diseases", &["digestive", "liver", "cirrhosis", "peptic", "bowel", "appendicitis"]),
    ("MENTAL", "Mental disorders", &["mental", "depressi", "anxiety", "schizophrenia", "bipolar"]),
];

fn disease_group(cause_name: &str) -> &'static str {
    let lower = cause_name.to_lowercase();
    DISEASE_GROUPS
        .iter()
        .find(|(_, _, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(code, _, _)| *code)
        .unwrap_or("OTHER")
}

const ENVIRONMENT_GROUPS: &[(&str, &str, &[&str])] = &[
    ("AIR_POLLUTION", "Air pollution", &["pollution", "ozone", "particulate"]),
    ("TEMPERATURE", "Temperature extremes", &["temperature"]),
    ("WATER_SANITATION", "Water and sanitation", &["water", "sanitation", "handwashing"]),
    ("LEAD", "Lead exposure", &["lead"]),
];

fn environment_group(rei_name: &str) -> Option<&'static str> {
    let lower = rei_name.to_lowercase();
    ENVIRONMENT_GROUPS
        .iter()
        .find(|(_, _, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(code, _, _)| *code)
}

const LIFESTYLE_GROUPS: &[(&str, &str, &[&str])] = &[
    ("TOBACCO", "Tobacco", &["smok", "tobacco"]),
    ("ALCOHOL_DRUGS", "Alcohol and drug use", &["alcohol", "drug"]),
    ("DIET", "Dietary risks", &["diet"]),
    ("PHYSICAL_ACTIVITY", "Physical activity", &["physical"]),
    ("METABOLIC", "Metabolic risk factors", &["pressure", "cholesterol", "body-mass", "glucose"]),
];

fn lifestyle_group(rei_name: &str) -> Option<&'static str> {
    let lower = rei_name.to_lowercase();
    LIFESTYLE_GROUPS
        .iter()
        .find(|(_, _, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(code, _, _)| *code)
}

fn group_display(groups: &[(&str, &'static str, &[&str])], code: &str) -> &'static str {
    groups
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, _)| *name)
        .unwrap_or("Other")
}

/// Derive a Postgres table name from an indicator name: lowercase, drop
/// punctuation, underscore the separators, cap at 55 chars, then prefix.
fn indicator_table_name(prefix: &str, name: &str) -> String {
    let mut normalized = String::new();
    let mut prev_underscore = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            normalized.push(ch);
            prev_underscore = false;
        } else if matches!(ch, '\'' | '"' | ',' | '(' | ')' | '/') {
            continue;
        } else if (ch.is_whitespace() || ch == '-' || ch == '_') && !prev_underscore {
            if !normalized.is_empty() {
                normalized.push('_');
                prev_underscore = true;
            }
        }
    }
    let trimmed = normalized.trim_end_matches('_');
    let clipped = match trimmed.char_indices().nth(55) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    };
    format!("{}_{}", prefix, clipped.trim_end_matches('_'))
}

// =============================================================================
// LOADER
// =============================================================================

struct Indicator {
    id: i32,
    table: String,
}

async fn upsert_groups(
    pool: &PgPool,
    table: &str,
    groups: &[(&str, &'static str, &[&str])],
) -> Result<HashMap<String, i32>> {
    let sql = format!(
        "INSERT INTO {} (group_code, group_name) VALUES ($1, $2) \
         ON CONFLICT (group_code) DO UPDATE SET group_name = EXCLUDED.group_name \
         RETURNING group_id",
        table
    );
    let mut ids = HashMap::new();
    for (code, name, _) in groups {
        let (id,): (i32,) = sqlx::query_as(&sql)
            .bind(code)
            .bind(name)
            .fetch_one(pool)
            .await
            .with_context(|| format!("upserting group {} into {}", code, table))?;
        ids.insert(code.to_string(), id);
    }
    Ok(ids)
}

async fn upsert_other_group(pool: &PgPool, table: &str, ids: &mut HashMap<String, i32>) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (group_code, group_name) VALUES ('OTHER', 'Other') \
         ON CONFLICT (group_code) DO UPDATE SET group_name = EXCLUDED.group_name \
         RETURNING group_id",
        table
    );
    let (id,): (i32,) = sqlx::query_as(&sql).fetch_one(pool).await?;
    ids.insert("OTHER".to_string(), id);
    Ok(())
}

async fn create_indicator_table(pool: &PgPool, routine: &str, table: &str) -> Result<()> {
    let sql = format!("SELECT {}($1)", routine);
    sqlx::query(&sql)
        .bind(table)
        .execute(pool)
        .await
        .with_context(|| format!("{}('{}')", routine, table))?;
    Ok(())
}

/// Load the disease domain: groups, per-cause tables, indicators, facts.
/// Returns the indicator registry keyed by cause id for the risk domains.
async fn load_diseases(pool: &PgPool, rows: &[GbdRow]) -> Result<HashMap<i64, Indicator>> {
    let group_ids = {
        let mut ids = upsert_groups(pool, "disease_groups", DISEASE_GROUPS).await?;
        upsert_other_group(pool, "disease_groups", &mut ids).await?;
        ids
    };

    let mut causes: BTreeMap<i64, String> = BTreeMap::new();
    for row in rows {
        if row.rei_id.is_none() {
            causes.entry(row.cause_id).or_insert_with(|| row.cause_name.clone());
        }
    }
    println!("  {} distinct causes", causes.len());

    let mut indicators: HashMap<i64, Indicator> = HashMap::new();
    for (cause_id, cause_name) in &causes {
        let group_code = disease_group(cause_name);
        let group_id = group_ids[group_code];
        let table = indicator_table_name("dm", cause_name);
        create_indicator_table(pool, "create_disease_table", &table).await?;
        let (id,): (i32,) = sqlx::query_as(
            "INSERT INTO disease_indicators (cause_id, cause_name, group_id, table_name) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (cause_id) DO UPDATE SET cause_name = EXCLUDED.cause_name, \
             group_id = EXCLUDED.group_id, table_name = EXCLUDED.table_name \
             RETURNING indicator_id",
        )
        .bind(cause_id)
        .bind(cause_name)
        .bind(group_id)
        .bind(&table)
        .fetch_one(pool)
        .await
        .context("upserting disease indicator")?;
        indicators.insert(*cause_id, Indicator { id, table });
    }

    let mut inserted = 0;
    let mut errors = 0;
    for row in rows {
        if row.rei_id.is_some() {
            continue;
        }
        let Some(indicator) = indicators.get(&row.cause_id) else {
            continue;
        };
        let sql = format!(
            "INSERT INTO {} (sex, age, year, indicator_id, measure, value) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            indicator.table
        );
        let result = sqlx::query(&sql)
            .bind(&row.sex_name)
            .bind(&row.age_name)
            .bind(row.year)
            .bind(indicator.id)
            .bind(format!("{} ({})", row.measure_name, row.metric_name))
            .bind(row.rounded_value())
            .execute(pool)
            .await;
        match result {
            Ok(_) => inserted += 1,
            Err(e) => {
                errors += 1;
                if errors <= 5 {
                    eprintln!("  ! {} row failed: {}", indicator.table, e);
                }
            }
        }
    }
    println!("  Inserted {} disease rows ({} errors)", inserted, errors);
    Ok(indicators)
}

/// Shared shape of the environment and lifestyle domains; they differ only
/// in the group tables, the categorizer, and the extra cause filter.
struct RiskDomain {
    label: &'static str,
    group_table: &'static str,
    groups: &'static [(&'static str, &'static str, &'static [&'static str])],
    indicator_table: &'static str,
    indicator_id_column: &'static str,
    create_routine: &'static str,
    table_prefix: &'static str,
    categorize: fn(&str) -> Option<&'static str>,
    filter_circular: bool,
}

const ENVIRONMENT_DOMAIN: RiskDomain = RiskDomain {
    label: "environment",
    group_table: "environment_groups",
    groups: ENVIRONMENT_GROUPS,
    indicator_table: "environment_indicators",
    indicator_id_column: "env_indicator_id",
    create_routine: "create_environment_table",
    table_prefix: "em",
    categorize: environment_group,
    filter_circular: false,
};

const LIFESTYLE_DOMAIN: RiskDomain = RiskDomain {
    label: "lifestyle",
    group_table: "lifestyle_groups",
    groups: LIFESTYLE_GROUPS,
    indicator_table: "lifestyle_indicators",
    indicator_id_column: "lifestyle_indicator_id",
    create_routine: "create_lifestyle_table",
    table_prefix: "lm",
    categorize: lifestyle_group,
    filter_circular: true,
};

async fn load_risk_domain(
    pool: &PgPool,
    domain: &RiskDomain,
    rows: &[GbdRow],
    disease_indicators: &HashMap<i64, Indicator>,
) -> Result<()> {
    let group_ids = upsert_groups(pool, domain.group_table, domain.groups).await?;

    // Distinct risks that belong to this domain.
    let mut risks: BTreeMap<i64, String> = BTreeMap::new();
    for row in rows {
        let (Some(rei_id), Some(rei_name)) = (row.rei_id, row.rei_name.as_deref()) else {
            continue;
        };
        if (domain.categorize)(rei_name).is_some() {
            risks.entry(rei_id).or_insert_with(|| rei_name.to_string());
        }
    }
    println!("  {} distinct {} risks", risks.len(), domain.label);

    let mut indicators: HashMap<i64, Indicator> = HashMap::new();
    for (rei_id, rei_name) in &risks {
        // categorize returned Some for every name in the map
        let Some(group_code) = (domain.categorize)(rei_name) else {
            continue;
        };
        let group_id = group_ids[group_code];
        let table = indicator_table_name(domain.table_prefix, rei_name);
        create_indicator_table(pool, domain.create_routine, &table).await?;
        let upsert = format!(
            "INSERT INTO {} (rei_id, rei_name, group_id, table_name) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (rei_id) DO UPDATE SET rei_name = EXCLUDED.rei_name, \
             group_id = EXCLUDED.group_id, table_name = EXCLUDED.table_name \
             RETURNING indicator_id",
            domain.indicator_table
        );
        let (id,): (i32,) = sqlx::query_as(&upsert)
            .bind(rei_id)
            .bind(rei_name)
            .bind(group_id)
            .bind(&table)
            .fetch_one(pool)
            .await
            .with_context(|| format!("upserting {} indicator", domain.label))?;
        indicators.insert(*rei_id, Indicator { id, table });
    }

    let mut inserted = 0;
    let mut errors = 0;
    for row in rows {
        let Some(rei_id) = row.rei_id else {
            continue;
        };
        let Some(indicator) = indicators.get(&rei_id) else {
            continue;
        };
        if domain.filter_circular && is_circular(&row.cause_name) {
            continue;
        }
        let Some(disease) = disease_indicators.get(&row.cause_id) else {
            continue;
        };
        let sql = format!(
            "INSERT INTO {} (sex, age, year, disease_indicator_id, {}, measure, value) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            indicator.table, domain.indicator_id_column
        );
        let result = sqlx::query(&sql)
            .bind(&row.sex_name)
            .bind(&row.age_name)
            .bind(row.year)
            .bind(disease.id)
            .bind(indicator.id)
            .bind(format!("{} ({})", row.measure_name, row.metric_name))
            .bind(row.rounded_value())
            .execute(pool)
            .await;
        match result {
            Ok(_) => inserted += 1,
            Err(e) => {
                errors += 1;
                if errors <= 5 {
                    eprintln!("  ! {} row failed: {}", indicator.table, e);
                }
            }
        }
    }
    println!("  Inserted {} {} rows ({} errors)", inserted, domain.label, errors);
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

    println!("=== GBD Indicator Importer ===");
    println!("CSV dir: {}", args.csv_dir.display());

    let files = list_gbd_files(&args.csv_dir)?;
    if files.is_empty() {
        anyhow::bail!("no {}*.csv files in {}", GBD_FILE_PREFIX, args.csv_dir.display());
    }

    let mut rows: Vec<GbdRow> = Vec::new();
    for path in &files {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("?");
        let parsed = parse_gbd_rows(&content, file_name);
        println!("  {} - {} rows", file_name, parsed.len());
        rows.extend(parsed);
    }

    let before = rows.len();
    rows.retain(|r| !is_aggregate(&r.cause_name));
    println!(
        "  {} rows after dropping {} aggregate-cause rows",
        rows.len(),
        before - rows.len()
    );

    if args.dry_run {
        let diseases = rows.iter().filter(|r| r.rei_id.is_none()).count();
        let risks = rows.len() - diseases;
        println!("\nDry run - {} disease rows, {} risk rows", diseases, risks);
        return Ok(());
    }

    println!("\nConnecting to {}:{}...", config.pg_host, config.pg_port);
    let pool = connect_with_retry(&config.database_url(), 10, Duration::from_secs(5)).await?;

    println!("\n[1/3] Diseases");
    let disease_indicators = load_diseases(&pool, &rows).await?;

    println!("\n[2/3] Environmental risks");
    load_risk_domain(&pool, &ENVIRONMENT_DOMAIN, &rows, &disease_indicators).await?;

    println!("\n[3/3] Lifestyle risks");
    load_risk_domain(&pool, &LIFESTYLE_DOMAIN, &rows, &disease_indicators).await?;

    println!("\n=== Import Complete ===");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // TABLE NAMES
    // -------------------------------------------------------------------------

    #[test]
    fn test_table_name_sanitization() {
        assert_eq!(
            indicator_table_name("dm", "Tracheal, bronchus, and lung cancer"),
            "dm_tracheal_bronchus_and_lung_cancer"
        );
        assert_eq!(
            indicator_table_name("lm", "High body-mass index"),
            "lm_high_body_mass_index"
        );
        assert_eq!(
            indicator_table_name("dm", "Alzheimer's disease and other dementias"),
            "dm_alzheimers_disease_and_other_dementias"
        );
        assert_eq!(
            indicator_table_name("em", "Ambient particulate matter pollution (PM2.5)"),
            "em_ambient_particulate_matter_pollution_pm25"
        );
    }

    #[test]
    fn test_table_name_is_capped() {
        let long = "a very long indicator name that keeps going well past the database limit for identifiers";
        let table = indicator_table_name("dm", long);
        assert!(table.len() <= 3 + 55);
        assert!(table.starts_with("dm_a_very_long"));
        assert!(!table.ends_with('_'));
    }

    #[test]
    fn test_table_name_collapses_separator_runs() {
        assert_eq!(indicator_table_name("dm", "a  -  b"), "dm_a_b");
    }

    // -------------------------------------------------------------------------
    // CATEGORIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_disease_groups() {
        assert_eq!(disease_group("Tracheal, bronchus, and lung cancer"), "CANCER");
        assert_eq!(disease_group("Ischemic heart disease"), "CARDIO");
        assert_eq!(disease_group("Alzheimer's disease and other dementias"), "NEURO");
        assert_eq!(disease_group("Chronic obstructive pulmonary disease"), "RESPIRATORY");
        assert_eq!(disease_group("Pneumonia"), "RESPIRATORY");
        assert_eq!(disease_group("Bronchitis"), "RESPIRATORY");
        assert_eq!(disease_group("Interstitial lung disease"), "RESPIRATORY");
        assert_eq!(disease_group("Diabetes mellitus type 2"), "METABOLIC");
        assert_eq!(disease_group("Hepatitis B"), "INFECTIOUS");
        assert_eq!(disease_group("Cirrhosis due to hepatitis C"), "INFECTIOUS");
        assert_eq!(disease_group("Cirrhosis and other chronic liver diseases"), "DIGESTIVE");
        assert_eq!(disease_group("Major depressive disorder"), "MENTAL");
        assert_eq!(disease_group("Road injuries"), "OTHER");
    }

    #[test]
    fn test_environment_groups() {
        assert_eq!(environment_group("Ambient particulate matter pollution"), Some("AIR_POLLUTION"));
        assert_eq!(environment_group("High temperature"), Some("TEMPERATURE"));
        assert_eq!(environment_group("Unsafe water source"), Some("WATER_SANITATION"));
        assert_eq!(environment_group("Lead exposure"), Some("LEAD"));
        assert_eq!(environment_group("Smoking"), None);
    }

    #[test]
    fn test_lifestyle_groups() {
        assert_eq!(lifestyle_group("Smoking"), Some("TOBACCO"));
        assert_eq!(lifestyle_group("Secondhand smoke"), Some("TOBACCO"));
        assert_eq!(lifestyle_group("High alcohol use"), Some("ALCOHOL_DRUGS"));
        assert_eq!(lifestyle_group("Diet high in sodium"), Some("DIET"));
        assert_eq!(lifestyle_group("Low physical activity"), Some("PHYSICAL_ACTIVITY"));
        assert_eq!(lifestyle_group("High body-mass index"), Some("METABOLIC"));
        assert_eq!(lifestyle_group("Unsafe water source"), None);
    }

    #[test]
    fn test_group_display_lookup() {
        assert_eq!(group_display(DISEASE_GROUPS, "CANCER"), "Cancers");
        assert_eq!(group_display(LIFESTYLE_GROUPS, "DIET"), "Dietary risks");
        assert_eq!(group_display(DISEASE_GROUPS, "MISSING"), "Other");
    }

    // -------------------------------------------------------------------------
    // FILTERS
    // -------------------------------------------------------------------------

    #[test]
    fn test_aggregate_causes_are_filtered() {
        assert!(is_aggregate("All causes"));
        assert!(is_aggregate("Non-communicable diseases"));
        assert!(is_aggregate("Cardiovascular diseases"));
        assert!(is_aggregate("Total Cancer"));
        assert!(is_aggregate("Lower respiratory infections"));
        assert!(is_aggregate("Enteric infections"));
        assert!(is_aggregate("Neglected tropical diseases and malaria"));
        assert!(is_aggregate("HIV/AIDS and sexually transmitted infections"));
        assert!(is_aggregate("Maternal and neonatal disorders"));
        assert!(!is_aggregate("Ischemic heart disease"));
        assert!(!is_aggregate("Tracheal, bronchus, and lung cancer"));
    }

    #[test]
    fn test_aggregate_substance_use_causes_never_get_tables() {
        // These would otherwise double-count against their constituents and
        // slip past the lifestyle-only circular filter in the disease domain.
        assert!(is_aggregate("Alcohol use disorders"));
        assert!(is_aggregate("Substance use disorders"));
    }

    #[test]
    fn test_circular_cause_filter() {
        assert!(is_circular("Alcohol use disorders"));
        assert!(is_circular("Drug use disorders"));
        assert!(is_circular("Eating disorders"));
        assert!(!is_circular("Cirrhosis and other chronic liver diseases"));
    }

    // -------------------------------------------------------------------------
    // PARSING
    // -------------------------------------------------------------------------

    const SAMPLE_CSV: &str = "\
measure_name,sex_name,age_name,cause_id,cause_name,rei_id,rei_name,metric_name,year,val\n\
Deaths,Male,50-69 years,426,\"Tracheal, bronchus, and lung cancer\",99,Smoking,Number,2020,412.7\n\
Deaths,Female,70+ years,521,Cirrhosis and other chronic liver diseases,,,Number,2021,\n";

    #[test]
    fn test_parse_rows_with_and_without_risk() {
        let rows = parse_gbd_rows(SAMPLE_CSV, "test.csv");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rei_id, Some(99));
        assert_eq!(rows[0].rei_name.as_deref(), Some("Smoking"));
        assert_eq!(rows[0].cause_name, "Tracheal, bronchus, and lung cancer");
        assert_eq!(rows[1].rei_id, None);
        assert_eq!(rows[1].val, None);
    }

    #[test]
    fn test_value_rounds_to_integer() {
        let rows = parse_gbd_rows(SAMPLE_CSV, "test.csv");
        assert_eq!(rows[0].rounded_value(), 413);
        // Missing values load as zero.
        assert_eq!(rows[1].rounded_value(), 0);
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let csv = "\
measure_name,sex_name,age_name,cause_id,cause_name,rei_id,rei_name,metric_name,year,val\n\
Deaths,Male,All ages,426,Lung cancer,,,Number,not-a-year,5\n\
Deaths,Male,All ages,426,Lung cancer,,,Number,2020,5\n";
        let rows = parse_gbd_rows(csv, "test.csv");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].year, 2020);
    }
}
