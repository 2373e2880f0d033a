//! Extractor Service - Builds the risk→disease star schema from country sources
//!
//! Responsibilities:
//! - Parse per-country mortality dumps (SQL) and GBD exports (CSV)
//! - Reconcile source-specific sex/age/disease codings into the canonical vocabulary
//! - Aggregate deaths per (risk pair, country, sex, age group, year)
//! - Estimate attributable deaths via published fractions where no direct data exists
//! - Resolve dimension keys and bulk-load the four fact tables in one transaction
//!
//! Usage:
//!   cargo run --bin extractor -- --dump-dir data/dumps --csv-dir data/csv
//!   cargo run --bin extractor -- --dry-run

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "extractor", about = "Extracts risk→disease facts into the star schema")]
struct Args {
    /// Directory containing the country SQL dumps (germany.sql, sweden.sql, usa.sql)
    #[arg(long, default_value = "data/dumps")]
    dump_dir: PathBuf,

    /// Directory containing the Swiss GBD CSV exports
    #[arg(long, default_value = "data/csv")]
    csv_dir: PathBuf,

    /// Dry run - extract and report, don't touch the database
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
                .unwrap_or_else(|_| "5433".to_string())
                .parse()
                .context("PG_PORT must be a port number")?,
            pg_database: std::env::var("PG_DATABASE")
                .unwrap_or_else(|_| "health_warehouse".to_string()),
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

/// Connect with a bounded retry budget; the database may still be starting up.
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
// CANONICAL VOCABULARY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Country {
    Deu,
    Swe,
    Usa,
    Che,
}

impl Country {
    fn code(self) -> &'static str {
        match self {
            Country::Deu => "DEU",
            Country::Swe => "SWE",
            Country::Usa => "USA",
            Country::Che => "CHE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Sex {
    Male,
    Female,
    Both,
}

impl Sex {
    fn code(self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Both => "B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AgeGroup {
    Child,      // 0-14
    YoungAdult, // 15-49
    MiddleAge,  // 50-69
    Senior,     // 70+
    All,
}

impl AgeGroup {
    fn code(self) -> &'static str {
        match self {
            AgeGroup::Child => "0-14",
            AgeGroup::YoungAdult => "15-49",
            AgeGroup::MiddleAge => "50-69",
            AgeGroup::Senior => "70+",
            AgeGroup::All => "ALL",
        }
    }
}

/// The four risk→disease relationships this warehouse tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RiskPair {
    SmokingLungCancer,
    BmiCardiovascular,
    PollutionRespiratory,
    AlcoholCirrhosis,
}

impl RiskPair {
    const ALL: [RiskPair; 4] = [
        RiskPair::SmokingLungCancer,
        RiskPair::BmiCardiovascular,
        RiskPair::PollutionRespiratory,
        RiskPair::AlcoholCirrhosis,
    ];

    fn fact_table(self) -> &'static str {
        match self {
            RiskPair::SmokingLungCancer => "fact_smoking_lung_cancer",
            RiskPair::BmiCardiovascular => "fact_bmi_cardiovascular",
            RiskPair::PollutionRespiratory => "fact_pollution_respiratory",
            RiskPair::AlcoholCirrhosis => "fact_alcohol_cirrhosis",
        }
    }

    fn total_column(self) -> &'static str {
        match self {
            RiskPair::SmokingLungCancer => "lung_cancer_deaths",
            RiskPair::BmiCardiovascular => "cvd_deaths",
            RiskPair::PollutionRespiratory => "respiratory_deaths",
            RiskPair::AlcoholCirrhosis => "cirrhosis_deaths",
        }
    }

    fn label(self) -> &'static str {
        match self {
            RiskPair::SmokingLungCancer => "Smoking → Lung cancer",
            RiskPair::BmiCardiovascular => "High BMI → Cardiovascular",
            RiskPair::PollutionRespiratory => "Air pollution → Respiratory",
            RiskPair::AlcoholCirrhosis => "Alcohol → Cirrhosis",
        }
    }
}

/// One aggregated fact row, still carrying natural codes.
#[derive(Debug, Clone, PartialEq)]
struct FactRow {
    country: Country,
    sex: Sex,
    age: AgeGroup,
    year: i32,
    total_deaths: f64,
    attributable_deaths: f64,
}

/// All extracted facts for one source, keyed per risk pair.
type FactSet = BTreeMap<RiskPair, Vec<FactRow>>;

fn merge_facts(into: &mut FactSet, from: FactSet) {
    for (pair, rows) in from {
        into.entry(pair).or_default().extend(rows);
    }
}

// =============================================================================
// CODE MAPPING TABLES
// =============================================================================
// Per-source vocabularies are immutable constants; rows whose codes fall
// outside them are dropped before aggregation, never defaulted.

/// Numeric sex codes shared by the DEU/SWE/USA dump fact tables.
fn numeric_sex(code: &str) -> Option<Sex> {
    match code {
        "1" => Some(Sex::Male),
        "2" => Some(Sex::Female),
        "3" => Some(Sex::Both),
        _ => None,
    }
}

/// Textual sex labels used by the German registry tables. The FEMALE test
/// must run before the MALE substring test.
fn text_sex(text: &str) -> Sex {
    let upper = text.to_uppercase();
    if upper.contains("FEMALE") {
        Sex::Female
    } else if upper.contains("MALE") {
        Sex::Male
    } else {
        Sex::Both
    }
}

/// Five-bucket age codes used by the DEU/SWE/CHE dump fact tables.
fn five_bucket_age(code: &str) -> Option<AgeGroup> {
    match code {
        "1" => Some(AgeGroup::Child),
        "2" => Some(AgeGroup::YoungAdult),
        "3" => Some(AgeGroup::MiddleAge),
        "4" => Some(AgeGroup::Senior),
        "5" => Some(AgeGroup::All),
        _ => None,
    }
}

/// USA fine-grained age codes collapsed into the WHO standard buckets.
const USA_AGE_CODES: &[(&str, AgeGroup)] = &[
    ("1", AgeGroup::Child),        // <5 years
    ("23", AgeGroup::Child),       // 5-14 years
    ("8", AgeGroup::YoungAdult),   // 15-19 years
    ("9", AgeGroup::YoungAdult),   // 20-24 years
    ("10", AgeGroup::YoungAdult),  // 25-29 years
    ("11", AgeGroup::YoungAdult),  // 30-34 years
    ("12", AgeGroup::YoungAdult),  // 35-39 years
    ("13", AgeGroup::YoungAdult),  // 40-44 years
    ("14", AgeGroup::YoungAdult),  // 45-49 years
    ("25", AgeGroup::MiddleAge),   // 50-69 years
    ("19", AgeGroup::Senior),      // 70-74 years
    ("20", AgeGroup::Senior),      // 75-79 years
    ("21", AgeGroup::Senior),      // 80+ years
];

fn usa_age(code: &str) -> Option<AgeGroup> {
    USA_AGE_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, g)| *g)
}

/// Age expressed as a text range like "15-19 years" buckets by its lower bound.
fn range_age(text: &str) -> Option<AgeGroup> {
    let trimmed = text.trim();
    let (low, rest) = trimmed.split_once('-')?;
    if !rest.trim_start().starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let start: u32 = low.trim().parse().ok()?;
    Some(match start {
        0..=14 => AgeGroup::Child,
        15..=49 => AgeGroup::YoungAdult,
        50..=69 => AgeGroup::MiddleAge,
        _ => AgeGroup::Senior,
    })
}

/// GBD export age-group display names used by the Swiss CSVs.
fn swiss_age(name: &str) -> Option<AgeGroup> {
    match name {
        "<5 years" | "5-14 years" => Some(AgeGroup::Child),
        "15-49 years" | "15-19 years" | "20-24 years" | "25-29 years" | "30-34 years"
        | "35-39 years" | "40-44 years" | "45-49 years" => Some(AgeGroup::YoungAdult),
        "50-69 years" => Some(AgeGroup::MiddleAge),
        "70+ years" | "70-74 years" | "75-79 years" | "80+ years" => Some(AgeGroup::Senior),
        _ if name.to_lowercase().contains("all ages") => Some(AgeGroup::All),
        _ => None,
    }
}

fn swiss_sex(name: &str) -> Option<Sex> {
    match name {
        "Male" => Some(Sex::Male),
        "Female" => Some(Sex::Female),
        _ => None,
    }
}

// =============================================================================
// ATTRIBUTABLE FRACTIONS
// =============================================================================
// Literature-derived constants for sources that only report total disease
// deaths. These are epidemiological assumptions, not values computed from the
// data: RKI puts smoking-attributable lung cancer at ~80% for Germany, WHO
// registry studies at ~75% for Sweden; GBD 2019 estimates ~20% of respiratory
// deaths from particulate pollution, ~15% of CVD from high BMI, and 48-55% of
// cirrhosis from alcohol.

fn estimated_fraction(country: Country, pair: RiskPair) -> f64 {
    match (country, pair) {
        (Country::Deu, RiskPair::SmokingLungCancer) => 0.80,
        (Country::Swe, RiskPair::SmokingLungCancer) => 0.75,
        (_, RiskPair::BmiCardiovascular) => 0.15,
        (_, RiskPair::PollutionRespiratory) => 0.20,
        (Country::Deu, RiskPair::AlcoholCirrhosis) => 0.48,
        (Country::Swe, RiskPair::AlcoholCirrhosis) => 0.55,
        // USA and CHE carry direct attribution data; no fraction applies.
        _ => 0.0,
    }
}

// =============================================================================
// SQL DUMP PARSER
// =============================================================================

/// Case-insensitive substring search; needles are ASCII keywords.
fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < n.len() || from > h.len() - n.len() {
        return None;
    }
    (from..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

fn clean_field(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(trimmed);
    stripped.to_string()
}

/// Split one parenthesized VALUES tuple into fields. A comma inside a
/// single-quoted string is not a separator, and a backslash-escaped quote
/// does not close the string.
fn split_tuple_fields(tuple: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut prev = '\0';
    for ch in tuple.chars() {
        match ch {
            '\'' => {
                if !in_quotes {
                    in_quotes = true;
                } else if prev != '\\' {
                    in_quotes = false;
                }
                current.push(ch);
            }
            ',' if !in_quotes => {
                fields.push(clean_field(&current));
                current.clear();
                prev = '\0';
                continue;
            }
            _ => current.push(ch),
        }
        prev = ch;
    }
    if !current.trim().is_empty() || !fields.is_empty() {
        fields.push(clean_field(&current));
    }
    fields
}

/// Extract the VALUES rows of every INSERT statement targeting `table`.
/// Handles both the backtick-quoted dialect and the optionally
/// schema-qualified bare dialect.
fn parse_sql_inserts(sql: &str, table: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut pos = 0;
    while let Some(ins) = find_ci(sql, "insert into", pos) {
        pos = ins + "insert into".len();
        let rest = sql[pos..].trim_start();
        let rest_offset = sql.len() - rest.len();

        let target = if let Some(stripped) = rest.strip_prefix('`') {
            stripped.split('`').next().unwrap_or("")
        } else {
            let ident = rest
                .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                .next()
                .unwrap_or("");
            ident.rsplit('.').next().unwrap_or(ident)
        };
        if !target.eq_ignore_ascii_case(table) {
            continue;
        }

        let Some(vpos) = find_ci(sql, "values", rest_offset) else {
            continue;
        };
        let body_start = vpos + "values".len();

        let mut in_quotes = false;
        let mut prev = '\0';
        let mut tuple_start: Option<usize> = None;
        let mut scanned_to = body_start;
        for (off, ch) in sql[body_start..].char_indices() {
            let abs = body_start + off;
            scanned_to = abs + ch.len_utf8();
            match ch {
                '\'' => {
                    if !in_quotes {
                        in_quotes = true;
                    } else if prev != '\\' {
                        in_quotes = false;
                    }
                }
                '(' if !in_quotes && tuple_start.is_none() => tuple_start = Some(abs + 1),
                ')' if !in_quotes => {
                    if let Some(start) = tuple_start.take() {
                        rows.push(split_tuple_fields(&sql[start..abs]));
                    }
                }
                ';' if !in_quotes && tuple_start.is_none() => break,
                _ => {}
            }
            prev = ch;
        }
        pos = scanned_to;
    }
    rows
}

/// Ordered column layout of one source table, fixed per dump format.
struct TableSchema {
    table: &'static str,
    columns: &'static [&'static str],
}

impl TableSchema {
    fn field<'a>(&self, row: &'a [String], name: &str) -> &'a str {
        self.columns
            .iter()
            .position(|c| *c == name)
            .and_then(|i| row.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}

struct DumpTable {
    rows: Vec<Vec<String>>,
    short_rows: usize,
}

/// Parse a dump table and validate row width against the schema once, so a
/// truncated row becomes a reported defect instead of a silent skip.
fn read_dump_table(sql: &str, schema: &TableSchema) -> DumpTable {
    let mut rows = parse_sql_inserts(sql, schema.table);
    let before = rows.len();
    rows.retain(|r| r.len() >= schema.columns.len());
    let short_rows = before - rows.len();
    if short_rows > 0 {
        println!(
            "    ! {}: {} rows shorter than the {}-column layout, skipped",
            schema.table,
            short_rows,
            schema.columns.len()
        );
    }
    DumpTable { rows, short_rows }
}

fn field_num(value: &str) -> f64 {
    if value.is_empty() || value.eq_ignore_ascii_case("null") {
        0.0
    } else {
        value.parse().unwrap_or(0.0)
    }
}

// =============================================================================
// USA - DIRECT ATTRIBUTION
// =============================================================================
// The USA dump carries both total disease deaths (fact_disease) and deaths
// attributable to a risk factor (fact_disease_risk). measure_id 1 = Deaths,
// metric_id 1 = Number; the risk→cause allow-list pins the four pairs.

const USA_FACT_DISEASE: TableSchema = TableSchema {
    table: "fact_disease",
    columns: &[
        "id", "measure_id", "sex_id", "age_id", "cause_id", "metric_id", "year", "value",
        "upper", "lower", "unit",
    ],
};

const USA_FACT_DISEASE_RISK: TableSchema = TableSchema {
    table: "fact_disease_risk",
    columns: &[
        "id", "measure_id", "sex_id", "age_id", "cause_id", "risk_id", "metric_id", "year",
        "value", "upper", "lower", "unit",
    ],
};

const USA_YEARS: std::ops::RangeInclusive<i32> = 2014..=2023;

/// Risk→cause allow-list: smoking(99)→lung cancer(426), BMI(108)→IHD+stroke
/// (493, 498), pollution(85)→COPD+LRI (509, 322), alcohol(102)→cirrhosis(521).
fn usa_pair(risk_id: &str, cause_id: &str) -> Option<RiskPair> {
    match (risk_id, cause_id) {
        ("99", "426") => Some(RiskPair::SmokingLungCancer),
        ("108", "493" | "498") => Some(RiskPair::BmiCardiovascular),
        ("85", "509" | "322") => Some(RiskPair::PollutionRespiratory),
        ("102", "521") => Some(RiskPair::AlcoholCirrhosis),
        _ => None,
    }
}

/// Key into the per-cause totals built from fact_disease.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MeasureKey {
    cause: String,
    sex: Sex,
    age: AgeGroup,
    year: i32,
}

fn extract_usa(sql: &str) -> FactSet {
    println!("  Parsing fact_disease (totals) and fact_disease_risk (attributable)...");
    let disease = read_dump_table(sql, &USA_FACT_DISEASE);
    let risk = read_dump_table(sql, &USA_FACT_DISEASE_RISK);
    println!(
        "    Parsed {} total-death rows, {} attributable rows",
        disease.rows.len(),
        risk.rows.len()
    );

    // Total deaths per (cause, sex, age, year).
    let mut totals: BTreeMap<MeasureKey, f64> = BTreeMap::new();
    for row in &disease.rows {
        let s = &USA_FACT_DISEASE;
        if s.field(row, "measure_id") != "1" || s.field(row, "metric_id") != "1" {
            continue;
        }
        let Ok(year) = s.field(row, "year").parse::<i32>() else {
            continue;
        };
        if !USA_YEARS.contains(&year) {
            continue;
        }
        let (Some(sex), Some(age)) = (
            numeric_sex(s.field(row, "sex_id")),
            usa_age(s.field(row, "age_id")),
        ) else {
            continue;
        };
        let key = MeasureKey {
            cause: s.field(row, "cause_id").to_string(),
            sex,
            age,
            year,
        };
        *totals.entry(key).or_insert(0.0) += field_num(s.field(row, "value"));
    }

    // Attributable deaths per (pair, sex, age, year, cause).
    let mut attributable: BTreeMap<(RiskPair, Sex, AgeGroup, i32, String), f64> = BTreeMap::new();
    for row in &risk.rows {
        let s = &USA_FACT_DISEASE_RISK;
        if s.field(row, "measure_id") != "1" || s.field(row, "metric_id") != "1" {
            continue;
        }
        let Ok(year) = s.field(row, "year").parse::<i32>() else {
            continue;
        };
        if !USA_YEARS.contains(&year) {
            continue;
        }
        let (Some(sex), Some(age)) = (
            numeric_sex(s.field(row, "sex_id")),
            usa_age(s.field(row, "age_id")),
        ) else {
            continue;
        };
        let cause = s.field(row, "cause_id");
        let Some(pair) = usa_pair(s.field(row, "risk_id"), cause) else {
            continue;
        };
        let key = (pair, sex, age, year, cause.to_string());
        *attributable.entry(key).or_insert(0.0) += field_num(s.field(row, "value"));
    }

    // Join on the attributable keys; a missing total defaults to zero,
    // never the reverse.
    let mut combined: BTreeMap<(RiskPair, Sex, AgeGroup, i32), (f64, f64)> = BTreeMap::new();
    for ((pair, sex, age, year, cause), attr_value) in &attributable {
        let total = totals
            .get(&MeasureKey {
                cause: cause.clone(),
                sex: *sex,
                age: *age,
                year: *year,
            })
            .copied()
            .unwrap_or(0.0);
        let entry = combined.entry((*pair, *sex, *age, *year)).or_insert((0.0, 0.0));
        entry.0 += total;
        entry.1 += attr_value;
    }

    let mut facts = FactSet::new();
    for ((pair, sex, age, year), (total, attr)) in combined {
        facts.entry(pair).or_default().push(FactRow {
            country: Country::Usa,
            sex,
            age,
            year,
            total_deaths: total,
            attributable_deaths: attr,
        });
    }
    print_extracted("USA", &facts);
    facts
}

// =============================================================================
// GERMANY - ESTIMATED ATTRIBUTION
// =============================================================================
// The German dump reports standardized death rates per 100k (one SDR table
// per disease, no age breakdown) plus a population table. Rates convert to
// absolute counts via population aggregated by (sex, year); attributable
// deaths are estimated with the per-pair fractions.
// Table names appear exactly as in the dump, typos included.

const DEU_POPULATION: TableSchema = TableSchema {
    table: "population",
    columns: &["country", "sex", "age_group", "year", "population"],
};

const DEU_SDR_COLUMNS: &[&str] = &["country", "sex", "year", "value"];

const DEU_SDR_TABLES: [(RiskPair, TableSchema); 4] = [
    (
        RiskPair::SmokingLungCancer,
        TableSchema { table: "dm_lung_cancer_sdr", columns: DEU_SDR_COLUMNS },
    ),
    (
        RiskPair::BmiCardiovascular,
        TableSchema { table: "dm_ischaemic_heart_sdr", columns: DEU_SDR_COLUMNS },
    ),
    (
        RiskPair::PollutionRespiratory,
        TableSchema { table: "dm_chronic_lover_respiratory_sdr", columns: DEU_SDR_COLUMNS },
    ),
    (
        RiskPair::AlcoholCirrhosis,
        TableSchema { table: "dm_liver_disiasee_sdr", columns: DEU_SDR_COLUMNS },
    ),
];

const DEU_YEARS: std::ops::RangeInclusive<i32> = 2013..=2023;

fn extract_germany(sql: &str) -> FactSet {
    println!("  Parsing population and SDR tables...");
    let population = read_dump_table(sql, &DEU_POPULATION);
    println!("    Parsed {} population rows", population.rows.len());

    // Population summed over age groups, per-sex only; the "both" bucket
    // would double-count when consumers sum over sex.
    let mut pop_by_sex_year: BTreeMap<(Sex, i32), f64> = BTreeMap::new();
    for row in &population.rows {
        let s = &DEU_POPULATION;
        let sex = text_sex(s.field(row, "sex"));
        if sex == Sex::Both {
            continue;
        }
        let Ok(year) = s.field(row, "year").parse::<i32>() else {
            continue;
        };
        if !DEU_YEARS.contains(&year) {
            continue;
        }
        *pop_by_sex_year.entry((sex, year)).or_insert(0.0) +=
            field_num(s.field(row, "population"));
    }

    let mut facts = FactSet::new();
    for (pair, schema) in &DEU_SDR_TABLES {
        let table = read_dump_table(sql, schema);
        let fraction = estimated_fraction(Country::Deu, *pair);

        let mut deaths: BTreeMap<(Sex, i32), f64> = BTreeMap::new();
        for row in &table.rows {
            let sex = text_sex(schema.field(row, "sex"));
            if sex == Sex::Both {
                continue;
            }
            let Ok(year) = schema.field(row, "year").parse::<i32>() else {
                continue;
            };
            if !DEU_YEARS.contains(&year) {
                continue;
            }
            let rate = field_num(schema.field(row, "value"));
            let pop = pop_by_sex_year.get(&(sex, year)).copied().unwrap_or(0.0);
            *deaths.entry((sex, year)).or_insert(0.0) += rate / 100_000.0 * pop;
        }

        for ((sex, year), total) in deaths {
            facts.entry(*pair).or_default().push(FactRow {
                country: Country::Deu,
                sex,
                age: AgeGroup::All,
                year,
                total_deaths: total,
                attributable_deaths: total * fraction,
            });
        }
    }
    print_extracted("Germany", &facts);
    facts
}

// =============================================================================
// SWEDEN - ESTIMATED ATTRIBUTION
// =============================================================================
// The Swedish registry dump reports absolute death counts per disease with a
// year lookup table. Disease ids: 12 = lung cancer (C34), 41 = ischaemic
// heart (I20-I25), 52 = chronic lower respiratory (J40-J47), 57 = liver
// cirrhosis (K74). Attributable deaths are estimated with the per-pair
// fractions.

const SWE_DISEASE_DATA: TableSchema = TableSchema {
    table: "disease_data",
    columns: &[
        "id", "year_id", "disease_id", "region_id", "gender_id", "total_cases", "death_cases",
    ],
};

const SWE_YEAR: TableSchema = TableSchema {
    table: "rok",
    columns: &["year_id", "year"],
};

const SWE_YEARS: std::ops::RangeInclusive<i32> = 2013..=2023;

fn swe_pair(disease_id: &str) -> Option<RiskPair> {
    match disease_id {
        "12" => Some(RiskPair::SmokingLungCancer),
        "41" => Some(RiskPair::BmiCardiovascular),
        "52" => Some(RiskPair::PollutionRespiratory),
        "57" => Some(RiskPair::AlcoholCirrhosis),
        _ => None,
    }
}

fn extract_sweden(sql: &str) -> FactSet {
    println!("  Parsing disease_data and the year lookup table...");
    let disease = read_dump_table(sql, &SWE_DISEASE_DATA);
    let years = read_dump_table(sql, &SWE_YEAR);
    println!(
        "    Parsed {} disease rows, {} year rows",
        disease.rows.len(),
        years.rows.len()
    );

    let year_map: HashMap<String, i32> = years
        .rows
        .iter()
        .filter_map(|row| {
            let id = SWE_YEAR.field(row, "year_id").to_string();
            let year = SWE_YEAR.field(row, "year").parse::<i32>().ok()?;
            Some((id, year))
        })
        .collect();

    // Deaths summed per (pair, sex, year); the "both" gender bucket (3) is
    // excluded to avoid triple counting.
    let mut deaths: BTreeMap<(RiskPair, Sex, i32), f64> = BTreeMap::new();
    for row in &disease.rows {
        let s = &SWE_DISEASE_DATA;
        let Some(pair) = swe_pair(s.field(row, "disease_id")) else {
            continue;
        };
        let Some(sex) = numeric_sex(s.field(row, "gender_id")) else {
            continue;
        };
        if sex == Sex::Both {
            continue;
        }
        let Some(year) = year_map.get(s.field(row, "year_id")).copied() else {
            continue;
        };
        if !SWE_YEARS.contains(&year) {
            continue;
        }
        let value = field_num(s.field(row, "death_cases"));
        if value <= 0.0 {
            continue;
        }
        *deaths.entry((pair, sex, year)).or_insert(0.0) += value;
    }

    let mut facts = FactSet::new();
    for ((pair, sex, year), total) in deaths {
        let fraction = estimated_fraction(Country::Swe, pair);
        facts.entry(pair).or_default().push(FactRow {
            country: Country::Swe,
            sex,
            age: AgeGroup::All,
            year,
            total_deaths: total,
            attributable_deaths: total * fraction,
        });
    }
    print_extracted("Sweden", &facts);
    facts
}

// =============================================================================
// SWITZERLAND - DIRECT ATTRIBUTION (GBD CSV PAIR)
// =============================================================================
// Switzerland ships as two IHME GBD exports: one with total disease deaths,
// one with risk-attributable deaths. Both files are required; a missing file
// aborts the Swiss contribution (not the run).

const CHE_ATTRIBUTABLE_CSV: &str = "IHME-GBD_2023_DATA-cea2d4bb-1.csv";
const CHE_TOTAL_CSV: &str = "IHME-GBD_2023_DATA-94d9786b-1.csv";
const CHE_YEARS: std::ops::RangeInclusive<i32> = 2013..=2023;

#[derive(Debug, Deserialize)]
struct GbdRow {
    measure_name: String,
    sex_name: String,
    age_name: String,
    cause_name: String,
    #[serde(default)]
    rei_name: Option<String>,
    metric_name: String,
    year: i32,
    #[serde(default)]
    val: Option<f64>,
}

fn swiss_risks(pair: RiskPair) -> &'static [&'static str] {
    match pair {
        RiskPair::SmokingLungCancer => &["Smoking"],
        RiskPair::BmiCardiovascular => &["High body-mass index"],
        RiskPair::PollutionRespiratory => &["Particulate matter pollution"],
        RiskPair::AlcoholCirrhosis => &["High alcohol use"],
    }
}

fn swiss_causes(pair: RiskPair) -> &'static [&'static str] {
    match pair {
        RiskPair::SmokingLungCancer => &["Tracheal, bronchus, and lung cancer"],
        RiskPair::BmiCardiovascular => &["Cardiovascular diseases", "Ischemic heart disease"],
        RiskPair::PollutionRespiratory => &[
            "Chronic respiratory diseases",
            "Chronic obstructive pulmonary disease",
        ],
        RiskPair::AlcoholCirrhosis => &["Cirrhosis and other chronic liver diseases"],
    }
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
                    eprintln!("    ! {}: skipping line {}: {}", file, line + 2, e);
                }
            }
        }
    }
    if bad > 3 {
        eprintln!("    ! {}: {} unparsable lines in total", file, bad);
    }
    rows
}

/// Deaths/Number rows in the year window, per-sex only, with a mappable age.
fn swiss_demographic(row: &GbdRow) -> Option<(Sex, AgeGroup)> {
    if row.measure_name != "Deaths" || row.metric_name != "Number" {
        return None;
    }
    if !CHE_YEARS.contains(&row.year) {
        return None;
    }
    Some((swiss_sex(&row.sex_name)?, swiss_age(&row.age_name)?))
}

fn combine_swiss(attributable: &[GbdRow], totals: &[GbdRow]) -> FactSet {
    let mut facts = FactSet::new();
    for pair in RiskPair::ALL {
        let risks = swiss_risks(pair);
        let causes = swiss_causes(pair);

        let mut attr_map: BTreeMap<(i32, Sex, AgeGroup), f64> = BTreeMap::new();
        for row in attributable {
            let Some((sex, age)) = swiss_demographic(row) else {
                continue;
            };
            let is_risk = row
                .rei_name
                .as_deref()
                .is_some_and(|r| risks.contains(&r));
            if !is_risk || !causes.contains(&row.cause_name.as_str()) {
                continue;
            }
            *attr_map.entry((row.year, sex, age)).or_insert(0.0) += row.val.unwrap_or(0.0);
        }

        let mut total_map: BTreeMap<(i32, Sex, AgeGroup), f64> = BTreeMap::new();
        for row in totals {
            let Some((sex, age)) = swiss_demographic(row) else {
                continue;
            };
            if !causes.contains(&row.cause_name.as_str()) {
                continue;
            }
            *total_map.entry((row.year, sex, age)).or_insert(0.0) += row.val.unwrap_or(0.0);
        }

        // Join on the attributable keys; a missing total defaults to zero.
        for ((year, sex, age), attr) in attr_map {
            let total = total_map.get(&(year, sex, age)).copied().unwrap_or(0.0);
            facts.entry(pair).or_default().push(FactRow {
                country: Country::Che,
                sex,
                age,
                year,
                total_deaths: total,
                attributable_deaths: attr,
            });
        }
    }
    facts
}

async fn extract_switzerland(csv_dir: &Path) -> Result<FactSet> {
    let attr_path = csv_dir.join(CHE_ATTRIBUTABLE_CSV);
    let total_path = csv_dir.join(CHE_TOTAL_CSV);

    let attr_content = fs::read_to_string(&attr_path)
        .await
        .with_context(|| format!("Swiss CSV missing: {}", attr_path.display()))?;
    let total_content = fs::read_to_string(&total_path)
        .await
        .with_context(|| format!("Swiss CSV missing: {}", total_path.display()))?;

    let attributable = parse_gbd_rows(&attr_content, CHE_ATTRIBUTABLE_CSV);
    let totals = parse_gbd_rows(&total_content, CHE_TOTAL_CSV);
    println!(
        "    Parsed {} attributable rows, {} total rows",
        attributable.len(),
        totals.len()
    );

    let facts = combine_swiss(&attributable, &totals);
    print_extracted("Switzerland", &facts);
    Ok(facts)
}

fn print_extracted(source: &str, facts: &FactSet) {
    let counts: Vec<String> = RiskPair::ALL
        .iter()
        .map(|p| format!("{}={}", p.label(), facts.get(p).map_or(0, Vec::len)))
        .collect();
    println!("    Extracted {}: {}", source, counts.join(", "));
}

// =============================================================================
// DIMENSION RESOLVER
// =============================================================================
// The canonical dimensions are pre-seeded and tiny, so they load into maps
// once per run; resolution after that is pure. Absence is not an error -
// the loader decides what to do with an unresolved row.

struct DimensionResolver {
    countries: HashMap<String, i32>,
    sexes: HashMap<String, i32>,
    age_groups: HashMap<String, i32>,
    years: HashMap<i32, i32>,
}

#[derive(Debug, Clone, Copy)]
struct DimensionIds {
    country_id: i32,
    sex_id: i32,
    age_group_id: i32,
    year_id: i32,
}

impl DimensionResolver {
    async fn load(pool: &PgPool) -> Result<Self> {
        let countries = sqlx::query_as::<_, (String, i32)>(
            "SELECT country_code, country_id FROM dim_country",
        )
        .fetch_all(pool)
        .await?
        .into_iter()
        .collect();
        let sexes = sqlx::query_as::<_, (String, i32)>("SELECT sex_code, sex_id FROM dim_sex")
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect();
        let age_groups = sqlx::query_as::<_, (String, i32)>(
            "SELECT age_group_code, age_group_id FROM dim_age_group",
        )
        .fetch_all(pool)
        .await?
        .into_iter()
        .collect();
        let years = sqlx::query_as::<_, (i32, i32)>("SELECT year, year_id FROM dim_year")
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect();
        Ok(Self {
            countries,
            sexes,
            age_groups,
            years,
        })
    }

    fn resolve(&self, row: &FactRow) -> Option<DimensionIds> {
        Some(DimensionIds {
            country_id: *self.countries.get(row.country.code())?,
            sex_id: *self.sexes.get(row.sex.code())?,
            age_group_id: *self.age_groups.get(row.age.code())?,
            year_id: *self.years.get(&row.year)?,
        })
    }
}

// =============================================================================
// LOADER
// =============================================================================

struct LoadReport {
    inserted: usize,
    unresolved: usize,
}

/// Resolve every row; drop and count the ones with no canonical key, logging
/// only the first few for diagnostics.
fn resolve_batch(
    resolver: &DimensionResolver,
    rows: &[FactRow],
) -> (Vec<(DimensionIds, f64, f64)>, usize) {
    let mut resolved = Vec::with_capacity(rows.len());
    let mut unresolved = 0;
    for row in rows {
        match resolver.resolve(row) {
            Some(ids) => resolved.push((ids, row.total_deaths, row.attributable_deaths)),
            None => {
                unresolved += 1;
                if unresolved <= 3 {
                    println!(
                        "      FAILED to resolve: country={} sex={} age={} year={}",
                        row.country.code(),
                        row.sex.code(),
                        row.age.code(),
                        row.year
                    );
                }
            }
        }
    }
    (resolved, unresolved)
}

async fn load_fact_table(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    resolver: &DimensionResolver,
    pair: RiskPair,
    rows: &[FactRow],
) -> Result<LoadReport> {
    println!("    Resolving dimensions for {} rows...", rows.len());
    let (resolved, unresolved) = resolve_batch(resolver, rows);
    if unresolved > 0 {
        println!("      Total unresolved: {} rows", unresolved);
    }

    let insert_sql = format!(
        "INSERT INTO {} (country_id, sex_id, age_group_id, year_id, {}, attributable_deaths) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        pair.fact_table(),
        pair.total_column()
    );
    for (ids, total, attr) in &resolved {
        sqlx::query(&insert_sql)
            .bind(ids.country_id)
            .bind(ids.sex_id)
            .bind(ids.age_group_id)
            .bind(ids.year_id)
            .bind(total)
            .bind(attr)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("insert into {}", pair.fact_table()))?;
    }
    println!("    Inserted {} rows into {}", resolved.len(), pair.fact_table());
    Ok(LoadReport {
        inserted: resolved.len(),
        unresolved,
    })
}

// =============================================================================
// DRIVER
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Health Warehouse Extractor ===");
    println!("Dump dir: {}", args.dump_dir.display());
    println!("CSV dir:  {}", args.csv_dir.display());

    let mut all = FactSet::new();

    println!("\n[1/4] USA - direct risk→disease attribution");
    match fs::read_to_string(args.dump_dir.join("usa.sql")).await {
        Ok(sql) => merge_facts(&mut all, extract_usa(&sql)),
        Err(e) => eprintln!("  ! USA dump unreadable, source skipped: {}", e),
    }

    println!("\n[2/4] Germany - SDR rates with attributable fractions");
    match fs::read_to_string(args.dump_dir.join("germany.sql")).await {
        Ok(sql) => merge_facts(&mut all, extract_germany(&sql)),
        Err(e) => eprintln!("  ! Germany dump unreadable, source skipped: {}", e),
    }

    println!("\n[3/4] Sweden - registry counts with attributable fractions");
    match fs::read_to_string(args.dump_dir.join("sweden.sql")).await {
        Ok(sql) => merge_facts(&mut all, extract_sweden(&sql)),
        Err(e) => eprintln!("  ! Sweden dump unreadable, source skipped: {}", e),
    }

    println!("\n[4/4] Switzerland - GBD export pair");
    match extract_switzerland(&args.csv_dir).await {
        Ok(facts) => merge_facts(&mut all, facts),
        Err(e) => eprintln!("  ! Switzerland extraction aborted: {:#}", e),
    }

    let extracted: usize = all.values().map(Vec::len).sum();
    println!("\nExtracted {} fact rows across {} tables", extracted, RiskPair::ALL.len());

    if args.dry_run {
        println!("Dry run - nothing loaded");
        return Ok(());
    }

    println!("\nConnecting to {}:{}...", config.pg_host, config.pg_port);
    let pool = connect_with_retry(&config.database_url(), 10, Duration::from_secs(5)).await?;
    let resolver = DimensionResolver::load(&pool)
        .await
        .context("loading canonical dimensions")?;

    // One transaction per run: either all four fact tables land, or none do.
    let mut tx = pool.begin().await?;
    let mut inserted = 0;
    let mut unresolved = 0;
    let empty: Vec<FactRow> = Vec::new();
    for pair in RiskPair::ALL {
        println!("\n  {} → {}", pair.label(), pair.fact_table());
        let rows = all.get(&pair).unwrap_or(&empty);
        let report = load_fact_table(&mut tx, &resolver, pair, rows).await?;
        inserted += report.inserted;
        unresolved += report.unresolved;
    }
    tx.commit().await?;

    println!("\n=== Load Complete ===");
    println!("Inserted:   {}", inserted);
    println!("Unresolved: {}", unresolved);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // SQL DUMP PARSER
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_backtick_dialect() {
        let sql = "INSERT INTO `deaths` (a, b) VALUES (1, 'x'), (2, 'y');";
        let rows = parse_sql_inserts(sql, "deaths");
        assert_eq!(rows, vec![vec!["1", "x"], vec!["2", "y"]]);
    }

    #[test]
    fn test_parse_schema_qualified_dialect() {
        let sql = "INSERT INTO public.deaths VALUES (1, 'x');";
        let rows = parse_sql_inserts(sql, "deaths");
        assert_eq!(rows, vec![vec!["1", "x"]]);
    }

    #[test]
    fn test_parse_bare_table_name() {
        let sql = "insert into deaths values (3, 'z');";
        let rows = parse_sql_inserts(sql, "deaths");
        assert_eq!(rows, vec![vec!["3", "z"]]);
    }

    #[test]
    fn test_parse_ignores_other_tables() {
        let sql = "INSERT INTO `other` VALUES (9, 'q'); INSERT INTO `deaths` VALUES (1, 'x');";
        let rows = parse_sql_inserts(sql, "deaths");
        assert_eq!(rows, vec![vec!["1", "x"]]);
    }

    #[test]
    fn test_parse_comma_inside_quotes() {
        let sql = "INSERT INTO `t` VALUES (1, 'Tracheal, bronchus, and lung cancer', 5);";
        let rows = parse_sql_inserts(sql, "t");
        assert_eq!(
            rows,
            vec![vec!["1", "Tracheal, bronchus, and lung cancer", "5"]]
        );
    }

    #[test]
    fn test_parse_escaped_quote_does_not_close_string() {
        let sql = r"INSERT INTO `t` VALUES (1, 'Crohn\'s disease, chronic', 2);";
        let rows = parse_sql_inserts(sql, "t");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 3);
        assert_eq!(rows[0][1], r"Crohn\'s disease, chronic");
    }

    #[test]
    fn test_parse_multiple_statements_same_table() {
        let sql = "INSERT INTO `t` VALUES (1, 'a');\nINSERT INTO `t` VALUES (2, 'b');";
        let rows = parse_sql_inserts(sql, "t");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_parse_stops_at_statement_terminator() {
        // The tuple after the semicolon belongs to a different table.
        let sql = "INSERT INTO `t` VALUES (1, 'a'); INSERT INTO `u` VALUES (2, 'b');";
        let rows = parse_sql_inserts(sql, "t");
        assert_eq!(rows, vec![vec!["1", "a"]]);
    }

    #[test]
    fn test_parse_null_and_numeric_fields() {
        let sql = "INSERT INTO `t` VALUES (1, NULL, 3.5);";
        let rows = parse_sql_inserts(sql, "t");
        assert_eq!(rows, vec![vec!["1", "NULL", "3.5"]]);
        assert_eq!(field_num(&rows[0][1]), 0.0);
        assert_eq!(field_num(&rows[0][2]), 3.5);
    }

    #[test]
    fn test_short_rows_counted_as_defects() {
        const SCHEMA: TableSchema = TableSchema {
            table: "t",
            columns: &["a", "b", "c"],
        };
        let sql = "INSERT INTO `t` VALUES (1, 2, 3), (4, 5);";
        let table = read_dump_table(sql, &SCHEMA);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.short_rows, 1);
    }

    #[test]
    fn test_schema_field_access_by_name() {
        const SCHEMA: TableSchema = TableSchema {
            table: "t",
            columns: &["id", "value"],
        };
        let row = vec!["7".to_string(), "9.5".to_string()];
        assert_eq!(SCHEMA.field(&row, "id"), "7");
        assert_eq!(SCHEMA.field(&row, "value"), "9.5");
        assert_eq!(SCHEMA.field(&row, "missing"), "");
    }

    // -------------------------------------------------------------------------
    // CODE MAPPING TABLES - pure, idempotent, unmapped codes stay unmapped
    // -------------------------------------------------------------------------

    #[test]
    fn test_numeric_sex_map() {
        assert_eq!(numeric_sex("1"), Some(Sex::Male));
        assert_eq!(numeric_sex("2"), Some(Sex::Female));
        assert_eq!(numeric_sex("3"), Some(Sex::Both));
        assert_eq!(numeric_sex("4"), None);
        // Same input, same output.
        assert_eq!(numeric_sex("1"), numeric_sex("1"));
    }

    #[test]
    fn test_text_sex_female_before_male() {
        assert_eq!(text_sex("Male"), Sex::Male);
        assert_eq!(text_sex("Female"), Sex::Female);
        assert_eq!(text_sex("FEMALE"), Sex::Female);
        assert_eq!(text_sex("All"), Sex::Both);
    }

    #[test]
    fn test_five_bucket_age_map() {
        assert_eq!(five_bucket_age("1"), Some(AgeGroup::Child));
        assert_eq!(five_bucket_age("5"), Some(AgeGroup::All));
        assert_eq!(five_bucket_age("6"), None);
    }

    #[test]
    fn test_usa_age_codes_collapse_to_four_buckets() {
        assert_eq!(usa_age("1"), Some(AgeGroup::Child));
        assert_eq!(usa_age("23"), Some(AgeGroup::Child));
        assert_eq!(usa_age("14"), Some(AgeGroup::YoungAdult));
        assert_eq!(usa_age("25"), Some(AgeGroup::MiddleAge));
        assert_eq!(usa_age("21"), Some(AgeGroup::Senior));
        assert_eq!(usa_age("99"), None);
    }

    #[test]
    fn test_range_age_buckets_by_lower_bound() {
        assert_eq!(range_age("5-9 years"), Some(AgeGroup::Child));
        assert_eq!(range_age("15-19 years"), Some(AgeGroup::YoungAdult));
        assert_eq!(range_age("45-49 years"), Some(AgeGroup::YoungAdult));
        assert_eq!(range_age("50-54 years"), Some(AgeGroup::MiddleAge));
        assert_eq!(range_age("70-74 years"), Some(AgeGroup::Senior));
        assert_eq!(range_age("all ages"), None);
        assert_eq!(range_age(""), None);
    }

    #[test]
    fn test_swiss_age_names() {
        assert_eq!(swiss_age("<5 years"), Some(AgeGroup::Child));
        assert_eq!(swiss_age("25-29 years"), Some(AgeGroup::YoungAdult));
        assert_eq!(swiss_age("50-69 years"), Some(AgeGroup::MiddleAge));
        assert_eq!(swiss_age("80+ years"), Some(AgeGroup::Senior));
        assert_eq!(swiss_age("All ages"), Some(AgeGroup::All));
        assert_eq!(swiss_age("Age-standardized"), None);
    }

    // -------------------------------------------------------------------------
    // ATTRIBUTABLE FRACTIONS
    // -------------------------------------------------------------------------

    #[test]
    fn test_documented_fractions() {
        assert_eq!(
            estimated_fraction(Country::Deu, RiskPair::SmokingLungCancer),
            0.80
        );
        assert_eq!(
            estimated_fraction(Country::Swe, RiskPair::SmokingLungCancer),
            0.75
        );
        assert_eq!(
            estimated_fraction(Country::Deu, RiskPair::BmiCardiovascular),
            0.15
        );
        assert_eq!(
            estimated_fraction(Country::Swe, RiskPair::PollutionRespiratory),
            0.20
        );
        assert_eq!(
            estimated_fraction(Country::Deu, RiskPair::AlcoholCirrhosis),
            0.48
        );
        assert_eq!(
            estimated_fraction(Country::Swe, RiskPair::AlcoholCirrhosis),
            0.55
        );
    }

    #[test]
    fn test_attributable_is_total_times_fraction() {
        // 1,000,000 people at an SDR of 100 per 100k = 1000 total deaths;
        // smoking fraction 0.80 → 800 attributable.
        let sql = "\
            INSERT INTO population VALUES ('DEU', 'Male', '30-34 years', '2020', '1000000');\n\
            INSERT INTO dm_lung_cancer_sdr VALUES ('DEU', 'Male', '2020', '100');";
        let facts = extract_germany(sql);
        let rows = &facts[&RiskPair::SmokingLungCancer];
        assert_eq!(rows.len(), 1);
        assert!((rows[0].total_deaths - 1000.0).abs() < 1e-9);
        assert!((rows[0].attributable_deaths - 800.0).abs() < 1e-9);
        assert_eq!(rows[0].age, AgeGroup::All);
    }

    // -------------------------------------------------------------------------
    // AGGREGATION
    // -------------------------------------------------------------------------

    fn usa_sql(rows: &[&str]) -> String {
        // fact_disease totals give every attributable key a total of 100.
        let mut sql = String::from(
            "INSERT INTO `fact_disease` VALUES \
             (1, 1, 1, 12, 426, 1, 2020, 100, 0, 0, 'n');\n",
        );
        sql.push_str("INSERT INTO `fact_disease_risk` VALUES ");
        sql.push_str(&rows.join(", "));
        sql.push(';');
        sql
    }

    #[test]
    fn test_duplicate_keys_are_summed() {
        // Two rows for the same (sex=M, age=15-49, year=2020) key, values
        // 10 and 15, aggregate into a single row with value 25.
        let sql = usa_sql(&[
            "(1, 1, 1, 12, 426, 99, 1, 2020, 10, 0, 0, 'n')",
            "(2, 1, 1, 12, 426, 99, 1, 2020, 15, 0, 0, 'n')",
        ]);
        let facts = extract_usa(&sql);
        let rows = &facts[&RiskPair::SmokingLungCancer];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attributable_deaths, 25.0);
        assert_eq!(rows[0].total_deaths, 100.0);
        assert_eq!(rows[0].sex, Sex::Male);
        assert_eq!(rows[0].age, AgeGroup::YoungAdult);
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let forward = usa_sql(&[
            "(1, 1, 1, 12, 426, 99, 1, 2020, 10, 0, 0, 'n')",
            "(2, 1, 1, 12, 426, 99, 1, 2020, 15, 0, 0, 'n')",
            "(3, 1, 2, 12, 426, 99, 1, 2020, 7, 0, 0, 'n')",
        ]);
        let reversed = usa_sql(&[
            "(3, 1, 2, 12, 426, 99, 1, 2020, 7, 0, 0, 'n')",
            "(2, 1, 1, 12, 426, 99, 1, 2020, 15, 0, 0, 'n')",
            "(1, 1, 1, 12, 426, 99, 1, 2020, 10, 0, 0, 'n')",
        ]);
        assert_eq!(extract_usa(&forward), extract_usa(&reversed));
    }

    #[test]
    fn test_unmapped_age_code_drops_row() {
        // age_id 99 is not in the USA vocabulary; the row is excluded and
        // the output count reflects only the mappable row.
        let sql = usa_sql(&[
            "(1, 1, 1, 12, 426, 99, 1, 2020, 10, 0, 0, 'n')",
            "(2, 1, 1, 99, 426, 99, 1, 2020, 50, 0, 0, 'n')",
        ]);
        let facts = extract_usa(&sql);
        let rows = &facts[&RiskPair::SmokingLungCancer];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attributable_deaths, 10.0);
    }

    #[test]
    fn test_usa_year_window_and_metric_filter() {
        let sql = usa_sql(&[
            "(1, 1, 1, 12, 426, 99, 1, 2013, 10, 0, 0, 'n')", // before window
            "(2, 1, 1, 12, 426, 99, 2, 2020, 10, 0, 0, 'n')", // rate metric
            "(3, 2, 1, 12, 426, 99, 1, 2020, 10, 0, 0, 'n')", // not deaths
        ]);
        let facts = extract_usa(&sql);
        assert!(facts.get(&RiskPair::SmokingLungCancer).is_none());
    }

    #[test]
    fn test_sweden_excludes_both_sexes_bucket() {
        let sql = "\
            INSERT INTO rok VALUES (5, 2020);\n\
            INSERT INTO disease_data VALUES (1, 5, 12, 1, 1, 900, 300);\n\
            INSERT INTO disease_data VALUES (2, 5, 12, 1, 3, 1800, 600);";
        let facts = extract_sweden(sql);
        let rows = &facts[&RiskPair::SmokingLungCancer];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sex, Sex::Male);
        assert_eq!(rows[0].total_deaths, 300.0);
        assert!((rows[0].attributable_deaths - 225.0).abs() < 1e-9);
    }

    // -------------------------------------------------------------------------
    // SWISS COMBINATION
    // -------------------------------------------------------------------------

    fn gbd_row(
        sex: &str,
        age: &str,
        cause: &str,
        rei: Option<&str>,
        year: i32,
        val: f64,
    ) -> GbdRow {
        GbdRow {
            measure_name: "Deaths".to_string(),
            sex_name: sex.to_string(),
            age_name: age.to_string(),
            cause_name: cause.to_string(),
            rei_name: rei.map(str::to_string),
            metric_name: "Number".to_string(),
            year,
            val: Some(val),
        }
    }

    #[test]
    fn test_swiss_join_on_attributable_keys() {
        let cause = "Tracheal, bronchus, and lung cancer";
        let attributable = vec![gbd_row("Male", "50-69 years", cause, Some("Smoking"), 2020, 40.0)];
        let totals = vec![
            gbd_row("Male", "50-69 years", cause, None, 2020, 90.0),
            // Total-only key: no attributable counterpart, so no output row.
            gbd_row("Female", "50-69 years", cause, None, 2020, 80.0),
        ];
        let facts = combine_swiss(&attributable, &totals);
        let rows = &facts[&RiskPair::SmokingLungCancer];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_deaths, 90.0);
        assert_eq!(rows[0].attributable_deaths, 40.0);
    }

    #[test]
    fn test_swiss_missing_total_defaults_to_zero() {
        let cause = "Cirrhosis and other chronic liver diseases";
        let attributable =
            vec![gbd_row("Female", "70+ years", cause, Some("High alcohol use"), 2019, 12.0)];
        let facts = combine_swiss(&attributable, &[]);
        let rows = &facts[&RiskPair::AlcoholCirrhosis];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_deaths, 0.0);
        assert_eq!(rows[0].attributable_deaths, 12.0);
    }

    #[test]
    fn test_swiss_filters_both_sexes_and_rates() {
        let cause = "Tracheal, bronchus, and lung cancer";
        let mut both = gbd_row("Both", "50-69 years", cause, Some("Smoking"), 2020, 99.0);
        both.sex_name = "Both".to_string();
        let mut rate = gbd_row("Male", "50-69 years", cause, Some("Smoking"), 2020, 99.0);
        rate.metric_name = "Rate".to_string();
        let facts = combine_swiss(&[both, rate], &[]);
        assert!(facts.get(&RiskPair::SmokingLungCancer).is_none());
    }

    #[test]
    fn test_parse_gbd_rows_tolerates_bad_lines() {
        let csv = "measure_name,sex_name,age_name,cause_name,rei_name,metric_name,year,val\n\
                   Deaths,Male,50-69 years,Lung cancer,Smoking,Number,2020,10.5\n\
                   Deaths,Male,50-69 years,Lung cancer,Smoking,Number,not-a-year,3\n";
        let rows = parse_gbd_rows(csv, "test.csv");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].val, Some(10.5));
    }

    // -------------------------------------------------------------------------
    // DIMENSION RESOLUTION
    // -------------------------------------------------------------------------

    fn seeded_resolver() -> DimensionResolver {
        DimensionResolver {
            countries: [("USA".to_string(), 1), ("DEU".to_string(), 2)].into(),
            sexes: [("M".to_string(), 1), ("F".to_string(), 2)].into(),
            age_groups: [("15-49".to_string(), 2), ("ALL".to_string(), 5)].into(),
            years: [(2020, 8)].into(),
        }
    }

    fn fact(country: Country, year: i32) -> FactRow {
        FactRow {
            country,
            sex: Sex::Male,
            age: AgeGroup::YoungAdult,
            year,
            total_deaths: 25.0,
            attributable_deaths: 20.0,
        }
    }

    #[test]
    fn test_resolution_absence_is_not_fatal() {
        let resolver = seeded_resolver();
        // CHE is not seeded: the row is dropped and counted, nothing panics.
        let (resolved, unresolved) = resolve_batch(&resolver, &[fact(Country::Che, 2020)]);
        assert!(resolved.is_empty());
        assert_eq!(unresolved, 1);
    }

    #[test]
    fn test_resolved_row_carries_measures() {
        let resolver = seeded_resolver();
        let (resolved, unresolved) = resolve_batch(
            &resolver,
            &[fact(Country::Usa, 2020), fact(Country::Usa, 1999)],
        );
        assert_eq!(unresolved, 1);
        assert_eq!(resolved.len(), 1);
        let (ids, total, attr) = resolved[0];
        assert_eq!(ids.country_id, 1);
        assert_eq!(ids.sex_id, 1);
        assert_eq!(ids.age_group_id, 2);
        assert_eq!(ids.year_id, 8);
        assert_eq!(total, 25.0);
        assert_eq!(attr, 20.0);
    }
}
