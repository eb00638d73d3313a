//! Input adapters: the property status workbook and the model-home ICS schedule.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use regex::Regex;
use regsync_core::{CalendarEvent, PropertyRecord, PropertyStatus, StaffMember, StaffResolution};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "regsync-adapters";

/// Header names of the status report workbook.
pub mod columns {
    pub const STNUM: &str = "Stnum";
    pub const STNAME: &str = "Stname";
    pub const SQFT: &str = "Sq. Ft.";
    pub const PLAN: &str = "Plan";
    pub const SUBDIVISION: &str = "Subdivision";
    pub const LOT: &str = "Lot";
    pub const BLOCK: &str = "Block";
    pub const FOREMAN_STAGE: &str = "Foreman Stage";
    pub const COMPLETION: &str = "Stage Completion Percentage";
    pub const STATUS: &str = "Sold/Available";
    pub const EDWARDS_CO: &str = "Edwards Co.";
    pub const SALE_PRICE: &str = "SP";
    pub const FOREMAN: &str = "Foreman";
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("opening workbook {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: calamine::Error,
    },
    #[error("workbook {0} has no sheets")]
    NoSheets(String),
    #[error("reading sheet {sheet}: {source}")]
    Sheet {
        sheet: String,
        #[source]
        source: calamine::Error,
    },
    #[error("missing required column {0:?}")]
    MissingColumn(&'static str),
}

/// Read every property row from the first sheet of `path`.
pub fn read_property_workbook(path: impl AsRef<Path>) -> Result<Vec<PropertyRecord>, SheetError> {
    let path = path.as_ref();
    let path_text = path.display().to_string();
    let mut workbook = open_workbook_auto(path).map_err(|source| SheetError::Open {
        path: path_text.clone(),
        source,
    })?;

    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| SheetError::NoSheets(path_text.clone()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|source| SheetError::Sheet {
            sheet: sheet.clone(),
            source,
        })?;

    let records = records_from_rows(range.rows())?;
    info!(path = %path_text, sheet = %sheet, records = records.len(), "read property workbook");
    Ok(records)
}

struct ColumnIndex {
    stnum: usize,
    stname: usize,
    sqft: Option<usize>,
    plan: Option<usize>,
    subdivision: Option<usize>,
    lot: Option<usize>,
    block: Option<usize>,
    foreman_stage: Option<usize>,
    completion: Option<usize>,
    status: Option<usize>,
    edwards_co: Option<usize>,
    sale_price: Option<usize>,
    foreman: Option<usize>,
}

impl ColumnIndex {
    fn from_header(header: &[Data]) -> Result<Self, SheetError> {
        let by_name: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .filter_map(|(idx, cell)| cell_text(cell).map(|name| (name, idx)))
            .collect();
        let find = |name: &str| by_name.get(name).copied();

        Ok(Self {
            stnum: find(columns::STNUM).ok_or(SheetError::MissingColumn(columns::STNUM))?,
            stname: find(columns::STNAME).ok_or(SheetError::MissingColumn(columns::STNAME))?,
            sqft: find(columns::SQFT),
            plan: find(columns::PLAN),
            subdivision: find(columns::SUBDIVISION),
            lot: find(columns::LOT),
            block: find(columns::BLOCK),
            foreman_stage: find(columns::FOREMAN_STAGE),
            completion: find(columns::COMPLETION),
            status: find(columns::STATUS),
            edwards_co: find(columns::EDWARDS_CO),
            sale_price: find(columns::SALE_PRICE),
            foreman: find(columns::FOREMAN),
        })
    }
}

/// Normalize sheet rows into records. The first row is the header.
pub fn records_from_rows<'a>(
    mut rows: impl Iterator<Item = &'a [Data]>,
) -> Result<Vec<PropertyRecord>, SheetError> {
    let header = rows.next().ok_or(SheetError::MissingColumn(columns::STNUM))?;
    let cols = ColumnIndex::from_header(header)?;

    let mut records = Vec::new();
    for (idx, row) in rows.enumerate() {
        let row_num = idx + 2;
        let stnum = text_at(row, Some(cols.stnum));
        let stname = text_at(row, Some(cols.stname));
        let address = match (stnum, stname) {
            (None, None) => {
                debug!(row = row_num, "skipping row without street number or name");
                continue;
            }
            (Some(number), Some(name)) => format!("{number} {name}"),
            (Some(part), None) | (None, Some(part)) => part,
        };

        let status = text_at(row, cols.status).and_then(|raw| {
            let parsed = PropertyStatus::parse(&raw);
            if parsed.is_none() {
                debug!(row = row_num, value = %raw, "dropping unrecognized status");
            }
            parsed
        });

        records.push(PropertyRecord {
            address,
            sqft: number_at(row, cols.sqft).map(|v| v.trunc() as i64),
            plan: text_at(row, cols.plan),
            subdivision: text_at(row, cols.subdivision),
            lot: text_at(row, cols.lot),
            block: text_at(row, cols.block),
            foreman_stage: text_at(row, cols.foreman_stage),
            completion_pct: cols
                .completion
                .and_then(|col| row.get(col))
                .and_then(parse_percentage),
            status,
            edwards_co: text_at(row, cols.edwards_co),
            sale_price: number_at(row, cols.sale_price),
            foreman: text_at(row, cols.foreman),
        });
    }

    Ok(records)
}

fn text_at(row: &[Data], col: Option<usize>) -> Option<String> {
    col.and_then(|c| row.get(c)).and_then(cell_text)
}

fn number_at(row: &[Data], col: Option<usize>) -> Option<f64> {
    col.and_then(|c| row.get(c)).and_then(cell_number)
}

/// Cell as trimmed text; whole floats render without a fraction (`12.0` -> `"12"`).
pub fn cell_text(cell: &Data) -> Option<String> {
    let text = match cell {
        Data::Empty | Data::Error(_) => return None,
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if !f.is_finite() => return None,
        Data::Float(f) => {
            if f.fract() == 0.0 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Numeric cell value; text cells are parsed after dropping `$`, `,` and spaces.
pub fn cell_number(cell: &Data) -> Option<f64> {
    match cell {
        Data::Int(i) => Some(*i as f64),
        Data::Float(f) if f.is_finite() => Some(*f),
        Data::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
                .collect();
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// Stage completion as a whole percent in 0..=100.
///
/// A trailing `%` marks a literal percent (`"85%"` -> 85, `"1%"` -> 1).
/// Bare numbers follow one rule whether stored as integer, float or text:
/// values at or below 1 are spreadsheet fractions (`0.85` -> 85, `1` -> 100),
/// larger values are already percents (`"40"` -> 40).
pub fn parse_percentage(cell: &Data) -> Option<i64> {
    let value = match cell {
        Data::String(s) => {
            let trimmed = s.trim();
            match trimmed.strip_suffix('%') {
                Some(literal) => literal.trim().parse::<f64>().ok()?,
                None => fraction_or_percent(trimmed.parse::<f64>().ok()?),
            }
        }
        Data::Int(i) => fraction_or_percent(*i as f64),
        Data::Float(f) => fraction_or_percent(*f),
        _ => return None,
    };
    if !value.is_finite() {
        return None;
    }

    let pct = value.round();
    if (0.0..=100.0).contains(&pct) {
        Some(pct as i64)
    } else {
        debug!(value, "completion percentage out of range");
        None
    }
}

fn fraction_or_percent(value: f64) -> f64 {
    if value <= 1.0 {
        value * 100.0
    } else {
        value
    }
}

/// Known schedule aliases -> team members. Aliases match exactly.
pub static STAFF_DIRECTORY: &[(&str, StaffMember)] = &[
    ("C. Gutierrez", staff("Carina Gutierrez", "2bb746b9-e0e8-81e0-88d8-e6460cb03050")),
    ("Arian Wallace", staff("Arian Wallace", "2bb746b9-e0e8-81f4-8ca6-f9570d62d80d")),
    ("Derek Almeida", staff("Derek Almeida", "2bb746b9-e0e8-815f-9535-ff58e90acb70")),
    ("Mark Morales", staff("Mark Morales", "2bb746b9-e0e8-816a-88b1-e7cde5c9e83b")),
    ("Cassandra V.", staff("Cassandra Vasquez", "2bb746b9-e0e8-81c1-bd9e-d31e8e9f4060")),
    ("M. Beltran", staff("Michelle Beltran", "2bb746b9-e0e8-8199-b79c-e1369cac5e24")),
    ("Kaleb Ibarra", staff("Kaleb Ibarra", "2bb746b9-e0e8-812b-ae17-f5dc495c5467")),
    ("Ibarra", staff("Kaleb Ibarra", "2bb746b9-e0e8-812b-ae17-f5dc495c5467")),
    ("Susana Terrazas", staff("Susana Terrazas", "2bb746b9-e0e8-8157-ae59-d6d34de87518")),
    ("Terrazas", staff("Susana Terrazas", "2bb746b9-e0e8-8157-ae59-d6d34de87518")),
    ("Angel Alba", staff("Angel Alba", "2bb746b9-e0e8-81c9-8856-cdf43681afac")),
    ("Alba", staff("Angel Alba", "2bb746b9-e0e8-81c9-8856-cdf43681afac")),
    ("Angel Almeida", staff("Angel Almeida", "2bb746b9-e0e8-81ed-a603-fa990cb85a6b")),
    ("Ashley Martin", staff("Ashley Martin", "2bb746b9-e0e8-819e-bbe2-de3f51cfba47")),
    ("Martin", staff("Ashley Martin", "2bb746b9-e0e8-819e-bbe2-de3f51cfba47")),
    ("D. Romero", staff("Diana Romero", "2bb746b9-e0e8-81dd-98d0-ca8224c84b3e")),
    ("Juan Pablo", staff("Juan Amaya", "2bb746b9-e0e8-8173-bbc5-fc8814fcf386")),
    ("Elsa Martinez", staff("Elsa Martinez", "2bb746b9-e0e8-81c1-9b05-cf1daf07a3d1")),
    ("Martinez", staff("Elsa Martinez", "2bb746b9-e0e8-81c1-9b05-cf1daf07a3d1")),
    ("Valerie Gomez", staff("Valerie Gomez", "2bb746b9-e0e8-8183-a0de-fa93c6062cdd")),
    ("Gomez", staff("Valerie Gomez", "2bb746b9-e0e8-8183-a0de-fa93c6062cdd")),
    ("D. Caballero", staff("Diana Caballero", "2bb746b9-e0e8-81a2-ab4f-f97ef81a97c3")),
    ("Vada Garcia", staff("Vada Garcia", "2bb746b9-e0e8-8195-a92f-f6e80de6c6d6")),
    ("Garcia", staff("Vada Garcia", "2bb746b9-e0e8-8195-a92f-f6e80de6c6d6")),
    ("Alex Morales", staff("Alex Morales", "2bb746b9-e0e8-8160-8f9d-c539efd5bd9e")),
    ("M. Dominguez", staff("Marisol Dominguez", "2bb746b9-e0e8-8174-bf16-c83fb8c77e61")),
    ("Priscilla Ramos", staff("Priscilla Ramos", "2bb746b9-e0e8-81e8-a36b-e978548bcedf")),
    ("Ramos", staff("Priscilla Ramos", "2bb746b9-e0e8-81e8-a36b-e978548bcedf")),
    ("Audrey G.", staff("Audrey Gutierrez", "2bb746b9-e0e8-8102-a1c4-d481d8c8b4a9")),
    ("Karla Santillan", staff("Karla Santillan", "2bb746b9-e0e8-81c9-983e-ea42f1e67864")),
    ("Santillan", staff("Karla Santillan", "2bb746b9-e0e8-81c9-983e-ea42f1e67864")),
];

const fn staff(full_name: &'static str, member_id: &'static str) -> StaffMember {
    StaffMember {
        full_name,
        member_id,
    }
}

pub fn resolve_staff(name: &str) -> StaffResolution {
    STAFF_DIRECTORY
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, member)| StaffResolution::Mapped(*member))
        .unwrap_or(StaffResolution::Unmapped)
}

static EVENT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)BEGIN:VEVENT.*?END:VEVENT").expect("valid regex"));
static DATE_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DTSTART;VALUE=DATE:(\d{8})").expect("valid regex"));
static LOCATION_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"LOCATION:(.+)").expect("valid regex"));
static SUMMARY_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SUMMARY:(.+)").expect("valid regex"));

pub fn read_ics_file(path: impl AsRef<Path>) -> Result<Vec<CalendarEvent>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let events = parse_ics(&content);
    info!(path = %path.display(), events = events.len(), "parsed schedule");
    Ok(events)
}

/// Extract all-day events of the form `SUMMARY:<address> - <staff> [& <staff>]`.
/// Blocks missing a date, location, or the ` - ` separator are skipped.
pub fn parse_ics(content: &str) -> Vec<CalendarEvent> {
    let unfolded = unfold_lines(content);
    EVENT_BLOCK
        .find_iter(&unfolded)
        .filter_map(|block| parse_event_block(block.as_str()))
        .collect()
}

fn parse_event_block(block: &str) -> Option<CalendarEvent> {
    let raw_date = DATE_FIELD.captures(block)?.get(1)?.as_str();
    let Ok(date) = NaiveDate::parse_from_str(raw_date, "%Y%m%d") else {
        debug!(raw_date, "skipping event with invalid date");
        return None;
    };

    let location = unescape_text(LOCATION_FIELD.captures(block)?.get(1)?.as_str().trim());
    let summary = unescape_text(SUMMARY_FIELD.captures(block)?.get(1)?.as_str().trim());
    let Some((_, staff_part)) = summary.split_once(" - ") else {
        debug!(%summary, "skipping event without staff separator");
        return None;
    };

    let staff = staff_part
        .split(" & ")
        .map(|name| name.trim().to_string())
        .collect();

    Some(CalendarEvent {
        date,
        location,
        staff,
    })
}

/// Join RFC 5545 folded continuation lines.
fn unfold_lines(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .replace("\n ", "")
        .replace("\n\t", "")
}

fn unescape_text(value: &str) -> String {
    value
        .replace("\\,", ",")
        .replace("\\;", ";")
        .replace("\\n", " ")
        .replace("\\N", " ")
        .replace("\\\\", "\\")
}
