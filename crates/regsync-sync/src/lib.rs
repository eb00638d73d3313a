//! Property sync orchestration: record mapping, address upsert, hand-off
//! files, and the schedule report.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use regsync_adapters::{read_property_workbook, resolve_staff};
use regsync_core::{normalize_address, CalendarEvent, PropertyRecord, StaffResolution};
use regsync_storage::{
    read_handoff_file, write_handoff_file, DatabaseSchema, HandoffEntry, NotionClient,
    NotionClientConfig, NotionError, PageStore, PropertyMap, PropertyValue, RemotePage,
    TokenBucketConfig, WriteOutcome, DEFAULT_API_BASE,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "regsync-sync";

pub const DEFAULT_DATABASE_ID: &str = "2bb746b9-e0e8-8163-9afe-cf0c567c2586";

/// Remote property names written by the mapper.
pub mod property_names {
    pub const SQFT: &str = "SqFt";
    pub const FLOORPLAN: &str = "Floorplan";
    pub const SUBDIVISION: &str = "Subdivision";
    pub const LOT: &str = "Lot";
    pub const BLOCK: &str = "Block";
    pub const STAGE: &str = "Stage";
    pub const COMPLETION: &str = "Stage Completion %";
    pub const STATUS: &str = "Status";
    pub const EDWARDS_CO: &str = "Edwards Co.";
    pub const SALES_PRICE: &str = "Sales Price";
    pub const FOREMAN: &str = "Foreman";
}

/// Every mapped property with the remote type it is written as.
pub const MAPPED_PROPERTIES: &[(&str, &str)] = &[
    (property_names::SQFT, "number"),
    (property_names::FLOORPLAN, "rich_text"),
    (property_names::SUBDIVISION, "select"),
    (property_names::LOT, "rich_text"),
    (property_names::BLOCK, "rich_text"),
    (property_names::STAGE, "rich_text"),
    (property_names::COMPLETION, "number"),
    (property_names::STATUS, "select"),
    (property_names::EDWARDS_CO, "rich_text"),
    (property_names::SALES_PRICE, "number"),
    (property_names::FOREMAN, "rich_text"),
];

#[derive(Clone)]
pub struct SyncConfig {
    pub api_key: String,
    pub database_id: String,
    pub api_base: String,
    pub title_property: String,
    pub request_delay: Duration,
    pub batch_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub rate_limit_per_sec: Option<u32>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; fails when `NOTION_API_KEY` is
    /// unset or blank.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("NOTION_API_KEY")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let Some(api_key) = api_key else {
            bail!("NOTION_API_KEY environment variable not set");
        };

        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Ok(Self {
            api_key,
            database_id: lookup("NOTION_DATABASE_ID")
                .unwrap_or_else(|| DEFAULT_DATABASE_ID.to_string()),
            api_base: lookup("NOTION_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            title_property: lookup("REGSYNC_TITLE_PROPERTY")
                .unwrap_or_else(|| "Address".to_string()),
            request_delay: Duration::from_millis(parsed("REGSYNC_REQUEST_DELAY_MS").unwrap_or(300)),
            batch_size: parsed("REGSYNC_BATCH_SIZE")
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(10),
            http_timeout_secs: parsed("REGSYNC_HTTP_TIMEOUT_SECS").unwrap_or(20),
            user_agent: lookup("REGSYNC_USER_AGENT").unwrap_or_else(|| "regsync/0.1".to_string()),
            rate_limit_per_sec: parsed("REGSYNC_RATE_LIMIT_PER_SEC")
                .filter(|v| *v > 0)
                .map(|v| v.min(u32::MAX as u64) as u32),
        })
    }

    pub fn notion_client_config(&self) -> NotionClientConfig {
        NotionClientConfig {
            api_key: self.api_key.clone(),
            api_base: self.api_base.clone(),
            title_property: self.title_property.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            request_delay: self.request_delay,
            token_bucket: self.rate_limit_per_sec.map(TokenBucketConfig::per_second),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            database_id: self.database_id.clone(),
            title_property: self.title_property.clone(),
            write_delay: self.request_delay,
            batch_size: self.batch_size,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Map a record onto remote properties. Absent fields produce no key, so an
/// update never clears a remote value the spreadsheet does not carry. The
/// title is not included.
pub fn build_notion_properties(record: &PropertyRecord) -> PropertyMap {
    use property_names as names;

    let mut props = PropertyMap::new();
    let mut put = |name: &str, value: PropertyValue| {
        props.insert(name.to_string(), value);
    };

    if let Some(sqft) = record.sqft {
        put(names::SQFT, PropertyValue::integer(sqft));
    }
    if let Some(plan) = non_empty(&record.plan) {
        put(names::FLOORPLAN, PropertyValue::rich_text(plan));
    }
    if let Some(subdivision) = non_empty(&record.subdivision) {
        put(names::SUBDIVISION, PropertyValue::select(subdivision));
    }
    if let Some(lot) = non_empty(&record.lot) {
        put(names::LOT, PropertyValue::rich_text(lot));
    }
    if let Some(block) = non_empty(&record.block) {
        put(names::BLOCK, PropertyValue::rich_text(block));
    }
    if let Some(stage) = non_empty(&record.foreman_stage) {
        put(names::STAGE, PropertyValue::rich_text(stage));
    }
    if let Some(pct) = record.completion_pct {
        put(names::COMPLETION, PropertyValue::integer(pct));
    }
    if let Some(status) = record.status {
        put(names::STATUS, PropertyValue::select(status.as_str()));
    }
    if let Some(edwards) = non_empty(&record.edwards_co) {
        put(names::EDWARDS_CO, PropertyValue::rich_text(edwards));
    }
    if let Some(price) = record.sale_price.and_then(PropertyValue::decimal) {
        put(names::SALES_PRICE, price);
    }
    if let Some(foreman) = non_empty(&record.foreman) {
        put(names::FOREMAN, PropertyValue::rich_text(foreman));
    }

    props
}

/// Normalized address -> page id. Later pages win on duplicate titles.
#[derive(Debug, Clone, Default)]
pub struct AddressLookup {
    by_address: HashMap<String, String>,
    collisions: usize,
}

impl AddressLookup {
    pub fn from_pages(pages: &[RemotePage]) -> Self {
        let mut by_address = HashMap::new();
        let mut collisions = 0;
        for page in pages {
            if let Some(title) = &page.title {
                let replaced = by_address.insert(normalize_address(title), page.id.clone());
                if let Some(replaced) = replaced {
                    collisions += 1;
                    warn!(
                        address = %title,
                        kept = %page.id,
                        replaced = %replaced,
                        "duplicate remote address; later page wins"
                    );
                }
            }
        }
        Self {
            by_address,
            collisions,
        }
    }

    /// Pages whose address was already taken by an earlier page.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn page_id(&self, address: &str) -> Option<&str> {
        self.by_address
            .get(&normalize_address(address))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

/// An address carried by more than one remote page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateAddress {
    pub address: String,
    pub page_ids: Vec<String>,
}

/// Group pages by normalized title and keep the groups with several pages.
/// Page ids stay in listing order; the address shown is the first title seen.
pub fn find_duplicate_addresses(pages: &[RemotePage]) -> Vec<DuplicateAddress> {
    let mut groups: BTreeMap<String, DuplicateAddress> = BTreeMap::new();
    for page in pages {
        let Some(title) = &page.title else { continue };
        groups
            .entry(normalize_address(title))
            .or_insert_with(|| DuplicateAddress {
                address: title.trim().to_string(),
                page_ids: Vec::new(),
            })
            .page_ids
            .push(page.id.clone());
    }
    groups
        .into_values()
        .filter(|group| group.page_ids.len() > 1)
        .collect()
}

/// One upsert to perform, keyed by the raw address.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub address: String,
    pub properties: PropertyMap,
}

pub fn planned_writes_from_records(records: &[PropertyRecord]) -> Vec<PlannedWrite> {
    records
        .iter()
        .map(|record| PlannedWrite {
            address: record.address.clone(),
            properties: build_notion_properties(record),
        })
        .collect()
}

/// Title values in a hand-off file are dropped; the title always comes from
/// the entry address.
pub fn planned_writes_from_handoff(entries: Vec<HandoffEntry>) -> Vec<PlannedWrite> {
    entries
        .into_iter()
        .map(|entry| {
            let mut properties = entry.notion_properties;
            properties.retain(|_, value| !matches!(value, PropertyValue::Title(_)));
            PlannedWrite {
                address: entry.address,
                properties,
            }
        })
        .collect()
}

pub fn handoff_entries(records: &[PropertyRecord]) -> Vec<HandoffEntry> {
    records
        .iter()
        .map(|record| HandoffEntry {
            address: record.address.clone(),
            notion_properties: build_notion_properties(record),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub updates: usize,
    pub creates: usize,
    pub skipped: usize,
}

impl SyncPlan {
    pub fn build(writes: &[PlannedWrite], lookup: &AddressLookup) -> Self {
        let mut plan = Self::default();
        for write in writes {
            if write.address.trim().is_empty() {
                plan.skipped += 1;
            } else if lookup.page_id(&write.address).is_some() {
                plan.updates += 1;
            } else {
                plan.creates += 1;
            }
        }
        plan
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub updated: usize,
    pub created: usize,
    pub errors: usize,
    pub remote_pages: usize,
    pub listing_truncated: Option<u16>,
    pub plan: SyncPlan,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub database_id: String,
    pub title_property: String,
    pub write_delay: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Update,
    Create,
}

pub struct SyncPipeline<S> {
    store: S,
    settings: PipelineSettings,
}

impl<S: PageStore> SyncPipeline<S> {
    pub fn new(store: S, settings: PipelineSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Upsert every write by address against one snapshot of the remote
    /// database. Rejected or failed writes are counted and the run continues.
    pub async fn run(&self, writes: &[PlannedWrite], dry_run: bool) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, dry_run);
        self.run_inner(run_id, writes, dry_run).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        writes: &[PlannedWrite],
        dry_run: bool,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let database_id = self.settings.database_id.as_str();

        let listing = self
            .store
            .list_all(database_id)
            .await
            .with_context(|| format!("listing pages of database {database_id}"))?;
        if let Some(status) = listing.truncated {
            warn!(
                status,
                retrieved = listing.pages.len(),
                "remote listing truncated; unmatched addresses will be created"
            );
        }
        let lookup = AddressLookup::from_pages(&listing.pages);
        info!(
            remote_pages = listing.pages.len(),
            addresses = lookup.len(),
            "built address lookup"
        );

        let plan = SyncPlan::build(writes, &lookup);
        info!(
            updates = plan.updates,
            creates = plan.creates,
            skipped = plan.skipped,
            "sync plan"
        );

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            total: writes.len(),
            updated: 0,
            created: 0,
            errors: 0,
            remote_pages: listing.pages.len(),
            listing_truncated: listing.truncated,
            plan,
            dry_run,
        };

        if dry_run {
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let batch_size = self.settings.batch_size.max(1);
        for (batch_idx, batch) in writes.chunks(batch_size).enumerate() {
            let first_row = batch_idx * batch_size + 1;
            info!(
                batch = batch_idx + 1,
                rows = %format!("{}-{}", first_row, first_row + batch.len() - 1),
                "processing batch"
            );

            for write in batch {
                if write.address.trim().is_empty() {
                    continue;
                }
                match lookup.page_id(&write.address) {
                    Some(page_id) => {
                        let outcome = self.store.update_page(page_id, &write.properties).await;
                        record_outcome(&mut summary, WriteKind::Update, &write.address, outcome);
                    }
                    None => {
                        let mut properties = write.properties.clone();
                        properties.insert(
                            self.settings.title_property.clone(),
                            PropertyValue::title(write.address.trim()),
                        );
                        let outcome = self.store.create_page(database_id, &properties).await;
                        record_outcome(&mut summary, WriteKind::Create, &write.address, outcome);
                    }
                }

                if !self.settings.write_delay.is_zero() {
                    tokio::time::sleep(self.settings.write_delay).await;
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            updated = summary.updated,
            created = summary.created,
            errors = summary.errors,
            "sync complete"
        );
        Ok(summary)
    }
}

fn record_outcome(
    summary: &mut SyncRunSummary,
    kind: WriteKind,
    address: &str,
    outcome: Result<WriteOutcome, NotionError>,
) {
    match (kind, outcome) {
        (WriteKind::Update, Ok(WriteOutcome::Applied { .. })) => {
            summary.updated += 1;
            info!(address, "updated");
        }
        (WriteKind::Create, Ok(WriteOutcome::Applied { page_id })) => {
            summary.created += 1;
            info!(address, %page_id, "created");
        }
        (kind, Ok(WriteOutcome::Rejected { status, body })) => {
            summary.errors += 1;
            warn!(address, ?kind, status, %body, "write rejected");
        }
        (kind, Err(err)) => {
            summary.errors += 1;
            warn!(address, ?kind, error = %err, "write failed");
        }
    }
}

fn notion_pipeline(config: &SyncConfig) -> Result<SyncPipeline<NotionClient>> {
    let client =
        NotionClient::new(config.notion_client_config()).context("building notion client")?;
    Ok(SyncPipeline::new(client, config.pipeline_settings()))
}

/// Read the status workbook and upsert every row into the database.
pub async fn sync_workbook(
    config: &SyncConfig,
    workbook: impl AsRef<Path>,
    dry_run: bool,
) -> Result<SyncRunSummary> {
    let workbook = workbook.as_ref();
    let records = read_property_workbook(workbook)
        .with_context(|| format!("reading workbook {}", workbook.display()))?;
    let writes = planned_writes_from_records(&records);
    notion_pipeline(config)?.run(&writes, dry_run).await
}

/// Apply a hand-off file produced by [`export_workbook`].
pub async fn apply_handoff(
    config: &SyncConfig,
    handoff: impl AsRef<Path>,
    dry_run: bool,
) -> Result<SyncRunSummary> {
    let entries = read_handoff_file(handoff).await?;
    info!(entries = entries.len(), "loaded hand-off file");
    let writes = planned_writes_from_handoff(entries);
    notion_pipeline(config)?.run(&writes, dry_run).await
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub entries: usize,
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
}

/// Map the workbook and write `{address, notion_properties}` entries to `out`
/// for a separate process to apply. Needs no credential.
pub async fn export_workbook(
    workbook: impl AsRef<Path>,
    out: impl AsRef<Path>,
) -> Result<ExportSummary> {
    let workbook = workbook.as_ref();
    let records = read_property_workbook(workbook)
        .with_context(|| format!("reading workbook {}", workbook.display()))?;
    let entries = handoff_entries(&records);
    let written = write_handoff_file(out, &entries).await?;
    info!(entries = entries.len(), path = %written.path.display(), "wrote hand-off file");
    Ok(ExportSummary {
        entries: entries.len(),
        path: written.path.display().to_string(),
        sha256: written.content_hash,
        bytes: written.byte_size,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaProblem {
    pub property: String,
    pub expected: String,
    pub found: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchemaReport {
    pub schema: DatabaseSchema,
    pub problems: Vec<SchemaProblem>,
}

/// Compare the database schema with what the mapper writes.
pub fn schema_problems(schema: &DatabaseSchema, title_property: &str) -> Vec<SchemaProblem> {
    let mut wanted: Vec<(&str, &str)> = vec![(title_property, "title")];
    wanted.extend_from_slice(MAPPED_PROPERTIES);
    wanted
        .into_iter()
        .filter_map(|(name, expected)| {
            let found = schema.properties.get(name);
            match found {
                Some(kind) if kind == expected => None,
                _ => Some(SchemaProblem {
                    property: name.to_string(),
                    expected: expected.to_string(),
                    found: found.cloned(),
                }),
            }
        })
        .collect()
}

pub async fn check_schema(config: &SyncConfig) -> Result<SchemaReport> {
    let client =
        NotionClient::new(config.notion_client_config()).context("building notion client")?;
    let schema = client
        .retrieve_database(&config.database_id)
        .await
        .with_context(|| format!("retrieving database {}", config.database_id))?;
    let problems = schema_problems(&schema, &config.title_property);
    Ok(SchemaReport { schema, problems })
}

pub fn render_schema_report(report: &SchemaReport) -> String {
    let mut lines = vec![format!("Database Title: {}", report.schema.title), String::new()];
    lines.push("Properties:".to_string());
    for (name, kind) in &report.schema.properties {
        lines.push(format!("  - \"{name}\" ({kind})"));
    }
    lines.push(String::new());
    if report.problems.is_empty() {
        lines.push("All mapped properties present with expected types.".to_string());
    } else {
        lines.push("Mapping problems:".to_string());
        for problem in &report.problems {
            match &problem.found {
                Some(found) => lines.push(format!(
                    "  - \"{}\": expected {}, found {}",
                    problem.property, problem.expected, found
                )),
                None => lines.push(format!(
                    "  - \"{}\": missing (expected {})",
                    problem.property, problem.expected
                )),
            }
        }
    }
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub total_pages: usize,
    pub listing_truncated: Option<u16>,
    pub duplicates: Vec<DuplicateAddress>,
}

pub async fn duplicate_report<S: PageStore>(
    store: &S,
    database_id: &str,
) -> Result<DuplicateReport> {
    let listing = store
        .list_all(database_id)
        .await
        .with_context(|| format!("listing database {database_id}"))?;
    let duplicates = find_duplicate_addresses(&listing.pages);
    info!(
        pages = listing.pages.len(),
        duplicates = duplicates.len(),
        "scanned remote addresses"
    );
    Ok(DuplicateReport {
        total_pages: listing.pages.len(),
        listing_truncated: listing.truncated,
        duplicates,
    })
}

/// List every address the database holds more than once.
pub async fn find_duplicates(config: &SyncConfig) -> Result<DuplicateReport> {
    let client =
        NotionClient::new(config.notion_client_config()).context("building notion client")?;
    duplicate_report(&client, &config.database_id).await
}

pub fn render_duplicate_report(report: &DuplicateReport) -> String {
    let mut lines = vec![format!("Total properties: {}", report.total_pages)];
    if let Some(status) = report.listing_truncated {
        lines.push(format!(
            "Warning: listing stopped early (HTTP {status}); duplicates may be missing"
        ));
    }
    lines.push(String::new());
    lines.push(format!("Duplicate addresses found: {}", report.duplicates.len()));
    if !report.duplicates.is_empty() {
        lines.push(String::new());
        lines.push("Details:".to_string());
    }
    for duplicate in &report.duplicates {
        lines.push(String::new());
        lines.push(format!("Address: {}", duplicate.address));
        for (idx, page_id) in duplicate.page_ids.iter().enumerate() {
            lines.push(format!("  Page {}: {}", idx + 1, page_id));
        }
    }
    lines.join("\n")
}

fn format_schedule_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

fn staff_line(name: &str) -> String {
    match resolve_staff(name) {
        StaffResolution::Mapped(member) => {
            format!("{name} => {} ({})", member.full_name, member.member_id)
        }
        StaffResolution::Unmapped => format!("{name} => NOT MAPPED!"),
    }
}

/// Console report of a parsed schedule: a sample of resolved events, then all
/// events keyed by date and location.
pub fn schedule_report(events: &[CalendarEvent]) -> String {
    let mut lines = vec![format!("Parsed {} events from schedule", events.len())];

    lines.push(String::new());
    lines.push("Sample parsed events:".to_string());
    for (idx, event) in events.iter().take(5).enumerate() {
        lines.push(String::new());
        lines.push(format!(
            "{}. {} - {}",
            idx + 1,
            format_schedule_date(event.date),
            event.location
        ));
        lines.push(format!("   Staff: {}", event.staff.join(", ")));
        for name in &event.staff {
            lines.push(format!("   - {}", staff_line(name)));
        }
    }

    let by_date_location: BTreeMap<(NaiveDate, &str), &CalendarEvent> = events
        .iter()
        .map(|event| ((event.date, event.location.as_str()), event))
        .collect();

    lines.push(String::new());
    lines.push(String::new());
    lines.push("=== EVENTS BY DATE/ADDRESS ===".to_string());
    for ((date, location), event) in by_date_location {
        lines.push(String::new());
        lines.push(format!("{} - {}", format_schedule_date(date), location));
        if event.staff.is_empty() {
            lines.push("  Staff 1: None".to_string());
        }
        for (idx, name) in event.staff.iter().enumerate() {
            lines.push(format!("  Staff {}: {}", idx + 1, name));
            if let StaffResolution::Mapped(member) = resolve_staff(name) {
                lines.push(format!("    => {} ({})", member.full_name, member.member_id));
            }
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use regsync_core::PropertyStatus;
    use regsync_storage::RemoteListing;
    use rust_xlsxwriter::Workbook;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const TITLE: &str = "Address";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(PropertyMap),
        Update(String, PropertyMap),
    }

    #[derive(Default)]
    struct MemoryStore {
        pages: Mutex<Vec<RemotePage>>,
        calls: Mutex<Vec<Call>>,
        rejected_pages: HashSet<String>,
        reject_creates: bool,
        truncate_after: Option<usize>,
    }

    impl MemoryStore {
        fn with_pages(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: Mutex::new(
                    pages
                        .iter()
                        .map(|(id, title)| RemotePage {
                            id: id.to_string(),
                            title: Some(title.to_string()),
                        })
                        .collect(),
                ),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl PageStore for MemoryStore {
        async fn list_all(&self, _database_id: &str) -> Result<RemoteListing, NotionError> {
            let pages = self.pages.lock().expect("pages").clone();
            Ok(match self.truncate_after {
                Some(n) => RemoteListing {
                    pages: pages.into_iter().take(n).collect(),
                    truncated: Some(500),
                },
                None => RemoteListing {
                    pages,
                    truncated: None,
                },
            })
        }

        async fn create_page(
            &self,
            _database_id: &str,
            properties: &PropertyMap,
        ) -> Result<WriteOutcome, NotionError> {
            self.calls
                .lock()
                .expect("calls")
                .push(Call::Create(properties.clone()));
            if self.reject_creates {
                return Ok(WriteOutcome::Rejected {
                    status: 400,
                    body: "validation_error".into(),
                });
            }
            let mut pages = self.pages.lock().expect("pages");
            let id = format!("page-{}", pages.len() + 1);
            pages.push(RemotePage {
                id: id.clone(),
                title: properties.get(TITLE).and_then(PropertyValue::plain_text),
            });
            Ok(WriteOutcome::Applied { page_id: id })
        }

        async fn update_page(
            &self,
            page_id: &str,
            properties: &PropertyMap,
        ) -> Result<WriteOutcome, NotionError> {
            self.calls
                .lock()
                .expect("calls")
                .push(Call::Update(page_id.to_string(), properties.clone()));
            if self.rejected_pages.contains(page_id) {
                return Ok(WriteOutcome::Rejected {
                    status: 409,
                    body: "conflict".into(),
                });
            }
            Ok(WriteOutcome::Applied {
                page_id: page_id.to_string(),
            })
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            database_id: "db".into(),
            title_property: TITLE.into(),
            write_delay: Duration::ZERO,
            batch_size: 2,
        }
    }

    fn record(address: &str, pct: Option<i64>) -> PropertyRecord {
        PropertyRecord {
            completion_pct: pct,
            ..PropertyRecord::new(address)
        }
    }

    #[test]
    fn full_record_maps_to_every_property() {
        let record = PropertyRecord {
            address: "123 Main St".into(),
            sqft: Some(1850),
            plan: Some("Aspen".into()),
            subdivision: Some("Mission Ridge".into()),
            lot: Some("12".into()),
            block: Some("4".into()),
            foreman_stage: Some("Framing".into()),
            completion_pct: Some(85),
            status: Some(PropertyStatus::Model),
            edwards_co: Some("Yes".into()),
            sale_price: Some(289990.5),
            foreman: Some("Mark Morales".into()),
        };

        let value = serde_json::to_value(build_notion_properties(&record)).expect("json");
        assert_eq!(
            value,
            json!({
                "SqFt": {"number": 1850},
                "Floorplan": {"rich_text": [{"text": {"content": "Aspen"}}]},
                "Subdivision": {"select": {"name": "Mission Ridge"}},
                "Lot": {"rich_text": [{"text": {"content": "12"}}]},
                "Block": {"rich_text": [{"text": {"content": "4"}}]},
                "Stage": {"rich_text": [{"text": {"content": "Framing"}}]},
                "Stage Completion %": {"number": 85},
                "Status": {"select": {"name": "Model"}},
                "Edwards Co.": {"rich_text": [{"text": {"content": "Yes"}}]},
                "Sales Price": {"number": 289990.5},
                "Foreman": {"rich_text": [{"text": {"content": "Mark Morales"}}]},
            })
        );
    }

    #[test]
    fn absent_fields_are_omitted_not_cleared() {
        let mut partial = record("7 Elm Ct", Some(40));
        partial.plan = Some("  ".into());
        partial.sale_price = Some(f64::NAN);

        let props = build_notion_properties(&partial);
        assert_eq!(props.keys().collect::<Vec<_>>(), vec![property_names::COMPLETION]);
        assert_eq!(
            props.get(property_names::COMPLETION),
            Some(&PropertyValue::integer(40))
        );
        assert!(build_notion_properties(&PropertyRecord::new("8 Elm Ct")).is_empty());
        assert!(!props.contains_key(TITLE));
    }

    #[test]
    fn lookup_is_case_and_whitespace_insensitive_and_last_duplicate_wins() {
        let pages = vec![
            RemotePage { id: "a".into(), title: Some("123 Main St".into()) },
            RemotePage { id: "b".into(), title: None },
            RemotePage { id: "c".into(), title: Some(" 9 elm ct".into()) },
            RemotePage { id: "d".into(), title: Some("9 Elm Ct".into()) },
        ];
        let lookup = AddressLookup::from_pages(&pages);
        assert_eq!(lookup.len(), 2);
        assert_eq!(lookup.page_id("123 MAIN ST "), Some("a"));
        assert_eq!(lookup.page_id("9 Elm Ct"), Some("d"));
        assert_eq!(lookup.page_id("10 Elm Ct"), None);
        assert_eq!(lookup.collisions(), 1);
    }

    #[test]
    fn duplicate_addresses_group_page_ids_in_listing_order() {
        let pages = vec![
            RemotePage { id: "a".into(), title: Some("9 Elm Ct".into()) },
            RemotePage { id: "b".into(), title: Some("1 Oak Dr".into()) },
            RemotePage { id: "c".into(), title: Some(" 9 ELM CT".into()) },
            RemotePage { id: "d".into(), title: None },
            RemotePage { id: "e".into(), title: Some("9 elm ct".into()) },
        ];
        assert_eq!(
            find_duplicate_addresses(&pages),
            vec![DuplicateAddress {
                address: "9 Elm Ct".into(),
                page_ids: vec!["a".into(), "c".into(), "e".into()],
            }]
        );
        assert_eq!(AddressLookup::from_pages(&pages).collisions(), 2);
    }

    #[tokio::test]
    async fn duplicate_report_lists_each_shared_address() {
        let store = MemoryStore::with_pages(&[
            ("p1", "100 Oak Dr"),
            ("p2", "102 Oak Dr"),
            ("p3", "100 oak dr"),
        ]);
        let report = duplicate_report(&store, "db").await.expect("report");
        assert_eq!(report.total_pages, 3);
        assert_eq!(report.duplicates.len(), 1);

        let text = render_duplicate_report(&report);
        assert_eq!(
            text,
            "Total properties: 3\n\nDuplicate addresses found: 1\n\nDetails:\n\nAddress: 100 Oak Dr\n  Page 1: p1\n  Page 2: p3"
        );

        let clean = duplicate_report(&MemoryStore::with_pages(&[("p1", "100 Oak Dr")]), "db")
            .await
            .expect("report");
        assert_eq!(
            render_duplicate_report(&clean),
            "Total properties: 1\n\nDuplicate addresses found: 0"
        );
    }

    #[tokio::test]
    async fn second_run_updates_what_first_run_created() {
        let records: Vec<_> = (1..=5)
            .map(|n| record(&format!("{n} Oak Dr"), Some(n * 10)))
            .collect();
        let writes = planned_writes_from_records(&records);
        let pipeline = SyncPipeline::new(MemoryStore::default(), settings());

        let first = pipeline.run(&writes, false).await.expect("first run");
        assert_eq!((first.created, first.updated, first.errors), (5, 0, 0));
        assert_eq!(first.plan, SyncPlan { updates: 0, creates: 5, skipped: 0 });

        let second = pipeline.run(&writes, false).await.expect("second run");
        assert_eq!((second.created, second.updated, second.errors), (0, 5, 0));
        assert_eq!(second.remote_pages, 5);
    }

    #[tokio::test]
    async fn creates_carry_title_and_updates_do_not() {
        let store = MemoryStore::with_pages(&[("page-main", "123 Main St")]);
        let pipeline = SyncPipeline::new(store, settings());
        let writes = planned_writes_from_records(&[
            record("123 MAIN ST ", Some(100)),
            record("55 Cedar Ln", None),
        ]);

        let summary = pipeline.run(&writes, false).await.expect("run");
        assert_eq!((summary.updated, summary.created), (1, 1));

        let calls = pipeline.store().calls();
        match &calls[0] {
            Call::Update(page_id, props) => {
                assert_eq!(page_id, "page-main");
                assert!(!props.contains_key(TITLE));
                assert_eq!(props.get("Stage Completion %"), Some(&PropertyValue::integer(100)));
            }
            other => panic!("expected update, got {other:?}"),
        }
        match &calls[1] {
            Call::Create(props) => {
                assert_eq!(props.get(TITLE), Some(&PropertyValue::title("55 Cedar Ln")));
                assert_eq!(props.len(), 1);
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_writes_are_counted_and_run_continues() {
        let mut store = MemoryStore::with_pages(&[("p1", "1 Elm Ct"), ("p2", "2 Elm Ct")]);
        store.rejected_pages.insert("p1".into());
        store.reject_creates = true;
        let pipeline = SyncPipeline::new(store, settings());
        let writes = planned_writes_from_records(&[
            record("1 Elm Ct", None),
            record("2 Elm Ct", None),
            record("3 Elm Ct", None),
        ]);

        let summary = pipeline.run(&writes, false).await.expect("run");
        assert_eq!((summary.updated, summary.created, summary.errors), (1, 0, 2));
        assert_eq!(pipeline.store().calls().len(), 3);
    }

    #[tokio::test]
    async fn truncated_listing_degrades_to_creates_without_failing() {
        let mut store = MemoryStore::with_pages(&[("p1", "1 Elm Ct"), ("p2", "2 Elm Ct")]);
        store.truncate_after = Some(1);
        let pipeline = SyncPipeline::new(store, settings());
        let writes =
            planned_writes_from_records(&[record("1 Elm Ct", None), record("2 Elm Ct", None)]);

        let summary = pipeline.run(&writes, false).await.expect("run");
        assert_eq!(summary.listing_truncated, Some(500));
        assert_eq!(summary.remote_pages, 1);
        assert_eq!((summary.updated, summary.created), (1, 1));
    }

    #[tokio::test]
    async fn dry_run_plans_without_writing() {
        let store = MemoryStore::with_pages(&[("p1", "1 Elm Ct")]);
        let pipeline = SyncPipeline::new(store, settings());
        let writes = vec![
            PlannedWrite { address: "1 Elm Ct".into(), properties: PropertyMap::new() },
            PlannedWrite { address: "2 Elm Ct".into(), properties: PropertyMap::new() },
            PlannedWrite { address: "  ".into(), properties: PropertyMap::new() },
        ];

        let summary = pipeline.run(&writes, true).await.expect("run");
        assert_eq!(summary.plan, SyncPlan { updates: 1, creates: 1, skipped: 1 });
        assert_eq!((summary.updated, summary.created, summary.errors), (0, 0, 0));
        assert!(pipeline.store().calls().is_empty());
    }

    #[tokio::test]
    async fn handoff_entries_apply_through_same_upsert() {
        let entries = handoff_entries(&[record("1 Elm Ct", Some(20)), record("2 Elm Ct", None)]);
        assert!(entries.iter().all(|e| !e.notion_properties.contains_key(TITLE)));

        let mut stray = entries.clone();
        stray[1]
            .notion_properties
            .insert("Property Address".into(), PropertyValue::title("ignored"));
        let writes = planned_writes_from_handoff(stray);
        assert!(writes[1].properties.is_empty());

        let pipeline = SyncPipeline::new(MemoryStore::with_pages(&[("p1", "1 elm ct")]), settings());
        let summary = pipeline.run(&writes, false).await.expect("run");
        assert_eq!((summary.updated, summary.created), (1, 1));
    }

    #[tokio::test]
    async fn blank_addresses_are_skipped() {
        let pipeline = SyncPipeline::new(MemoryStore::default(), settings());
        let writes = vec![PlannedWrite { address: " ".into(), properties: PropertyMap::new() }];
        let summary = pipeline.run(&writes, false).await.expect("run");
        assert_eq!(summary.plan.skipped, 1);
        assert!(pipeline.store().calls().is_empty());
    }

    #[test]
    fn config_requires_api_key_and_applies_defaults() {
        let empty = SyncConfig::from_lookup(|_| None);
        assert!(empty.is_err());
        let blank = SyncConfig::from_lookup(|key| (key == "NOTION_API_KEY").then(|| " ".to_string()));
        assert!(blank.is_err());

        let config = SyncConfig::from_lookup(|key| match key {
            "NOTION_API_KEY" => Some("secret".into()),
            "REGSYNC_BATCH_SIZE" => Some("0".into()),
            "REGSYNC_RATE_LIMIT_PER_SEC" => Some("3".into()),
            _ => None,
        })
        .expect("config");
        assert_eq!(config.database_id, DEFAULT_DATABASE_ID);
        assert_eq!(config.request_delay, Duration::from_millis(300));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.title_property, "Address");
        assert_eq!(config.rate_limit_per_sec, Some(3));
        assert_eq!(config.notion_client_config().api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn schema_problems_flag_missing_and_mistyped_properties() {
        let mut properties: BTreeMap<String, String> = MAPPED_PROPERTIES
            .iter()
            .map(|(name, kind)| (name.to_string(), kind.to_string()))
            .collect();
        properties.insert(TITLE.into(), "title".into());
        properties.insert(property_names::SUBDIVISION.into(), "rich_text".into());
        properties.remove(property_names::FOREMAN);
        let schema = DatabaseSchema { title: "Properties".into(), properties };

        let problems = schema_problems(&schema, TITLE);
        assert_eq!(
            problems,
            vec![
                SchemaProblem {
                    property: "Subdivision".into(),
                    expected: "select".into(),
                    found: Some("rich_text".into()),
                },
                SchemaProblem {
                    property: "Foreman".into(),
                    expected: "rich_text".into(),
                    found: None,
                },
            ]
        );
        let rendered = render_schema_report(&SchemaReport { schema, problems });
        assert!(rendered.contains("\"Foreman\": missing (expected rich_text)"));
    }

    #[test]
    fn schedule_report_resolves_staff_and_orders_by_date() {
        let day = |d| NaiveDate::from_ymd_opt(2025, 12, d).expect("date");
        let events = vec![
            CalendarEvent {
                date: day(7),
                location: "100 Oak Dr".into(),
                staff: vec!["Alba".into()],
            },
            CalendarEvent {
                date: day(6),
                location: "100 Oak Dr".into(),
                staff: vec!["C. Gutierrez".into(), "Jordan Reyes".into()],
            },
        ];

        let report = schedule_report(&events);
        assert!(report.starts_with("Parsed 2 events from schedule"));
        assert!(report.contains("   - Jordan Reyes => NOT MAPPED!"));
        assert!(report.contains(
            "   - C. Gutierrez => Carina Gutierrez (2bb746b9-e0e8-81e0-88d8-e6460cb03050)"
        ));

        let grouped = report
            .split("=== EVENTS BY DATE/ADDRESS ===")
            .nth(1)
            .expect("grouped section");
        let first = grouped.find("06/12/2025 - 100 Oak Dr").expect("first");
        let second = grouped.find("07/12/2025 - 100 Oak Dr").expect("second");
        assert!(first < second);
        assert!(grouped.contains("  Staff 2: Jordan Reyes"));
    }

    #[tokio::test]
    async fn export_writes_handoff_entries_from_workbook() {
        let dir = tempfile::tempdir().expect("tempdir");
        let xlsx = dir.path().join("status.xlsx");
        let out = dir.path().join("sync_commands.json");

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, name) in ["Stnum", "Stname", "Sold/Available", "Lot"].iter().enumerate() {
            sheet.write_string(0, col as u16, *name).expect("header");
        }
        sheet.write_number(1, 0, 100.0).expect("stnum");
        sheet.write_string(1, 1, "Oak Dr").expect("stname");
        sheet.write_string(1, 2, "AVAILABLE").expect("status");
        sheet.write_number(1, 3, 12.0).expect("lot");
        workbook.save(&xlsx).expect("save");

        let summary = export_workbook(&xlsx, &out).await.expect("export");
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.sha256.len(), 64);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).expect("read")).expect("json");
        assert_eq!(
            raw,
            json!([{
                "address": "100 Oak Dr",
                "notion_properties": {
                    "Lot": {"rich_text": [{"text": {"content": "12"}}]},
                    "Status": {"select": {"name": "Available"}},
                }
            }])
        );
    }

    #[tokio::test]
    async fn export_of_missing_workbook_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.json");
        let missing = export_workbook(dir.path().join("missing.xlsx"), &out).await;
        assert!(missing.is_err());
        assert!(!out.exists());
    }
}
