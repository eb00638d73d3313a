//! Core domain model for regsync: spreadsheet property rows and calendar events.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "regsync-core";

/// Sales status of a property. Closed set; anything else is dropped at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyStatus {
    Sold,
    Available,
    Model,
}

impl PropertyStatus {
    /// Case-insensitive parse of a spreadsheet status cell.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sold" => Some(Self::Sold),
            "available" => Some(Self::Available),
            "model" => Some(Self::Model),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sold => "Sold",
            Self::Available => "Available",
            Self::Model => "Model",
        }
    }
}

impl fmt::Display for PropertyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized spreadsheet row. `None` means "leave the remote value unchanged".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub address: String,
    pub sqft: Option<i64>,
    pub plan: Option<String>,
    pub subdivision: Option<String>,
    pub lot: Option<String>,
    pub block: Option<String>,
    pub foreman_stage: Option<String>,
    pub completion_pct: Option<i64>,
    pub status: Option<PropertyStatus>,
    pub edwards_co: Option<String>,
    pub sale_price: Option<f64>,
    pub foreman: Option<String>,
}

impl PropertyRecord {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn address_key(&self) -> String {
        normalize_address(&self.address)
    }
}

/// Lookup key for matching spreadsheet addresses against remote titles.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// A model-home schedule entry parsed from an ICS export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub date: NaiveDate,
    pub location: String,
    pub staff: Vec<String>,
}

/// Team member as known to the remote workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaffMember {
    pub full_name: &'static str,
    pub member_id: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffResolution {
    Mapped(StaffMember),
    Unmapped,
}
