//! Core domain model for the ESPM benchmarking mirror.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ebm-core";

/// Sentinel text ESPM uses on a gap indicator that needs attention.
pub const POSSIBLE_ISSUE_LABEL: &str = "Possible Issue";

/// Data-completeness flag from the benchmarking feed, converted once at the
/// extraction boundary so downstream logic never string-compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapStatus {
    #[default]
    Unknown,
    Ok,
    PossibleIssue,
}

impl GapStatus {
    /// Parse the raw feed value. ESPM emits "OK" / "Possible Issue"; anything
    /// else (including a missing metric) is `Unknown`.
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("ok") => GapStatus::Ok,
            Some(v) if v.eq_ignore_ascii_case("possible issue") => GapStatus::PossibleIssue,
            _ => GapStatus::Unknown,
        }
    }

    /// Canonical label for storage; `Unknown` persists as NULL.
    pub fn as_label(&self) -> Option<&'static str> {
        match self {
            GapStatus::Unknown => None,
            GapStatus::Ok => Some("OK"),
            GapStatus::PossibleIssue => Some(POSSIBLE_ISSUE_LABEL),
        }
    }
}

/// One (property, reporting year) row as stored in the permanent table.
///
/// Numeric-looking fields (floor area, EUI, WUI) stay text: the feed is not
/// guaranteed to produce parseable numbers and consumers must tolerate that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyYearRecord {
    pub property_id: i64,
    pub data_year: String,
    pub building_name: Option<String>,
    pub floor_area: Option<String>,
    pub address: Option<String>,
    pub occupancy: Option<String>,
    pub building_count: Option<String>,
    pub use_type: Option<String>,
    pub year_built: Option<String>,
    pub site_eui: Option<String>,
    pub water_intensity: Option<String>,
    pub energy_gap: GapStatus,
    pub water_gap: GapStatus,
    pub energy_months_short: GapStatus,
    pub water_months_short: GapStatus,
    pub parent_property_id: Option<i64>,
}

impl PropertyYearRecord {
    pub fn new(property_id: i64, data_year: impl Into<String>) -> Self {
        Self {
            property_id,
            data_year: data_year.into(),
            building_name: None,
            floor_area: None,
            address: None,
            occupancy: None,
            building_count: None,
            use_type: None,
            year_built: None,
            site_eui: None,
            water_intensity: None,
            energy_gap: GapStatus::Unknown,
            water_gap: GapStatus::Unknown,
            energy_months_short: GapStatus::Unknown,
            water_months_short: GapStatus::Unknown,
            parent_property_id: None,
        }
    }

    pub fn gap_indicators(&self) -> [GapStatus; 4] {
        [
            self.energy_gap,
            self.water_gap,
            self.energy_months_short,
            self.water_months_short,
        ]
    }

    /// True iff any gap indicator reports a possible issue. The stored
    /// `has_issue` column is derived from exactly this and must never be
    /// computed any other way.
    pub fn has_issue(&self) -> bool {
        self.gap_indicators()
            .iter()
            .any(|g| *g == GapStatus::PossibleIssue)
    }

    /// A property whose parent is itself or absent is a root/standalone
    /// entity; children are sub-meters excluded from portfolio rollups.
    pub fn is_root_property(&self) -> bool {
        match self.parent_property_id {
            None => true,
            Some(parent) => parent == self.property_id,
        }
    }
}
