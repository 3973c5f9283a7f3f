use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Secondary index axis by which events can be queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexDimension {
    Assignment,
    Customer,
    Area,
    Asset,
}

impl IndexDimension {
    pub const ALL: [IndexDimension; 4] = [
        IndexDimension::Assignment,
        IndexDimension::Customer,
        IndexDimension::Area,
        IndexDimension::Asset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexDimension::Assignment => "assignment",
            IndexDimension::Customer => "customer",
            IndexDimension::Area => "area",
            IndexDimension::Asset => "asset",
        }
    }
}

impl fmt::Display for IndexDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assignment" => Ok(IndexDimension::Assignment),
            "customer" => Ok(IndexDimension::Customer),
            "area" => Ok(IndexDimension::Area),
            "asset" => Ok(IndexDimension::Asset),
            other => Err(format!("unknown index dimension: {}", other)),
        }
    }
}

/// Inclusive date range; either end may be open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| ts >= start) && self.end.map_or(true, |end| ts <= end)
    }
}

/// Paging request. `page_number` is 1-based; a `page_size` of 0 returns every match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCriteria {
    pub page_number: u32,
    pub page_size: u32,
}

impl Default for PageCriteria {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: 100,
        }
    }
}

impl PageCriteria {
    pub fn new(page_number: u32, page_size: u32) -> Self {
        Self {
            page_number,
            page_size,
        }
    }

    pub fn all() -> Self {
        Self::new(1, 0)
    }

    /// Index of the first record on the requested page
    pub fn offset(&self) -> u64 {
        u64::from(self.page_number.max(1) - 1) * u64::from(self.page_size)
    }

    /// Exclusive upper bound of the page, `None` when unbounded
    pub fn limit(&self) -> Option<u64> {
        if self.page_size == 0 {
            None
        } else {
            Some(self.offset() + u64::from(self.page_size))
        }
    }
}

/// One page of results plus the exact number of matches across all pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults<T> {
    pub results: Vec<T>,
    pub total: u64,
}

impl<T> SearchResults<T> {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            total: 0,
        }
    }
}
