//! Read-side aggregation over catalog snapshots.
//!
//! The aggregation functions are pure: they take a slice of rows and return
//! report structures, so they can be tested without a store. [`Statistics`]
//! loads the snapshot from a [`Catalog`] and assembles the reports.

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::error;

use crate::catalog::Catalog;
use crate::db::{Category, Painting};
use crate::error::{CatalogError, Result};
use crate::storage::StorageSummary;

/// Label for a missing value.
pub const UNKNOWN: &str = "未知";
/// Label for a missing author.
pub const ANONYMOUS: &str = "佚名";

/// Minimum count (exclusive) for an author/category pair to be reported.
pub const PREFERENCE_THRESHOLD: usize = 5;
pub const TOP_AUTHORS: usize = 10;

/// Map that serializes as a JSON object in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> OrderedMap<V> {
    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Share {
    pub count: usize,
    pub percentage: f64,
}

pub type Counts = OrderedMap<usize>;
pub type Distribution = OrderedMap<Share>;

/// A categorical column to group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupField {
    Dynasty,
    Category,
    Author,
    Technique,
    InkColorStyle,
}

impl GroupField {
    /// Display label of the field's value, `未知` when absent.
    pub fn label(self, painting: &Painting) -> String {
        let value = match self {
            GroupField::Dynasty => painting.dynasty.clone(),
            GroupField::Category => painting.category.map(|c| c.token().to_string()),
            GroupField::Author => painting.author.clone(),
            GroupField::Technique => painting.technique.map(|t| t.token().to_string()),
            GroupField::InkColorStyle => painting.ink_color_style.map(|s| s.token().to_string()),
        };
        value.unwrap_or_else(|| UNKNOWN.to_string())
    }

    fn is_set(self, painting: &Painting) -> bool {
        match self {
            GroupField::Dynasty => painting.dynasty.is_some(),
            GroupField::Category => painting.category.is_some(),
            GroupField::Author => painting.author.is_some(),
            GroupField::Technique => painting.technique.is_some(),
            GroupField::InkColorStyle => painting.ink_color_style.is_some(),
        }
    }
}

/// Time bucket applied to `created_at` (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    Day,
    Month,
    Year,
    HourOfDay,
    MonthOfYear,
}

impl TimeBucket {
    fn format(self) -> &'static str {
        match self {
            TimeBucket::Day => "%Y-%m-%d",
            TimeBucket::Month => "%Y-%m",
            TimeBucket::Year => "%Y",
            TimeBucket::HourOfDay => "%H",
            TimeBucket::MonthOfYear => "%m",
        }
    }

    pub fn label(self, at: &DateTime<Utc>) -> String {
        at.format(self.format()).to_string()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// round(count / total * 100, 2); 0 when `total` is 0.
pub fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(count as f64 / total as f64 * 100.0)
}

/// Tallies labels, ordered by count descending then label ascending.
fn tally<I: IntoIterator<Item = String>>(labels: I) -> Counts {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for label in labels {
        *counts.entry(label).or_default() += 1;
    }
    let mut entries: Vec<(String, usize)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    OrderedMap(entries)
}

/// Tallies labels in ascending label order.
fn tally_sorted<I: IntoIterator<Item = String>>(labels: I) -> Counts {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for label in labels {
        *counts.entry(label).or_default() += 1;
    }
    OrderedMap(counts.into_iter().collect())
}

pub fn count_by(paintings: &[Painting], field: GroupField) -> Counts {
    tally(paintings.iter().map(|p| field.label(p)))
}

/// Percentage distribution of a field, largest group first. Empty for no rows.
pub fn distribution(paintings: &[Painting], field: GroupField) -> Distribution {
    let total = paintings.len();
    OrderedMap(
        count_by(paintings, field)
            .0
            .into_iter()
            .map(|(label, count)| {
                let share = Share {
                    count,
                    percentage: percentage(count, total),
                };
                (label, share)
            })
            .collect(),
    )
}

/// Counts per time bucket in chronological order.
pub fn count_by_time(paintings: &[Painting], bucket: TimeBucket) -> Counts {
    tally_sorted(paintings.iter().map(|p| bucket.label(&p.created_at)))
}

/// Counts keyed `"{a}__{b}"`, with `未知` for missing values.
pub fn cross_tab(paintings: &[Painting], a: GroupField, b: GroupField) -> Counts {
    tally_sorted(
        paintings
            .iter()
            .map(|p| format!("{}__{}", a.label(p), b.label(p))),
    )
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MonthlyTrend {
    pub date: String,
    pub total: usize,
    /// Per-category counts; every category is present, zero included.
    pub categories: OrderedMap<usize>,
}

pub fn monthly_trend(paintings: &[Painting]) -> Vec<MonthlyTrend> {
    let mut months: BTreeMap<String, Vec<&Painting>> = BTreeMap::new();
    for painting in paintings {
        months
            .entry(TimeBucket::Month.label(&painting.created_at))
            .or_default()
            .push(painting);
    }

    months
        .into_iter()
        .map(|(date, rows)| {
            let categories = Category::ALL
                .iter()
                .map(|&c| {
                    let count = rows.iter().filter(|p| p.category == Some(c)).count();
                    (c.token().to_string(), count)
                })
                .collect();
            MonthlyTrend {
                date,
                total: rows.len(),
                categories: OrderedMap(categories),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct YearlyTrend {
    pub year: String,
    pub count: usize,
}

pub fn yearly_trend(paintings: &[Painting]) -> Vec<YearlyTrend> {
    count_by_time(paintings, TimeBucket::Year)
        .0
        .into_iter()
        .map(|(year, count)| YearlyTrend { year, count })
        .collect()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AuthorCount {
    pub author: String,
    pub work_count: usize,
}

/// The `n` authors with the most works. Works without an author count
/// towards `佚名`.
pub fn top_authors(paintings: &[Painting], n: usize) -> Vec<AuthorCount> {
    tally(
        paintings
            .iter()
            .map(|p| p.author.clone().unwrap_or_else(|| ANONYMOUS.to_string())),
    )
    .0
    .into_iter()
    .take(n)
    .map(|(author, work_count)| AuthorCount { author, work_count })
    .collect()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AuthorPreference {
    pub author: String,
    pub category: String,
    pub count: usize,
}

/// Author × category pairs with more than `threshold` works, largest first.
/// Works without an author are left out.
pub fn author_preferences(paintings: &[Painting], threshold: usize) -> Vec<AuthorPreference> {
    let mut pairs: HashMap<(String, String), usize> = HashMap::new();
    for painting in paintings {
        if let Some(ref author) = painting.author {
            let key = (author.clone(), GroupField::Category.label(painting));
            *pairs.entry(key).or_default() += 1;
        }
    }

    let mut preferences: Vec<AuthorPreference> = pairs
        .into_iter()
        .filter(|(_, count)| *count > threshold)
        .map(|((author, category), count)| AuthorPreference {
            author,
            category,
            count,
        })
        .collect();
    preferences.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.author.cmp(&b.author))
            .then_with(|| a.category.cmp(&b.category))
    });
    preferences
}

/// Fields reported by the completeness metric, with their report names.
pub const COMPLETENESS_FIELDS: &[(&str, GroupField)] = &[
    ("technique", GroupField::Technique),
    ("category", GroupField::Category),
    ("ink_color", GroupField::InkColorStyle),
    ("author", GroupField::Author),
    ("dynasty", GroupField::Dynasty),
];

/// Percentage of rows with each optional field set; 0 for every field when
/// there are no rows.
pub fn completeness(paintings: &[Painting]) -> OrderedMap<f64> {
    OrderedMap(
        COMPLETENESS_FIELDS
            .iter()
            .map(|&(name, field)| {
                let set = paintings.iter().filter(|p| field.is_set(p)).count();
                (name.to_string(), percentage(set, paintings.len()))
            })
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SummaryReport {
    pub total_paintings: usize,
    pub dynasty_distribution: Counts,
    pub technique_distribution: Counts,
    pub storage: StorageSummary,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DailyReport {
    pub daily_uploads: Counts,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CategoryReport {
    pub total_paintings: usize,
    pub category_distribution: Distribution,
    pub technique_distribution: Distribution,
    pub ink_color_distribution: Distribution,
    pub dynasty_distribution: Distribution,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "period", rename_all = "lowercase")]
pub enum TrendReport {
    Monthly { trends: Vec<MonthlyTrend> },
    Yearly { trends: Vec<YearlyTrend> },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CorrelationReport {
    pub technique_color_correlation: Counts,
    pub dynasty_category_correlation: Counts,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AuthorReport {
    pub top_authors: Vec<AuthorCount>,
    pub author_preferences: Vec<AuthorPreference>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TimeCount {
    pub value: u32,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TimeReport {
    pub hourly_distribution: Vec<TimeCount>,
    pub seasonal_distribution: Vec<TimeCount>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct QualityReport {
    pub metadata_completion: OrderedMap<f64>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum StatsReport {
    Summary(SummaryReport),
    Daily(DailyReport),
    Categories(CategoryReport),
    Trends(TrendReport),
    Correlations(CorrelationReport),
    Authors(AuthorReport),
    Time(TimeReport),
    Quality(QualityReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrendPeriod {
    #[default]
    Monthly,
    Yearly,
}

/// The report kinds reachable through [`Statistics::report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Summary,
    Daily,
    Categories,
    Trends(TrendPeriod),
    Correlations,
    Authors,
    Time,
    Quality,
}

impl FromStr for StatsKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "summary" => StatsKind::Summary,
            "daily" => StatsKind::Daily,
            "categories" => StatsKind::Categories,
            "trends" | "trends:monthly" => StatsKind::Trends(TrendPeriod::Monthly),
            "trends:yearly" => StatsKind::Trends(TrendPeriod::Yearly),
            "correlations" => StatsKind::Correlations,
            "authors" => StatsKind::Authors,
            "time" => StatsKind::Time,
            "quality" => StatsKind::Quality,
            other => {
                return Err(CatalogError::Validation(format!(
                    "unknown statistics kind: {}",
                    other
                )))
            }
        })
    }
}

impl fmt::Display for StatsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatsKind::Summary => "summary",
            StatsKind::Daily => "daily",
            StatsKind::Categories => "categories",
            StatsKind::Trends(TrendPeriod::Monthly) => "trends:monthly",
            StatsKind::Trends(TrendPeriod::Yearly) => "trends:yearly",
            StatsKind::Correlations => "correlations",
            StatsKind::Authors => "authors",
            StatsKind::Time => "time",
            StatsKind::Quality => "quality",
        };
        f.write_str(name)
    }
}

fn time_counts(paintings: &[Painting], bucket: TimeBucket) -> Vec<TimeCount> {
    count_by_time(paintings, bucket)
        .0
        .into_iter()
        .filter_map(|(label, count)| label.parse().ok().map(|value| TimeCount { value, count }))
        .collect()
}

/// Builds a report from a snapshot. `storage` is only used by the summary.
pub fn build_report(kind: StatsKind, paintings: &[Painting], storage: StorageSummary) -> StatsReport {
    match kind {
        StatsKind::Summary => StatsReport::Summary(SummaryReport {
            total_paintings: paintings.len(),
            dynasty_distribution: count_by(paintings, GroupField::Dynasty),
            technique_distribution: count_by(paintings, GroupField::Technique),
            storage,
        }),
        StatsKind::Daily => StatsReport::Daily(DailyReport {
            daily_uploads: count_by_time(paintings, TimeBucket::Day),
        }),
        StatsKind::Categories => StatsReport::Categories(CategoryReport {
            total_paintings: paintings.len(),
            category_distribution: distribution(paintings, GroupField::Category),
            technique_distribution: distribution(paintings, GroupField::Technique),
            ink_color_distribution: distribution(paintings, GroupField::InkColorStyle),
            dynasty_distribution: distribution(paintings, GroupField::Dynasty),
        }),
        StatsKind::Trends(TrendPeriod::Monthly) => StatsReport::Trends(TrendReport::Monthly {
            trends: monthly_trend(paintings),
        }),
        StatsKind::Trends(TrendPeriod::Yearly) => StatsReport::Trends(TrendReport::Yearly {
            trends: yearly_trend(paintings),
        }),
        StatsKind::Correlations => StatsReport::Correlations(CorrelationReport {
            technique_color_correlation: cross_tab(paintings, GroupField::Technique, GroupField::InkColorStyle),
            dynasty_category_correlation: cross_tab(paintings, GroupField::Dynasty, GroupField::Category),
        }),
        StatsKind::Authors => StatsReport::Authors(AuthorReport {
            top_authors: top_authors(paintings, TOP_AUTHORS),
            author_preferences: author_preferences(paintings, PREFERENCE_THRESHOLD),
        }),
        StatsKind::Time => StatsReport::Time(TimeReport {
            hourly_distribution: time_counts(paintings, TimeBucket::HourOfDay),
            seasonal_distribution: time_counts(paintings, TimeBucket::MonthOfYear),
        }),
        StatsKind::Quality => StatsReport::Quality(QualityReport {
            metadata_completion: completeness(paintings),
        }),
    }
}

/// Statistics over the current contents of a catalog.
pub struct Statistics<'a> {
    catalog: &'a Catalog,
}

impl<'a> Statistics<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    fn snapshot(&self) -> Result<Vec<Painting>> {
        self.catalog.snapshot().map_err(|e| {
            error!("Loading catalog snapshot for statistics failed: {}", e);
            CatalogError::Aggregation(e.to_string())
        })
    }

    pub fn report(&self, kind: StatsKind) -> Result<StatsReport> {
        let paintings = self.snapshot()?;
        let storage = match kind {
            StatsKind::Summary => self.catalog.storage_summary(),
            _ => StorageSummary::default(),
        };
        Ok(build_report(kind, &paintings, storage))
    }
}
