//! Billable-hour math and cost rollups over the usage ledger.
//!
//! Hours are computed per resource as
//! `ceil(max(0, elapsed - idle))` where both terms are clipped to the
//! report window first. Subtraction happens before rounding, so a resource
//! running 3.2 h with a 1.1 h stop bills 3 h, not 4.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use super::{ReconcileScope, ResourceRecord, StopInterval, UsageLedger};
use crate::cost::CostModel;
use crate::error::Result;
use crate::provider::ComputeProvider;

const MILLIS_PER_HOUR: u64 = 3_600_000;

/// Half-open time window `[since, until)`; `None` bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportWindow {
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
}

impl ReportWindow {
    /// The window covering all time.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A window between two optional bounds.
    pub fn between(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self { since, until }
    }

    /// Intersect `[start, end)` with the window. `None` when empty.
    pub fn clip(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let from = self.since.map_or(start, |since| start.max(since));
        let to = self.until.map_or(end, |until| end.min(until));
        (from < to).then_some((from, to))
    }

    /// Whether `at` falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|since| at >= since) && self.until.is_none_or(|until| at < until)
    }
}

fn span_millis(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    to.signed_duration_since(from).num_milliseconds().max(0)
}

/// Whole billable hours of a resource that ran from `start` to `end`
/// (`now` for a live resource), minus its stop intervals.
///
/// An interval still open counts as idle until `end`.
pub fn billable_hours(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    stops: &[StopInterval],
    window: &ReportWindow,
) -> u64 {
    let Some((from, to)) = window.clip(start, end) else {
        return 0;
    };
    let elapsed = span_millis(from, to);
    let idle = stops
        .iter()
        .filter_map(|stop| {
            let resumed = stop.running_time.unwrap_or(end).min(end);
            let a = stop.stopped_time.max(from);
            let b = resumed.min(to);
            (a < b).then(|| span_millis(a, b))
        })
        .fold(0i64, i64::saturating_add);
    let billable = u64::try_from(elapsed.saturating_sub(idle)).unwrap_or(0);
    billable.div_ceil(MILLIS_PER_HOUR)
}

/// One grouped line: all hours of one class and pricing kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportLine {
    /// Summed billable hours.
    pub hours: u64,
    /// Resource class.
    pub resource_class: String,
    /// Priced at the spot discount.
    pub is_spot: bool,
    /// Currency per hour.
    pub rate: f64,
    /// `hours * rate`.
    pub subtotal: f64,
}

/// A titled group of lines with its own total.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSection {
    /// Section heading.
    pub title: &'static str,
    /// Lines ordered by (spot, class).
    pub lines: Vec<ReportLine>,
    /// Sum of line subtotals.
    pub total: f64,
}

impl ReportSection {
    fn build(title: &'static str, hours: BTreeMap<(bool, String), u64>, cost: &CostModel) -> Self {
        let lines: Vec<ReportLine> = hours
            .into_iter()
            .map(|((is_spot, resource_class), hours)| {
                let rate = cost.report_rate(&resource_class, is_spot);
                let whole = f64::from(u32::try_from(hours).unwrap_or(u32::MAX));
                ReportLine {
                    hours,
                    subtotal: rate * whole,
                    resource_class,
                    is_spot,
                    rate,
                }
            })
            .collect();
        let total = lines.iter().map(|l| l.subtotal).sum();
        Self { title, lines, total }
    }
}

impl fmt::Display for ReportSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.title)?;
        for line in &self.lines {
            writeln!(
                f,
                "{:5} hours of {:>10} ({}) @ ${:5.3} = ${:6.3}",
                line.hours,
                line.resource_class,
                if line.is_spot { "spot" } else { "demand" },
                line.rate,
                line.subtotal,
            )?;
        }
        if self.lines.is_empty() {
            writeln!(f, "(none)")?;
        }
        writeln!(f, "Total cost ${:6.3}", self.total)
    }
}

/// Options for a single-identity report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    /// Include pending spot requests and still-running resources.
    pub include_pending: bool,
    /// Time window every span is clipped to.
    pub window: ReportWindow,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            include_pending: true,
            window: ReportWindow::unbounded(),
        }
    }
}

/// Estimated spending of one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    /// Whose usage this is.
    pub identity: String,
    /// Non-empty pending sections followed by the finished section.
    pub sections: Vec<ReportSection>,
    /// Sum of section totals.
    pub total: f64,
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Usage report for {}:", self.identity)?;
        for section in &self.sections {
            write!(f, "{section}")?;
        }
        writeln!(f)?;
        write!(f, "estimated total spending = ${:6.3}", self.total)
    }
}

/// Per-identity totals across the whole ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    /// `(identity, total)` ordered by identity.
    pub rows: Vec<(String, f64)>,
    /// Sum of every row.
    pub total: f64,
}

impl fmt::Display for AggregateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (identity, total) in &self.rows {
            writeln!(f, "{identity:<20} ${total:6.3}")?;
        }
        write!(f, "(sum = ${:6.3})", self.total)
    }
}

impl UsageLedger {
    /// Build the report for one identity.
    ///
    /// With `live` set, the identity's scope is reconciled first.
    ///
    /// # Errors
    ///
    /// Returns storage errors, and remote errors from the live refresh.
    pub async fn user_report(
        &self,
        identity: &str,
        cost: &CostModel,
        options: &ReportOptions,
        live: Option<&dyn ComputeProvider>,
        now: DateTime<Utc>,
    ) -> Result<UsageReport> {
        if let Some(compute) = live {
            self.reconcile(compute, &ReconcileScope::Identity(identity.to_owned()), now)
                .await?;
        }

        let window = &options.window;
        let mut running: BTreeMap<(bool, String), u64> = BTreeMap::new();
        let mut finished: BTreeMap<(bool, String), u64> = BTreeMap::new();
        for resource in self.resources_for(identity).await? {
            let end = resource.end_time.unwrap_or(now);
            if window.clip(resource.start_time, end).is_none() {
                continue;
            }
            let hours = self.resource_hours(&resource, end, window).await?;
            let bucket = if resource.end_time.is_some() {
                &mut finished
            } else {
                &mut running
            };
            let entry = bucket
                .entry((resource.is_spot, resource.instance_type))
                .or_insert(0);
            *entry = entry.saturating_add(hours);
        }

        let mut sections = Vec::new();
        if options.include_pending {
            let mut pending: BTreeMap<(bool, String), u64> = BTreeMap::new();
            if window.contains(now) {
                for request in self.pending_requests(identity).await? {
                    let entry = pending.entry((true, request.instance_type)).or_insert(0);
                    *entry = entry.saturating_add(1);
                }
            }
            if !pending.is_empty() {
                sections.push(ReportSection::build("Pending spot requests", pending, cost));
            }
            if !running.is_empty() {
                sections.push(ReportSection::build("Running instances", running, cost));
            }
        }
        sections.push(ReportSection::build("Finished instances", finished, cost));

        let total = sections.iter().map(|s| s.total).sum();
        Ok(UsageReport {
            identity: identity.to_owned(),
            sections,
            total,
        })
    }

    /// Totals for every identity in the ledger, without a live refresh.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn aggregate_report(
        &self,
        cost: &CostModel,
        window: &ReportWindow,
        now: DateTime<Utc>,
    ) -> Result<AggregateReport> {
        let options = ReportOptions {
            include_pending: true,
            window: *window,
        };
        let mut rows = Vec::new();
        let mut total = 0.0;
        for identity in self.usernames().await? {
            let report = self.user_report(&identity, cost, &options, None, now).await?;
            total += report.total;
            rows.push((identity, report.total));
        }
        Ok(AggregateReport { rows, total })
    }

    async fn resource_hours(
        &self,
        resource: &ResourceRecord,
        end: DateTime<Utc>,
        window: &ReportWindow,
    ) -> Result<u64> {
        let stops = self.stop_intervals(&resource.id).await?;
        Ok(billable_hours(resource.start_time, end, &stops, window))
    }
}
