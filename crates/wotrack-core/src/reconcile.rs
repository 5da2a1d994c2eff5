//! Reconciliation of spreadsheet status with application execution data.
//!
//! Everything here is pure: no I/O, no clocks. Callers pass the reference
//! civil date explicitly, which keeps the functions safe to call from any
//! number of readers at once.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::{
    ActorRef, CivilCalendar, CivilDate, ChildRecord, Execution, ExecutionState, Order,
    OrderBundle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLabel {
    Cancelled,
    Pending,
    Completed,
    NoExecutionPerformed,
    UnderReview,
}

impl StatusLabel {
    pub const ALL: [StatusLabel; 5] = [
        Self::Cancelled,
        Self::Pending,
        Self::Completed,
        Self::NoExecutionPerformed,
        Self::UnderReview,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::NoExecutionPerformed => "no_execution_performed",
            Self::UnderReview => "under_review",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Cancelled => "Cancelled",
            Self::Pending => "Pending",
            Self::Completed => "Completed",
            Self::NoExecutionPerformed => "No execution performed",
            Self::UnderReview => "Under review",
        }
    }

    /// Labels that count as "closed" for completed-today purposes.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::NoExecutionPerformed | Self::UnderReview
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

/// Case- and diacritic-insensitive match key: NFD, combining marks removed,
/// uppercased, whitespace collapsed.
pub fn normalize_for_match(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const CANCELLED_STATUSES: &[&str] = &["CANCELLED", "CANCELED", "CANCELADO", "CANCELADA"];

pub fn is_cancelled_status(raw_status: &str) -> bool {
    let normalized = normalize_for_match(raw_status);
    CANCELLED_STATUSES.contains(&normalized.as_str())
}

/// Built-in observation markers, in priority order.
const DEFAULT_MARKERS: &[(&str, StatusLabel)] = &[
    ("COMPLETED", StatusLabel::Completed),
    ("CONCLUÍDO", StatusLabel::Completed),
    ("CONCLUÍDA", StatusLabel::Completed),
    ("NO EXECUTION PERFORMED", StatusLabel::NoExecutionPerformed),
    ("NOT EXECUTED", StatusLabel::NoExecutionPerformed),
    ("NÃO EXECUTADO", StatusLabel::NoExecutionPerformed),
    ("NÃO EXECUTADA", StatusLabel::NoExecutionPerformed),
    ("UNDER REVIEW", StatusLabel::UnderReview),
    ("EM ANÁLISE", StatusLabel::UnderReview),
];

static DEFAULT_TABLE: LazyLock<MarkerTable> = LazyLock::new(MarkerTable::default);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationMarker {
    /// Stored already normalized.
    pub needle: String,
    pub label: StatusLabel,
}

/// Ordered decision table mapping observation substrings to labels.
/// The first marker found in the observation wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerTable {
    markers: Vec<ObservationMarker>,
}

impl Default for MarkerTable {
    fn default() -> Self {
        DEFAULT_MARKERS
            .iter()
            .fold(Self::empty(), |table, (needle, label)| {
                table.with_marker(needle, *label)
            })
    }
}

impl MarkerTable {
    pub fn empty() -> Self {
        Self {
            markers: Vec::new(),
        }
    }

    /// Append a marker after every existing one. Blank markers are ignored.
    pub fn with_marker(mut self, needle: &str, label: StatusLabel) -> Self {
        let needle = normalize_for_match(needle);
        if !needle.is_empty() {
            self.markers.push(ObservationMarker { needle, label });
        }
        self
    }

    pub fn markers(&self) -> &[ObservationMarker] {
        &self.markers
    }

    pub fn classify(&self, observation: &str) -> Option<StatusLabel> {
        let haystack = normalize_for_match(observation);
        self.markers
            .iter()
            .find(|marker| haystack.contains(&marker.needle))
            .map(|marker| marker.label)
    }
}

fn label_with(markers: &MarkerTable, raw_status: &str, execution: Option<&Execution>) -> StatusLabel {
    if is_cancelled_status(raw_status) {
        return StatusLabel::Cancelled;
    }
    let Some(execution) = execution else {
        return StatusLabel::Pending;
    };
    if let Some(label) = markers.classify(&execution.observation) {
        return label;
    }
    match execution.state {
        ExecutionState::Done => StatusLabel::Completed,
        ExecutionState::Pending => StatusLabel::Pending,
    }
}

/// Canonical label using the built-in marker table.
pub fn derive_status_label(raw_status: &str, execution: Option<&Execution>) -> StatusLabel {
    label_with(&DEFAULT_TABLE, raw_status, execution)
}

/// Completed-today check using the built-in marker table.
pub fn is_completed_today(
    order: &Order,
    execution: Option<&Execution>,
    reference: &CivilDate,
    calendar: &CivilCalendar,
) -> bool {
    Reconciler::new(*calendar).is_completed_today(order, execution, reference)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChildSummary {
    pub total: usize,
    pub done: usize,
    pub completed_today: usize,
}

/// Display-ready merge of an order with its execution and child records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedOrder {
    pub id: Uuid,
    pub external_code: String,
    pub raw_status: String,
    pub label: StatusLabel,
    pub label_text: String,
    pub is_completed_today: bool,
    pub completion_date: Option<CivilDate>,
    pub execution_state: Option<ExecutionState>,
    pub observation: Option<String>,
    pub owner: Option<ActorRef>,
    pub last_activity: DateTime<Utc>,
    pub children: ChildSummary,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub reference: CivilDate,
    pub total: usize,
    pub completed_today: usize,
    pub by_label: BTreeMap<StatusLabel, usize>,
}

pub fn summarize(reference: &CivilDate, orders: &[EnrichedOrder]) -> DailySummary {
    let mut by_label: BTreeMap<StatusLabel, usize> =
        StatusLabel::ALL.into_iter().map(|label| (label, 0)).collect();
    for order in orders {
        *by_label.entry(order.label).or_default() += 1;
    }
    DailySummary {
        reference: reference.clone(),
        total: orders.len(),
        completed_today: orders.iter().filter(|o| o.is_completed_today).count(),
        by_label,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    markers: MarkerTable,
    calendar: CivilCalendar,
}

impl Reconciler {
    pub fn new(calendar: CivilCalendar) -> Self {
        Self {
            markers: MarkerTable::default(),
            calendar,
        }
    }

    pub fn with_markers(mut self, markers: MarkerTable) -> Self {
        self.markers = markers;
        self
    }

    pub fn calendar(&self) -> &CivilCalendar {
        &self.calendar
    }

    pub fn today(&self, now: DateTime<Utc>) -> CivilDate {
        self.calendar.today(now)
    }

    pub fn label(&self, raw_status: &str, execution: Option<&Execution>) -> StatusLabel {
        label_with(&self.markers, raw_status, execution)
    }

    pub fn is_spreadsheet_today(&self, order: &Order, reference: &CivilDate) -> bool {
        if !order.has_completion_date() {
            return false;
        }
        self.calendar
            .normalize(&order.completion_date_text)
            .is_some_and(|day| &day == reference)
    }

    pub fn is_application_today(
        &self,
        order: &Order,
        execution: Option<&Execution>,
        reference: &CivilDate,
    ) -> bool {
        let Some(execution) = execution else {
            return false;
        };
        &self.calendar.civil_date_of(execution.last_modified) == reference
            && self.label(&order.raw_status, Some(execution)).is_closed()
    }

    pub fn is_completed_today(
        &self,
        order: &Order,
        execution: Option<&Execution>,
        reference: &CivilDate,
    ) -> bool {
        self.is_spreadsheet_today(order, reference)
            || self.is_application_today(order, execution, reference)
    }

    fn child_summary(&self, children: &[ChildRecord], reference: &CivilDate) -> ChildSummary {
        children.iter().fold(ChildSummary::default(), |mut acc, child| {
            acc.total += 1;
            if child.state == ExecutionState::Done {
                acc.done += 1;
                if self
                    .calendar
                    .normalize(&child.completion_date_text)
                    .is_some_and(|day| &day == reference)
                {
                    acc.completed_today += 1;
                }
            }
            acc
        })
    }

    pub fn enrich(&self, bundle: &OrderBundle, reference: &CivilDate) -> EnrichedOrder {
        let order = &bundle.order;
        let execution = bundle.execution.as_ref();
        let label = self.label(&order.raw_status, execution);
        let last_activity = execution
            .map(|e| e.last_modified.max(order.last_modified))
            .unwrap_or(order.last_modified);

        EnrichedOrder {
            id: order.id,
            external_code: order.external_code.clone(),
            raw_status: order.raw_status.clone(),
            label,
            label_text: label.display_name().to_string(),
            is_completed_today: self.is_completed_today(order, execution, reference),
            completion_date: self.calendar.normalize(&order.completion_date_text),
            execution_state: execution.map(|e| e.state),
            observation: execution
                .map(|e| e.observation.trim().to_string())
                .filter(|o| !o.is_empty()),
            owner: execution.and_then(|e| e.owner),
            last_activity,
            children: self.child_summary(&bundle.children, reference),
            attributes: order.attributes.clone(),
        }
    }

    pub fn enrich_all(&self, bundles: &[OrderBundle], reference: &CivilDate) -> Vec<EnrichedOrder> {
        bundles.iter().map(|b| self.enrich(b, reference)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NO_DATE_MARKER;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    fn order(raw_status: &str, completion: &str) -> Order {
        Order {
            id: Uuid::new_v4(),
            external_code: "OS-100".into(),
            raw_status: raw_status.into(),
            completion_date_text: completion.into(),
            attributes: BTreeMap::new(),
            last_modified: at(2024, 3, 1, 12, 0),
        }
    }

    fn execution(order: &Order, state: ExecutionState, observation: &str, last_modified: DateTime<Utc>) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            order_id: order.id,
            owner: Some(ActorRef::Team(Uuid::nil())),
            state,
            observation: observation.into(),
            last_modified,
        }
    }

    // 05/03/2024 in America/Sao_Paulo
    fn today() -> CivilDate {
        CivilCalendar::default().civil_date_of(at(2024, 3, 5, 15, 0))
    }

    #[test]
    fn label_is_deterministic() {
        let o = order("IN_PROGRESS", NO_DATE_MARKER);
        let e = execution(&o, ExecutionState::Pending, "em análise pelo supervisor", at(2024, 3, 5, 15, 0));
        let first = derive_status_label(&o.raw_status, Some(&e));
        for _ in 0..10 {
            assert_eq!(derive_status_label(&o.raw_status, Some(&e)), first);
        }
        assert_eq!(first, StatusLabel::UnderReview);
    }

    #[test]
    fn cancelled_wins_over_any_execution() {
        let o = order("CANCELLED", NO_DATE_MARKER);
        let e = execution(&o, ExecutionState::Done, "Status: Completed", at(2024, 3, 5, 15, 0));
        for raw in ["CANCELLED", "cancelled", " Cancelled ", "Cancelléd", "CANCELADO", "cancelada"] {
            assert_eq!(derive_status_label(raw, Some(&e)), StatusLabel::Cancelled, "{raw}");
            assert_eq!(derive_status_label(raw, None), StatusLabel::Cancelled, "{raw}");
        }
        assert_ne!(derive_status_label("NOT CANCELLED YET", None), StatusLabel::Cancelled);
    }

    #[test]
    fn absent_execution_is_pending() {
        for raw in ["OPEN", "IN_PROGRESS", "DONE", ""] {
            assert_eq!(derive_status_label(raw, None), StatusLabel::Pending);
        }
    }

    #[test]
    fn markers_follow_table_priority() {
        let o = order("OPEN", NO_DATE_MARKER);
        let e = |obs: &str| execution(&o, ExecutionState::Pending, obs, at(2024, 3, 5, 15, 0));
        assert_eq!(derive_status_label("OPEN", Some(&e("Completed; was under review"))), StatusLabel::Completed);
        assert_eq!(
            derive_status_label("OPEN", Some(&e("under review: no execution performed"))),
            StatusLabel::NoExecutionPerformed
        );
        assert_eq!(derive_status_label("OPEN", Some(&e("UNDER   REVIEW"))), StatusLabel::UnderReview);
    }

    #[test]
    fn markers_ignore_case_and_accents() {
        let o = order("OPEN", NO_DATE_MARKER);
        let e = |obs: &str| execution(&o, ExecutionState::Pending, obs, at(2024, 3, 5, 15, 0));
        assert_eq!(derive_status_label("OPEN", Some(&e("serviço concluido"))), StatusLabel::Completed);
        assert_eq!(derive_status_label("OPEN", Some(&e("SERVIÇO CONCLUÍDO"))), StatusLabel::Completed);
        assert_eq!(derive_status_label("OPEN", Some(&e("nao executado - cliente ausente"))), StatusLabel::NoExecutionPerformed);
        assert_eq!(derive_status_label("OPEN", Some(&e("Em Analise"))), StatusLabel::UnderReview);
    }

    #[test]
    fn unmarked_observation_falls_back_to_state() {
        let o = order("OPEN", NO_DATE_MARKER);
        let done = execution(&o, ExecutionState::Done, "all good", at(2024, 3, 5, 15, 0));
        let pending = execution(&o, ExecutionState::Pending, "", at(2024, 3, 5, 15, 0));
        assert_eq!(derive_status_label("OPEN", Some(&done)), StatusLabel::Completed);
        assert_eq!(derive_status_label("OPEN", Some(&pending)), StatusLabel::Pending);
    }

    #[test]
    fn extension_markers_are_appended_after_builtins() {
        let table = MarkerTable::default().with_marker("aguardando peça", StatusLabel::UnderReview);
        let reconciler = Reconciler::default().with_markers(table);
        let o = order("OPEN", NO_DATE_MARKER);
        let e = execution(&o, ExecutionState::Pending, "Aguardando peca do fornecedor", at(2024, 3, 5, 15, 0));
        assert_eq!(reconciler.label("OPEN", Some(&e)), StatusLabel::UnderReview);
        assert_eq!(derive_status_label("OPEN", Some(&e)), StatusLabel::Pending);
        assert!(MarkerTable::empty().with_marker("  ", StatusLabel::Completed).markers().is_empty());
    }

    #[test]
    fn in_progress_with_completed_observation_today() {
        let cal = CivilCalendar::default();
        let o = order("IN_PROGRESS", NO_DATE_MARKER);
        let e = execution(&o, ExecutionState::Pending, "Status: Completed", at(2024, 3, 5, 22, 0));
        assert_eq!(derive_status_label(&o.raw_status, Some(&e)), StatusLabel::Completed);
        assert!(is_completed_today(&o, Some(&e), &today(), &cal));
    }

    #[test]
    fn cancelled_done_uses_only_spreadsheet_date() {
        let cal = CivilCalendar::default();
        let o = order("CANCELLED", NO_DATE_MARKER);
        let e = execution(&o, ExecutionState::Done, "", at(2024, 3, 5, 15, 0));
        assert_eq!(derive_status_label(&o.raw_status, Some(&e)), StatusLabel::Cancelled);
        assert!(!is_completed_today(&o, Some(&e), &today(), &cal));

        let o = order("CANCELLED", "05/03/2024");
        assert!(is_completed_today(&o, Some(&e), &today(), &cal));
    }

    #[test]
    fn spreadsheet_date_counts_without_execution() {
        let cal = CivilCalendar::default();
        assert!(is_completed_today(&order("OPEN", "05/03/2024"), None, &today(), &cal));
        assert!(!is_completed_today(&order("OPEN", "04/03/2024"), None, &today(), &cal));
        assert!(!is_completed_today(&order("OPEN", "-"), None, &today(), &cal));
        // 2024-03-06T01:00Z is still the 5th in Sao Paulo
        assert!(is_completed_today(&order("OPEN", "2024-03-06T01:00:00Z"), None, &today(), &cal));
    }

    #[test]
    fn application_side_needs_closed_label_and_same_civil_day() {
        let cal = CivilCalendar::default();
        let o = order("OPEN", NO_DATE_MARKER);
        let review = execution(&o, ExecutionState::Pending, "under review", at(2024, 3, 6, 2, 30));
        assert!(is_completed_today(&o, Some(&review), &today(), &cal));

        let pending = execution(&o, ExecutionState::Pending, "waiting", at(2024, 3, 5, 15, 0));
        assert!(!is_completed_today(&o, Some(&pending), &today(), &cal));

        let yesterday = execution(&o, ExecutionState::Done, "", at(2024, 3, 5, 2, 0));
        assert!(!is_completed_today(&o, Some(&yesterday), &today(), &cal));
    }

    #[test]
    fn enrich_fills_display_fields_and_child_summary() {
        let reconciler = Reconciler::default();
        let o = order("IN_PROGRESS", "2024-03-05");
        let e = execution(&o, ExecutionState::Done, "  ", at(2024, 3, 5, 15, 0));
        let children = vec![
            ChildRecord {
                id: Uuid::new_v4(),
                order_id: o.id,
                label: "BOX-1".into(),
                state: ExecutionState::Done,
                completion_date_text: "05/03/2024".into(),
            },
            ChildRecord {
                id: Uuid::new_v4(),
                order_id: o.id,
                label: "BOX-2".into(),
                state: ExecutionState::Done,
                completion_date_text: "01/03/2024".into(),
            },
            ChildRecord {
                id: Uuid::new_v4(),
                order_id: o.id,
                label: "BOX-3".into(),
                state: ExecutionState::Pending,
                completion_date_text: "-".into(),
            },
        ];
        let bundle = OrderBundle {
            order: o.clone(),
            execution: Some(e.clone()),
            children,
        };

        let enriched = reconciler.enrich(&bundle, &today());
        assert_eq!(enriched.label, StatusLabel::Completed);
        assert_eq!(enriched.label_text, "Completed");
        assert!(enriched.is_completed_today);
        assert_eq!(enriched.completion_date.as_ref().unwrap(), "05/03/2024");
        assert_eq!(enriched.observation, None);
        assert_eq!(enriched.last_activity, e.last_modified);
        assert_eq!(
            enriched.children,
            ChildSummary {
                total: 3,
                done: 2,
                completed_today: 1
            }
        );
    }

    #[test]
    fn summary_counts_every_label() {
        let reconciler = Reconciler::default();
        let pending = OrderBundle {
            order: order("OPEN", NO_DATE_MARKER),
            execution: None,
            children: vec![],
        };
        let cancelled = OrderBundle {
            order: order("CANCELADO", "05/03/2024"),
            execution: None,
            children: vec![],
        };
        let enriched = reconciler.enrich_all(&[pending, cancelled], &today());
        let summary = summarize(&today(), &enriched);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed_today, 1);
        assert_eq!(summary.by_label[&StatusLabel::Pending], 1);
        assert_eq!(summary.by_label[&StatusLabel::Cancelled], 1);
        assert_eq!(summary.by_label[&StatusLabel::UnderReview], 0);
    }

    #[test]
    fn label_parses_from_query_strings() {
        assert_eq!(StatusLabel::parse("under_review"), Some(StatusLabel::UnderReview));
        assert_eq!(StatusLabel::parse("COMPLETED"), Some(StatusLabel::Completed));
        assert_eq!(StatusLabel::parse("done"), None);
    }
}
