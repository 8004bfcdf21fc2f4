// src/reconciler.rs
use chrono::{DateTime, FixedOffset};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use crate::model::{AnomalyKind, Channel, DailyStatus, NotificationKey, RowKey, SheetRow};

pub struct ReconcileInput<'a> {
    pub statuses: &'a [DailyStatus],
    /// Current sheet rows. Only rows matching a status key matter.
    pub snapshot: &'a [SheetRow],
    /// Keys already recorded as notified.
    pub logged: &'a HashSet<NotificationKey>,
    pub anomaly_kinds: &'a BTreeSet<AnomalyKind>,
    /// Enabled channels. Each channel is deduplicated on its own.
    pub channels: &'a [Channel],
    pub run_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyInstruction {
    pub key: NotificationKey,
    pub status: DailyStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Rows to upsert, in status order.
    pub writes: Vec<SheetRow>,
    pub notifications: Vec<NotifyInstruction>,
    /// Statuses whose row already matched.
    pub unchanged: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.notifications.is_empty()
    }
}

fn row_matches(row: &SheetRow, status: &DailyStatus) -> bool {
    row.status == status.status
        && row.minutes_late == status.minutes_late
        && row.name == status.individual_name
}

/// Computes the sheet writes and notifications a set of resolved statuses calls for.
/// No side effects: log records only become durable once the notifier confirms delivery.
pub fn reconcile(input: &ReconcileInput<'_>) -> ReconcilePlan {
    let mut existing: HashMap<RowKey, &SheetRow> = HashMap::with_capacity(input.snapshot.len());
    for row in input.snapshot {
        existing.entry(row.key()).or_insert(row);
    }

    let mut plan = ReconcilePlan::default();
    let mut seen: HashSet<RowKey> = HashSet::new();
    let mut pending: HashSet<NotificationKey> = HashSet::new();

    for status in input.statuses {
        let row_key = status.key();
        if !seen.insert(row_key.clone()) {
            warn!("Ignoring duplicate status for {}", row_key);
            continue;
        }

        match existing.get(&row_key) {
            Some(row) if row_matches(row, status) => plan.unchanged += 1,
            Some(row) => {
                debug!("{} changed: {} -> {}", row_key, row.status, status.status);
                plan.writes.push(SheetRow::from_status(status, input.run_at));
            }
            None => plan.writes.push(SheetRow::from_status(status, input.run_at)),
        }

        let Some(kind) = status.status.anomaly_kind() else {
            continue;
        };
        if !input.anomaly_kinds.contains(&kind) {
            continue;
        }
        for channel in input.channels.iter().filter(|c| c.carries(kind)) {
            let key = NotificationKey {
                individual_id: status.individual_id.clone(),
                date: status.date,
                kind,
                channel: *channel,
            };
            if input.logged.contains(&key) || !pending.insert(key.clone()) {
                continue;
            }
            plan.notifications.push(NotifyInstruction {
                key,
                status: status.clone(),
            });
        }
    }

    debug!(
        "Reconciled {} statuses: {} writes, {} unchanged, {} notifications",
        input.statuses.len(),
        plan.writes.len(),
        plan.unchanged,
        plan.notifications.len()
    );
    plan
}
