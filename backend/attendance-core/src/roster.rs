// src/roster.rs
use chrono::NaiveTime;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::model::{normalize_id, Individual, IndividualId, RawEvent};

/// Who gets tracked: people logging time to a tracked project, plus extras, minus exclusions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingRules {
    /// Lower-cased project names.
    pub projects: BTreeSet<String>,
    pub additional: BTreeSet<String>,
    pub excluded: BTreeSet<String>,
}

impl TrackingRules {
    pub fn new(projects: &[String], additional: &[String], excluded: &[String]) -> Self {
        let clean = |values: &[String]| -> BTreeSet<String> {
            values
                .iter()
                .map(|v| normalize_id(v))
                .filter(|v| !v.is_empty())
                .collect()
        };
        Self {
            projects: clean(projects),
            additional: clean(additional),
            excluded: clean(excluded),
        }
    }

    fn tracks_project(&self, project: Option<&str>) -> bool {
        project.is_some_and(|p| self.projects.contains(&normalize_id(p)))
    }
}

/// Selects the individuals to resolve, sorted by id.
///
/// With no tracked projects configured the whole roster is tracked. Additional ids
/// missing from the roster are still tracked, named by their id.
pub fn select_tracked(roster: &[Individual], events: &[RawEvent], rules: &TrackingRules) -> Vec<Individual> {
    let by_id: BTreeMap<&str, &Individual> = roster.iter().map(|i| (i.id.as_str(), i)).collect();

    let mut ids: BTreeSet<String> = if rules.projects.is_empty() {
        by_id.keys().map(|id| id.to_string()).collect()
    } else {
        events
            .iter()
            .filter(|e| rules.tracks_project(e.project.as_deref()))
            .map(|e| normalize_id(&e.individual_id))
            .collect()
    };
    ids.extend(rules.additional.iter().cloned());
    ids.retain(|id| !rules.excluded.contains(id));

    let tracked: Vec<Individual> = ids
        .into_iter()
        .map(|id| match by_id.get(id.as_str()) {
            Some(individual) => (*individual).clone(),
            None => Individual::new(&id, ""),
        })
        .collect();
    debug!("Tracking {} of {} roster entries", tracked.len(), roster.len());
    tracked
}

// --- Departments ---

/// A named group of projects with its own expected start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Department {
    pub name: String,
    /// Lower-cased project names.
    pub projects: BTreeSet<String>,
    /// Falls back to the default start when unset.
    pub start: Option<NaiveTime>,
}

impl Department {
    pub fn new(name: &str, projects: &[&str], start: Option<NaiveTime>) -> Self {
        Self {
            name: name.trim().to_string(),
            projects: projects
                .iter()
                .map(|p| normalize_id(p))
                .filter(|p| !p.is_empty())
                .collect(),
            start,
        }
    }

    fn owns(&self, project: Option<&str>) -> bool {
        project.is_some_and(|p| self.projects.contains(&normalize_id(p)))
    }
}

/// Maps each individual to the first configured department owning a project they
/// logged time to. Individuals without such a project are left out.
pub fn assign_departments(
    events: &[RawEvent],
    departments: &[Department],
) -> HashMap<IndividualId, String> {
    let mut ranks: HashMap<IndividualId, usize> = HashMap::new();
    for event in events {
        let Some(rank) = departments.iter().position(|d| d.owns(event.project.as_deref())) else {
            continue;
        };
        ranks
            .entry(normalize_id(&event.individual_id))
            .and_modify(|r| *r = (*r).min(rank))
            .or_insert(rank);
    }
    ranks
        .into_iter()
        .map(|(id, rank)| (id, departments[rank].name.clone()))
        .collect()
}
