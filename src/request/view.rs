//! JSON representation of a request
//!
//! The summary form carries counts; the verbose form adds the newest-first
//! state history and full package and dependency lists.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::{EnvVar, Flag, PackageManager, Request, RequestState, StateKind};
use crate::core::ErrorOrigin;
use crate::package::{Dependency, Package};

/// Package or dependency collection: a count or the full list.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Listing<T> {
    /// Summary mode
    Count(usize),
    /// Verbose mode
    Full(Vec<T>),
}

/// Serializable view of a [`Request`].
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub id: u64,
    pub created: DateTime<Utc>,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub pkg_managers: Vec<PackageManager>,
    pub flags: BTreeSet<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub state: Option<StateKind>,
    pub state_reason: String,
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_origin: Option<ErrorOrigin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub environment_variables: BTreeMap<String, EnvVar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_history: Option<Vec<RequestState>>,
    pub packages: Listing<Package>,
    pub dependencies: Listing<Dependency>,
}

impl RequestView {
    /// Build the view. `packages` are the request's resolved packages, as
    /// returned by the store.
    pub fn new(request: &Request, packages: &[Package], verbose: bool) -> Self {
        let current = request.current_state();
        let failed = request.state() == Some(StateKind::Failed);
        let failure = request.failure.as_ref().filter(|_| failed);

        let (state_history, packages_listing, dependencies_listing) = if verbose {
            let history = request.state_history.iter().rev().cloned().collect();
            let mut seen = BTreeSet::new();
            let mut dependencies: Vec<Dependency> = packages
                .iter()
                .flat_map(|p| p.dependencies.iter())
                .filter(|d| seen.insert((d.component.clone(), d.replaces.clone())))
                .cloned()
                .collect();
            dependencies.sort_by(|a, b| {
                a.component.cmp(&b.component).then_with(|| a.replaces.cmp(&b.replaces))
            });
            (Some(history), Listing::Full(packages.to_vec()), Listing::Full(dependencies))
        } else {
            (
                None,
                Listing::Count(request.packages_count()),
                Listing::Count(request.dependencies_count()),
            )
        };

        Self {
            id: request.id,
            created: request.created,
            repo: request.repo.clone(),
            git_ref: request.git_ref.clone(),
            pkg_managers: request.pkg_managers.clone(),
            flags: request.flags.clone(),
            user: request.user.clone(),
            state: current.map(|s| s.state),
            state_reason: current.map(|s| s.reason.clone()).unwrap_or_default(),
            updated: current.map(|s| s.updated),
            error_origin: failure.map(|f| f.origin),
            error_type: failure.map(|f| f.error_type.clone()),
            environment_variables: request.environment_variables.clone(),
            state_history,
            packages: packages_listing,
            dependencies: dependencies_listing,
        }
    }
}
