//! Active Pipeline Index
//!
//! For each pipeline name, the set of instance ids that should appear as
//! currently running. Built once from storage at startup and then kept up
//! to date from committed stage transitions.
//!
//! The newest known instance of a name is always kept, even after it
//! finishes, so there is something to show for the pipeline. An older
//! instance is kept while any of its stages is still active. When in
//! doubt an entry is kept: an extra entry is harmless, a missing one
//! hides a running pipeline.

use baton_core::domain::name::PipelineName;
use baton_core::domain::stage::StageInstance;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::StoreError;
use crate::repository::PersistenceStore;
use crate::sync::KeyedMutex;

type Index = BTreeMap<PipelineName, BTreeSet<i64>>;

pub struct ActivePipelineIndex {
    state: RwLock<Option<Index>>,
    sections: KeyedMutex<PipelineName>,
}

/// Point-in-time copy of the index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivePipelinesSnapshot {
    pipelines: Index,
}

impl ActivePipelinesSnapshot {
    pub fn names(&self) -> impl Iterator<Item = &PipelineName> {
        self.pipelines.keys()
    }

    /// Instance ids of one pipeline, newest first
    pub fn ids_for(&self, name: &PipelineName) -> Vec<i64> {
        self.pipelines
            .get(name)
            .map(|ids| ids.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    /// Every instance id across pipelines, newest first
    pub fn ids_newest_first(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.pipelines.values().flatten().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    pub fn contains(&self, name: &PipelineName, id: i64) -> bool {
        self.pipelines.get(name).is_some_and(|ids| ids.contains(&id))
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Number of pipeline names
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }
}

impl ActivePipelineIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            sections: KeyedMutex::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Rebuilds the index from every instance storage reports as active
    ///
    /// Returns the number of instances indexed.
    pub fn rebuild(&self, store: &dyn PersistenceStore) -> Result<usize, StoreError> {
        let rows = store.query_active_instance_ids()?;
        let count = rows.len();

        let mut index = Index::new();
        for (name, id) in rows {
            index.entry(name).or_default().insert(id);
        }
        let pipelines = index.len();

        *self.state.write() = Some(index);
        tracing::info!(pipelines, instances = count, "Active pipeline index built");
        Ok(count)
    }

    /// Applies a committed stage transition
    ///
    /// `is_instance_active` reports whether an instance still has an active
    /// stage. A failed lookup keeps the entry in question. Transitions of one
    /// pipeline name are applied one at a time, lookup included, so the
    /// lookup must not feed a transition of the same name back into the
    /// index. Before [`rebuild`](Self::rebuild) has run this does nothing.
    pub fn on_stage_transition<F>(&self, stage: &StageInstance, is_instance_active: F)
    where
        F: Fn(i64) -> Result<bool, StoreError>,
    {
        let name = stage.pipeline_name();
        let id = stage.pipeline_id;
        let _section = self.sections.lock(name.clone());

        if stage.is_active() {
            let latest = match self.latest(name) {
                Some(Some(latest)) => Some(latest),
                Some(None) => None,
                None => return,
            };
            let retire = latest
                .filter(|&latest| latest < id)
                .filter(|&latest| !probe(&is_instance_active, latest));

            let mut state = self.state.write();
            let Some(index) = state.as_mut() else {
                return;
            };
            let ids = index.entry(name.clone()).or_default();
            if let Some(superseded) = retire {
                if ids.last() == Some(&superseded) {
                    ids.remove(&superseded);
                    tracing::debug!(pipeline = %name, superseded, by = id, "Retired finished instance");
                } else {
                    tracing::debug!(pipeline = %name, superseded, "Newest instance changed, keeping entry");
                }
            }
            ids.insert(id);
        } else {
            let newest = match self.latest(name) {
                Some(newest) => newest,
                None => return,
            };
            if newest == Some(id) || newest.is_none() {
                return;
            }
            if probe(&is_instance_active, id) {
                return;
            }

            let mut state = self.state.write();
            let Some(index) = state.as_mut() else {
                return;
            };
            if let Some(ids) = index.get_mut(name) {
                if ids.last() != Some(&id) && ids.remove(&id) {
                    tracing::debug!(pipeline = %name, instance = id, "Removed finished instance");
                }
            }
        }
    }

    pub fn snapshot(&self) -> ActivePipelinesSnapshot {
        ActivePipelinesSnapshot {
            pipelines: self.state.read().clone().unwrap_or_default(),
        }
    }

    /// Forgets everything; the next [`rebuild`](Self::rebuild) starts over
    pub fn clear(&self) {
        *self.state.write() = None;
    }

    // None when uninitialized, Some(None) when the name has no entries.
    fn latest(&self, name: &PipelineName) -> Option<Option<i64>> {
        let state = self.state.read();
        let index = state.as_ref()?;
        Some(index.get(name).and_then(|ids| ids.last().copied()))
    }
}

impl Default for ActivePipelineIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn probe<F>(is_instance_active: &F, id: i64) -> bool
where
    F: Fn(i64) -> Result<bool, StoreError>,
{
    match is_instance_active(id) {
        Ok(active) => active,
        Err(err) => {
            tracing::warn!(instance = id, error = %err, "Activity lookup failed, keeping instance");
            true
        }
    }
}
