use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::schema::enum_def::ServiceType;

/// Which listener a request arrived on. Both serve the same API shape; they
/// differ only in which configs are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EndpointKind {
    General,
    Special,
}

/// A fully resolved route: decrypted key, defaulted base URL. Immutable once
/// built; requests hold an `Arc` to the one they resolved against.
#[derive(Debug)]
pub struct RouteTarget {
    pub config_id: i64,
    pub service_type: ServiceType,
    pub public_name: String,
    pub model_name: String,
    pub api_key: String,
    pub base_url: String,
    pub available_on_general: bool,
    pub available_on_special: bool,
    pub created_at: i64,
}

impl RouteTarget {
    pub fn visible_on(&self, kind: EndpointKind) -> bool {
        match kind {
            EndpointKind::General => self.available_on_general,
            EndpointKind::Special => self.available_on_special,
        }
    }
}

/// Immutable view of the enabled configs, indexed by public name.
#[derive(Default)]
pub struct ConfigSnapshot {
    by_public_name: HashMap<String, Arc<RouteTarget>>,
    built_at: i64,
}

impl ConfigSnapshot {
    pub fn new(targets: Vec<RouteTarget>, built_at: i64) -> Self {
        let by_public_name = targets
            .into_iter()
            .map(|t| (t.public_name.clone(), Arc::new(t)))
            .collect();
        ConfigSnapshot {
            by_public_name,
            built_at,
        }
    }

    pub fn resolve(&self, public_name: &str) -> Option<Arc<RouteTarget>> {
        self.by_public_name.get(public_name).cloned()
    }

    /// Targets visible on `kind`, oldest first (stable `/v1/models` order).
    pub fn visible(&self, kind: EndpointKind) -> Vec<Arc<RouteTarget>> {
        let mut targets: Vec<Arc<RouteTarget>> = self
            .by_public_name
            .values()
            .filter(|t| t.visible_on(kind))
            .cloned()
            .collect();
        targets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.config_id.cmp(&b.config_id)));
        targets
    }

    pub fn len(&self) -> usize {
        self.by_public_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_public_name.is_empty()
    }

    pub fn built_at(&self) -> i64 {
        self.built_at
    }
}

/// Atomically swappable snapshot pointer. Readers `load_full` once per
/// request and never contend with a concurrent reload.
pub struct SnapshotHandle {
    current: ArcSwap<ConfigSnapshot>,
}

impl SnapshotHandle {
    pub fn empty() -> Self {
        SnapshotHandle {
            current: ArcSwap::from_pointee(ConfigSnapshot::default()),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, snapshot: ConfigSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}
