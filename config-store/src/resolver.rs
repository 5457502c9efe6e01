//! Effective configuration over a scope hierarchy.
//!
//! Configs stored at different scopes (for example tenant, service, api)
//! are folded from the least to the most specific scope, so each scope
//! inherits whatever its ancestors set and overrides what it sets itself.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;

/// Scopes to fold for `scope`, least specific first and `scope` last.
pub trait ScopeHierarchy<S> {
    fn ancestry(&self, scope: &S) -> Vec<S>;
}

impl<S, F> ScopeHierarchy<S> for F
where
    F: Fn(&S) -> Vec<S>,
{
    fn ancestry(&self, scope: &S) -> Vec<S> {
        self(scope)
    }
}

/// Hierarchy encoded in the scope name, `"acme/payments/checkout"` having
/// ancestry `["acme", "acme/payments", "acme/payments/checkout"]`.
#[derive(Clone, Copy, Debug)]
pub struct PathHierarchy {
    pub separator: char,
}

impl Default for PathHierarchy {
    fn default() -> Self {
        PathHierarchy { separator: '/' }
    }
}

impl ScopeHierarchy<String> for PathHierarchy {
    fn ancestry(&self, scope: &String) -> Vec<String> {
        scope
            .match_indices(self.separator)
            .map(|(i, _)| scope[..i].to_string())
            .filter(|prefix| !prefix.is_empty())
            .chain(std::iter::once(scope.clone()))
            .collect()
    }
}

pub trait MergeStrategy<T> {
    fn merge(&self, fallback: &T, preferred: &T) -> T;
}

impl<T, F> MergeStrategy<T> for F
where
    F: Fn(&T, &T) -> T,
{
    fn merge(&self, fallback: &T, preferred: &T) -> T {
        self(fallback, preferred)
    }
}

/// Schema-free deep merge of config values, see [`crate::value::merge`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DeepMerge;

impl MergeStrategy<Value> for DeepMerge {
    fn merge(&self, fallback: &Value, preferred: &Value) -> Value {
        crate::value::merge(fallback, preferred)
    }
}

/// Deep merge for any serde type, going through its JSON form. `None`
/// fields serialize as null and therefore inherit.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerdeMerge;

impl<T> MergeStrategy<T> for SerdeMerge
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn merge(&self, fallback: &T, preferred: &T) -> T {
        let merged = serde_json::to_value(fallback)
            .and_then(|f| serde_json::to_value(preferred).map(|p| crate::value::merge(&f, &p)))
            .and_then(serde_json::from_value);
        match merged {
            Ok(merged) => merged,
            Err(e) => {
                tracing::error!(error = %e, "Failed to merge configs, using the preferred one");
                preferred.clone()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScopedConfig<S, T> {
    pub scope: S,
    pub data: T,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolvedConfig<S, T> {
    pub scope: S,
    pub data: T,
}

pub struct ScopeResolver<S, T, H, M> {
    hierarchy: H,
    strategy: M,
    default: Option<T>,
    _scope: PhantomData<fn(&S)>,
}

impl<S, T, H, M> ScopeResolver<S, T, H, M>
where
    S: Clone + Eq + Hash,
    T: Clone,
    H: ScopeHierarchy<S>,
    M: MergeStrategy<T>,
{
    pub fn new(hierarchy: H, strategy: M) -> Self {
        ScopeResolver {
            hierarchy,
            strategy,
            default: None,
            _scope: PhantomData,
        }
    }

    /// Lowest priority config, used even when no ancestor has a record.
    pub fn with_default(mut self, default: T) -> Self {
        self.default = Some(default);
        self
    }

    /// One resolved config per distinct scope present in `records`, in
    /// order of first appearance.
    pub fn resolve_all(&self, records: &[ScopedConfig<S, T>]) -> Vec<ResolvedConfig<S, T>> {
        let by_scope = index(records);
        let mut seen = HashSet::new();
        records
            .iter()
            .filter(|r| seen.insert(&r.scope))
            .filter_map(|r| self.resolve_indexed(&by_scope, &r.scope))
            .collect()
    }

    /// The effective config of `scope`, which need not have a record of its
    /// own. `None` when neither an ancestor nor a default provides one.
    pub fn resolve(
        &self,
        records: &[ScopedConfig<S, T>],
        scope: &S,
    ) -> Option<ResolvedConfig<S, T>> {
        self.resolve_indexed(&index(records), scope)
    }

    fn resolve_indexed(&self, by_scope: &HashMap<&S, &T>, scope: &S) -> Option<ResolvedConfig<S, T>> {
        let data = self
            .default
            .iter()
            .chain(
                self.hierarchy
                    .ancestry(scope)
                    .iter()
                    .filter_map(|ancestor| by_scope.get(ancestor).copied()),
            )
            .fold(None, |merged: Option<T>, preferred| match merged {
                Some(fallback) => Some(self.strategy.merge(&fallback, preferred)),
                None => Some(preferred.clone()),
            })?;

        Some(ResolvedConfig {
            scope: scope.clone(),
            data,
        })
    }
}

// Later records for the same scope win.
fn index<S: Eq + Hash, T>(records: &[ScopedConfig<S, T>]) -> HashMap<&S, &T> {
    records.iter().map(|r| (&r.scope, &r.data)).collect()
}
