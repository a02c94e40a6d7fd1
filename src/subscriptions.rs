use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, Weak};

use uuid::Uuid;

/// Delivered to observers once per merge pass: the kind that changed and the
/// ids affected in that pass.
#[derive(Clone, Debug)]
pub struct ChangeSet {
    pub kind: String,
    pub ids: Vec<String>,
}

impl ChangeSet {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }
}

type Callback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

struct SubscriptionEntry {
    id: String,
    kind: String,
    id_filter: Option<String>,
    callback: Callback,
}

/// Fan-out of store changes to interested observers. The registry owns the
/// callback list, never the data. Callbacks run synchronously in registration
/// order; a panicking observer is caught and logged so it cannot block the
/// others.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    entries: Arc<RwLock<Vec<SubscriptionEntry>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Registers a callback for a kind, optionally filtered to a single
    /// entity id. The returned guard unsubscribes on drop.
    pub fn subscribe(
        &self,
        kind: &str,
        id_filter: Option<&str>,
        callback: impl Fn(&ChangeSet) + Send + Sync + 'static,
    ) -> SubscriptionGuard {
        let subscription_id = Uuid::now_v7().to_string();
        let entry = SubscriptionEntry {
            id: subscription_id.clone(),
            kind: kind.to_string(),
            id_filter: id_filter.map(|s| s.to_string()),
            callback: Arc::new(callback),
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.push(entry);
        }
        SubscriptionGuard {
            subscription_id,
            entries: Arc::downgrade(&self.entries),
        }
    }

    /// Invokes all matching callbacks with one ChangeSet. Matching entries
    /// are snapshotted first so callbacks can subscribe or unsubscribe
    /// without deadlocking the registry.
    pub fn notify(&self, kind: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let change = ChangeSet {
            kind: kind.to_string(),
            ids: ids.to_vec(),
        };
        let matching: Vec<(String, Callback)> = match self.entries.read() {
            Ok(entries) => entries
                .iter()
                .filter(|entry| {
                    entry.kind == kind
                        && entry
                            .id_filter
                            .as_ref()
                            .map(|id| change.contains(id))
                            .unwrap_or(true)
                })
                .map(|entry| (entry.id.clone(), entry.callback.clone()))
                .collect(),
            Err(_) => return,
        };
        for (subscription_id, callback) in matching {
            if catch_unwind(AssertUnwindSafe(|| callback(&change))).is_err() {
                log::warn!(
                    "SUBSCRIPTION CALLBACK PANIC: id='{}' kind='{}'",
                    subscription_id,
                    kind
                );
            }
        }
    }

    pub fn observer_count(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its subscription on drop, or explicitly via unsubscribe().
pub struct SubscriptionGuard {
    subscription_id: String,
    entries: Weak<RwLock<Vec<SubscriptionEntry>>>,
}

impl SubscriptionGuard {
    pub fn unsubscribe(&self) {
        if let Some(entries) = self.entries.upgrade() {
            if let Ok(mut entries) = entries.write() {
                entries.retain(|entry| entry.id != self.subscription_id);
            }
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collect_into(sink: Arc<Mutex<Vec<ChangeSet>>>) -> impl Fn(&ChangeSet) + Send + Sync {
        move |change| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(change.clone());
            }
        }
    }

    #[test]
    fn notifies_matching_kind() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _guard = registry.subscribe("alert", None, collect_into(seen.clone()));

        registry.notify("alert", &["A1".to_string(), "A2".to_string()]);
        registry.notify("vehicle", &["V1".to_string()]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, "alert");
        assert_eq!(seen[0].ids, vec!["A1".to_string(), "A2".to_string()]);
    }

    #[test]
    fn id_filter_limits_delivery() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _guard = registry.subscribe("vehicle", Some("V2"), collect_into(seen.clone()));

        registry.notify("vehicle", &["V1".to_string()]);
        assert_eq!(seen.lock().unwrap().len(), 0);

        registry.notify("vehicle", &["V1".to_string(), "V2".to_string()]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        let _a = registry.subscribe("alert", None, move |_| first.lock().unwrap().push(1));
        let _b = registry.subscribe("alert", None, move |_| second.lock().unwrap().push(2));

        registry.notify("alert", &["A1".to_string()]);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _bad = registry.subscribe("alert", None, |_| panic!("observer bug"));
        let _good = registry.subscribe("alert", None, collect_into(seen.clone()));

        registry.notify("alert", &["A1".to_string()]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn guard_drop_unsubscribes() {
        let registry = SubscriptionRegistry::new();
        {
            let _guard = registry.subscribe("alert", None, |_| {});
            assert_eq!(registry.observer_count(), 1);
        }
        assert_eq!(registry.observer_count(), 0);
    }

    #[test]
    fn empty_change_set_is_not_delivered() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _guard = registry.subscribe("alert", None, collect_into(seen.clone()));
        registry.notify("alert", &[]);
        assert_eq!(seen.lock().unwrap().len(), 0);
    }
}
