//! Subscription registry and persistence.

use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::{DeliveryConfig, SubscriptionConfig};
use crate::delivery::error::SubscriptionError;
use crate::delivery::types::{Subscription, SubscriptionPatch};
use crate::observability::metrics;

/// Check that `url` is an absolute http(s) URL and `events` is non-empty.
pub fn validate_subscription(url: &str, events: &[String]) -> Result<(), SubscriptionError> {
    let parsed = url::Url::parse(url).map_err(|e| SubscriptionError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SubscriptionError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(SubscriptionError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    if events.iter().all(|e| e.trim().is_empty()) {
        return Err(SubscriptionError::NoEvents);
    }
    Ok(())
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("whsec_{}", hex::encode(bytes))
}

fn event_set(events: &[String]) -> BTreeSet<String> {
    events
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

/// Thread-safe store of subscriptions, optionally backed by a JSON file.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    inner: DashMap<String, Subscription>,
    persistence_path: Option<PathBuf>,
    default_timeout_ms: u64,
    default_retry_count: u32,
}

impl SubscriptionRegistry {
    /// Empty registry using `config` for defaults and persistence.
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            inner: DashMap::new(),
            persistence_path: config.subscriptions_file.as_ref().map(PathBuf::from),
            default_timeout_ms: config.default_timeout_ms,
            default_retry_count: config.default_retry_count,
        }
    }

    /// Registry pre-filled from the subscriptions file, if it exists.
    pub fn load(config: &DeliveryConfig) -> Result<Self, SubscriptionError> {
        let registry = Self::new(config);
        if let Some(path) = registry.persistence_path.as_deref().filter(|p| p.exists()) {
            let reader = BufReader::new(File::open(path)?);
            let subscriptions: Vec<Subscription> = serde_json::from_reader(reader)?;
            for sub in subscriptions {
                registry.inner.insert(sub.id.clone(), sub);
            }
            tracing::info!(path = %path.display(), count = registry.inner.len(), "Loaded subscriptions");
            registry.publish_count();
        }
        Ok(registry)
    }

    /// Write every subscription, deleted ones included, to the subscriptions file.
    pub fn save(&self) -> Result<(), SubscriptionError> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        self.save_to(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SubscriptionError> {
        let mut all: Vec<Subscription> = self.inner.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let tmp = path.with_extension("tmp");
        {
            let writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(writer, &all)?;
        }
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), count = all.len(), "Saved subscriptions");
        Ok(())
    }

    pub fn register(&self, config: SubscriptionConfig) -> Result<Subscription, SubscriptionError> {
        validate_subscription(&config.url, &config.events)?;
        let id = config
            .id
            .unwrap_or_else(|| format!("sub_{}", Uuid::new_v4().simple()));

        let subscription = Subscription {
            id: id.clone(),
            url: config.url,
            secret: config.secret.unwrap_or_else(generate_secret),
            events: event_set(&config.events),
            enabled: config.enabled,
            retry_count: config.retry_count.unwrap_or(self.default_retry_count),
            timeout_ms: config.timeout_ms.unwrap_or(self.default_timeout_ms),
            rate_limit: config.rate_limit,
            failure_count: 0,
            last_triggered_at: None,
            last_status: None,
            created_at: Utc::now(),
            deleted_at: None,
        };

        match self.inner.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(SubscriptionError::Duplicate(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(subscription.clone());
            }
        }

        tracing::info!(subscription_id = %id, url = %subscription.url, "Subscription registered");
        self.publish_count();
        Ok(subscription)
    }

    pub fn update(&self, id: &str, patch: SubscriptionPatch) -> Result<Subscription, SubscriptionError> {
        if let Some(url) = &patch.url {
            validate_subscription(url, &["_".to_string()])?;
        }
        if let Some(events) = &patch.events {
            if event_set(events).is_empty() {
                return Err(SubscriptionError::NoEvents);
            }
        }

        let mut entry = self
            .inner
            .get_mut(id)
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;

        let sub = entry.value_mut();
        if let Some(url) = patch.url {
            sub.url = url;
        }
        if let Some(secret) = patch.secret {
            sub.secret = secret;
        }
        if let Some(events) = patch.events {
            sub.events = event_set(&events);
        }
        if let Some(enabled) = patch.enabled {
            sub.enabled = enabled;
        }
        if let Some(retry_count) = patch.retry_count {
            sub.retry_count = retry_count;
        }
        if let Some(timeout_ms) = patch.timeout_ms {
            sub.timeout_ms = timeout_ms;
        }
        if let Some(rate_limit) = patch.rate_limit {
            sub.rate_limit = Some(rate_limit);
        }

        tracing::info!(subscription_id = %id, "Subscription updated");
        let updated = sub.clone();
        drop(entry);
        self.publish_count();
        Ok(updated)
    }

    /// Soft delete: the subscription stops matching but stays readable by id.
    pub fn remove(&self, id: &str) -> Result<Subscription, SubscriptionError> {
        let mut entry = self
            .inner
            .get_mut(id)
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;
        entry.deleted_at = Some(Utc::now());
        entry.enabled = false;
        let removed = entry.clone();
        drop(entry);

        tracing::info!(subscription_id = %id, "Subscription removed");
        self.publish_count();
        Ok(removed)
    }

    /// Any subscription by id, deleted ones included.
    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.inner.get(id).map(|r| r.value().clone())
    }

    /// Live subscriptions, oldest first.
    pub fn list(&self) -> Vec<Subscription> {
        let mut live: Vec<Subscription> = self
            .inner
            .iter()
            .filter(|r| !r.is_deleted())
            .map(|r| r.value().clone())
            .collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        live
    }

    /// Subscriptions that should receive `event_type`.
    pub fn matching(&self, event_type: &str) -> Vec<Subscription> {
        self.list().into_iter().filter(|s| s.matches(event_type)).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.iter().filter(|r| !r.is_deleted()).count()
    }

    /// Stamp `last_triggered_at` for an attempt that is about to run.
    pub fn mark_attempt(&self, id: &str) {
        if let Some(mut sub) = self.inner.get_mut(id) {
            sub.last_triggered_at = Some(Utc::now());
        }
    }

    pub fn mark_success(&self, id: &str) {
        if let Some(mut sub) = self.inner.get_mut(id) {
            sub.failure_count = 0;
            sub.last_status = Some("success".to_string());
        }
    }

    pub fn mark_failure(&self, id: &str, label: &str) {
        if let Some(mut sub) = self.inner.get_mut(id) {
            sub.failure_count += 1;
            sub.last_status = Some(label.to_string());
        }
    }

    fn publish_count(&self) {
        metrics::record_subscriptions(self.count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(&DeliveryConfig::default())
    }

    fn config(url: &str, events: &[&str]) -> SubscriptionConfig {
        SubscriptionConfig {
            url: url.to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_register_applies_defaults() {
        let reg = registry();
        let sub = reg.register(config("https://example.com/hook", &["a"])).unwrap();
        assert!(sub.id.starts_with("sub_"));
        assert!(sub.secret.starts_with("whsec_"));
        assert_eq!(sub.retry_count, 3);
        assert_eq!(sub.timeout_ms, 5000);
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn test_rejects_bad_input() {
        let reg = registry();
        assert!(matches!(
            reg.register(config("not a url", &["a"])),
            Err(SubscriptionError::InvalidUrl { .. })
        ));
        assert!(matches!(
            reg.register(config("ftp://example.com", &["a"])),
            Err(SubscriptionError::InvalidUrl { .. })
        ));
        assert!(matches!(
            reg.register(config("https://example.com", &[" "])),
            Err(SubscriptionError::NoEvents)
        ));

        let mut fixed = config("https://example.com", &["a"]);
        fixed.id = Some("billing".into());
        reg.register(fixed.clone()).unwrap();
        assert!(matches!(reg.register(fixed), Err(SubscriptionError::Duplicate(_))));
    }

    #[test]
    fn test_update_patches_fields() {
        let reg = registry();
        let sub = reg.register(config("https://example.com/hook", &["a"])).unwrap();
        let updated = reg
            .update(
                &sub.id,
                SubscriptionPatch {
                    events: Some(vec!["b".into(), "c".into()]),
                    enabled: Some(false),
                    rate_limit: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.events.len(), 2);
        assert!(!updated.enabled);
        assert_eq!(updated.rate_limit, Some(5));
        assert_eq!(updated.url, sub.url);

        assert!(matches!(
            reg.update("missing", SubscriptionPatch::default()),
            Err(SubscriptionError::NotFound(_))
        ));
    }

    #[test]
    fn test_soft_delete_keeps_record() {
        let reg = registry();
        let sub = reg.register(config("https://example.com/hook", &["*"])).unwrap();
        reg.remove(&sub.id).unwrap();

        assert!(reg.list().is_empty());
        assert!(reg.matching("anything").is_empty());
        assert!(reg.get(&sub.id).unwrap().is_deleted());
        assert!(matches!(reg.remove(&sub.id), Err(SubscriptionError::NotFound(_))));
    }

    #[test]
    fn test_matching_filters_disabled_and_other_events() {
        let reg = registry();
        reg.register(config("https://a.example.com", &["agent.completed"])).unwrap();
        reg.register(config("https://b.example.com", &["trade.executed"])).unwrap();
        let mut disabled = config("https://c.example.com", &["agent.completed"]);
        disabled.enabled = false;
        reg.register(disabled).unwrap();

        let hits = reg.matching("agent.completed");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://a.example.com");
    }

    #[test]
    fn test_status_tracking() {
        let reg = registry();
        let sub = reg.register(config("https://example.com", &["a"])).unwrap();
        reg.mark_attempt(&sub.id);
        reg.mark_failure(&sub.id, "error_500");
        reg.mark_failure(&sub.id, "error_timeout");
        let failed = reg.get(&sub.id).unwrap();
        assert_eq!(failed.failure_count, 2);
        assert_eq!(failed.last_status.as_deref(), Some("error_timeout"));
        assert!(failed.last_triggered_at.is_some());

        reg.mark_success(&sub.id);
        let ok = reg.get(&sub.id).unwrap();
        assert_eq!(ok.failure_count, 0);
        assert_eq!(ok.last_status.as_deref(), Some("success"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.json");
        let delivery = DeliveryConfig {
            subscriptions_file: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };

        let reg = SubscriptionRegistry::new(&delivery);
        let kept = reg.register(config("https://example.com/a", &["a"])).unwrap();
        let gone = reg.register(config("https://example.com/b", &["b"])).unwrap();
        reg.remove(&gone.id).unwrap();
        reg.save().unwrap();

        let restored = SubscriptionRegistry::load(&delivery).unwrap();
        assert_eq!(restored.list(), vec![kept]);
        assert!(restored.get(&gone.id).unwrap().is_deleted());
    }

    #[test]
    fn test_load_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = DeliveryConfig {
            subscriptions_file: Some(dir.path().join("none.json").to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert_eq!(SubscriptionRegistry::load(&delivery).unwrap().count(), 0);
    }
}
