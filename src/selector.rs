use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::{error::PoolError, now_millis, preview_key, store::KeyStore};

/// 本次请求选中的 key；`id` 为 `None` 表示使用了池外的默认 key。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedKey {
    pub id: Option<String>,
    pub secret: String,
}

impl SelectedKey {
    pub fn is_pooled(&self) -> bool {
        self.id.is_some()
    }
}

/// Stateless selector: every call reads the active set fresh from the store and
/// draws uniformly at random.
#[derive(Debug, Clone)]
pub struct KeySelector {
    store: Arc<KeyStore>,
    default_key: Option<String>,
}

impl KeySelector {
    pub fn new(store: Arc<KeyStore>, default_key: Option<String>) -> Self {
        Self { store, default_key }
    }

    pub async fn select(&self, exclude_key: Option<&str>) -> Result<SelectedKey, PoolError> {
        let candidates = match self.store.active_key_candidates(exclude_key).await {
            Ok(candidates) => candidates,
            Err(err) if self.default_key.is_some() => {
                tracing::error!(error = %err, "active key lookup failed; using default key");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let picked = candidates.choose(&mut rand::thread_rng()).cloned();
        if let Some((id, secret)) = picked {
            // usage_count belongs to the usage recorder; selection only stamps recency.
            if let Err(err) = self.store.touch_key(&id, now_millis()).await {
                tracing::warn!(key = %preview_key(&secret), error = %err, "failed to stamp key usage time");
            }
            return Ok(SelectedKey {
                id: Some(id),
                secret,
            });
        }

        match &self.default_key {
            Some(secret) => {
                tracing::debug!("no active pooled key; falling back to default key");
                Ok(SelectedKey {
                    id: None,
                    secret: secret.clone(),
                })
            }
            None => Err(PoolError::NoAvailableKey),
        }
    }
}
