//! Durable app-level flags.

use std::sync::Arc;

use margin_core::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{get_json, set_json, KvStore, Namespace, ScopedKey};

/// Set once the app has been installed to the home screen.
pub const INSTALLED_APP_FLAG: &str = "installed_app";

/// Small named values in the [`Namespace::AppFlags`] namespace.
#[derive(Clone)]
pub struct AppFlags {
    kv: Arc<dyn KvStore>,
}

impl AppFlags {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Unset flags read as false.
    pub async fn is_set(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.get_value::<bool>(name).await?.unwrap_or(false))
    }

    pub async fn set(&self, name: &str, value: bool) -> Result<(), StorageError> {
        self.set_value(name, &value).await
    }

    pub async fn get_value<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, StorageError> {
        get_json(self.kv.as_ref(), &ScopedKey::app_flags(name)).await
    }

    pub async fn set_value<T: Serialize + Sync>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        set_json(self.kv.as_ref(), &ScopedKey::app_flags(name), value).await
    }

    pub async fn clear(&self, name: &str) -> Result<(), StorageError> {
        self.kv.remove(&ScopedKey::app_flags(name)).await
    }

    pub async fn names(&self) -> Result<Vec<String>, StorageError> {
        self.kv.keys(Namespace::AppFlags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryKv;

    #[tokio::test]
    async fn test_flags_default_to_false() {
        let flags = AppFlags::new(Arc::new(InMemoryKv::new()));
        assert!(!flags.is_set(INSTALLED_APP_FLAG).await.unwrap());

        flags.set(INSTALLED_APP_FLAG, true).await.unwrap();
        assert!(flags.is_set(INSTALLED_APP_FLAG).await.unwrap());
        assert_eq!(flags.names().await.unwrap(), vec![INSTALLED_APP_FLAG]);

        flags.clear(INSTALLED_APP_FLAG).await.unwrap();
        assert!(!flags.is_set(INSTALLED_APP_FLAG).await.unwrap());
    }

    #[tokio::test]
    async fn test_structured_values() {
        let flags = AppFlags::new(Arc::new(InMemoryKv::new()));
        flags.set_value("active", &"local-1".to_string()).await.unwrap();
        let active: Option<String> = flags.get_value("active").await.unwrap();
        assert_eq!(active.as_deref(), Some("local-1"));
    }
}
