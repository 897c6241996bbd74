//! Terminal result of a store mutation.

use crate::{ErrorClass, SyncError, SyncResult};

/// What a store operation hands back to the UI.
///
/// Store operations never return `Err` or panic past the store boundary; the
/// failure travels inside the outcome instead, after any rollback has already
/// been applied.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct MutationOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<SyncError>,
}

impl<T> MutationOutcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<SyncError>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(SyncError::class)
    }

    pub fn into_result(self) -> SyncResult<Option<T>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MutationOutcome<U> {
        MutationOutcome {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
        }
    }
}

impl<T> From<SyncResult<T>> for MutationOutcome<T> {
    fn from(result: SyncResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RemoteError, ValidationError};

    #[test]
    fn test_failed_outcome_carries_class() {
        let outcome: MutationOutcome<()> = MutationOutcome::failed(RemoteError::network("down"));
        assert!(!outcome.is_success());
        assert_eq!(outcome.error_class(), Some(ErrorClass::Transient));
        assert!(outcome.into_result().is_err());
    }

    #[test]
    fn test_map_keeps_status() {
        let outcome = MutationOutcome::ok(2).map(|n| n * 10);
        assert_eq!(outcome.data, Some(20));
        assert!(outcome.success);

        let failed: MutationOutcome<i32> = MutationOutcome::failed(ValidationError::EmptyBatch);
        assert_eq!(failed.map(|n| n + 1).data, None);
    }
}
