use std::sync::Arc;

/// Error type for cache operations.
///
/// Cloneable so a single deduplicated fetch result can be handed to every
/// waiter on the same key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// A backing-store or tier operation failed.
    #[error("[{tier}] cache error for key '{key}': {message}")]
    Operation {
        tier: String,
        key: String,
        message: String,
    },
    /// No healthy backing node is reachable right now.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// A backing-store call exceeded its configured timeout.
    #[error("{op} timed out for key '{key}'")]
    Timeout { op: &'static str, key: String },
    /// The connected node rejected a write because it is no longer the primary.
    #[error("connected node is read-only: {0}")]
    ReadOnly(String),
    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The origin fetch function failed.
    #[error("origin fetch for key '{key}' failed: {source}")]
    Origin {
        key: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    /// Some parts of a multi-key or multi-tier operation failed.
    #[error("{op} partially failed ({} errors): {}", .failures.len(), join_failures(.failures))]
    Partial {
        op: &'static str,
        failures: Vec<CacheError>,
    },
}

impl CacheError {
    /// Create a new operation error.
    pub fn operation(
        tier: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Operation {
            tier: tier.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Wrap an origin failure for the given key.
    pub fn origin<E>(key: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        CacheError::Origin {
            key: key.into(),
            source: Arc::from(source.into()),
        }
    }

    /// Whether this error comes from the cache infrastructure rather than from
    /// the caller or the origin. Transient errors degrade to a miss or a no-op.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Operation { .. }
            | CacheError::Unavailable(_)
            | CacheError::Timeout { .. }
            | CacheError::ReadOnly(_) => true,
            CacheError::Partial { failures, .. } => failures.iter().all(CacheError::is_transient),
            CacheError::Serialization(_) | CacheError::Origin { .. } => false,
        }
    }

    /// Collapse a list of failures into a single error, if there are any.
    pub(crate) fn aggregate(op: &'static str, mut failures: Vec<CacheError>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(CacheError::Partial { op, failures }),
        }
    }
}

fn join_failures(failures: &[CacheError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::Unavailable("down".into()).is_transient());
        assert!(
            CacheError::Timeout {
                op: "GET",
                key: "k".into()
            }
            .is_transient()
        );
        assert!(!CacheError::Serialization("bad".into()).is_transient());
        assert!(!CacheError::origin("k", "db down").is_transient());
    }

    #[test]
    fn test_aggregate() {
        assert!(CacheError::aggregate("delete", vec![]).is_none());

        let single = CacheError::aggregate("delete", vec![CacheError::Unavailable("x".into())]);
        assert!(matches!(single, Some(CacheError::Unavailable(_))));

        let many = CacheError::aggregate(
            "delete",
            vec![
                CacheError::Unavailable("a".into()),
                CacheError::operation("moka", "k", "boom"),
            ],
        )
        .unwrap();
        assert!(many.is_transient());
        assert!(many.to_string().contains("2 errors"));
    }

    #[test]
    fn test_origin_keeps_source_message() {
        let err = CacheError::origin("report:9", "upstream 503");
        assert_eq!(
            err.to_string(),
            "origin fetch for key 'report:9' failed: upstream 503"
        );
    }
}
