//! Explicit caller context passed into every reservation operation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who is asking, and under which correlation id.
///
/// Handlers build one of these from the inbound request (or signal) and pass
/// it down; nothing below the API layer looks up the caller from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Authenticated principal, if the caller presented one.
    pub actor: Option<String>,
    /// Correlation id propagated to logs.
    pub correlation_id: String,
}

impl RequestContext {
    /// Creates a context for an authenticated caller.
    pub fn new(actor: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            correlation_id: correlation_id.into(),
        }
    }

    /// Creates a context for work the service initiates itself
    /// (inbound bus signals, background sweeps).
    pub fn system(source: &str) -> Self {
        Self {
            actor: Some(format!("system:{source}")),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates an unauthenticated context with a fresh correlation id.
    pub fn anonymous() -> Self {
        Self {
            actor: None,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Returns the actor name, or `"anonymous"`.
    pub fn actor_or_anonymous(&self) -> &str {
        self.actor.as_deref().unwrap_or("anonymous")
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_context_names_its_source() {
        let ctx = RequestContext::system("order-listener");
        assert_eq!(ctx.actor_or_anonymous(), "system:order-listener");
        assert!(!ctx.correlation_id.is_empty());
    }

    #[test]
    fn anonymous_contexts_get_distinct_correlation_ids() {
        let a = RequestContext::anonymous();
        let b = RequestContext::anonymous();
        assert_eq!(a.actor_or_anonymous(), "anonymous");
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
