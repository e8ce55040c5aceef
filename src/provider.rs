use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::reconciliation::ProviderStatus;
use crate::types::PaymentProvider;

/// What a provider says about one payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReport {
    pub status: ProviderStatus,
    pub received_total_cents: Option<i64>,
}

/// Status query against one payment provider, keyed by the provider's
/// reference for the payment.
#[async_trait]
pub trait ProviderStatusSource: Send + Sync {
    async fn query_status(&self, reference: &str) -> Result<ProviderReport, ProviderError>;
}

/// Status sources by provider. Providers without a source cannot be
/// reconciled and are reported as unresolved.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    sources: HashMap<PaymentProvider, Arc<dyn ProviderStatusSource>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, provider: PaymentProvider, source: Arc<dyn ProviderStatusSource>) -> Self {
        self.sources.insert(provider, source);
        self
    }

    pub fn get(&self, provider: PaymentProvider) -> Option<&Arc<dyn ProviderStatusSource>> {
        self.sources.get(&provider)
    }
}
