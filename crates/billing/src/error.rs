//! Billing error types

use tally_shared::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Organization not found: {0}")]
    OrganizationNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("No default plan configured")]
    DefaultPlanMissing,

    #[error("Invalid provider data: {0}")]
    InvalidProviderData(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Payment provider call timed out: {0}")]
    ProviderTimeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether redelivering the same input could succeed.
    ///
    /// Validation and not-found failures are terminal for an event; storage and
    /// provider failures are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_)
                | BillingError::ProviderTimeout(_)
                | BillingError::Database(_)
        )
    }
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => BillingError::OrganizationNotFound(what),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
