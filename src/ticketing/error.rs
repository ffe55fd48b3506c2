use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Everything the ticketing engine can refuse.
///
/// All variants except `Store` and `PaymentProvider` are user-facing domain
/// rejections that carry a stable reason code (see [`TicketingError::reason`]).
#[derive(Debug, Error)]
pub enum TicketingError {
    #[error("requested {requested} of ticket type {ticket_type_id} but only {available} left")]
    OutOfStock {
        ticket_type_id: Uuid,
        tier_id: Option<Uuid>,
        requested: u32,
        available: u32,
    },

    #[error("cannot {action} while {current}")]
    InvalidState {
        action: &'static str,
        current: String,
    },

    #[error("user {actor} does not own {subject}")]
    NotOwner { subject: String, actor: Uuid },

    #[error("no account is registered for {email}")]
    NotRegistered { email: String },

    #[error("personal code is malformed or unknown")]
    InvalidCode,

    #[error("QR payload failed verification")]
    InvalidSignature,

    #[error("{window} window elapsed at {deadline}")]
    ExpiredWindow {
        window: &'static str,
        deadline: DateTime<Utc>,
    },

    #[error("tier configuration is inconsistent: {0}")]
    MisconfiguredTiers(String),

    #[error("ticket type '{ticket_type}' declares {declared} tickets but its tiers allocate {allocated}")]
    AllocationMismatch {
        ticket_type: String,
        declared: u32,
        allocated: u32,
    },

    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("edit would destroy sold inventory: {0}")]
    DestructiveEdit(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("ticket is already owned by the recipient")]
    SelfTransfer,

    #[error("event {0} is private")]
    PrivateEvent(Uuid),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("payment provider failed: {0}")]
    PaymentProvider(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TicketingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code surfaced to clients.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::OutOfStock { .. } => "OUT_OF_STOCK",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::NotOwner { .. } => "NOT_OWNER",
            Self::NotRegistered { .. } => "NOT_REGISTERED",
            Self::InvalidCode => "INVALID_CODE",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::ExpiredWindow { .. } => "EXPIRED_WINDOW",
            Self::MisconfiguredTiers(_) => "MISCONFIGURED_TIERS",
            Self::AllocationMismatch { .. } => "ALLOCATION_MISMATCH",
            Self::InvalidCatalog(_) => "INVALID_CATALOG",
            Self::DestructiveEdit(_) => "DESTRUCTIVE_EDIT",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::SelfTransfer => "SELF_TRANSFER",
            Self::PrivateEvent(_) => "PRIVATE_EVENT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::PaymentProvider(_) => "PAYMENT_PROVIDER_ERROR",
            Self::Store(_) => "STORAGE_ERROR",
        }
    }

    /// Infrastructure faults are retryable and never caused by the caller.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::PaymentProvider(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_are_not_infrastructure() {
        let err = TicketingError::OutOfStock {
            ticket_type_id: Uuid::nil(),
            tier_id: None,
            requested: 3,
            available: 1,
        };
        assert_eq!(err.reason(), "OUT_OF_STOCK");
        assert!(!err.is_infrastructure());
        assert_eq!(
            err.to_string(),
            format!("requested 3 of ticket type {} but only 1 left", Uuid::nil())
        );
    }

    #[test]
    fn test_store_errors_are_infrastructure() {
        let err = TicketingError::from(StoreError::Unavailable("pool closed".to_string()));
        assert_eq!(err.reason(), "STORAGE_ERROR");
        assert!(err.is_infrastructure());
    }
}
