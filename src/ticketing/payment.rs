//! Payment provider seam.
//!
//! The provider only hands out a redirect URL; the outcome comes back later
//! through the `payment_confirmed` / `payment_failed` callbacks. Those are
//! signed with a secret shared with the provider, see [`CallbackSigner`].

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::models::Order;
use crate::ticketing::error::TicketingError;

type HmacSha256 = Hmac<Sha256>;

const CALLBACK_PREFIX: &str = "pay1";

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_payment_intent(&self, order: &Order) -> Result<String, TicketingError>;
}

/// Hosted checkout page that takes the order id and amount as query parameters.
#[derive(Debug, Clone)]
pub struct HostedCheckout {
    base_url: String,
}

impl HostedCheckout {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentProvider for HostedCheckout {
    async fn create_payment_intent(&self, order: &Order) -> Result<String, TicketingError> {
        if self.base_url.is_empty() {
            return Err(TicketingError::PaymentProvider(
                "checkout base url is not configured".to_string(),
            ));
        }
        Ok(format!(
            "{}/{}?amount={}",
            self.base_url.trim_end_matches('/'),
            order.id,
            order.total_amount
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Confirmed,
    Failed,
}

impl PaymentOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

/// HMAC-SHA256 over `pay1.<order id>.<outcome>`, base64url without padding.
/// A signature for one outcome never verifies the other.
#[derive(Clone)]
pub struct CallbackSigner {
    mac: HmacSha256,
}

impl CallbackSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(secret.as_ref())?,
        })
    }

    fn keyed(&self, order_id: Uuid, outcome: PaymentOutcome) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(format!("{CALLBACK_PREFIX}.{order_id}.{}", outcome.as_str()).as_bytes());
        mac
    }

    pub fn sign(&self, order_id: Uuid, outcome: PaymentOutcome) -> String {
        URL_SAFE_NO_PAD.encode(self.keyed(order_id, outcome).finalize().into_bytes())
    }

    /// Constant-time check of `signature` against the expected tag.
    pub fn verify(&self, order_id: Uuid, outcome: PaymentOutcome, signature: &str) -> bool {
        let Ok(tag) = URL_SAFE_NO_PAD.decode(signature.trim()) else {
            return false;
        };
        self.keyed(order_id, outcome).verify_slice(&tag).is_ok()
    }
}
