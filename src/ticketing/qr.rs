//! QR payload signing.
//!
//! Ticket QRs and personal QRs are both `prefix.body.tag` strings, where the
//! body is base64url and the tag is an HMAC-SHA256 over `prefix.body`. The
//! prefix separates the two kinds so one can never be replayed as the other.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::ticketing::error::TicketingError;

type HmacSha256 = Hmac<Sha256>;

const TICKET_PREFIX: &str = "tk1";
const PERSONAL_PREFIX: &str = "pc1";

/// What a ticket QR vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketClaims {
    pub ticket_id: Uuid,
    pub owner_id: Uuid,
    pub issued_at: i64,
    /// Makes every issuance unique, so a re-issued QR never equals an old one.
    pub nonce: Uuid,
}

impl TicketClaims {
    pub fn new(ticket_id: Uuid, owner_id: Uuid, issued_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            ticket_id,
            owner_id,
            issued_at: issued_at.timestamp(),
            nonce: Uuid::new_v4(),
        }
    }
}

/// Signing service contract: opaque signed token in, verified identity out.
pub trait QrCodec: Send + Sync {
    fn sign_ticket(&self, claims: &TicketClaims) -> String;
    fn verify_ticket(&self, payload: &str) -> Result<TicketClaims, TicketingError>;
    fn sign_personal(&self, personal_code: &str) -> String;
    fn verify_personal(&self, payload: &str) -> Result<String, TicketingError>;
}

#[derive(Clone)]
pub struct HmacQrCodec {
    mac: HmacSha256,
}

impl HmacQrCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(secret.as_ref())?,
        })
    }

    fn seal(&self, prefix: &str, body: &[u8]) -> String {
        let body = URL_SAFE_NO_PAD.encode(body);
        let mut mac = self.mac.clone();
        mac.update(prefix.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{prefix}.{body}.{tag}")
    }

    /// Returns the decoded body when the tag checks out.
    fn open(&self, prefix: &str, payload: &str) -> Option<Vec<u8>> {
        let mut parts = payload.trim().split('.');
        let (Some(found_prefix), Some(body), Some(tag), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        if found_prefix != prefix {
            return None;
        }
        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
        let mut mac = self.mac.clone();
        mac.update(prefix.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        mac.verify_slice(&tag).ok()?;
        URL_SAFE_NO_PAD.decode(body).ok()
    }
}

impl QrCodec for HmacQrCodec {
    fn sign_ticket(&self, claims: &TicketClaims) -> String {
        // Serializing a struct of plain fields cannot fail.
        let body = serde_json::to_vec(claims).unwrap_or_default();
        self.seal(TICKET_PREFIX, &body)
    }

    fn verify_ticket(&self, payload: &str) -> Result<TicketClaims, TicketingError> {
        let body = self
            .open(TICKET_PREFIX, payload)
            .ok_or(TicketingError::InvalidSignature)?;
        serde_json::from_slice(&body).map_err(|_| TicketingError::InvalidSignature)
    }

    fn sign_personal(&self, personal_code: &str) -> String {
        self.seal(PERSONAL_PREFIX, personal_code.as_bytes())
    }

    fn verify_personal(&self, payload: &str) -> Result<String, TicketingError> {
        let body = self
            .open(PERSONAL_PREFIX, payload)
            .ok_or(TicketingError::InvalidCode)?;
        String::from_utf8(body).map_err(|_| TicketingError::InvalidCode)
    }
}

/// Fresh stable token for a new user's personal QR.
pub fn generate_personal_code() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn codec() -> HmacQrCodec {
        HmacQrCodec::new("test-secret").unwrap()
    }

    #[test]
    fn test_ticket_payload_verifies() {
        let claims = TicketClaims::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        let payload = codec().sign_ticket(&claims);

        assert!(payload.starts_with("tk1."));
        assert_eq!(codec().verify_ticket(&payload).unwrap(), claims);
    }

    #[test]
    fn test_reissue_changes_payload() {
        let ticket_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let a = codec().sign_ticket(&TicketClaims::new(ticket_id, owner, now));
        let b = codec().sign_ticket(&TicketClaims::new(ticket_id, owner, now));
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let claims = TicketClaims::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        let payload = codec().sign_ticket(&claims);

        let forged = TicketClaims {
            owner_id: Uuid::new_v4(),
            ..claims
        };
        let forged_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let tag = payload.rsplit('.').next().unwrap();
        let tampered = format!("tk1.{forged_body}.{tag}");

        assert!(matches!(
            codec().verify_ticket(&tampered),
            Err(TicketingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_other_key_is_rejected() {
        let claims = TicketClaims::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        let payload = HmacQrCodec::new("another-secret").unwrap().sign_ticket(&claims);

        assert!(matches!(
            codec().verify_ticket(&payload),
            Err(TicketingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        for junk in ["", "tk1", "tk1..", "tk1.a.b.c", "hello world", "tk1.!!!.???"] {
            assert!(matches!(
                codec().verify_ticket(junk),
                Err(TicketingError::InvalidSignature)
            ));
        }
    }

    #[test]
    fn test_personal_and_ticket_payloads_do_not_mix() {
        let personal = codec().sign_personal("abc123");
        assert_eq!(codec().verify_personal(&personal).unwrap(), "abc123");
        assert!(matches!(
            codec().verify_ticket(&personal),
            Err(TicketingError::InvalidSignature)
        ));

        let ticket = codec().sign_ticket(&TicketClaims::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now()));
        assert!(matches!(
            codec().verify_personal(&ticket),
            Err(TicketingError::InvalidCode)
        ));
    }
}
