use chrono::Duration;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use crate::ticketing::{ExpiredInventoryPolicy, HoldWindows, Settings, TierOverlapPolicy};

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::create_security_headers_layer;

const DEFAULT_CHECKOUT_BASE_URL: &str = "http://localhost:3000/checkout";

#[derive(Debug, Clone, Default)]
pub struct HttpSettings {
    pub cors_allowed_origins: Option<String>,
    /// `RUST_ENV=production`: enables HSTS.
    pub production: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Absent means the in-memory store.
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub qr_signing_secret: String,
    /// Shared with the payment provider to sign its callbacks.
    pub payment_webhook_secret: String,
    pub checkout_base_url: String,
    pub sweep_interval: std::time::Duration,
    pub ticketing: Settings,
    pub http: HttpSettings,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unparseable values fall back to
    /// their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let qr_signing_secret = get("QR_SIGNING_SECRET").unwrap_or_else(|| {
            warn!("QR_SIGNING_SECRET is not set; using a random secret, issued QRs will not survive a restart");
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        });

        let payment_webhook_secret = get("PAYMENT_WEBHOOK_SECRET").unwrap_or_else(|| {
            warn!("PAYMENT_WEBHOOK_SECRET is not set; using a random secret, payment callbacks will be refused");
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        });

        let holds = HoldWindows {
            online: window_or(&get, "PAYMENT_WINDOW_MINUTES", 15, Duration::try_minutes),
            offline: window_or(&get, "PENDING_PAYMENT_HOLD_DAYS", 7, Duration::try_days),
        };
        let ticketing = Settings {
            holds,
            validity_business_days: parse_or(&get, "TICKET_VALIDITY_BUSINESS_DAYS", 48),
            overlap_policy: policy_or(&get, "TIER_OVERLAP_POLICY", TierOverlapPolicy::parse),
            expired_inventory: policy_or(
                &get,
                "EXPIRED_INVENTORY_POLICY",
                ExpiredInventoryPolicy::parse,
            ),
        };

        Self {
            database_url: get("DATABASE_URL"),
            bind_addr: parse_or(&get, "BIND_ADDR", default_bind_addr()),
            qr_signing_secret,
            payment_webhook_secret,
            checkout_base_url: get("CHECKOUT_BASE_URL")
                .unwrap_or_else(|| DEFAULT_CHECKOUT_BASE_URL.to_string()),
            sweep_interval: std::time::Duration::from_secs(parse_or(
                &get,
                "SWEEP_INTERVAL_SECS",
                60,
            )),
            ticketing,
            http: HttpSettings {
                cors_allowed_origins: get("CORS_ALLOWED_ORIGINS"),
                production: get("RUST_ENV").is_some_and(|v| v.to_lowercase() == "production"),
            },
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3001))
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, %default, "Invalid config value, using default");
            default
        }),
    }
}

/// Longest hold window accepted from the environment.
const MAX_HOLD_WINDOW_DAYS: i64 = 3650;

/// `key` as a count of `unit`s, if positive and at most
/// [`MAX_HOLD_WINDOW_DAYS`]; otherwise `default` units.
fn window_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
    unit: fn(i64) -> Option<Duration>,
) -> Duration {
    let count = parse_or(get, key, default);
    match unit(count).filter(|w| count > 0 && *w <= Duration::days(MAX_HOLD_WINDOW_DAYS)) {
        Some(window) => window,
        None => {
            warn!(key, value = count, default, "Hold window out of range, using default");
            unit(default).unwrap_or_default()
        }
    }
}

fn policy_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, parse: fn(&str) -> Option<T>) -> T
where
    T: Default + std::fmt::Debug,
{
    match get(key) {
        None => T::default(),
        Some(raw) => parse(&raw).unwrap_or_else(|| {
            let default = T::default();
            warn!(key, value = %raw, ?default, "Invalid config value, using default");
            default
        }),
    }
}
