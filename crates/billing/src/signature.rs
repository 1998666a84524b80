//! Stripe webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=...][,v0=...]`.
//! The signed message is `"<t>.<raw body>"`, keyed with the endpoint secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

struct SignatureHeader {
    timestamp: i64,
    v1_signatures: Vec<String>,
}

fn parse_header(header: &str) -> BillingResult<SignatureHeader> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => v1_signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if v1_signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(SignatureHeader {
        timestamp,
        v1_signatures,
    })
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Check `header` against `payload`; fails closed on any malformation
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> BillingResult<()> {
    let parsed = parse_header(header)?;

    // `t` is unauthenticated here; any i64 must be handled without overflow
    let age = now_unix.abs_diff(parsed.timestamp);
    if age > tolerance_secs.unsigned_abs() {
        tracing::warn!(
            timestamp = parsed.timestamp,
            now = now_unix,
            diff = age,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = compute_signature(secret, parsed.timestamp, payload)?;

    let matched = parsed.v1_signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|provided| bool::from(expected.as_slice().ct_eq(provided.as_slice())))
            .unwrap_or(false)
    });

    if !matched {
        tracing::warn!(
            candidates = parsed.v1_signatures.len(),
            "Webhook signature mismatch"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Produce a header in the format Stripe sends
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> BillingResult<String> {
    let signature = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
}
