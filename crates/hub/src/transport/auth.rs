// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Principal resolution for the Connection Gateway (spec §4.1).
//!
//! The hub does not run its own login flow — authentication-provider
//! internals are an out-of-scope collaborator (spec §1). What it verifies
//! here is either a shared-secret API key, or a session cookie an external
//! auth provider already signed with a secret the hub also holds
//! (`PIZZAPI_SESSION_COOKIE_SECRET`). Either check yields a [`Principal`];
//! everything downstream (Session/Runner/Terminal registries) only ever
//! sees that, never raw credentials.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use base64::Engine as _;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::config::HubConfig;
use crate::error::HubError;
use crate::ids::UserId;
use crate::state::HubState;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;
const COOKIE_NAME: &str = "pizzapi_session";

/// The authenticated caller a connection or request was upgraded on behalf
/// of (spec §3 "Ownership", §4.2 "Authorization").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub is_admin: bool,
}

/// Constant-time string comparison, used for API keys, runner secrets, and
/// cookie MACs alike — all are bearer-style secrets where a timing
/// side-channel would matter.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[derive(Debug, Serialize, Deserialize)]
struct CookiePayload {
    uid: String,
    #[serde(default)]
    adm: bool,
    exp: u64,
}

/// Sign a session cookie value for `user_id`, valid for `ttl_secs`. Exposed
/// so tests (and any trusted internal issuer) can mint cookies the same way
/// the external auth provider would; request handlers never call this.
pub fn sign_session_cookie(secret: &str, user_id: &str, is_admin: bool, ttl_secs: u64) -> String {
    let exp = now_secs() + ttl_secs;
    let payload = CookiePayload { uid: user_id.to_owned(), adm: is_admin, exp };
    let payload_json = serde_json::to_vec(&payload).unwrap_or_default();
    let payload_b64 = B64.encode(&payload_json);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let sig = hmac::sign(&key, payload_b64.as_bytes());
    let sig_b64 = B64.encode(sig.as_ref());

    format!("{payload_b64}.{sig_b64}")
}

/// Verify a session cookie value against `secret`, rejecting a bad MAC,
/// malformed payload, or an expired `exp`.
pub fn verify_session_cookie(secret: &str, cookie: &str) -> Option<Principal> {
    let (payload_b64, sig_b64) = cookie.split_once('.')?;
    let sig = B64.decode(sig_b64).ok()?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, payload_b64.as_bytes(), &sig).ok()?;

    let payload_json = B64.decode(payload_b64).ok()?;
    let payload: CookiePayload = serde_json::from_slice(&payload_json).ok()?;
    if payload.exp <= now_secs() {
        return None;
    }
    Some(Principal { user_id: UserId::from(payload.uid), is_admin: payload.adm })
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn cookie_from_headers<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|kv| kv.strip_prefix(name)?.strip_prefix('='))
}

/// Extract a bearer token from either the `Authorization: Bearer ...`
/// header or a `?token=` query string — WebSocket upgrades from browser
/// clients can't set custom headers, so the query param is the fallback
/// used by `/ws/*` (spec §4.1).
fn bearer_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    if let Some(tok) = query_token {
        return Some(tok);
    }
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

/// Resolve the authenticated principal for a REST call or a `/ws/sessions`,
/// `/ws/terminal`, `/ws/hub` upgrade: a matching API key grants a shared
/// admin-equivalent principal; otherwise a valid session cookie is
/// required. Unauthenticated or invalid credentials are both
/// `AuthRequired` — this function never reveals *which* check failed.
pub fn resolve_principal(
    config: &HubConfig,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Principal, HubError> {
    if let (Some(api_key), Some(presented)) = (&config.api_key, bearer_token(headers, query_token)) {
        if constant_time_eq(presented, api_key) {
            return Ok(Principal { user_id: UserId::from("api-key".to_owned()), is_admin: true });
        }
    }

    if let Some(secret) = &config.session_cookie_secret {
        if let Some(cookie) = cookie_from_headers(headers, COOKIE_NAME) {
            if let Some(principal) = verify_session_cookie(secret, cookie) {
                return Ok(principal);
            }
        }
    }

    Err(HubError::AuthRequired)
}

/// `/ws/runner` accepts the API key or the legacy `PIZZAPI_RUNNER_TOKEN`
/// (spec §6 environment table) — the runner's real identity is established
/// by the `register_runner` frame that follows, not by this upgrade-time
/// check.
pub fn runner_control_authorized(config: &HubConfig, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    let Some(presented) = bearer_token(headers, query_token) else { return false };
    config.api_key.as_deref().is_some_and(|k| constant_time_eq(presented, k))
        || config.runner_token.as_deref().is_some_and(|t| constant_time_eq(presented, t))
}

/// Lets REST handlers take `principal: Principal` directly as an argument
/// instead of threading `HeaderMap` through every signature and calling
/// [`resolve_principal`] by hand (spec §6 "All mutating endpoints require
/// an authenticated principal").
impl FromRequestParts<Arc<HubState>> for Principal {
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<HubState>) -> Result<Self, Self::Rejection> {
        let query_token = query_param(parts.uri.query().unwrap_or(""), "token");
        resolve_principal(&state.config, &parts.headers, query_token.as_deref())
    }
}

/// Pull a single `key=value` pair out of a raw (not yet percent-decoded)
/// query string. `/ws/*` upgrades from browser clients carry the bearer
/// token this way since they can't set custom headers (spec §4.1).
fn query_param<'a>(query: &'a str, key: &str) -> Option<std::borrow::Cow<'a, str>> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            Some(percent_decode(v))
        } else {
            None
        }
    })
}

fn percent_decode(s: &str) -> std::borrow::Cow<'_, str> {
    if !s.contains('%') && !s.contains('+') {
        return std::borrow::Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'+' => out.push(' '),
            b'%' => {
                let hi = bytes.next();
                let lo = bytes.next();
                match (hi.and_then(|c| (c as char).to_digit(16)), lo.and_then(|c| (c as char).to_digit(16))) {
                    (Some(hi), Some(lo)) => out.push(((hi * 16 + lo) as u8) as char),
                    _ => out.push('%'),
                }
            }
            other => out.push(other as char),
        }
    }
    std::borrow::Cow::Owned(out)
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
