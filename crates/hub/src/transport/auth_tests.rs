// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use super::*;

fn test_config(args: &[&str]) -> HubConfig {
    HubConfig::parse_from(std::iter::once("pizzapi-hub").chain(args.iter().copied()))
}

#[test]
fn cookie_round_trips_for_a_live_token() {
    let secret = "shh";
    let cookie = sign_session_cookie(secret, "u1", false, 3600);
    let principal = verify_session_cookie(secret, &cookie).expect("valid cookie");
    assert_eq!(principal.user_id.as_str(), "u1");
    assert!(!principal.is_admin);
}

#[test]
fn cookie_is_rejected_for_an_expired_token() {
    let secret = "shh";
    let cookie = sign_session_cookie(secret, "u1", false, 0);
    assert!(verify_session_cookie(secret, &cookie).is_none());
}

#[test]
fn cookie_is_rejected_under_the_wrong_secret() {
    let cookie = sign_session_cookie("secret-a", "u1", false, 3600);
    assert!(verify_session_cookie("secret-b", &cookie).is_none());
}

#[test]
fn cookie_is_rejected_when_malformed() {
    assert!(verify_session_cookie("shh", "not-a-cookie").is_none());
    assert!(verify_session_cookie("shh", "").is_none());
}

#[test]
fn resolve_principal_accepts_a_matching_api_key() {
    let config = test_config(&["--api-key", "k1"]);
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::AUTHORIZATION, "Bearer k1".parse().unwrap());
    let principal = resolve_principal(&config, &headers, None).expect("authorized");
    assert!(principal.is_admin);
}

#[test]
fn resolve_principal_rejects_a_wrong_api_key() {
    let config = test_config(&["--api-key", "k1"]);
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
    assert!(matches!(resolve_principal(&config, &headers, None), Err(HubError::AuthRequired)));
}

#[test]
fn resolve_principal_accepts_a_query_token_for_ws_upgrades() {
    let config = test_config(&["--api-key", "k1"]);
    let headers = HeaderMap::new();
    let principal = resolve_principal(&config, &headers, Some("k1")).expect("authorized");
    assert!(principal.is_admin);
}

#[test]
fn resolve_principal_accepts_a_valid_session_cookie() {
    let config = test_config(&["--session-cookie-secret", "shh"]);
    let cookie = sign_session_cookie("shh", "u7", false, 3600);
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::COOKIE, format!("pizzapi_session={cookie}").parse().unwrap());
    let principal = resolve_principal(&config, &headers, None).expect("authorized");
    assert_eq!(principal.user_id.as_str(), "u7");
}

#[test]
fn resolve_principal_rejects_with_no_credentials_at_all() {
    let config = test_config(&[]);
    let headers = HeaderMap::new();
    assert!(matches!(resolve_principal(&config, &headers, None), Err(HubError::AuthRequired)));
}

#[test]
fn runner_control_accepts_the_legacy_runner_token() {
    let config = test_config(&["--runner-token", "rt1"]);
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::AUTHORIZATION, "Bearer rt1".parse().unwrap());
    assert!(runner_control_authorized(&config, &headers, None));
}

#[test]
fn runner_control_rejects_a_session_cookie() {
    let config = test_config(&["--session-cookie-secret", "shh"]);
    let cookie = sign_session_cookie("shh", "u1", false, 3600);
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::COOKIE, format!("pizzapi_session={cookie}").parse().unwrap());
    assert!(!runner_control_authorized(&config, &headers, None));
}
