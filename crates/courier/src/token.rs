//! Token structural checks and token-file discovery.
//!
//! Nothing here validates a signature. A vault token is accepted on its
//! prefix alone; a bearer token must be a well-formed JWT whose `wlcg.groups`
//! claim names the configured issuer group (and `<group>/<role>` when a role
//! is set).

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;

/// Prefixes a vault service token may carry.
pub const VAULT_TOKEN_PREFIXES: [&str; 2] = ["hvs.", "s."];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenInvalid {
    #[error("vault token does not start with a known prefix")]
    BadPrefix,

    #[error("bearer token is not a three-part JWT")]
    NotAJwt,

    #[error("bearer token payload is not decodable: {0}")]
    BadPayload(String),

    #[error("wlcg.groups claim is missing or not an array of strings")]
    MissingGroups,

    #[error("wlcg.groups does not contain required group {0}")]
    GroupNotPresent(String),
}

/// Accept `hvs.`-prefixed (current) and `s.`-prefixed (legacy) tokens.
pub fn validate_vault_token(token: &str) -> Result<(), TokenInvalid> {
    let token = token.trim();
    if VAULT_TOKEN_PREFIXES.iter().any(|p| token.starts_with(p)) {
        Ok(())
    } else {
        Err(TokenInvalid::BadPrefix)
    }
}

#[derive(Debug, Deserialize)]
struct BearerClaims {
    #[serde(rename = "wlcg.groups")]
    wlcg_groups: Option<Vec<String>>,
    exp: Option<i64>,
}

fn decode_claims(token: &str) -> Result<BearerClaims, TokenInvalid> {
    let mut parts = token.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenInvalid::NotAJwt);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| TokenInvalid::BadPayload(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenInvalid::BadPayload(e.to_string()))
}

/// Check the `wlcg.groups` claim against the configured issuer group and
/// optional role.
pub fn validate_bearer_token(
    token: &str,
    issuer_group: &str,
    role: Option<&str>,
) -> Result<(), TokenInvalid> {
    let claims = decode_claims(token)?;
    let groups = claims.wlcg_groups.ok_or(TokenInvalid::MissingGroups)?;

    if !groups.iter().any(|g| g == issuer_group) {
        return Err(TokenInvalid::GroupNotPresent(issuer_group.to_string()));
    }
    if let Some(role) = role {
        let with_role = format!("{issuer_group}/{role}");
        if !groups.iter().any(|g| g == &with_role) {
            return Err(TokenInvalid::GroupNotPresent(with_role));
        }
    }
    Ok(())
}

/// Time until the bearer token's `exp` claim, zero if absent or passed.
pub fn bearer_remaining_lifetime(token: &str) -> Result<Duration, TokenInvalid> {
    let claims = decode_claims(token)?;
    let Some(exp) = claims.exp else {
        return Ok(Duration::ZERO);
    };
    let remaining = exp - Utc::now().timestamp();
    Ok(Duration::from_secs(remaining.max(0) as u64))
}

/// Bearer token file discovery: `$BEARER_TOKEN_FILE`, then
/// `$XDG_RUNTIME_DIR/bt_u<uid>`, then `/tmp/bt_u<uid>`.
pub fn bearer_token_file(uid: u32) -> PathBuf {
    if let Ok(path) = std::env::var(crate::environment::BEARER_TOKEN_FILE_VAR) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join(format!("bt_u{uid}"));
        }
    }
    PathBuf::from(format!("/tmp/bt_u{uid}"))
}

/// Vault token file location for a service: `<root>/vt_u<uid>_<service>`.
pub fn vault_token_file(root: &std::path::Path, uid: u32, service: &crate::types::ServiceName) -> PathBuf {
    root.join(format!("vt_u{uid}_{service}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceName;

    fn jwt_with_payload(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{body}.c2lnbmF0dXJl")
    }

    #[test]
    fn vault_token_prefixes_are_accepted() {
        assert!(validate_vault_token("hvs.CAESIJ...").is_ok());
        assert!(validate_vault_token("s.legacy123").is_ok());
        assert!(validate_vault_token("  hvs.trimmed\n").is_ok());
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        assert_eq!(validate_vault_token("vault-token"), Err(TokenInvalid::BadPrefix));
        assert_eq!(validate_vault_token(""), Err(TokenInvalid::BadPrefix));
    }

    #[test]
    fn bearer_with_issuer_group_passes() {
        let token = jwt_with_payload(serde_json::json!({
            "wlcg.groups": ["/dune", "/dune/production"],
            "exp": 4102444800i64
        }));
        assert!(validate_bearer_token(&token, "/dune", None).is_ok());
        assert!(validate_bearer_token(&token, "/dune", Some("production")).is_ok());
    }

    #[test]
    fn bearer_without_role_group_fails_when_role_required() {
        let token = jwt_with_payload(serde_json::json!({
            "wlcg.groups": ["/dune"]
        }));
        assert!(validate_bearer_token(&token, "/dune", None).is_ok());
        assert_eq!(
            validate_bearer_token(&token, "/dune", Some("production")),
            Err(TokenInvalid::GroupNotPresent("/dune/production".into()))
        );
    }

    #[test]
    fn bearer_missing_groups_claim_fails() {
        let token = jwt_with_payload(serde_json::json!({ "sub": "dunepro" }));
        assert_eq!(
            validate_bearer_token(&token, "/dune", None),
            Err(TokenInvalid::MissingGroups)
        );
    }

    #[test]
    fn malformed_jwt_fails_structurally() {
        assert_eq!(
            validate_bearer_token("not-a-jwt", "/dune", None),
            Err(TokenInvalid::NotAJwt)
        );
        assert!(matches!(
            validate_bearer_token("a.!!!.c", "/dune", None),
            Err(TokenInvalid::BadPayload(_))
        ));
    }

    #[test]
    fn remaining_lifetime_is_zero_for_expired_tokens() {
        let token = jwt_with_payload(serde_json::json!({
            "wlcg.groups": ["/dune"],
            "exp": 1000
        }));
        assert_eq!(bearer_remaining_lifetime(&token), Ok(Duration::ZERO));
    }

    #[test]
    fn remaining_lifetime_is_positive_for_future_exp() {
        let exp = Utc::now().timestamp() + 86_400;
        let token = jwt_with_payload(serde_json::json!({ "exp": exp }));
        let remaining = bearer_remaining_lifetime(&token).expect("lifetime");
        assert!(remaining > Duration::from_secs(86_000));
    }

    #[test]
    fn vault_token_file_embeds_uid_and_service() {
        let service = ServiceName::new("dune", "production");
        let path = vault_token_file(std::path::Path::new("/var/lib/courier"), 42001, &service);
        assert_eq!(
            path,
            PathBuf::from("/var/lib/courier/vt_u42001_dune_production")
        );
    }

    #[test]
    fn bearer_file_falls_back_to_tmp() {
        // Absent BEARER_TOKEN_FILE and XDG_RUNTIME_DIR the rule bottoms out
        // in /tmp. The env-var branches are exercised via the public rule in
        // integration-style config tests to avoid mutating process env here.
        if std::env::var_os(crate::environment::BEARER_TOKEN_FILE_VAR).is_none()
            && std::env::var_os("XDG_RUNTIME_DIR").is_none()
        {
            assert_eq!(bearer_token_file(7), PathBuf::from("/tmp/bt_u7"));
        }
    }
}
