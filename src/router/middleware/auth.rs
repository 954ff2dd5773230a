//! Internal API authentication
//!
//! Two gates in sequence on every request under the internal prefix:
//! an IP allowlist (loopback always passes), then HMAC request signing
//! with a nonce replay window. Multipart uploads and the gateway lookup
//! path skip the signature, never the allowlist.

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::super::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_TIMESTAMP: &str = "X-WS-Timestamp";
pub const HEADER_NONCE: &str = "X-WS-Nonce";
pub const HEADER_SIGNATURE: &str = "X-WS-Signature";

/// Body size the signature gate will buffer. Larger payloads belong to the
/// multipart endpoints, which skip signing.
const MAX_SIGNED_BODY: usize = 4 * 1024 * 1024;

/// Gate every internal request.
pub async fn require_internal_auth(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // Gate 1: source address
    if !ip_allowed(addr.ip(), &state.config.auth.allowed_ips) {
        debug!("Rejected {} by IP allowlist", addr.ip());
        return error_response(StatusCode::FORBIDDEN, "address not allowed");
    }

    // Gate 2: request signature
    if state.config.auth.signing_enabled && !signature_skipped(&request) {
        return match verify_signature(&state, request).await {
            Ok(request) => next.run(request).await,
            Err(message) => {
                debug!("Rejected {}: {}", addr.ip(), message);
                error_response(StatusCode::UNAUTHORIZED, message)
            }
        };
    }

    next.run(request).await
}

/// Loopback is always trusted; everything else must be configured.
fn ip_allowed(ip: IpAddr, allowed: &[String]) -> bool {
    if ip.is_loopback() {
        return true;
    }
    let ip_text = ip.to_string();
    allowed.iter().any(|entry| entry == &ip_text)
}

/// Requests whose signature cannot exist: multipart uploads (the body is
/// not replayable), the nginx subrequest lookup (carries its own guard),
/// and streaming upgrades (EventSource and WebSocket cannot set custom
/// headers; ownership is verified upstream). The IP allowlist has already
/// run for all of them.
fn signature_skipped(request: &Request<Body>) -> bool {
    let path = request.uri().path();
    if path.contains("/lookup/") || path.ends_with("/runs/stream") || path.ends_with("/terminal") {
        return true;
    }

    let is_upgrade = request
        .headers()
        .get("Upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if is_upgrade {
        return true;
    }

    request
        .headers()
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/"))
        .unwrap_or(false)
}

/// Validate timestamp, nonce and HMAC; returns the request rebuilt with
/// its buffered body on success.
async fn verify_signature(
    state: &AppState,
    request: Request<Body>,
) -> Result<Request<Body>, &'static str> {
    let timestamp = header(&request, HEADER_TIMESTAMP).ok_or("missing timestamp header")?;
    let nonce = header(&request, HEADER_NONCE).ok_or("missing nonce header")?;
    let signature = header(&request, HEADER_SIGNATURE).ok_or("missing signature header")?;

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();

    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_SIGNED_BODY)
        .await
        .map_err(|_| "unreadable body")?;

    check_signed_request(
        &state.config.auth,
        &state.nonces,
        SignedRequest {
            method: &method,
            path: &path,
            query: &query,
            body: &body_bytes,
            timestamp: &timestamp,
            nonce: &nonce,
            signature: &signature,
        },
        chrono::Utc::now().timestamp(),
    )?;

    Ok(Request::from_parts(parts, Body::from(body_bytes)))
}

/// The signed parts of one request, borrowed.
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub body: &'a [u8],
    pub timestamp: &'a str,
    pub nonce: &'a str,
    pub signature: &'a str,
}

/// The signature gate proper: skew check, nonce single-use, constant-time
/// HMAC comparison over the canonical string.
pub fn check_signed_request(
    auth: &crate::config::AuthConfiguration,
    nonces: &super::nonce::NonceStore,
    request: SignedRequest<'_>,
    now: i64,
) -> Result<(), &'static str> {
    let timestamp_secs: i64 = request.timestamp.parse().map_err(|_| "unparseable timestamp")?;
    if (now - timestamp_secs).abs() > auth.max_skew_secs {
        return Err("timestamp outside allowed skew");
    }

    if !nonces.check_and_record(request.nonce, now.max(0) as u64) {
        return Err("nonce already used");
    }

    let body_hash = hex::encode(Sha256::digest(request.body));
    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method, request.path, request.query, body_hash, request.timestamp, request.nonce
    );

    let mut mac = HmacSha256::new_from_slice(auth.secret.as_bytes())
        .map_err(|_| "signing secret not configured")?;
    mac.update(canonical.as_bytes());

    let given = base64::engine::general_purpose::STANDARD
        .decode(request.signature.as_bytes())
        .map_err(|_| "signature is not base64")?;

    // verify_slice is constant-time
    mac.verify_slice(&given).map_err(|_| "signature mismatch")?;
    Ok(())
}

fn header(request: &Request<Body>, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": true,
            "message": message,
        })),
    )
        .into_response()
}

/// Compute the signature a client must send. Shared with tests and any
/// in-process callers.
pub fn sign(
    secret: &str,
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
    timestamp: i64,
    nonce: &str,
) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, path, query, body_hash, timestamp, nonce
    );
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(canonical.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_always_allowed() {
        assert!(ip_allowed("127.0.0.1".parse().unwrap(), &[]));
        assert!(ip_allowed("::1".parse().unwrap(), &[]));
        assert!(!ip_allowed("10.0.0.9".parse().unwrap(), &[]));
        assert!(ip_allowed(
            "10.0.0.9".parse().unwrap(),
            &["10.0.0.9".to_string()]
        ));
    }

    #[test]
    fn test_signature_is_stable() {
        let a = sign("secret", "POST", "/internal/x", "a=1", b"{}", 1700000000, "n1");
        let b = sign("secret", "POST", "/internal/x", "a=1", b"{}", 1700000000, "n1");
        assert_eq!(a, b);

        // Any component change moves the signature
        let c = sign("secret", "POST", "/internal/x", "a=1", b"{}", 1700000001, "n1");
        assert_ne!(a, c);
        let d = sign("secret", "POST", "/internal/x", "a=2", b"{}", 1700000000, "n1");
        assert_ne!(a, d);
        let e = sign("other", "POST", "/internal/x", "a=1", b"{}", 1700000000, "n1");
        assert_ne!(a, e);
    }

    #[test]
    fn test_lookup_path_skips_signature() {
        let request = Request::builder()
            .uri("/internal/lookup/42")
            .body(Body::empty())
            .unwrap();
        assert!(signature_skipped(&request));

        let request = Request::builder()
            .uri("/internal/workspaces/42/ensure")
            .body(Body::empty())
            .unwrap();
        assert!(!signature_skipped(&request));
    }

    #[test]
    fn test_multipart_skips_signature() {
        let request = Request::builder()
            .uri("/internal/workspaces/42/upload")
            .header("Content-Type", "multipart/form-data; boundary=x")
            .body(Body::empty())
            .unwrap();
        assert!(signature_skipped(&request));
    }

    fn auth_config() -> crate::config::AuthConfiguration {
        crate::config::AuthConfiguration {
            secret: "shared-secret".into(),
            ..Default::default()
        }
    }

    fn signed<'a>(
        body: &'a [u8],
        timestamp: &'a str,
        nonce: &'a str,
        signature: &'a str,
    ) -> SignedRequest<'a> {
        SignedRequest {
            method: "POST",
            path: "/internal/workspaces/42/runs",
            query: "",
            body,
            timestamp,
            nonce,
            signature,
        }
    }

    #[test]
    fn test_valid_signature_passes() {
        let auth = auth_config();
        let nonces = super::super::nonce::NonceStore::new(300);
        let now = 1_700_000_000i64;
        let sig = sign(
            "shared-secret",
            "POST",
            "/internal/workspaces/42/runs",
            "",
            b"{\"appId\":7}",
            now,
            "n1",
        );
        let result = check_signed_request(
            &auth,
            &nonces,
            signed(b"{\"appId\":7}", &now.to_string(), "n1", &sig),
            now,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_duplicate_nonce_rejected() {
        let auth = auth_config();
        let nonces = super::super::nonce::NonceStore::new(300);
        let now = 1_700_000_000i64;
        let ts = now.to_string();
        let sig = sign(
            "shared-secret",
            "POST",
            "/internal/workspaces/42/runs",
            "",
            b"",
            now,
            "n1",
        );

        // Exactly one request with a fixed nonce makes it through
        assert!(check_signed_request(&auth, &nonces, signed(b"", &ts, "n1", &sig), now).is_ok());
        assert_eq!(
            check_signed_request(&auth, &nonces, signed(b"", &ts, "n1", &sig), now),
            Err("nonce already used")
        );
    }

    #[test]
    fn test_skewed_timestamp_rejected() {
        let auth = auth_config();
        let nonces = super::super::nonce::NonceStore::new(300);
        let now = 1_700_000_000i64;
        let stale = now - 120;
        let sig = sign(
            "shared-secret",
            "POST",
            "/internal/workspaces/42/runs",
            "",
            b"",
            stale,
            "n1",
        );
        // max_skew defaults to 60
        assert_eq!(
            check_signed_request(&auth, &nonces, signed(b"", &stale.to_string(), "n1", &sig), now),
            Err("timestamp outside allowed skew")
        );
    }

    #[test]
    fn test_tampered_body_rejected() {
        let auth = auth_config();
        let nonces = super::super::nonce::NonceStore::new(300);
        let now = 1_700_000_000i64;
        let sig = sign(
            "shared-secret",
            "POST",
            "/internal/workspaces/42/runs",
            "",
            b"{\"appId\":7}",
            now,
            "n1",
        );
        assert_eq!(
            check_signed_request(
                &auth,
                &nonces,
                signed(b"{\"appId\":8}", &now.to_string(), "n1", &sig),
                now,
            ),
            Err("signature mismatch")
        );
    }
}
