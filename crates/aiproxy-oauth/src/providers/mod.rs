pub mod antigravity;
pub mod claude;
pub mod codex;
pub mod gemini;
pub mod iflow;
pub mod kimi;
pub mod qwen;
pub mod vertex;

use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use aiproxy_common::ProxyError;
use aiproxy_credential::JsonMap;

/// Result of a completed provider flow: the token payload plus the
/// provider-specific file name it persists under.
#[derive(Debug, Clone)]
pub struct AuthBundle {
    pub provider: &'static str,
    pub file_name: String,
    pub label: String,
    pub email: Option<String>,
    pub metadata: JsonMap,
}

pub(crate) fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `expired` timestamp persisted alongside tokens: RFC3339, `expires_in`
/// seconds from now.
pub(crate) fn expiry_rfc3339(expires_in: i64) -> String {
    let at = OffsetDateTime::now_utc() + time::Duration::seconds(expires_in);
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// File-name component: anything outside `[A-Za-z0-9._@-]` becomes a dash.
pub(crate) fn sanitize_file_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches('-').to_string()
}

pub(crate) async fn read_json_response(
    response: wreq::Response,
    what: &str,
) -> Result<Value, ProxyError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    if !status.is_success() {
        let text = String::from_utf8_lossy(&body);
        return Err(ProxyError::upstream(format!("{what} failed: {status} {text}")));
    }
    serde_json::from_slice(&body)
        .map_err(|err| ProxyError::upstream(format!("{what} returned invalid JSON: {err}")))
}

/// Email claim from an ID token, for labeling and file naming.
pub fn claims_email(id_token: &str) -> Option<String> {
    parse_jwt_claims(id_token)?
        .get("email")
        .and_then(Value::as_str)
        .filter(|email| !email.is_empty())
        .map(str::to_string)
}

/// Decode the claims segment of a JWT without verifying the signature; the
/// token was just handed to us by the issuer over TLS.
pub(crate) fn parse_jwt_claims(token: &str) -> Option<Value> {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let mut parts = token.split('.');
    let (header, payload, signature) = (parts.next()?, parts.next()?, parts.next()?);
    if header.is_empty() || payload.is_empty() || signature.is_empty() || parts.next().is_some() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&decoded).ok()
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::json;

    use super::*;

    #[test]
    fn sanitization_keeps_emails_readable() {
        assert_eq!(sanitize_file_component("a@example.com"), "a@example.com");
        assert_eq!(sanitize_file_component("my project!"), "my-project");
        assert_eq!(sanitize_file_component("+86 139 0000"), "86-139-0000");
    }

    #[test]
    fn jwt_claims_decode_the_middle_segment() {
        let claims = json!({"email": "u@example.com", "sub": "abc"});
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let token = format!("eyJh.{payload}.sig");
        let parsed = parse_jwt_claims(&token).unwrap();
        assert_eq!(parsed["email"], "u@example.com");

        assert!(parse_jwt_claims("only.two").is_none());
        assert!(parse_jwt_claims("a.b.c.d").is_none());
        assert!(parse_jwt_claims("..").is_none());
    }

    #[test]
    fn expiry_is_rfc3339_in_the_future() {
        let stamp = expiry_rfc3339(3600);
        let parsed = OffsetDateTime::parse(&stamp, &Rfc3339).unwrap();
        assert!(parsed > OffsetDateTime::now_utc());
    }
}
