//! Invitation link token codec.
//!
//! A call invitation travels as a URL-safe base64 token in the link path.
//! The current schema is a JSON record `{callId, participantName, timestamp}`
//! (epoch milliseconds). Two legacy formats are still accepted for links
//! issued by older builds: pipe-delimited `"name|epoch-ms"`, and a bare
//! display name with no timestamp. Decoding runs an explicit, ordered parser
//! list so the precedence between formats stays testable.
//!
//! Expiry is evaluated at decode time only; tokens are never persisted.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Wire form of the current token schema.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRecord {
    call_id: String,
    participant_name: String,
    /// Epoch milliseconds.
    timestamp: i64,
}

/// A decoded current-schema invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInvite {
    pub call_id: String,
    pub participant_name: String,
    pub issued_at: DateTime<Utc>,
}

impl CallInvite {
    pub fn new(
        call_id: impl Into<String>,
        participant_name: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            participant_name: participant_name.into(),
            issued_at,
        }
    }

    /// Encode as a URL-safe token: JSON record, base64 without padding.
    pub fn encode(&self) -> String {
        let record = TokenRecord {
            call_id: self.call_id.clone(),
            participant_name: self.participant_name.clone(),
            timestamp: self.issued_at.timestamp_millis(),
        };
        let json = serde_json::to_vec(&record).expect("token record serializes");
        URL_SAFE_NO_PAD.encode(json)
    }
}

/// Every link format still in circulation, tagged by schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSchema {
    /// Current JSON record.
    V2(CallInvite),
    /// Legacy pipe-delimited `"name|epoch-ms"`; carries no call id.
    V1 {
        participant_name: String,
        issued_at: DateTime<Utc>,
    },
    /// Oldest format: bare display name. Never expires — a known gap kept
    /// for compatibility; callers may refuse these by policy.
    Legacy { participant_name: String },
}

impl LinkSchema {
    pub fn participant_name(&self) -> &str {
        match self {
            LinkSchema::V2(invite) => &invite.participant_name,
            LinkSchema::V1 {
                participant_name, ..
            }
            | LinkSchema::Legacy { participant_name } => participant_name,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            LinkSchema::V2(invite) => Some(&invite.call_id),
            _ => None,
        }
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        match self {
            LinkSchema::V2(invite) => Some(invite.issued_at),
            LinkSchema::V1 { issued_at, .. } => Some(*issued_at),
            LinkSchema::Legacy { .. } => None,
        }
    }
}

type Parser = fn(&[u8]) -> Option<LinkSchema>;

/// Ordered fallback list: first match wins.
const PARSERS: &[(&str, Parser)] = &[
    ("v2-json", parse_v2),
    ("v1-pipe", parse_v1),
    ("legacy-name", parse_legacy),
];

fn parse_v2(raw: &[u8]) -> Option<LinkSchema> {
    let record: TokenRecord = serde_json::from_slice(raw).ok()?;
    if record.call_id.is_empty() || record.participant_name.is_empty() {
        return None;
    }
    let issued_at = Utc.timestamp_millis_opt(record.timestamp).single()?;
    Some(LinkSchema::V2(CallInvite {
        call_id: record.call_id,
        participant_name: record.participant_name,
        issued_at,
    }))
}

fn parse_v1(raw: &[u8]) -> Option<LinkSchema> {
    let text = std::str::from_utf8(raw).ok()?;
    let (name, millis) = text.split_once('|')?;
    if name.is_empty() {
        return None;
    }
    let millis: i64 = millis.trim().parse().ok()?;
    let issued_at = Utc.timestamp_millis_opt(millis).single()?;
    Some(LinkSchema::V1 {
        participant_name: name.to_string(),
        issued_at,
    })
}

fn parse_legacy(raw: &[u8]) -> Option<LinkSchema> {
    let text = std::str::from_utf8(raw).ok()?;
    let name = text.trim();
    // A failed JSON record or a malformed pipe token must not be mistaken
    // for a display name.
    if name.is_empty() || name.starts_with('{') || name.contains('|') {
        return None;
    }
    Some(LinkSchema::Legacy {
        participant_name: name.to_string(),
    })
}

/// Decode an invitation token and enforce the TTL.
///
/// Age exactly equal to the TTL is still accepted; rejection requires
/// `now - issued_at > ttl`. Legacy bare-name tokens carry no timestamp and
/// pass the age check unconditionally.
pub fn decode(
    token: &str,
    ttl: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<LinkSchema, CallError> {
    // Tolerate padded tokens from older issuers, then decode URL-safe first
    // and the standard alphabet as a fallback.
    let trimmed = token.trim().trim_end_matches('=');
    let raw = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| CallError::LinkInvalid(format!("not base64: {e}")))?;

    let schema = PARSERS
        .iter()
        .find_map(|(name, parser)| {
            let parsed = parser(&raw);
            if parsed.is_some() {
                tracing::debug!("invitation token matched schema {}", name);
            }
            parsed
        })
        .ok_or_else(|| CallError::LinkInvalid("unrecognized token format".into()))?;

    if let Some(issued_at) = schema.issued_at() {
        let age = now - issued_at;
        if age > ttl {
            return Err(CallError::LinkExpired {
                age_secs: age.num_seconds(),
                ttl_secs: ttl.num_seconds(),
            });
        }
    }

    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ttl() -> Duration {
        Duration::hours(2)
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn round_trip() {
        let invite = CallInvite::new("abc123", "Maria Silva", t0());
        let token = invite.encode();
        // URL-safe, no padding.
        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));

        let decoded = decode(&token, ttl(), t0()).unwrap();
        assert_eq!(decoded, LinkSchema::V2(invite));
    }

    #[test]
    fn expiry_boundary_is_deterministic() {
        let invite = CallInvite::new("abc123", "Maria Silva", t0());
        let token = invite.encode();

        // age == ttl: still accepted.
        assert!(decode(&token, ttl(), t0() + ttl()).is_ok());

        // age == ttl + 1s: rejected as expired.
        let err = decode(&token, ttl(), t0() + ttl() + Duration::seconds(1)).unwrap_err();
        assert!(matches!(err, CallError::LinkExpired { .. }));
    }

    #[test]
    fn legacy_pipe_format() {
        let raw = format!("Joao Pereira|{}", t0().timestamp_millis());
        let token = URL_SAFE_NO_PAD.encode(raw);
        let decoded = decode(&token, ttl(), t0()).unwrap();
        assert_eq!(
            decoded,
            LinkSchema::V1 {
                participant_name: "Joao Pereira".into(),
                issued_at: t0(),
            }
        );

        // Pipe tokens still expire.
        let err = decode(&token, ttl(), t0() + Duration::hours(3)).unwrap_err();
        assert!(matches!(err, CallError::LinkExpired { .. }));
    }

    #[test]
    fn legacy_bare_name_never_expires() {
        let token = URL_SAFE_NO_PAD.encode("Ana Costa");
        let decoded = decode(&token, ttl(), t0() + Duration::days(365)).unwrap();
        assert_eq!(decoded.participant_name(), "Ana Costa");
        assert_eq!(decoded.issued_at(), None);
        assert_eq!(decoded.call_id(), None);
    }

    #[test]
    fn parser_precedence_json_before_name() {
        // A valid JSON record must decode as V2, never fall through to the
        // bare-name parser.
        let invite = CallInvite::new("abc123", "Maria Silva", t0());
        let decoded = decode(&invite.encode(), ttl(), t0()).unwrap();
        assert!(matches!(decoded, LinkSchema::V2(_)));
    }

    #[test]
    fn malformed_json_is_invalid_not_a_name() {
        // Looks like JSON but is missing the timestamp field: must reject,
        // not degrade into a Legacy name.
        let token = URL_SAFE_NO_PAD.encode(r#"{"callId":"x","participantName":"y"}"#);
        let err = decode(&token, ttl(), t0()).unwrap_err();
        assert!(matches!(err, CallError::LinkInvalid(_)));
    }

    #[test]
    fn malformed_pipe_is_invalid() {
        let token = URL_SAFE_NO_PAD.encode("Maria|not-a-timestamp");
        let err = decode(&token, ttl(), t0()).unwrap_err();
        assert!(matches!(err, CallError::LinkInvalid(_)));
    }

    #[test]
    fn garbage_is_invalid() {
        let err = decode("!!!not base64!!!", ttl(), t0()).unwrap_err();
        assert!(matches!(err, CallError::LinkInvalid(_)));
    }

    #[test]
    fn padded_token_still_decodes() {
        let invite = CallInvite::new("abc123", "Maria Silva", t0());
        let padded = format!("{}==", invite.encode());
        assert!(decode(&padded, ttl(), t0()).is_ok());
    }
}
