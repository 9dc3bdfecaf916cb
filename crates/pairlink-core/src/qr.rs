//! QR invite payload.
//!
//! `pairlink://pair?v=1&sid=<session>&key=<base64url secret>[&host=<h>&port=<p>][&name=<n>]`
//!
//! `sid` may be empty (reconnection mode). The camera and image decoding live
//! outside this crate; this module only handles the decoded text.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use url::Url;
use zeroize::Zeroizing;

use pairlink_crypto::hash::relay_topic;
use pairlink_crypto::SharedSecret;
use pairlink_transport::DirectTarget;

use crate::errors::QrError;
use crate::validator::sanitize_device_name;

pub const INVITE_SCHEME: &str = "pairlink";
pub const INVITE_HOST: &str = "pair";
pub const INVITE_VERSION: u32 = 1;

#[derive(Clone, Debug)]
pub struct PairingInvite {
    pub version: u32,
    pub session_id: String,
    pub secret: SharedSecret,
    pub direct_target: Option<DirectTarget>,
    /// Display name of the host, sanitized
    pub host_name: Option<String>,
}

impl PairingInvite {
    /// Invite for a freshly generated secret (host side).
    pub fn new(session_id: impl Into<String>, secret: SharedSecret) -> Self {
        Self {
            version: INVITE_VERSION,
            session_id: session_id.into(),
            secret,
            direct_target: None,
            host_name: None,
        }
    }

    pub fn with_direct_target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.direct_target = Some(DirectTarget {
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_host_name(mut self, name: &str) -> Self {
        self.host_name = Some(sanitize_device_name(name));
        self
    }

    pub fn parse(raw: &str) -> Result<Self, QrError> {
        let url = Url::parse(raw.trim()).map_err(|e| QrError::InvalidUri(e.to_string()))?;
        if url.scheme() != INVITE_SCHEME || url.host_str() != Some(INVITE_HOST) {
            return Err(QrError::InvalidUri("unexpected scheme or host".to_string()));
        }

        let mut version = None;
        let mut session_id = None;
        let mut key = None;
        let mut host = None;
        let mut port = None;
        let mut name = None;
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "v" => version = Some(v.into_owned()),
                "sid" => session_id = Some(v.into_owned()),
                "key" => key = Some(Zeroizing::new(v.into_owned())),
                "host" => host = Some(v.into_owned()),
                "port" => port = Some(v.into_owned()),
                "name" => name = Some(v.into_owned()),
                _ => {}
            }
        }

        let version = version.ok_or(QrError::MissingField("v"))?;
        if version != INVITE_VERSION.to_string() {
            return Err(QrError::UnsupportedVersion(version));
        }
        let session_id = session_id.ok_or(QrError::MissingField("sid"))?;
        let key = key.ok_or(QrError::MissingField("key"))?;
        let secret_bytes = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(key.trim_end_matches('='))
                .map_err(|_| QrError::InvalidSecret)?,
        );
        let secret = SharedSecret::from_slice(&secret_bytes).map_err(|_| QrError::InvalidSecret)?;

        let direct_target = match (host, port) {
            (Some(host), Some(port)) if !host.is_empty() => Some(DirectTarget {
                host,
                port: port.parse::<u16>().ok().filter(|p| *p != 0).ok_or(QrError::InvalidPort)?,
            }),
            (Some(host), None) if !host.is_empty() => return Err(QrError::MissingField("port")),
            _ => None,
        };

        let host_name = name.map(|n| sanitize_device_name(&n)).filter(|n| !n.is_empty());

        Ok(Self {
            version: INVITE_VERSION,
            session_id,
            secret,
            direct_target,
            host_name,
        })
    }

    pub fn to_uri(&self) -> String {
        let key = Zeroizing::new(URL_SAFE_NO_PAD.encode(self.secret.as_bytes()));
        let mut out = format!("{}://{}", INVITE_SCHEME, INVITE_HOST);
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("v", &self.version.to_string())
            .append_pair("sid", &self.session_id)
            .append_pair("key", &key);
        if let Some(target) = &self.direct_target {
            query
                .append_pair("host", &target.host)
                .append_pair("port", &target.port.to_string());
        }
        if let Some(name) = &self.host_name {
            query.append_pair("name", name);
        }
        out.push('?');
        out.push_str(&query.finish());
        out
    }

    /// Relay topic both devices derive from the secret.
    pub fn relay_topic(&self) -> String {
        relay_topic(&self.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_b64(byte: u8) -> String {
        URL_SAFE_NO_PAD.encode([byte; 32])
    }

    #[test]
    fn test_parse_full_invite() {
        let raw = format!(
            "pairlink://pair?v=1&sid=abc123&key={}&host=192.168.1.20&port=8443&name=Living%20Room",
            key_b64(7)
        );
        let invite = PairingInvite::parse(&raw).unwrap();
        assert_eq!(invite.session_id, "abc123");
        assert_eq!(invite.secret.as_bytes(), &[7u8; 32]);
        assert_eq!(
            invite.direct_target,
            Some(DirectTarget {
                host: "192.168.1.20".into(),
                port: 8443
            })
        );
        assert_eq!(invite.host_name.as_deref(), Some("Living Room"));
    }

    #[test]
    fn test_relay_only_reconnect_invite() {
        let raw = format!("pairlink://pair?v=1&sid=&key={}", key_b64(1));
        let invite = PairingInvite::parse(&raw).unwrap();
        assert_eq!(invite.session_id, "");
        assert!(invite.direct_target.is_none());
        assert!(invite.host_name.is_none());
        assert!(invite.relay_topic().starts_with("pl-"));
    }

    #[test]
    fn test_to_uri_parses_back() {
        let invite = PairingInvite::new("s-42", SharedSecret::new([9u8; 32]))
            .with_direct_target("10.0.0.5", 9000)
            .with_host_name("Den & Study");
        let parsed = PairingInvite::parse(&invite.to_uri()).unwrap();
        assert_eq!(parsed.session_id, "s-42");
        assert_eq!(parsed.secret.as_bytes(), invite.secret.as_bytes());
        assert_eq!(parsed.direct_target, invite.direct_target);
        assert_eq!(parsed.host_name.as_deref(), Some("Den & Study"));
    }

    #[test]
    fn test_rejects_bad_invites() {
        assert!(matches!(PairingInvite::parse("not a uri"), Err(QrError::InvalidUri(_))));
        assert!(matches!(
            PairingInvite::parse(&format!("https://pair?v=1&sid=a&key={}", key_b64(1))),
            Err(QrError::InvalidUri(_))
        ));
        assert_eq!(
            PairingInvite::parse(&format!("pairlink://pair?v=2&sid=a&key={}", key_b64(1))).unwrap_err(),
            QrError::UnsupportedVersion("2".into())
        );
        assert_eq!(
            PairingInvite::parse(&format!("pairlink://pair?v=1&key={}", key_b64(1))).unwrap_err(),
            QrError::MissingField("sid")
        );
        assert_eq!(
            PairingInvite::parse("pairlink://pair?v=1&sid=a").unwrap_err(),
            QrError::MissingField("key")
        );
    }

    #[test]
    fn test_rejects_wrong_secret_length() {
        let short = URL_SAFE_NO_PAD.encode([1u8; 16]);
        assert_eq!(
            PairingInvite::parse(&format!("pairlink://pair?v=1&sid=a&key={}", short)).unwrap_err(),
            QrError::InvalidSecret
        );
        assert_eq!(
            PairingInvite::parse("pairlink://pair?v=1&sid=a&key=!!!").unwrap_err(),
            QrError::InvalidSecret
        );
    }

    #[test]
    fn test_rejects_bad_port() {
        for port in ["0", "70000", "http"] {
            let raw = format!("pairlink://pair?v=1&sid=a&key={}&host=h&port={}", key_b64(1), port);
            assert_eq!(PairingInvite::parse(&raw).unwrap_err(), QrError::InvalidPort);
        }
        let raw = format!("pairlink://pair?v=1&sid=a&key={}&host=h", key_b64(1));
        assert_eq!(PairingInvite::parse(&raw).unwrap_err(), QrError::MissingField("port"));
    }

    #[test]
    fn test_accepts_padded_key() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode([3u8; 32]);
        assert!(padded.ends_with('='));
        let raw = format!("pairlink://pair?v=1&sid=a&key={}", padded);
        assert_eq!(PairingInvite::parse(&raw).unwrap().secret.as_bytes(), &[3u8; 32]);
    }
}
