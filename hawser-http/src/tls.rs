//! TLS session establishment over a connected socket.
//!
//! The client carries a pre-built `rustls::ClientConfig`; root certs,
//! cipher policy, and ALPN preferences are configured there by the user.
//! This module drives the handshake, verifies certificate pins, and
//! reports the negotiated protocol.

use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};

use crate::connection::Protocol;
use crate::error::HttpError;
use crate::response::Handshake;

/// Constrains which certificates are accepted for a host, by exact DER
/// match against the presented chain. An empty pinner accepts anything
/// the verifier in the TLS config already accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificatePinner {
    pins: Vec<Pin>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pin {
    /// Host pattern: an exact hostname or `*.example.com` for one level
    /// of subdomain.
    pattern: String,
    der: Vec<u8>,
}

impl CertificatePinner {
    pub fn new() -> CertificatePinner {
        CertificatePinner::default()
    }

    /// Pin `host_pattern` to the DER-encoded certificate bytes.
    pub fn add(&mut self, host_pattern: &str, der: Vec<u8>) -> &mut Self {
        self.pins.push(Pin {
            pattern: host_pattern.to_string(),
            der,
        });
        self
    }

    /// Confirm that at least one pinned certificate for `hostname`
    /// appears in the presented chain. No-op when nothing is pinned for
    /// the host.
    pub fn check(&self, hostname: &str, peer_chain: &[&[u8]]) -> Result<(), HttpError> {
        let relevant: Vec<&Pin> = self
            .pins
            .iter()
            .filter(|pin| pattern_matches(&pin.pattern, hostname))
            .collect();
        if relevant.is_empty() {
            return Ok(());
        }
        for cert in peer_chain {
            if relevant.iter().any(|pin| pin.der == *cert) {
                return Ok(());
            }
        }
        Err(HttpError::Security(format!(
            "certificate pinning failure for {hostname}"
        )))
    }
}

fn pattern_matches(pattern: &str, hostname: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match hostname.strip_suffix(suffix) {
            // Exactly one label before the suffix.
            Some(prefix) => {
                prefix.ends_with('.') && !prefix.trim_end_matches('.').contains('.')
            }
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(hostname)
    }
}

pub(crate) type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Run the TLS handshake over `tcp`, check pins, and report the ALPN
/// outcome.
pub(crate) fn handshake(
    tcp: TcpStream,
    host: &str,
    config: Arc<rustls::ClientConfig>,
    pinner: &CertificatePinner,
) -> Result<(TlsStream, Handshake, Protocol), HttpError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| HttpError::Security(format!("invalid server name {host}: {e}")))?;
    let conn = ClientConnection::new(config, server_name)
        .map_err(|e| HttpError::Security(format!("tls setup failed: {e}")))?;
    let mut stream = StreamOwned::new(conn, tcp);

    while stream.conn.is_handshaking() {
        stream
            .conn
            .complete_io(&mut stream.sock)
            .map_err(|e| HttpError::Security(format!("tls handshake with {host} failed: {e}")))?;
    }

    let peer_chain: Vec<&[u8]> = stream
        .conn
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.as_ref()).collect())
        .unwrap_or_default();
    pinner.check(host, &peer_chain)?;

    let protocol = match stream.conn.alpn_protocol() {
        Some(b"h2") => Protocol::H2,
        _ => Protocol::Http11,
    };

    let handshake = Handshake {
        tls_version: stream
            .conn
            .protocol_version()
            .map(|v| format!("{v:?}"))
            .unwrap_or_default(),
        cipher_suite: stream
            .conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default(),
    };

    Ok((stream, handshake, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pinner_accepts_any_chain() {
        let pinner = CertificatePinner::new();
        assert!(pinner.check("h", &[b"whatever"]).is_ok());
        assert!(pinner.check("h", &[]).is_ok());
    }

    #[test]
    fn pinned_host_requires_matching_der() {
        let mut pinner = CertificatePinner::new();
        pinner.add("h.example", b"good".to_vec());
        assert!(pinner.check("h.example", &[b"good"]).is_ok());
        assert!(pinner.check("h.example", &[b"other", b"good"]).is_ok());
        assert!(pinner.check("h.example", &[b"bad"]).is_err());
        assert!(pinner.check("h.example", &[]).is_err());
    }

    #[test]
    fn unpinned_host_is_unconstrained() {
        let mut pinner = CertificatePinner::new();
        pinner.add("h.example", b"good".to_vec());
        assert!(pinner.check("other.example", &[b"bad"]).is_ok());
    }

    #[test]
    fn wildcard_matches_one_subdomain_level() {
        assert!(pattern_matches("*.example.com", "a.example.com"));
        assert!(!pattern_matches("*.example.com", "a.b.example.com"));
        assert!(!pattern_matches("*.example.com", "example.com"));
        assert!(pattern_matches("exact.com", "EXACT.com"));
    }
}
