//! Authentication contracts: challenges, credentials, and the
//! authenticator consulted on 401 and 407 responses.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::address::Proxy;
use crate::request::Request;
use crate::response::Response;

/// One challenge from a `WWW-Authenticate` or `Proxy-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub realm: String,
}

impl Challenge {
    /// Parse `Scheme realm="value"`. Challenges without a scheme token
    /// are discarded.
    pub(crate) fn parse(value: &str) -> Option<Challenge> {
        let value = value.trim();
        let (scheme, params) = match value.split_once(' ') {
            Some((scheme, params)) => (scheme, params),
            None => (value, ""),
        };
        if scheme.is_empty() {
            return None;
        }
        let realm = params
            .split(',')
            .filter_map(|param| param.trim().split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("realm"))
            .map(|(_, v)| v.trim().trim_matches('"').to_string())
            .unwrap_or_default();
        Some(Challenge {
            scheme: scheme.to_string(),
            realm,
        })
    }
}

/// Responds to authentication challenges from origin servers and proxies.
///
/// Return a request with credentials attached to retry, or `None` to give
/// up and surface the 401/407 to the caller.
pub trait Authenticator: Send + Sync {
    /// React to a 401 from the origin server.
    fn authenticate(&self, proxy: &Proxy, response: &Response) -> Option<Request>;

    /// React to a 407 from the proxy.
    fn authenticate_proxy(&self, proxy: &Proxy, response: &Response) -> Option<Request>;
}

/// An authenticator that never answers a challenge.
#[derive(Debug, Default)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, _proxy: &Proxy, _response: &Response) -> Option<Request> {
        None
    }

    fn authenticate_proxy(&self, _proxy: &Proxy, _response: &Response) -> Option<Request> {
        None
    }
}

/// A `Basic` authorization header value for the given credentials
/// (RFC 7617).
pub fn basic_credentials(username: &str, password: &str) -> String {
    let encoded = STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

/// Answers `Basic` challenges with fixed credentials.
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    pub fn new(username: &str, password: &str) -> BasicAuthenticator {
        BasicAuthenticator {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn answer(&self, response: &Response, header: &str) -> Option<Request> {
        let basic = response
            .challenges()
            .into_iter()
            .any(|c| c.scheme.eq_ignore_ascii_case("Basic"));
        if !basic {
            return None;
        }
        let request = response.request()?;

        // Refuse to retry the same credentials that were just rejected.
        let credential = basic_credentials(&self.username, &self.password);
        if request.header(header) == Some(credential.as_str()) {
            return None;
        }
        request
            .new_builder()
            .header(header, &credential)
            .build()
            .ok()
    }
}

impl Authenticator for BasicAuthenticator {
    fn authenticate(&self, _proxy: &Proxy, response: &Response) -> Option<Request> {
        self.answer(response, "Authorization")
    }

    fn authenticate_proxy(&self, _proxy: &Proxy, response: &Response) -> Option<Request> {
        self.answer(response, "Proxy-Authorization")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseBuilder;

    #[test]
    fn basic_credentials_encode_rfc7617_example() {
        assert_eq!(
            basic_credentials("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn challenge_parsing() {
        let c = Challenge::parse("Basic realm=\"protected site\"").unwrap();
        assert_eq!(c.scheme, "Basic");
        assert_eq!(c.realm, "protected site");

        let c = Challenge::parse("Bearer").unwrap();
        assert_eq!(c.scheme, "Bearer");
        assert_eq!(c.realm, "");

        assert!(Challenge::parse("").is_none());
    }

    #[test]
    fn basic_authenticator_answers_once() {
        let auth = BasicAuthenticator::new("u", "p");
        let request = Request::get("http://h/p").unwrap();
        let response = ResponseBuilder::new()
            .code(401)
            .request(request)
            .add_header("WWW-Authenticate", "Basic realm=\"r\"")
            .build();

        let retry = auth.authenticate(&Proxy::Direct, &response).unwrap();
        let credential = retry.header("Authorization").unwrap().to_string();
        assert!(credential.starts_with("Basic "));

        // The same rejected credential is not offered twice.
        let again = ResponseBuilder::new()
            .code(401)
            .request(retry)
            .add_header("WWW-Authenticate", "Basic realm=\"r\"")
            .build();
        assert!(auth.authenticate(&Proxy::Direct, &again).is_none());
    }

    #[test]
    fn non_basic_challenges_are_declined() {
        let auth = BasicAuthenticator::new("u", "p");
        let response = ResponseBuilder::new()
            .code(401)
            .request(Request::get("http://h/p").unwrap())
            .add_header("WWW-Authenticate", "Bearer realm=\"r\"")
            .build();
        assert!(auth.authenticate(&Proxy::Direct, &response).is_none());
    }
}
