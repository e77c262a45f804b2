//! Caller identity as presented on the request.
//!
//! Authentication happens upstream; Turnstile trusts `X-User-Id` and looks
//! `X-Api-Key` up in the key directory. The client address is the TCP peer
//! unless that peer is a configured proxy.

use std::convert::Infallible;
use std::future::{Ready, ready};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use actix_web::{FromRequest, HttpRequest, dev::Payload, http::header, web};
use ipnet::IpNet;
use turnstile_core::ConfigError;
use turnstile_core::domain::ClientIdentity;
use turnstile_shared::headers::{API_KEY, USER_ID};

use crate::state::AppState;

const UNKNOWN_IP: &str = "unknown";

/// Proxies whose `X-Forwarded-For` is believed.
///
/// Parsed from a comma-separated list of CIDRs or bare addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedProxies(Vec<IpNet>);

impl TrustedProxies {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self(nets)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.iter().any(|net| net.contains(ip))
    }

    /// Address of the client behind `peer`.
    ///
    /// An untrusted peer is the client. For a trusted peer the forwarding
    /// chain is walked from the right and the first untrusted hop wins; a
    /// chain made only of proxies yields its leftmost entry.
    pub fn client_ip(&self, peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !self.contains(&peer) {
            return peer;
        }
        let hops: Vec<IpAddr> = forwarded_for
            .unwrap_or_default()
            .split(',')
            .filter_map(|hop| parse_ip(hop.trim()))
            .collect();

        hops.iter()
            .rev()
            .find(|hop| !self.contains(hop))
            .or_else(|| hops.first())
            .copied()
            .unwrap_or(peer)
    }
}

impl FromStr for TrustedProxies {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                if let Ok(net) = entry.parse::<IpNet>() {
                    return Ok(net);
                }
                let ip = entry
                    .parse::<IpAddr>()
                    .map_err(|_| invalid_proxy(entry))?;
                let host_bits = if ip.is_ipv4() { 32 } else { 128 };
                IpNet::new(ip, host_bits).map_err(|_| invalid_proxy(entry))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

fn invalid_proxy(entry: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: "TRUSTED_PROXIES",
        value: entry.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub ip: String,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    pub user_agent: String,
}

impl Principal {
    pub fn from_http(req: &HttpRequest, proxies: &TrustedProxies) -> Self {
        let ip = req
            .peer_addr()
            .map(|peer| {
                let forwarded_for = req
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok());
                proxies.client_ip(peer.ip(), forwarded_for).to_string()
            })
            .unwrap_or_else(|| UNKNOWN_IP.to_string());

        Self {
            ip,
            user_id: header_value(req, USER_ID),
            api_key_id: header_value(req, API_KEY),
            user_agent: req
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn identity(&self) -> ClientIdentity {
        match &self.user_id {
            Some(user) => ClientIdentity::user(&self.ip, user),
            None => ClientIdentity::anonymous(&self.ip),
        }
    }
}

impl FromRequest for Principal {
    type Error = Infallible;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let proxies = req
            .app_data::<web::Data<AppState>>()
            .map(|state| state.trusted_proxies.clone())
            .unwrap_or_else(|| Arc::new(TrustedProxies::default()));
        ready(Ok(Principal::from_http(req, &proxies)))
    }
}

pub(crate) fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// `10.0.0.1`, `10.0.0.1:5123` and `[::1]:80` all yield the bare address.
fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|socket| socket.ip()))
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    fn proxies(raw: &str) -> TrustedProxies {
        raw.parse().unwrap()
    }

    #[test]
    fn reads_identity_headers() {
        let req = TestRequest::default()
            .peer_addr("203.0.113.7:50000".parse().unwrap())
            .insert_header((USER_ID, "user-42"))
            .insert_header((API_KEY, "key-1"))
            .insert_header((header::USER_AGENT, "curl/8.0"))
            .to_http_request();

        let principal = Principal::from_http(&req, &TrustedProxies::default());
        assert_eq!(principal.ip, "203.0.113.7");
        assert_eq!(principal.user_id.as_deref(), Some("user-42"));
        assert_eq!(principal.api_key_id.as_deref(), Some("key-1"));
        assert_eq!(principal.user_agent, "curl/8.0");
        assert_eq!(principal.identity().user_id.as_deref(), Some("user-42"));
    }

    #[test]
    fn peer_address_loses_its_port() {
        let req = TestRequest::default()
            .peer_addr("198.51.100.2:40122".parse().unwrap())
            .insert_header((USER_ID, "  "))
            .to_http_request();

        let principal = Principal::from_http(&req, &TrustedProxies::default());
        assert_eq!(principal.ip, "198.51.100.2");
        assert!(principal.user_id.is_none());
        assert!(principal.identity().user_id.is_none());
    }

    #[test]
    fn forwarded_for_from_an_untrusted_peer_is_ignored() {
        let req = TestRequest::default()
            .peer_addr("198.51.100.7:40000".parse().unwrap())
            .insert_header(("X-Forwarded-For", "203.0.113.99"))
            .insert_header(("Forwarded", "for=203.0.113.98"))
            .to_http_request();

        let principal = Principal::from_http(&req, &proxies("10.0.0.0/8"));
        assert_eq!(principal.ip, "198.51.100.7");
    }

    #[test]
    fn trusted_proxy_forwards_the_rightmost_untrusted_hop() {
        let req = TestRequest::default()
            .peer_addr("10.1.2.3:40000".parse().unwrap())
            .insert_header(("X-Forwarded-For", "1.1.1.1, 203.0.113.7, 10.9.9.9"))
            .to_http_request();

        let principal = Principal::from_http(&req, &proxies("10.0.0.0/8"));
        assert_eq!(principal.ip, "203.0.113.7");
    }

    #[test]
    fn chain_of_proxies_falls_back_to_leftmost_hop() {
        let trusted = proxies("10.0.0.0/8, 192.0.2.1");
        let peer: IpAddr = "192.0.2.1".parse().unwrap();

        assert_eq!(
            trusted.client_ip(peer, Some("10.0.0.5, 10.0.0.6")),
            "10.0.0.5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(trusted.client_ip(peer, None), peer);
        assert_eq!(trusted.client_ip(peer, Some("garbage")), peer);
    }

    #[test]
    fn proxy_list_accepts_cidrs_and_addresses() {
        let trusted = proxies("10.0.0.0/8, 192.0.2.1, ::1");
        assert!(trusted.contains(&"10.200.0.1".parse().unwrap()));
        assert!(trusted.contains(&"192.0.2.1".parse().unwrap()));
        assert!(!trusted.contains(&"192.0.2.2".parse().unwrap()));
        assert!(trusted.contains(&"::1".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<TrustedProxies>().is_err());
        assert!("proxy.internal".parse::<TrustedProxies>().is_err());
        assert!("".parse::<TrustedProxies>().unwrap().is_empty());
    }

    #[test]
    fn hops_may_carry_ports() {
        assert_eq!(parse_ip("[::1]:8080"), Some("::1".parse().unwrap()));
        assert_eq!(parse_ip("10.1.2.3:443"), Some("10.1.2.3".parse().unwrap()));
        assert_eq!(parse_ip("gateway.internal"), None);
    }
}
