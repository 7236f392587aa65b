//! Guarded outbound HTTP for `fetch`.
//!
//! A URL is only fetched after every address its host resolves to has been
//! checked against private, loopback, link-local and unique-local space. The
//! request is then pinned to the checked address so a second DNS answer cannot
//! redirect it, and redirects are never followed.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use super::CapabilityError;

/// Resolves hostnames for the fetch guard.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Every address `host` resolves to.
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Fixed host table, for tests and air-gapped deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    /// Create an empty table; every lookup fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `host` to `addrs`.
    pub fn with_host(mut self, host: impl Into<String>, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.hosts
            .insert(host.into().to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        match self.hosts.get(&host.to_ascii_lowercase()) {
            Some(addrs) => Ok(addrs.iter().map(|ip| SocketAddr::new(*ip, port)).collect()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {host}"),
            )),
        }
    }
}

/// Whether `ip` lies in address space snippets may not reach.
///
/// IPv6 forms that carry an IPv4 address (mapped, compatible, NAT64 and
/// 6to4) are judged by the address they carry.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => match embedded_v4(v6) {
            Some(v4) => is_blocked_v4(v4),
            None => is_blocked_v6(v6),
        },
    }
}

fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let s = ip.segments();
    let low = |hi: u16, lo: u16| Ipv4Addr::from((u32::from(hi) << 16) | u32::from(lo));
    match s {
        // ::a.b.c.d (deprecated IPv4-compatible); :: and ::1 stay IPv6
        [0, 0, 0, 0, 0, 0, hi, lo] if hi != 0 => Some(low(hi, lo)),
        // 64:ff9b::/96 NAT64
        [0x64, 0xff9b, 0, 0, 0, 0, hi, lo] => Some(low(hi, lo)),
        // 2002::/16 6to4
        [0x2002, hi, lo, ..] => Some(low(hi, lo)),
        _ => None,
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Validate `raw` and pick the address the request must connect to.
pub async fn check_url(raw: &str, resolver: &dyn Resolver) -> Result<(Url, SocketAddr), CapabilityError> {
    let url = Url::parse(raw).map_err(|e| CapabilityError::InvalidArgument(format!("invalid URL {raw:?}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(CapabilityError::Blocked(format!(
            "scheme {:?} is not allowed",
            url.scheme()
        )));
    }
    let port = url
        .port_or_known_default()
        .ok_or_else(|| CapabilityError::InvalidArgument(format!("URL has no port: {raw}")))?;

    let addrs = match url.host() {
        Some(Host::Ipv4(ip)) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
        Some(Host::Ipv6(ip)) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(blocked(&domain));
            }
            resolver
                .resolve(&domain, port)
                .await
                .map_err(|e| CapabilityError::Network(format!("could not resolve {domain}: {e}")))?
        }
        None => return Err(CapabilityError::InvalidArgument(format!("URL has no host: {raw}"))),
    };

    let Some(first) = addrs.first().copied() else {
        return Err(CapabilityError::Network(format!("no addresses for {raw}")));
    };
    if let Some(bad) = addrs.iter().find(|addr| is_blocked_ip(addr.ip())) {
        tracing::warn!(url = %raw, addr = %bad.ip(), "blocked fetch to private address");
        return Err(blocked(url.host_str().unwrap_or_default()));
    }

    Ok((url, first))
}

fn blocked(host: &str) -> CapabilityError {
    CapabilityError::Blocked(format!(
        "requests to private or local addresses are not allowed ({host})"
    ))
}

/// Request options passed from `fetch(url, options)`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FetchRequest {
    /// HTTP method, `GET` when absent.
    pub method: Option<String>,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Request body.
    pub body: Option<String>,
}

/// What `fetch` hands back to the snippet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Whether the status is 2xx.
    pub ok: bool,
    /// Final URL.
    pub url: String,
    /// Response headers, lower-cased.
    pub headers: BTreeMap<String, String>,
    /// Body decoded as UTF-8 (lossy).
    pub body: String,
    /// Whether the body was cut at the size cap.
    pub truncated: bool,
}

/// Perform a guarded request.
pub async fn fetch(
    raw_url: &str,
    request: FetchRequest,
    resolver: &dyn Resolver,
    timeout: Duration,
    max_body_bytes: usize,
) -> Result<FetchResponse, CapabilityError> {
    let (url, addr) = check_url(raw_url, resolver).await?;
    let client = pinned_client(&url, addr, timeout)?;

    let method = request.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| CapabilityError::InvalidArgument(format!("invalid HTTP method {method:?}")))?;

    let mut req = client.request(method, url.clone());
    for (name, value) in &request.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        req = req.body(body);
    }

    let started = std::time::Instant::now();
    let mut response = req.send().await.map_err(network)?;
    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();

    let mut body = Vec::new();
    let mut truncated = false;
    while let Some(chunk) = response.chunk().await.map_err(network)? {
        let room = max_body_bytes.saturating_sub(body.len());
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }

    tracing::debug!(
        url = %url,
        status = status.as_u16(),
        bytes = body.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "fetch completed"
    );

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        ok: status.is_success(),
        url: url.to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
        truncated,
    })
}

/// Client that connects to `addr` directly: no proxy, no redirects.
fn pinned_client(url: &Url, addr: SocketAddr, timeout: Duration) -> Result<reqwest::Client, CapabilityError> {
    let mut builder = reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout);
    if let Some(Host::Domain(domain)) = url.host() {
        builder = builder.resolve(domain, addr);
    }
    builder.build().map_err(network)
}

fn network(e: reqwest::Error) -> CapabilityError {
    if e.is_timeout() {
        CapabilityError::Network("request timed out".to_string())
    } else {
        CapabilityError::Network(e.to_string())
    }
}
