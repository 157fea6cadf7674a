//! Proxy-identity stamping and trust resolution for forwarded requests.
//!
//! Every request leaving the gateway is stamped with a digest header carrying
//! the process's secret token plus a client-IP header derived from the inbound
//! socket's own peer address. A backend that is also reachable directly must
//! call [`resolve`] before believing either header; a forged or missing digest
//! means the client-identity headers are attacker-controlled.

use crate::request::ParsedRequest;
use log::warn;
use prometheus::{IntCounter, Opts, Registry};
use std::net::IpAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Digest header stamped onto every forwarded request.
pub const DIGEST_HEADER: &str = "X-Tollgate-Digest";

/// Client-IP header injected by the gateway. Replaces whatever
/// `X-Forwarded-For` the client itself sent.
pub const CLIENT_IP_HEADER: &str = "X-Forwarded-For";

/// The per-process shared secret. Generated once at startup, immutable until
/// process exit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyIdentity {
    token: String,
}

impl ProxyIdentity {
    fn generate() -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Builds an identity from a known token. Intended for backend-side
    /// deployments that share the secret out of band, and for tests.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Returns the process-wide identity, generating it on first use.
pub fn process_identity() -> &'static ProxyIdentity {
    static IDENTITY: OnceLock<ProxyIdentity> = OnceLock::new();
    IDENTITY.get_or_init(ProxyIdentity::generate)
}

/// Outcome of validating the trust headers on an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingDecision {
    /// Digest matched and a parseable client address was present.
    Trusted(IpAddr),
    /// The request must not be attributed to any forwarded address.
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingDigest,
    DigestMismatch,
    MissingClientIp,
    MalformedClientIp,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::MissingDigest => "digest header missing",
            RejectReason::DigestMismatch => "digest does not match proxy identity",
            RejectReason::MissingClientIp => "digest valid but client-IP header missing",
            RejectReason::MalformedClientIp => "client-IP header is not an IP address",
        };
        f.write_str(text)
    }
}

struct TrustTelemetry {
    resolved_trusted: IntCounter,
    resolved_rejected: IntCounter,
    registered: AtomicBool,
}

impl TrustTelemetry {
    fn new() -> Self {
        let trusted_opts = Opts::new(
            "trust_resolutions_trusted_total",
            "Forwarded requests whose digest and client-IP headers validated",
        )
        .namespace("tollgate");
        let rejected_opts = Opts::new(
            "trust_resolutions_rejected_total",
            "Forwarded requests rejected by trust validation",
        )
        .namespace("tollgate");
        Self {
            resolved_trusted: IntCounter::with_opts(trusted_opts).expect("trusted counter"),
            resolved_rejected: IntCounter::with_opts(rejected_opts).expect("rejected counter"),
            registered: AtomicBool::new(false),
        }
    }

    fn register_if_needed(&self, registry: &Registry) {
        if self.registered.load(Ordering::Relaxed) {
            return;
        }
        if let Err(err) = registry.register(Box::new(self.resolved_trusted.clone())) {
            warn!("Failed to register trust_resolutions_trusted metric: {}", err);
            return;
        }
        if let Err(err) = registry.register(Box::new(self.resolved_rejected.clone())) {
            warn!("Failed to register trust_resolutions_rejected metric: {}", err);
            return;
        }
        self.registered.store(true, Ordering::Relaxed);
    }
}

fn telemetry() -> &'static TrustTelemetry {
    static TELEMETRY: OnceLock<TrustTelemetry> = OnceLock::new();
    TELEMETRY.get_or_init(TrustTelemetry::new)
}

pub fn register_trust_metrics(registry: &Registry) {
    telemetry().register_if_needed(registry);
}

/// Stamps an outgoing request with the digest and a fresh client-IP header.
///
/// `peer` must be the address of the inbound TLS socket, never anything the
/// client put in a header. Whatever `X-Forwarded-For` the client sent was
/// already stripped by the parser; this drops the captured copy as well.
pub fn stamp(req: &mut ParsedRequest, identity: &ProxyIdentity, peer: IpAddr) {
    req.forwarded_for = None;
    req.headers
        .push((DIGEST_HEADER.to_string(), identity.token().to_string()));
    req.headers
        .push((CLIENT_IP_HEADER.to_string(), peer.to_string()));
}

/// Validates the digest/client-IP header pair against the expected identity.
///
/// The digest comparison is case-insensitive. A correct digest with a missing
/// or malformed client address is still a hard rejection: attribution must
/// never silently fall back to another address.
pub fn resolve(
    identity: &ProxyIdentity,
    digest: Option<&str>,
    client_ip: Option<&str>,
) -> ForwardingDecision {
    let decision = match digest {
        None => ForwardingDecision::Rejected(RejectReason::MissingDigest),
        Some(d) if !d.eq_ignore_ascii_case(identity.token()) => {
            ForwardingDecision::Rejected(RejectReason::DigestMismatch)
        }
        Some(_) => match client_ip {
            None => ForwardingDecision::Rejected(RejectReason::MissingClientIp),
            Some(raw) => match raw.trim().parse::<IpAddr>() {
                Ok(ip) => ForwardingDecision::Trusted(ip),
                Err(_) => ForwardingDecision::Rejected(RejectReason::MalformedClientIp),
            },
        },
    };

    match decision {
        ForwardingDecision::Trusted(_) => telemetry().resolved_trusted.inc(),
        ForwardingDecision::Rejected(reason) => {
            telemetry().resolved_rejected.inc();
            // security-relevant: keep distinct from ordinary parse noise
            warn!("trust validation rejected a request: {}", reason);
        }
    }

    decision
}

/// Trust validation for a request that came through the crate's own parser,
/// which captures `X-Forwarded-For` into `forwarded_for`.
pub fn resolve_request(identity: &ProxyIdentity, req: &ParsedRequest) -> ForwardingDecision {
    resolve(identity, req.header(DIGEST_HEADER), req.forwarded_for.as_deref())
}
