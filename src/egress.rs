// src/egress.rs
//
// Outbound-network gate for sandboxed code. Destinations are classified by
// address range; anything that needs a human answer goes through the
// elicitation channel, and without one the answer is deny. One policy
// instance lives exactly as long as one sandbox invocation, so cached
// decisions never leak across runs.

use crate::confirm::ConfirmationRouter;
use crate::error::{GatewayError, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::debug;

const DNS_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressClass {
    Loopback,
    PrivateLan,
    LinkLocal,
    PublicInternet,
    UnresolvedHostname,
}

impl EgressClass {
    fn describe(self) -> &'static str {
        match self {
            EgressClass::Loopback => "loopback",
            EgressClass::PrivateLan => "private LAN",
            EgressClass::LinkLocal => "link-local",
            EgressClass::PublicInternet => "public internet",
            EgressClass::UnresolvedHostname => "unresolved hostname",
        }
    }
}

fn private_v4() -> &'static [Ipv4Net; 3] {
    static NETS: OnceLock<[Ipv4Net; 3]> = OnceLock::new();
    NETS.get_or_init(|| {
        [
            "10.0.0.0/8".parse().expect("static net"),
            "172.16.0.0/12".parse().expect("static net"),
            "192.168.0.0/16".parse().expect("static net"),
        ]
    })
}

fn link_local_v4() -> &'static Ipv4Net {
    static NET: OnceLock<Ipv4Net> = OnceLock::new();
    NET.get_or_init(|| "169.254.0.0/16".parse().expect("static net"))
}

fn private_v6() -> &'static Ipv6Net {
    static NET: OnceLock<Ipv6Net> = OnceLock::new();
    NET.get_or_init(|| "fc00::/7".parse().expect("static net"))
}

fn link_local_v6() -> &'static Ipv6Net {
    static NET: OnceLock<Ipv6Net> = OnceLock::new();
    NET.get_or_init(|| "fe80::/10".parse().expect("static net"))
}

pub fn classify_ip(ip: IpAddr) -> EgressClass {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                EgressClass::Loopback
            } else if link_local_v4().contains(&v4) {
                EgressClass::LinkLocal
            } else if private_v4().iter().any(|net| net.contains(&v4)) {
                EgressClass::PrivateLan
            } else {
                EgressClass::PublicInternet
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                EgressClass::Loopback
            } else if link_local_v6().contains(&v6) {
                EgressClass::LinkLocal
            } else if private_v6().contains(&v6) {
                EgressClass::PrivateLan
            } else {
                EgressClass::PublicInternet
            }
        }
    }
}

/// Classify a hostname, resolving through DNS when it is not a literal
/// address. Unicode hostnames are punycoded first so lookalikes collapse
/// onto their real destination.
pub async fn classify_host(host: &str) -> EgressClass {
    let normalized = idna::domain_to_ascii(host).unwrap_or_else(|_| host.to_string());

    if let Ok(ip) = normalized.parse::<IpAddr>() {
        return classify_ip(ip);
    }
    // Bracketed IPv6 literal from a URL.
    if let Ok(ip) = normalized.trim_matches(['[', ']']).parse::<IpAddr>() {
        return classify_ip(ip);
    }
    if normalized.eq_ignore_ascii_case("localhost") {
        return EgressClass::Loopback;
    }

    let lookup = tokio::net::lookup_host((normalized.as_str(), 0u16));
    let result = match tokio::time::timeout(DNS_TIMEOUT, lookup).await {
        Ok(Ok(mut addresses)) => match addresses.next() {
            Some(addr) => classify_ip(addr.ip()),
            None => EgressClass::UnresolvedHostname,
        },
        _ => EgressClass::UnresolvedHostname,
    };
    result
}

/// Per-invocation egress policy.
pub struct EgressPolicy {
    confirm: Arc<ConfirmationRouter>,
    /// Tightened stance: prompt even for the public internet.
    restrict_public: bool,
    /// host:port -> allowed, for the lifetime of this invocation.
    decisions: Mutex<HashMap<String, bool>>,
}

impl EgressPolicy {
    pub fn new(confirm: Arc<ConfirmationRouter>) -> Self {
        EgressPolicy {
            confirm,
            restrict_public: false,
            decisions: Mutex::new(HashMap::new()),
        }
    }

    pub fn restricted(mut self) -> Self {
        self.restrict_public = true;
        self
    }

    /// Decide whether the sandbox may open a connection to `url`.
    pub async fn check_url(&self, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url)
            .map_err(|e| GatewayError::InvalidRequest(format!("bad url '{url}': {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| GatewayError::InvalidRequest(format!("url '{url}' has no host")))?;
        let port = parsed.port_or_known_default().unwrap_or(0);
        self.check(host, port).await
    }

    pub async fn check(&self, host: &str, port: u16) -> Result<()> {
        let destination = format!("{host}:{port}");
        if let Some(allowed) = self
            .decisions
            .lock()
            .ok()
            .and_then(|cache| cache.get(&destination).copied())
        {
            return if allowed {
                Ok(())
            } else {
                Err(self.blocked(&destination, "denied earlier in this run"))
            };
        }

        let class = classify_host(host).await;
        let verdict = match class {
            EgressClass::Loopback => Ok(()),
            EgressClass::PublicInternet if !self.restrict_public => Ok(()),
            _ => self.prompt(&destination, class).await,
        };

        if let Ok(mut cache) = self.decisions.lock() {
            cache.insert(destination, verdict.is_ok());
        }
        verdict
    }

    async fn prompt(&self, destination: &str, class: EgressClass) -> Result<()> {
        // Prompting requires an elicitation-capable host; a native dialog
        // popping up under sandboxed code would be indistinguishable from
        // malware, so without elicitation the answer is deny.
        if !self.confirm.has_preferred().await {
            return Err(self.blocked(
                destination,
                &format!(
                    "{} destination requires consent and the host does not support elicitation",
                    class.describe()
                ),
            ));
        }

        let message = format!(
            "Sandboxed code wants to reach {destination} ({}). Allow?",
            class.describe()
        );
        let schema = json!({
            "type": "object",
            "properties": {
                "allow": {"type": "boolean", "description": "Permit this connection"}
            },
            "required": ["allow"]
        });

        match self.confirm.confirm(&message, schema).await {
            Ok(confirmation) if confirmation.is_accept() => {
                debug!("egress to {destination} approved");
                Ok(())
            }
            Ok(_) => Err(self.blocked(destination, "the user declined")),
            Err(e) => Err(self.blocked(destination, &format!("consent channel failed: {e}"))),
        }
    }

    fn blocked(&self, destination: &str, reason: &str) -> GatewayError {
        GatewayError::NetworkBlocked {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }
}
