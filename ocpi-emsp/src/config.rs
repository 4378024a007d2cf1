//! Configuration for the EMSP receiver
//!
//! Own party identity, listener, counterparty access tokens and the CPO
//! command endpoints used for outbound commands.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use ocpi_core::{AccessStatus, PartyKey, Role};

/// Complete receiver configuration
#[derive(Debug, Clone)]
pub struct EmspConfig {
    /// This EMSP's own party (issuer of tokens)
    pub party: PartyKey,

    /// Socket the HTTP server binds to
    pub listen_addr: SocketAddr,

    /// Externally reachable base URL, used for `Link`, `Location` and
    /// command `response_url` values
    pub public_url: String,

    /// Path prefix of every module endpoint, empty for the root
    pub base_path: String,

    /// Server downgrade policy. When set it overrides the per-request
    /// `forceDowngrade` flag.
    pub allow_downgrades: Option<bool>,

    /// Retention of dispatched commands awaiting a result
    pub command_ttl: Duration,

    /// Interval of the expired-command sweep
    pub cleanup_interval: Duration,

    /// Page size when a listing request gives no limit
    pub default_page_limit: usize,

    /// Upper bound on a listing request's limit
    pub max_page_limit: usize,

    /// Timeout of outbound requests to CPOs
    pub request_timeout: Duration,

    /// Counterparties allowed to call the receiver
    pub parties: Vec<PartyAccess>,

    /// CPO command endpoints for outbound commands
    pub cpo_endpoints: Vec<CpoEndpoint>,
}

impl Default for EmspConfig {
    fn default() -> Self {
        Self {
            party: PartyKey::new("NL", "EMS"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            public_url: "http://localhost:8090".to_string(),
            base_path: "/ocpi/emsp/2.2".to_string(),
            allow_downgrades: None,
            command_ttl: ocpi_core::commands::DEFAULT_COMMAND_TTL,
            cleanup_interval: Duration::from_secs(60),
            default_page_limit: 100,
            max_page_limit: 1000,
            request_timeout: Duration::from_secs(30),
            parties: Vec::new(),
            cpo_endpoints: Vec::new(),
        }
    }
}

impl EmspConfig {
    /// Create config for the given own party
    pub fn new(party: PartyKey) -> Self {
        Self {
            party,
            ..Default::default()
        }
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_base_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = path.trim_matches('/');
        self.base_path = if path.is_empty() {
            String::new()
        } else {
            format!("/{}", path)
        };
        self
    }

    /// Fix the downgrade policy regardless of request flags
    pub fn with_downgrade_policy(mut self, allow: bool) -> Self {
        self.allow_downgrades = Some(allow);
        self
    }

    pub fn with_command_ttl(mut self, ttl: Duration) -> Self {
        self.command_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_page_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.default_page_limit = default_limit.max(1);
        self.max_page_limit = max_limit.max(self.default_page_limit);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allow a counterparty to call the receiver
    pub fn with_party(mut self, access: PartyAccess) -> Self {
        self.parties.push(access);
        self
    }

    pub fn with_cpo_endpoint(mut self, endpoint: CpoEndpoint) -> Self {
        self.cpo_endpoints.push(endpoint);
        self
    }

    /// Resolve a request's downgrade flag against the server policy
    pub fn allow_downgrade(&self, requested: bool) -> bool {
        self.allow_downgrades.unwrap_or(requested)
    }

    /// Public URL of a module path, e.g. `url("/tokens")`
    pub fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.public_url, self.base_path, path)
    }
}

/// Access granted to one counterparty token
#[derive(Debug, Clone, PartialEq)]
pub struct PartyAccess {
    pub token: String,
    pub party: PartyKey,
    pub role: Role,
    pub status: AccessStatus,
}

impl PartyAccess {
    /// Allowed CPO access
    pub fn cpo(token: impl Into<String>, party: PartyKey) -> Self {
        Self {
            token: token.into(),
            party,
            role: Role::Cpo,
            status: AccessStatus::Allowed,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn blocked(mut self) -> Self {
        self.status = AccessStatus::Blocked;
        self
    }
}

/// Parses `TOKEN=CC/PID[:ROLE[:STATUS]]`, e.g. `secret=DE/GEF` or
/// `secret=DE/GEF:CPO:BLOCKED`
impl FromStr for PartyAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected TOKEN=CC/PID, got '{}'", s))?;
        if token.is_empty() {
            return Err("access token must not be empty".to_string());
        }

        let mut parts = rest.split(':');
        let party: PartyKey = parts.next().unwrap_or_default().parse()?;

        let role = match parts.next() {
            Some(role) => parse_role(role)?,
            None => Role::Cpo,
        };
        let status = match parts.next().map(|s| s.to_ascii_uppercase()) {
            None => AccessStatus::Allowed,
            Some(s) if s == "ALLOWED" => AccessStatus::Allowed,
            Some(s) if s == "BLOCKED" => AccessStatus::Blocked,
            Some(other) => return Err(format!("unknown access status '{}'", other)),
        };

        Ok(Self {
            token: token.to_string(),
            party,
            role,
            status,
        })
    }
}

fn parse_role(s: &str) -> Result<Role, String> {
    match s.to_ascii_uppercase().as_str() {
        "CPO" => Ok(Role::Cpo),
        "EMSP" => Ok(Role::Emsp),
        "HUB" => Ok(Role::Hub),
        "NAP" => Ok(Role::Nap),
        "NSP" => Ok(Role::Nsp),
        "OTHER" => Ok(Role::Other),
        "SCSP" => Ok(Role::Scsp),
        other => Err(format!("unknown role '{}'", other)),
    }
}

/// Commands endpoint of a CPO
#[derive(Debug, Clone, PartialEq)]
pub struct CpoEndpoint {
    pub party: PartyKey,
    /// Credentials token presented to the CPO
    pub token: String,
    /// Base URL of the CPO's commands module
    pub commands_url: String,
}

/// Parses `CC/PID=TOKEN@URL`
impl FromStr for CpoEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (party, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected CC/PID=TOKEN@URL, got '{}'", s))?;
        let (token, url) = rest
            .split_once('@')
            .ok_or_else(|| format!("expected TOKEN@URL, got '{}'", rest))?;

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(format!("commands URL must be http(s), got '{}'", url));
        }

        Ok(Self {
            party: party.parse()?,
            token: token.to_string(),
            commands_url: url.trim_end_matches('/').to_string(),
        })
    }
}
