use std::time::Duration;

use tracing::{debug, warn};

use crate::client::{Client, KeyTtl};
use crate::degraded::{guarded, Outcome};
use crate::ClientError;

pub const DEFAULT_PREFIX: &str = "rate_limit:";

/// At most `limit` hits per `window` seconds for `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub key: String,
    pub limit: u64,
    pub window: u64,
}

impl Rule {
    pub fn new(key: impl Into<String>, limit: u64, window: u64) -> Rule {
        Rule {
            key: key.into(),
            limit,
            window,
        }
    }
}

/// State of one fixed window after counting a hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub key: String,
    pub allowed: bool,
    pub limit: u64,
    /// Hits in the current window, this one included.
    pub count: u64,
    pub remaining: u64,
    /// Seconds until the window closes and the counter starts over.
    pub reset_after: u64,
}

impl Decision {
    fn new(rule: &Rule, count: u64, reset_after: u64) -> Decision {
        Decision {
            key: rule.key.clone(),
            allowed: count <= rule.limit,
            limit: rule.limit,
            count,
            remaining: rule.limit.saturating_sub(count),
            reset_after,
        }
    }

    /// Response headers describing this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_after.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.reset_after.to_string()));
        }
        headers
    }
}

/// Fixed-window rate limiting on top of INCR and EXPIRE.
///
/// Every check counts, including the ones that end up denied. Without a client every check is
/// `Disabled`, and so is any check the store fails to answer.
#[derive(Clone)]
pub struct RateLimiter {
    client: Option<Client>,
    prefix: String,
    timeout: Option<Duration>,
}

impl RateLimiter {
    pub fn new(client: Option<Client>) -> RateLimiter {
        RateLimiter {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            timeout: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Bounds how long a check may wait on the store before it is `Disabled`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub async fn check(&self, key: &str, limit: u64, window: u64) -> Outcome<Decision> {
        self.check_rule(&Rule::new(key, limit, window)).await
    }

    pub async fn check_rule(&self, rule: &Rule) -> Outcome<Decision> {
        let Some(client) = &self.client else {
            return Outcome::Disabled;
        };

        let key = format!("{}{}", self.prefix, rule.key);
        // EXPIRE 0 would drop the counter at once and never limit anything.
        let window = rule.window.max(1);

        guarded("rate_limit", self.timeout, hit(client, &key, window))
            .await
            .map(|(count, reset_after)| Decision::new(rule, count, reset_after))
    }

    /// Checks the rules in order and stops at the first one that denies, so later counters are not
    /// charged for a request that is refused anyway. When all pass, the decision with the least
    /// remaining budget is returned. No rules at all is `Disabled`.
    pub async fn check_all(&self, rules: &[Rule]) -> Outcome<Decision> {
        let mut tightest: Option<Decision> = None;

        for rule in rules {
            let decision = match self.check_rule(rule).await {
                Outcome::Ready(decision) => decision,
                Outcome::Disabled => return Outcome::Disabled,
            };

            if !decision.allowed {
                debug!(key = %decision.key, count = decision.count, "rate limit exceeded");
                return Outcome::Ready(decision);
            }

            if tightest
                .as_ref()
                .map_or(true, |tightest| decision.remaining < tightest.remaining)
            {
                tightest = Some(decision);
            }
        }

        match tightest {
            Some(decision) => Outcome::Ready(decision),
            None => Outcome::Disabled,
        }
    }
}

/// Counts one hit. Returns the count and the seconds left in the window.
///
/// Only the hit that creates the counter sets its expiry, so later hits never push the window
/// out. A counter found without an expiry (the EXPIRE after its first hit never made it) gets one.
async fn hit(client: &Client, key: &str, window: u64) -> Result<(u64, u64), ClientError> {
    let count = client.incr(key).await?.max(0) as u64;

    if count == 1 {
        client.expire(key, window).await?;
        return Ok((count, window));
    }

    let reset_after = match client.ttl(key).await? {
        KeyTtl::Expires(seconds) => seconds,
        KeyTtl::Persistent => {
            warn!(key, "rate limit counter has no expiry, re-arming");
            client.expire(key, window).await?;
            window
        }
        // The window closed between INCR and TTL.
        KeyTtl::Missing => window,
    };

    Ok((count, reset_after))
}
