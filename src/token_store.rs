use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::client::{Client, KeyTtl};
use crate::degraded::{guarded, Outcome};
use crate::ClientError;

pub const DEFAULT_PREFIX: &str = "captcha:";
/// Lifetime of an issued code in seconds.
pub const DEFAULT_TTL: u64 = 120;
/// Wrong guesses allowed before the code is destroyed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The guess matched. The code is gone.
    Ok,
    /// No such code: it expired, was never issued, or was already used up.
    Expired,
    /// The guess was wrong. At zero attempts remaining the code is gone.
    Mismatch { attempts_remaining: u32 },
}

impl Verification {
    /// Whether the token is finished with and should be forgotten by the caller.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verification::Mismatch { attempts_remaining } if *attempts_remaining > 0)
    }
}

/// Single-use codes kept in the store under random token ids.
///
/// Each token owns two keys: `<prefix><id>` holds the code, `<prefix><id>:attempts` counts wrong
/// guesses and expires no later than the code.
#[derive(Clone)]
pub struct TokenStore {
    client: Option<Client>,
    prefix: String,
    timeout: Option<Duration>,
    max_attempts: u32,
}

impl TokenStore {
    pub fn new(client: Option<Client>) -> TokenStore {
        TokenStore {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            timeout: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Stores `code` for `ttl` seconds under a fresh token id and returns the id.
    pub async fn issue(&self, code: &str, ttl: u64) -> Outcome<String> {
        let Some(client) = &self.client else {
            return Outcome::Disabled;
        };

        let token = Uuid::new_v4().simple().to_string();
        let key = self.code_key(&token);

        guarded("token_issue", self.timeout, async {
            client.set_ex(&key, code.as_bytes(), ttl.max(1)).await?;
            debug!(%token, ttl, "issued token");
            Ok(token)
        })
        .await
    }

    /// Checks `guess` against the code stored under `token`.
    ///
    /// A failure talking to the store is `Disabled`. The code is removed by the last command sent,
    /// so the token stays usable unless it is that command's reply that got lost. A wrong-guess
    /// count may already have been charged.
    pub async fn verify(&self, token: &str, guess: &str) -> Outcome<Verification> {
        let Some(client) = &self.client else {
            return Outcome::Disabled;
        };

        let code_key = self.code_key(token);
        let attempts_key = format!("{}:attempts", code_key);

        let verification = guarded(
            "token_verify",
            self.timeout,
            verify(client, &code_key, &attempts_key, guess, self.max_attempts),
        )
        .await;

        if let Outcome::Ready(verification) = &verification {
            debug!(%token, ?verification, "verified token");
        }
        verification
    }

    fn code_key(&self, token: &str) -> String {
        format!("{}{}", self.prefix, token)
    }
}

async fn verify(
    client: &Client,
    code_key: &str,
    attempts_key: &str,
    guess: &str,
    max_attempts: u32,
) -> Result<Verification, ClientError> {
    let Some(code) = client.get(code_key).await? else {
        return Ok(Verification::Expired);
    };

    if code.as_ref() == guess.as_bytes() {
        // The code goes last, so a failure before it leaves the token usable. Of two correct
        // guesses racing here, only one DEL removes the code.
        client.del(&[attempts_key]).await?;
        if client.del(&[code_key]).await? == 0 {
            return Ok(Verification::Expired);
        }
        return Ok(Verification::Ok);
    }

    let attempts = client.incr(attempts_key).await?.max(0) as u64;

    if attempts == 1 {
        // The counter must not outlive the code it counts for.
        let ttl = match client.ttl(code_key).await? {
            KeyTtl::Expires(seconds) => seconds.max(1),
            KeyTtl::Persistent => DEFAULT_TTL,
            KeyTtl::Missing => 1,
        };
        client.expire(attempts_key, ttl).await?;
    }

    if attempts >= u64::from(max_attempts) {
        client.del(&[code_key, attempts_key]).await?;
        return Ok(Verification::Mismatch {
            attempts_remaining: 0,
        });
    }

    Ok(Verification::Mismatch {
        attempts_remaining: max_attempts - attempts as u32,
    })
}
