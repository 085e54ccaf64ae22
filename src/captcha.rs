use rand::Rng;
use tracing::debug;

use crate::degraded::Outcome;
use crate::token_store::{TokenStore, Verification, DEFAULT_TTL};

pub const COOKIE_NAME: &str = "captcha";
pub const DEFAULT_CODE_LENGTH: usize = 4;

const TOKEN_PREFIX: &str = "t.";
const CODE_PREFIX: &str = "c.";

/// A random numeric code of `length` digits.
pub fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// The short-lived cookie that binds a challenge to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaCookie {
    pub value: String,
    pub max_age: u64,
}

impl CaptchaCookie {
    pub fn set_cookie_header(&self) -> String {
        format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            COOKIE_NAME, self.value, self.max_age
        )
    }

    pub fn clear_cookie_header() -> String {
        format!("{}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax", COOKIE_NAME)
    }
}

/// A code to render and the cookie to send along with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub code: String,
    pub cookie: CaptchaCookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaResult {
    Ok,
    Expired,
    Mismatch { attempts_remaining: u32 },
    /// The store failed mid-verification. Report "busy, try again" and keep the cookie.
    Unavailable,
}

impl CaptchaResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, CaptchaResult::Ok)
    }

    /// Whether the response must clear the captcha cookie.
    pub fn clears_cookie(&self) -> bool {
        match self {
            CaptchaResult::Ok | CaptchaResult::Expired => true,
            CaptchaResult::Mismatch { attempts_remaining } => *attempts_remaining == 0,
            CaptchaResult::Unavailable => false,
        }
    }
}

impl From<Verification> for CaptchaResult {
    fn from(verification: Verification) -> Self {
        match verification {
            Verification::Ok => CaptchaResult::Ok,
            Verification::Expired => CaptchaResult::Expired,
            Verification::Mismatch { attempts_remaining } => {
                CaptchaResult::Mismatch { attempts_remaining }
            }
        }
    }
}

enum CookieValue<'a> {
    Token(&'a str),
    Code(&'a str),
}

impl<'a> CookieValue<'a> {
    fn parse(value: &'a str) -> Option<CookieValue<'a>> {
        if let Some(token) = value.strip_prefix(TOKEN_PREFIX) {
            return Some(CookieValue::Token(token)).filter(|_| !token.is_empty());
        }
        if let Some(code) = value.strip_prefix(CODE_PREFIX) {
            return Some(CookieValue::Code(code)).filter(|_| !code.is_empty());
        }
        None
    }
}

/// Captcha issuance and verification for the HTTP layer.
///
/// With a reachable store the cookie carries a token id and the code stays server side. Otherwise
/// the code itself goes into the cookie and is compared directly, one guess per cookie.
#[derive(Clone)]
pub struct Captcha {
    store: TokenStore,
    ttl: u64,
    code_length: usize,
}

impl Captcha {
    pub fn new(store: TokenStore) -> Captcha {
        Captcha {
            store,
            ttl: DEFAULT_TTL,
            code_length: DEFAULT_CODE_LENGTH,
        }
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl.max(1);
        self
    }

    pub fn with_code_length(mut self, code_length: usize) -> Self {
        self.code_length = code_length.max(1);
        self
    }

    pub async fn issue(&self) -> Challenge {
        self.issue_code(generate_code(self.code_length)).await
    }

    pub async fn issue_code(&self, code: String) -> Challenge {
        let value = match self.store.issue(&code, self.ttl).await {
            Outcome::Ready(token) => format!("{}{}", TOKEN_PREFIX, token),
            Outcome::Disabled => {
                debug!("token store disabled, carrying the code in the cookie");
                format!("{}{}", CODE_PREFIX, code)
            }
        };

        Challenge {
            code,
            cookie: CaptchaCookie {
                value,
                max_age: self.ttl,
            },
        }
    }

    /// Checks `guess` against the challenge referenced by the cookie value. A missing or malformed
    /// cookie counts as expired.
    pub async fn verify(&self, cookie: Option<&str>, guess: &str) -> CaptchaResult {
        let guess = guess.trim();

        match cookie.and_then(CookieValue::parse) {
            None => CaptchaResult::Expired,
            Some(CookieValue::Token(token)) => match self.store.verify(token, guess).await {
                Outcome::Ready(verification) => verification.into(),
                Outcome::Disabled => CaptchaResult::Unavailable,
            },
            Some(CookieValue::Code(code)) if code == guess => CaptchaResult::Ok,
            Some(CookieValue::Code(_)) => CaptchaResult::Mismatch {
                attempts_remaining: 0,
            },
        }
    }
}
