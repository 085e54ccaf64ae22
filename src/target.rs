use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

use crate::ClientError;

pub const SCHEME: &str = "redis";
pub const DEFAULT_PORT: u16 = 6379;

/// Where the store lives and how to log into it, parsed from
/// `redis://[username[:password]@]host[:port][/db]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database selected after authenticating. `None` stays on database 0.
    pub database: Option<u32>,
}

/// The AUTH form to send, if any.
#[derive(Debug, PartialEq, Eq)]
pub enum Auth<'a> {
    Password(&'a str),
    UsernamePassword(&'a str, &'a str),
}

impl ConnectionTarget {
    pub fn parse(input: &str) -> Result<ConnectionTarget, ClientError> {
        let url = Url::parse(input)?;

        if url.scheme() != SCHEME {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme {}, expected {}",
                url.scheme(),
                SCHEME
            )));
        }

        let host = match url.host() {
            // Brackets are URL syntax, the socket address wants the bare address.
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => return Err(ClientError::InvalidUrl("missing host".to_string())),
        };
        if host.is_empty() {
            return Err(ClientError::InvalidUrl("missing host".to_string()));
        }

        let username = Some(percent_decode(url.username())?).filter(|name| !name.is_empty());
        let password = url.password().map(percent_decode).transpose()?;

        let database = match url.path().trim_matches('/') {
            "" => None,
            db => Some(db.parse::<u32>().map_err(|_| {
                ClientError::InvalidUrl(format!("invalid database index {}", db))
            })?),
        };

        Ok(ConnectionTarget {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password,
            database,
        })
    }

    /// AUTH is only sent when a password is present. A username without a password is ignored.
    pub fn auth(&self) -> Option<Auth<'_>> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Auth::UsernamePassword(username, password)),
            (None, Some(password)) => Some(Auth::Password(password)),
            (_, None) => None,
        }
    }

    /// The database to SELECT, if it is not the default one.
    pub fn select(&self) -> Option<u32> {
        self.database.filter(|db| *db != 0)
    }
}

impl FromStr for ConnectionTarget {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionTarget::parse(s)
    }
}

// Never prints the password.
impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", SCHEME)?;
        match (&self.username, &self.password) {
            (Some(username), Some(_)) => write!(f, "{}:***@", username)?,
            (Some(username), None) => write!(f, "{}@", username)?,
            (None, Some(_)) => write!(f, ":***@")?,
            (None, None) => {}
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)?;
        } else {
            write!(f, "{}:{}", self.host, self.port)?;
        }
        if let Some(db) = self.database {
            write!(f, "/{}", db)?;
        }
        Ok(())
    }
}

fn percent_decode(input: &str) -> Result<String, ClientError> {
    urlencoding::decode(input)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ClientError::InvalidUrl("credentials are not valid UTF-8".to_string()))
}
