use std::time::Duration;

use clap::{Parser, Subcommand};
use kvgate::captcha::{Captcha, CaptchaCookie};
use kvgate::rate_limit::RateLimiter;
use kvgate::token_store::{TokenStore, DEFAULT_TTL};
use kvgate::{Client, ClientConfig, Error, Outcome};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Inspect the rate limiter and the captcha store")]
struct Args {
    /// Store to use, e.g. redis://:password@localhost:6379/1. Without it everything runs degraded.
    #[arg(long, env = "KVGATE_URL")]
    url: Option<String>,

    /// Give up on the store after this many milliseconds
    #[arg(long, env = "KVGATE_TIMEOUT_MS", default_value_t = 2000)]
    timeout_ms: u64,

    /// Log filter, e.g. debug or kvgate=trace
    #[arg(long, env = "KVGATE_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the store answers
    Ping,
    /// Count a hit against a fixed-window limit
    Check {
        key: String,
        #[arg(long, default_value_t = 10)]
        limit: u64,
        /// Window length in seconds
        #[arg(long, default_value_t = 60)]
        window: u64,
    },
    /// Issue a captcha and print its code and cookie
    Issue {
        /// Use this code instead of a random one
        #[arg(long)]
        code: Option<String>,
        #[arg(long, default_value_t = DEFAULT_TTL)]
        ttl: u64,
    },
    /// Verify a guess against a captcha cookie value
    Verify { cookie: String, guess: String },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .try_init()
        .map_err(|e| eprintln!("Failed to initialize global tracing: {}", e));

    let timeout = Duration::from_millis(args.timeout_ms);
    let client = match &args.url {
        Some(url) => Some(Client::new(
            ClientConfig::from_url(url)?.with_connect_timeout(timeout),
        )),
        None => {
            info!("no store configured, running degraded");
            None
        }
    };

    match args.command {
        Command::Ping => {
            let client = client.ok_or("ping needs --url or KVGATE_URL")?;
            tokio::time::timeout(timeout, client.ping())
                .await
                .map_err(|_| "store did not answer in time")??;
            info!(store = %client.config().target, "PONG");
        }
        Command::Check { key, limit, window } => {
            let limiter = RateLimiter::new(client).with_timeout(timeout);
            match limiter.check(&key, limit, window).await {
                Outcome::Ready(decision) => {
                    info!(allowed = decision.allowed, count = decision.count, "checked {}", key);
                    for (name, value) in decision.headers() {
                        println!("{}: {}", name, value);
                    }
                }
                Outcome::Disabled => println!("disabled: request allowed"),
            }
        }
        Command::Issue { code, ttl } => {
            let captcha = Captcha::new(TokenStore::new(client).with_timeout(timeout)).with_ttl(ttl);
            let challenge = match code {
                Some(code) => captcha.issue_code(code).await,
                None => captcha.issue().await,
            };
            println!("code: {}", challenge.code);
            println!("Set-Cookie: {}", challenge.cookie.set_cookie_header());
        }
        Command::Verify { cookie, guess } => {
            let captcha = Captcha::new(TokenStore::new(client).with_timeout(timeout));
            let result = captcha.verify(Some(&cookie), &guess).await;
            debug!(?result, "verified");
            println!("{:?}", result);
            if result.clears_cookie() {
                println!("Set-Cookie: {}", CaptchaCookie::clear_cookie_header());
            }
        }
    }

    Ok(())
}
