use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{info, warn};
use rand::{rngs::OsRng, RngCore};

pub const DEFAULT_PORT: u16 = 2052;
pub const DEFAULT_TOKEN_TTL_HOURS: u64 = 24;
pub const DEFAULT_RESOLVED_ALERT_TTL_SECS: u64 = 10 * 60;
pub const DEFAULT_JOB_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_OTP_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_CERT_PATH: &str = "ssl/room/certificate.pem";
pub const DEFAULT_KEY_PATH: &str = "ssl/room/private.key";

#[derive(Debug, Clone)]
pub struct AdminCredentials {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub token_secret: Vec<u8>,
    pub token_ttl: chrono::Duration,
    pub admin: Option<AdminCredentials>,
    /// Snapshot file for the store; `None` keeps everything in memory.
    pub data_path: Option<PathBuf>,
    pub resolved_alert_ttl: chrono::Duration,
    pub job_poll_interval: Duration,
    pub otp_ttl: chrono::Duration,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            token_secret: random_secret(),
            token_ttl: ttl_from(DEFAULT_TOKEN_TTL_HOURS, chrono::Duration::try_hours).unwrap_or_else(max_ttl),
            admin: None,
            data_path: None,
            resolved_alert_ttl: ttl_from(DEFAULT_RESOLVED_ALERT_TTL_SECS, chrono::Duration::try_seconds)
                .unwrap_or_else(max_ttl),
            job_poll_interval: Duration::from_secs(DEFAULT_JOB_POLL_INTERVAL_SECS),
            otp_ttl: ttl_from(DEFAULT_OTP_TTL_SECS, chrono::Duration::try_seconds).unwrap_or_else(max_ttl),
            tls_cert_path: PathBuf::from(DEFAULT_CERT_PATH),
            tls_key_path: PathBuf::from(DEFAULT_KEY_PATH),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    pub fn load() -> Self {
        let token_secret = match env::var("TOKEN_SECRET") {
            Ok(secret) if !secret.is_empty() => secret.into_bytes(),
            _ => {
                warn!("TOKEN_SECRET not set, tokens will not survive a restart");
                random_secret()
            }
        };

        let admin = match (env::var("ADMIN_EMAIL"), env::var("ADMIN_PASSWORD")) {
            (Ok(email), Ok(password)) if !email.is_empty() && !password.is_empty() => {
                Some(AdminCredentials {
                    email,
                    password,
                    name: env::var("ADMIN_NAME").unwrap_or_else(|_| "Admin".to_string()),
                })
            }
            _ => {
                warn!("ADMIN_EMAIL/ADMIN_PASSWORD not set, no admin account will be seeded");
                None
            }
        };

        Self {
            bind_addr: try_load("BIND_ADDR", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: try_load("PORT", DEFAULT_PORT),
            token_secret,
            token_ttl: load_ttl("TOKEN_TTL_HOURS", DEFAULT_TOKEN_TTL_HOURS, chrono::Duration::try_hours),
            admin,
            data_path: env::var("DATA_PATH").ok().filter(|p| !p.is_empty()).map(PathBuf::from),
            resolved_alert_ttl: load_ttl(
                "RESOLVED_ALERT_TTL_SECS",
                DEFAULT_RESOLVED_ALERT_TTL_SECS,
                chrono::Duration::try_seconds,
            ),
            job_poll_interval: Duration::from_secs(try_load(
                "JOB_POLL_INTERVAL_SECS",
                DEFAULT_JOB_POLL_INTERVAL_SECS,
            )),
            otp_ttl: load_ttl("OTP_TTL_SECS", DEFAULT_OTP_TTL_SECS, chrono::Duration::try_seconds),
            tls_cert_path: env::var("TLS_CERT_PATH").map_or_else(|_| PathBuf::from(DEFAULT_CERT_PATH), PathBuf::from),
            tls_key_path: env::var("TLS_KEY_PATH").map_or_else(|_| PathBuf::from(DEFAULT_KEY_PATH), PathBuf::from),
        }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Certificate and key paths, if both files are present on disk.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        if !self.tls_cert_path.is_file() {
            warn!("Certificate file {} not found", self.tls_cert_path.display());
            return None;
        }
        if !self.tls_key_path.is_file() {
            warn!("Private key file {} not found", self.tls_key_path.display());
            return None;
        }
        Some((self.tls_cert_path.as_path(), self.tls_key_path.as_path()))
    }
}

fn try_load<T: FromStr + Display>(key: &str, default: T) -> T
where
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
            default
        }),
        Err(_) => {
            info!("{key} not set, using default: {default}");
            default
        }
    }
}

/// Longest accepted TTL, so `now + ttl` stays a valid timestamp.
fn max_ttl() -> chrono::Duration {
    chrono::Duration::days(100 * 365)
}

fn ttl_from(units: u64, make: fn(i64) -> Option<chrono::Duration>) -> Option<chrono::Duration> {
    i64::try_from(units).ok().and_then(make).filter(|ttl| *ttl <= max_ttl())
}

/// A TTL setting counted in the units `make` builds. Values too large to
/// represent fall back to the default like unparsable ones.
fn load_ttl(key: &str, default: u64, make: fn(i64) -> Option<chrono::Duration>) -> chrono::Duration {
    let fallback = ttl_from(default, make).unwrap_or_else(max_ttl);
    let units = try_load(key, default);
    ttl_from(units, make).unwrap_or_else(|| {
        warn!("{key} value {units} is out of range, using default: {default}");
        fallback
    })
}

fn random_secret() -> Vec<u8> {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    BASE64.encode(key).into_bytes()
}
