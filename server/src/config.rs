use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Config {
    pub site_name: String,
    pub root_directory: PathBuf,
    pub data_directory: PathBuf,
    pub rest_port: u16,
    pub jwt_secret: String,
    pub max_archive_bytes: u64,
    pub max_upload_bytes: u64,
    pub share_sweep_interval_secs: u64,
    pub download_cleanup_secs: u64,
    pub cors_origins: Vec<String>,
    pub public_url: Option<String>,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET").context(
            "JWT_SECRET environment variable must be set. Generate with: openssl rand -hex 32",
        )?;

        let cors_origins = var_or(
            "CORS_ORIGINS",
            "http://localhost:3000,http://localhost:5173,http://127.0.0.1:3000",
        )
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

        let public_url = std::env::var("PUBLIC_URL")
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        Ok(Config {
            site_name: var_or("SITE_NAME", "Skybit"),
            root_directory: PathBuf::from(var_or("ROOT_DIRECTORY", "/home")),
            data_directory: PathBuf::from(var_or("DATA_DIRECTORY", "./data")),
            rest_port: parse_var("REST_PORT", 7070)?,
            jwt_secret,
            max_archive_bytes: parse_var("MAX_ARCHIVE_BYTES", 5 * GIB)?,
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", 1000 * MIB)?,
            share_sweep_interval_secs: parse_var("SHARE_SWEEP_INTERVAL_SECS", 300)?,
            download_cleanup_secs: parse_var("DOWNLOAD_CLEANUP_SECS", 300)?,
            cors_origins,
            public_url,
        })
    }

    /// Scratch space for ephemeral download archives.
    pub fn scratch_directory(&self) -> PathBuf {
        self.data_directory.join("tmp")
    }

    /// Link handed out for a share token.
    pub fn share_url(&self, token: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{}/share/{}", base, token),
            None => format!("/share/{}", token),
        }
    }

    /// Configuration with fixed values for tests.
    #[cfg(test)]
    pub fn for_tests(root: PathBuf, data: PathBuf) -> Self {
        Config {
            site_name: "Skybit Test".to_string(),
            root_directory: root,
            data_directory: data,
            rest_port: 0,
            jwt_secret: "test_secret".to_string(),
            max_archive_bytes: 1024 * 1024,
            max_upload_bytes: 10 * MIB,
            share_sweep_interval_secs: 300,
            download_cleanup_secs: 300,
            cors_origins: Vec::new(),
            public_url: None,
        }
    }
}
