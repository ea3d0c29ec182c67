use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Default cap on a single uploaded image (5 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub uploads: UploadConfig,
    pub admin: AdminConfig,
    pub object_store: Option<ObjectStoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
}

/// Identities that are granted the admin role when they sign in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    pub ext_ids: Vec<String>,
}

impl AdminConfig {
    pub fn is_bootstrap_admin(&self, ext_id: &str) -> bool {
        self.ext_ids.iter().any(|id| id == ext_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub bucket_access_url: String,
}

/// Signing region when `S3_REGION` is unset
pub const DEFAULT_S3_REGION: &str = "us-east-1";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:data/shoutbox.db".to_string()),
            },
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            uploads: UploadConfig {
                dir: env::var("UPLOAD_DIR")
                    .unwrap_or_else(|_| "uploaded_files".to_string())
                    .into(),
                max_bytes: env::var("MAX_UPLOAD_BYTES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            },
            admin: AdminConfig {
                ext_ids: parse_list(&env::var("ADMIN_EXT_IDS").unwrap_or_default()),
            },
            object_store: object_store_from_env()?,
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Object storage is optional, but once an endpoint is given the rest must be too.
fn object_store_from_env() -> anyhow::Result<Option<ObjectStoreConfig>> {
    let endpoint_url = match non_empty_var("S3_ENDPOINT_URL") {
        Some(url) => url,
        None => return Ok(None),
    };
    let bucket_name = non_empty_var("S3_BUCKET_NAME")
        .ok_or_else(|| anyhow::anyhow!("S3_ENDPOINT_URL is set but S3_BUCKET_NAME is missing"))?;
    let bucket_access_url = non_empty_var("S3_BUCKET_ACCESS_URL").ok_or_else(|| {
        anyhow::anyhow!("S3_ENDPOINT_URL is set but S3_BUCKET_ACCESS_URL is missing")
    })?;
    let access_key_id = non_empty_var("S3_ACCESS_KEY_ID")
        .ok_or_else(|| anyhow::anyhow!("S3_ENDPOINT_URL is set but S3_ACCESS_KEY_ID is missing"))?;
    let secret_access_key = non_empty_var("S3_SECRET_ACCESS_KEY").ok_or_else(|| {
        anyhow::anyhow!("S3_ENDPOINT_URL is set but S3_SECRET_ACCESS_KEY is missing")
    })?;

    Ok(Some(ObjectStoreConfig {
        endpoint_url,
        region: non_empty_var("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
        access_key_id,
        secret_access_key,
        bucket_name,
        bucket_access_url,
    }))
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_admin_list() {
        assert_eq!(parse_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_bootstrap_admin_lookup() {
        let admin = AdminConfig {
            ext_ids: vec!["google-123".to_string()],
        };
        assert!(admin.is_bootstrap_admin("google-123"));
        assert!(!admin.is_bootstrap_admin("google-1234"));
        assert!(!AdminConfig::default().is_bootstrap_admin(""));
    }
}
