use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transfer::{CheckpointStore, DEFAULT_CHUNK_SIZE, RetryPolicy, TransferRequest};

/// Connection settings for the object store
#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    pub profile: Option<String>,
    /// S3-compatible endpoint, e.g. `https://cos.ap-guangzhou.myqcloud.com`
    pub endpoint_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables and .env file
    ///
    /// `COS_*` variables take precedence over their `AWS_*` equivalents.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is missing or a value is malformed
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if it exists

        let region = first_var(&["COS_REGION", "AWS_REGION"])
            .context("COS_REGION (or AWS_REGION) not found in environment. Please set it in .env file")?;
        Self::validate_region(&region)?;

        let profile = first_var(&["COS_PROFILE", "AWS_PROFILE"]);

        let endpoint_url = first_var(&["COS_ENDPOINT_URL"]);
        if let Some(url) = &endpoint_url {
            Self::validate_endpoint(url)?;
        }

        Ok(Self {
            region,
            profile,
            endpoint_url,
        })
    }

    /// Validate region format
    fn validate_region(region: &str) -> Result<()> {
        if region.is_empty() {
            anyhow::bail!("COS_REGION cannot be empty");
        }

        // Basic validation - ensure it looks like a region (contains a dash)
        if !region.contains('-') {
            anyhow::bail!(
                "COS_REGION '{}' doesn't look like a valid region (e.g., ap-guangzhou, us-west-2)",
                region
            );
        }

        Ok(())
    }

    fn validate_endpoint(url: &str) -> Result<()> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            anyhow::bail!(
                "COS_ENDPOINT_URL '{}' must start with http:// or https://",
                url
            );
        }
        Ok(())
    }
}

fn first_var(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.is_empty())
}

/// Validate a bucket name according to S3/COS rules
pub fn validate_bucket_name(bucket: &str) -> Result<()> {
    if bucket.is_empty() {
        anyhow::bail!("Bucket name cannot be empty");
    }

    if bucket.len() < 3 || bucket.len() > 63 {
        anyhow::bail!(
            "Bucket '{}' must be between 3 and 63 characters (got {})",
            bucket,
            bucket.len()
        );
    }

    let is_edge = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !bucket.starts_with(is_edge) {
        anyhow::bail!(
            "Bucket '{}' must start with a lowercase letter or number",
            bucket
        );
    }
    if !bucket.ends_with(is_edge) {
        anyhow::bail!(
            "Bucket '{}' must end with a lowercase letter or number",
            bucket
        );
    }

    // Check for invalid characters
    if let Some(c) = bucket
        .chars()
        .find(|&c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '.')
    {
        anyhow::bail!(
            "Bucket '{}' contains invalid character '{}'. Only lowercase letters, numbers, hyphens, and periods are allowed",
            bucket,
            c
        );
    }

    if bucket.contains("..") {
        anyhow::bail!("Bucket '{}' cannot contain consecutive periods", bucket);
    }

    // Check for IP address format (not allowed)
    if bucket
        .split('.')
        .all(|part| part.parse::<u8>().is_ok() && !part.is_empty())
    {
        anyhow::bail!("Bucket '{}' cannot be formatted as an IP address", bucket);
    }

    Ok(())
}

/// A `cos://bucket/key` location. `key` may be empty or a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosUri {
    pub bucket: String,
    pub key: String,
}

impl CosUri {
    /// Key for a file at `relative_path` below this location
    pub fn join(&self, relative_path: &str) -> String {
        let path = relative_path.trim_start_matches("./");
        if self.key.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.key.trim_end_matches('/'), path)
        }
    }
}

pub fn parse_cos_uri(uri: &str) -> Result<CosUri> {
    let rest = uri
        .strip_prefix("cos://")
        .with_context(|| format!("'{}' is not a cos://bucket/key URI", uri))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    validate_bucket_name(bucket)?;

    if key.contains("//") {
        anyhow::bail!("Key '{}' contains consecutive slashes (not allowed)", key);
    }
    if key.split('/').any(|segment| segment == "..") {
        anyhow::bail!("Key '{}' contains '..' (not allowed for security)", key);
    }

    Ok(CosUri {
        bucket: bucket.to_string(),
        key: key.to_string(),
    })
}

/// Parse a byte size such as `1048576`, `8MB`, `64MiB` or `1.5G`.
///
/// Decimal (`KB`, `MB`, `GB`) and binary (`K`, `KiB`, `M`, `MiB`, ...) units
/// are both accepted.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .with_context(|| format!("Invalid size '{}'", input))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        other => anyhow::bail!("Unknown size unit '{}' in '{}'", other, input),
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        anyhow::bail!("Size '{}' is out of range", input);
    }
    Ok(bytes.round() as u64)
}

/// `~/.cos/cache`, or a directory under the system temp dir without a home
pub fn default_checkpoint_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".cos").join("cache"))
        .unwrap_or_else(|| env::temp_dir().join(".cos").join("cache"))
}

/// Size given either as a number of bytes or as a string with a unit
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Text(String),
}

impl SizeValue {
    fn bytes(&self) -> Result<u64> {
        match self {
            Self::Bytes(n) => Ok(*n),
            Self::Text(s) => parse_size(s),
        }
    }
}

/// Shape of the YAML settings file; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    chunk_size: Option<SizeValue>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    retry_backoff_max_ms: Option<u64>,
    resume: Option<bool>,
    concurrency: Option<usize>,
    limit_rate: Option<SizeValue>,
    verify: Option<bool>,
    timeout_secs: Option<u64>,
    checkpoint_dir: Option<PathBuf>,
}

/// Tunables shared by every transfer of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub resume: bool,
    pub concurrency: usize,
    /// Bytes per second, per transfer
    pub limit_rate: Option<u64>,
    pub verify: bool,
    pub timeout_secs: Option<u64>,
    pub checkpoint_dir: PathBuf,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: retry.max_retries,
            retry_backoff_ms: retry.backoff_base.as_millis() as u64,
            retry_backoff_max_ms: retry.backoff_cap.as_millis() as u64,
            resume: true,
            concurrency: 4,
            limit_rate: None,
            verify: false,
            timeout_secs: None,
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

impl TransferSettings {
    /// Defaults, then the YAML file at `path` if given, then `COS_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings file {}", path.display()))?;
            settings
                .merge_yaml(&content)
                .with_context(|| format!("Invalid settings file {}", path.display()))?;
        }
        settings.merge_env(|name| env::var(name).ok())?;
        Ok(settings)
    }

    fn merge_yaml(&mut self, content: &str) -> Result<()> {
        let file: SettingsFile = serde_yaml::from_str(content)?;
        if let Some(size) = &file.chunk_size {
            self.chunk_size = size.bytes()?;
        }
        if let Some(rate) = &file.limit_rate {
            self.limit_rate = Some(rate.bytes()?);
        }
        self.max_retries = file.max_retries.unwrap_or(self.max_retries);
        self.retry_backoff_ms = file.retry_backoff_ms.unwrap_or(self.retry_backoff_ms);
        self.retry_backoff_max_ms = file
            .retry_backoff_max_ms
            .unwrap_or(self.retry_backoff_max_ms);
        self.resume = file.resume.unwrap_or(self.resume);
        self.concurrency = file.concurrency.unwrap_or(self.concurrency);
        self.verify = file.verify.unwrap_or(self.verify);
        self.timeout_secs = file.timeout_secs.or(self.timeout_secs);
        if let Some(dir) = file.checkpoint_dir {
            self.checkpoint_dir = dir;
        }
        Ok(())
    }

    fn merge_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("COS_CHUNK_SIZE") {
            self.chunk_size = parse_size(&v).context("COS_CHUNK_SIZE")?;
        }
        if let Some(v) = lookup("COS_MAX_RETRIES") {
            self.max_retries = v
                .trim()
                .parse()
                .with_context(|| format!("COS_MAX_RETRIES '{}' is not a number", v))?;
        }
        if let Some(v) = lookup("COS_CONCURRENCY") {
            self.concurrency = v
                .trim()
                .parse()
                .with_context(|| format!("COS_CONCURRENCY '{}' is not a number", v))?;
        }
        if let Some(v) = lookup("COS_CHECKPOINT_DIR").filter(|v| !v.is_empty()) {
            self.checkpoint_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.retry_backoff_ms),
            backoff_cap: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.checkpoint_dir)
    }

    /// Copy these settings onto a request
    pub fn apply(&self, request: TransferRequest) -> TransferRequest {
        request
            .with_chunk_size(self.chunk_size)
            .with_retry(self.retry_policy())
            .with_resume(self.resume)
            .with_deadline(self.timeout_secs.map(Duration::from_secs))
            .with_rate_limit(self.limit_rate)
            .with_verify(self.verify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_bucket_name_validation() {
        // Valid bucket names
        assert!(validate_bucket_name("my-bucket").is_ok());
        assert!(validate_bucket_name("my.bucket.123").is_ok());
        assert!(validate_bucket_name("examplebucket-1250000000").is_ok());

        // Invalid bucket names
        assert!(validate_bucket_name("ab").is_err()); // Too short
        assert!(validate_bucket_name(&"a".repeat(64)).is_err()); // Too long
        assert!(validate_bucket_name("MY-BUCKET").is_err()); // Uppercase
        assert!(validate_bucket_name("my_bucket").is_err()); // Underscore
        assert!(validate_bucket_name("-mybucket").is_err()); // Starts with dash
        assert!(validate_bucket_name("mybucket-").is_err()); // Ends with dash
        assert!(validate_bucket_name("my..bucket").is_err()); // Consecutive periods
        assert!(validate_bucket_name("192.168.1.1").is_err()); // IP address format
        assert!(validate_bucket_name("").is_err()); // Empty
    }

    #[test]
    fn test_region_validation() {
        assert!(Config::validate_region("ap-guangzhou").is_ok());
        assert!(Config::validate_region("us-west-2").is_ok());

        assert!(Config::validate_region("").is_err());
        assert!(Config::validate_region("uswest2").is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(Config::validate_endpoint("https://cos.ap-guangzhou.myqcloud.com").is_ok());
        assert!(Config::validate_endpoint("http://localhost:9000").is_ok());
        assert!(Config::validate_endpoint("cos.ap-guangzhou.myqcloud.com").is_err());
    }

    #[test]
    fn test_parse_cos_uri() {
        let uri = parse_cos_uri("cos://my-bucket/videos/a.mp4").unwrap();
        assert_eq!(uri.bucket, "my-bucket");
        assert_eq!(uri.key, "videos/a.mp4");

        let root = parse_cos_uri("cos://my-bucket").unwrap();
        assert_eq!(root.key, "");

        assert!(parse_cos_uri("s3://my-bucket/a").is_err());
        assert!(parse_cos_uri("cos://My_Bucket/a").is_err());
        assert!(parse_cos_uri("cos://my-bucket/a//b").is_err());
        assert!(parse_cos_uri("cos://my-bucket/../etc").is_err());
    }

    #[test]
    fn test_key_join() {
        let prefix = parse_cos_uri("cos://my-bucket/uploads/").unwrap();
        assert_eq!(prefix.join("file.mp4"), "uploads/file.mp4");
        assert_eq!(prefix.join("./dir/file.mp4"), "uploads/dir/file.mp4");

        let root = parse_cos_uri("cos://my-bucket").unwrap();
        assert_eq!(root.join("dir/file.mp4"), "dir/file.mp4");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1048576").unwrap(), 1_048_576);
        assert_eq!(parse_size("8MB").unwrap(), 8_000_000);
        assert_eq!(parse_size("64MiB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("64m").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("1.5K").unwrap(), 1536);
        assert_eq!(parse_size(" 2 GB ").unwrap(), 2_000_000_000);

        assert!(parse_size("").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("10XB").is_err());
    }

    #[test]
    fn test_settings_from_yaml() {
        let mut settings = TransferSettings::default();
        settings
            .merge_yaml(
                "chunk_size: 16MiB\nmax_retries: 5\nconcurrency: 8\nlimit_rate: 1048576\nresume: false\n",
            )
            .unwrap();
        assert_eq!(settings.chunk_size, 16 * 1024 * 1024);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.limit_rate, Some(1_048_576));
        assert!(!settings.resume);
        // Untouched fields keep their defaults
        assert_eq!(settings.retry_backoff_ms, 500);

        assert!(settings.merge_yaml("chunk_sise: 1MB\n").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut settings = TransferSettings::default();
        settings.merge_yaml("chunk_size: 16MiB\nmax_retries: 5\n").unwrap();

        let env: HashMap<&str, &str> = [
            ("COS_CHUNK_SIZE", "4MiB"),
            ("COS_CONCURRENCY", "2"),
            ("COS_CHECKPOINT_DIR", "/tmp/ckpt"),
        ]
        .into_iter()
        .collect();
        settings
            .merge_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.chunk_size, 4 * 1024 * 1024);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.concurrency, 2);
        assert_eq!(settings.checkpoint_dir, PathBuf::from("/tmp/ckpt"));

        let bad = settings.merge_env(|name| (name == "COS_MAX_RETRIES").then(|| "many".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn test_apply_to_request() {
        let settings = TransferSettings {
            chunk_size: 1024,
            timeout_secs: Some(30),
            limit_rate: Some(4096),
            verify: true,
            resume: false,
            ..TransferSettings::default()
        };
        let request = settings.apply(TransferRequest::download("b", "k", "/tmp/k"));
        assert_eq!(request.chunk_size, 1024);
        assert_eq!(request.deadline, Some(Duration::from_secs(30)));
        assert_eq!(request.max_bytes_per_sec, Some(4096));
        assert!(request.verify_checksum);
        assert!(!request.resume_enabled);
        assert_eq!(request.retry, RetryPolicy::default());
    }

    #[test]
    fn test_default_checkpoint_dir() {
        assert!(default_checkpoint_dir().ends_with("cache"));
    }
}
