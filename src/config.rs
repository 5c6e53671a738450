use crate::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

const DEFAULT_JOB_NAME: &str = "crypto_transform_job";
const DEFAULT_PIPELINE_LABEL: &str = "Crypto ETL";
const DEFAULT_LEASE_TTL_SECS: u64 = 3600;

/// Where notifications for this deployment are published
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum NotifyChannel {
    /// Pub/sub topic identified by its ARN
    Topic(String),
    /// HTTP endpoint receiving `{"subject", "message"}` JSON
    Webhook(String),
}

/// Object storage backend used for input, output and leases
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum StorageBackend {
    S3,
    /// Buckets are directories under this root
    Local(PathBuf),
}

/// Atomic run-claim settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeaseConfig {
    pub bucket: String,
    pub ttl_secs: u64,
}

/// Deployment configuration shared by the dispatcher, relay and transform.
///
/// One deployment targets exactly one job and one notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub job_name: String,
    /// Prefix for dispatcher notification subjects, e.g. "Crypto ETL Job Started"
    pub pipeline_label: String,
    /// Required by the dispatcher and status relay, unused by the transform
    pub notify_channel: Option<NotifyChannel>,
    pub storage: StorageBackend,
    pub output_bucket: Option<String>,
    pub lease: Option<LeaseConfig>,
}

impl PipelineConfig {
    /// Load from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let notify_channel = match (get("ETL_NOTIFY_TOPIC_ARN"), get("ETL_NOTIFY_WEBHOOK_URL")) {
            (Some(arn), None) => Some(NotifyChannel::Topic(arn)),
            (None, Some(raw)) => {
                let parsed = url::Url::parse(&raw).map_err(|e| {
                    EtlError::Config(format!("ETL_NOTIFY_WEBHOOK_URL is not a valid URL: {}", e))
                })?;
                Some(NotifyChannel::Webhook(parsed.to_string()))
            }
            (Some(_), Some(_)) => {
                return Err(EtlError::Config(
                    "Set only one of ETL_NOTIFY_TOPIC_ARN and ETL_NOTIFY_WEBHOOK_URL".to_string(),
                ))
            }
            (None, None) => None,
        };

        let storage = match get("ETL_LOCAL_ROOT") {
            Some(root) => StorageBackend::Local(PathBuf::from(root)),
            None => StorageBackend::S3,
        };

        let lease = match get("ETL_LEASE_BUCKET") {
            Some(bucket) => {
                let ttl_secs = match get("ETL_LEASE_TTL_SECS") {
                    Some(raw) => raw.parse::<u64>().map_err(|e| {
                        EtlError::Config(format!("ETL_LEASE_TTL_SECS must be an integer: {}", e))
                    })?,
                    None => DEFAULT_LEASE_TTL_SECS,
                };
                if ttl_secs == 0 {
                    return Err(EtlError::Config("ETL_LEASE_TTL_SECS must be positive".to_string()));
                }
                Some(LeaseConfig { bucket, ttl_secs })
            }
            None => None,
        };

        Ok(Self {
            job_name: get("ETL_JOB_NAME").unwrap_or_else(|| DEFAULT_JOB_NAME.to_string()),
            pipeline_label: get("ETL_PIPELINE_LABEL")
                .unwrap_or_else(|| DEFAULT_PIPELINE_LABEL.to_string()),
            notify_channel,
            storage,
            output_bucket: get("ETL_OUTPUT_BUCKET"),
            lease,
        })
    }

    pub fn notify_channel(&self) -> Result<&NotifyChannel> {
        self.notify_channel.as_ref().ok_or_else(|| {
            EtlError::Config(
                "A notification channel is required: \
                 set ETL_NOTIFY_TOPIC_ARN or ETL_NOTIFY_WEBHOOK_URL"
                    .to_string(),
            )
        })
    }

    /// Bucket receiving processed partitions for input from `source_bucket`
    pub fn output_bucket<'a>(&'a self, source_bucket: &'a str) -> &'a str {
        self.output_bucket.as_deref().unwrap_or(source_bucket)
    }
}

/// Load the shared AWS SDK configuration (region, credentials) from the environment
pub async fn load_aws_config() -> aws_config::SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await
}

/// Parameters of one batch-transform invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArguments {
    pub job_name: Option<String>,
    pub source_bucket: String,
    pub source_file: String,
}

impl JobArguments {
    pub const SOURCE_BUCKET: &'static str = "SOURCE_BUCKET";
    pub const SOURCE_FILE: &'static str = "SOURCE_FILE";
    pub const JOB_NAME: &'static str = "JOB_NAME";

    /// Resolve `--KEY value` / `--KEY=value` pairs. Unknown keys are ignored,
    /// as the job runner injects its own bookkeeping arguments.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let mut job_name = None;
        let mut source_bucket = None;
        let mut source_file = None;

        let mut i = 0;
        while i < args.len() {
            let Some(flag) = args[i].strip_prefix("--") else {
                i += 1;
                continue;
            };

            let (key, value) = match flag.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => {
                    let next = args.get(i + 1).filter(|v| !v.starts_with("--")).cloned();
                    if next.is_some() {
                        i += 1;
                    }
                    (flag.to_string(), next)
                }
            };
            i += 1;

            let slot = match key.as_str() {
                Self::JOB_NAME => &mut job_name,
                Self::SOURCE_BUCKET => &mut source_bucket,
                Self::SOURCE_FILE => &mut source_file,
                _ => continue,
            };
            match value {
                Some(v) => *slot = Some(v),
                None => return Err(EtlError::Config(format!("--{} requires a value", key))),
            }
        }

        let require = |name: &str, value: Option<String>| {
            value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| EtlError::Config(format!("Missing required argument --{}", name)))
        };

        Ok(Self {
            job_name,
            source_bucket: require(Self::SOURCE_BUCKET, source_bucket)?,
            source_file: require(Self::SOURCE_FILE, source_file)?,
        })
    }
}
