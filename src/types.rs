use serde::{Deserialize, Serialize};
use std::fmt;

// =========================================================================
// Arrival events (object created in storage)
// =========================================================================

/// Notification that one or more objects landed in storage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArrivalEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<ArrivalRecord>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArrivalRecord {
    pub s3: StorageEntity,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageEntity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectRef {
    /// URL-encoded object key, as delivered by the storage service
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl ArrivalRecord {
    pub fn bucket(&self) -> &str {
        &self.s3.bucket.name
    }

    /// Object key with the event's form-encoding (`+` for space, `%XX`) removed
    pub fn object_key(&self) -> String {
        decode_object_key(&self.s3.object.key)
    }
}

/// Decode an event-encoded object key.
///
/// Raw `&` and `=` never appear in encoded keys, so the whole key parses as a
/// single form pair.
pub fn decode_object_key(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| if v.is_empty() { k.into_owned() } else { format!("{}={}", k, v) })
        .collect::<Vec<_>>()
        .join("&")
}

// =========================================================================
// Lifecycle events (job run changed state)
// =========================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LifecycleEvent {
    #[serde(default)]
    pub detail: LifecycleDetail,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleDetail {
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub job_run_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl LifecycleDetail {
    pub fn job_name(&self) -> &str {
        self.job_name.as_deref().unwrap_or("UnknownJob")
    }

    pub fn job_run_id(&self) -> &str {
        self.job_run_id.as_deref().unwrap_or("UnknownRun")
    }

    pub fn state(&self) -> &str {
        self.state.as_deref().unwrap_or("UNKNOWN")
    }
}

// =========================================================================
// Handler plumbing
// =========================================================================

/// Second argument of every event handler
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub request_id: String,
    pub function_name: String,
}

impl InvocationContext {
    /// Populate from the hosting platform's environment, falling back to "local"
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            request_id: var("AWS_LAMBDA_REQUEST_ID")
                .or_else(|| var("ETL_REQUEST_ID"))
                .unwrap_or_else(|| format!("local-{}", chrono::Utc::now().timestamp_millis())),
            function_name: var("AWS_LAMBDA_FUNCTION_NAME").unwrap_or_else(|| "local".to_string()),
        }
    }
}

/// Handler return value, serialized as `{"statusCode": 200, "body": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status_code: u16,
    pub body: String,
}

impl HandlerResponse {
    pub fn ok(message: &str) -> Self {
        Self {
            status_code: 200,
            // A JSON string literal, matching what the platform expects in `body`
            body: serde_json::Value::String(message.to_string()).to_string(),
        }
    }
}

impl fmt::Display for HandlerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_code, self.body)
    }
}
