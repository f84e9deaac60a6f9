use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod codec;
mod options;

pub use codec::{encode, reader_to_message_stream, LineDecoder};
pub use options::{
    Access, DateFormat, JobOptions, Naming, TimeFormat, TransactionIsolation,
};

/// Client identification sent with every connect request.
pub const APPLICATION: &str = "sqljob client";

/// Error text of responses synthesized for requests which were still
/// outstanding when their job ended.
pub const JOB_ENDED_ERROR: &str = "Job ended before response returned";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("job server wrote a partial message and then closed its output")]
    PartialMessage,
}

/// Request is a single message sent to a job server.
/// Every request carries a correlation `id` which is echoed by its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(flatten)]
    pub body: RequestBody,
}

/// Type-specific content of a Request, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    Connect {
        technique: String,
        application: String,
        props: String,
    },
    Sql {
        sql: String,
        terse: bool,
        rows: u32,
    },
    PrepareSqlExecute {
        sql: String,
        terse: bool,
        rows: u32,
        parameters: Vec<Value>,
    },
    Sqlmore {
        cont_id: String,
        sql: String,
        rows: u32,
    },
    Sqlclose {
        cont_id: String,
    },
    Cl {
        terse: bool,
        cmd: String,
    },
    Getversion,
    Gettracedata,
    Setconfig {
        tracedest: TraceDest,
        tracelevel: TraceLevel,
    },
    Exit,
}

impl RequestBody {
    /// Short tag of this request kind, used as the prefix of generated ids.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Sql { .. } | Self::PrepareSqlExecute { .. } | Self::Cl { .. } => "query",
            Self::Sqlmore { .. } => "sqlmore",
            Self::Sqlclose { .. } => "sqlclose",
            Self::Getversion => "getversion",
            Self::Gettracedata => "gettracedata",
            Self::Setconfig { .. } => "setconfig",
            Self::Exit => "exit",
        }
    }
}

impl Request {
    /// Build a Request for `body` having a newly generated id.
    pub fn new(body: RequestBody) -> Self {
        Self {
            id: new_id(body.tag()),
            body,
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Generate a correlation id which combines `tag` with a process-wide,
/// monotonic counter (ex. `query3`, `sqlclose7`).
pub fn new_id(tag: &str) -> String {
    let n = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{tag}{n}")
}

/// Response is a single message received from a job server.
/// Fields beyond the common envelope are retained in `fields`
/// and are accessed through a typed view (see `Response::into_typed`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Response {
    /// Synthesize the failed Response of a request whose job ended
    /// before the server answered it.
    pub fn job_ended(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(JOB_ENDED_ERROR.to_string()),
            fields: Default::default(),
        }
    }

    /// Deserialize the complete Response into a typed view.
    pub fn into_typed<T: DeserializeOwned>(self) -> serde_json::Result<T> {
        let Self {
            id,
            success,
            error,
            mut fields,
        } = self;

        fields.insert("id".to_string(), Value::String(id));
        fields.insert("success".to_string(), Value::Bool(success));
        if let Some(error) = error {
            fields.insert("error".to_string(), Value::String(error));
        }
        serde_json::from_value(Value::Object(fields))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResult {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Server-assigned job name, present on success.
    #[serde(default)]
    pub job: Option<String>,
}

/// QueryResult is the response to sql, prepare_sql_execute, sqlmore and cl requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rc: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<QueryMetaData>,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub has_results: bool,
    #[serde(default)]
    pub update_count: i64,
    /// Rows of the page. Column-keyed objects, or positional arrays
    /// if terse results were requested.
    #[serde(default)]
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetaData {
    pub column_count: u32,
    #[serde(default)]
    pub columns: Vec<ColumnMetaData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetaData {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub display_size: u32,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionResult {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub build_date: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceDataResult {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tracedata: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetConfigResult {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub tracedest: Option<TraceDest>,
    pub tracelevel: Option<TraceLevel>,
}

/// Destination of a job server's trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceDest {
    File,
    InMem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceLevel {
    Off,
    On,
    Errors,
    Datastream,
}
