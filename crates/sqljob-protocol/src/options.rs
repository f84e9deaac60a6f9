use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// JobOptions are the connection properties of a job, supplied at connect time.
/// They're opaque to the job protocol, which forwards them as a single
/// `key=value;key=value` string where array values are joined by `,`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub naming: Option<Naming>,
    /// Library list of the job. The first library is the default schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libraries: Option<Vec<String>>,
    #[serde(
        rename = "date format",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub date_format: Option<DateFormat>,
    #[serde(
        rename = "date separator",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub date_separator: Option<String>,
    #[serde(
        rename = "decimal separator",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub decimal_separator: Option<String>,
    #[serde(
        rename = "time format",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub time_format: Option<TimeFormat>,
    #[serde(
        rename = "time separator",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub time_separator: Option<String>,
    #[serde(rename = "full open", default, skip_serializing_if = "Option::is_none")]
    pub full_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    #[serde(
        rename = "autocommit exception",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub autocommit_exception: Option<bool>,
    #[serde(
        rename = "big decimal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub big_decimal: Option<bool>,
    #[serde(rename = "block size", default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    #[serde(
        rename = "data truncation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_truncation: Option<bool>,
    #[serde(
        rename = "extended metadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub extended_metadata: Option<bool>,
    #[serde(
        rename = "transaction isolation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub transaction_isolation: Option<TransactionIsolation>,
    /// Additional properties which are passed through as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Naming {
    /// System naming: `schema/object`, resolved through the library list.
    System,
    /// SQL naming: `schema.object`.
    Sql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateFormat {
    Mdy,
    Dmy,
    Ymd,
    Usa,
    Iso,
    Eur,
    Jis,
    Julian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    Hms,
    Usa,
    Iso,
    Eur,
    Jis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    #[serde(rename = "all")]
    All,
    #[serde(rename = "read call")]
    ReadCall,
    #[serde(rename = "read only")]
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionIsolation {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "read uncommitted")]
    ReadUncommitted,
    #[serde(rename = "read committed")]
    ReadCommitted,
    #[serde(rename = "repeatable read")]
    RepeatableRead,
    #[serde(rename = "serializable")]
    Serializable,
}

impl JobOptions {
    /// Serialize options into the `props` string of a connect request.
    /// Properties are ordered by name.
    pub fn to_props(&self) -> String {
        let Ok(Value::Object(map)) = serde_json::to_value(self) else {
            return String::new(); // Unreachable: JobOptions always maps to an object.
        };

        map.iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| format!("{key}={}", prop_value(value)))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// The default schema of the job, being the first library of its library list.
    pub fn default_schema(&self) -> Option<&str> {
        self.libraries
            .as_ref()
            .and_then(|l| l.first())
            .map(String::as_str)
    }
}

fn prop_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(prop_value).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}
