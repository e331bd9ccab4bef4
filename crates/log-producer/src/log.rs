// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record value types and the size function used for batch accounting.
//!
//! A [`LogGroup`] serializes to the JSON body posted by the HTTP client:
//!
//! ```json
//! {
//!   "__topic__": "topic",
//!   "__source__": "10.0.0.1",
//!   "__logs__": [{"__time__": 1700000000, "message": "hello"}],
//!   "__tags__": {"__pack_id__": "5C1B0E7F3A2D9E11-0"}
//! }
//! ```

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::constants::LOG_TIME_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContent {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    /// Unix time in seconds.
    pub time: u32,
    pub contents: Vec<LogContent>,
}

impl Log {
    pub fn new<K, V>(time: u32, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Log {
            time,
            contents: pairs
                .into_iter()
                .map(|(key, value)| LogContent {
                    key: key.into(),
                    value: value.into(),
                })
                .collect(),
        }
    }
}

impl Serialize for Log {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.contents.len() + 1))?;
        map.serialize_entry("__time__", &self.time)?;
        for content in &self.contents {
            map.serialize_entry(&content.key, &content.value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTag {
    pub key: String,
    pub value: String,
}

impl LogTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        LogTag {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogGroup {
    #[serde(rename = "__topic__")]
    pub topic: String,
    #[serde(rename = "__source__")]
    pub source: String,
    #[serde(rename = "__logs__")]
    pub logs: Vec<Log>,
    #[serde(rename = "__tags__", serialize_with = "serialize_tags")]
    pub log_tags: Vec<LogTag>,
}

fn serialize_tags<S: Serializer>(tags: &[LogTag], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(tags.len()))?;
    for tag in tags {
        map.serialize_entry(&tag.key, &tag.value)?;
    }
    map.end()
}

/// Cost of a record: four bytes of timestamp plus every key and value.
pub fn log_size(log: &Log) -> i64 {
    let contents: usize = log
        .contents
        .iter()
        .map(|content| content.key.len() + content.value.len())
        .sum();
    (LOG_TIME_SIZE + contents) as i64
}

pub fn log_list_size(logs: &[Log]) -> i64 {
    logs.iter().map(log_size).sum()
}
