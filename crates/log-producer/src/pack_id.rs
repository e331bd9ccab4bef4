// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pack ids let the service deduplicate batches that were delivered twice.

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use std::sync::Mutex;

use crate::constants::DELIMITER;

pub struct PackIdGenerator {
    prefix: String,
    counters: Mutex<HashMap<String, u64, FnvBuildHasher>>,
}

impl Default for PackIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PackIdGenerator {
    pub fn new() -> Self {
        let mut prefix = uuid::Uuid::new_v4().simple().to_string();
        prefix.truncate(16);
        prefix.make_ascii_uppercase();
        Self::with_prefix(prefix)
    }

    pub fn with_prefix(prefix: String) -> Self {
        PackIdGenerator {
            prefix,
            counters: Mutex::new(HashMap::with_hasher(FnvBuildHasher::default())),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns `{prefix}-{n}` where `n` (upper-case hex) counts the ids handed
    /// out so far for this project and logstore.
    pub fn generate_pack_id(&self, project: &str, logstore: &str) -> String {
        let key = format!("{project}{DELIMITER}{logstore}");
        let id = {
            #[allow(clippy::expect_used)]
            let mut counters = self.counters.lock().expect("lock poisoned");
            let counter = counters.entry(key).or_insert(0);
            let id = *counter;
            *counter += 1;
            id
        };
        format!("{}-{:X}", self.prefix, id)
    }
}
