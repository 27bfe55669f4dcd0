//! Field-based request merger.
//!
//! Requests whose arguments differ only in one distinguishing field are
//! merged into a single query where that field becomes a set-membership
//! condition:
//!
//! ```text
//! { "id": 1, "deletedAt": null }  ┐
//! { "id": 2, "deletedAt": null }  ├→ { "id": { "$in": [1, 2] }, "deletedAt": null }
//! { "id": 1, "deletedAt": null }  ┘
//! ```
//!
//! Requests with different remaining ("common") arguments land in different
//! groups, and a group never collects more than `max_query_length` distinct
//! values. Result items are routed back by reading the same field.
//!
//! A request whose arguments cannot be split, or a group whose merged
//! arguments do not decode into the runner's argument type, becomes a failed
//! group: only its own requests are rejected.

use std::sync::Arc;

use indexmap::map::Entry;
use indexmap::IndexMap;
use loadmerge_core::{BoxError, Request, RequestGroup, RequestMerger};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{trace, warn};

use crate::error::FieldMergeError;
use crate::key::canonical_key;
use crate::value::{json_kind, FieldSource, FieldValue, IN_OPERATOR};

const SINGLE_GROUP_KEY: &str = "singleGroup";

/// Configuration for [`FieldMerger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMergerConfig {
    /// Maximum distinct field values per merged query. Large `$in` lists can
    /// slow some backends down; pick what suits the runner.
    pub max_query_length: usize,
    /// Put every request in one group regardless of its other arguments.
    /// Only correct when the runner can answer all of them with one query.
    pub force_single_group: bool,
}

impl Default for FieldMergerConfig {
    fn default() -> Self {
        Self {
            max_query_length: 100,
            force_single_group: false,
        }
    }
}

impl FieldMergerConfig {
    pub fn with_max_query_length(mut self, n: usize) -> Self {
        self.max_query_length = n;
        self
    }

    pub fn with_force_single_group(mut self, force: bool) -> Self {
        self.force_single_group = force;
        self
    }
}

/// Groups requests by their common arguments and merges the values of
/// `field` into `{ field: { "$in": [...] } }`.
///
/// Request arguments may be any `Serialize` type that encodes as a JSON
/// object; merged arguments are decoded into the runner's argument type.
#[derive(Debug, Clone)]
pub struct FieldMerger {
    field: Arc<str>,
    config: FieldMergerConfig,
}

/// In-progress group for one key during a single `merge` call.
struct GroupState {
    requests: Vec<usize>,
    /// value → group indices of the requests that asked for it, in
    /// first-seen order
    owners: IndexMap<FieldValue, Vec<usize>>,
    common: Map<String, Value>,
}

impl GroupState {
    fn start(position: usize, value: FieldValue, common: Map<String, Value>) -> Self {
        let mut state = Self {
            requests: Vec::new(),
            owners: IndexMap::new(),
            common,
        };
        state.push(position, value);
        state
    }

    /// Duplicate values never force a split, even past the cap.
    fn accepts(&self, value: &FieldValue, max_query_length: usize) -> bool {
        self.owners.contains_key(value) || self.owners.len() < max_query_length
    }

    fn push(&mut self, position: usize, value: FieldValue) {
        let index = self.requests.len();
        self.requests.push(position);
        self.owners.entry(value).or_default().push(index);
    }
}

impl FieldMerger {
    /// Merger for `field` with the given configuration.
    pub fn new(field: impl Into<String>, config: FieldMergerConfig) -> Self {
        Self {
            field: Arc::from(field.into()),
            config,
        }
    }

    /// Merger with default configuration.
    pub fn for_field(field: impl Into<String>) -> Self {
        Self::new(field, FieldMergerConfig::default())
    }

    /// The distinguishing field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn config(&self) -> &FieldMergerConfig {
        &self.config
    }

    /// Split a request's arguments into its field value and the remaining
    /// common arguments.
    fn split<A: Serialize>(&self, args: &A) -> Result<(FieldValue, Map<String, Value>), FieldMergeError> {
        let mut common = match serde_json::to_value(args)? {
            Value::Object(map) => map,
            other => {
                return Err(FieldMergeError::NotAnObject {
                    found: json_kind(&other),
                })
            }
        };
        let raw = common
            .remove(&*self.field)
            .ok_or_else(|| FieldMergeError::MissingField {
                field: self.field.to_string(),
            })?;
        let value = FieldValue::from_json(&raw).ok_or_else(|| FieldMergeError::UnsupportedValue {
            field: self.field.to_string(),
            value: raw.to_string(),
        })?;
        Ok((value, common))
    }

    fn group_key(&self, common: &Map<String, Value>) -> String {
        if self.config.force_single_group {
            return SINGLE_GROUP_KEY.to_string();
        }
        canonical_key(&Value::Object(common.clone()))
    }

    /// Runner arguments: the common arguments plus the `$in` condition.
    fn merged_args<'a, RA: DeserializeOwned>(
        &self,
        mut common: Map<String, Value>,
        values: impl IntoIterator<Item = &'a FieldValue>,
    ) -> Result<RA, FieldMergeError> {
        let mut condition = Map::new();
        condition.insert(
            IN_OPERATOR.to_string(),
            Value::Array(values.into_iter().map(FieldValue::to_json).collect()),
        );
        common.insert(self.field.to_string(), Value::Object(condition));
        Ok(serde_json::from_value(Value::Object(common))?)
    }

    fn failed_group<RA, R: 'static>(&self, requests: Vec<usize>, err: FieldMergeError) -> RequestGroup<RA, R> {
        warn!(field = %self.field, requests = ?requests, error = %err, "requests cannot be merged");
        RequestGroup::failed(requests, err)
    }

    fn build_group<RA, R>(&self, state: GroupState) -> RequestGroup<RA, R>
    where
        RA: DeserializeOwned,
        R: FieldSource + 'static,
    {
        let GroupState {
            requests,
            owners,
            common,
        } = state;
        match self.merged_args(common, owners.keys()) {
            Ok(args) => {
                let field = Arc::clone(&self.field);
                RequestGroup::new(args, requests, move |item: &R| {
                    item.field_value(&field)
                        .and_then(|value| owners.get(&value).cloned())
                        .unwrap_or_default()
                })
            }
            Err(e) => self.failed_group(requests, e),
        }
    }

    fn single_group<A, RA, R>(&self, request: &Request<A, R>) -> RequestGroup<RA, R>
    where
        A: Serialize,
        RA: DeserializeOwned,
        R: 'static,
    {
        let merged = self
            .split(request.args())
            .and_then(|(value, common)| self.merged_args(common, [&value]));
        match merged {
            Ok(args) => RequestGroup::new(args, vec![0], |_: &R| vec![0]),
            Err(e) => self.failed_group(vec![0], e),
        }
    }
}

impl<A, RA, R> RequestMerger<A, RA, R> for FieldMerger
where
    A: Serialize,
    RA: DeserializeOwned,
    R: FieldSource + 'static,
{
    fn merge(&self, requests: &[Request<A, R>]) -> Result<Vec<RequestGroup<RA, R>>, BoxError> {
        if let [request] = requests {
            return Ok(vec![self.single_group(request)]);
        }

        let max = self.config.max_query_length;
        let mut open: IndexMap<String, GroupState> = IndexMap::new();
        let mut groups = Vec::new();

        for (position, request) in requests.iter().enumerate() {
            let (value, common) = match self.split(request.args()) {
                Ok(entry) => entry,
                Err(e) => {
                    groups.push(self.failed_group(vec![position], e));
                    continue;
                }
            };
            match open.entry(self.group_key(&common)) {
                Entry::Occupied(mut slot) if !slot.get().accepts(&value, max) => {
                    trace!(field = %self.field, max, "group full, starting another");
                    let full = std::mem::replace(slot.get_mut(), GroupState::start(position, value, common));
                    groups.push(self.build_group(full));
                }
                Entry::Occupied(mut slot) => slot.get_mut().push(position, value),
                Entry::Vacant(slot) => {
                    slot.insert(GroupState::start(position, value, common));
                }
            }
        }

        groups.extend(open.into_values().map(|state| self.build_group(state)));
        Ok(groups)
    }
}
