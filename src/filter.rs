// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscription filters.
//!
//! A [`Filter`] is a conjunction of constraints; a [`FilterSet`] is the
//! logical OR of its filters. Tag constraints use the wire shape
//! `"#e": ["<value>", ...]`.
//!
//! # Example
//!
//! ```
//! use relay_store::{Filter, FilterSet};
//!
//! let json = r##"[{"kinds":[1],"#t":["rust"],"limit":10},{"authors":["ab"]}]"##;
//! let set: FilterSet = serde_json::from_str(json).unwrap();
//! assert_eq!(set.len(), 2);
//! assert_eq!(set.filters()[0].limit, Some(10));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventId};

/// A single filter. Empty fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    /// Tag constraints keyed by `#<letter>`
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// A filter matching every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ids(ids: impl IntoIterator<Item = EventId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    #[must_use]
    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = authors.into_iter().collect();
        self
    }

    /// Add a tag constraint, e.g. `tag('e', [id])`.
    #[must_use]
    pub fn tag(mut self, letter: char, values: impl IntoIterator<Item = String>) -> Self {
        self.tags
            .entry(format!("#{}", letter))
            .or_default()
            .extend(values);
        self
    }

    /// Tag constraints as `(tag name, values)`, skipping malformed keys.
    pub fn tag_constraints(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tags
            .iter()
            .filter_map(|(k, v)| k.strip_prefix('#').map(|name| (name, v.as_slice())))
            .filter(|(name, _)| !name.is_empty())
    }

    /// True if nothing can match: the limit is explicitly zero or the
    /// window is inverted (`since > until`).
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        if self.limit == Some(0) {
            return true;
        }
        matches!((self.since, self.until), (Some(since), Some(until)) if since > until)
    }

    /// Does `event` satisfy every constraint of this filter?
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id()) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| a == event.pubkey()) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind()) {
            return false;
        }
        if self.since.is_some_and(|s| event.created_at() < s) {
            return false;
        }
        if self.until.is_some_and(|u| event.created_at() > u) {
            return false;
        }
        self.tag_constraints().all(|(name, values)| {
            values.is_empty() || event.tag_values(name).any(|v| values.iter().any(|want| want == v))
        })
    }
}

/// Logical OR of filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(Vec<Filter>);

impl FilterSet {
    #[must_use]
    pub fn new(filters: Vec<Filter>) -> Self {
        Self(filters)
    }

    /// A set with one filter that matches everything.
    #[must_use]
    pub fn everything() -> Self {
        Self(vec![Filter::all()])
    }

    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Does any member filter match?
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.0.iter().any(|f| f.matches(event))
    }
}

impl From<Filter> for FilterSet {
    fn from(filter: Filter) -> Self {
        Self(vec![filter])
    }
}

impl From<Vec<Filter>> for FilterSet {
    fn from(filters: Vec<Filter>) -> Self {
        Self(filters)
    }
}
