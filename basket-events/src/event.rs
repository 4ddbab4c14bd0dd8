//! Push event model.

use basket_core::{ProductRecord, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Event name clients listen on for refreshed search results.
pub const SEARCH_UPDATED_EVENT: &str = "updateSearch";

/// A named event with a JSON body.
///
/// Framing is up to the transport; [`PushEvent::to_sse_frame`] covers the
/// server-sent-events case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub name: String,
    pub data: JsonValue,
}

/// Body of an `updateSearch` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchUpdate {
    pub query: String,
    pub results: Vec<ProductRecord>,
    pub count: usize,
    pub timestamp: Timestamp,
}

impl PushEvent {
    pub fn new(name: impl Into<String>, data: JsonValue) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// `updateSearch` carrying the refreshed result set for `query`.
    pub fn search_updated(
        query: impl Into<String>,
        results: Vec<ProductRecord>,
        timestamp: Timestamp,
    ) -> Result<Self, serde_json::Error> {
        let update = SearchUpdate {
            query: query.into(),
            count: results.len(),
            results,
            timestamp,
        };
        Ok(Self::new(SEARCH_UPDATED_EVENT, serde_json::to_value(update)?))
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name, self.data)
    }
}
