use crate::common::model::FilterType;
use crate::common::model::config::TopicsConfig;

/// Where a transformed image goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Filters exhausted: final artifact, done event on `topic`.
    Terminal { topic: String },
    /// More filters remain: temporary artifact, chain message on `topic`.
    Forward { topic: String, next: FilterType },
}

impl Route {
    pub fn topic(&self) -> &str {
        match self {
            Route::Terminal { topic } | Route::Forward { topic, .. } => topic,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Route::Terminal { .. })
    }
}

/// Maps the remaining filter list to the next topic. Holds no state beyond topic names.
#[derive(Debug, Clone)]
pub struct ChainRouter {
    processing: String,
    done: String,
    per_filter: bool,
}

impl ChainRouter {
    pub fn new(topics: &TopicsConfig) -> Self {
        Self {
            processing: topics.processing.clone(),
            done: topics.done.clone(),
            per_filter: topics.per_filter,
        }
    }

    /// Inbound topic of the stage applying `filter`.
    pub fn topic_for(&self, filter: FilterType) -> String {
        if self.per_filter {
            format!("{}.{}", self.processing, filter.slug())
        } else {
            self.processing.clone()
        }
    }

    pub fn done_topic(&self) -> &str {
        &self.done
    }

    /// `remaining` is the filter list after the applied head was removed.
    pub fn route(&self, remaining: &[FilterType]) -> Route {
        match remaining.first() {
            None => Route::Terminal {
                topic: self.done.clone(),
            },
            Some(&next) => Route::Forward {
                topic: self.topic_for(next),
                next,
            },
        }
    }
}
