use chrono::{DateTime, Utc};
use serde::Serialize;

pub const BEGIN: &str = "begin";
pub const END: &str = "end";

/// A named instant on a [`TimeLine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimePoint {
    pub name: String,
    pub at: DateTime<Utc>,
}

/// Ordered list of named timestamps collected while a unit of work runs.
///
/// A timeline starts with `begin`, may record any number of named
/// checkpoints, and is closed with `end`. Once closed, further points are
/// ignored so a late checkpoint cannot land after the final timestamp.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeLine {
    points: Vec<TimePoint>,
    #[serde(skip)]
    closed: bool,
}

impl TimeLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timeline with the default `begin` point.
    pub fn begin(&mut self) -> &mut Self {
        self.begin_named(BEGIN)
    }

    /// Start the timeline with a custom name for the first point.
    pub fn begin_named(&mut self, name: &str) -> &mut Self {
        self.points.clear();
        self.closed = false;
        self.add(name)
    }

    /// Record a checkpoint.
    pub fn add(&mut self, name: &str) -> &mut Self {
        if !self.closed {
            self.points.push(TimePoint {
                name: name.to_string(),
                at: Utc::now(),
            });
        }
        self
    }

    /// Close the timeline with the default `end` point.
    pub fn end(&mut self) -> &mut Self {
        self.end_named(END)
    }

    pub fn end_named(&mut self, name: &str) -> &mut Self {
        self.add(name);
        self.closed = true;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn points(&self) -> &[TimePoint] {
        &self.points
    }

    /// Milliseconds between the first and the last recorded point.
    pub fn elapsed_ms(&self) -> i64 {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => (last.at - first.at).num_milliseconds(),
            _ => 0,
        }
    }
}
