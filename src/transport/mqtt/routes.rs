//! Topic patterns and the route table
//!
//! Patterns use MQTT wildcards with optional capture names: `+roomId`
//! matches exactly one level and captures it as `roomId`, `#rest` matches
//! the remaining levels (zero or more) and captures them joined with `/`.
//! A bare `+` or `#` matches without capturing.

use super::connection::MqttError;
use crate::transport::{InboundMessage, RouteHandler, TopicParams};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Single(Option<String>),
    Multi(Option<String>),
}

/// Parsed topic pattern
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, MqttError> {
        if pattern.is_empty() {
            return Err(MqttError::InvalidTopicPattern("empty pattern".to_string()));
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (index, part) in parts.iter().enumerate() {
            let segment = if let Some(name) = part.strip_prefix('+') {
                Segment::Single(capture_name(name))
            } else if let Some(name) = part.strip_prefix('#') {
                if index != last {
                    return Err(MqttError::InvalidTopicPattern(format!(
                        "'#' must be the last level in '{pattern}'"
                    )));
                }
                Segment::Multi(capture_name(name))
            } else if part.contains('+') || part.contains('#') {
                return Err(MqttError::InvalidTopicPattern(format!(
                    "wildcard must occupy a whole level in '{pattern}'"
                )));
            } else {
                Segment::Literal((*part).to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// MQTT subscription filter for this pattern (capture names stripped)
    pub fn filter(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(level) => level.as_str(),
                Segment::Single(_) => "+",
                Segment::Multi(_) => "#",
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Match a concrete topic, returning captured params on success
    pub fn matches(&self, topic: &str) -> Option<TopicParams> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut params = TopicParams::new();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Multi(name) => {
                    if let Some(name) = name {
                        let rest = levels.get(index..).map(|l| l.join("/")).unwrap_or_default();
                        params.insert(name.clone(), rest);
                    }
                    return Some(params);
                }
                Segment::Single(name) => {
                    let level = levels.get(index)?;
                    if let Some(name) = name {
                        params.insert(name.clone(), (*level).to_string());
                    }
                }
                Segment::Literal(expected) => {
                    if levels.get(index) != Some(&expected.as_str()) {
                        return None;
                    }
                }
            }
        }

        (levels.len() == self.segments.len()).then_some(params)
    }
}

fn capture_name(name: &str) -> Option<String> {
    (!name.is_empty()).then(|| name.to_string())
}

/// Ordered set of pattern routes
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<(TopicPattern, RouteHandler)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route; an existing route with the same pattern keeps its position
    pub fn attach(&mut self, pattern: &str, handler: RouteHandler) -> Result<(), MqttError> {
        let parsed = TopicPattern::parse(pattern)?;

        match self.routes.iter_mut().find(|(p, _)| p.as_str() == pattern) {
            Some(route) => route.1 = handler,
            None => self.routes.push((parsed, handler)),
        }
        Ok(())
    }

    pub fn detach(&mut self, pattern: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|(p, _)| p.as_str() != pattern);
        self.routes.len() != before
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every handler whose pattern matches the message topic, in attach order
    pub fn resolve(&self, message: &InboundMessage) -> Vec<(TopicParams, RouteHandler)> {
        self.routes
            .iter()
            .filter_map(|(pattern, handler)| {
                pattern
                    .matches(&message.topic)
                    .map(|params| (params, handler.clone()))
            })
            .collect()
    }
}

/// Call every matching route handler. Returns the number of handlers called.
///
/// The table lock must not be held while handlers run, so callers resolve
/// first and dispatch afterwards.
pub fn dispatch(matches: Vec<(TopicParams, RouteHandler)>, message: &InboundMessage) -> usize {
    let count = matches.len();
    for (params, handler) in matches {
        handler(&params, message);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageProperties;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn message(topic: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"{}"),
            properties: MessageProperties::default(),
        }
    }

    #[test]
    fn test_literal_pattern() {
        let pattern = TopicPattern::parse("agents/a1/api/v1/in/app").unwrap();

        assert!(pattern.matches("agents/a1/api/v1/in/app").is_some());
        assert!(pattern.matches("agents/a2/api/v1/in/app").is_none());
        assert!(pattern.matches("agents/a1/api/v1/in").is_none());
        assert!(pattern.matches("agents/a1/api/v1/in/app/extra").is_none());
    }

    #[test]
    fn test_named_single_level_capture() {
        let pattern = TopicPattern::parse("apps/conf/api/v1/rooms/+roomId/events").unwrap();

        let params = pattern.matches("apps/conf/api/v1/rooms/r-42/events").unwrap();
        assert_eq!(params.get("roomId").map(String::as_str), Some("r-42"));
        assert_eq!(pattern.filter(), "apps/conf/api/v1/rooms/+/events");
    }

    #[test]
    fn test_multi_level_capture() {
        let pattern = TopicPattern::parse("agents/+agentId/#rest").unwrap();

        let params = pattern.matches("agents/a1/api/v1/in").unwrap();
        assert_eq!(params.get("agentId").map(String::as_str), Some("a1"));
        assert_eq!(params.get("rest").map(String::as_str), Some("api/v1/in"));

        let params = pattern.matches("agents/a1").unwrap();
        assert_eq!(params.get("rest").map(String::as_str), Some(""));
        assert_eq!(pattern.filter(), "agents/+/#");
    }

    #[test]
    fn test_anonymous_wildcards() {
        let pattern = TopicPattern::parse("a/+/c/#").unwrap();
        let params = pattern.matches("a/b/c/d/e").unwrap();

        assert!(params.is_empty());
        assert!(pattern.matches("a/b/x/d").is_none());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("a/#rest/b").is_err());
        assert!(TopicPattern::parse("a/b+/c").is_err());
    }

    #[test]
    fn test_every_matching_route_is_dispatched() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut table = RouteTable::new();

        for (pattern, name) in [("rooms/+id/events", "one"), ("rooms/#", "two"), ("other", "three")] {
            let calls = Arc::clone(&calls);
            table
                .attach(
                    pattern,
                    Arc::new(move |_params: &TopicParams, _msg: &InboundMessage| {
                        calls.lock().unwrap().push(name);
                    }),
                )
                .unwrap();
        }

        let msg = message("rooms/r1/events");
        let called = dispatch(table.resolve(&msg), &msg);

        assert_eq!(called, 2);
        assert_eq!(*calls.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_reattach_replaces_and_detach_removes() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut table = RouteTable::new();

        let first = Arc::clone(&calls);
        table
            .attach(
                "in",
                Arc::new(move |_: &TopicParams, _: &InboundMessage| first.lock().unwrap().push(1)),
            )
            .unwrap();
        let second = Arc::clone(&calls);
        table
            .attach(
                "in",
                Arc::new(move |_: &TopicParams, _: &InboundMessage| second.lock().unwrap().push(2)),
            )
            .unwrap();

        assert_eq!(table.len(), 1);
        let msg = message("in");
        dispatch(table.resolve(&msg), &msg);
        assert_eq!(*calls.lock().unwrap(), vec![2]);

        assert!(table.detach("in"));
        assert!(!table.detach("in"));
        assert!(table.is_empty());
    }
}
