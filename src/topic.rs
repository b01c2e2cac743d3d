//! Routing-key pattern matching with topic-exchange wildcard semantics

use crate::error::PropagandaError;

/// A compiled binding pattern for subscription matching.
///
/// Patterns follow AMQP topic-exchange semantics: keys are split into
/// segments on `.`, `*` matches exactly one segment and `#` matches zero
/// or more segments. `orders.*` matches `orders.created` but not
/// `orders.created.eu`; `orders.#` matches both, and `orders` itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    pattern: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment
    Single,
    /// `#`: zero or more segments
    Multi,
}

impl TopicPattern {
    /// Compile a binding pattern
    pub fn new(pattern: &str) -> Result<Self, PropagandaError> {
        if pattern.is_empty() {
            return Err(PropagandaError::invalid_config(
                "binding pattern must not be empty",
            ));
        }

        let segments = pattern
            .split('.')
            .map(|part| match part {
                "*" => Ok(Segment::Single),
                "#" => Ok(Segment::Multi),
                "" => Err(PropagandaError::invalid_config(format!(
                    "binding pattern '{}' contains an empty segment",
                    pattern
                ))),
                literal => Ok(Segment::Literal(literal.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    /// The original pattern string
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether this pattern contains any wildcard segment
    pub fn is_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Single | Segment::Multi))
    }

    /// Check if this pattern matches a concrete routing key
    pub fn matches(&self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }
        let parts: Vec<&str> = topic.split('.').collect();
        matches_segments(&self.segments, &parts)
    }
}

fn matches_segments(pattern: &[Segment], topic: &[&str]) -> bool {
    match pattern.first() {
        None => topic.is_empty(),
        Some(Segment::Literal(literal)) => match topic.first() {
            Some(part) if part == literal => matches_segments(&pattern[1..], &topic[1..]),
            _ => false,
        },
        Some(Segment::Single) => {
            !topic.is_empty() && matches_segments(&pattern[1..], &topic[1..])
        }
        // `#` may consume any number of segments, including none
        Some(Segment::Multi) => {
            (0..=topic.len()).any(|skip| matches_segments(&pattern[1..], &topic[skip..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let pattern = TopicPattern::new("orders.created").unwrap();
        assert!(pattern.matches("orders.created"));
        assert!(!pattern.matches("orders.cancelled"));
        assert!(!pattern.matches("orders"));
        assert!(!pattern.is_wildcard());
    }

    #[test]
    fn test_single_wildcard() {
        let pattern = TopicPattern::new("orders.*").unwrap();
        assert!(pattern.matches("orders.created"));
        assert!(pattern.matches("orders.cancelled"));
        assert!(!pattern.matches("orders.created.eu"));
        assert!(!pattern.matches("orders"));
        assert!(!pattern.matches("invoices.created"));
    }

    #[test]
    fn test_multi_wildcard() {
        let pattern = TopicPattern::new("orders.#").unwrap();
        assert!(pattern.matches("orders.created"));
        assert!(pattern.matches("orders.created.eu"));
        assert!(pattern.matches("orders"));
        assert!(!pattern.matches("invoices.created"));
    }

    #[test]
    fn test_multi_wildcard_in_the_middle() {
        let pattern = TopicPattern::new("orders.#.eu").unwrap();
        assert!(pattern.matches("orders.eu"));
        assert!(pattern.matches("orders.created.eu"));
        assert!(pattern.matches("orders.created.retail.eu"));
        assert!(!pattern.matches("orders.created"));
    }

    #[test]
    fn test_combined_wildcards() {
        let pattern = TopicPattern::new("*.orders.#").unwrap();
        assert!(pattern.matches("eu.orders"));
        assert!(pattern.matches("eu.orders.created.retail"));
        assert!(!pattern.matches("orders.created"));
    }

    #[test]
    fn test_catch_all() {
        let pattern = TopicPattern::new("#").unwrap();
        assert!(pattern.matches("orders"));
        assert!(pattern.matches("orders.created.eu"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::new("").is_err());
        assert!(TopicPattern::new("orders..created").is_err());
        assert!(TopicPattern::new(".orders").is_err());
    }

    #[test]
    fn test_star_is_not_a_substring_wildcard() {
        // `*` only matches a whole segment, never part of one
        let pattern = TopicPattern::new("orders.*").unwrap();
        assert!(!pattern.matches("orders"));
        let literal = TopicPattern::new("orders.cre*").unwrap();
        assert!(!literal.matches("orders.created"));
        assert!(literal.matches("orders.cre*"));
    }
}
