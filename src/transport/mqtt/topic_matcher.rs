//! Pure topic matching for MQTT subscription patterns
//!
//! Supports the two MQTT wildcards:
//!
//! - `+` matches exactly one topic level, which must be present
//! - `#` matches every remaining level, including none (`home/#` matches `home`)
//!
//! Patterns are assumed well formed; a `#` anywhere but the last level is not
//! rejected here.

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Check whether a pattern contains either wildcard character
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(['+', '#'])
}

/// Check whether a concrete topic matches a subscription pattern
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    if !is_wildcard(pattern) {
        return false;
    }

    let mut topic_levels = topic.split(LEVEL_SEPARATOR);
    for pattern_level in pattern.split(LEVEL_SEPARATOR) {
        if pattern_level == MULTI_LEVEL {
            return true;
        }
        match topic_levels.next() {
            Some(_) if pattern_level == SINGLE_LEVEL => {}
            Some(topic_level) if topic_level == pattern_level => {}
            _ => return false,
        }
    }

    // Pattern exhausted: the topic must be too
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("home/living/temp", "home/living/temp"));
        assert!(!matches("home/living/temp", "home/living/humidity"));
        assert!(!matches("home/living", "home/living/temp"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("home/+/temp", "home/living/temp"));
        assert!(!matches("home/+/temp", "home/living/humidity"));
        assert!(!matches("home/+", "home"));
        assert!(!matches("home/+", "home/living/temp"));
        assert!(matches("+/+", "a/b"));
        assert!(matches("+", ""));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("#", "a"));
        assert!(matches("#", "a/b/c"));
        assert!(matches("home/#", "home"));
        assert!(matches("home/#", "home/living/temp"));
        assert!(!matches("home/#", "garden/tap"));
        assert!(matches("home/+/#", "home/living"));
        assert!(matches("home/+/#", "home/living/temp/max"));
    }

    #[test]
    fn test_empty_levels_are_literal() {
        assert!(matches("/+", "/a"));
        assert!(!matches("+", "/a"));
        assert!(matches("a//c", "a//c"));
        assert!(matches("a/+/c", "a//c"));
    }

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("a/+"));
        assert!(is_wildcard("#"));
        assert!(!is_wildcard("a/b"));
    }

    fn literal_topic() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z0-9]{0,4}", 1..5).prop_map(|levels| levels.join("/"))
    }

    proptest! {
        #[test]
        fn prop_literal_patterns_match_only_equal_topics(
            pattern in literal_topic(),
            topic in literal_topic(),
        ) {
            prop_assert_eq!(matches(&pattern, &topic), pattern == topic);
        }

        #[test]
        fn prop_hash_matches_everything(topic in literal_topic()) {
            prop_assert!(matches("#", &topic));
        }

        #[test]
        fn prop_prefix_hash_matches_descendants(
            prefix in literal_topic(),
            suffix in literal_topic(),
        ) {
            let pattern = format!("{prefix}/#");
            prop_assert!(matches(&pattern, &prefix));
            let child = format!("{prefix}/{suffix}");
            prop_assert!(matches(&pattern, &child));
        }

        #[test]
        fn prop_plus_replaces_any_single_level(
            levels in prop::collection::vec("[a-z0-9]{1,4}", 1..5),
            index in 0usize..5,
        ) {
            let index = index % levels.len();
            let topic = levels.join("/");
            let mut pattern_levels = levels.clone();
            pattern_levels[index] = "+".to_string();
            prop_assert!(matches(&pattern_levels.join("/"), &topic));
        }
    }
}
