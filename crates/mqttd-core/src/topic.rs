//! Topic name and topic filter rules.
//!
//! Names and filters are `/`-separated level sequences. Filters may use the
//! `+` (single level) and `#` (multi level, terminal) wildcards; names may
//! not. Topics starting with `$` get no special treatment here.

use crate::error::TopicError;

/// Reject levels containing U+0000, U+0001..U+001F or U+007F..U+009F.
fn has_control_chars(level: &str) -> bool {
    level
        .chars()
        .any(|c| c == '\u{0}' || ('\u{1}'..='\u{1f}').contains(&c) || ('\u{7f}'..='\u{9f}').contains(&c))
}

/// Shared structural checks: non-empty input, no empty levels, no control
/// characters. A trailing `/` or two consecutive `/` produce an empty level.
fn validate_levels(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    for level in topic.split('/') {
        if level.is_empty() {
            return Err(TopicError::EmptyLevel);
        }
        if has_control_chars(level) {
            return Err(TopicError::ControlCharacter);
        }
    }
    Ok(())
}

/// Validate a topic name, as used in PUBLISH. Wildcards are not allowed.
pub fn validate_name(name: &str) -> Result<(), TopicError> {
    validate_levels(name)?;
    if name.contains('+') || name.contains('#') {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// Validate a topic filter, as used in SUBSCRIBE / UNSUBSCRIBE.
///
/// MQTT-4.7.1-2: `#` must be the last level and stand alone.
/// MQTT-4.7.1-3: `+` must occupy an entire level (`a+` and `+b` are invalid).
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    validate_levels(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(TopicError::MultiLevelWildcardPosition);
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::SingleLevelWildcardPosition);
        }
    }
    Ok(())
}

/// Check whether a topic filter matches a concrete topic name.
///
/// Both are walked as level arrays left to right: a literal level matches on
/// equality, `+` matches any single level, `#` matches the remainder
/// (including zero levels). Used for retained-message enumeration; the
/// subscription trie implements the same semantics structurally.
pub fn matches(filter: &str, name: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let name_levels: Vec<&str> = name.split('/').collect();

    let mut fi = 0;
    let mut ni = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            return true;
        }

        if ni >= name_levels.len() {
            // Name has fewer levels than the filter
            return false;
        }

        if filter_level == "+" || filter_level == name_levels[ni] {
            fi += 1;
            ni += 1;
        } else {
            return false;
        }
    }

    // Both must be fully consumed
    fi == filter_levels.len() && ni == name_levels.len()
}
