//! WQL text generation
//!
//! Selects, association walks and event subscriptions are all built here so
//! quoting rules live in one place.

use std::time::Duration;
use virtmgmt_core_interface::{EventKind, ObjectPath};

/// Escape a value for use inside a single-quoted literal
pub fn escape_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// True when `value` contains shell wildcards outside a backtick escape
pub fn has_wildcards(value: &str) -> bool {
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '`' => {
                chars.next();
            }
            '*' | '?' | '[' => return true,
            _ => {}
        }
    }
    false
}

/// Translate a shell wildcard pattern into a `LIKE` pattern.
///
/// `*` and `?` become `%` and `_`, literal `%`, `_` and `[` are bracketed,
/// character classes pass through and a backtick escapes the next character.
pub fn wildcard_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            '[' => {
                out.push('[');
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == ']' {
                        break;
                    }
                }
            }
            '`' => match chars.next() {
                Some(literal @ ('%' | '_' | '[')) => {
                    out.push('[');
                    out.push(literal);
                    out.push(']');
                }
                Some(literal) => out.push(literal),
                None => out.push('`'),
            },
            other => out.push(other),
        }
    }
    out
}

/// `Prop = 'v'`, or `Prop LIKE 'pattern'` when wildcards are allowed and present
pub fn filter(property: &str, value: &str, allow_wildcards: bool) -> String {
    if allow_wildcards && has_wildcards(value) {
        format!(
            "{} LIKE '{}'",
            property,
            escape_string(&wildcard_to_like(value))
        )
    } else {
        format!("{} = '{}'", property, escape_string(value))
    }
}

/// Pack `items` greedily into separator-joined chunks no longer than `max`.
///
/// An item longer than `max` on its own still gets a chunk of its own.
pub fn join_with_max_length(items: &[String], separator: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for item in items {
        if current.is_empty() {
            current.push_str(item);
        } else if current.len() + separator.len() + item.len() <= max {
            current.push_str(separator);
            current.push_str(item);
        } else {
            chunks.push(std::mem::take(&mut current));
            current.push_str(item);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub fn select_all(class_name: &str) -> String {
    format!("SELECT * FROM {}", class_name)
}

/// One `SELECT` per chunk of OR-ed filters, each within `max_query_length`
pub fn batched_select(
    class_name: &str,
    filters: &[String],
    max_query_length: usize,
) -> Vec<String> {
    if filters.is_empty() {
        return vec![select_all(class_name)];
    }
    let template_len = format!("SELECT * FROM {} WHERE ()", class_name).len();
    let budget = max_query_length.saturating_sub(template_len);

    join_with_max_length(filters, " OR ", budget)
        .into_iter()
        .map(|clauses| format!("SELECT * FROM {} WHERE ({})", class_name, clauses))
        .collect()
}

/// Optional qualifiers of an association walk
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WalkFilter<'a> {
    pub result_class: Option<&'a str>,
    pub result_role: Option<&'a str>,
    pub role: Option<&'a str>,
}

/// `ASSOCIATORS OF {path} WHERE AssocClass = ...`
pub fn associators_of(
    source: &ObjectPath,
    association_class: &str,
    walk: &WalkFilter<'_>,
) -> String {
    let mut text = format!(
        "ASSOCIATORS OF {{{}}} WHERE AssocClass = {}",
        source, association_class
    );
    if let Some(class) = walk.result_class {
        text.push_str(&format!(" ResultClass = {}", class));
    }
    if let Some(role) = walk.result_role {
        text.push_str(&format!(" ResultRole = {}", role));
    }
    if let Some(role) = walk.role {
        text.push_str(&format!(" Role = {}", role));
    }
    text
}

/// Intrinsic event query for one instance, or for a whole class when `target`
/// is a class path
pub fn event_query<S: AsRef<str>>(
    kind: EventKind,
    target: &ObjectPath,
    within: Duration,
    conditions: impl IntoIterator<Item = S>,
) -> String {
    let mut text = format!(
        "SELECT * FROM {} WITHIN {} WHERE TargetInstance ISA '{}'",
        kind.event_class(),
        within.as_secs().max(1),
        target.class_name()
    );
    for (name, value) in target.keys() {
        text.push_str(&format!(
            " AND TargetInstance.{} = {}",
            name,
            value.to_query_literal()
        ));
    }
    for condition in conditions {
        text.push_str(" AND ");
        text.push_str(condition.as_ref());
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape_string(r"C:\VMs\o'brien"), r"C:\\VMs\\o\'brien");
    }

    #[test]
    fn test_wildcard_translation() {
        assert_eq!(wildcard_to_like("web*"), "web%");
        assert_eq!(wildcard_to_like("vm?"), "vm_");
        assert_eq!(wildcard_to_like("100%_*"), "100[%][_]%");
        assert_eq!(wildcard_to_like("vm[0-9]*"), "vm[0-9]%");
        assert_eq!(wildcard_to_like("a`*b"), "a*b");
        assert_eq!(wildcard_to_like("a`[b"), "a[[]b");
    }

    #[test]
    fn test_filter_choice() {
        assert_eq!(filter("ElementName", "web01", true), "ElementName = 'web01'");
        assert_eq!(filter("ElementName", "web*", true), "ElementName LIKE 'web%'");
        assert_eq!(filter("ElementName", "web*", false), "ElementName = 'web*'");
        assert_eq!(filter("ElementName", "a`*", true), "ElementName = 'a`*'");
    }

    #[test]
    fn test_join_with_max_length() {
        let items: Vec<String> = ["aaaa", "bbbb", "cccc"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            join_with_max_length(&items, ",", 9),
            vec!["aaaa,bbbb".to_string(), "cccc".to_string()]
        );
        assert_eq!(join_with_max_length(&items, ",", 100).len(), 1);
        // oversized item stands alone
        assert_eq!(
            join_with_max_length(&items, ",", 2),
            vec!["aaaa".to_string(), "bbbb".to_string(), "cccc".to_string()]
        );
        assert!(join_with_max_length(&[], ",", 10).is_empty());
    }

    #[test]
    fn test_batched_select_respects_limit() {
        // each clause is 23 chars; 605 of them plus separators fill the
        // 16342 chars left after the SELECT template
        let filters: Vec<String> = (0..1000)
            .map(|i| filter("ElementName", &format!("vm-{:04}", i), false))
            .collect();
        let queries = batched_select("Msvm_ComputerSystem", &filters, 16384);

        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].matches(" OR ").count(), 604);
        for q in &queries {
            assert!(q.len() <= 16384);
            assert!(q.starts_with("SELECT * FROM Msvm_ComputerSystem WHERE ("));
        }
        let clauses: usize = queries.iter().map(|q| q.matches(" = '").count()).sum();
        assert_eq!(clauses, 1000);
    }

    #[test]
    fn test_batched_select_without_filters() {
        assert_eq!(
            batched_select("Msvm_ComputerSystem", &[], 16384),
            vec!["SELECT * FROM Msvm_ComputerSystem".to_string()]
        );
    }

    #[test]
    fn test_associators_of() {
        let path = ObjectPath::instance(
            "h",
            "root\\virtualization\\v2",
            "Msvm_ConcreteJob",
            [("InstanceID", "J1")],
        );
        let text = associators_of(
            &path,
            "Msvm_AffectedJobElement",
            &WalkFilter {
                result_role: Some("AffectedElement"),
                ..Default::default()
            },
        );
        assert_eq!(
            text,
            format!(
                "ASSOCIATORS OF {{{}}} WHERE AssocClass = Msvm_AffectedJobElement ResultRole = AffectedElement",
                path
            )
        );
    }

    #[test]
    fn test_event_query_for_instance() {
        let path = ObjectPath::instance(
            "h",
            "root\\virtualization\\v2",
            "Msvm_ComputerSystem",
            [("Name", "vm'1")],
        );
        let text = event_query(
            EventKind::Deleted,
            &path,
            Duration::from_secs(2),
            Vec::<String>::new(),
        );
        assert_eq!(
            text,
            "SELECT * FROM __InstanceDeletionEvent WITHIN 2 WHERE TargetInstance ISA 'Msvm_ComputerSystem' AND TargetInstance.Name = 'vm\\'1'"
        );
    }

    #[test]
    fn test_event_query_for_class_with_condition() {
        let class = ObjectPath::class("h", "root\\virtualization\\v2", "Msvm_ConcreteJob");
        let text = event_query(
            EventKind::Modified,
            &class,
            Duration::from_secs(2),
            ["TargetInstance.JobState <> PreviousInstance.JobState"],
        );
        assert_eq!(
            text,
            "SELECT * FROM __InstanceModificationEvent WITHIN 2 WHERE TargetInstance ISA 'Msvm_ConcreteJob' AND TargetInstance.JobState <> PreviousInstance.JobState"
        );
    }
}
