//! Targeting predicates evaluated against a recipient's session attributes.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::connection::SessionContext;

/// Attributes a [`Condition`] is evaluated against. Borrowed from the
/// connection's session so evaluation never allocates.
#[derive(Debug, Clone, Copy)]
pub struct RecipientContext<'a> {
    pub user_id: &'a str,
    pub tags: &'a HashSet<String>,
    pub client_version: Option<&'a str>,
    pub os_name: Option<&'a str>,
    pub os_version: Option<&'a str>,
}

impl<'a> From<&'a SessionContext> for RecipientContext<'a> {
    fn from(session: &'a SessionContext) -> Self {
        Self {
            user_id: &session.user_id,
            tags: &session.tags,
            client_version: session.client_version.as_deref(),
            os_name: session.os_name.as_deref(),
            os_version: session.os_version.as_deref(),
        }
    }
}

/// Broadcast targeting predicate.
///
/// Serialized with an internal `type` tag, e.g.
/// `{"type": "tags", "any_of": ["beta"]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Matches every recipient.
    #[default]
    Always,
    /// Recipient holds at least one of the tags.
    Tags { any_of: Vec<String> },
    UserIds { user_ids: HashSet<String> },
    /// Case-insensitive OS name match.
    OsName { os_name: String },
    /// Inclusive client version range. Either bound may be omitted.
    ClientVersion {
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
    OsVersion {
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    /// True for the unconditional variant. Callers check this before
    /// building a [`RecipientContext`].
    pub fn is_always(&self) -> bool {
        matches!(self, Condition::Always)
    }

    pub fn test(&self, ctx: &RecipientContext<'_>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Tags { any_of } => any_of.iter().any(|tag| ctx.tags.contains(tag)),
            Condition::UserIds { user_ids } => user_ids.contains(ctx.user_id),
            Condition::OsName { os_name } => ctx
                .os_name
                .is_some_and(|name| name.eq_ignore_ascii_case(os_name)),
            Condition::ClientVersion { min, max } => {
                in_version_range(ctx.client_version, min.as_deref(), max.as_deref())
            }
            Condition::OsVersion { min, max } => {
                in_version_range(ctx.os_version, min.as_deref(), max.as_deref())
            }
            Condition::And { conditions } => conditions.iter().all(|c| c.test(ctx)),
            Condition::Or { conditions } => conditions.iter().any(|c| c.test(ctx)),
            Condition::Not { condition } => !condition.test(ctx),
        }
    }
}

fn in_version_range(version: Option<&str>, min: Option<&str>, max: Option<&str>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(version) = version else {
        return false;
    };
    if let Some(min) = min {
        if compare_versions(version, min) == Ordering::Less {
            return false;
        }
    }
    if let Some(max) = max {
        if compare_versions(version, max) == Ordering::Greater {
            return false;
        }
    }
    true
}

/// Compare dotted versions segment by segment. Numeric segments compare as
/// numbers, anything else lexically; a missing segment counts as `0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.trim().split('.');
    let mut right = b.trim().split('.');
    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => compare_segment(l.unwrap_or("0"), r.unwrap_or("0")),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

fn compare_segment(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Attrs {
        tags: HashSet<String>,
    }

    fn ctx<'a>(
        attrs: &'a Attrs,
        user_id: &'a str,
        os: &'a str,
        version: &'a str,
    ) -> RecipientContext<'a> {
        RecipientContext {
            user_id,
            tags: &attrs.tags,
            client_version: Some(version),
            os_name: Some(os),
            os_version: Some("14.2"),
        }
    }

    fn attrs(tags: &[&str]) -> Attrs {
        Attrs {
            tags: tags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn always_matches_everyone() {
        let a = attrs(&[]);
        assert!(Condition::Always.is_always());
        assert!(Condition::Always.test(&ctx(&a, "u1", "android", "1.0")));
    }

    #[test]
    fn tags_match_any() {
        let a = attrs(&["beta", "vip"]);
        let c = Condition::Tags {
            any_of: vec!["vip".into(), "staff".into()],
        };
        assert!(c.test(&ctx(&a, "u1", "ios", "1.0")));

        let other = attrs(&["beta"]);
        assert!(!c.test(&ctx(&other, "u1", "ios", "1.0")));
    }

    #[test]
    fn os_name_is_case_insensitive() {
        let a = attrs(&[]);
        let c = Condition::OsName {
            os_name: "iOS".into(),
        };
        assert!(c.test(&ctx(&a, "u1", "ios", "1.0")));
        assert!(!c.test(&ctx(&a, "u1", "android", "1.0")));
    }

    #[test]
    fn client_version_range_is_inclusive() {
        let a = attrs(&[]);
        let c = Condition::ClientVersion {
            min: Some("2.1".into()),
            max: Some("2.10.0".into()),
        };
        assert!(c.test(&ctx(&a, "u1", "ios", "2.1")));
        assert!(c.test(&ctx(&a, "u1", "ios", "2.9.9")));
        assert!(c.test(&ctx(&a, "u1", "ios", "2.10")));
        assert!(!c.test(&ctx(&a, "u1", "ios", "2.0.9")));
        assert!(!c.test(&ctx(&a, "u1", "ios", "2.11")));
    }

    #[test]
    fn missing_version_fails_bounded_range() {
        let a = attrs(&[]);
        let mut context = ctx(&a, "u1", "ios", "1.0");
        context.client_version = None;
        let bounded = Condition::ClientVersion {
            min: Some("1.0".into()),
            max: None,
        };
        let unbounded = Condition::ClientVersion {
            min: None,
            max: None,
        };
        assert!(!bounded.test(&context));
        assert!(unbounded.test(&context));
    }

    #[test]
    fn combinators_short_circuit() {
        let a = attrs(&["vip"]);
        let context = ctx(&a, "u1", "android", "3.0");

        let and = Condition::And {
            conditions: vec![
                Condition::Tags {
                    any_of: vec!["vip".into()],
                },
                Condition::OsName {
                    os_name: "android".into(),
                },
            ],
        };
        let or = Condition::Or {
            conditions: vec![
                Condition::UserIds {
                    user_ids: ["u2".to_string()].into(),
                },
                Condition::OsName {
                    os_name: "android".into(),
                },
            ],
        };
        let not = Condition::Not {
            condition: Box::new(and.clone()),
        };

        assert!(and.test(&context));
        assert!(or.test(&context));
        assert!(!not.test(&context));
        assert!(Condition::And { conditions: vec![] }.test(&context));
        assert!(!Condition::Or { conditions: vec![] }.test(&context));
    }

    #[test]
    fn compare_versions_handles_mixed_segments() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0-beta", "1.0-alpha"), Ordering::Greater);
    }

    #[test]
    fn deserializes_tagged_json() {
        let c: Condition = serde_json::from_value(serde_json::json!({
            "type": "and",
            "conditions": [
                { "type": "tags", "any_of": ["beta"] },
                { "type": "not", "condition": { "type": "os_name", "os_name": "web" } },
                { "type": "client_version", "min": "2.0" }
            ]
        }))
        .unwrap();

        match c {
            Condition::And { conditions } => {
                assert_eq!(conditions.len(), 3);
                assert_eq!(
                    conditions[2],
                    Condition::ClientVersion {
                        min: Some("2.0".into()),
                        max: None,
                    }
                );
            }
            other => panic!("unexpected condition: {other:?}"),
        }
    }
}
