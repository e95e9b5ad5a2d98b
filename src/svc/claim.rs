//! # Claim manager module
//!
//! This module provides the claim manager (component E): pure functions
//! deciding adopt/release/ignore for a candidate attachment relative to a
//! parent and its selector, grounded the way `kube::runtime::finalizer`'s
//! state machine turns ownership facts into a small closed set of actions.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::{api::DynamicObject, ResourceExt};

// -----------------------------------------------------------------------------
// Decision

/// the outcome of reducing one candidate attachment through the claim rules
/// of §4.E.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Decision {
    /// owned and still matching: no write needed.
    Keep,
    /// owned but the selector no longer matches and the parent is not
    /// deleting: patch removing the owner reference.
    Release,
    /// an orphan matching the selector, with the parent alive and the
    /// attachment not itself deleting: patch adding a controller owner
    /// reference.
    Adopt,
    /// controller-refed to a different parent, or any other case the rules
    /// do not cover: leave untouched.
    Ignore,
}

/// the minimal parent facts the claim manager needs, decoupled from any
/// particular typed parent representation.
pub struct ParentFacts<'a> {
    pub uid: &'a str,
    pub deleting: bool,
    pub selector: Option<&'a LabelSelector>,
    /// consulted only when `selector` is `None`: an attachment matches iff its
    /// name appears in this list. Lets a controller claim named children
    /// without authoring a label selector at all.
    pub name_selector: Option<&'a [String]>,
}

/// decides the claim outcome for `candidate` relative to `parent`.
pub fn decide(parent: &ParentFacts<'_>, candidate: &DynamicObject) -> Decision {
    let controller_ref = candidate
        .owner_references()
        .iter()
        .find(|owner| owner.controller.unwrap_or(false));

    let selector_matches = matches_selector(parent, candidate);

    match controller_ref {
        Some(owner) if owner.uid == parent.uid => {
            if selector_matches {
                Decision::Keep
            } else if parent.deleting {
                Decision::Ignore
            } else {
                Decision::Release
            }
        }
        Some(_) => Decision::Ignore,
        None => {
            let candidate_deleting = candidate.meta().deletion_timestamp.is_some();
            if selector_matches && !parent.deleting && !candidate_deleting && can_adopt(parent) {
                Decision::Adopt
            } else {
                Decision::Ignore
            }
        }
    }
}

/// `canAdopt` precondition: the parent must still exist with the observed
/// uid and have no deletion timestamp. The uid/existence checks are the
/// caller's responsibility (it only constructs `ParentFacts` for parents it
/// has just fetched); this function only re-asserts the liveness half,
/// standardizing "orphan + attachment being deleted ⇒ do not adopt" at the
/// call site above rather than here.
fn can_adopt(parent: &ParentFacts<'_>) -> bool {
    !parent.deleting
}

/// a candidate matches the parent's label selector when one was supplied;
/// otherwise falls back to the parent's name selector (matching by name
/// instead of labels); otherwise nothing matches.
fn matches_selector(parent: &ParentFacts<'_>, candidate: &DynamicObject) -> bool {
    let Some(selector) = parent.selector else {
        return match parent.name_selector {
            Some(names) => names.iter().any(|name| name == candidate.name_any().as_str()),
            None => false,
        };
    };

    let labels = candidate.labels();

    let match_labels_ok = selector
        .match_labels
        .as_ref()
        .map(|required| {
            required
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
        })
        .unwrap_or(true);

    let match_expressions_ok = selector
        .match_expressions
        .as_ref()
        .map(|requirements| requirements.iter().all(|req| matches_requirement(req, labels)))
        .unwrap_or(true);

    match_labels_ok && match_expressions_ok
}

fn matches_requirement(
    requirement: &LabelSelectorRequirement,
    labels: &std::collections::BTreeMap<String, String>,
) -> bool {
    let values = requirement.values.clone().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => labels
            .get(&requirement.key)
            .map(|v| values.contains(v))
            .unwrap_or(false),
        "NotIn" => labels
            .get(&requirement.key)
            .map(|v| !values.contains(v))
            .unwrap_or(true),
        "Exists" => labels.contains_key(&requirement.key),
        "DoesNotExist" => !labels.contains_key(&requirement.key),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn labeled(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(labels: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labeled(labels)),
            match_expressions: None,
        }
    }

    fn object(labels: &[(&str, &str)], owner_uid: Option<&str>) -> DynamicObject {
        let mut obj = DynamicObject::new("child", &kube::discovery::ApiResource {
            group: String::new(),
            version: "v1".into(),
            kind: "Child".into(),
            api_version: "v1".into(),
            plural: "children".into(),
        });
        obj.metadata = ObjectMeta {
            labels: Some(labeled(labels)),
            owner_references: owner_uid.map(|uid| {
                vec![OwnerReference {
                    controller: Some(true),
                    uid: uid.to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        };
        obj
    }

    #[test]
    fn keeps_owned_and_matching() {
        let sel = selector(&[("app", "x")]);
        let parent = ParentFacts { uid: "p-1", deleting: false, selector: Some(&sel), name_selector: None };
        let child = object(&[("app", "x")], Some("p-1"));
        assert_eq!(decide(&parent, &child), Decision::Keep);
    }

    #[test]
    fn releases_owned_when_selector_no_longer_matches() {
        let sel = selector(&[("app", "x")]);
        let parent = ParentFacts { uid: "p-1", deleting: false, selector: Some(&sel), name_selector: None };
        let child = object(&[("app", "y")], Some("p-1"));
        assert_eq!(decide(&parent, &child), Decision::Release);
    }

    #[test]
    fn does_not_release_while_parent_deleting() {
        let sel = selector(&[("app", "x")]);
        let parent = ParentFacts { uid: "p-1", deleting: true, selector: Some(&sel), name_selector: None };
        let child = object(&[("app", "y")], Some("p-1"));
        assert_eq!(decide(&parent, &child), Decision::Ignore);
    }

    #[test]
    fn adopts_matching_orphan() {
        let sel = selector(&[("app", "x")]);
        let parent = ParentFacts { uid: "p-1", deleting: false, selector: Some(&sel), name_selector: None };
        let child = object(&[("app", "x")], None);
        assert_eq!(decide(&parent, &child), Decision::Adopt);
    }

    #[test]
    fn ignores_orphan_when_parent_deleting() {
        let sel = selector(&[("app", "x")]);
        let parent = ParentFacts { uid: "p-1", deleting: true, selector: Some(&sel), name_selector: None };
        let child = object(&[("app", "x")], None);
        assert_eq!(decide(&parent, &child), Decision::Ignore);
    }

    #[test]
    fn ignores_refed_to_other_parent() {
        let sel = selector(&[("app", "x")]);
        let parent = ParentFacts { uid: "p-1", deleting: false, selector: Some(&sel), name_selector: None };
        let child = object(&[("app", "x")], Some("p-2"));
        assert_eq!(decide(&parent, &child), Decision::Ignore);
    }

    #[test]
    fn adopts_by_name_selector_when_no_label_selector_is_set() {
        let names = vec!["child".to_string()];
        let parent = ParentFacts { uid: "p-1", deleting: false, selector: None, name_selector: Some(&names) };
        let child = object(&[], None);
        assert_eq!(decide(&parent, &child), Decision::Adopt);
    }

    #[test]
    fn ignores_name_not_in_name_selector() {
        let names = vec!["other".to_string()];
        let parent = ParentFacts { uid: "p-1", deleting: false, selector: None, name_selector: Some(&names) };
        let child = object(&[], None);
        assert_eq!(decide(&parent, &child), Decision::Ignore);
    }

    #[test]
    fn label_selector_takes_precedence_over_name_selector() {
        let sel = selector(&[("app", "x")]);
        let names = vec!["unrelated".to_string()];
        let parent = ParentFacts { uid: "p-1", deleting: false, selector: Some(&sel), name_selector: Some(&names) };
        let child = object(&[("app", "x")], None);
        assert_eq!(decide(&parent, &child), Decision::Adopt);
    }

    // table-driven sweep over (owner uid, candidate labels, parent deleting,
    // candidate deleting) covering every branch of §4.E's decision table.
    #[rstest::rstest]
    #[case::owned_matching(Some("p-1"), &[("app", "x")], false, false, Decision::Keep)]
    #[case::owned_mismatched_live_parent(Some("p-1"), &[("app", "y")], false, false, Decision::Release)]
    #[case::owned_mismatched_deleting_parent(Some("p-1"), &[("app", "y")], true, false, Decision::Ignore)]
    #[case::orphan_matching(None, &[("app", "x")], false, false, Decision::Adopt)]
    #[case::orphan_matching_but_parent_deleting(None, &[("app", "x")], true, false, Decision::Ignore)]
    #[case::orphan_matching_but_candidate_deleting(None, &[("app", "x")], false, true, Decision::Ignore)]
    #[case::orphan_not_matching(None, &[("app", "y")], false, false, Decision::Ignore)]
    #[case::refed_to_other_parent(Some("p-2"), &[("app", "x")], false, false, Decision::Ignore)]
    fn decision_table(
        #[case] owner_uid: Option<&str>,
        #[case] labels: &[(&str, &str)],
        #[case] parent_deleting: bool,
        #[case] candidate_deleting: bool,
        #[case] expected: Decision,
    ) {
        let sel = selector(&[("app", "x")]);
        let parent = ParentFacts { uid: "p-1", deleting: parent_deleting, selector: Some(&sel), name_selector: None };
        let mut child = object(labels, owner_uid);
        if candidate_deleting {
            child.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        }
        assert_eq!(decide(&parent, &child), expected);
    }
}
