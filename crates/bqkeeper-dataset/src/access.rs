//! Access-list construction and merging
//!
//! The controller owns only the grants declared in the spec (plus the
//! operator's own OWNER grant). Everything else found on the remote dataset
//! was granted out of band and is carried over untouched, except grants to
//! principals that have since been deleted.

use bqkeeper_common::crd::BigQueryDataset;

use crate::remote::AccessEntry;

/// Principals BigQuery reports for removed service accounts start with this
pub const DELETED_PRINCIPAL_PREFIX: &str = "deleted:serviceAccount";

/// Role granted to the operator principal
pub const OWNER_ROLE: &str = "OWNER";

/// Declared grants, in declared order, followed by the operator principal as
/// OWNER unless it is already declared.
pub fn desired_access(dataset: &BigQueryDataset, operator_principal: Option<&str>) -> Vec<AccessEntry> {
    let declared = dataset
        .spec
        .access
        .iter()
        .map(|a| AccessEntry::user(&a.role, &a.user_by_email))
        .collect();
    ensure_owner(declared, operator_principal)
}

fn ensure_owner(mut access: Vec<AccessEntry>, operator_principal: Option<&str>) -> Vec<AccessEntry> {
    let Some(principal) = operator_principal.filter(|p| !p.is_empty()) else {
        return access;
    };
    if !access.iter().any(|e| e.entity == principal) {
        access.push(AccessEntry::user(OWNER_ROLE, principal));
    }
    access
}

/// Drop grants to deleted service accounts
pub fn remove_deleted_principals(access: Vec<AccessEntry>) -> Vec<AccessEntry> {
    access
        .into_iter()
        .filter(|e| !e.entity.starts_with(DELETED_PRINCIPAL_PREFIX))
        .collect()
}

/// Merge the desired grants with what is currently on the remote dataset.
///
/// Result is `desired` in order, then every surviving remote grant whose
/// principal is not already in `desired`, in remote order. Principal identity
/// is the key, so a declared role replaces a remote role for the same
/// principal. Entries without a principal (authorized views, routines,
/// datasets) never collide.
pub fn merge_access(desired: Vec<AccessEntry>, existing: Vec<AccessEntry>) -> Vec<AccessEntry> {
    let preserved: Vec<AccessEntry> = remove_deleted_principals(existing)
        .into_iter()
        .filter(|remote| {
            !desired
                .iter()
                .any(|d| !d.entity.is_empty() && d.entity == remote.entity)
        })
        .collect();

    let mut merged = desired;
    merged.extend(preserved);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::EntityType;
    use bqkeeper_common::crd::{BigQueryDatasetSpec, DatasetAccess};

    fn dataset_with_access(access: Vec<DatasetAccess>) -> BigQueryDataset {
        BigQueryDataset::new(
            "events",
            BigQueryDatasetSpec {
                name: "events".to_string(),
                project: "proj".to_string(),
                access,
                ..Default::default()
            },
        )
    }

    fn view_entry(table: &str) -> AccessEntry {
        AccessEntry {
            role: String::new(),
            entity_type: EntityType::View,
            entity: String::new(),
            resource: Some(serde_json::json!({"projectId": "p", "datasetId": "d", "tableId": table})),
            ..Default::default()
        }
    }

    mod desired {
        use super::*;

        #[test]
        fn declared_grants_keep_order() {
            let ds = dataset_with_access(vec![
                DatasetAccess::new("WRITER", "a@x.com"),
                DatasetAccess::new("READER", "b@x.com"),
            ]);
            assert_eq!(
                desired_access(&ds, None),
                vec![
                    AccessEntry::user("WRITER", "a@x.com"),
                    AccessEntry::user("READER", "b@x.com"),
                ]
            );
        }

        #[test]
        fn operator_owner_appended_when_absent() {
            let ds = dataset_with_access(vec![DatasetAccess::new("WRITER", "a@x.com")]);
            assert_eq!(
                desired_access(&ds, Some("op@x.com")),
                vec![
                    AccessEntry::user("WRITER", "a@x.com"),
                    AccessEntry::user("OWNER", "op@x.com"),
                ]
            );
        }

        #[test]
        fn operator_owner_not_duplicated_when_declared() {
            let ds = dataset_with_access(vec![DatasetAccess::new("READER", "op@x.com")]);
            assert_eq!(
                desired_access(&ds, Some("op@x.com")),
                vec![AccessEntry::user("READER", "op@x.com")]
            );
        }

        #[test]
        fn empty_operator_principal_ignored() {
            let ds = dataset_with_access(vec![]);
            assert!(desired_access(&ds, Some("")).is_empty());
        }
    }

    mod deleted_principals {
        use super::*;

        #[test]
        fn removes_deleted_service_accounts() {
            let existing = vec![
                AccessEntry::iam_member("READER", "deleted:serviceAccount:user1"),
                AccessEntry::iam_member("READER", "serviceAccount:user1"),
                AccessEntry::iam_member("READER", "serviceAccount:user2"),
            ];
            assert_eq!(
                remove_deleted_principals(existing),
                vec![
                    AccessEntry::iam_member("READER", "serviceAccount:user1"),
                    AccessEntry::iam_member("READER", "serviceAccount:user2"),
                ]
            );
        }

        #[test]
        fn untouched_without_deleted_entries() {
            let existing = vec![AccessEntry::iam_member("READER", "serviceAccount:user1")];
            assert_eq!(remove_deleted_principals(existing.clone()), existing);
        }

        #[test]
        fn handles_empty() {
            assert!(remove_deleted_principals(vec![]).is_empty());
        }
    }

    mod merge {
        use super::*;

        #[test]
        fn additive_merge_puts_desired_first() {
            let merged = merge_access(
                vec![AccessEntry::user("WRITER", "a@x.com")],
                vec![AccessEntry::user("READER", "ext@x.com")],
            );
            assert_eq!(
                merged,
                vec![
                    AccessEntry::user("WRITER", "a@x.com"),
                    AccessEntry::user("READER", "ext@x.com"),
                ]
            );
        }

        #[test]
        fn deleted_identity_pruned_unmanaged_preserved() {
            let merged = merge_access(
                vec![AccessEntry::user("WRITER", "a@x.com")],
                vec![
                    AccessEntry::iam_member("READER", "deleted:serviceAccount:old@x.com"),
                    AccessEntry::iam_member("READER", "serviceAccount:keep@x.com"),
                ],
            );
            assert_eq!(
                merged,
                vec![
                    AccessEntry::user("WRITER", "a@x.com"),
                    AccessEntry::iam_member("READER", "serviceAccount:keep@x.com"),
                ]
            );
        }

        #[test]
        fn deleted_identity_pruned_even_when_declared() {
            let merged = merge_access(
                vec![AccessEntry::user("READER", "deleted:serviceAccount:old@x.com")],
                vec![AccessEntry::iam_member("READER", "deleted:serviceAccount:old@x.com")],
            );
            assert_eq!(
                merged,
                vec![AccessEntry::user("READER", "deleted:serviceAccount:old@x.com")]
            );
        }

        #[test]
        fn declared_role_wins_on_principal_collision() {
            let merged = merge_access(
                vec![AccessEntry::user("READER", "a@x.com")],
                vec![
                    AccessEntry::user("OWNER", "a@x.com"),
                    AccessEntry::user("WRITER", "b@x.com"),
                ],
            );
            assert_eq!(
                merged,
                vec![
                    AccessEntry::user("READER", "a@x.com"),
                    AccessEntry::user("WRITER", "b@x.com"),
                ]
            );
        }

        #[test]
        fn principal_less_entries_never_collide() {
            let merged = merge_access(
                vec![view_entry("v1")],
                vec![view_entry("v2"), view_entry("v3")],
            );
            assert_eq!(merged, vec![view_entry("v1"), view_entry("v2"), view_entry("v3")]);
        }

        #[test]
        fn unmodelled_entries_are_preserved_untouched() {
            let mut conditional = AccessEntry::user("READER", "c@x.com");
            conditional.extra.insert(
                "condition".to_string(),
                serde_json::json!({"expression": "true"}),
            );
            let mut unknown = AccessEntry {
                role: "READER".to_string(),
                entity_type: EntityType::Other,
                ..Default::default()
            };
            unknown
                .extra
                .insert("futureKind".to_string(), serde_json::json!({"x": 1}));

            let merged = merge_access(
                vec![AccessEntry::user("WRITER", "a@x.com")],
                vec![conditional.clone(), unknown.clone()],
            );
            assert_eq!(
                merged,
                vec![AccessEntry::user("WRITER", "a@x.com"), conditional, unknown]
            );
        }

        #[test]
        fn remote_order_preserved() {
            let merged = merge_access(
                vec![],
                vec![
                    AccessEntry::user("READER", "c@x.com"),
                    AccessEntry::user("READER", "a@x.com"),
                    AccessEntry::user("READER", "b@x.com"),
                ],
            );
            let entities: Vec<&str> = merged.iter().map(|e| e.entity.as_str()).collect();
            assert_eq!(entities, vec!["c@x.com", "a@x.com", "b@x.com"]);
        }

        #[test]
        fn merge_is_idempotent() {
            let desired = vec![AccessEntry::user("WRITER", "a@x.com")];
            let once = merge_access(
                desired.clone(),
                vec![AccessEntry::user("READER", "ext@x.com")],
            );
            let twice = merge_access(desired, once.clone());
            assert_eq!(once, twice);
        }
    }
}
