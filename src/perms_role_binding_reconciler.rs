use crate::conditions::*;
use crate::perms_types::*;
use crate::subjects::*;

use chrono::Utc;
use k8s_openapi::api::rbac::v1 as rbacv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    runtime::controller::Action,
    Client, Resource,
};
use kube_client;
use kube_core;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

// Function returns the labels for selecting the resources
fn labels_for_perms_role_binding(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("crd".to_string(), "PermsRoleBinding".to_string()),
        ("permsrolebinding_cr".to_string(), name.to_string()),
    ])
}

/// Builds the RoleBinding the intent resource asks for, owned by the intent
/// resource so deleting it cascades to the RoleBinding.
pub fn rolebinding_build(prb: &PermsRoleBinding) -> rbacv1::RoleBinding {
    let prb_name = prb.metadata.name.clone().unwrap();
    rbacv1::RoleBinding {
        metadata: metav1::ObjectMeta {
            name: Some(prb_name.clone()),
            namespace: prb.metadata.namespace.clone(),
            labels: Some(labels_for_perms_role_binding(&prb_name)),
            annotations: Some(BTreeMap::from([(
                "infra-mgmt.io/perms".to_string(),
                "operator-created".to_string(),
            )])),
            owner_references: Some(vec![prb.controller_owner_ref(&()).unwrap()]),
            ..metav1::ObjectMeta::default()
        },
        role_ref: rbacv1::RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: prb.spec.kind.clone(),
            name: prb.spec.role.clone(),
        },
        subjects: Some(subjects_build(
            &prb.spec.groups,
            &prb.spec.users,
            &prb.spec.serviceaccounts,
        )),
    }
}

/// Decides what this invocation does to the RoleBinding, from the intent and
/// observed snapshots alone.
pub fn rolebinding_action(
    prb: &PermsRoleBinding,
    observed: Option<&rbacv1::RoleBinding>,
) -> BindingAction<rbacv1::RoleBinding> {
    let observed = match observed {
        None => return BindingAction::Create(rolebinding_build(prb)),
        Some(observed) => observed,
    };
    // The role reference is immutable in the RBAC API; a drifted reference
    // must never be reconciled by update or delete-and-recreate.
    if observed.role_ref.kind != prb.spec.kind || observed.role_ref.name != prb.spec.role {
        return BindingAction::Freeze;
    }
    let projected = subjects_build(&prb.spec.groups, &prb.spec.users, &prb.spec.serviceaccounts);
    if subjects_match(observed.subjects.as_ref(), &projected) {
        BindingAction::Unchanged
    } else {
        BindingAction::Update(rbacv1::RoleBinding {
            subjects: Some(projected),
            ..observed.clone()
        })
    }
}

/// Recomputes conditions and counts and writes them to the status
/// subresource. The intent resource is re-read right before the write so a
/// stale in-memory copy never overwrites what a concurrent invocation stored;
/// an unchanged status is not written at all. Write failures are logged and
/// left for the next invocation.
async fn update_status(client: &Client, name: &str, namespace: &str, outcome: ReconcileOutcome) {
    let prb_api = Api::<PermsRoleBinding>::namespaced(client.clone(), namespace);
    let latest = match prb_api.get(name).await {
        Ok(latest) => latest,
        Err(e) => {
            warn!("Failed to refresh PermsRoleBinding {} before status update: {}", name, e);
            return;
        }
    };
    let previous = latest.status.clone().unwrap_or_default();
    let mut conditions = previous.conditions.clone();
    let now = metav1::Time(Utc::now());
    for condition in outcome.conditions("PermsRoleBinding", &now) {
        set_status_condition(&mut conditions, condition);
    }
    let status = PermsBindingStatus {
        conditions,
        count: latest.spec.subject_count(),
    };
    if status == previous {
        return;
    }
    if let Err(e) = prb_api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(json!({ "status": status })))
        .await
    {
        warn!("Failed to update PermsRoleBinding status for {}: {}", name, e);
    }
}

/// Controller triggers this whenever a PermsRoleBinding or an owned
/// RoleBinding changed
pub async fn perms_role_binding_reconcile(
    prb_from_cache: Arc<PermsRoleBinding>,
    ctx: Arc<Data>,
) -> Result<Action, Error> {
    let client = &ctx.client;

    let prb_name = prb_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.name"))?;
    let prb_ns = prb_from_cache
        .metadata
        .namespace
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;

    let prb_api = Api::<PermsRoleBinding>::namespaced(client.clone(), prb_ns);

    // Get the PermsRoleBinding custom resource before taking any reconciliation actions.
    let get_result = prb_api.get(prb_name).await;
    match get_result {
        Err(kube_client::error::Error::Api(kube_core::ErrorResponse { reason, .. }))
            if &reason == "NotFound" =>
        {
            info!("{} not found, end reconcile", prb_name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::CRGetFailed(e)),
        _ => {}
    }
    let prb = get_result.unwrap();

    let rb_api = Api::<rbacv1::RoleBinding>::namespaced(client.clone(), prb_ns);
    let observed = rb_api
        .get_opt(prb_name)
        .await
        .map_err(Error::RoleBindingGetFailed)?;

    match rolebinding_action(&prb, observed.as_ref()) {
        BindingAction::Create(rb) => {
            info!("Creating a new RoleBinding: {}/{}", prb_ns, prb_name);
            update_status(client, prb_name, prb_ns, ReconcileOutcome::CreateInProgress).await;
            match rb_api.create(&PostParams::default(), &rb).await {
                Ok(_) => {
                    update_status(client, prb_name, prb_ns, ReconcileOutcome::Settled).await;
                    // Re-validate the fresh RoleBinding promptly.
                    Ok(Action::requeue(Duration::ZERO))
                }
                Err(e) => {
                    error!(
                        "Failed to create RoleBinding {}/{}, check that the referenced role exists: {}",
                        prb_ns, prb_name, e
                    );
                    update_status(client, prb_name, prb_ns, ReconcileOutcome::FailedCreate).await;
                    // Fixed backoff instead of a hot spin against a role that
                    // may stay missing for a while.
                    Ok(Action::requeue(Duration::from_secs(60)))
                }
            }
        }
        BindingAction::Freeze => {
            error!(
                "Immutable role reference changed for {}/{}, leaving RoleBinding untouched",
                prb_ns, prb_name
            );
            update_status(client, prb_name, prb_ns, ReconcileOutcome::DegradedImmutable).await;
            // Terminal until the drift is resolved externally.
            Ok(Action::await_change())
        }
        BindingAction::Update(rb) => {
            info!("Updating RoleBinding: {}/{}", prb_ns, prb_name);
            match rb_api.replace(prb_name, &PostParams::default(), &rb).await {
                Ok(_) => {
                    update_status(client, prb_name, prb_ns, ReconcileOutcome::Settled).await;
                    Ok(Action::requeue(Duration::ZERO))
                }
                Err(e) => {
                    error!("Failed to update RoleBinding {}/{}: {}", prb_ns, prb_name, e);
                    update_status(client, prb_name, prb_ns, ReconcileOutcome::FailedUpdate).await;
                    Ok(Action::await_change())
                }
            }
        }
        BindingAction::Unchanged => {
            update_status(client, prb_name, prb_ns, ReconcileOutcome::Settled).await;
            Ok(Action::await_change())
        }
    }
}

/// The controller triggers this on reconcile errors
pub fn perms_role_binding_error_policy(
    _object: Arc<PermsRoleBinding>,
    error: &Error,
    _ctx: Arc<Data>,
) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms_role_binding(
        kind: &str,
        role: &str,
        groups: &[&str],
        users: &[&str],
    ) -> PermsRoleBinding {
        let mut prb = PermsRoleBinding::new(
            "team-binding",
            PermsRoleBindingSpec {
                kind: kind.to_string(),
                role: role.to_string(),
                groups: groups.iter().map(|g| g.to_string()).collect(),
                users: users.iter().map(|u| u.to_string()).collect(),
                serviceaccounts: vec![],
            },
        );
        prb.metadata.namespace = Some("team-ns".to_string());
        prb.metadata.uid = Some("7a1e9d3c".to_string());
        prb
    }

    #[test]
    fn test_missing_binding_is_created_with_projected_subjects() {
        let prb = perms_role_binding("Role", "viewer", &["g1"], &[]);
        let action = rolebinding_action(&prb, None);
        let rb = match action {
            BindingAction::Create(rb) => rb,
            other => panic!("expected create, got {:?}", other),
        };
        assert_eq!(rb.metadata.name.as_deref(), Some("team-binding"));
        assert_eq!(rb.metadata.namespace.as_deref(), Some("team-ns"));
        assert_eq!(rb.role_ref.api_group, RBAC_API_GROUP);
        assert_eq!(rb.role_ref.kind, "Role");
        assert_eq!(rb.role_ref.name, "viewer");
        let subjects = rb.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "Group");
        assert_eq!(subjects[0].name, "g1");
    }

    #[test]
    fn test_created_binding_is_owned_by_the_intent_resource() {
        let prb = perms_role_binding("Role", "viewer", &["g1"], &[]);
        let rb = rolebinding_build(&prb);
        let owners = rb.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "PermsRoleBinding");
        assert_eq!(owners[0].name, "team-binding");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(
            rb.metadata.annotations.unwrap().get("infra-mgmt.io/perms"),
            Some(&"operator-created".to_string())
        );
    }

    #[test]
    fn test_matching_binding_is_left_alone() {
        let prb = perms_role_binding("Role", "viewer", &["g1"], &["u1"]);
        let existing = rolebinding_build(&prb);
        assert_eq!(rolebinding_action(&prb, Some(&existing)), BindingAction::Unchanged);
    }

    #[test]
    fn test_second_invocation_after_create_is_a_no_op() {
        let prb = perms_role_binding("Role", "viewer", &["g1"], &[]);
        let created = match rolebinding_action(&prb, None) {
            BindingAction::Create(rb) => rb,
            other => panic!("expected create, got {:?}", other),
        };
        assert_eq!(rolebinding_action(&prb, Some(&created)), BindingAction::Unchanged);
    }

    #[test]
    fn test_subject_drift_triggers_update_with_new_projection() {
        let old = perms_role_binding("Role", "viewer", &["g1"], &[]);
        let existing = rolebinding_build(&old);
        let new = perms_role_binding("Role", "viewer", &["g1", "g2"], &[]);
        let rb = match rolebinding_action(&new, Some(&existing)) {
            BindingAction::Update(rb) => rb,
            other => panic!("expected update, got {:?}", other),
        };
        let names: Vec<&str> = rb.subjects.as_ref().unwrap().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["g1", "g2"]);
        // Everything but the subject list is carried over from the observed
        // binding.
        assert_eq!(rb.role_ref, existing.role_ref);
        assert_eq!(rb.metadata, existing.metadata);
    }

    #[test]
    fn test_subject_reorder_triggers_update() {
        let old = perms_role_binding("Role", "viewer", &["g1", "g2"], &[]);
        let existing = rolebinding_build(&old);
        let reordered = perms_role_binding("Role", "viewer", &["g2", "g1"], &[]);
        assert!(matches!(
            rolebinding_action(&reordered, Some(&existing)),
            BindingAction::Update(_)
        ));
    }

    #[test]
    fn test_role_name_drift_freezes_the_binding() {
        let old = perms_role_binding("Role", "viewer", &["g1"], &[]);
        let existing = rolebinding_build(&old);
        let drifted = perms_role_binding("Role", "editor", &["g1"], &[]);
        assert_eq!(rolebinding_action(&drifted, Some(&existing)), BindingAction::Freeze);
    }

    #[test]
    fn test_role_kind_drift_freezes_the_binding() {
        let old = perms_role_binding("Role", "viewer", &["g1"], &[]);
        let existing = rolebinding_build(&old);
        let drifted = perms_role_binding("ClusterRole", "viewer", &["g1"], &[]);
        assert_eq!(rolebinding_action(&drifted, Some(&existing)), BindingAction::Freeze);
    }

    #[test]
    fn test_empty_subject_lists_converge_against_absent_subjects() {
        let prb = perms_role_binding("Role", "viewer", &[], &[]);
        // The API server strips an empty subject list on read.
        let mut existing = rolebinding_build(&prb);
        existing.subjects = None;
        assert_eq!(rolebinding_action(&prb, Some(&existing)), BindingAction::Unchanged);
    }
}
