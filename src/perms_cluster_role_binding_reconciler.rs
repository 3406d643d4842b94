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

// The cluster-scoped variant always binds a ClusterRole.
pub const CLUSTER_ROLE_KIND: &str = "ClusterRole";

// Function returns the labels for selecting the resources
fn labels_for_perms_cluster_role_binding(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("crd".to_string(), "PermsClusterRoleBinding".to_string()),
        ("permsclusterrolebinding_cr".to_string(), name.to_string()),
    ])
}

/// Builds the ClusterRoleBinding the intent resource asks for.
pub fn cluster_rolebinding_build(pcrb: &PermsClusterRoleBinding) -> rbacv1::ClusterRoleBinding {
    let pcrb_name = pcrb.metadata.name.clone().unwrap();
    rbacv1::ClusterRoleBinding {
        metadata: metav1::ObjectMeta {
            name: Some(pcrb_name.clone()),
            labels: Some(labels_for_perms_cluster_role_binding(&pcrb_name)),
            annotations: Some(BTreeMap::from([(
                "infra-mgmt.io/perms".to_string(),
                "operator-created".to_string(),
            )])),
            owner_references: Some(vec![pcrb.controller_owner_ref(&()).unwrap()]),
            ..metav1::ObjectMeta::default()
        },
        role_ref: rbacv1::RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: CLUSTER_ROLE_KIND.to_string(),
            name: pcrb.spec.role.clone(),
        },
        subjects: Some(subjects_build(
            &pcrb.spec.groups,
            &pcrb.spec.users,
            &pcrb.spec.serviceaccounts,
        )),
    }
}

/// Decides what this invocation does to the ClusterRoleBinding. The role kind
/// is fixed, so only the role name can drift.
pub fn cluster_rolebinding_action(
    pcrb: &PermsClusterRoleBinding,
    observed: Option<&rbacv1::ClusterRoleBinding>,
) -> BindingAction<rbacv1::ClusterRoleBinding> {
    let observed = match observed {
        None => return BindingAction::Create(cluster_rolebinding_build(pcrb)),
        Some(observed) => observed,
    };
    if observed.role_ref.name != pcrb.spec.role {
        return BindingAction::Freeze;
    }
    let projected = subjects_build(&pcrb.spec.groups, &pcrb.spec.users, &pcrb.spec.serviceaccounts);
    if subjects_match(observed.subjects.as_ref(), &projected) {
        BindingAction::Unchanged
    } else {
        BindingAction::Update(rbacv1::ClusterRoleBinding {
            subjects: Some(projected),
            ..observed.clone()
        })
    }
}

/// Same status write discipline as the namespaced variant: refresh the intent
/// resource first, skip the write when nothing changed, log failures and move
/// on.
async fn update_status(client: &Client, name: &str, outcome: ReconcileOutcome) {
    let pcrb_api = Api::<PermsClusterRoleBinding>::all(client.clone());
    let latest = match pcrb_api.get(name).await {
        Ok(latest) => latest,
        Err(e) => {
            warn!(
                "Failed to refresh PermsClusterRoleBinding {} before status update: {}",
                name, e
            );
            return;
        }
    };
    let previous = latest.status.clone().unwrap_or_default();
    let mut conditions = previous.conditions.clone();
    let now = metav1::Time(Utc::now());
    for condition in outcome.conditions("PermsClusterRoleBinding", &now) {
        set_status_condition(&mut conditions, condition);
    }
    let status = PermsBindingStatus {
        conditions,
        count: latest.spec.subject_count(),
    };
    if status == previous {
        return;
    }
    if let Err(e) = pcrb_api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(json!({ "status": status })))
        .await
    {
        warn!("Failed to update PermsClusterRoleBinding status for {}: {}", name, e);
    }
}

/// Controller triggers this whenever a PermsClusterRoleBinding or an owned
/// ClusterRoleBinding changed
pub async fn perms_cluster_role_binding_reconcile(
    pcrb_from_cache: Arc<PermsClusterRoleBinding>,
    ctx: Arc<Data>,
) -> Result<Action, Error> {
    let client = &ctx.client;

    let pcrb_name = pcrb_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.name"))?;

    let pcrb_api = Api::<PermsClusterRoleBinding>::all(client.clone());

    // Get the PermsClusterRoleBinding custom resource before taking any reconciliation actions.
    let get_result = pcrb_api.get(pcrb_name).await;
    match get_result {
        Err(kube_client::error::Error::Api(kube_core::ErrorResponse { reason, .. }))
            if &reason == "NotFound" =>
        {
            info!("{} not found, end reconcile", pcrb_name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::CRGetFailed(e)),
        _ => {}
    }
    let pcrb = get_result.unwrap();

    let crb_api = Api::<rbacv1::ClusterRoleBinding>::all(client.clone());
    let observed = crb_api
        .get_opt(pcrb_name)
        .await
        .map_err(Error::ClusterRoleBindingGetFailed)?;

    match cluster_rolebinding_action(&pcrb, observed.as_ref()) {
        BindingAction::Create(crb) => {
            info!("Creating a new ClusterRoleBinding: {}", pcrb_name);
            update_status(client, pcrb_name, ReconcileOutcome::CreateInProgress).await;
            match crb_api.create(&PostParams::default(), &crb).await {
                Ok(_) => {
                    update_status(client, pcrb_name, ReconcileOutcome::Settled).await;
                    Ok(Action::requeue(Duration::ZERO))
                }
                Err(e) => {
                    error!(
                        "Failed to create ClusterRoleBinding {}, check that the referenced role exists: {}",
                        pcrb_name, e
                    );
                    update_status(client, pcrb_name, ReconcileOutcome::FailedCreate).await;
                    Ok(Action::requeue(Duration::from_secs(60)))
                }
            }
        }
        BindingAction::Freeze => {
            error!(
                "Immutable role reference changed for {}, leaving ClusterRoleBinding untouched",
                pcrb_name
            );
            update_status(client, pcrb_name, ReconcileOutcome::DegradedImmutable).await;
            Ok(Action::await_change())
        }
        BindingAction::Update(crb) => {
            info!("Updating ClusterRoleBinding: {}", pcrb_name);
            match crb_api.replace(pcrb_name, &PostParams::default(), &crb).await {
                Ok(_) => {
                    update_status(client, pcrb_name, ReconcileOutcome::Settled).await;
                    Ok(Action::requeue(Duration::ZERO))
                }
                Err(e) => {
                    error!("Failed to update ClusterRoleBinding {}: {}", pcrb_name, e);
                    update_status(client, pcrb_name, ReconcileOutcome::FailedUpdate).await;
                    Ok(Action::await_change())
                }
            }
        }
        BindingAction::Unchanged => {
            update_status(client, pcrb_name, ReconcileOutcome::Settled).await;
            Ok(Action::await_change())
        }
    }
}

/// The controller triggers this on reconcile errors
pub fn perms_cluster_role_binding_error_policy(
    _object: Arc<PermsClusterRoleBinding>,
    error: &Error,
    _ctx: Arc<Data>,
) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms_cluster_role_binding(role: &str, groups: &[&str]) -> PermsClusterRoleBinding {
        let mut pcrb = PermsClusterRoleBinding::new(
            "platform-binding",
            PermsClusterRoleBindingSpec {
                role: role.to_string(),
                groups: groups.iter().map(|g| g.to_string()).collect(),
                users: vec![],
                serviceaccounts: vec![],
            },
        );
        pcrb.metadata.uid = Some("0f42b6aa".to_string());
        pcrb
    }

    #[test]
    fn test_created_binding_references_a_cluster_role() {
        let pcrb = perms_cluster_role_binding("cluster-admin", &["g1"]);
        let crb = match cluster_rolebinding_action(&pcrb, None) {
            BindingAction::Create(crb) => crb,
            other => panic!("expected create, got {:?}", other),
        };
        assert_eq!(crb.metadata.name.as_deref(), Some("platform-binding"));
        assert_eq!(crb.metadata.namespace, None);
        assert_eq!(crb.role_ref.kind, CLUSTER_ROLE_KIND);
        assert_eq!(crb.role_ref.name, "cluster-admin");
    }

    #[test]
    fn test_role_name_drift_freezes_the_binding() {
        let old = perms_cluster_role_binding("cluster-admin", &["g1"]);
        let existing = cluster_rolebinding_build(&old);
        let drifted = perms_cluster_role_binding("view", &["g1"]);
        assert_eq!(
            cluster_rolebinding_action(&drifted, Some(&existing)),
            BindingAction::Freeze
        );
    }

    #[test]
    fn test_matching_binding_is_left_alone() {
        let pcrb = perms_cluster_role_binding("view", &["g1", "g2"]);
        let existing = cluster_rolebinding_build(&pcrb);
        assert_eq!(
            cluster_rolebinding_action(&pcrb, Some(&existing)),
            BindingAction::Unchanged
        );
    }

    #[test]
    fn test_subject_drift_triggers_update() {
        let old = perms_cluster_role_binding("view", &["g1"]);
        let existing = cluster_rolebinding_build(&old);
        let new = perms_cluster_role_binding("view", &["g1", "g2"]);
        let crb = match cluster_rolebinding_action(&new, Some(&existing)) {
            BindingAction::Update(crb) => crb,
            other => panic!("expected update, got {:?}", other),
        };
        let names: Vec<&str> = crb.subjects.as_ref().unwrap().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["g1", "g2"]);
        assert_eq!(crb.role_ref, existing.role_ref);
    }
}
