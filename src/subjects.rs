use k8s_openapi::api::rbac::v1 as rbacv1;

use crate::perms_types::Serviceaccount;

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Projects the spec subject lists into the subject list of the derived
/// binding: groups, then users, then service accounts, each in input order.
pub fn subjects_build(
    groups: &[String],
    users: &[String],
    serviceaccounts: &[Serviceaccount],
) -> Vec<rbacv1::Subject> {
    let mut subjects = Vec::with_capacity(groups.len() + users.len() + serviceaccounts.len());
    for group in groups {
        subjects.push(rbacv1::Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "Group".to_string(),
            name: group.clone(),
            ..rbacv1::Subject::default()
        });
    }
    for user in users {
        subjects.push(rbacv1::Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "User".to_string(),
            name: user.clone(),
            ..rbacv1::Subject::default()
        });
    }
    for serviceaccount in serviceaccounts {
        // ServiceAccount subjects live in the core API group and carry a
        // namespace instead.
        subjects.push(rbacv1::Subject {
            kind: "ServiceAccount".to_string(),
            name: serviceaccount.name.clone(),
            namespace: Some(serviceaccount.namespace.clone()),
            ..rbacv1::Subject::default()
        });
    }
    subjects
}

/// Exact ordered-list comparison between the observed subjects and the
/// projected ones. The API server serves an empty subject list as an absent
/// field, so `None` counts as empty. A reorder without a content change does
/// not match and gets rewritten, which is safe, just one extra write.
pub fn subjects_match(observed: Option<&Vec<rbacv1::Subject>>, projected: &[rbacv1::Subject]) -> bool {
    match observed {
        Some(observed) => observed.as_slice() == projected,
        None => projected.is_empty(),
    }
}
