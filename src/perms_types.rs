use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "perms.infra-mgmt.io", version = "v1beta1", kind = "PermsRoleBinding")]
#[kube(namespaced)]
#[kube(shortname = "permsrb")]
#[kube(shortname = "prb")]
#[kube(status = "PermsBindingStatus")]
#[kube(printcolumn = r#"{"name":"Users", "type":"string", "jsonPath":".status.count.users"}"#)]
#[kube(printcolumn = r#"{"name":"Groups", "type":"string", "jsonPath":".status.count.groups"}"#)]
#[kube(
    printcolumn = r#"{"name":"Serviceaccounts", "type":"string", "jsonPath":".status.count.serviceaccounts"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Progressing", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Progressing\")].status"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Degraded", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Degraded\")].status"}"#
)]
pub struct PermsRoleBindingSpec {
    // RoleRef kind and name of the RoleBinding to maintain. Both are
    // immutable once the RoleBinding has been created.
    pub kind: String,
    pub role: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, rename = "user")]
    pub users: Vec<String>,
    #[serde(default)]
    pub serviceaccounts: Vec<Serviceaccount>,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "perms.infra-mgmt.io", version = "v1beta1", kind = "PermsClusterRoleBinding")]
#[kube(shortname = "permscrb")]
#[kube(shortname = "pcrb")]
#[kube(status = "PermsBindingStatus")]
#[kube(printcolumn = r#"{"name":"Users", "type":"string", "jsonPath":".status.count.users"}"#)]
#[kube(printcolumn = r#"{"name":"Groups", "type":"string", "jsonPath":".status.count.groups"}"#)]
#[kube(
    printcolumn = r#"{"name":"Serviceaccounts", "type":"string", "jsonPath":".status.count.serviceaccounts"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Progressing", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Progressing\")].status"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Degraded", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Degraded\")].status"}"#
)]
pub struct PermsClusterRoleBindingSpec {
    // The referenced role is always a ClusterRole; only its name is
    // configurable. Immutable once the ClusterRoleBinding has been created.
    pub role: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, rename = "user")]
    pub users: Vec<String>,
    #[serde(default)]
    pub serviceaccounts: Vec<Serviceaccount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Serviceaccount {
    pub name: String,
    pub namespace: String,
}

/// Status shared by both custom resources: the three conditions plus the
/// subject count summary.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PermsBindingStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,
    #[serde(default)]
    pub count: SubjectCount,
}

/// Subject counts by category, kept as decimal strings so they render
/// directly in the CRD print columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SubjectCount {
    #[serde(default)]
    pub users: String,
    #[serde(default)]
    pub groups: String,
    #[serde(default)]
    pub serviceaccounts: String,
}

impl SubjectCount {
    pub fn new(users: usize, groups: usize, serviceaccounts: usize) -> SubjectCount {
        SubjectCount {
            users: users.to_string(),
            groups: groups.to_string(),
            serviceaccounts: serviceaccounts.to_string(),
        }
    }
}

impl PermsRoleBindingSpec {
    pub fn subject_count(&self) -> SubjectCount {
        SubjectCount::new(self.users.len(), self.groups.len(), self.serviceaccounts.len())
    }
}

impl PermsClusterRoleBindingSpec {
    pub fn subject_count(&self) -> SubjectCount {
        SubjectCount::new(self.users.len(), self.groups.len(), self.serviceaccounts.len())
    }
}

/// The single action a reconcile invocation takes against the derived
/// binding, decided from the intent and observed snapshots. Besides status
/// writes, at most one of these is executed per invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingAction<B> {
    /// No binding exists yet; create this one.
    Create(B),
    /// The binding exists but its subjects drifted; replace it with this one.
    Update(B),
    /// The immutable role reference changed; leave the binding untouched.
    Freeze,
    /// The binding already matches the desired projection.
    Unchanged,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to get CR: {0}")]
    CRGetFailed(#[source] kube::Error),
    #[error("Failed to get RoleBinding: {0}")]
    RoleBindingGetFailed(#[source] kube::Error),
    #[error("Failed to get ClusterRoleBinding: {0}")]
    ClusterRoleBindingGetFailed(#[source] kube::Error),
}

// Data we want access to in error/reconcile calls
pub struct Data {
    pub client: Client,
}
