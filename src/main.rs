// Nightly clippy (0.1.64) considers Drop a side effect, see https://github.com/rust-lang/rust-clippy/issues/9608
#![allow(clippy::unnecessary_lazy_evaluations)]

pub mod conditions;
pub mod perms_cluster_role_binding_reconciler;
pub mod perms_role_binding_reconciler;
pub mod perms_types;
pub mod subjects;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::rbac::v1 as rbacv1;
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
    },
    Client, CustomResourceExt, Resource,
};
use std::{env, sync::Arc};
use tracing::*;

use crate::perms_cluster_role_binding_reconciler::*;
use crate::perms_role_binding_reconciler::*;
use crate::perms_types::*;

pub fn report_controller_reconciled<K, QueueErr>(
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<Error, QueueErr>>,
) where
    K: Resource,
    QueueErr: std::error::Error,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => {
            tracing::error!(
                controller.name = controller_name,
                error = err as &dyn std::error::Error,
                "Failed to reconcile object",
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args[1].clone();
    if cmd == String::from("export") {
        info!("exporting custom resource definitions");
        println!("{}", serde_yaml::to_string(&PermsRoleBinding::crd())?);
        println!("{}", serde_yaml::to_string(&PermsClusterRoleBinding::crd())?);
    } else if cmd == String::from("run") {
        info!("running perms-controller");
        let client = Client::try_default().await?;
        let prb_api = Api::<PermsRoleBinding>::all(client.clone());
        let pcrb_api = Api::<PermsClusterRoleBinding>::all(client.clone());

        // Owning the derived bindings re-triggers reconcile whenever one is
        // mutated or deleted out from under us.
        let prb_reconciler = Controller::new(prb_api, ListParams::default())
            .owns(
                Api::<rbacv1::RoleBinding>::all(client.clone()),
                ListParams::default(),
            )
            .shutdown_on_signal()
            .run(
                perms_role_binding_reconcile,
                perms_role_binding_error_policy,
                Arc::new(Data {
                    client: client.clone(),
                }),
            )
            .map(|res| report_controller_reconciled("perms-role-binding-reconciler", &res));
        let pcrb_reconciler = Controller::new(pcrb_api, ListParams::default())
            .owns(
                Api::<rbacv1::ClusterRoleBinding>::all(client.clone()),
                ListParams::default(),
            )
            .shutdown_on_signal()
            .run(
                perms_cluster_role_binding_reconcile,
                perms_cluster_role_binding_error_policy,
                Arc::new(Data {
                    client: client.clone(),
                }),
            )
            .map(|res| report_controller_reconciled("perms-cluster-role-binding-reconciler", &res));
        futures::stream::select(prb_reconciler, pcrb_reconciler)
            .collect::<()>()
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
