//! Registration token loop
//!
//! A ClusterRegistrationToken gets a ServiceAccount and a token Secret for
//! it. Once the token controller has filled that Secret in, its name is
//! published in the ClusterRegistrationToken's status.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use fleet_common::crd::{ClusterRegistrationToken, ClusterRegistrationTokenStatus};
use fleet_common::kube_utils::patch_status;
use fleet_common::Error;

use super::resources::{service_account, token_secret};
use super::{
    error_policy, log_reconcile_result, namespace_of, scoped, watcher_config, ReconcileError,
    WAIT_REQUEUE,
};
use crate::apply::Applier;
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "cluster-registration-token";

/// Key of the token in a populated token Secret
pub const TOKEN_KEY: &str = "token";

/// What the token loop may touch
pub struct ClusterRegistrationTokenView {
    /// Scoped to Secret, ServiceAccount, Role, RoleBinding
    pub applier: Applier,
    /// Tokens in every namespace
    pub tokens: Api<ClusterRegistrationToken>,
    /// Every Secret, to find populated ServiceAccount tokens
    pub secrets: Store<Secret>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    applier: Applier,
    tokens: Api<ClusterRegistrationToken>,
    secrets: Store<Secret>,
}

/// Install the loop
pub async fn register(view: ClusterRegistrationTokenView) -> Result<(), Error> {
    let ctx = Arc::new(Context {
        applier: view.applier,
        tokens: view.tokens.clone(),
        secrets: view.secrets,
    });
    view.installer.install(
        NAME,
        Controller::new(view.tokens, watcher_config())
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ClusterRegistrationToken")),
    );
    Ok(())
}

/// Name of the token Secret issued for token `name`
pub fn token_secret_name(name: &str) -> String {
    format!("{name}-token")
}

async fn reconcile(
    token: Arc<ClusterRegistrationToken>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let namespace = namespace_of(token.as_ref())?;
    let name = token.name_any();

    ctx.applier
        .apply(
            &format!("{NAME}-{namespace}-{name}"),
            desired_objects(&namespace, &name)?,
        )
        .await?;

    let secret_name = token_secret_name(&name);
    if !is_populated(&ctx.secrets, &namespace, &secret_name) {
        debug!(token = %name, "waiting for service account token");
        return Ok(Action::requeue(WAIT_REQUEUE));
    }

    let published = token.status.as_ref().and_then(|s| s.secret_name.as_deref());
    if published != Some(secret_name.as_str()) {
        let status = ClusterRegistrationTokenStatus {
            secret_name: Some(secret_name),
        };
        patch_status(&scoped(&ctx.tokens, &namespace), &name, &status).await?;
        info!(token = %name, namespace = %namespace, "registration token issued");
    }
    Ok(Action::await_change())
}

/// Whether the token controller has filled in Secret `name`
fn is_populated(secrets: &Store<Secret>, namespace: &str, name: &str) -> bool {
    secrets
        .get(&ObjectRef::new(name).within(namespace))
        .and_then(|s| s.data.as_ref()?.get(TOKEN_KEY).map(|t| !t.0.is_empty()))
        .unwrap_or(false)
}

fn desired_objects(namespace: &str, name: &str) -> Result<Vec<DynamicObject>, ReconcileError> {
    Ok(vec![
        service_account(namespace, name)?,
        token_secret(namespace, &token_secret_name(name), name)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::testing::MemoryApplyBackend;
    use crate::target::tests::store_of;
    use fleet_common::ResourceKind;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(ns: &str, name: &str, token: &[u8]) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.metadata.namespace = Some(ns.to_string());
        secret.data = Some(BTreeMap::from([(
            TOKEN_KEY.to_string(),
            ByteString(token.to_vec()),
        )]));
        secret
    }

    #[test]
    fn only_filled_in_tokens_count() {
        let secrets = store_of(vec![
            secret("fleet-default", "empty-token", b""),
            secret("fleet-default", "ready-token", b"jwt"),
        ]);
        assert!(!is_populated(&secrets, "fleet-default", "empty-token"));
        assert!(is_populated(&secrets, "fleet-default", "ready-token"));
        assert!(!is_populated(&secrets, "other", "ready-token"));
        assert!(!is_populated(&secrets, "fleet-default", "missing-token"));
    }

    #[tokio::test]
    async fn story_token_objects_stay_in_the_token_namespace() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let applier = Applier::new(backend.clone()).with_cache_types([
            ResourceKind::Secret,
            ResourceKind::ServiceAccount,
            ResourceKind::Role,
            ResourceKind::RoleBinding,
        ]);
        let set = format!("{NAME}-fleet-default-t");

        let report = applier
            .apply(&set, desired_objects("fleet-default", "t").unwrap())
            .await
            .unwrap();

        assert_eq!(report.applied.len(), 2);
        assert!(backend
            .get(ResourceKind::ServiceAccount, Some("fleet-default"), "t")
            .is_some());
        let secret = backend
            .get(ResourceKind::Secret, Some("fleet-default"), "t-token")
            .unwrap();
        assert_eq!(
            secret.metadata.annotations.unwrap()["kubernetes.io/service-account.name"],
            "t"
        );
    }
}
