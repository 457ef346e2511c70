//! kube-rs backed cluster access
//!
//! [`KubeClusterClient`] implements the collaborator traits of
//! [`crate::client`] on top of a [`kube::Client`]. Objects are handled as
//! [`DynamicObject`]s resolved through API discovery, so no compile-time type
//! knowledge is needed. Discovery is cached and refreshed once whenever a type
//! is not found, which covers CRDs created during a sync.

mod resources;

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, ValidationDirective},
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use tracing::{debug, info};

use converge_core::{GroupKind, GroupVersionKind, Resource};
use converge_diff::{DiffError, ServerSideDryRunner};

use crate::client::{
    ApplyOptions, ClusterResourceClient, DeleteOptions, ScopeResolver, ServerResource,
};
use crate::error::{KubeError, Result};

use resources::{
    describe, from_dynamic, kube_gvk, propagation, server_resource, to_dynamic, with_last_applied,
};

/// Cluster access through the Kubernetes API
pub struct KubeClusterClient {
    client: Client,
    discovery: RwLock<Arc<Discovery>>,
}

impl KubeClusterClient {
    /// Create a client and run the initial discovery
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self {
            client,
            discovery: RwLock::new(Arc::new(discovery)),
        })
    }

    /// Connect with the inferred kubeconfig or in-cluster configuration
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Self::new(client).await
    }

    /// Create from existing client and discovery (for reuse)
    pub fn with_discovery(client: Client, discovery: Discovery) -> Self {
        Self {
            client,
            discovery: RwLock::new(Arc::new(discovery)),
        }
    }

    /// Refresh the discovery cache (call after CRD changes)
    pub async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        *self
            .discovery
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(discovery);
        Ok(())
    }

    fn cached_discovery(&self) -> Arc<Discovery> {
        self.discovery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve a type, refreshing discovery once on a miss
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        let wanted = kube_gvk(gvk);
        if let Some(found) = self.cached_discovery().resolve_gvk(&wanted) {
            return Ok(found);
        }
        debug!(%gvk, "Type not in discovery cache, refreshing");
        self.refresh_discovery().await?;
        self.cached_discovery()
            .resolve_gvk(&wanted)
            .ok_or_else(|| KubeError::ResourceTypeNotFound { gvk: gvk.clone() })
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Api<DynamicObject>> {
        let (api_resource, caps) = self.resolve(gvk).await?;
        if caps.scope == Scope::Namespaced {
            let namespace = if namespace.is_empty() {
                "default"
            } else {
                namespace
            };
            Ok(Api::namespaced_with(
                self.client.clone(),
                namespace,
                &api_resource,
            ))
        } else {
            Ok(Api::all_with(self.client.clone(), &api_resource))
        }
    }

    async fn api_for(&self, resource: &Resource) -> Result<Api<DynamicObject>> {
        self.api(&resource.group_version_kind(), resource.namespace())
            .await
    }

    /// The object as sent to the API server; cluster-scoped objects lose their namespace
    async fn outgoing(&self, resource: &Resource) -> Result<DynamicObject> {
        let (_, caps) = self.resolve(&resource.group_version_kind()).await?;
        let mut object = to_dynamic(resource)?;
        if caps.scope == Scope::Cluster {
            object.metadata.namespace = None;
        }
        Ok(object)
    }

    async fn server_side_apply(
        &self,
        resource: &Resource,
        options: &ApplyOptions,
    ) -> Result<String> {
        let api = self.api_for(resource).await?;
        let mut params = PatchParams::apply(&options.manager);
        params.force = options.force;
        params.dry_run = options.dry_run;
        if !options.validate {
            params.field_validation = Some(ValidationDirective::Ignore);
        }

        let exists = api.get_opt(resource.name()).await?.is_some();
        let object = self.outgoing(resource).await?;
        api.patch(resource.name(), &params, &Patch::Apply(&object))
            .await?;
        let verb = if exists { "serverside-applied" } else { "created" };
        Ok(outcome(resource, verb, options.dry_run))
    }

    /// Create, or merge into the live object, recording the last-applied configuration
    async fn client_side_apply(
        &self,
        resource: &Resource,
        options: &ApplyOptions,
    ) -> Result<String> {
        let api = self.api_for(resource).await?;
        let applied = with_last_applied(resource)?;

        if api.get_opt(resource.name()).await?.is_none() {
            let params = post_params(options);
            api.create(&params, &self.outgoing(&applied).await?).await?;
            return Ok(outcome(resource, "created", options.dry_run));
        }

        let params = PatchParams {
            dry_run: options.dry_run,
            field_manager: Some(options.manager.clone()),
            field_validation: (!options.validate).then_some(ValidationDirective::Ignore),
            ..Default::default()
        };
        let object = self.outgoing(&applied).await?;
        api.patch(resource.name(), &params, &Patch::Merge(&object))
            .await?;
        Ok(outcome(resource, "configured", options.dry_run))
    }
}

fn post_params(options: &ApplyOptions) -> PostParams {
    PostParams {
        dry_run: options.dry_run,
        field_manager: Some(options.manager.clone()),
    }
}

fn outcome(resource: &Resource, verb: &str, dry_run: bool) -> String {
    let suffix = if dry_run { " (dry run)" } else { "" };
    format!("{} {}{}", describe(resource), verb, suffix)
}

#[async_trait]
impl ClusterResourceClient for KubeClusterClient {
    async fn get(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<Resource> {
        let api = self.api(gvk, namespace).await?;
        let object = api.get(name).await?;
        from_dynamic(&object)
    }

    async fn apply(&self, resource: &Resource, options: &ApplyOptions) -> Result<String> {
        debug!(
            resource = %resource,
            server_side = options.server_side,
            dry_run = options.dry_run,
            "Applying"
        );
        if options.server_side {
            self.server_side_apply(resource, options).await
        } else {
            self.client_side_apply(resource, options).await
        }
    }

    async fn create(&self, resource: &Resource, options: &ApplyOptions) -> Result<String> {
        let api = self.api_for(resource).await?;
        api.create(&post_params(options), &self.outgoing(resource).await?)
            .await?;
        Ok(outcome(resource, "created", options.dry_run))
    }

    async fn replace(&self, resource: &Resource, options: &ApplyOptions) -> Result<String> {
        let api = self.api_for(resource).await?;
        let params = post_params(options);

        if options.force {
            // delete and recreate, as `kubectl replace --force` does
            if !options.dry_run {
                info!(resource = %resource, "Deleting before recreating");
                api.delete(resource.name(), &DeleteParams::foreground())
                    .await?;
            }
            api.create(&params, &self.outgoing(resource).await?).await?;
            return Ok(outcome(resource, "replaced", options.dry_run));
        }

        let mut object = self.outgoing(resource).await?;
        if object.metadata.resource_version.is_none() {
            let live = api.get(resource.name()).await?;
            object.metadata.resource_version = live.metadata.resource_version;
        }
        api.replace(resource.name(), &params, &object).await?;
        Ok(outcome(resource, "replaced", options.dry_run))
    }

    async fn update(&self, resource: &Resource, dry_run: bool) -> Result<Resource> {
        let api = self.api_for(resource).await?;
        let params = PostParams {
            dry_run,
            ..Default::default()
        };
        let object = api
            .replace(resource.name(), &params, &self.outgoing(resource).await?)
            .await?;
        from_dynamic(&object)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<()> {
        let api = self.api(gvk, namespace).await?;
        let params = DeleteParams {
            propagation_policy: Some(propagation(options.propagation)),
            ..Default::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn discover_resource_type(
        &self,
        gvk: &GroupVersionKind,
        verb: &str,
    ) -> Result<ServerResource> {
        let (api_resource, caps) = self.resolve(gvk).await?;
        let found = server_resource(&api_resource, &caps);
        if !found.supports(verb) {
            return Err(KubeError::MethodNotSupported {
                gvk: gvk.clone(),
                verb: verb.to_string(),
            });
        }
        Ok(found)
    }
}

impl ScopeResolver for KubeClusterClient {
    /// Answered from the cached discovery only
    fn is_namespaced(&self, group_kind: &GroupKind) -> Result<bool> {
        let discovery = self.cached_discovery();
        discovery
            .groups()
            .filter(|group| group.name() == group_kind.group)
            .flat_map(|group| group.recommended_resources())
            .find(|(api_resource, _)| api_resource.kind == group_kind.kind)
            .map(|(_, caps)| caps.scope == Scope::Namespaced)
            .ok_or_else(|| KubeError::ResourceTypeNotFound {
                gvk: GroupVersionKind::new(&group_kind.group, "", &group_kind.kind),
            })
    }
}

#[async_trait]
impl ServerSideDryRunner for KubeClusterClient {
    async fn run(&self, resource: &Resource, manager: &str) -> converge_diff::Result<String> {
        let dry_run_error = |message: String| DiffError::DryRun {
            kind: resource.kind().to_string(),
            name: resource.name().to_string(),
            message,
        };
        let api = self
            .api_for(resource)
            .await
            .map_err(|e| dry_run_error(e.to_string()))?;
        let object = self
            .outgoing(resource)
            .await
            .map_err(|e| dry_run_error(e.to_string()))?;

        let params = PatchParams::apply(manager).force().dry_run();
        let predicted = api
            .patch(resource.name(), &params, &Patch::Apply(&object))
            .await
            .map_err(|e| dry_run_error(e.to_string()))?;
        Ok(serde_json::to_string(&predicted)?)
    }
}
