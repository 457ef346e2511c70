//! Merge metadata for known kinds
//!
//! A registered kind gets strategic merge semantics (keyed lists merge by
//! their key, set lists by value) and server defaulting. Kinds that are not
//! registered, such as custom resources, fall back to JSON merge semantics
//! where every list is replaced wholesale.

use std::collections::HashMap;

use converge_core::GroupKind;

/// How a list field is merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListStrategy {
    /// Replace the whole list
    Atomic,
    /// Merge primitive values as a set
    Set,
    /// Merge object elements identified by the given field
    Keyed(String),
}

/// Merge metadata for one kind
///
/// List paths are dotted map keys from the object root; list elements do not
/// add a segment, so the ports of a deployment's containers live at
/// `spec.template.spec.containers.ports`.
#[derive(Debug, Clone, Default)]
pub struct KindSchema {
    lists: HashMap<String, ListStrategy>,
    pod_spec: Option<String>,
}

impl KindSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a list strategy for a path
    pub fn with_list(mut self, path: impl Into<String>, strategy: ListStrategy) -> Self {
        self.lists.insert(path.into(), strategy);
        self
    }

    /// Mark `root` as an embedded pod spec and register its keyed lists
    pub fn with_pod_spec(mut self, root: &str) -> Self {
        for (suffix, key) in POD_SPEC_LISTS {
            self.lists
                .insert(join(root, suffix), ListStrategy::Keyed(key.to_string()));
        }
        self.pod_spec = Some(root.to_string());
        self
    }

    pub fn list_strategy(&self, path: &str) -> ListStrategy {
        self.lists
            .get(path)
            .cloned()
            .unwrap_or(ListStrategy::Atomic)
    }

    /// Dotted path of the embedded pod spec, if the kind has one
    pub fn pod_spec(&self) -> Option<&str> {
        self.pod_spec.as_deref()
    }
}

/// Keyed lists inside a pod spec, relative to the pod spec root
const POD_SPEC_LISTS: &[(&str, &str)] = &[
    ("containers", "name"),
    ("containers.ports", "containerPort"),
    ("containers.env", "name"),
    ("containers.volumeMounts", "mountPath"),
    ("containers.volumeDevices", "devicePath"),
    ("initContainers", "name"),
    ("initContainers.ports", "containerPort"),
    ("initContainers.env", "name"),
    ("initContainers.volumeMounts", "mountPath"),
    ("initContainers.volumeDevices", "devicePath"),
    ("ephemeralContainers", "name"),
    ("volumes", "name"),
    ("imagePullSecrets", "name"),
    ("hostAliases", "ip"),
];

/// Kinds known to the built-in registry, with their pod spec root if any
const BUILTIN_KINDS: &[(&str, &str, Option<&str>)] = &[
    ("", "Pod", Some("spec")),
    ("", "PodTemplate", Some("template.spec")),
    ("", "ReplicationController", Some("spec.template.spec")),
    ("apps", "Deployment", Some("spec.template.spec")),
    ("apps", "ReplicaSet", Some("spec.template.spec")),
    ("apps", "StatefulSet", Some("spec.template.spec")),
    ("apps", "DaemonSet", Some("spec.template.spec")),
    ("extensions", "Deployment", Some("spec.template.spec")),
    ("extensions", "ReplicaSet", Some("spec.template.spec")),
    ("extensions", "DaemonSet", Some("spec.template.spec")),
    ("batch", "Job", Some("spec.template.spec")),
    ("batch", "CronJob", Some("spec.jobTemplate.spec.template.spec")),
    ("", "Service", None),
    ("", "ConfigMap", None),
    ("", "Secret", None),
    ("", "Namespace", None),
    ("", "ServiceAccount", None),
    ("", "Endpoints", None),
    ("", "PersistentVolume", None),
    ("", "PersistentVolumeClaim", None),
    ("", "LimitRange", None),
    ("", "ResourceQuota", None),
    ("rbac.authorization.k8s.io", "Role", None),
    ("rbac.authorization.k8s.io", "ClusterRole", None),
    ("rbac.authorization.k8s.io", "RoleBinding", None),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding", None),
    ("networking.k8s.io", "Ingress", None),
    ("networking.k8s.io", "IngressClass", None),
    ("networking.k8s.io", "NetworkPolicy", None),
    ("policy", "PodDisruptionBudget", None),
    ("autoscaling", "HorizontalPodAutoscaler", None),
    ("storage.k8s.io", "StorageClass", None),
];

/// Registry of merge metadata keyed by group and kind
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    kinds: HashMap<GroupKind, KindSchema>,
}

impl SchemaRegistry {
    /// A registry without any kinds; every kind uses JSON merge semantics
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Add or replace the schema of a kind
    pub fn register(&mut self, group_kind: GroupKind, schema: KindSchema) {
        self.kinds.insert(group_kind, schema);
    }

    pub fn get(&self, group_kind: &GroupKind) -> Option<&KindSchema> {
        self.kinds.get(group_kind)
    }

    pub fn is_registered(&self, group_kind: &GroupKind) -> bool {
        self.kinds.contains_key(group_kind)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for (group, kind, pod_spec) in BUILTIN_KINDS {
            let mut schema = KindSchema::new()
                .with_list("metadata.finalizers", ListStrategy::Set)
                .with_list("metadata.ownerReferences", ListStrategy::Keyed("uid".into()));
            if let Some(root) = pod_spec {
                schema = schema.with_pod_spec(root);
            }
            match *kind {
                "Service" => {
                    schema = schema.with_list("spec.ports", ListStrategy::Keyed("port".into()));
                }
                "ServiceAccount" => {
                    schema = schema
                        .with_list("secrets", ListStrategy::Keyed("name".into()))
                        .with_list("imagePullSecrets", ListStrategy::Keyed("name".into()));
                }
                _ => {}
            }
            registry.register(GroupKind::new(*group, *kind), schema);
        }
        registry
    }
}

fn join(root: &str, suffix: &str) -> String {
    if root.is_empty() {
        suffix.to_string()
    } else {
        format!("{}.{}", root, suffix)
    }
}
