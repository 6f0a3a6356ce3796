//! Child-Resource Projector: the `StatefulSet` per isolation group.
use crate::crd::{IsolationGroupSpec, M3dbCluster, PodIdentitySource, isolation_group_labels};

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction,
    ObjectFieldSelector, PersistentVolumeClaim, PodAffinityTerm, PodAntiAffinity, PodSpec,
    PodTemplateSpec, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::api::ObjectMeta;

pub const CONTAINER_NAME: &str = "m3dbnode";
pub const PORT_NODE: i32 = 9000;
pub const PORT_CLUSTER: i32 = 9001;
pub const PORT_DEBUG: i32 = 9002;
const VOLUME_DATA_NAME: &str = "m3db-data";
const VOLUME_DATA_PATH: &str = "/var/lib/m3db";
const VOLUME_CONFIG_NAME: &str = "m3db-config";
const VOLUME_CONFIG_PATH: &str = "/etc/m3db/config";
const VOLUME_IDENTITY_NAME: &str = "m3db-pod-identity";
const VOLUME_IDENTITY_PATH: &str = "/etc/m3db/pod-identity";
const INIT_CONTAINER_NAME: &str = "init-pod-identity";

pub trait StatefulSetExt {
    fn statefulset_for_group(&self, group: &IsolationGroupSpec) -> StatefulSet;
}

impl StatefulSetExt for M3dbCluster {
    fn statefulset_for_group(&self, group: &IsolationGroupSpec) -> StatefulSet {
        let cluster_name = self.name_any();
        let name = self.group_resource_name(&group.name);
        let namespace = self.namespace_or_default();
        let pod_labels = isolation_group_labels(&cluster_name, &group.name);
        let labels: BTreeMap<String, String> = pod_labels
            .clone()
            .into_iter()
            .chain(self.labels().clone())
            .collect();

        let ports = vec![
            ContainerPort {
                name: Some("node".to_string()),
                container_port: PORT_NODE,
                ..ContainerPort::default()
            },
            ContainerPort {
                name: Some("cluster".to_string()),
                container_port: PORT_CLUSTER,
                ..ContainerPort::default()
            },
            ContainerPort {
                name: Some("debug".to_string()),
                container_port: PORT_DEBUG,
                ..ContainerPort::default()
            },
        ];

        let env = vec![
            EnvVar {
                name: "M3DB_ISOLATION_GROUP".to_string(),
                value: Some(group.name.clone()),
                ..EnvVar::default()
            },
            EnvVar {
                name: "M3DB_CONFIG_FILE".to_string(),
                value: Some(format!("{VOLUME_CONFIG_PATH}/m3dbnode.yml")),
                ..EnvVar::default()
            },
        ];

        let probe = Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/bootstrapped".to_string()),
                port: IntOrString::Int(PORT_DEBUG),
                ..HTTPGetAction::default()
            }),
            ..Probe::default()
        };

        let volume_mounts = vec![
            VolumeMount {
                name: VOLUME_DATA_NAME.to_string(),
                mount_path: VOLUME_DATA_PATH.to_string(),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: VOLUME_CONFIG_NAME.to_string(),
                mount_path: VOLUME_CONFIG_PATH.to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: VOLUME_IDENTITY_NAME.to_string(),
                mount_path: VOLUME_IDENTITY_PATH.to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        ];

        let m3dbnode_container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.spec.image.clone()),
            env: Some(env),
            ports: Some(ports),
            volume_mounts: Some(volume_mounts),
            resources: self.spec.resources.clone(),
            readiness_probe: Some(probe.clone()),
            liveness_probe: Some(probe),
            ..Container::default()
        };

        let init_container = Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(self.spec.image.clone()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            args: Some(vec![pod_identity_init_script(&self.spec.pod_identity_config.sources)]),
            env: Some(vec![
                EnvVar {
                    name: "POD_NAME".to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.name".to_string(),
                            ..ObjectFieldSelector::default()
                        }),
                        ..EnvVarSource::default()
                    }),
                    ..EnvVar::default()
                },
                EnvVar {
                    name: "POD_UID".to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.uid".to_string(),
                            ..ObjectFieldSelector::default()
                        }),
                        ..EnvVarSource::default()
                    }),
                    ..EnvVar::default()
                },
                EnvVar {
                    name: "NODE_NAME".to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "spec.nodeName".to_string(),
                            ..ObjectFieldSelector::default()
                        }),
                        ..EnvVarSource::default()
                    }),
                    ..EnvVar::default()
                },
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: VOLUME_IDENTITY_NAME.to_string(),
                mount_path: VOLUME_IDENTITY_PATH.to_string(),
                ..VolumeMount::default()
            }]),
            ..Container::default()
        };

        let anti_affinity = Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(pod_labels.clone()),
                        match_expressions: None,
                    }),
                    topology_key: "kubernetes.io/hostname".to_string(),
                    ..PodAffinityTerm::default()
                }]),
                ..PodAntiAffinity::default()
            }),
            ..Affinity::default()
        };

        let (volumes, volume_claim_templates) = expand_storage(self, vec![Volume {
            name: VOLUME_CONFIG_NAME.to_string(),
            config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                name: self.config_map_name(),
                ..Default::default()
            }),
            ..Volume::default()
        }, Volume {
            name: VOLUME_IDENTITY_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        }]);

        StatefulSet {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(namespace),
                labels: Some(labels.clone()),
                owner_references: self.controller_owner_ref(&()).map(|oref| vec![oref]),
                ..ObjectMeta::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(group.num_instances as i32),
                service_name: self.headless_service_name(),
                selector: LabelSelector {
                    match_labels: Some(pod_labels.clone()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![m3dbnode_container],
                        init_containers: Some(vec![init_container]),
                        volumes: Some(volumes),
                        affinity: Some(anti_affinity),
                        ..PodSpec::default()
                    }),
                },
                volume_claim_templates,
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        }
    }
}

/// Fixed field order of `identity::PodIdentity`, which is also `serde`'s (and therefore
/// `stable_hash`'s) encoding order. The init container must reproduce this exactly, key name for
/// key name and field for field, or the id the node derives for itself will never match the id
/// the operator registered for it in the placement.
const IDENTITY_FIELD_ORDER: [(PodIdentitySource, &str); 5] = [
    (PodIdentitySource::PodName, "pod_name"),
    (PodIdentitySource::PodUid, "pod_uid"),
    (PodIdentitySource::NodeName, "node_name"),
    (PodIdentitySource::NodeExternalId, "node_external_id"),
    (PodIdentitySource::NodeProviderId, "node_provider_id"),
];

/// Shell one-liner that writes `identity::PodIdentity`'s canonical JSON encoding to the
/// pod-identity volume, honoring the configured source set: a field whose source isn't configured
/// is rendered as a JSON `null`, matching `Option::None`'s serialization, exactly as
/// `identity::resolve_pod_identity` leaves it unset.
///
/// `PodName`/`PodUid`/`NodeName` come straight off the downward API. `NodeExternalId`/
/// `NodeProviderId` aren't exposed by the downward API at all (it only projects fields of the pod
/// itself), so when either is configured the script additionally reads the bound `Node` object
/// from the API server using the pod's own service-account token.
fn pod_identity_init_script(sources: &[PodIdentitySource]) -> String {
    let needs_node_object = sources
        .iter()
        .any(|s| matches!(s, PodIdentitySource::NodeExternalId | PodIdentitySource::NodeProviderId));

    let fetch_node = if needs_node_object {
        "TOKEN=\"$(cat /var/run/secrets/kubernetes.io/serviceaccount/token)\"; \
NODE_JSON=\"$(wget -q -O - \
--header=\"Authorization: Bearer $TOKEN\" --no-check-certificate \
\"https://$KUBERNETES_SERVICE_HOST:$KUBERNETES_SERVICE_PORT/api/v1/nodes/$NODE_NAME\")\"; "
    } else {
        ""
    };

    let mut format_parts = Vec::with_capacity(IDENTITY_FIELD_ORDER.len());
    let mut printf_args = Vec::new();
    for (source, key) in IDENTITY_FIELD_ORDER {
        if sources.contains(&source) {
            format_parts.push(format!(r#""{key}":"%s""#));
            printf_args.push(match source {
                PodIdentitySource::PodName => "\"$POD_NAME\"".to_string(),
                PodIdentitySource::PodUid => "\"$POD_UID\"".to_string(),
                PodIdentitySource::NodeName => "\"$NODE_NAME\"".to_string(),
                PodIdentitySource::NodeExternalId => {
                    "\"$(printf '%s' \"$NODE_JSON\" | sed -n 's/.*\"externalID\":\"\\([^\"]*\\)\".*/\\1/p')\""
                        .to_string()
                }
                PodIdentitySource::NodeProviderId => {
                    "\"$(printf '%s' \"$NODE_JSON\" | sed -n 's/.*\"providerID\":\"\\([^\"]*\\)\".*/\\1/p')\""
                        .to_string()
                }
            });
        } else {
            format_parts.push(format!(r#""{key}":null"#));
        }
    }

    let format_str = format!("{{{}}}", format_parts.join(","));
    format!(
        "set -e; {fetch_node}printf '{format_str}' {} > {VOLUME_IDENTITY_PATH}/identity",
        printf_args.join(" ")
    )
}

fn expand_storage(
    cluster: &M3dbCluster,
    volumes: Vec<Volume>,
) -> (Vec<Volume>, Option<Vec<PersistentVolumeClaim>>) {
    match &cluster.spec.volume_claim_template {
        Some(pvc) => (volumes, Some(vec![pvc.clone()])),
        None => (
            volumes
                .into_iter()
                .chain(std::iter::once(Volume {
                    name: VOLUME_DATA_NAME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Volume::default()
                }))
                .collect(),
            None,
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::M3dbClusterSpec;

    fn cluster() -> M3dbCluster {
        let mut c = M3dbCluster::new(
            "prod",
            M3dbClusterSpec {
                replication_factor: 3,
                num_shards: 64,
                ..Default::default()
            },
        );
        c.meta_mut().namespace = Some("default".to_string());
        c
    }

    #[test]
    fn test_statefulset_name_and_replicas() {
        let c = cluster();
        let group = IsolationGroupSpec {
            name: "g1".to_string(),
            num_instances: 3,
        };
        let sts = c.statefulset_for_group(&group);
        assert_eq!(sts.metadata.name.as_deref(), Some("prod-g1"));
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(3));
    }

    #[test]
    fn test_statefulset_uses_empty_dir_without_volume_claim_template() {
        let c = cluster();
        let group = IsolationGroupSpec {
            name: "g1".to_string(),
            num_instances: 1,
        };
        let sts = c.statefulset_for_group(&group);
        let spec = sts.spec.unwrap();
        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == VOLUME_DATA_NAME && v.empty_dir.is_some()));
    }

    #[test]
    fn test_statefulset_has_anti_affinity_for_group_label() {
        let c = cluster();
        let group = IsolationGroupSpec {
            name: "g1".to_string(),
            num_instances: 1,
        };
        let sts = c.statefulset_for_group(&group);
        let affinity = sts
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .affinity
            .unwrap();
        assert!(affinity.pod_anti_affinity.is_some());
    }

    #[test]
    fn test_identity_script_renders_only_configured_sources_as_values() {
        let script = pod_identity_init_script(&[PodIdentitySource::PodName, PodIdentitySource::PodUid]);
        assert!(script.contains(r#""pod_name":"%s""#));
        assert!(script.contains(r#""pod_uid":"%s""#));
        assert!(script.contains(r#""node_name":null"#));
        assert!(script.contains(r#""node_external_id":null"#));
        assert!(script.contains(r#""node_provider_id":null"#));
        assert!(!script.contains("KUBERNETES_SERVICE_HOST"));
    }

    #[test]
    fn test_identity_script_fetches_node_object_only_when_node_level_source_configured() {
        let script = pod_identity_init_script(&[PodIdentitySource::NodeExternalId]);
        assert!(script.contains("KUBERNETES_SERVICE_HOST"));
        assert!(script.contains(r#""node_external_id":"%s""#));
        assert!(script.contains(r#""node_provider_id":null"#));
    }

    #[test]
    fn test_identity_script_field_order_matches_pod_identity_struct() {
        let script = pod_identity_init_script(&[
            PodIdentitySource::PodName,
            PodIdentitySource::PodUid,
            PodIdentitySource::NodeName,
            PodIdentitySource::NodeExternalId,
            PodIdentitySource::NodeProviderId,
        ]);
        let pod_name_pos = script.find("\"pod_name\"").unwrap();
        let pod_uid_pos = script.find("\"pod_uid\"").unwrap();
        let node_name_pos = script.find("\"node_name\"").unwrap();
        let node_external_id_pos = script.find("\"node_external_id\"").unwrap();
        let node_provider_id_pos = script.find("\"node_provider_id\"").unwrap();
        assert!(pod_name_pos < pod_uid_pos);
        assert!(pod_uid_pos < node_name_pos);
        assert!(node_name_pos < node_external_id_pos);
        assert!(node_external_id_pos < node_provider_id_pos);
    }
}
