//! Child-Resource Projector: peer-discovery headless service and client-facing service.
use crate::crd::{M3dbCluster, cluster_labels};
use crate::reconcile::statefulset::{PORT_CLUSTER, PORT_NODE};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::api::ObjectMeta;

pub trait ServiceExt {
    /// Peer-discovery service: selects all pods of the cluster regardless of readiness, so that
    /// nodes can discover each other while bootstrapping.
    fn headless_service(&self) -> Service;
    /// Client-facing service: ready pods only.
    fn client_service(&self) -> Service;
}

impl ServiceExt for M3dbCluster {
    fn headless_service(&self) -> Service {
        let labels = cluster_labels(&self.name_any());
        Service {
            metadata: ObjectMeta {
                name: Some(self.headless_service_name()),
                namespace: Some(self.namespace_or_default()),
                labels: Some(labels.clone()),
                owner_references: self.controller_owner_ref(&()).map(|oref| vec![oref]),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(labels),
                publish_not_ready_addresses: Some(true),
                ports: Some(vec![
                    ServicePort {
                        name: Some("node".to_string()),
                        port: PORT_NODE,
                        target_port: Some(IntOrString::String("node".to_string())),
                        ..ServicePort::default()
                    },
                    ServicePort {
                        name: Some("cluster".to_string()),
                        port: PORT_CLUSTER,
                        target_port: Some(IntOrString::String("cluster".to_string())),
                        ..ServicePort::default()
                    },
                ]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn client_service(&self) -> Service {
        let labels = cluster_labels(&self.name_any());
        Service {
            metadata: ObjectMeta {
                name: Some(self.client_service_name()),
                namespace: Some(self.namespace_or_default()),
                labels: Some(labels.clone()),
                owner_references: self.controller_owner_ref(&()).map(|oref| vec![oref]),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(labels),
                type_: Some("ClusterIP".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("node".to_string()),
                    port: PORT_NODE,
                    target_port: Some(IntOrString::String("node".to_string())),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::M3dbClusterSpec;

    fn cluster() -> M3dbCluster {
        let mut c = M3dbCluster::new("prod", M3dbClusterSpec::default());
        c.meta_mut().namespace = Some("default".to_string());
        c
    }

    #[test]
    fn test_headless_service_publishes_not_ready_addresses() {
        let svc = cluster().headless_service();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
    }

    #[test]
    fn test_client_service_is_cluster_ip() {
        let svc = cluster().client_service();
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("ClusterIP"));
    }
}
