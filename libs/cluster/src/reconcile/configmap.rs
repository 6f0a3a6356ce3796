//! Child-Resource Projector: the rendered `m3dbnode.yml` configuration map.
use crate::crd::{M3dbCluster, cluster_labels};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use serde::Serialize;

pub const CONFIG_FILE_NAME: &str = "m3dbnode.yml";
pub const POD_IDENTITY_PATH: &str = "/etc/m3db/pod-identity/identity";

/// Inputs the config-map template is parameterized by: environment name, ordered etcd endpoints,
/// and whether the carbon ingester is enabled.
#[derive(Serialize)]
struct ConfigTemplate<'a> {
    coordinator: CoordinatorSection<'a>,
}

#[derive(Serialize)]
struct CoordinatorSection<'a> {
    environment: Option<&'a str>,
    etcd: EtcdSection<'a>,
    #[serde(rename = "podIdentityPath")]
    pod_identity_path: &'a str,
    carbon: Option<CarbonSection>,
}

#[derive(Serialize)]
struct EtcdSection<'a> {
    endpoints: &'a [String],
}

#[derive(Serialize)]
struct CarbonSection {
    enabled: bool,
}

/// Render the YAML configuration consumed by the `m3dbnode` process. `carbon_ingester_enabled`
/// is a reconciler-level flag (not currently surfaced on the CRD); defaults to disabled.
pub fn render_config(
    environment_name: Option<&str>,
    etcd_endpoints: &[String],
    carbon_ingester_enabled: bool,
) -> String {
    let template = ConfigTemplate {
        coordinator: CoordinatorSection {
            environment: environment_name,
            etcd: EtcdSection {
                endpoints: etcd_endpoints,
            },
            pod_identity_path: POD_IDENTITY_PATH,
            carbon: Some(CarbonSection {
                enabled: carbon_ingester_enabled,
            }),
        },
    };
    // safe unwrap: ConfigTemplate is a plain, always-serializable struct
    serde_yaml::to_string(&template).unwrap()
}

pub trait ConfigMapExt {
    fn config_map(&self) -> ConfigMap;
}

impl ConfigMapExt for M3dbCluster {
    fn config_map(&self) -> ConfigMap {
        let rendered = render_config(
            self.spec.environment_name.as_deref(),
            &self.spec.etcd_endpoints,
            false,
        );
        let mut data = BTreeMap::new();
        data.insert(CONFIG_FILE_NAME.to_string(), rendered);

        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.config_map_name()),
                namespace: Some(self.namespace_or_default()),
                labels: Some(cluster_labels(&self.name_any())),
                owner_references: self.controller_owner_ref(&()).map(|oref| vec![oref]),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_config_includes_etcd_endpoints() {
        let rendered = render_config(Some("prod"), &["etcd-0:2379".to_string()], false);
        assert!(rendered.contains("etcd-0:2379"));
        assert!(rendered.contains("environment: prod"));
        assert!(rendered.contains(POD_IDENTITY_PATH));
    }

    #[test]
    fn test_render_config_omits_environment_when_unset() {
        let rendered = render_config(None, &[], false);
        assert!(rendered.contains("environment: null"));
    }
}
