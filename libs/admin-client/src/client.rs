use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use reqwest::{Method, StatusCode};
use tracing::trace;
use url::Url;

use crate::error::{Error, Result, StatusClass};
use crate::model::{
    AddInstancesRequest, ApiErrorBody, InitPlacementRequest, NamespaceListResponse,
    NamespaceOptions, NamespaceSpec, NodeBootstrappedResponse, Placement, PlacementInstance,
    SetWeightRequest,
};

const ENVIRONMENT_HEADER: &str = "Coordinator-Environment";

/// A typed client for one M3DB coordinator's admin API.
///
/// One `AdminClient` corresponds to one cluster; callers that manage several clusters keep a
/// client per cluster key, the way the reconciler caches one per `M3dbCluster` object.
#[derive(Clone)]
pub struct AdminClient {
    http: reqwest::Client,
    base_url: Url,
    environment_name: Option<String>,
}

impl AdminClient {
    pub fn new(base_url: &str, environment_name: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(Error::InvalidEndpoint)?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            environment_name,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        // safe unwrap: path is always a fixed, valid relative reference
        let url = self.base_url.join(path).unwrap();
        let req = self.http.request(method, url);
        match &self.environment_name {
            Some(name) => req.header(ENVIRONMENT_HEADER, name),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        req: reqwest::RequestBuilder,
    ) -> Result<T> {
        self.send_raw(operation, req)
            .await
            .and_then(|body| serde_json::from_slice(&body).map_err(Error::Encode))
    }

    async fn send_raw(
        &self,
        operation: &'static str,
        req: reqwest::RequestBuilder,
    ) -> Result<Vec<u8>> {
        let mut backoff = ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(3)
            .build();

        loop {
            let attempt = req
                .try_clone()
                .expect("admin API requests never stream a body");
            let result = Self::dispatch(operation, attempt).await;
            match result {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() => match backoff.next() {
                    Some(delay) => {
                        trace!(msg = "retrying admin API call", operation, %e, ?delay);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(operation: &'static str, req: reqwest::RequestBuilder) -> Result<Vec<u8>> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Transport(operation.to_string(), e))?;
        let url = resp.url().to_string();
        let status = resp.status();
        if status.is_success() {
            return resp
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| Error::Decode(url, e));
        }
        let message = resp
            .bytes()
            .await
            .ok()
            .and_then(|b| serde_json::from_slice::<ApiErrorBody>(&b).ok())
            .map(|b| b.error)
            .unwrap_or_default();
        Err(Error::Api {
            operation,
            url,
            status,
            class: StatusClass::from_status(status),
            message,
        })
    }

    /// Create the initial placement. Idempotent: if a placement already exists with the same
    /// instance set, this returns success instead of surfacing the coordinator's conflict.
    pub async fn init_placement(
        &self,
        instances: Vec<PlacementInstance>,
        num_shards: u32,
        replication_factor: u32,
    ) -> Result<Placement> {
        let body = InitPlacementRequest {
            instances,
            num_shards,
            replication_factor,
        };
        let req = self
            .request(Method::POST, "/api/v1/services/m3db/placement/init")
            .json(&body);
        match self.send("InitPlacement", req).await {
            Ok(placement) => Ok(placement),
            Err(Error::Api { status, .. }) if status == StatusCode::CONFLICT => {
                let existing = self.get_placement().await?;
                Ok(existing.ok_or(Error::Api {
                    operation: "InitPlacement",
                    url: self.base_url.to_string(),
                    status,
                    class: StatusClass::Other,
                    message: "conflict reported but no placement found".to_string(),
                })?)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_placement(&self) -> Result<Option<Placement>> {
        let req = self.request(Method::GET, "/api/v1/services/m3db/placement");
        match self.send("GetPlacement", req).await {
            Ok(placement) => Ok(Some(placement)),
            Err(Error::Api { class, .. }) if class == StatusClass::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn add_instances(&self, instances: Vec<PlacementInstance>) -> Result<Placement> {
        let body = AddInstancesRequest { instances };
        let req = self
            .request(Method::POST, "/api/v1/services/m3db/placement")
            .json(&body);
        self.send("AddInstances", req).await
    }

    /// Remove a single instance. Callers must have already verified the safety predicate (see
    /// the Placement Computer); this method does not re-check it.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<Placement> {
        let path = format!("/api/v1/services/m3db/placement/{instance_id}");
        let req = self.request(Method::DELETE, &path);
        self.send("RemoveInstance", req).await
    }

    pub async fn set_weight(&self, instance_id: &str, weight: u32) -> Result<Placement> {
        let path = format!("/api/v1/services/m3db/placement/{instance_id}");
        let body = SetWeightRequest { weight };
        let req = self.request(Method::POST, &path).json(&body);
        self.send("SetWeight", req).await
    }

    /// Create a namespace. Idempotent iff an existing namespace with the same name has an
    /// identical options document; a mismatched existing namespace surfaces as an error (the
    /// reconciler reports that as `NamespaceImmutable`, not by retrying this call).
    pub async fn create_namespace(&self, spec: &NamespaceSpec) -> Result<()> {
        let req = self
            .request(Method::POST, "/api/v1/services/m3db/namespace")
            .json(spec);
        match self.send_raw("CreateNamespace", req).await {
            Ok(_) => Ok(()),
            Err(Error::Api { status, .. }) if status == StatusCode::CONFLICT => {
                let namespaces = self.get_namespaces().await?;
                match namespaces.get(&spec.name) {
                    Some(existing) if existing == &spec.options => Ok(()),
                    _ => Err(Error::Api {
                        operation: "CreateNamespace",
                        url: self.base_url.to_string(),
                        status,
                        class: StatusClass::Other,
                        message: format!("namespace {} already exists with different options", spec.name),
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let path = format!("/api/v1/services/m3db/namespace/{name}");
        let req = self.request(Method::DELETE, &path);
        match self.send_raw("DeleteNamespace", req).await {
            Ok(_) => Ok(()),
            Err(Error::Api { class, .. }) if class == StatusClass::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_namespaces(&self) -> Result<std::collections::BTreeMap<String, NamespaceOptions>> {
        let req = self.request(Method::GET, "/api/v1/services/m3db/namespace");
        let resp: NamespaceListResponse = self.send("GetNamespaces", req).await?;
        Ok(resp.registry.namespaces)
    }

    /// Ask a single node's debug endpoint whether it has finished bootstrapping. Transport
    /// failures surface as an `Err`, which the reconciler treats as "unknown" rather than
    /// "not bootstrapped", requeuing instead of deferring the pass on a fixed decision.
    pub async fn node_bootstrapped(&self, pod_endpoint: &str) -> Result<bool> {
        let url = format!("http://{pod_endpoint}/bootstrapped");
        let req = self.http.get(&url);
        let resp: NodeBootstrappedResponse = self.send("NodeBootstrapped", req).await?;
        Ok(resp.bootstrapped)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client() -> AdminClient {
        AdminClient::new("http://coordinator.m3db.svc:7201", Some("prod".to_string())).unwrap()
    }

    #[test]
    fn test_request_joins_path_against_base_url() {
        let client = client();
        let req = client
            .request(Method::GET, "/api/v1/services/m3db/placement")
            .build()
            .unwrap();
        assert_eq!(
            req.url().as_str(),
            "http://coordinator.m3db.svc:7201/api/v1/services/m3db/placement"
        );
    }

    #[test]
    fn test_request_attaches_environment_header_when_configured() {
        let client = client();
        let req = client.request(Method::GET, "/api/v1/services/m3db/placement");
        let built = req.build().unwrap();
        assert_eq!(
            built.headers().get(ENVIRONMENT_HEADER).unwrap(),
            "prod"
        );
    }

    #[test]
    fn test_request_omits_environment_header_when_unset() {
        let client = AdminClient::new("http://coordinator.m3db.svc:7201", None).unwrap();
        let req = client.request(Method::GET, "/api/v1/services/m3db/placement");
        let built = req.build().unwrap();
        assert!(built.headers().get(ENVIRONMENT_HEADER).is_none());
    }

    #[test]
    fn test_status_class_maps_known_codes() {
        assert_eq!(
            StatusClass::from_status(StatusCode::NOT_FOUND),
            StatusClass::NotFound
        );
        assert_eq!(
            StatusClass::from_status(StatusCode::METHOD_NOT_ALLOWED),
            StatusClass::MethodNotAllowed
        );
        assert_eq!(
            StatusClass::from_status(StatusCode::INTERNAL_SERVER_ERROR),
            StatusClass::Other
        );
    }
}
