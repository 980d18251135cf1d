use k8s_openapi::api::core::v1::Node as K8sNode;
use kube::Api;
use std::{collections::BTreeMap, fmt::Debug, time::Duration};
use tracing::{trace, warn};

const LABEL_RETRIES: u32 = 3;
const LABEL_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Source of the k8s node labels.
#[tonic::async_trait]
pub trait NodeLabels: Send + Sync + Debug {
    /// Get the labels of the given k8s node.
    async fn node_labels(&self, node_name: &str) -> anyhow::Result<BTreeMap<String, String>>;
}

/// Reads the node labels through the k8s api.
#[derive(Clone)]
pub struct KubeNodeLabels {
    client: kube::client::Client,
}

impl Debug for KubeNodeLabels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeNodeLabels").finish_non_exhaustive()
    }
}

impl KubeNodeLabels {
    /// Return a new `Self` using the given client.
    pub fn new(client: kube::client::Client) -> Self {
        Self { client }
    }
    /// Return a new `Self` using the in-cluster (or kubeconfig) client.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = kube::client::Client::try_default().await?;
        Ok(Self::new(client))
    }
}

#[tonic::async_trait]
impl NodeLabels for KubeNodeLabels {
    async fn node_labels(&self, node_name: &str) -> anyhow::Result<BTreeMap<String, String>> {
        let nodes: Api<K8sNode> = Api::all(self.client.clone());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match nodes.get(node_name).await {
                Ok(node) => {
                    let labels = node.metadata.labels.unwrap_or_default();
                    trace!(node.name = node_name, ?labels, "Got node labels");
                    return Ok(labels);
                }
                Err(error) if attempt < LABEL_RETRIES => {
                    warn!(node.name = node_name, %error, attempt, "Failed to get node, retrying");
                    tokio::time::sleep(LABEL_RETRY_INTERVAL).await;
                }
                Err(error) => anyhow::bail!("Failed to get node: {}. {}", node_name, error),
            }
        }
    }
}
