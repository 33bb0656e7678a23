//! Execution payload handed to a worker with each task.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use drover_kernel::{Cluster, ClusterTask, Node, ProviderSpec, ServiceSpec};

/// Wire form of a taken task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_id: String,
    pub job_id: String,
    pub cluster_id: String,
    pub task_name: String,
    pub node_id: String,
    /// Everything the worker needs to run the task.
    pub config: Value,
}

impl TaskPayload {
    /// Resolves the payload of `task` against the current node properties.
    ///
    /// `service` is the spec of the task's service, `provider` is included for
    /// machine-level tasks only.
    pub fn build(
        task: &ClusterTask,
        cluster: &Cluster,
        nodes: &[Node],
        service: Option<&ServiceSpec>,
        provider: Option<&ProviderSpec>,
    ) -> Self {
        let mut config = Map::new();
        config.insert("action".into(), json!(task.action));
        config.insert("attempt".into(), json!(task.attempt));
        config.insert("cluster".into(), cluster.config.clone());

        if let Some(spec) = service {
            let action = spec.actions.get(&task.action);
            config.insert(
                "service".into(),
                json!({
                    "name": spec.name,
                    "action": action,
                }),
            );
        }

        if task.action.is_machine_action() {
            if let Some(provider) = provider {
                let mut fields = provider.fields.clone();
                for (key, value) in &cluster.provider_fields {
                    fields.insert(key.clone(), value.clone());
                }
                config.insert(
                    "provider".into(),
                    json!({
                        "name": provider.name,
                        "provisionerType": provider.provisioner_type,
                        "fields": fields,
                    }),
                );
            }
        }

        let mut node_map = Map::new();
        for node in nodes {
            if node.id == task.node_id {
                config.insert("nodeProperties".into(), json!(node.properties));
            }
            node_map.insert(
                node.id.clone(),
                json!({
                    "hostname": node.properties.hostname,
                    "ipaddresses": node.properties.ip_addresses,
                    "services": node.services,
                }),
            );
        }
        config.insert("nodes".into(), Value::Object(node_map));

        Self {
            task_id: task.id.to_string(),
            job_id: task.job_id().to_string(),
            cluster_id: cluster.id.clone(),
            task_name: task.name(),
            node_id: task.node_id.clone(),
            config: Value::Object(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;
    use drover_kernel::{Account, ClusterStatus, JobId, ProvisionerAction};

    use super::*;

    fn cluster() -> Cluster {
        let mut provider_fields = Map::new();
        provider_fields.insert("flavor".into(), json!("large"));
        Cluster {
            id: "c1".into(),
            name: "demo".into(),
            account: Account::new("alice", "t1"),
            status: ClusterStatus::Pending,
            template: "base".into(),
            provider: "cloud".into(),
            provider_fields,
            services: BTreeSet::from(["web".to_string()]),
            nodes: BTreeSet::from(["c1-n1".to_string()]),
            config: json!({"tier": "dev"}),
            create_time: Utc::now(),
            expire_time: None,
            latest_job_id: None,
            message: String::new(),
            version: 0,
        }
    }

    fn provider() -> ProviderSpec {
        let mut fields = Map::new();
        fields.insert("flavor".into(), json!("small"));
        fields.insert("region".into(), json!("us-east"));
        ProviderSpec {
            name: "cloud".into(),
            provisioner_type: "openstack".into(),
            fields,
        }
    }

    #[test]
    fn machine_payload_layers_cluster_fields_over_provider() {
        let node = Node::new("c1-n1", "c1", BTreeSet::from(["web".to_string()]));
        let task = ClusterTask::new(
            JobId::new("c1", 1).task(1),
            "c1-n1",
            None,
            ProvisionerAction::Create,
            2,
            Utc::now(),
        );
        let payload = TaskPayload::build(&task, &cluster(), &[node], None, Some(&provider()));
        assert_eq!(payload.task_id, "c1-001-001");
        assert_eq!(payload.job_id, "c1-001");
        assert_eq!(payload.task_name, "CREATE");
        assert_eq!(payload.config["provider"]["fields"]["flavor"], json!("large"));
        assert_eq!(payload.config["provider"]["fields"]["region"], json!("us-east"));
        assert_eq!(payload.config["attempt"], json!(2));
        assert!(payload.config["nodes"]["c1-n1"].is_object());
        assert!(payload.config.get("service").is_none());
    }

    #[test]
    fn service_payload_carries_the_action_spec_and_wire_names() {
        let node = Node::new("c1-n1", "c1", BTreeSet::new());
        let spec = ServiceSpec::new("web").with_action(ProvisionerAction::Start, "shell");
        let task = ClusterTask::new(
            JobId::new("c1", 1).task(4),
            "c1-n1",
            Some("web".into()),
            ProvisionerAction::Start,
            1,
            Utc::now(),
        );
        let payload = TaskPayload::build(&task, &cluster(), &[node], Some(&spec), Some(&provider()));
        assert_eq!(payload.task_name, "START web");
        assert_eq!(payload.config["service"]["action"]["kind"], json!("shell"));
        assert!(payload.config.get("provider").is_none());

        let wire = serde_json::to_value(&payload).unwrap();
        assert!(wire.get("taskId").is_some());
        assert!(wire.get("clusterId").is_some());
    }
}
