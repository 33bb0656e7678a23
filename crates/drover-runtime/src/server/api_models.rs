//! Request and response DTOs of the task and job endpoints.
//!
//! Worker-facing bodies use camelCase field names; operator responses are
//! wrapped in [ApiEnvelope].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use drover_kernel::{JobStatus, TaskStatus};

use crate::delivery::{FinishReport, TaskResult};

#[derive(Clone, Debug, Serialize)]
pub struct ApiEnvelope<T> {
    pub meta: ApiMeta,
    pub request_id: String,
    pub data: T,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApiMeta {
    pub status: &'static str,
    pub api_version: &'static str,
}

impl ApiMeta {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            api_version: "v1",
        }
    }
}

impl<T> ApiEnvelope<T> {
    pub fn ok(request_id: String, data: T) -> Self {
        Self {
            meta: ApiMeta::ok(),
            request_id,
            data,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeTaskRequest {
    pub worker_id: String,
    pub provisioner_id: String,
    pub tenant_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishTaskRequest {
    pub worker_id: String,
    pub provisioner_id: String,
    pub tenant_id: String,
    pub task_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub status: i32,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub ip_addresses: BTreeMap<String, String>,
}

impl FinishTaskRequest {
    pub fn outcome(&self) -> TaskResult {
        TaskResult {
            status: self.status,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            result: self.result.clone(),
            ip_addresses: self.ip_addresses.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishTaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub job_active: bool,
}

impl From<FinishReport> for FinishTaskResponse {
    fn from(report: FinishReport) -> Self {
        Self {
            task_id: report.task_id,
            status: report.status,
            job_active: report.job_active,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AbortJobRequest {
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobActionResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub current_stage: usize,
    pub message: String,
}
