//! HTTP surface (feature `execution-server`): the worker take/finish protocol
//! and the job operator endpoints.

pub mod api_errors;
pub mod api_handlers;
pub mod api_models;

pub use api_errors::ApiError;
pub use api_handlers::{build_router, TaskApiState};
pub use api_models::{
    AbortJobRequest, ApiEnvelope, ApiMeta, FinishTaskRequest, FinishTaskResponse,
    JobActionResponse, TakeTaskRequest,
};
