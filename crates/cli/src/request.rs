use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tollgate_gatekeeper::{AppContext, AuditRequest, Decision, RequestInfo};
use tracing::debug;

/// One request read from input.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    #[serde(flatten)]
    pub info: RequestInfo,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Resource to hand out an access URL for once admitted.
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub validity_secs: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Outcome {
    #[serde(flatten)]
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Admit the request, resolve its resource if it asks for one, and audit it.
pub async fn handle(ctx: &AppContext, request: InboundRequest) -> Outcome {
    let started = Instant::now();
    let request_time = Utc::now();

    let decision = ctx.gatekeeper.check(&request.info).await;
    let mut outcome = Outcome {
        decision,
        url: None,
        error: None,
    };

    if decision.is_admitted() {
        if let Some(resource) = request.resource.as_deref() {
            let result = match request.validity_secs {
                Some(secs) => ctx.cache.resolve(resource, Duration::from_secs(secs)).await,
                None => ctx.cache.resolve_default(resource).await,
            };
            match result {
                Ok(url) => outcome.url = Some(url),
                Err(e) => {
                    debug!(resource, error = %e, "resource not resolved");
                    outcome.error = Some(e.to_string());
                }
            }
        }
    }

    let response = serde_json::to_string(&outcome).ok();
    let record = ctx.audit_policy.record(
        AuditRequest {
            trace_id: request.trace_id,
            client_ip: request.info.client_ip,
            method: request.method,
            uri: request.info.route,
            params: request.params,
        },
        response,
        request_time,
        started.elapsed(),
    );
    ctx.audit.record(record);

    outcome
}

/// Parse one input line into a request.
pub fn parse(line: &str) -> serde_json::Result<InboundRequest> {
    serde_json::from_str(line)
}
