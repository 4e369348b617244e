pub mod envelope;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::agent::{Agent, DEFAULT_INTERVAL_MS};
use crate::types::FingerprintRecord;

pub use self::envelope::{Action, AgentResponse, HubRequest, ResponsePayload};

/// How long a single handler may run. Derived from the transport idle
/// timeout: a handler that outlives it would be talking to a dead peer.
pub const HANDLER_DEADLINE: Duration = Duration::from_secs(60);

/// Everything a handler may touch. Each transport session owns one context;
/// `hub_verified` starts true for SSH (public-key auth already proved
/// identity) and false for WebSocket until the fingerprint handshake lands.
pub struct HandlerContext {
    pub agent: Arc<Agent>,
    pub hub_verified: Arc<AtomicBool>,
}

impl HandlerContext {
    pub fn new(agent: Arc<Agent>, verified: bool) -> Self {
        Self {
            agent,
            hub_verified: Arc::new(AtomicBool::new(verified)),
        }
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn action(&self) -> Action;
    async fn handle(&self, ctx: &HandlerContext, request: &HubRequest)
        -> Result<ResponsePayload>;
}

/// Maps action codes to handlers. Built once per transport; the handshake
/// action is only registered for the WebSocket side.
pub struct HandlerRegistry {
    handlers: HashMap<u16, Box<dyn RequestHandler>>,
}

impl HandlerRegistry {
    /// `with_handshake` registers `CheckFingerprint`; SSH omits it because
    /// key auth already proves the hub's identity.
    pub fn new(with_handshake: bool) -> Self {
        let mut handlers: HashMap<u16, Box<dyn RequestHandler>> = HashMap::new();
        let all: Vec<Box<dyn RequestHandler>> = vec![
            Box::new(GetData),
            Box::new(ContainerLogs),
            Box::new(ContainerInfo),
            Box::new(GetSmartData),
            Box::new(GetSystemdInfo),
        ];
        for handler in all {
            handlers.insert(handler.action().code(), handler);
        }
        if with_handshake {
            let handler: Box<dyn RequestHandler> = Box::new(CheckFingerprint);
            handlers.insert(handler.action().code(), handler);
        }
        Self { handlers }
    }

    /// Dispatch one request under the handler deadline. Always produces a
    /// response that echoes the request id; every failure mode lands in the
    /// envelope's error string.
    pub async fn dispatch(&self, ctx: &HandlerContext, request: HubRequest) -> AgentResponse {
        let id = request.id;
        let Some(handler) = self.handlers.get(&request.action) else {
            return AgentResponse::failure(id, format!("unknown action {}", request.action));
        };

        // The WebSocket session must complete the fingerprint handshake
        // before anything else is served.
        if handler.action() != Action::CheckFingerprint
            && !ctx.hub_verified.load(Ordering::Acquire)
        {
            return AgentResponse::failure(id, "hub not verified");
        }

        debug!(action = ?handler.action(), id, "Dispatching request");
        match tokio::time::timeout(HANDLER_DEADLINE, handler.handle(ctx, &request)).await {
            Ok(Ok(payload)) => AgentResponse::success(id, payload),
            Ok(Err(e)) => AgentResponse::failure(id, e),
            Err(_) => AgentResponse::failure(id, "handler deadline exceeded"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

struct GetData;

#[async_trait]
impl RequestHandler for GetData {
    fn action(&self) -> Action {
        Action::GetData
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        request: &HubRequest,
    ) -> Result<ResponsePayload> {
        let interval_ms = match &request.data {
            Some(data) => {
                envelope::decode::<envelope::StatsOptions>(data)
                    .map(|o| o.interval_ms)
                    .unwrap_or(DEFAULT_INTERVAL_MS)
            }
            None => DEFAULT_INTERVAL_MS,
        };
        let snapshot = ctx.agent.gather_stats(interval_ms).await;
        Ok(ResponsePayload::SystemData(Box::new(snapshot)))
    }
}

struct CheckFingerprint;

#[async_trait]
impl RequestHandler for CheckFingerprint {
    fn action(&self) -> Action {
        Action::CheckFingerprint
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        request: &HubRequest,
    ) -> Result<ResponsePayload> {
        let data = request
            .data
            .as_deref()
            .ok_or_else(|| anyhow!("missing fingerprint challenge"))?;
        let challenge: envelope::FingerprintChallenge = envelope::decode(data)?;

        let expected = ctx
            .agent
            .config()
            .token
            .as_deref()
            .ok_or_else(|| anyhow!("no token configured"))?;
        if challenge.token != expected {
            bail!("invalid token");
        }

        ctx.hub_verified.store(true, Ordering::Release);
        Ok(ResponsePayload::Fingerprint(FingerprintRecord {
            fingerprint: ctx.agent.fingerprint().to_string(),
            hostname: sysinfo::System::host_name().unwrap_or_default(),
            port: ctx.agent.config().listen_port(),
        }))
    }
}

struct ContainerLogs;

#[async_trait]
impl RequestHandler for ContainerLogs {
    fn action(&self) -> Action {
        Action::GetContainerLogs
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        request: &HubRequest,
    ) -> Result<ResponsePayload> {
        let req: envelope::ContainerRequest = decode_required(request)?;
        let manager = ctx
            .agent
            .containers()
            .ok_or_else(|| anyhow!("container engine unavailable"))?;
        let logs = manager.container_logs(&req.container_id).await?;
        Ok(ResponsePayload::Text(logs))
    }
}

struct ContainerInfo;

#[async_trait]
impl RequestHandler for ContainerInfo {
    fn action(&self) -> Action {
        Action::GetContainerInfo
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        request: &HubRequest,
    ) -> Result<ResponsePayload> {
        let req: envelope::ContainerRequest = decode_required(request)?;
        let manager = ctx
            .agent
            .containers()
            .ok_or_else(|| anyhow!("container engine unavailable"))?;
        let info = manager.inspect(&req.container_id).await?;
        Ok(ResponsePayload::Text(info))
    }
}

struct GetSmartData;

#[async_trait]
impl RequestHandler for GetSmartData {
    fn action(&self) -> Action {
        Action::GetSmartData
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        _request: &HubRequest,
    ) -> Result<ResponsePayload> {
        let smart = ctx
            .agent
            .smart()
            .ok_or_else(|| anyhow!("smart monitoring unavailable"))?;
        Ok(ResponsePayload::SmartData(smart.data().await))
    }
}

struct GetSystemdInfo;

#[async_trait]
impl RequestHandler for GetSystemdInfo {
    fn action(&self) -> Action {
        Action::GetSystemdInfo
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        request: &HubRequest,
    ) -> Result<ResponsePayload> {
        let req: envelope::ServiceRequest = decode_required(request)?;
        let systemd = ctx
            .agent
            .systemd()
            .ok_or_else(|| anyhow!("service manager unavailable"))?;
        let detail = systemd.service_detail(&req.service_name).await?;
        Ok(ResponsePayload::ServiceInfo(detail))
    }
}

fn decode_required<T: for<'de> serde::Deserialize<'de>>(request: &HubRequest) -> Result<T> {
    let data = request
        .data
        .as_deref()
        .ok_or_else(|| anyhow!("missing request payload"))?;
    envelope::decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{base_config, AgentConfig};
    use tokio_util::sync::CancellationToken;

    async fn test_context(verified: bool, token: Option<&str>) -> HandlerContext {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: Some(dir.path().to_string_lossy().into_owned()),
            skip_gpu: true,
            token: token.map(str::to_string),
            ..base_config()
        };
        std::mem::forget(dir);
        let agent = Arc::new(Agent::new(config, CancellationToken::new()).await.unwrap());
        HandlerContext::new(agent, verified)
    }

    // -----------------------------------------------------------------------
    // dispatch
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unknown_action_errors_and_echoes_id() {
        let ctx = test_context(true, None).await;
        let registry = HandlerRegistry::new(false);
        let response = registry
            .dispatch(
                &ctx,
                HubRequest {
                    action: 999,
                    id: Some(77),
                    data: None,
                },
            )
            .await;
        assert_eq!(response.id, Some(77));
        assert!(response.error.as_deref().unwrap().contains("999"));
    }

    #[tokio::test]
    async fn get_data_returns_snapshot() {
        let ctx = test_context(true, None).await;
        let registry = HandlerRegistry::new(false);
        let response = registry
            .dispatch(
                &ctx,
                HubRequest {
                    action: Action::GetData.code(),
                    id: Some(1),
                    data: Some(
                        envelope::encode(&envelope::StatsOptions { interval_ms: 1000 }).unwrap(),
                    ),
                },
            )
            .await;
        assert!(response.error.is_none(), "{:?}", response.error);
        assert_eq!(response.id, Some(1));
        assert!(response.system_data.unwrap().stats.mem_total > 0);
    }

    #[tokio::test]
    async fn unverified_ws_session_is_rejected() {
        let ctx = test_context(false, Some("secret")).await;
        let registry = HandlerRegistry::new(true);
        let response = registry
            .dispatch(
                &ctx,
                HubRequest {
                    action: Action::GetData.code(),
                    id: Some(5),
                    data: None,
                },
            )
            .await;
        assert_eq!(response.error.as_deref(), Some("hub not verified"));
    }

    #[tokio::test]
    async fn handshake_verifies_and_unlocks() {
        let ctx = test_context(false, Some("secret")).await;
        let registry = HandlerRegistry::new(true);

        let challenge =
            envelope::encode(&envelope::FingerprintChallenge { token: "secret".into() }).unwrap();
        let response = registry
            .dispatch(
                &ctx,
                HubRequest {
                    action: Action::CheckFingerprint.code(),
                    id: Some(1),
                    data: Some(challenge),
                },
            )
            .await;
        assert!(response.error.is_none(), "{:?}", response.error);
        let fp = response.fingerprint.unwrap();
        assert_eq!(fp.fingerprint.len(), 48);
        assert_eq!(fp.port, "45876");

        // Subsequent requests now pass the verification gate.
        let response = registry
            .dispatch(
                &ctx,
                HubRequest {
                    action: Action::GetData.code(),
                    id: Some(2),
                    data: None,
                },
            )
            .await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn handshake_rejects_bad_token() {
        let ctx = test_context(false, Some("secret")).await;
        let registry = HandlerRegistry::new(true);
        let challenge =
            envelope::encode(&envelope::FingerprintChallenge { token: "wrong".into() }).unwrap();
        let response = registry
            .dispatch(
                &ctx,
                HubRequest {
                    action: Action::CheckFingerprint.code(),
                    id: None,
                    data: Some(challenge),
                },
            )
            .await;
        assert_eq!(response.error.as_deref(), Some("invalid token"));
        assert!(!ctx.hub_verified.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn ssh_registry_has_no_handshake_action() {
        let ctx = test_context(true, Some("secret")).await;
        let registry = HandlerRegistry::new(false);
        let response = registry
            .dispatch(
                &ctx,
                HubRequest {
                    action: Action::CheckFingerprint.code(),
                    id: Some(4),
                    data: None,
                },
            )
            .await;
        assert!(response.error.as_deref().unwrap().contains("unknown action"));
    }

    #[tokio::test]
    async fn missing_payload_is_an_envelope_error() {
        let ctx = test_context(true, None).await;
        let registry = HandlerRegistry::new(false);
        let response = registry
            .dispatch(
                &ctx,
                HubRequest {
                    action: Action::GetSystemdInfo.code(),
                    id: Some(6),
                    data: None,
                },
            )
            .await;
        assert!(response.error.is_some());
        assert_eq!(response.id, Some(6));
    }
}
