use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::post};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use shroud_common::ShroudError;
use shroud_network::Driver;
use shroud_network::protocol::{
    CreateEndpointRequest, CreateNetworkRequest, DeleteEndpointRequest, DeleteNetworkRequest,
    InfoRequest, InfoResponse, JoinRequest, JoinResponse, LeaveRequest,
};
use tower_http::trace::TraceLayer;

/// Media type of plugin protocol messages.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.1+json";

type SharedDriver = Arc<Driver>;

pub fn app(driver: SharedDriver) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.DiscoverNew", post(discover))
        .route("/NetworkDriver.DiscoverDelete", post(discover))
        .layer(TraceLayer::new_for_http())
        .with_state(driver)
}

/// JSON request body, accepted whatever content type the runtime sends.
struct PluginRequest<T>(T);

impl<S, T> FromRequest<S> for PluginRequest<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| ApiError::Decode)?;
        let body: &[u8] = if body.is_empty() { b"{}" } else { &body };

        serde_json::from_slice(body).map(Self).map_err(|e| {
            tracing::debug!(error = %e, body = %String::from_utf8_lossy(body), "Error decoding request");
            ApiError::Decode
        })
    }
}

/// JSON response body with the plugin media type.
struct PluginResponse<T>(T);

impl<T: Serialize> IntoResponse for PluginResponse<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)],
                body,
            )
                .into_response(),
            Err(e) => ApiError::Driver(ShroudError::Serialization(e.to_string())).into_response(),
        }
    }
}

enum ApiError {
    Decode,
    Driver(ShroudError),
}

impl From<ShroudError> for ApiError {
    fn from(err: ShroudError) -> Self {
        Self::Driver(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Decode => (StatusCode::BAD_REQUEST, "Failed to decode request".to_string()),
            Self::Driver(err) => {
                tracing::error!(error = %err, cleanup = ?err.cleanup_notes(), "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        let body = json!({ "Err": message }).to_string();
        (status, [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)], body).into_response()
    }
}

fn empty() -> PluginResponse<Value> {
    PluginResponse(json!({}))
}

async fn activate() -> PluginResponse<Value> {
    PluginResponse(json!({ "Implements": ["NetworkDriver"] }))
}

async fn capabilities() -> PluginResponse<Value> {
    PluginResponse(json!({ "Scope": "local" }))
}

async fn create_network(
    State(driver): State<SharedDriver>,
    PluginRequest(req): PluginRequest<CreateNetworkRequest>,
) -> Result<PluginResponse<Value>, ApiError> {
    tracing::debug!(network = %req.network_id, options = ?req.options, "CreateNetwork");
    driver.create_network(&req).await?;
    Ok(empty())
}

async fn delete_network(
    State(driver): State<SharedDriver>,
    PluginRequest(req): PluginRequest<DeleteNetworkRequest>,
) -> Result<PluginResponse<Value>, ApiError> {
    tracing::debug!(network = %req.network_id, "DeleteNetwork");
    driver.delete_network(&req).await?;
    Ok(empty())
}

async fn create_endpoint(
    State(driver): State<SharedDriver>,
    PluginRequest(req): PluginRequest<CreateEndpointRequest>,
) -> Result<PluginResponse<Value>, ApiError> {
    tracing::debug!(network = %req.network_id, endpoint = %req.endpoint_id, "CreateEndpoint");
    driver.create_endpoint(&req).await?;
    Ok(empty())
}

async fn delete_endpoint(
    State(driver): State<SharedDriver>,
    PluginRequest(req): PluginRequest<DeleteEndpointRequest>,
) -> Result<PluginResponse<Value>, ApiError> {
    tracing::debug!(network = %req.network_id, endpoint = %req.endpoint_id, "DeleteEndpoint");
    driver.delete_endpoint(&req).await?;
    Ok(empty())
}

async fn endpoint_info(
    State(driver): State<SharedDriver>,
    PluginRequest(req): PluginRequest<InfoRequest>,
) -> PluginResponse<InfoResponse> {
    PluginResponse(driver.endpoint_info(&req))
}

async fn join(
    State(driver): State<SharedDriver>,
    PluginRequest(req): PluginRequest<JoinRequest>,
) -> Result<PluginResponse<JoinResponse>, ApiError> {
    tracing::debug!(network = %req.network_id, endpoint = %req.endpoint_id, "Join");
    Ok(PluginResponse(driver.join(&req).await?))
}

async fn leave(
    State(driver): State<SharedDriver>,
    PluginRequest(req): PluginRequest<LeaveRequest>,
) -> Result<PluginResponse<Value>, ApiError> {
    tracing::debug!(network = %req.network_id, endpoint = %req.endpoint_id, "Leave");
    driver.leave(&req).await?;
    Ok(empty())
}

async fn discover() -> PluginResponse<Value> {
    empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use shroud_network::testing::{MemoryLinks, MemoryPorts, MemoryRules};
    use shroud_network::{Backends, DriverConfig, PortMapper, StaticProxyResolver};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<MemoryLinks>) {
        let links = Arc::new(MemoryLinks::new());
        let ports = Arc::new(MemoryPorts::new());
        let backends = Backends {
            links: links.clone(),
            rules: Arc::new(MemoryRules::new()),
            proxy: Arc::new(StaticProxyResolver("172.17.0.2".parse().unwrap())),
            port_mappers: Arc::new(move |_: &str| Arc::clone(&ports) as Arc<dyn PortMapper>),
        };
        let config = DriverConfig::default()
            .without_ip_forward()
            .with_link_lookup(0, Duration::ZERO);

        (app(Arc::new(Driver::new(config, backends))), links)
    }

    async fn call(app: &Router, path: &str, body: &str) -> (StatusCode, Value) {
        let request = axum::http::Request::post(path)
            .header(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();

        let status = response.status();
        assert_eq!(response.headers()[header::CONTENT_TYPE], PLUGIN_CONTENT_TYPE);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn handshake() {
        let (app, _) = test_app();

        let (status, body) = call(&app, "/Plugin.Activate", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "Implements": ["NetworkDriver"] }));

        let (_, body) = call(&app, "/NetworkDriver.GetCapabilities", "{}").await;
        assert_eq!(body, json!({ "Scope": "local" }));

        let (_, body) = call(&app, "/NetworkDriver.DiscoverNew", r#"{"DiscoveryType":1}"#).await;
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn network_round_trip() {
        let (app, links) = test_app();

        let (status, body) = call(
            &app,
            "/NetworkDriver.CreateNetwork",
            r#"{"NetworkID":"abcdef123","Options":{},"IPv4Data":[{"Pool":"172.20.0.0/16","Gateway":"172.20.0.1/16"}]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
        assert!(links.get("torbr-abcde").is_some());

        let (status, _) = call(
            &app,
            "/NetworkDriver.CreateEndpoint",
            r#"{"NetworkID":"abcdef123","EndpointID":"e1f2a3b4c5","Interface":{"Address":"172.20.0.2/16"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "/NetworkDriver.Join",
            r#"{"NetworkID":"abcdef123","EndpointID":"e1f2a3b4c5","SandboxKey":"/var/run/docker/netns/1"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["InterfaceName"]["SrcName"], "ethce1f2a");
        assert_eq!(body["InterfaceName"]["DstPrefix"], "eth");
        assert_eq!(body["Gateway"], "172.20.0.1");

        let (_, body) = call(
            &app,
            "/NetworkDriver.EndpointOperInfo",
            r#"{"NetworkID":"abcdef123","EnpointID":"e1f2a3b4c5"}"#,
        )
        .await;
        assert_eq!(body, json!({ "Value": {} }));

        for path in ["/NetworkDriver.Leave", "/NetworkDriver.DeleteEndpoint"] {
            let (status, _) = call(&app, path, r#"{"NetworkID":"abcdef123","EndpointID":"e1f2a3b4c5"}"#).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _) = call(&app, "/NetworkDriver.DeleteNetwork", r#"{"NetworkID":"abcdef123"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert!(links.names().is_empty());
    }

    #[tokio::test]
    async fn undecodable_request() {
        let (app, _) = test_app();
        let (status, body) = call(&app, "/NetworkDriver.CreateNetwork", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "Err": "Failed to decode request" }));
    }

    #[tokio::test]
    async fn driver_errors_are_reported() {
        let (app, _) = test_app();
        let (status, body) = call(&app, "/NetworkDriver.DeleteNetwork", r#"{"NetworkID":"missing"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["Err"], "network missing does not exist");

        let (status, body) = call(&app, "/NetworkDriver.CreateNetwork", r#"{"NetworkID":"n1"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["Err"].as_str().unwrap().contains("gateway"));
    }
}
