//! xDS transport for the debug-synchronization query.
//!
//! Opens an aggregated-discovery stream to the control plane, sends a single
//! debug-synchronization request and collects the response. Credentials are
//! short-lived service-account tokens minted through the TokenRequest API,
//! unless the endpoint is plaintext.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, PostParams};
use kube::Client;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tracing::debug;

use crate::config::XdsConfig;
use crate::labels::CONTROL_PLANE_NAMESPACE;
use crate::mesh::proxy_status::{
    control_plane_id, DiscoveryRequest, DiscoveryResponse, Node, ProxyStatusSource,
    TYPE_DEBUG_SYNCHRONIZATION,
};
use crate::Error;

/// Aggregated discovery service stream method
const ADS_METHOD: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// Lifetime of the tokens we mint for the control plane
const TOKEN_EXPIRATION_SECONDS: i64 = 60 * 60;

/// CA bundle file inside the configured certificate directory
const CA_CERT_FILE: &str = "root-cert.pem";

/// [`ProxyStatusSource`] implementation speaking xDS over gRPC
pub struct XdsProxyStatusSource {
    config: XdsConfig,
    client: Client,
}

impl XdsProxyStatusSource {
    pub fn new(config: XdsConfig, client: Client) -> Self {
        Self { config, client }
    }

    async fn connect(&self) -> Result<Channel, Error> {
        let uri = self.config.endpoint_uri();
        let mut endpoint = Channel::from_shared(uri.clone())
            .map_err(|e| Error::xds(format!("invalid xds endpoint {uri}: {e}")))?
            .connect_timeout(std::time::Duration::from_secs(5));

        if !self.config.xds_plaintext {
            let mut tls = ClientTlsConfig::new();
            if let Some(dir) = &self.config.xds_cert_dir {
                let path = dir.join(CA_CERT_FILE);
                let pem = tokio::fs::read(&path).await.map_err(|e| {
                    Error::xds(format!("reading {}: {e}", path.display()))
                })?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            } else {
                tls = tls.with_native_roots();
            }
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| Error::xds(format!("tls config: {e}")))?;
        }

        endpoint
            .connect()
            .await
            .map_err(|e| Error::xds(format!("connecting to {uri}: {e}")))
    }

    /// Mint a short-lived bearer token for the control plane
    async fn mint_token(&self) -> Result<String, Error> {
        let api: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), CONTROL_PLANE_NAMESPACE);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: vec![self.config.xds_token_audience.clone()],
                expiration_seconds: Some(TOKEN_EXPIRATION_SECONDS),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = api
            .create_token_request(
                &self.config.xds_service_account,
                &PostParams::default(),
                &request,
            )
            .await?;
        response
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::xds("token request returned no token"))
    }

    async fn exchange(&self, channel: Channel) -> Result<DiscoveryResponse, Error> {
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Error::xds(format!("channel not ready: {e}")))?;

        let discovery = DiscoveryRequest {
            node: Some(Node {
                id: format!("fortsa.{CONTROL_PLANE_NAMESPACE}"),
                metadata: None,
            }),
            type_url: TYPE_DEBUG_SYNCHRONIZATION.to_string(),
        };
        let mut request = tonic::Request::new(stream::iter([discovery]));
        if !self.config.xds_plaintext {
            let token = self.mint_token().await?;
            let header = MetadataValue::try_from(format!("Bearer {token}"))
                .map_err(|_| Error::xds("minted token is not a valid header value"))?;
            request.metadata_mut().insert("authorization", header);
        }

        let codec: ProstCodec<DiscoveryRequest, DiscoveryResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static(ADS_METHOD);
        let response = grpc
            .streaming(request, path, codec)
            .await
            .map_err(|s| Error::xds(format!("discovery request failed: {s}")))?;

        let mut inbound = response.into_inner();
        inbound
            .message()
            .await
            .map_err(|s| Error::xds(format!("discovery stream failed: {s}")))?
            .ok_or_else(|| Error::xds("discovery stream closed without a response"))
    }
}

#[async_trait]
impl ProxyStatusSource for XdsProxyStatusSource {
    async fn debug_sync(&self) -> Result<HashMap<String, DiscoveryResponse>, Error> {
        let query = async {
            let channel = self.connect().await?;
            self.exchange(channel).await
        };
        let response = tokio::time::timeout(self.config.timeout(), query)
            .await
            .map_err(|_| Error::xds("timed out waiting for debug synchronization"))??;

        let id = control_plane_id(&response);
        debug!(
            control_plane = %id,
            resources = response.resources.len(),
            "Received proxy sync snapshot"
        );
        let mut responses = HashMap::new();
        responses.insert(id, response);
        Ok(responses)
    }
}
