//! REST collaborator: resolves where to connect and how many shards to run

use crate::codec::CodecConfig;
use crate::error::Error;
use std::future::Future;
use url::Url;

/// Connection parameters returned by the gateway discovery endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    /// Base gateway URL; any query string is replaced before connecting
    pub url: String,
    /// Recommended shard count
    pub shards: Option<u32>,
    /// Identify concurrency allowed per 5 second window
    pub max_concurrency: Option<u32>,
}

/// Trait that users implement to resolve the gateway URL.
///
/// The manager calls this once per `start()`. Implementations usually wrap the
/// REST client's "get gateway" call; `prefer_auto_sharding` asks for the bot
/// variant that also returns a shard recommendation.
///
/// # Example
///
/// ```ignore
/// struct RestGateway { client: MyRestClient }
///
/// impl GatewayResolver for RestGateway {
///     async fn resolve_gateway(&self, prefer_auto_sharding: bool) -> Result<GatewayInfo, Error> {
///         let body = self.client.get_gateway_bot().await?;
///         Ok(GatewayInfo { url: body.url, shards: Some(body.shards), max_concurrency: Some(body.max_concurrency) })
///     }
/// }
/// ```
pub trait GatewayResolver: Send + Sync + 'static {
    fn resolve_gateway(
        &self,
        prefer_auto_sharding: bool,
    ) -> impl Future<Output = Result<GatewayInfo, Error>> + Send;
}

/// Resolver returning fixed parameters, for tests and self-hosted gateways
#[derive(Debug, Clone)]
pub struct StaticGateway {
    info: GatewayInfo,
}

impl StaticGateway {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            info: GatewayInfo {
                url: url.into(),
                shards: None,
                max_concurrency: None,
            },
        }
    }

    pub fn with_shards(mut self, shards: u32) -> Self {
        self.info.shards = Some(shards);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.info.max_concurrency = Some(max_concurrency);
        self
    }
}

impl GatewayResolver for StaticGateway {
    async fn resolve_gateway(&self, _prefer_auto_sharding: bool) -> Result<GatewayInfo, Error> {
        Ok(self.info.clone())
    }
}

/// Build the connect URL: strip any query, then append version, encoding and compression
pub fn gateway_url(base: &str, version: u8, codec: CodecConfig) -> Result<String, Error> {
    let mut url = Url::parse(base).map_err(|e| Error::Gateway(format!("Invalid gateway URL '{}': {}", base, e)))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Error::Gateway(format!(
                "Unsupported gateway scheme '{}'",
                other
            )))
        }
    }

    url.set_query(None);
    url.set_fragment(None);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("v", &version.to_string());
        query.append_pair("encoding", codec.encoding.as_str());
        if let Some(compress) = codec.compression.as_query() {
            query.append_pair("compress", compress);
        }
    }
    Ok(url.to_string())
}
