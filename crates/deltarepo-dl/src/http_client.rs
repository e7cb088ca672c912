//! The process-wide HTTP agent used for every mirror request.

use std::{
    sync::{LazyLock, RwLock},
    time::Duration,
};

use ureq::{http::HeaderMap, typestate::WithoutBody, Agent, Proxy, RequestBuilder};

pub const DEFAULT_USER_AGENT: &str = concat!("deltarepo/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub user_agent: Option<String>,
    /// Sent with every request.
    pub headers: Option<HeaderMap>,
    pub proxy: Option<Proxy>,
    /// Limit for a whole request, body included.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: Some(DEFAULT_USER_AGENT.into()),
            headers: None,
            proxy: None,
            timeout: None,
        }
    }
}

impl ClientConfig {
    /// Builds an HTTP `Agent` from this configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use deltarepo_dl::http_client::ClientConfig;
    ///
    /// let agent = ClientConfig::default().build();
    /// let _req = agent.get("http://example.com/repodata/repomd.xml");
    /// ```
    pub fn build(&self) -> Agent {
        let mut builder = Agent::config_builder()
            .proxy(self.proxy.clone())
            .timeout_global(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent);
        }
        builder.build().into()
    }
}

struct Client {
    config: ClientConfig,
    agent: Agent,
}

impl Client {
    fn new(config: ClientConfig) -> Self {
        Self {
            agent: config.build(),
            config,
        }
    }
}

static CLIENT: LazyLock<RwLock<Client>> =
    LazyLock::new(|| RwLock::new(Client::new(ClientConfig::default())));

/// A GET request on the shared agent with the configured headers set.
pub fn get(url: &str) -> RequestBuilder<WithoutBody> {
    let client = CLIENT.read().unwrap();
    with_headers(client.agent.get(url), client.config.headers.as_ref())
}

fn with_headers<B>(mut req: RequestBuilder<B>, headers: Option<&HeaderMap>) -> RequestBuilder<B> {
    for (key, value) in headers.into_iter().flatten() {
        req = req.header(key, value);
    }
    req
}

/// Returns a copy of the active configuration.
pub fn client_config() -> ClientConfig {
    CLIENT.read().unwrap().config.clone()
}

/// Updates the shared HTTP client configuration and rebuilds the agent.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use deltarepo_dl::http_client::configure_http_client;
///
/// configure_http_client(|cfg| {
///     cfg.timeout = Some(Duration::from_secs(60));
/// });
/// ```
pub fn configure_http_client<F>(update: F)
where
    F: FnOnce(&mut ClientConfig),
{
    let mut client = CLIENT.write().unwrap();
    let mut config = client.config.clone();
    update(&mut config);
    *client = Client::new(config);
}
