use std::env;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// One STUN/TURN endpoint handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            ..Default::default()
        }
    }
}

/// Settings shared by every session an engine creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<IceServer>,
    /// Initial offerer acquires local media when its session starts
    pub capture_on_start: bool,
    /// Initial answerer acquires local media before its first answer
    pub capture_on_answer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new(vec![DEFAULT_STUN_URL.to_string()])],
            capture_on_start: true,
            capture_on_answer: true,
        }
    }
}

impl EngineConfig {
    /// Read `WAVE_ICE_SERVERS` (comma separated urls), `WAVE_LOCALHOST_ONLY`,
    /// `WAVE_CAPTURE_ON_START` and `WAVE_CAPTURE_ON_ANSWER`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(urls) = env::var("WAVE_ICE_SERVERS") {
            config.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| IceServer::new(vec![url.to_string()]))
                .collect();
        }
        if env::var("WAVE_LOCALHOST_ONLY").is_ok() {
            config.ice_servers.clear();
        }
        if let Some(flag) = env_flag("WAVE_CAPTURE_ON_START") {
            config.capture_on_start = flag;
        }
        if let Some(flag) = env_flag("WAVE_CAPTURE_ON_ANSWER") {
            config.capture_on_answer = flag;
        }
        config
    }

    /// No STUN/TURN; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

fn env_flag(var: &str) -> Option<bool> {
    let value = env::var(var).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    ice_servers: Vec<IceServer>,
    no_ice_servers: bool,
    capture_on_start: Option<bool>,
    capture_on_answer: Option<bool>,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer::new(urls));
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username,
            credential,
        });
        self
    }

    pub fn localhost_only(mut self) -> Self {
        self.no_ice_servers = true;
        self
    }

    pub fn capture_on_start(mut self, enabled: bool) -> Self {
        self.capture_on_start = Some(enabled);
        self
    }

    pub fn capture_on_answer(mut self, enabled: bool) -> Self {
        self.capture_on_answer = Some(enabled);
        self
    }

    pub fn build(self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if self.no_ice_servers {
            config.ice_servers.clear();
        } else if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        if let Some(enabled) = self.capture_on_start {
            config.capture_on_start = enabled;
        }
        if let Some(enabled) = self.capture_on_answer {
            config.capture_on_answer = enabled;
        }
        config
    }
}
