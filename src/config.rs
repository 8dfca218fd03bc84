use url::Url;

use crate::error::CallError;
use crate::media::SyntheticMedia;

pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1:8000";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host[:port]` of the relay, without scheme.
    pub relay_host: String,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    pub ice_servers: Vec<String>,
    pub media: SyntheticMedia,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_host: DEFAULT_RELAY_HOST.to_owned(),
            secure: false,
            ice_servers: vec![DEFAULT_STUN_URL.to_owned()],
            media: SyntheticMedia::default(),
        }
    }
}

impl ClientConfig {
    /// Reads `KODA_*` variables, after loading `.env` if one exists.
    pub fn from_env() -> Result<Self, CallError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CallError> {
        let mut config = Self::default();

        if let Some(host) = lookup("KODA_RELAY_HOST").filter(|h| !h.trim().is_empty()) {
            config.relay_host = host.trim().to_owned();
        }
        if let Some(secure) = lookup("KODA_RELAY_SECURE") {
            config.secure = parse_flag("KODA_RELAY_SECURE", &secure)?;
        }
        if let Some(urls) = lookup("KODA_STUN_URLS") {
            config.ice_servers = split_list(&urls).map(str::to_owned).collect();
        }
        if let Some(kinds) = lookup("KODA_CALL_MEDIA") {
            let mut media = SyntheticMedia { audio: false, video: false };
            for kind in split_list(&kinds) {
                match kind {
                    "audio" => media.audio = true,
                    "video" => media.video = true,
                    other => return Err(CallError::Config(format!("KODA_CALL_MEDIA: unknown kind {other:?}"))),
                }
            }
            config.media = media;
        }
        Ok(config)
    }

    /// `ws[s]://{relay_host}/ws/call/{identity}/`
    pub fn relay_url(&self, identity: &str) -> Result<Url, CallError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}/ws/call/", self.relay_host))
            .map_err(|err| CallError::Config(format!("relay host {:?}: {err}", self.relay_host)))?;
        url.path_segments_mut()
            .map_err(|()| CallError::Config(format!("relay host {:?} cannot carry a path", self.relay_host)))?
            .pop_if_empty()
            .push(identity)
            .push("");
        Ok(url)
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, CallError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(CallError::Config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}
