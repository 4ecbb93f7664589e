/**
 * CONFIGURATION - Paramètres injectés du service d'ingestion
 *
 * SOURCES (par priorité croissante) :
 * - valeurs par défaut (broker local, topics iot/temperature et iot/smoke)
 * - fichier YAML : chemin CLI, sinon $SMOKEWATCH_CONFIG, sinon ./smokewatch.yaml
 * - variables d'environnement pour les secrets (jamais dans le fichier)
 *
 * SECRETS :
 * - SMOKEWATCH_MQTT_PASSWORD : mot de passe broker
 * - SMOKEWATCH_WEBHOOK_TOKEN : jeton Bearer du transport webhook
 * - SMOKEWATCH_API_KEY       : clé x-api-key de l'API de lecture
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::macros::format_description;
use time::UtcOffset;
use tokio::fs;
use tracing::warn;

pub const CONFIG_ENV: &str = "SMOKEWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "smokewatch.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("invalid timezone offset '{0}' (expected +HH:MM, -HH:MM or UTC)")]
    Timezone(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Fuseau de référence des timestamps d'ingestion (offset fixe)
    pub timezone: String,
    pub mqtt: MqttConf,
    pub topics: TopicsConf,
    pub store: StoreConf,
    pub alerts: AlertsConf,
    pub notifier: NotifierConf,
    pub reconnect: ReconnectConf,
    pub ingest: IngestConf,
    pub http: HttpConf,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TopicsConf {
    pub temperature: String,
    pub smoke: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConf {
    Memory,
    JsonLines { path: PathBuf },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AlertsConf {
    pub recipients: Vec<String>,
    pub threshold: f64,
    /// Intervalle minimum entre deux alertes par destinataire (absent = aucun)
    pub cooldown_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NotifierConf {
    pub transport: TransportConf,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConf {
    Log,
    Webhook {
        url: String,
        #[serde(skip)]
        token: Option<String>,
    },
    Mqtt { topic: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConf {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    /// Absent = réessais infinis
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct IngestConf {
    /// Délai max de traitement d'un message (absent = pas de limite)
    pub message_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timezone: "+08:00".into(),
            mqtt: MqttConf::default(),
            topics: TopicsConf::default(),
            store: StoreConf::default(),
            alerts: AlertsConf::default(),
            notifier: NotifierConf::default(),
            reconnect: ReconnectConf::default(),
            ingest: IngestConf::default(),
            http: HttpConf::default(),
            api_key: None,
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "smokewatch-kernel".into(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            username: None,
            password: None,
        }
    }
}

impl Default for TopicsConf {
    fn default() -> Self {
        Self {
            temperature: "iot/temperature".into(),
            smoke: "iot/smoke".into(),
        }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        StoreConf::JsonLines { path: PathBuf::from("./data/readings.jsonl") }
    }
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self { recipients: Vec::new(), threshold: 0.0, cooldown_secs: None }
    }
}

impl Default for NotifierConf {
    fn default() -> Self {
        Self { transport: TransportConf::Log, max_attempts: 3, retry_delay_ms: 2000 }
    }
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self { initial_delay_ms: 1000, max_delay_ms: 60_000, multiplier: 2, max_retries: None }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl MqttConf {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl TopicsConf {
    pub fn list(&self) -> Vec<String> {
        vec![self.temperature.clone(), self.smoke.clone()]
    }
}

impl AlertsConf {
    pub fn cooldown(&self) -> Option<time::Duration> {
        self.cooldown_secs
            .filter(|secs| *secs > 0)
            .map(|secs| time::Duration::seconds(secs as i64))
    }
}

impl NotifierConf {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl IngestConf {
    pub fn message_timeout(&self) -> Option<Duration> {
        self.message_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

impl AppConfig {
    /// Parse un document YAML ; un document vide donne la config par défaut
    pub fn from_yaml(txt: &str, path: &Path) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Injecte les secrets depuis l'environnement
    pub fn apply_env_overrides(&mut self) {
        if let Some(password) = non_empty_env("SMOKEWATCH_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let TransportConf::Webhook { token, .. } = &mut self.notifier.transport {
            *token = non_empty_env("SMOKEWATCH_WEBHOOK_TOKEN");
        }
        self.api_key = non_empty_env("SMOKEWATCH_API_KEY");
    }

    pub fn reference_offset(&self) -> Result<UtcOffset, ConfigError> {
        parse_offset(&self.timezone)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reference_offset()?;

        let temperature = self.topics.temperature.trim();
        let smoke = self.topics.smoke.trim();
        if temperature.is_empty() || smoke.is_empty() {
            return Err(ConfigError::Invalid("topic names must not be empty".into()));
        }
        if temperature == smoke {
            return Err(ConfigError::Invalid("temperature and smoke topics must differ".into()));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.host must not be empty".into()));
        }
        if self.reconnect.initial_delay_ms == 0 || self.reconnect.multiplier == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms and reconnect.multiplier must be > 0".into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms must be >= reconnect.initial_delay_ms".into(),
            ));
        }
        if self.notifier.max_attempts == 0 {
            return Err(ConfigError::Invalid("notifier.max_attempts must be >= 1".into()));
        }
        if let TransportConf::Webhook { url, .. } = &self.notifier.transport {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!("notifier webhook url '{url}' is not http(s)")));
            }
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// "+08:00", "-03:30", "UTC" ou "Z"
pub fn parse_offset(txt: &str) -> Result<UtcOffset, ConfigError> {
    let txt = txt.trim();
    if txt.eq_ignore_ascii_case("utc") || txt == "Z" {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(txt, format_description!("[offset_hour sign:mandatory]:[offset_minute]"))
        .map_err(|_| ConfigError::Timezone(txt.to_string()))
}

/// Charge la config ; fichier absent = config par défaut (avec avertissement)
pub async fn load_config(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut cfg = if path.exists() {
        let txt = fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        AppConfig::from_yaml(&txt, &path)?
    } else {
        warn!(path = %path.display(), "no config file, using defaults");
        AppConfig::default()
    };

    cfg.apply_env_overrides();
    Ok(cfg)
}
