//! Raw configuration document as read from JSON, validated but not decrypted

use super::{expand_home, ConfigError};
use crate::crypto::{
    decrypt_field, EncryptedField, KeySourceConfig, MasterKey, DEFAULT_KEY_TIMEOUT, MASTER_KEY_ENV,
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Default Proxmox API port
pub const DEFAULT_PORT: u16 = 8006;

/// Default Proxmox service type
pub const DEFAULT_SERVICE: &str = "PVE";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// The API token secret as stored in the document
#[derive(Debug, Clone)]
pub enum TokenValue {
    /// Stored in the clear
    Plaintext(SecretString),
    /// Stored as an encrypted envelope
    Encrypted(EncryptedField),
}

impl TokenValue {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, TokenValue::Encrypted(_))
    }

    /// Recover the secret, decrypting with `key` when needed
    pub fn reveal(&self, key: Option<&MasterKey>) -> Result<SecretString, ConfigError> {
        match self {
            TokenValue::Plaintext(token) => Ok(token.clone()),
            TokenValue::Encrypted(field) => {
                let key = key.ok_or_else(|| {
                    ConfigError::Key(crate::crypto::KeyError::Unavailable(
                        "token_value is encrypted but no master key was supplied".to_string(),
                    ))
                })?;
                decrypt_field(field, key).map_err(|source| ConfigError::Decryption {
                    field: "token_value".to_string(),
                    source,
                })
            }
        }
    }

    fn to_json(&self) -> Result<Value, ConfigError> {
        match self {
            TokenValue::Plaintext(token) => Ok(Value::String(token.expose_secret().to_string())),
            TokenValue::Encrypted(field) => {
                serde_json::to_value(field).map_err(|e| ConfigError::ParseError(e.to_string()))
            }
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {:?}, expected \"pretty\" or \"json\"", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level as written in the document
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Optional log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// A parsed and schema-checked configuration document.
///
/// Keeps the original JSON object so rewrites (encryption, rotation) change
/// only the token and preserve every other field and its order.
#[derive(Debug, Clone)]
pub struct RawConfigDocument {
    host: String,
    port: u16,
    service: String,
    user: String,
    token_name: String,
    token_value: TokenValue,
    verify_ssl: bool,
    logging: LoggingConfig,
    key_sources: Option<KeySourceConfig>,
    raw: Map<String, Value>,
}

impl RawConfigDocument {
    /// Parse and validate a document
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let Value::Object(raw) = value else {
            return Err(ConfigError::schema("<root>", "expected a JSON object"));
        };

        Self::from_map(raw)
    }

    /// Parse and validate a document from raw bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let content = std::str::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("not UTF-8: {}", e)))?;
        Self::parse(content)
    }

    fn from_map(raw: Map<String, Value>) -> Result<Self, ConfigError> {
        let host = required_str(&raw, "host")?;
        let port = optional_port(&raw, "port")?.unwrap_or(DEFAULT_PORT);
        let service = optional_str(&raw, "service")?.unwrap_or_else(|| DEFAULT_SERVICE.to_string());

        let user = required_str(&raw, "user")?;
        match user.split_once('@') {
            Some((name, realm)) if !name.is_empty() && !realm.is_empty() => {}
            _ => return Err(ConfigError::schema("user", "must have the form name@realm")),
        }

        let token_name = required_str(&raw, "token_name")?;
        let token_value = parse_token_value(raw.get("token_value"))?;
        let verify_ssl = required_bool(&raw, "verify_ssl")?;
        let logging = parse_logging(&raw)?;
        let key_sources = parse_key_sources(raw.get("master_key"))?;

        Ok(Self {
            host,
            port,
            service,
            user,
            token_name,
            token_value,
            verify_ssl,
            logging,
            key_sources,
            raw,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn token_name(&self) -> &str {
        &self.token_name
    }

    pub fn token_value(&self) -> &TokenValue {
        &self.token_value
    }

    pub fn verify_ssl(&self) -> bool {
        self.verify_ssl
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    /// Key sources declared in the document's `master_key` section
    pub fn key_sources(&self) -> Option<&KeySourceConfig> {
        self.key_sources.as_ref()
    }

    /// Fields holding encrypted envelopes, by name
    pub fn encrypted_fields(&self) -> Vec<(&'static str, &EncryptedField)> {
        match &self.token_value {
            TokenValue::Encrypted(envelope) => vec![("token_value", envelope)],
            TokenValue::Plaintext(_) => Vec::new(),
        }
    }

    /// Same document with the named secret field replaced by `envelope`
    pub fn with_encrypted_field(self, field: &str, envelope: EncryptedField) -> Result<Self, ConfigError> {
        match field {
            "token_value" => self.with_token_value(TokenValue::Encrypted(envelope)),
            other => Err(ConfigError::schema(other, "is not a secret field")),
        }
    }

    /// Same document with a different token value
    pub fn with_token_value(mut self, token_value: TokenValue) -> Result<Self, ConfigError> {
        self.raw.insert("token_value".to_string(), token_value.to_json()?);
        self.token_value = token_value;
        Ok(self)
    }

    /// Whether every field other than the token matches `other`
    pub fn same_settings_as(&self, other: &RawConfigDocument) -> bool {
        let strip = |raw: &Map<String, Value>| {
            let mut raw = raw.clone();
            raw.remove("token_value");
            raw
        };
        strip(&self.raw) == strip(&other.raw)
    }

    /// Serialize for writing back to disk
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        let mut json = serde_json::to_string_pretty(&self.raw)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        json.push('\n');
        Ok(json)
    }
}

fn parse_token_value(value: Option<&Value>) -> Result<TokenValue, ConfigError> {
    match value {
        None | Some(Value::Null) => Err(ConfigError::schema("token_value", "is required")),
        Some(Value::String(token)) if token.trim().is_empty() => {
            Err(ConfigError::schema("token_value", "must not be empty"))
        }
        Some(Value::String(token)) => Ok(TokenValue::Plaintext(SecretString::from(token.clone()))),
        Some(envelope) if EncryptedField::is_envelope(envelope) => {
            serde_json::from_value(envelope.clone())
                .map(TokenValue::Encrypted)
                .map_err(|_| ConfigError::schema("token_value", "malformed encrypted envelope"))
        }
        Some(_) => Err(ConfigError::schema(
            "token_value",
            "must be a string or an encrypted envelope with \"enc\": true",
        )),
    }
}

fn parse_logging(raw: &Map<String, Value>) -> Result<LoggingConfig, ConfigError> {
    let level = match optional_str(raw, "log_level")? {
        Some(level) if LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) => level,
        Some(_) => {
            return Err(ConfigError::schema(
                "log_level",
                "must be one of trace, debug, info, warn, error",
            ))
        }
        None => "info".to_string(),
    };

    let format = match optional_str(raw, "log_format")? {
        None => LogFormat::Pretty,
        Some(format) => format
            .parse()
            .map_err(|_| ConfigError::schema("log_format", "must be \"pretty\" or \"json\""))?,
    };

    let file = optional_str(raw, "log_file")?.map(|p| expand_home(&p));

    Ok(LoggingConfig { level, format, file })
}

fn parse_key_sources(value: Option<&Value>) -> Result<Option<KeySourceConfig>, ConfigError> {
    let section = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(section)) => section,
        Some(_) => return Err(ConfigError::schema("master_key", "must be an object")),
    };

    // absent means the default source, explicit null disables it
    let env_var = match section.get("env") {
        None => Some(MASTER_KEY_ENV.to_string()),
        Some(Value::Null) => None,
        Some(Value::String(name)) if !name.trim().is_empty() => Some(name.clone()),
        Some(_) => return Err(ConfigError::schema("master_key.env", "must be a variable name or null")),
    };

    let key_file = match section.get("file") {
        None => Some(KeySourceConfig::default_key_file()),
        Some(Value::Null) => None,
        Some(Value::String(path)) if !path.trim().is_empty() => Some(expand_home(path)),
        Some(_) => return Err(ConfigError::schema("master_key.file", "must be a path or null")),
    };

    let interactive = match section.get("interactive") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => return Err(ConfigError::schema("master_key.interactive", "must be a boolean")),
    };

    let timeout = match section.get("timeout_secs") {
        None | Some(Value::Null) => DEFAULT_KEY_TIMEOUT,
        Some(value) => match value.as_u64() {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                return Err(ConfigError::schema(
                    "master_key.timeout_secs",
                    "must be a positive integer",
                ))
            }
        },
    };

    Ok(Some(KeySourceConfig {
        env_var,
        key_file,
        interactive,
        timeout,
    }))
}

fn required_str(raw: &Map<String, Value>, field: &str) -> Result<String, ConfigError> {
    optional_str(raw, field)?.ok_or_else(|| ConfigError::schema(field, "is required"))
}

fn optional_str(raw: &Map<String, Value>, field: &str) -> Result<Option<String>, ConfigError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ConfigError::schema(field, "must not be empty"))
        }
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ConfigError::schema(field, "must be a string")),
    }
}

fn required_bool(raw: &Map<String, Value>, field: &str) -> Result<bool, ConfigError> {
    match raw.get(field) {
        None | Some(Value::Null) => Err(ConfigError::schema(field, "is required")),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(ConfigError::schema(field, "must be a boolean")),
    }
}

fn optional_port(raw: &Map<String, Value>, field: &str) -> Result<Option<u16>, ConfigError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .filter(|p| (1..=u64::from(u16::MAX)).contains(p))
            .map(|p| Some(p as u16))
            .ok_or_else(|| ConfigError::schema(field, "must be an integer between 1 and 65535")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_field;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "host": "pve.example.com",
            "user": "root@pam",
            "token_name": "mcp",
            "token_value": "aaaa-bbbb",
            "verify_ssl": true
        })
    }

    fn parse(value: Value) -> Result<RawConfigDocument, ConfigError> {
        RawConfigDocument::parse(&value.to_string())
    }

    fn schema_field(result: Result<RawConfigDocument, ConfigError>) -> String {
        match result {
            Err(ConfigError::SchemaValidation { field, .. }) => field,
            other => panic!("expected schema error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_parse_minimal_document() {
        let doc = parse(base()).unwrap();

        assert_eq!(doc.host(), "pve.example.com");
        assert_eq!(doc.port(), DEFAULT_PORT);
        assert_eq!(doc.service(), DEFAULT_SERVICE);
        assert_eq!(doc.user(), "root@pam");
        assert_eq!(doc.token_name(), "mcp");
        assert!(doc.verify_ssl());
        assert_eq!(doc.logging(), &LoggingConfig::default());
        assert!(doc.key_sources().is_none());
        assert!(doc.encrypted_fields().is_empty());
    }

    #[test]
    fn test_each_required_field_is_named() {
        for field in ["host", "user", "token_name", "token_value", "verify_ssl"] {
            let mut value = base();
            value.as_object_mut().unwrap().remove(field);
            assert_eq!(schema_field(parse(value)), field);
        }
    }

    #[test]
    fn test_wrong_types_are_rejected() {
        let mut value = base();
        value["verify_ssl"] = json!("false");
        assert_eq!(schema_field(parse(value)), "verify_ssl");

        let mut value = base();
        value["host"] = json!(42);
        assert_eq!(schema_field(parse(value)), "host");

        let mut value = base();
        value["port"] = json!(70000);
        assert_eq!(schema_field(parse(value)), "port");

        let mut value = base();
        value["log_level"] = json!("verbose");
        assert_eq!(schema_field(parse(value)), "log_level");
    }

    #[test]
    fn test_user_needs_realm() {
        let mut value = base();
        value["user"] = json!("root");
        assert_eq!(schema_field(parse(value)), "user");
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut value = base();
        value["token_value"] = json!("   ");
        assert_eq!(schema_field(parse(value)), "token_value");
    }

    #[test]
    fn test_object_without_enc_tag_is_not_an_envelope() {
        let mut value = base();
        value["token_value"] = json!({ "enc": false, "ciphertext": "abc" });
        assert_eq!(schema_field(parse(value)), "token_value");
    }

    #[test]
    fn test_incomplete_envelope_is_a_schema_error() {
        let mut value = base();
        value["token_value"] = json!({ "enc": true, "alg": "AES-256-GCM/HKDF-SHA256" });
        assert_eq!(schema_field(parse(value)), "token_value");
    }

    #[test]
    fn test_envelope_detected_by_tag() {
        let key = MasterKey::generate();
        let field = encrypt_field("secret", &key).unwrap();
        let mut value = base();
        value["token_value"] = serde_json::to_value(&field).unwrap();

        let doc = parse(value).unwrap();
        assert!(doc.token_value().is_encrypted());
        let names: Vec<_> = doc.encrypted_fields().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["token_value"]);
        assert_eq!(
            doc.token_value().reveal(Some(&key)).unwrap().expose_secret(),
            "secret"
        );
    }

    #[test]
    fn test_encrypted_token_without_key_is_key_error() {
        let key = MasterKey::generate();
        let token = TokenValue::Encrypted(encrypt_field("secret", &key).unwrap());

        assert!(matches!(token.reveal(None), Err(ConfigError::Key(_))));
    }

    #[test]
    fn test_verify_ssl_false_preserved() {
        let mut value = base();
        value["verify_ssl"] = json!(false);
        assert!(!parse(value).unwrap().verify_ssl());
    }

    #[test]
    fn test_logging_fields() {
        let mut value = base();
        value["log_level"] = json!("DEBUG");
        value["log_format"] = json!("json");
        value["log_file"] = json!("/var/log/proxmox-mcp.log");

        let doc = parse(value).unwrap();
        assert_eq!(doc.logging().level, "DEBUG");
        assert_eq!(doc.logging().format, LogFormat::Json);
        assert_eq!(
            doc.logging().file.as_deref(),
            Some(std::path::Path::new("/var/log/proxmox-mcp.log"))
        );
    }

    #[test]
    fn test_master_key_section() {
        let mut value = base();
        value["master_key"] = json!({
            "env": null,
            "file": "/etc/proxmox-mcp/key",
            "interactive": true,
            "timeout_secs": 2
        });

        let doc = parse(value).unwrap();
        let sources = doc.key_sources().unwrap();
        assert_eq!(sources.env_var, None);
        assert_eq!(sources.key_file, Some(PathBuf::from("/etc/proxmox-mcp/key")));
        assert!(sources.interactive);
        assert_eq!(sources.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_master_key_section_rejects_zero_timeout() {
        let mut value = base();
        value["master_key"] = json!({ "timeout_secs": 0 });
        assert_eq!(schema_field(parse(value)), "master_key.timeout_secs");
    }

    #[test]
    fn test_rewrite_preserves_other_fields_and_order() {
        let content = r#"{
  "verify_ssl": false,
  "host": "10.0.0.5",
  "custom_note": {"owner": "ops"},
  "user": "mcp@pve",
  "token_name": "t",
  "token_value": "plain"
}"#;
        let doc = RawConfigDocument::parse(content).unwrap();
        let key = MasterKey::generate();
        let rewritten = doc
            .clone()
            .with_token_value(TokenValue::Encrypted(encrypt_field("plain", &key).unwrap()))
            .unwrap();

        assert!(rewritten.same_settings_as(&doc));

        let json = rewritten.to_json_pretty().unwrap();
        let keys: Vec<String> = serde_json::from_str::<Map<String, Value>>(&json)
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(
            keys,
            vec!["verify_ssl", "host", "custom_note", "user", "token_name", "token_value"]
        );
        assert!(!json.contains("\"plain\""));
    }

    #[test]
    fn test_non_object_root_rejected() {
        assert_eq!(schema_field(RawConfigDocument::parse("[1, 2]")), "<root>");
        assert!(matches!(
            RawConfigDocument::parse("{not json"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
