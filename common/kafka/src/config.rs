use std::fmt;
use std::str::FromStr;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

/// Connection settings shared by every consumer the service creates.
#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BOOTSTRAP_SERVERS", default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(from = "KAFKA_SECURITY_PROTOCOL", default = "PLAINTEXT")]
    pub kafka_security_protocol: SecurityProtocol,

    // Only sent when the protocol is one of the SASL variants
    #[envconfig(from = "KAFKA_SASL_MECHANISM", default = "PLAIN")]
    pub kafka_sasl_mechanism: String,

    #[envconfig(from = "KAFKA_SASL_USERNAME", default = "$ConnectionString")]
    pub kafka_sasl_username: String,

    #[envconfig(from = "KAFKA_SASL_PASSWORD", default = "")]
    pub kafka_sasl_password: String,

    #[envconfig(from = "KAFKA_REQUEST_TIMEOUT_MS", default = "60000")]
    pub kafka_request_timeout_ms: u32,

    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "60000")]
    pub kafka_session_timeout_ms: u32,
}

impl KafkaConfig {
    /// Client settings common to group consumers and partition scanners.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("security.protocol", self.kafka_security_protocol.as_str())
            .set("socket.timeout.ms", self.kafka_request_timeout_ms.to_string());

        if self.kafka_security_protocol.is_sasl() {
            client_config
                .set("sasl.mechanism", &self.kafka_sasl_mechanism)
                .set("sasl.username", &self.kafka_sasl_username)
                .set("sasl.password", &self.kafka_sasl_password);
        }

        client_config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProtocol {
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    pub fn is_sasl(&self) -> bool {
        matches!(
            self,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        )
    }
}

impl FromStr for SecurityProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "ssl" => Ok(SecurityProtocol::Ssl),
            "sasl_plaintext" => Ok(SecurityProtocol::SaslPlaintext),
            "sasl_ssl" => Ok(SecurityProtocol::SaslSsl),
            _ => Err(format!(
                "unknown security protocol {s}, must be one of PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL"
            )),
        }
    }
}

impl fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single group consumer reads, and as which group.
///
/// Built by the service for each ingested topic rather than read from the
/// environment, as one process runs several of them.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topic: String,
    // Where a group without committed offsets starts: earliest or latest
    pub offset_reset: String,
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            offset_reset: "latest".to_string(),
        }
    }

    pub fn with_offset_reset(mut self, offset_reset: impl Into<String>) -> Self {
        self.offset_reset = offset_reset.into();
        self
    }
}
