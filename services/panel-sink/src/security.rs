//! Transport security selection for the Kafka streaming client.
//!
//! The selector looks at which credential material is configured and picks one
//! of three profiles. The result is computed once at startup and applied to
//! every consumer the stream runtime creates.

use crate::config::KafkaConfig;
use crate::error::SinkError;
use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Security profile the streaming client runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProfile {
    /// No authentication, no TLS
    Plain,
    /// SASL/PLAIN authentication over plaintext
    SaslPlaintext,
    /// SASL/PLAIN authentication over TLS
    SaslSsl,
}

impl SecurityProfile {
    /// Value for librdkafka's `security.protocol`
    pub fn protocol(&self) -> &'static str {
        match self {
            SecurityProfile::Plain => "plaintext",
            SecurityProfile::SaslPlaintext => "sasl_plaintext",
            SecurityProfile::SaslSsl => "sasl_ssl",
        }
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaslMechanism {
    #[default]
    Plain,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
        }
    }
}

/// What a worker does with a record whose value cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeserializationPolicy {
    /// The failure is fatal to the consuming worker
    #[default]
    FailFast,
    /// The record is logged and skipped
    LogAndContinue,
}

/// SASL/PLAIN login
#[derive(Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Trusted CA material for the TLS connection
#[derive(Clone, PartialEq, Eq)]
pub struct Truststore {
    /// Absolute truststore location
    pub location: PathBuf,
    /// Password as configured, possibly absent
    pub password: Option<String>,
}

impl fmt::Debug for Truststore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Truststore")
            .field("location", &self.location)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Fully populated security settings for the streaming client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSecurity {
    pub profile: SecurityProfile,
    pub sasl_mechanism: SaslMechanism,
    pub credentials: Option<SaslCredentials>,
    pub truststore: Option<Truststore>,
    pub deserialization_policy: DeserializationPolicy,
}

impl StreamSecurity {
    /// Select the security settings for the configured credential material.
    ///
    /// Starts from SASL_PLAINTEXT with the PLAIN mechanism and the configured
    /// deserialization policy (fail-fast unless overridden). Without a
    /// username/password pair the client runs plaintext. A truststore path
    /// escalates to SASL_SSL; if the path cannot be resolved the error is
    /// logged and the earlier profile stands.
    pub fn select(config: &KafkaConfig) -> Self {
        let mut security = Self {
            profile: SecurityProfile::SaslPlaintext,
            sasl_mechanism: SaslMechanism::Plain,
            credentials: None,
            truststore: None,
            deserialization_policy: config.deserialization_policy,
        };

        match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                security.credentials = Some(SaslCredentials {
                    username: username.clone(),
                    password: password.clone(),
                });
            }
            _ => security.profile = SecurityProfile::Plain,
        }

        if let Some(ref truststore_path) = config.truststore_path {
            match resolve_truststore(truststore_path) {
                Ok(location) => {
                    info!(location = %location.display(), "Configured truststore location");
                    security.profile = SecurityProfile::SaslSsl;
                    security.truststore = Some(Truststore {
                        location,
                        password: config.truststore_password.clone(),
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to set truststore location");
                }
            }
        }

        info!(
            profile = ?security.profile,
            authenticated = security.credentials.is_some(),
            "Selected Kafka security profile"
        );

        security
    }

    /// Write the security settings into a librdkafka client configuration
    pub fn apply(&self, client_config: &mut ClientConfig) {
        client_config.set("security.protocol", self.profile.protocol());

        if self.profile != SecurityProfile::Plain {
            client_config.set("sasl.mechanism", self.sasl_mechanism.as_str());
        }

        if let Some(ref credentials) = self.credentials {
            client_config
                .set("sasl.username", &credentials.username)
                .set("sasl.password", &credentials.password);
        }

        // librdkafka reads PEM CA material and has no truststore password
        if let Some(ref truststore) = self.truststore {
            client_config.set("ssl.ca.location", truststore.location.to_string_lossy());
        }
    }
}

/// Resolve a configured truststore path to an absolute path
fn resolve_truststore(path: &str) -> Result<PathBuf, SinkError> {
    std::path::absolute(Path::new(path)).map_err(|e| SinkError::Truststore {
        path: PathBuf::from(path),
        reason: e.to_string(),
    })
}
