//! Credential record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of secret a credential holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialType {
    /// Username/password pair.
    Password,
    /// API key or token.
    ApiKey,
    /// SSH private key.
    SshKey,
    /// OAuth token.
    OauthToken,
    /// TLS certificate / private key.
    Certificate,
    /// Anything else.
    Custom,
}

impl CredentialType {
    /// Stable wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::ApiKey => "apiKey",
            Self::SshKey => "sshKey",
            Self::OauthToken => "oauthToken",
            Self::Certificate => "certificate",
            Self::Custom => "custom",
        }
    }
}

/// The stored (encrypted-at-rest) form of a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Unique credential ID.
    pub id: String,
    /// Credential type.
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    /// Optional username (not sensitive, stored in the clear).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional target URL (not sensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Field name → `base64(iv):base64(ciphertext)`.
    pub secret_fields: BTreeMap<String, String>,
    /// ID of the master key the secret fields were encrypted with.
    pub key_id: String,
    /// Optional operator notes (not sensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// The non-sensitive listing view of this record.
    #[must_use]
    pub fn metadata(&self) -> CredentialMetadata {
        CredentialMetadata {
            id: self.id.clone(),
            credential_type: self.credential_type,
            username: self.username.clone(),
            url: self.url.clone(),
            created_at: self.created_at,
        }
    }
}

/// Non-sensitive metadata returned by `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialMetadata {
    /// Unique credential ID.
    pub id: String,
    /// Credential type.
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    /// Optional username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional target URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A fully decrypted credential, as returned by `get`.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    /// Non-sensitive metadata.
    pub metadata: CredentialMetadata,
    /// Field name → plaintext.
    pub secret_fields: BTreeMap<String, String>,
    /// Optional notes.
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serde_uses_wire_names() {
        let record = CredentialRecord {
            id: "prox-1".into(),
            credential_type: CredentialType::ApiKey,
            username: Some("root@pam".into()),
            url: Some("https://pve.example:8006".into()),
            secret_fields: BTreeMap::from([("token".into(), "aXY=:Y3Q=".into())]),
            key_id: "k1".into(),
            notes: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], serde_json::json!("apiKey"));
        assert!(json.get("notes").is_none());
    }

    #[test]
    fn metadata_never_contains_secret_fields() {
        let record = CredentialRecord {
            id: "c".into(),
            credential_type: CredentialType::Password,
            username: None,
            url: None,
            secret_fields: BTreeMap::from([("password".into(), "aXY=:Y3Q=".into())]),
            key_id: "k1".into(),
            notes: Some("zabbix admin".into()),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(record.metadata()).unwrap();
        assert!(json.get("secret_fields").is_none());
        assert!(json.get("notes").is_none());
    }
}
