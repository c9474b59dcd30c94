//! Foreign credential file
//!
//! Another tool on the machine may already hold an OAuth login in a JSON file
//! keyed by provider: `{ "<provider>": { "type": "oauth", "refresh", "access",
//! "expires" } }`. The file belongs to that tool; this module only reads it.

use std::collections::HashMap;
use std::path::Path;

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// A single provider entry from the foreign credential file.
///
/// `expires` is a unix timestamp in milliseconds (absolute, not a delta).
#[derive(Debug, Clone, Deserialize)]
pub struct ForeignCredential {
    #[serde(rename = "type")]
    pub credential_type: String,
    pub refresh: Secret<String>,
    #[serde(default)]
    pub access: Option<Secret<String>>,
    #[serde(default)]
    pub expires: Option<u64>,
}

/// Read the OAuth entry for `provider_key`.
///
/// Returns `Ok(None)` when the file is absent, the key is missing, or the entry
/// is not OAuth-typed (API-key entries are ignored).
pub async fn read_foreign_credential(
    path: &Path,
    provider_key: &str,
) -> Result<Option<ForeignCredential>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no foreign credential file");
            return Ok(None);
        }
        Err(e) => return Err(Error::Io(format!("reading foreign credential file: {e}"))),
    };

    // Other providers may use other shapes, so only the wanted key is typed.
    let mut entries: HashMap<String, serde_json::Value> = serde_json::from_str(&contents)
        .map_err(|e| Error::CredentialParse(format!("parsing foreign credential file: {e}")))?;
    let Some(entry) = entries.remove(provider_key) else {
        return Ok(None);
    };

    let credential: ForeignCredential = serde_json::from_value(entry)
        .map_err(|e| Error::CredentialParse(format!("parsing {provider_key} entry: {e}")))?;
    if credential.credential_type != "oauth" {
        debug!(
            provider_key,
            credential_type = %credential.credential_type,
            "skipping non-oauth credential"
        );
        return Ok(None);
    }
    Ok(Some(credential))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("auth.json");
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn reads_oauth_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{
                "anthropic": {"type": "api", "key": "sk-ant"},
                "openai": {
                    "type": "oauth",
                    "refresh": "rt_1",
                    "access": "at_1",
                    "expires": 1735500000000
                }
            }"#,
        )
        .await;

        let cred = read_foreign_credential(&path, "openai")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cred.refresh.expose(), "rt_1");
        assert_eq!(cred.access.as_ref().unwrap().expose(), "at_1");
        assert_eq!(cred.expires, Some(1735500000000));
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_foreign_credential(&dir.path().join("nope.json"), "openai")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn non_oauth_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"openai": {"type": "api", "refresh": "x"}}"#).await;
        assert!(
            read_foreign_credential(&path, "openai")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"other": {"type": "oauth", "refresh": "x"}}"#).await;
        assert!(
            read_foreign_credential(&path, "openai")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "not json {{").await;
        let err = read_foreign_credential(&path, "openai").await.unwrap_err();
        assert!(matches!(err, Error::CredentialParse(_)));
    }
}
