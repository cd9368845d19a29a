//! Secret bundle shipped to the target before activation

use std::collections::BTreeMap;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};

use crate::errors::DeployError;
use crate::utils::sha256_hash;

/// Flat mapping of key file name to secret content.
///
/// Transported as a single JSON object. Names are plain file names; the
/// unpack helper on the target decides where they land.
#[derive(Clone, Default)]
pub struct SecretBundle {
    entries: BTreeMap<String, SecretString>,
}

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the packed JSON form. Every value must be a string.
    pub fn from_json(json: &str) -> Result<Self, DeployError> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| DeployError::ValidationError(format!("Invalid secrets JSON: {}", e)))?;

        let mut bundle = Self::new();
        for (name, value) in raw {
            match value {
                serde_json::Value::String(content) => bundle.insert(name, content)?,
                other => {
                    return Err(DeployError::ValidationError(format!(
                        "Secret {} must be a string, got {}",
                        name,
                        json_kind(&other)
                    )))
                }
            }
        }
        Ok(bundle)
    }

    /// Add one entry, rejecting names that would escape the key directory
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), DeployError> {
        let name = name.into();
        validate_name(&name)?;
        self.entries
            .insert(name, SecretString::from(content.into()));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names in transport order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Serialize to the packed JSON wire format. The result holds plaintext
    /// secrets; write it only to private files.
    pub fn to_json(&self) -> Result<String, DeployError> {
        let exposed: BTreeMap<&str, &str> = self
            .entries
            .iter()
            .map(|(name, content)| (name.as_str(), content.expose_secret()))
            .collect();
        Ok(serde_json::to_string(&exposed)?)
    }

    /// SHA-256 of the packed form, safe to log
    pub fn digest(&self) -> Result<String, DeployError> {
        Ok(sha256_hash(self.to_json()?.as_bytes()))
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), DeployError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains(char::is_control)
    {
        return Err(DeployError::ValidationError(format!(
            "Invalid secret name {:?}: must be a plain file name without control characters",
            name
        )));
    }
    Ok(())
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
