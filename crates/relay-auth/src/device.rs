//! Mobile device and browser extension records
//!
//! Both sides of a pairing exist independently before they are paired.

use chrono::{DateTime, Utc};
use relay_core::{DeviceId, Error, ExtensionId, Result};
use serde::{Deserialize, Serialize};

/// Longest accepted display name
const MAX_NAME_LEN: usize = 128;

/// Mobile platform hint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// iOS device (iPhone, iPad)
    Ios,
    /// Android device
    Android,
    /// Unknown/other platform
    #[default]
    Unknown,
}

/// A registered mobile authenticator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileDevice {
    pub id: DeviceId,
    /// Human-readable device name (e.g., "Pixel 8", "SM-955F")
    pub name: String,
    pub platform: Platform,
    /// Push token used when the device has no live connection (may be empty)
    pub push_token: String,
    /// Public key the device declared at registration, if any
    pub public_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MobileDevice {
    /// Create a new device, validating its name
    pub fn new(name: &str, platform: Platform, push_token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: DeviceId::new(),
            name: validate_name(name)?,
            platform,
            push_token: push_token.into(),
            public_key: None,
            created_at: Utc::now(),
        })
    }

    /// Declare the device's public key
    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }
}

/// A registered browser extension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserExtension {
    pub id: ExtensionId,
    pub name: String,
    pub browser_name: String,
    pub browser_version: String,
    /// Base64 DER public key of the extension
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

impl BrowserExtension {
    pub fn new(
        name: &str,
        browser_name: impl Into<String>,
        browser_version: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            id: ExtensionId::new(),
            name: validate_name(name)?,
            browser_name: browser_name.into(),
            browser_version: browser_version.into(),
            public_key: public_key.into(),
            created_at: Utc::now(),
        })
    }
}

/// Trim a display name and reject blank or oversized ones
pub fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("name must not be blank".into()));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_creation() {
        let device = MobileDevice::new(" john doe", Platform::Android, "").unwrap();
        assert_eq!(device.name, "john doe");
        assert_eq!(device.platform, Platform::Android);
        assert!(device.push_token.is_empty());
        assert!(device.public_key.is_none());
    }

    #[test]
    fn test_blank_names_rejected() {
        for name in ["", " ", "   "] {
            assert!(matches!(
                MobileDevice::new(name, Platform::Ios, "fcm"),
                Err(Error::Validation(_))
            ));
        }
        assert!(MobileDevice::new("john`s android", Platform::Android, "fcm").is_ok());
    }

    #[test]
    fn test_oversized_name_rejected() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(BrowserExtension::new(&long, "firefox", "120", "key").is_err());
    }
}
