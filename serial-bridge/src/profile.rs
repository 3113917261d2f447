//! Read-only access to saved bridge profiles.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::record::Timestamp;

/// A named bridge configuration from a profiles file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub modified_at: Option<Timestamp>,
    #[serde(default)]
    pub configuration: BridgeConfig,
}

/// Parse a profiles file: a JSON array of [`Profile`].
pub fn load_profiles(path: &Path) -> BridgeResult<Vec<Profile>> {
    let contents = std::fs::read_to_string(path).map_err(|e| BridgeError::InvalidProfiles {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let profiles: Vec<Profile> =
        serde_json::from_str(&contents).map_err(|e| BridgeError::InvalidProfiles {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    debug!("Loaded {} profiles from {}", profiles.len(), path.display());
    Ok(profiles)
}

/// Select a profile by name (case-insensitive), or the default one.
///
/// Without a name, the profile flagged `isDefault` wins, then the first one.
pub fn find_profile<'a>(profiles: &'a [Profile], name: Option<&str>) -> BridgeResult<&'a Profile> {
    match name {
        Some(name) => profiles
            .iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| BridgeError::ProfileNotFound(name.to_string())),
        None => profiles
            .iter()
            .find(|profile| profile.is_default)
            .or_else(|| profiles.first())
            .ok_or_else(|| BridgeError::ProfileNotFound("default".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"[
      {
        "id": 1,
        "name": "Default",
        "description": "Default socat configuration",
        "isDefault": true,
        "isReadOnly": true,
        "createdAt": "2025-10-09T12:00:00Z",
        "modifiedAt": "2025-10-09T12:00:00Z",
        "configuration": {
          "tcpPort": 1238,
          "tcpHost": "localhost",
          "verbose": true,
          "hexDump": true,
          "blockSize": 4,
          "allowFork": true,
          "reuseAddress": true,
          "rawMode": true,
          "noEcho": true
        }
      },
      {
        "id": 2,
        "name": "Quiet",
        "configuration": { "tcpPort": 2000, "tcpHost": "0.0.0.0", "verbose": false, "hexDump": false }
      }
    ]"#;

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_profiles() {
        let file = sample_file();
        let profiles = load_profiles(file.path()).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].configuration, BridgeConfig::default());
        assert!(profiles[0].is_read_only);
        assert!(profiles[0].created_at.is_some());

        let quiet = &profiles[1];
        assert_eq!(quiet.description, "");
        assert_eq!(quiet.configuration.tcp_port, 2000);
        assert!(!quiet.configuration.verbose);
        assert!(quiet.configuration.allow_fork);
    }

    #[test]
    fn test_find_profile() {
        let file = sample_file();
        let profiles = load_profiles(file.path()).unwrap();

        assert_eq!(find_profile(&profiles, None).unwrap().id, 1);
        assert_eq!(find_profile(&profiles, Some("quiet")).unwrap().id, 2);
        assert!(matches!(
            find_profile(&profiles, Some("missing")),
            Err(BridgeError::ProfileNotFound(name)) if name == "missing"
        ));
        assert!(find_profile(&[], None).is_err());
    }

    #[test]
    fn test_invalid_profiles_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            load_profiles(file.path()),
            Err(BridgeError::InvalidProfiles { .. })
        ));
        assert!(matches!(
            load_profiles(Path::new("/nonexistent/profiles.json")),
            Err(BridgeError::InvalidProfiles { .. })
        ));
    }
}
