//! Version information for the laundry service.

/// Crate version from Cargo.toml
pub const LAUNDRY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub laundry: &'static str,
    /// Storage backend in use, e.g. `memory` or `sqlite`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<&'static str>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            laundry: LAUNDRY_VERSION,
            store: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: &'static str) -> Self {
        self.store = Some(store);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.laundry, LAUNDRY_VERSION);
        assert!(info.store.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            laundry: "0.1.0",
            store: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "laundry": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_store() {
        let info = VersionInfo::new().with_store("sqlite");
        assert_eq!(serde_json::to_value(&info).unwrap()["store"], "sqlite");
    }
}
