//! Plugin manifest and repository JSON shapes, spec.md §6.

use serde::{Deserialize, Serialize};

/// `source.checksum` is always `sha256:<hex>`; parsed eagerly so a
/// malformed checksum fails at manifest-load time, not mid-install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSource {
    pub url: String,
    pub checksum: String,
}

impl ArtifactSource {
    /// The hex digest portion of `sha256:<hex>`.
    pub fn sha256_hex(&self) -> Option<&str> {
        self.checksum.strip_prefix("sha256:")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One installable version of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginVersion {
    pub version: String,
    pub source: ArtifactSource,
    pub execution: ExecutionSpec,
}

/// A plugin's full manifest: identity plus every installable version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin_id: String,
    pub versions: Vec<PluginVersion>,
}

impl PluginManifest {
    pub fn version(&self, version: &str) -> Option<&PluginVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// `{name, plugins: [manifest]}` repository document fetched from a
/// configured repository URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryDocument {
    pub name: String,
    pub plugins: Vec<PluginManifest>,
}

/// Expand `<port>`, `<biz_name>`, `<name>`, `<instance_dir>` tokens in an
/// entrypoint argument template.
pub fn expand_args(
    args: &[String],
    port: u16,
    biz_name: &str,
    display_name: &str,
    instance_dir: &str,
) -> Vec<String> {
    args.iter()
        .map(|a| {
            a.replace("<port>", &port.to_string())
                .replace("<biz_name>", biz_name)
                .replace("<name>", display_name)
                .replace("<instance_dir>", instance_dir)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_strips_prefix() {
        let source = ArtifactSource {
            url: "https://example.test/a.zip".to_string(),
            checksum: "sha256:abcd".to_string(),
        };
        assert_eq!(source.sha256_hex(), Some("abcd"));
    }

    #[test]
    fn expand_args_replaces_every_token() {
        let args = vec!["--port=<port>".to_string(), "--biz=<biz_name>".to_string()];
        let expanded = expand_args(&args, 9000, "bizA", "My Plugin", "/plugins/x/1");
        assert_eq!(expanded, vec!["--port=9000".to_string(), "--biz=bizA".to_string()]);
    }
}
