use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::Profile;

impl Profile {
    /// Load a device profile from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading profile");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read profile: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse profile: {}", path.display()))
    }

    /// Parse a device profile from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let profile: Profile =
            serde_yaml::from_str(yaml).context("failed to parse YAML profile")?;

        profile.validate()?;

        Ok(profile)
    }

    /// Validate the profile structure.
    ///
    /// Only the document shape is checked here; policy bodies are checked
    /// when they are compiled, so errors can name the offending policy.
    pub fn validate(&self) -> Result<()> {
        if self.device.name.trim().is_empty() {
            anyhow::bail!("device-info must define a device name");
        }

        if self.device.mac.trim().is_empty() {
            anyhow::bail!("device-info must define a mac-address");
        }

        if self.individual_policies.is_empty() && self.interaction_policies.is_empty() {
            anyhow::bail!("profile must define individual-policies or interaction-policies");
        }

        // Top-level names become nftables chain names, so they share one namespace
        let mut names = HashSet::new();
        let sections = [
            ("individual-policies", &self.individual_policies),
            ("interaction-policies", &self.interaction_policies),
        ];
        for (section, policies) in sections {
            for (key, body) in policies {
                let name = key.as_str().ok_or_else(|| {
                    anyhow::anyhow!("{} contains a non-string policy name: {:?}", section, key)
                })?;
                if !body.is_mapping() {
                    anyhow::bail!("policy '{}' in {} must be a mapping", name, section);
                }
                if !names.insert(name) {
                    anyhow::bail!("duplicate policy name: {}", name);
                }
            }
        }

        info!(
            device = %self.device.name,
            individual = self.individual_policies.len(),
            interaction = self.interaction_policies.len(),
            "profile validated successfully"
        );
        Ok(())
    }
}
