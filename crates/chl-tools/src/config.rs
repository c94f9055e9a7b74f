//! Configuration des outils : `.chltools.toml`.
//!
//! ```toml
//! [link]
//! shared_strings = true
//! debug_metadata = false
//!
//! [compare]
//! mode = "normal"        # strict | normal | loose
//! max_mismatches = 20
//! ```
//!
//! Les drapeaux de ligne de commande priment sur le fichier.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::Deserialize;
use tracing::debug;

use crate::compare::{CompareMode, CompareOptions, DEFAULT_MAX_MISMATCHES};
use crate::link::LinkOptions;

/// Nom du fichier cherché depuis le dossier courant vers la racine.
pub const CONFIG_FILE: &str = ".chltools.toml";

/// Contenu de `.chltools.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    /// Section `[link]`.
    pub link: LinkConfig,
    /// Section `[compare]`.
    pub compare: CompareConfig,
}

/// Section `[link]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Déduplication des chaînes.
    pub shared_strings: bool,
    /// Métadonnées de debug dans l’image.
    pub debug_metadata: bool,
}

/// Section `[compare]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompareConfig {
    /// Mode par défaut.
    pub mode: CompareMode,
    /// Plafond de différences.
    pub max_mismatches: usize,
}

impl Default for CompareConfig {
    fn default() -> Self { Self { mode: CompareMode::default(), max_mismatches: DEFAULT_MAX_MISMATCHES } }
}

impl ToolConfig {
    /// Parse un texte TOML.
    pub fn parse(text: &str) -> Result<Self> { toml::from_str(text).context("TOML invalide") }

    /// Options du linker issues de la config.
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            shared_strings: self.link.shared_strings,
            debug_metadata: self.link.debug_metadata,
            trace: false,
        }
    }

    /// Options du comparateur issues de la config.
    pub fn compare_options(&self) -> CompareOptions {
        CompareOptions {
            mode: self.compare.mode,
            max_mismatches: self.compare.max_mismatches,
            ..CompareOptions::default()
        }
    }
}

/// Charge `explicit`, sinon `.chltools.toml` (recherche ascendante depuis le
/// dossier courant), sinon `Default`.
pub fn load_config(explicit: Option<&Utf8Path>) -> Result<ToolConfig> {
    match explicit {
        Some(p) => read_config(p.as_std_path()),
        None => load_config_from(&std::env::current_dir()?),
    }
}

/// Recherche ascendante à partir de `start`.
pub fn load_config_from(start: &Path) -> Result<ToolConfig> {
    let mut cur = start.to_path_buf();
    loop {
        let cand = cur.join(CONFIG_FILE);
        if cand.is_file() {
            return read_config(&cand);
        }
        if !cur.pop() {
            break;
        }
    }
    debug!("no {CONFIG_FILE} found, using defaults");
    Ok(ToolConfig::default())
}

fn read_config(path: &Path) -> Result<ToolConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("lecture config {}", path.display()))?;
    let cfg = ToolConfig::parse(&text).with_context(|| format!("config {}", path.display()))?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sections_are_optional() -> Result<()> {
        assert_eq!(ToolConfig::parse("")?, ToolConfig::default());
        let cfg = ToolConfig::parse("[compare]\nmode = \"loose\"\n")?;
        assert_eq!(cfg.compare.mode, CompareMode::Loose);
        assert_eq!(cfg.compare.max_mismatches, DEFAULT_MAX_MISMATCHES);
        assert!(!cfg.link.shared_strings);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ToolConfig::parse("[link]\nshare = true\n").is_err());
        assert!(ToolConfig::parse("[compare]\nmode = \"fuzzy\"\n").is_err());
    }

    #[test]
    fn config_is_found_in_a_parent_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(CONFIG_FILE), "[link]\nshared_strings = true\n[compare]\nmax_mismatches = 5\n")?;
        let nested = dir.path().join("scripts").join("npc");
        fs::create_dir_all(&nested)?;

        let cfg = load_config_from(&nested)?;
        assert!(cfg.link_options().shared_strings);
        assert_eq!(cfg.compare_options().max_mismatches, 5);
        assert_eq!(cfg.compare_options().mode, CompareMode::Normal);
        Ok(())
    }
}
