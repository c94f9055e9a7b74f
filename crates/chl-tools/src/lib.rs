//! chl-tools : bibliothèque commune des outils CHL.
//!
//! Objectifs : mutualiser le linker, le comparateur, la config, l’I/O et le confort CLI.
//!
//! ## Modules & zones clés
//! - `link`    : `link` (fusion de modules objets en une image)
//! - `compare` : `compare` (diff structurel strict/normal/loose)
//! - `config`  : `ToolConfig`, `load_config` (`.chltools.toml`)
//! - I/O       : `read_bytes`, `write_bytes`, `write_text`, `load_object`, `load_image`
//! - Time      : `Timer`, `human_millis`
//! - Couleurs  : `ColorMode`, `setup_colors` (feature `colors`)
//! - Logs      : `init_tracing` (feature `cli`)
//!
//! Les fonctions d’I/O renvoient `anyhow::Result` ; le linker et le comparateur
//! ont leurs propres types d’erreur et de rapport.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use chl_core::bytecode::{Image, ObjectModule};

pub mod compare;
pub mod config;
pub mod link;

pub use chl_core::helpers::validate_image;
pub use compare::{compare, CompareMode, CompareOptions, Comparison, Finding, Severity};
pub use config::{load_config, ToolConfig};
pub use link::{link, LinkError, LinkManifest, LinkOptions, Linked};

/// Version lisible du crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Petite bannière de version utile pour logs/outils.
pub fn version_banner(tool: &str) -> String {
    format!("{tool} (chl-tools {VERSION}, format v{})", chl_core::CHL_VERSION)
}

/* ------------------------------------------------------------------------- */
/* Prelude                                                                   */
/* ------------------------------------------------------------------------- */

/// Prelude pratique pour les bins: re-exports compacts.
pub mod prelude {
    pub use anyhow::{anyhow, Context, Result};
    pub use camino::{Utf8Path, Utf8PathBuf};
    pub use crate::{
        compare, default_out_path, human_millis, link, load_config, load_image, load_object, read_bytes,
        setup_colors, to_utf8, validate_image, version_banner, write_bytes, write_text, ColorMode,
        CompareMode, CompareOptions, Comparison, Finding, LinkManifest, LinkOptions, Linked, Severity,
        Timer, ToolConfig,
    };
    #[cfg(feature = "cli")]
    pub use crate::init_tracing;
}

/* ------------------------------------------------------------------------- */
/* I/O utils                                                                 */
/* ------------------------------------------------------------------------- */

/// Lis un fichier binaire.
pub fn read_bytes(path: &Utf8Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("lecture {path}"))
}

/// Écrit un texte (UTF-8). Crée les dossiers au besoin.
pub fn write_text(path: &Utf8Path, s: &str) -> Result<()> { write_bytes(path, s.as_bytes()) }

/// Écrit des bytes. Crée les dossiers au besoin.
pub fn write_bytes(path: &Utf8Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("création {parent}"))?;
    }
    let mut f = fs::File::create(path).with_context(|| format!("écriture {path}"))?;
    f.write_all(bytes)?;
    Ok(())
}

/// Convertit un `PathBuf` en `Utf8PathBuf` (erreur si non UTF-8).
pub fn to_utf8(p: PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(p).map_err(|p| anyhow!("chemin non UTF-8 : {}", p.display()))
}

/// Charge un module objet (`.chlo`).
pub fn load_object(path: &Utf8Path) -> Result<ObjectModule> {
    let bytes = read_bytes(path)?;
    ObjectModule::from_bytes(&bytes).with_context(|| format!("module objet invalide : {path}"))
}

/// Charge une image liée (`.chl`).
pub fn load_image(path: &Utf8Path) -> Result<Image> {
    let bytes = read_bytes(path)?;
    Image::from_bytes(&bytes).with_context(|| format!("image invalide : {path}"))
}

/// Remplace l’extension par `ext` (sans point), ex: `chl`.
pub fn default_out_path(input: &Utf8Path, ext: &str) -> Utf8PathBuf { input.with_extension(ext) }

/* ------------------------------------------------------------------------- */
/* Time / chrono                                                             */
/* ------------------------------------------------------------------------- */

/// Chrono de scope simple; loggable ensuite.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Démarre un chrono.
    pub fn start() -> Self { Self { start: Instant::now() } }
    /// Durée écoulée.
    pub fn elapsed(&self) -> Duration { self.start.elapsed() }
    /// Format humain court.
    pub fn pretty(&self) -> String { human_millis(self.elapsed()) }
}

/// Format "humain" d'une durée.
pub fn human_millis(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1_000 {
        return format!("{ms} ms");
    }
    let s = d.as_secs_f64();
    if s < 60.0 {
        return format!("{s:.3} s");
    }
    let m = (s / 60.0).floor();
    let rest = s - m * 60.0;
    format!("{m:.0} min {rest:.1} s")
}

/* ------------------------------------------------------------------------- */
/* Couleurs                                                                  */
/* ------------------------------------------------------------------------- */

/// Contrôle l'application de couleurs ANSI dans les sorties CLI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ColorMode {
    /// Active les couleurs seulement si la sortie supporte ANSI (auto-détection).
    #[default]
    Auto,
    /// Force l'activation des couleurs.
    Always,
    /// Désactive complètement les couleurs ANSI.
    Never,
}

/// Configure le mode couleur global pour yansi (si feature `colors` active).
pub fn setup_colors(mode: ColorMode) {
    #[cfg(feature = "colors")]
    {
        match mode {
            ColorMode::Auto => yansi::whenever(yansi::Condition::DEFAULT),
            ColorMode::Always => yansi::enable(),
            ColorMode::Never => yansi::disable(),
        }
    }
    #[cfg(not(feature = "colors"))]
    {
        let _ = mode;
    }
}

/* ------------------------------------------------------------------------- */
/* Logs                                                                      */
/* ------------------------------------------------------------------------- */

/// Installe le subscriber `tracing` des bins : `RUST_LOG` prime, sinon le niveau
/// vient de `-v` (répété) ou `-q`.
#[cfg(feature = "cli")]
pub fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
