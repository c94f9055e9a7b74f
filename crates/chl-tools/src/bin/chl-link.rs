// crates/chl-tools/src/bin/chl-link.rs
//! Linker CHL : fusionne plusieurs modules objets `.chlo` en une image `.chl`.
//!
//! Exemples :
//!   chl-link base.chlo npc.chlo --out game.chl --summary
//!   chl-link base.chlo npc.chlo --shared-strings --debug-metadata --verify
//!   chl-link base.chlo npc.chlo --out game.chl --emit-json game.manifest.json
//!
//! Remarques :
//! - L’ordre des entrées compte : un module ne voit que les symboles des modules précédents.
//! - Les réglages `[link]` de `.chltools.toml` servent de valeurs par défaut.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::info;
use yansi::{Color, Paint};

use chl_tools::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "chl-link", version, about = "Linker CHL (fusion de modules objets)")]
struct Cli {
    /// Modules objets, dans l’ordre du lien
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Image de sortie (défaut : premier module avec l’extension `.chl`)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Déduplique les chaînes identiques entre modules
    #[arg(long, action = ArgAction::SetTrue)]
    shared_strings: bool,

    /// Désactive la déduplication même si la config l’active
    #[arg(long, action = ArgAction::SetTrue)]
    no_shared_strings: bool,

    /// Émet propriétés de build, dossiers sources et PUSH de chaînes dans l’image
    #[arg(long, action = ArgAction::SetTrue)]
    debug_metadata: bool,

    /// Vérifie le résultat en le rechargeant (round-trip + validation)
    #[arg(long, action = ArgAction::SetTrue)]
    verify: bool,

    /// Résumé humain : modules, scripts, instructions, chaînes
    #[arg(long, action = ArgAction::SetTrue)]
    summary: bool,

    /// Écrit le manifeste JSON du lien
    #[arg(long)]
    emit_json: Option<PathBuf>,

    /// Fichier de config explicite (sinon `.chltools.toml` ascendant)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trace chaque opérande relocalisé (avec -vvv)
    #[arg(long, action = ArgAction::SetTrue)]
    trace: bool,

    /// Couleurs
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Verbosité (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// N’affiche que les erreurs
    #[arg(short, long, action = ArgAction::SetTrue, conflicts_with = "verbose")]
    quiet: bool,

    /// Affiche la durée
    #[arg(long, action = ArgAction::SetTrue)]
    time: bool,
}

fn main() -> ExitCode {
    match real_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "❌".paint(Color::Red));
            ExitCode::FAILURE
        }
    }
}

fn real_main() -> Result<()> {
    color_eyre::install().ok();
    let cli = Cli::parse();
    setup_colors(cli.color);
    init_tracing(cli.verbose, cli.quiet);
    info!("{}", version_banner("chl-link"));

    let config_path = cli.config.clone().map(to_utf8).transpose()?;
    let cfg = load_config(config_path.as_deref())?;
    let mut opts = cfg.link_options();
    if cli.shared_strings {
        opts.shared_strings = true;
    }
    if cli.no_shared_strings {
        opts.shared_strings = false;
    }
    opts.debug_metadata |= cli.debug_metadata;
    opts.trace = cli.trace;

    let inputs = cli.inputs.iter().cloned().map(to_utf8).collect::<Result<Vec<_>>>()?;
    let out = match cli.out.clone() {
        Some(p) => to_utf8(p)?,
        None => default_out_path(&inputs[0], "chl"),
    };

    let t0 = Timer::start();
    let modules = inputs.iter().map(|p| load_object(p)).collect::<Result<Vec<_>>>()?;
    let Linked { image, manifest } = link(modules, &opts)?;
    let bytes = image.to_bytes();

    if cli.verify {
        let back = chl_core::bytecode::Image::from_bytes(&bytes).context("relecture de l’image")?;
        validate_image(&back).context("image liée invalide")?;
        if back != image {
            return Err(anyhow!("round-trip différent de l’image liée"));
        }
        eprintln!("{}", "✓ verify round-trip OK".paint(Color::Green));
    }

    if cli.summary {
        print_summary(&manifest);
    }

    if let Some(path) = cli.emit_json {
        let path = to_utf8(path)?;
        write_text(&path, &serde_json::to_string_pretty(&manifest)?)?;
        eprintln!("🧾 Manifest JSON → {path}");
    }

    write_bytes(&out, &bytes)?;
    if !cli.quiet {
        eprintln!("✅ Link → {out}");
    }
    if cli.time {
        eprintln!("⏱️  {}", t0.pretty());
    }
    Ok(())
}

fn print_summary(m: &LinkManifest) {
    let saved = m.data_bytes_before.saturating_sub(m.data_bytes_after);
    eprintln!("{}", "== Link summary ==".paint(Color::Cyan).bold());
    eprintln!("• inputs: {}", m.inputs.len());
    for i in &m.inputs {
        eprintln!(
            "  - {} (base={}, scripts={}, ops={}, globals@{}, dedup={})",
            i.file, i.base_address, i.scripts, i.instructions, i.global_offset, i.dedup_hits
        );
    }
    eprintln!("• scripts: {}   ops: {}   global slots: {}", m.total_scripts, m.total_instructions, m.total_global_slots);
    eprintln!("• data: {} bytes (avant: {}, gain: {saved})", m.data_bytes_after, m.data_bytes_before);
    eprintln!("• version: {}", m.version);
    if !m.build_properties.is_empty() {
        eprintln!("• build: {}", m.build_properties.join(", "));
    }
}
