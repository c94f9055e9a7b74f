// crates/chl-tools/src/bin/chl-cmp.rs
//! Comparateur CHL : dit si deux images sont équivalentes et où elles diffèrent.
//!
//! Exemples :
//!   chl-cmp old.chl new.chl
//!   chl-cmp old.chl new.chl --mode loose --script villager_main
//!   chl-cmp old.chl new.chl --mode strict --json report.json
//!
//! Code de sortie : 0 si équivalentes, 1 si elles diffèrent, 2 en cas d’erreur.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::info;
use yansi::{Color, Paint};

use chl_tools::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "chl-cmp", version, about = "Comparaison structurelle d’images CHL")]
struct Cli {
    /// Première image
    first: PathBuf,

    /// Seconde image
    second: PathBuf,

    /// Niveau de tolérance (défaut : config, sinon normal)
    #[arg(long, value_enum)]
    mode: Option<CompareMode>,

    /// Ne compare que ces scripts (répétable)
    #[arg(long = "script", value_name = "NAME")]
    scripts: Vec<String>,

    /// Nombre de différences au-delà duquel on s’arrête
    #[arg(long)]
    max_mismatches: Option<usize>,

    /// Écrit le rapport JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Fichier de config explicite (sinon `.chltools.toml` ascendant)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trace chaque paire d’instructions (avec -vvv)
    #[arg(long, action = ArgAction::SetTrue)]
    trace: bool,

    /// Couleurs
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Verbosité (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// N’affiche que le verdict
    #[arg(short, long, action = ArgAction::SetTrue, conflicts_with = "verbose")]
    quiet: bool,

    /// Affiche la durée
    #[arg(long, action = ArgAction::SetTrue)]
    time: bool,
}

fn main() -> ExitCode {
    match real_main() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("{} {e:#}", "❌".paint(Color::Red));
            ExitCode::from(2)
        }
    }
}

fn real_main() -> Result<bool> {
    color_eyre::install().ok();
    let cli = Cli::parse();
    setup_colors(cli.color);
    init_tracing(cli.verbose, cli.quiet);
    info!("{}", version_banner("chl-cmp"));

    let config_path = cli.config.clone().map(to_utf8).transpose()?;
    let cfg = load_config(config_path.as_deref())?;
    let mut opts = cfg.compare_options();
    if let Some(mode) = cli.mode {
        opts.mode = mode;
    }
    if let Some(max) = cli.max_mismatches {
        opts.max_mismatches = max;
    }
    if !cli.scripts.is_empty() {
        opts.scripts = Some(cli.scripts.iter().cloned().collect::<BTreeSet<_>>());
    }
    opts.trace = cli.trace;

    let t0 = Timer::start();
    let (first, second) = (to_utf8(cli.first)?, to_utf8(cli.second)?);
    let a = load_image(&first)?;
    let b = load_image(&second)?;
    let result = compare(&a, &b, &opts);

    if !cli.quiet {
        print_report(&result);
    }
    let verdict = if result.equal { result.summary.as_str().paint(Color::Green) } else { result.summary.as_str().paint(Color::Red) };
    println!("{verdict}");

    if let Some(path) = cli.json {
        let path = to_utf8(path)?;
        write_text(&path, &serde_json::to_string_pretty(&result)?)?;
        eprintln!("🧾 Rapport JSON → {path}");
    }
    if cli.time {
        eprintln!("⏱️  {}", t0.pretty());
    }
    Ok(result.equal)
}

fn print_report(result: &Comparison) {
    for f in &result.report {
        let color = match f.severity {
            Severity::Mismatch => Color::Yellow,
            Severity::Corrupt => Color::Red,
            Severity::Note => Color::Cyan,
        };
        println!("{}", f.to_string().paint(color));
    }
}
