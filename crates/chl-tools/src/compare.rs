//! Comparaison structurelle de deux images CHL.
//!
//! Trois niveaux :
//! - `strict` : égalité champ à champ (ids, adresses, ordre, octets de données) ;
//! - `normal` : identité par nom (scripts, variables, chaînes), adresses relatives au script ;
//! - `loose`  : comme `normal`, tolère en plus `PUSH INT n; CAST FLOAT` ≡ `PUSH FLOAT n`.
//!
//! Les différences sont collectées dans un rapport ; une différence structurelle
//! (opcode/mode/type, END d’un seul côté) arrête la comparaison du script.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use chl_core::bytecode::{DataType, Image, Instruction, Opcode, Operand, Script, SymRef, VarName};

/// Niveau de tolérance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum CompareMode {
    /// Égalité binaire de chaque champ.
    Strict,
    /// Égalité par nom.
    #[default]
    Normal,
    /// `normal` + idiomes numériques équivalents.
    Loose,
}

impl CompareMode {
    /// Mode immédiatement plus tolérant.
    pub const fn looser(self) -> Option<Self> {
        match self {
            CompareMode::Strict => Some(CompareMode::Normal),
            CompareMode::Normal => Some(CompareMode::Loose),
            CompareMode::Loose => None,
        }
    }
}

impl fmt::Display for CompareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareMode::Strict => "strict",
            CompareMode::Normal => "normal",
            CompareMode::Loose => "loose",
        })
    }
}

/// Plafond par défaut de différences rapportées.
pub const DEFAULT_MAX_MISMATCHES: usize = 20;

/// Options du comparateur.
#[derive(Debug, Clone)]
pub struct CompareOptions {
    /// Niveau de tolérance.
    pub mode: CompareMode,
    /// Restreint la comparaison des scripts à ces noms.
    pub scripts: Option<BTreeSet<String>>,
    /// Au-delà, les scripts restants ne sont pas comparés.
    pub max_mismatches: usize,
    /// Trace chaque paire d’instructions comparée.
    pub trace: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self { mode: CompareMode::Normal, scripts: None, max_mismatches: DEFAULT_MAX_MISMATCHES, trace: false }
    }
}

/// Gravité d’une entrée du rapport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Les fichiers diffèrent.
    Mismatch,
    /// Un fichier est incohérent (id ou offset qui ne résout pas).
    Corrupt,
    /// Information, n’affecte pas le verdict.
    Note,
}

/// Une entrée du rapport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Gravité.
    pub severity: Severity,
    /// Script concerné, si applicable.
    pub script: Option<String>,
    /// Message avec contexte `fichier:ligne`.
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Mismatch => "mismatch",
            Severity::Corrupt => "corrupt",
            Severity::Note => "note",
        };
        match &self.script {
            Some(s) => write!(f, "{tag}: [{s}] {}", self.message),
            None => write!(f, "{tag}: {}", self.message),
        }
    }
}

/// Verdict et rapport.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    /// Vrai si aucune différence n’a été trouvée.
    pub equal: bool,
    /// Différences et notes, dans l’ordre de découverte.
    pub report: Vec<Finding>,
    /// Ligne de synthèse (mode employé, mode plus tolérant suggéré).
    pub summary: String,
}

impl Comparison {
    /// Nombre d’entrées qui affectent le verdict.
    pub fn mismatches(&self) -> usize { self.report.iter().filter(|f| f.severity != Severity::Note).count() }
}

/// Compare `a` à `b`.
pub fn compare(a: &Image, b: &Image, opts: &CompareOptions) -> Comparison {
    let mut cmp = Comparator { a, b, opts, report: Vec::new(), mismatches: 0, script: None };
    let equal = cmp.run();
    let summary = match (equal, opts.mode.looser()) {
        (true, _) => format!("files are equal ({} mode)", opts.mode),
        (false, Some(next)) => {
            format!("files differ ({} mode, {} mismatches); try --mode {next}", opts.mode, cmp.mismatches)
        }
        (false, None) => format!("files differ ({} mode, {} mismatches)", opts.mode, cmp.mismatches),
    };
    debug!(equal, mismatches = cmp.mismatches, mode = %opts.mode, "comparison done");
    Comparison { equal, report: cmp.report, summary }
}

/// Issue de la comparaison d’une paire d’instructions.
enum Step {
    /// Avance d’une instruction des deux côtés.
    Same,
    /// Différence rapportée ; la comparaison continue.
    Differ,
    /// Idiome `PUSH; CAST` reconnu côté A (`SkipA`) ou B (`SkipB`).
    SkipA,
    SkipB,
    /// Différence structurelle : fin du script.
    Stop,
}

struct Comparator<'i> {
    a: &'i Image,
    b: &'i Image,
    opts: &'i CompareOptions,
    report: Vec<Finding>,
    mismatches: usize,
    script: Option<String>,
}

impl<'i> Comparator<'i> {
    fn strict(&self) -> bool { self.opts.mode == CompareMode::Strict }

    fn push(&mut self, severity: Severity, message: String) {
        debug!(?severity, script = self.script.as_deref(), "{message}");
        if severity != Severity::Note {
            self.mismatches += 1;
        }
        self.report.push(Finding { severity, script: self.script.clone(), message });
    }

    fn mismatch(&mut self, message: String) { self.push(Severity::Mismatch, message); }

    fn corrupt(&mut self, message: String) { self.push(Severity::Corrupt, message); }

    fn note(&mut self, message: String) { self.push(Severity::Note, message); }

    fn run(&mut self) -> bool {
        if self.a.version != self.b.version {
            self.mismatch(format!("format version {} vs {}", self.a.version, self.b.version));
            return false;
        }
        let mut ok = self.globals();
        if self.a.scripts.len() != self.b.scripts.len() {
            self.mismatch(format!("script count {} vs {}", self.a.scripts.len(), self.b.scripts.len()));
            ok = false;
        }
        ok &= self.scripts();
        ok &= self.autostart();
        if self.strict() {
            ok &= self.raw_data();
        }
        ok &= self.inits();
        ok
    }

    /* ─────────────────────────── Globales ─────────────────────────── */

    fn globals(&mut self) -> bool {
        let (a, b) = (self.a, self.b);
        let (ga, gb) = (&a.globals, &b.globals);
        if self.strict() {
            if ga.len() != gb.len() {
                self.mismatch(format!("global count {} vs {}", ga.len(), gb.len()));
                return false;
            }
            let diff = ga.iter().zip(gb.iter()).enumerate().find(|(_, (x, y))| x != y);
            if let Some((i, (x, y))) = diff {
                self.mismatch(format!("global #{i}: {}[{}] vs {}[{}]", x.name, x.size, y.name, y.size));
                return false;
            }
            return true;
        }
        let missing: Vec<String> = ga.names().filter(|n| gb.find(n).is_none()).map(str::to_owned).collect();
        for name in &missing {
            self.mismatch(format!("global `{name}` missing from second file"));
        }
        missing.is_empty()
    }

    /* ─────────────────────────── Scripts ─────────────────────────── */

    fn scripts(&mut self) -> bool {
        let a = self.a;
        let mut ok = true;
        for sa in &a.scripts {
            if self.opts.scripts.as_ref().is_some_and(|only| !only.contains(&sa.name)) {
                continue;
            }
            if self.mismatches >= self.opts.max_mismatches {
                self.script = None;
                self.note(format!("stopped after {} mismatches; remaining scripts not compared", self.mismatches));
                return false;
            }
            self.script = Some(sa.name.clone());
            ok &= self.script(sa);
        }
        self.script = None;
        ok
    }

    fn script(&mut self, sa: &'i Script) -> bool {
        let b = self.b;
        let Some(sb) = b.script_by_name(&sa.name) else {
            self.mismatch("script missing from second file".to_owned());
            return false;
        };
        let mut ok = true;
        if sa.param_count != sb.param_count {
            self.mismatch(format!("parameter count {} vs {}", sa.param_count, sb.param_count));
            ok = false;
        }
        if sa.local_vars != sb.local_vars {
            self.mismatch(format!("locals [{}] vs [{}]", sa.local_vars.join(", "), sb.local_vars.join(", ")));
            ok = false;
        }
        if self.strict() {
            if sa.id != sb.id {
                self.mismatch(format!("id {} vs {}", sa.id, sb.id));
                ok = false;
            }
            if sa.global_count != sb.global_count {
                self.mismatch(format!("global boundary {} vs {}", sa.global_count, sb.global_count));
                ok = false;
            }
            if sa.address != sb.address {
                self.mismatch(format!("address {} vs {}", sa.address, sb.address));
                ok = false;
            }
        }
        if !ok {
            return false;
        }
        self.code(sa, sb)
    }

    fn code(&mut self, sa: &'i Script, sb: &'i Script) -> bool {
        let (a, b) = (self.a, self.b);
        let (mut pa, mut pb) = (sa.address as usize, sb.address as usize);
        let mut ok = true;
        loop {
            let (Some(ia), Some(ib)) = (a.code.get(pa), b.code.get(pb)) else {
                self.corrupt(format!("{}: code ends before END", self.at(sa, sb, pa, pb)));
                return false;
            };
            if self.opts.trace {
                trace!("{pa}: {ia}  |  {pb}: {ib}");
            }
            match (ia.opcode == Opcode::End, ib.opcode == Opcode::End) {
                (true, true) => return ok,
                (true, false) | (false, true) => {
                    self.mismatch(format!("{}: script ends on one side only ({ia} vs {ib})", self.at(sa, sb, pa, pb)));
                    return false;
                }
                (false, false) => {}
            }
            match self.instruction(sa, sb, pa, pb) {
                Step::Same => {}
                Step::Differ => ok = false,
                Step::SkipA => pa += 1,
                Step::SkipB => pb += 1,
                Step::Stop => return false,
            }
            pa += 1;
            pb += 1;
        }
    }

    fn at(&self, sa: &Script, sb: &Script, pa: usize, pb: usize) -> String {
        let line = |img: &Image, p: usize| img.code.get(p).map_or(0, |i| i.line);
        format!("{}:{} / {}:{}", sa.source_file, line(self.a, pa), sb.source_file, line(self.b, pb))
    }

    fn instruction(&mut self, sa: &'i Script, sb: &'i Script, pa: usize, pb: usize) -> Step {
        let (a, b) = (self.a, self.b);
        let (ia, ib) = (a.code[pa], b.code[pb]);
        let at = self.at(sa, sb, pa, pb);

        if self.opts.mode == CompareMode::Loose {
            if let Some(step) = self.numeric_idiom(pa, pb) {
                return step;
            }
        }
        if ia.opcode != ib.opcode || ia.mode != ib.mode || ia.data_type != ib.data_type {
            self.mismatch(format!("{at}: {ia} vs {ib}"));
            return Step::Stop;
        }
        if self.strict() {
            if ia.operand.bits_eq(ib.operand) {
                return Step::Same;
            }
            self.mismatch(format!("{at}: {ia} vs {ib}"));
            return Step::Differ;
        }

        let same = match (ia.operand, ib.operand) {
            (Operand::Addr(x), Operand::Addr(y)) => {
                i64::from(x) - i64::from(sa.address) == i64::from(y) - i64::from(sb.address)
            }
            (Operand::Script(x), Operand::Script(y)) => {
                match (script_name(a, x), script_name(b, y)) {
                    (Some(na), Some(nb)) => na == nb,
                    _ => return self.unresolved(&at, "script", ia, ib),
                }
            }
            (Operand::Var(x), Operand::Var(y)) => match (var_name(a, sa, x), var_name(b, sb, y)) {
                (Some(na), Some(nb)) => na == nb,
                _ => return self.unresolved(&at, "variable", ia, ib),
            },
            (Operand::Int(x), Operand::Int(y)) => x == y || self.same_string(x, y),
            (Operand::Float(x), Operand::Float(y)) if self.feeds_reference(pa, pb) => {
                let (va, vb) = (float_var(a, sa, ia), float_var(b, sb, ib));
                match (va, vb) {
                    (Some(na), Some(nb)) => na == nb,
                    _ => x.to_bits() == y.to_bits(),
                }
            }
            (Operand::Float(x), Operand::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
            (x, y) => x == y,
        };
        if same {
            Step::Same
        } else {
            self.mismatch(format!("{at}: {ia} vs {ib}"));
            Step::Differ
        }
    }

    fn unresolved(&mut self, at: &str, what: &str, ia: Instruction, ib: Instruction) -> Step {
        self.corrupt(format!("{at}: {what} operand does not resolve ({ia} vs {ib})"));
        Step::Differ
    }

    /// Deux offsets qui désignent le même texte.
    fn same_string(&self, x: i32, y: i32) -> bool {
        let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else { return false };
        match (self.a.data.string_at(x), self.b.data.string_at(y)) {
            (Some(sx), Some(sy)) => sx == sy,
            _ => false,
        }
    }

    /// Le flottant en `p` alimente une instruction en mode référence en `p + 2`.
    fn feeds_reference(&self, pa: usize, pb: usize) -> bool {
        let reference = |img: &Image, p: usize| img.code.get(p + 2).is_some_and(Instruction::is_reference);
        reference(self.a, pa) && reference(self.b, pb)
    }

    /// `PUSH INT n; CAST FLOAT` face à `PUSH FLOAT n`, dans un sens comme dans l’autre.
    fn numeric_idiom(&self, pa: usize, pb: usize) -> Option<Step> {
        let (ia, ib) = (self.a.code[pa], self.b.code[pb]);
        if ia.opcode != Opcode::Push || ib.opcode != Opcode::Push {
            return None;
        }
        let cast_to = |img: &Image, p: usize, to: DataType| {
            img.code.get(p + 1).is_some_and(|c| c.opcode == Opcode::Cast && c.data_type == to)
        };
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        match (ia.operand, ib.operand) {
            (Operand::Int(x), Operand::Float(y)) => {
                if cast_to(self.a, pa, DataType::Float) && x as f32 == y {
                    Some(Step::SkipA)
                } else if cast_to(self.b, pb, DataType::Int) && y as i32 == x {
                    Some(Step::SkipB)
                } else {
                    None
                }
            }
            (Operand::Float(x), Operand::Int(y)) => {
                if cast_to(self.b, pb, DataType::Float) && y as f32 == x {
                    Some(Step::SkipB)
                } else if cast_to(self.a, pa, DataType::Int) && x as i32 == y {
                    Some(Step::SkipA)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /* ─────────────────────────── Autostart / données / init ─────────────────────────── */

    fn autostart(&mut self) -> bool {
        if self.strict() {
            if self.a.autostart == self.b.autostart {
                return true;
            }
            self.mismatch(format!("autostart {:?} vs {:?}", self.a.autostart, self.b.autostart));
            return false;
        }
        let (a, b) = (self.a, self.b);
        let (Some(na), Some(nb)) = (autostart_names(a), autostart_names(b)) else {
            self.corrupt("autostart references an unknown script".to_owned());
            return false;
        };
        let mut ok = true;
        for name in na.difference(&nb) {
            self.mismatch(format!("autostart `{name}` missing from second file"));
            ok = false;
        }
        for name in nb.difference(&na) {
            self.mismatch(format!("autostart `{name}` missing from first file"));
            ok = false;
        }
        ok
    }

    fn raw_data(&mut self) -> bool {
        let (a, b) = (self.a, self.b);
        let (da, db) = (a.data.as_bytes(), b.data.as_bytes());
        if da == db {
            return true;
        }
        let at = da.iter().zip(db).position(|(x, y)| x != y).unwrap_or(da.len().min(db.len()));
        self.mismatch(format!("data sections differ at byte {at} ({} vs {} bytes)", da.len(), db.len()));
        false
    }

    fn inits(&mut self) -> bool {
        let (a, b) = (self.a, self.b);
        let (ia, ib) = (&a.inits, &b.inits);
        if self.strict() {
            if ia.len() != ib.len() {
                self.mismatch(format!("initializer count {} vs {}", ia.len(), ib.len()));
                return false;
            }
            if let Some((x, y)) = ia.iter().zip(ib).find(|(x, y)| x != y) {
                self.mismatch(format!("initializer {} = {} vs {} = {}", x.name, x.value, y.name, y.value));
                return false;
            }
            return true;
        }
        let mut ok = true;
        for x in ia {
            match ib.iter().find(|y| y.name == x.name) {
                None => self.note(format!("initializer `{}` missing from second file", x.name)),
                Some(y) if y.value != x.value => {
                    self.mismatch(format!("initializer `{}`: {} vs {}", x.name, x.value, y.value));
                    ok = false;
                }
                Some(_) => {}
            }
        }
        ok
    }
}

fn script_name(img: &Image, r: SymRef) -> Option<&str> {
    img.script_by_id(r.internal()?).map(|s| s.name.as_str())
}

fn var_name<'a>(img: &'a Image, script: &'a Script, r: SymRef) -> Option<VarName<'a>> {
    img.var_name(script, r.internal()?)
}

fn float_var<'a>(img: &'a Image, script: &'a Script, ins: Instruction) -> Option<VarName<'a>> {
    var_name(img, script, ins.float_var_id()?)
}

fn autostart_names(img: &Image) -> Option<BTreeSet<&str>> {
    img.autostart.iter().map(|r| script_name(img, *r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{link, LinkOptions};
    use chl_core::bytecode::{InitValue, ModuleBuilder};
    use pretty_assertions::assert_eq;

    fn opts(mode: CompareMode) -> CompareOptions { CompareOptions { mode, ..CompareOptions::default() } }

    fn greeting(name: &str) -> chl_core::bytecode::ObjectModule {
        let mut b = ModuleBuilder::new(name);
        b.begin_script(&format!("{}_main", &name[..1]), 0, &["n"]);
        b.push_string("hi");
        b.emit(Instruction::sys(2));
        b.emit(Instruction::end());
        b.finish()
    }

    fn linked(shared_strings: bool) -> Image {
        let opts = LinkOptions { shared_strings, ..LinkOptions::default() };
        link(vec![greeting("a.txt"), greeting("b.txt")], &opts).unwrap().image
    }

    /// `main` et `helper`, stockés dans l’ordre demandé.
    fn two_scripts(main_first: bool) -> Image {
        let mut b = ModuleBuilder::new("order.txt");
        let g = b.global("g");
        let helper = SymRef::Internal(if main_first { 2 } else { 1 });
        let emit_helper = |b: &mut ModuleBuilder| {
            b.begin_script("helper", 0, &[]);
            b.emit(Instruction::sys(1));
            b.emit(Instruction::end());
        };
        if !main_first {
            emit_helper(&mut b);
        }
        let main = b.begin_script("main", 0, &[]);
        let start = b.here();
        b.emit(Instruction::load(g));
        b.emit(Instruction::jump(Opcode::Jz, start + 3));
        b.emit(Instruction::call(helper));
        b.emit(Instruction::end());
        if main_first {
            emit_helper(&mut b);
        }
        b.autostart(main);
        b.autostart(helper);
        b.init("g", InitValue::Float(1.0));
        b.finish().image
    }

    #[test]
    fn image_equals_itself_in_every_mode() {
        let img = linked(false);
        for mode in [CompareMode::Strict, CompareMode::Normal, CompareMode::Loose] {
            let c = compare(&img, &img, &opts(mode));
            assert!(c.equal, "{mode}: {:?}", c.report);
            assert_eq!(c.report, []);
            assert_eq!(c.summary, format!("files are equal ({mode} mode)"));
        }
    }

    #[test]
    fn shared_strings_only_differ_in_strict_mode() {
        let (plain, shared) = (linked(false), linked(true));
        assert!(compare(&plain, &shared, &opts(CompareMode::Normal)).equal);

        let c = compare(&plain, &shared, &opts(CompareMode::Strict));
        assert!(!c.equal);
        assert!(c.report.iter().any(|f| f.message.starts_with("data sections differ")));
        assert!(c.summary.ends_with("try --mode normal"), "{}", c.summary);
    }

    #[test]
    fn scripts_are_matched_by_name_with_relative_addresses() {
        let (a, b) = (two_scripts(true), two_scripts(false));
        assert_ne!(a.scripts[0].address, b.scripts[1].address);

        let c = compare(&a, &b, &opts(CompareMode::Normal));
        assert!(c.equal, "{:?}", c.report);

        let c = compare(&a, &b, &opts(CompareMode::Strict));
        assert!(!c.equal);
        assert!(c.report.iter().any(|f| f.message.starts_with("autostart")));
        assert!(c.report.iter().any(|f| f.script.as_deref() == Some("main") && f.message.starts_with("id 1 vs 2")));
    }

    #[test]
    fn loose_mode_accepts_the_cast_idiom_both_ways() {
        let build = |cast: bool| {
            let mut b = ModuleBuilder::new("cast.txt");
            let g = b.global("g");
            b.begin_script("main", 0, &[]);
            if cast {
                b.emit(Instruction::push_int(5));
                b.emit(Instruction::cast(DataType::Float));
            } else {
                b.emit(Instruction::push_float(5.0));
            }
            b.emit(Instruction::store(g));
            b.emit(Instruction::end());
            b.finish().image
        };
        let (with_cast, direct) = (build(true), build(false));

        let c = compare(&with_cast, &direct, &opts(CompareMode::Normal));
        assert!(!c.equal);
        assert_eq!(c.mismatches(), 1);
        assert!(c.summary.ends_with("try --mode loose"));

        assert!(compare(&with_cast, &direct, &opts(CompareMode::Loose)).equal);
        assert!(compare(&direct, &with_cast, &opts(CompareMode::Loose)).equal);
    }

    #[test]
    fn mismatch_limit_truncates_the_script_list() {
        let build = |shift: i32| {
            let mut b = ModuleBuilder::new("many.txt");
            for i in 0..30 {
                b.begin_script(&format!("s{i}"), 0, &[]);
                b.emit(Instruction::sys(i + shift));
                b.emit(Instruction::end());
            }
            b.finish().image
        };
        let c = compare(&build(0), &build(100), &opts(CompareMode::Normal));
        assert!(!c.equal);
        assert_eq!(c.mismatches(), DEFAULT_MAX_MISMATCHES);
        assert_eq!(c.report.last().map(|f| f.severity), Some(Severity::Note));
        assert_eq!(c.report.len(), DEFAULT_MAX_MISMATCHES + 1);
    }

    #[test]
    fn script_filter_and_missing_scripts() {
        let a = two_scripts(true);
        let mut b = a.clone();
        b.scripts[1].name = "renamed".into();

        let c = compare(&a, &b, &opts(CompareMode::Normal));
        assert!(!c.equal);
        let missing = Finding {
            severity: Severity::Mismatch,
            script: Some("helper".into()),
            message: "script missing from second file".into(),
        };
        assert!(c.report.contains(&missing), "{:?}", c.report);

        let only_main = CompareOptions { scripts: Some(["main".to_owned()].into()), ..opts(CompareMode::Normal) };
        let c = compare(&a, &b, &only_main);
        // main appelle helper, désormais nommé autrement
        assert!(c.report.iter().any(|f| f.script.as_deref() == Some("main")));
        assert!(c.report.iter().all(|f| f.script.as_deref() != Some("helper")));
    }

    #[test]
    fn missing_initializer_is_only_a_note() {
        let a = two_scripts(true);
        let mut b = a.clone();
        b.inits.truncate(1);

        let c = compare(&a, &b, &opts(CompareMode::Normal));
        assert!(c.equal);
        assert_eq!(c.report.len(), 1);
        assert_eq!(c.report[0].severity, Severity::Note);

        b.inits.push(chl_core::bytecode::InitGlobal { name: "g".into(), value: InitValue::Float(2.0) });
        assert!(!compare(&a, &b, &opts(CompareMode::Normal)).equal);
        assert!(!compare(&a, &b, &opts(CompareMode::Strict)).equal);
    }

    #[test]
    fn dangling_ids_are_corrupt_and_later_scripts_are_still_compared() {
        let a = two_scripts(true);
        let mut b = a.clone();
        let (main, helper) = (b.scripts[0].address as usize, b.scripts[1].address as usize);
        b.code[main] = Instruction::load(SymRef::Internal(42));
        b.code[main + 2] = Instruction::call(SymRef::Internal(99));
        b.code[helper] = Instruction::sys(7);

        let c = compare(&a, &b, &opts(CompareMode::Normal));
        assert!(!c.equal);
        let corrupt: Vec<&str> = c
            .report
            .iter()
            .filter(|f| f.severity == Severity::Corrupt)
            .map(|f| f.script.as_deref().unwrap_or_default())
            .collect();
        assert_eq!(corrupt, ["main", "main"]);
        assert!(c.report.iter().any(|f| f.message.contains("variable operand does not resolve")));
        assert!(c.report.iter().any(|f| f.message.contains("script operand does not resolve")));
        assert!(c
            .report
            .iter()
            .any(|f| f.severity == Severity::Mismatch && f.script.as_deref() == Some("helper")));
        assert_eq!(c.mismatches(), 3);
    }

    fn globals_in_order(names: &[&str]) -> Image {
        let mut b = ModuleBuilder::new("globals.txt");
        let ids: Vec<SymRef> = names.iter().map(|n| b.global(n)).collect();
        let by_name = |wanted: &str| names.iter().position(|n| *n == wanted).map(|i| ids[i]);
        b.begin_script("main", 0, &[]);
        if let (Some(x), Some(y)) = (by_name("x"), by_name("y")) {
            b.emit(Instruction::load(x));
            b.emit(Instruction::store(y));
        }
        b.emit(Instruction::end());
        b.finish().image
    }

    #[test]
    fn global_order_only_matters_in_strict_mode() {
        let (a, b) = (globals_in_order(&["x", "y"]), globals_in_order(&["y", "x"]));
        assert!(compare(&a, &b, &opts(CompareMode::Normal)).equal);

        let c = compare(&a, &b, &opts(CompareMode::Strict));
        assert!(!c.equal);
        assert_eq!(c.report[0].message, "global #0: x[1] vs y[1]");
    }

    #[test]
    fn each_missing_global_is_a_mismatch() {
        let (a, b) = (globals_in_order(&["x", "y", "z"]), globals_in_order(&["x", "w"]));
        let c = compare(&a, &b, &opts(CompareMode::Normal));
        assert!(!c.equal);
        let globals: Vec<&str> =
            c.report.iter().filter(|f| f.message.starts_with("global `")).map(|f| f.message.as_str()).collect();
        assert_eq!(globals, ["global `y` missing from second file", "global `z` missing from second file"]);
    }
}
