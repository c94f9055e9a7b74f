//! Linker CHL : fusionne plusieurs modules objets en une seule image.
//!
//! Chaque module est fusionné dans l’ordre de la liste :
//! - section de données copiée chaîne par chaîne (marqueurs `crc32[`/`source_dirs=` interceptés,
//!   déduplication optionnelle par texte) ;
//! - variables externes résolues contre les globales **déjà fusionnées** ;
//! - globales et initialiseurs ajoutés ;
//! - scripts externes résolus contre les scripts **déjà fusionnés** ;
//! - scripts renumérotés puis instructions copiées et relocalisées
//!   (adresses, scripts, variables, offsets de chaînes, idiome `PUSH FLOAT` + référence) ;
//! - autostart relocalisé.
//!
//! Les modules sont consommés : leurs scripts et instructions appartiennent à
//! l’image produite une fois le lien commencé.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexSet;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace};

use chl_core::bytecode::{
    DataSection, GlobalVars, Image, InitGlobal, Instruction, ObjectModule, Opcode, Operand, PushRejected, Script,
    SymRef, MAX_SLOT,
};
use chl_core::CHL_VERSION;

/// Préfixe d’une propriété de build (collectée, ré-émise en debug).
pub const CRC32_MARKER: &str = "crc32[";
/// Préfixe de la liste des dossiers sources (`;`-séparés).
pub const SOURCE_DIRS_MARKER: &str = "source_dirs=";
/// Préfixe de la liste des PUSH de chaînes émise en debug.
pub const STRING_INSTRUCTIONS_MARKER: &str = "string_instructions=";

/// Options du linker.
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// Déduplique les chaînes identiques entre modules.
    pub shared_strings: bool,
    /// Émet les propriétés de build, dossiers sources et la liste des PUSH de chaînes.
    pub debug_metadata: bool,
    /// Trace chaque opérande relocalisé.
    pub trace: bool,
}

/// Échec du lien ; porte toujours l’identité du module fautif.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Variable externe introuvable parmi les globales déjà fusionnées.
    #[error("{module}: unresolved external variable `{name}`")]
    UnresolvedVariable {
        /// Module fautif.
        module: String,
        /// Nom recherché.
        name: String,
    },
    /// Indexation d’une variable qui n’est pas un tableau.
    #[error("{module}: `{name}` is not an array, cannot reference element {index}")]
    NotAnArray {
        /// Module fautif.
        module: String,
        /// Variable.
        name: String,
        /// Élément demandé.
        index: u32,
    },
    /// Élément hors des bornes du tableau.
    #[error("{module}: element {index} is out of bounds for `{name}` (size {size})")]
    ArrayBounds {
        /// Module fautif.
        module: String,
        /// Variable.
        name: String,
        /// Élément demandé.
        index: u32,
        /// Taille déclarée.
        size: u32,
    },
    /// Script externe introuvable parmi les scripts déjà fusionnés.
    #[error("{module}: unresolved external script `{name}`")]
    UnresolvedScript {
        /// Module fautif.
        module: String,
        /// Nom recherché.
        name: String,
    },
    /// Nombre de paramètres différent de la déclaration externe.
    #[error("{module}: script `{name}` takes {found} parameters, {expected} expected")]
    ParamMismatch {
        /// Module fautif.
        module: String,
        /// Script.
        name: String,
        /// Paramètres attendus par le module.
        expected: u32,
        /// Paramètres du script trouvé.
        found: u32,
    },
    /// Instruction en mode référence sans `PUSH FLOAT` deux positions avant.
    #[error("{module}: reference at {address} is not preceded by a float PUSH")]
    MalformedReference {
        /// Module fautif.
        module: String,
        /// Adresse (dans le module).
        address: u32,
    },
    /// PUSH marqué comme chaîne dont l’offset ne commence aucune chaîne.
    #[error("{module}: instruction {address} pushes offset {offset}, which starts no string")]
    UnknownString {
        /// Module fautif.
        module: String,
        /// Adresse (dans le module).
        address: u32,
        /// Offset poussé.
        offset: i32,
    },
    /// Id interne ou placeholder absent des tables du module.
    #[error("{module}: instruction {address} references undefined {what} {id}")]
    UnknownSymbol {
        /// Module fautif.
        module: String,
        /// Adresse (dans le module).
        address: u32,
        /// Nature du symbole.
        what: &'static str,
        /// Id ou placeholder.
        id: u32,
    },
    /// Script sans END.
    #[error("{module}: script `{name}` is not terminated by END")]
    UnterminatedScript {
        /// Module fautif.
        module: String,
        /// Script.
        name: String,
    },
    /// Cible de saut hors de l’image après relocalisation.
    #[error("{module}: jump at {address} targets {target}, outside the image")]
    BadJumpTarget {
        /// Module fautif.
        module: String,
        /// Adresse (dans le module).
        address: u32,
        /// Cible relocalisée.
        target: i64,
    },
    /// Les globales fusionnées dépassent l’espace des slots.
    #[error("{module}: merged global variables overflow the slot space")]
    TooManyGlobals {
        /// Module fautif.
        module: String,
    },
    /// Entrée d’autostart qui ne désigne aucun script.
    #[error("{module}: autostart references undefined {what} {id}")]
    BadAutostart {
        /// Module fautif.
        module: String,
        /// Nature du symbole.
        what: &'static str,
        /// Id ou placeholder.
        id: u32,
    },
    /// Globale définie par deux modules.
    #[error("{module}: global `{name}` is already defined by a previous module")]
    DuplicateGlobal {
        /// Module fautif.
        module: String,
        /// Variable.
        name: String,
    },
}

impl LinkError {
    /// Module à l’origine de l’échec.
    pub fn module(&self) -> &str {
        match self {
            LinkError::UnresolvedVariable { module, .. }
            | LinkError::NotAnArray { module, .. }
            | LinkError::ArrayBounds { module, .. }
            | LinkError::UnresolvedScript { module, .. }
            | LinkError::ParamMismatch { module, .. }
            | LinkError::MalformedReference { module, .. }
            | LinkError::UnknownString { module, .. }
            | LinkError::UnknownSymbol { module, .. }
            | LinkError::UnterminatedScript { module, .. }
            | LinkError::BadJumpTarget { module, .. }
            | LinkError::TooManyGlobals { module }
            | LinkError::BadAutostart { module, .. }
            | LinkError::DuplicateGlobal { module, .. } => module,
        }
    }
}

/// Statistiques par module d’entrée.
#[derive(Debug, Clone, Serialize)]
pub struct LinkInput {
    /// Identité du module.
    pub file: String,
    /// Adresse de sa première instruction dans l’image.
    pub base_address: u32,
    /// Premier id de script attribué.
    pub first_script_id: u32,
    /// Décalage de ses globales dans la table fusionnée.
    pub global_offset: u32,
    /// Scripts fusionnés.
    pub scripts: usize,
    /// Instructions copiées.
    pub instructions: usize,
    /// Chaînes réutilisées via la déduplication.
    pub dedup_hits: usize,
}

/// Manifeste du lien (utile pour logs/JSON).
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkManifest {
    /// Version de l’image émise.
    pub version: u32,
    /// Entrées dans l’ordre du lien.
    pub inputs: Vec<LinkInput>,
    /// Scripts de l’image.
    pub total_scripts: usize,
    /// Instructions de l’image.
    pub total_instructions: usize,
    /// Slots de variables globales.
    pub total_global_slots: u32,
    /// Octets de données avant fusion (toutes entrées).
    pub data_bytes_before: usize,
    /// Octets de données de l’image.
    pub data_bytes_after: usize,
    /// Propriétés de build collectées.
    pub build_properties: Vec<String>,
    /// Dossiers sources collectés.
    pub source_dirs: Vec<String>,
}

/// Résultat d’un lien réussi.
#[derive(Debug, Clone)]
pub struct Linked {
    /// Image fusionnée.
    pub image: Image,
    /// Manifeste.
    pub manifest: LinkManifest,
}

/// Lie `modules` dans l’ordre. Aucune image partielle n’est rendue en cas d’erreur.
pub fn link(modules: Vec<ObjectModule>, opts: &LinkOptions) -> Result<Linked, LinkError> {
    let total_globals = modules.iter().try_fold(0u32, |total, m| {
        total
            .checked_add(m.image.globals.slot_count())
            .filter(|&t| t <= MAX_SLOT)
            .ok_or_else(|| LinkError::TooManyGlobals { module: m.name.clone() })
    })?;
    let var_count = modules.iter().map(|m| m.image.globals.len()).sum();
    let script_count = modules.iter().map(|m| m.image.scripts.len()).sum();
    let code_len = modules.iter().map(|m| m.image.code.len()).sum();
    let data_len: usize = modules.iter().map(|m| m.image.data.len()).sum();

    let mut linker = Linker {
        opts,
        total_globals,
        out: Image {
            version: CHL_VERSION,
            globals: GlobalVars::with_capacity(var_count),
            scripts: Vec::with_capacity(script_count),
            code: Vec::with_capacity(code_len),
            data: DataSection::with_capacity(data_len),
            autostart: Vec::new(),
            inits: vec![InitGlobal::null()],
        },
        shared: HashMap::new(),
        properties: IndexSet::new(),
        source_dirs: IndexSet::new(),
        string_addresses: Vec::new(),
        jumps: Vec::new(),
        manifest: LinkManifest { data_bytes_before: data_len, ..LinkManifest::default() },
    };

    for module in modules {
        linker.merge(module)?;
    }
    Ok(linker.finish())
}

struct Linker<'o> {
    opts: &'o LinkOptions,
    total_globals: u32,
    out: Image,
    shared: HashMap<Vec<u8>, u32>,
    properties: IndexSet<String>,
    source_dirs: IndexSet<String>,
    string_addresses: Vec<u32>,
    /// Sauts du module en cours : `(adresse dans le module, cible relocalisée)`.
    jumps: Vec<(u32, u32)>,
    manifest: LinkManifest,
}

/// Tables de relocalisation d’un module.
struct Reloc<'m> {
    module: &'m str,
    local_ids: HashMap<u32, u32>,
    extern_scripts: Vec<u32>,
    extern_vars: Vec<u32>,
    strings: HashMap<u32, u32>,
    global_offset: u32,
    local_shift: u32,
    /// Slots déclarés par le module.
    slots: u32,
}

/// Portée de variables d’un script source.
#[derive(Clone, Copy)]
struct Scope {
    boundary: u32,
    locals: u32,
}

impl Reloc<'_> {
    /// Id final d’un script : `Err` porte la nature et l’id introuvables.
    fn script_id(&self, r: SymRef) -> Result<u32, (&'static str, u32)> {
        let (found, what, id) = match r {
            SymRef::Internal(id) => (self.local_ids.get(&id), "script", id),
            SymRef::External(p) => (self.extern_scripts.get(p as usize), "external script", p),
        };
        found.copied().ok_or((what, id))
    }

    fn script(&self, r: SymRef, address: u32) -> Result<u32, LinkError> {
        self.script_id(r)
            .map_err(|(what, id)| LinkError::UnknownSymbol { module: self.module.to_owned(), address, what, id })
    }

    /// `v > boundary` : locale du script ; `1..=boundary` : globale du module ; 0 : variable nulle.
    fn var(&self, r: SymRef, scope: Scope, address: u32) -> Result<u32, LinkError> {
        let unknown = |what, id| LinkError::UnknownSymbol { module: self.module.to_owned(), address, what, id };
        match r {
            SymRef::Internal(0) => Ok(0),
            SymRef::Internal(v) if v > scope.boundary => {
                if v - scope.boundary - 1 >= scope.locals {
                    return Err(unknown("local variable", v));
                }
                v.checked_add(self.local_shift).ok_or_else(|| unknown("local variable", v))
            }
            SymRef::Internal(v) if v > self.slots => Err(unknown("global variable", v)),
            SymRef::Internal(v) => Ok(v + self.global_offset),
            SymRef::External(p) => self.extern_vars.get(p as usize).copied().ok_or_else(|| unknown("external variable", p)),
        }
    }
}

impl Linker<'_> {
    fn merge(&mut self, module: ObjectModule) -> Result<(), LinkError> {
        let ObjectModule { name, image, extern_vars, extern_scripts, string_instructions } = module;
        let Image { globals, scripts, code, data, autostart, inits, .. } = image;

        let base_address = self.out.next_address();
        let first_script_id = to_u32(self.out.scripts.len()) + 1;
        debug!(module = %name, base_address, scripts = scripts.len(), instructions = code.len(), "merging module");

        // Données
        let (strings, dedup_hits) = self.merge_data(&data);

        // Variables externes (contre les globales déjà fusionnées)
        let mut extern_var_ids = Vec::with_capacity(extern_vars.len());
        for ev in &extern_vars {
            extern_var_ids.push(self.resolve_var(&name, &ev.name, ev.index)?);
        }

        // Globales + initialiseurs (hors entrée nulle du module)
        let global_offset = self.out.globals.slot_count();
        for g in globals.iter() {
            match self.out.globals.push(g.clone()) {
                Ok(_) => {}
                Err(PushRejected::DuplicateName) => {
                    return Err(LinkError::DuplicateGlobal { module: name, name: g.name.clone() });
                }
                Err(PushRejected::SlotOverflow) => return Err(LinkError::TooManyGlobals { module: name }),
            }
        }
        self.out.inits.extend(inits.into_iter().skip(1));

        // Scripts externes (contre les scripts déjà fusionnés)
        let mut extern_script_ids = Vec::with_capacity(extern_scripts.len());
        for es in &extern_scripts {
            let Some(found) = self.out.script_by_name(&es.name) else {
                return Err(LinkError::UnresolvedScript { module: name, name: es.name.clone() });
            };
            if found.param_count != es.params {
                return Err(LinkError::ParamMismatch {
                    module: name,
                    name: es.name.clone(),
                    expected: es.params,
                    found: found.param_count,
                });
            }
            extern_script_ids.push(found.id);
        }

        // Renumérotation des scripts du module
        let local_ids = scripts
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id, first_script_id + to_u32(i)))
            .collect();

        let reloc = Reloc {
            module: &name,
            local_ids,
            extern_scripts: extern_script_ids,
            extern_vars: extern_var_ids,
            strings,
            global_offset,
            local_shift: self.total_globals - globals.slot_count(),
            slots: globals.slot_count(),
        };

        let mut instructions = 0usize;
        let script_total = scripts.len();
        for (i, script) in scripts.into_iter().enumerate() {
            let id = first_script_id + to_u32(i);
            instructions += self.copy_script(script, id, &code, &string_instructions, &reloc)?;
        }

        let end = self.out.next_address();
        if let Some(&(address, target)) = self.jumps.iter().find(|(_, t)| *t >= end) {
            return Err(LinkError::BadJumpTarget { module: name.clone(), address, target: i64::from(target) });
        }
        self.jumps.clear();

        for r in autostart {
            let id = reloc
                .script_id(r)
                .map_err(|(what, id)| LinkError::BadAutostart { module: name.clone(), what, id })?;
            self.out.autostart.push(SymRef::Internal(id));
        }

        self.manifest.inputs.push(LinkInput {
            file: name,
            base_address,
            first_script_id,
            global_offset,
            scripts: script_total,
            instructions,
            dedup_hits,
        });
        Ok(())
    }

    /// Copie les chaînes du module ; rend la table `ancien offset → nouvel offset`.
    fn merge_data(&mut self, data: &DataSection) -> (HashMap<u32, u32>, usize) {
        let mut map = HashMap::with_capacity(data.strings().len());
        let mut hits = 0usize;
        for s in data.strings() {
            let bytes = data.bytes_of(s);
            if bytes.starts_with(CRC32_MARKER.as_bytes()) {
                self.properties.insert(data.text_of(s).into_owned());
                continue;
            }
            if let Some(dirs) = bytes.strip_prefix(SOURCE_DIRS_MARKER.as_bytes()) {
                let dirs = String::from_utf8_lossy(dirs);
                self.source_dirs.extend(dirs.split(';').filter(|d| !d.is_empty()).map(str::to_owned));
                continue;
            }
            if bytes.starts_with(STRING_INSTRUCTIONS_MARKER.as_bytes()) {
                continue;
            }
            let offset = if self.opts.shared_strings {
                if let Some(&o) = self.shared.get(bytes) {
                    hits += 1;
                    o
                } else {
                    let o = self.out.data.push_bytes(bytes);
                    self.shared.insert(bytes.to_vec(), o);
                    o
                }
            } else {
                self.out.data.push_bytes(bytes)
            };
            map.insert(s.offset, offset);
        }
        (map, hits)
    }

    fn resolve_var(&self, module: &str, name: &str, index: u32) -> Result<u32, LinkError> {
        let Some((id, var)) = self.out.globals.find(name) else {
            return Err(LinkError::UnresolvedVariable { module: module.to_owned(), name: name.to_owned() });
        };
        if index > 0 {
            if !var.is_array() {
                return Err(LinkError::NotAnArray { module: module.to_owned(), name: name.to_owned(), index });
            }
            if index >= var.size {
                return Err(LinkError::ArrayBounds {
                    module: module.to_owned(),
                    name: name.to_owned(),
                    index,
                    size: var.size,
                });
            }
        }
        Ok(id + index)
    }

    /// Copie la suite d’instructions d’un script en relocalisant ses opérandes.
    fn copy_script(
        &mut self,
        script: Script,
        id: u32,
        code: &[Instruction],
        string_instructions: &BTreeSet<u32>,
        reloc: &Reloc<'_>,
    ) -> Result<usize, LinkError> {
        let start = script.address as usize;
        let run = code
            .get(start..)
            .and_then(|tail| tail.iter().position(|i| i.opcode == Opcode::End))
            .map(|end| &code[start..=start + end])
            .ok_or_else(|| LinkError::UnterminatedScript { module: reloc.module.to_owned(), name: script.name.clone() })?;

        let new_base = self.out.next_address();
        let scope = Scope { boundary: script.global_count, locals: to_u32(script.local_vars.len()) };

        for (k, original) in run.iter().enumerate() {
            let old_address = script.address + to_u32(k);
            let new_address = new_base + to_u32(k);
            let mut ins = *original;

            ins.operand = match ins.operand {
                Operand::Addr(a) => {
                    let target = i64::from(a) - i64::from(script.address) + i64::from(new_base);
                    let target = u32::try_from(target).map_err(|_| LinkError::BadJumpTarget {
                        module: reloc.module.to_owned(),
                        address: old_address,
                        target,
                    })?;
                    self.jumps.push((old_address, target));
                    Operand::Addr(target)
                }
                Operand::Script(r) => Operand::Script(SymRef::Internal(reloc.script(r, old_address)?)),
                Operand::Var(r) => Operand::Var(SymRef::Internal(reloc.var(r, scope, old_address)?)),
                Operand::Int(offset) if ins.opcode == Opcode::Push && string_instructions.contains(&old_address) => {
                    let moved = u32::try_from(offset).ok().and_then(|o| reloc.strings.get(&o)).copied();
                    let moved = moved.ok_or_else(|| LinkError::UnknownString {
                        module: reloc.module.to_owned(),
                        address: old_address,
                        offset,
                    })?;
                    self.string_addresses.push(new_address);
                    Operand::Int(i32::try_from(moved).unwrap_or(i32::MAX))
                }
                other => other,
            };

            if ins.is_reference() {
                self.relocate_paired_float(new_address, new_base, scope, old_address, reloc)?;
            }
            if self.opts.trace && ins.operand != original.operand {
                trace!(module = reloc.module, old_address, new_address, "{original} -> {ins}");
            }
            self.out.code.push(ins);
        }

        self.out.scripts.push(Script {
            id,
            address: new_base,
            global_count: script.global_count.saturating_add(reloc.local_shift),
            ..script
        });
        Ok(run.len())
    }

    /// Idiome `PUSH FLOAT <var>` … instruction en mode référence : l’id de variable
    /// est porté par le flottant deux positions plus tôt.
    fn relocate_paired_float(
        &mut self,
        new_address: u32,
        new_base: u32,
        scope: Scope,
        old_address: u32,
        reloc: &Reloc<'_>,
    ) -> Result<(), LinkError> {
        let malformed = || LinkError::MalformedReference { module: reloc.module.to_owned(), address: old_address };
        let at = new_address.checked_sub(2).filter(|&at| at >= new_base).ok_or_else(malformed)?;
        let paired = &mut self.out.code[at as usize];
        let r = paired.float_var_id().ok_or_else(malformed)?;
        let id = reloc.var(r, scope, old_address - 2)?;
        // ids de variables < 2^24 : conversion exacte
        #[allow(clippy::cast_precision_loss)]
        let as_float = id as f32;
        paired.operand = Operand::Float(as_float);
        Ok(())
    }

    fn finish(mut self) -> Linked {
        if self.opts.debug_metadata {
            for p in &self.properties {
                self.out.data.push_str(p);
            }
            if !self.source_dirs.is_empty() {
                let dirs: Vec<&str> = self.source_dirs.iter().map(String::as_str).collect();
                self.out.data.push_str(&format!("{SOURCE_DIRS_MARKER}{}", dirs.join(";")));
            }
            let addrs: Vec<String> = self.string_addresses.iter().map(u32::to_string).collect();
            self.out.data.push_str(&format!("{STRING_INSTRUCTIONS_MARKER}{}", addrs.join(",")));
        }

        let mut manifest = self.manifest;
        manifest.version = self.out.version;
        manifest.total_scripts = self.out.scripts.len();
        manifest.total_instructions = self.out.code.len();
        manifest.total_global_slots = self.out.globals.slot_count();
        manifest.data_bytes_after = self.out.data.len();
        manifest.build_properties = self.properties.into_iter().collect();
        manifest.source_dirs = self.source_dirs.into_iter().collect();

        info!(
            inputs = manifest.inputs.len(),
            scripts = manifest.total_scripts,
            instructions = manifest.total_instructions,
            globals = manifest.total_global_slots,
            "link done"
        );
        Linked { image: self.out, manifest }
    }
}

fn to_u32(n: usize) -> u32 { u32::try_from(n).unwrap_or(u32::MAX) }

#[cfg(test)]
mod tests {
    use super::*;
    use chl_core::bytecode::{InitValue, ModuleBuilder, VarName};
    use chl_core::helpers::validate_image;
    use pretty_assertions::assert_eq;

    /// `reward(amount)` et `a_main`, globales `health` et `flags[3]`.
    fn module_a() -> ObjectModule {
        let mut b = ModuleBuilder::new("a.txt");
        let health = b.global("health");
        b.array("flags", 3);
        b.init("health", InitValue::Float(100.0));

        let reward = b.begin_script("reward", 1, &["amount"]);
        let amount = b.local("amount").unwrap();
        b.emit(Instruction::load(amount));
        b.emit(Instruction::store(health));
        b.push_string("hello");
        b.emit(Instruction::sys(1));
        b.emit(Instruction::end());

        let main = b.begin_script("a_main", 0, &[]);
        b.emit(Instruction::call(reward));
        b.emit(Instruction::end());
        b.autostart(main);
        b.finish()
    }

    /// `b_main`, qui utilise les symboles de `a.txt`.
    fn module_b() -> ObjectModule {
        let mut b = ModuleBuilder::new("b.txt");
        let score = b.global("score");
        let health = b.extern_var("health", 0);
        let flag = b.extern_var("flags", 2);
        let reward = b.extern_script("reward", 1);

        b.begin_script("b_main", 0, &["x"]);
        let x = b.local("x").unwrap();
        b.push_string("hello");
        b.emit(Instruction::load(health));
        b.emit(Instruction::store(x));
        b.emit(Instruction::jump(Opcode::Jz, 5));
        b.emit(Instruction::call(reward));
        b.emit(Instruction::load(score));
        b.emit(Instruction::store(flag));
        b.emit(Instruction::load(SymRef::Internal(0)));
        b.emit(Instruction::end());
        b.finish()
    }

    fn only_externs(vars: &[(&str, u32)], scripts: &[(&str, u32)]) -> ObjectModule {
        let mut b = ModuleBuilder::new("c.txt");
        for (name, index) in vars {
            b.extern_var(name, *index);
        }
        for (name, params) in scripts {
            b.extern_script(name, *params);
        }
        b.finish()
    }

    fn link_default(modules: Vec<ObjectModule>) -> Result<Linked, LinkError> {
        link(modules, &LinkOptions::default())
    }

    #[test]
    fn single_module_links_to_itself() {
        let a = module_a();
        let linked = link_default(vec![a.clone()]).unwrap();
        assert_eq!(linked.image, a.image);
        assert_eq!(linked.manifest.inputs[0].base_address, 0);
    }

    #[test]
    fn globals_are_appended_in_link_order() {
        let linked = link_default(vec![module_a(), module_b()]).unwrap();
        let names: Vec<&str> = linked.image.globals.names().collect();
        assert_eq!(names, ["health", "flags", "score"]);
        assert_eq!(linked.image.globals.slot_count(), 5);
        assert_eq!(linked.manifest.inputs[1].global_offset, 4);
        let inits: Vec<&str> = linked.image.inits.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(inits, ["Null", "health"]);
    }

    #[test]
    fn operands_are_relocated() {
        let linked = link_default(vec![module_a(), module_b()]).unwrap();
        let img = &linked.image;
        assert_eq!(validate_image(img), Ok(()));

        let names: Vec<(u32, &str)> = img.scripts.iter().map(|s| (s.id, s.name.as_str())).collect();
        assert_eq!(names, [(1, "reward"), (2, "a_main"), (3, "b_main")]);
        assert_eq!(img.autostart, [SymRef::Internal(2)]);

        // reward : locale décalée de 1, frontière 5
        let reward = &img.scripts[0];
        assert_eq!(reward.global_count, 5);
        assert_eq!(img.code[0].operand, Operand::Var(SymRef::Internal(6)));
        assert_eq!(img.var_name(reward, 6), Some(VarName::Local("amount")));

        let b_main = &img.scripts[2];
        assert_eq!(b_main.address, 7);
        assert_eq!(b_main.global_count, 5);
        let ops: Vec<Operand> = img.code[7..].iter().map(|i| i.operand).collect();
        assert_eq!(
            ops,
            [
                Operand::Int(6),
                Operand::Var(SymRef::Internal(1)),
                Operand::Var(SymRef::Internal(6)),
                Operand::Addr(12),
                Operand::Script(SymRef::Internal(1)),
                Operand::Var(SymRef::Internal(5)),
                Operand::Var(SymRef::Internal(4)),
                Operand::Var(SymRef::Internal(0)),
                Operand::None,
            ]
        );
        assert_eq!(img.var_name(b_main, 6), Some(VarName::Local("x")));
        assert_eq!(img.var_name(b_main, 5), Some(VarName::Global { name: "score", element: 0 }));
        assert_eq!(img.var_name(b_main, 4), Some(VarName::Global { name: "flags", element: 2 }));
    }

    #[test]
    fn jumps_keep_their_offset_from_the_script_start() {
        let b = module_b();
        let old = &b.image.scripts[0];
        let old_rel = 5 - old.address;
        let linked = link_default(vec![module_a(), b]).unwrap();
        let s = &linked.image.scripts[2];
        let jz = linked.image.code[s.address as usize + 3];
        assert_eq!(jz.operand, Operand::Addr(s.address + old_rel));
    }

    #[test]
    fn strings_are_copied_or_shared() {
        let linked = link_default(vec![module_a(), module_b()]).unwrap();
        assert_eq!(linked.image.data.as_bytes(), b"hello\0hello\0");
        assert_eq!(linked.image.code[2].operand, Operand::Int(0));
        assert_eq!(linked.image.code[7].operand, Operand::Int(6));

        let opts = LinkOptions { shared_strings: true, ..LinkOptions::default() };
        let linked = link(vec![module_a(), module_b()], &opts).unwrap();
        assert_eq!(linked.image.data.as_bytes(), b"hello\0");
        assert_eq!(linked.image.code[7].operand, Operand::Int(0));
        assert_eq!(linked.manifest.inputs[1].dedup_hits, 1);
    }

    #[test]
    fn reference_idiom_relocates_the_paired_float() {
        let mut b = ModuleBuilder::new("d.txt");
        b.global("d");
        let health = b.extern_var("health", 0);
        b.begin_script("d_main", 0, &["t"]);
        let t = b.local("t").unwrap();
        b.emit(Instruction::push_var_id(t));
        b.emit(Instruction::push_int(7));
        b.emit(Instruction::by_ref(Opcode::Store));
        b.emit(Instruction::push_var_id(health));
        b.emit(Instruction::push_int(0));
        b.emit(Instruction::by_ref(Opcode::Load));
        b.emit(Instruction::end());

        let linked = link_default(vec![module_a(), b.finish()]).unwrap();
        let base = linked.image.scripts[2].address as usize;
        assert_eq!(linked.image.code[base].operand, Operand::Float(6.0));
        assert_eq!(linked.image.code[base + 3].operand, Operand::Float(1.0));
        assert_eq!(validate_image(&linked.image), Ok(()));
    }

    #[test]
    fn reference_without_float_push_is_malformed() {
        let mut b = ModuleBuilder::new("e.txt");
        b.begin_script("e_main", 0, &[]);
        b.emit(Instruction::push_int(1));
        b.emit(Instruction::by_ref(Opcode::Store));
        b.emit(Instruction::end());
        assert_eq!(
            link_default(vec![b.finish()]).unwrap_err(),
            LinkError::MalformedReference { module: "e.txt".into(), address: 1 }
        );
    }

    #[test]
    fn externals_only_see_earlier_modules() {
        let err = link_default(vec![module_b(), module_a()]).unwrap_err();
        assert_eq!(err, LinkError::UnresolvedVariable { module: "b.txt".into(), name: "health".into() });
        assert_eq!(err.module(), "b.txt");
    }

    #[test]
    fn extern_errors_are_reported() {
        let cases = [
            (
                only_externs(&[("health", 1)], &[]),
                LinkError::NotAnArray { module: "c.txt".into(), name: "health".into(), index: 1 },
            ),
            (
                only_externs(&[("flags", 3)], &[]),
                LinkError::ArrayBounds { module: "c.txt".into(), name: "flags".into(), index: 3, size: 3 },
            ),
            (
                only_externs(&[], &[("missing", 0)]),
                LinkError::UnresolvedScript { module: "c.txt".into(), name: "missing".into() },
            ),
            (
                only_externs(&[], &[("reward", 2)]),
                LinkError::ParamMismatch { module: "c.txt".into(), name: "reward".into(), expected: 2, found: 1 },
            ),
        ];
        for (module, expected) in cases {
            assert_eq!(link_default(vec![module_a(), module]).unwrap_err(), expected);
        }
    }

    #[test]
    fn duplicate_globals_are_rejected() {
        let mut b = ModuleBuilder::new("c.txt");
        b.global("health");
        assert_eq!(
            link_default(vec![module_a(), b.finish()]).unwrap_err(),
            LinkError::DuplicateGlobal { module: "c.txt".into(), name: "health".into() }
        );
    }

    #[test]
    fn script_without_end_is_rejected() {
        let mut b = ModuleBuilder::new("f.txt");
        b.begin_script("open", 0, &[]);
        b.emit(Instruction::push_int(1));
        assert_eq!(
            link_default(vec![b.finish()]).unwrap_err(),
            LinkError::UnterminatedScript { module: "f.txt".into(), name: "open".into() }
        );
    }

    #[test]
    fn debug_metadata_is_collected_and_reemitted() {
        let with_markers = |name: &str, dir: &str| {
            let mut m = module_a();
            m.name = name.into();
            m.image.data.push_str(&format!("crc32[{name}]=0badf00d"));
            m.image.data.push_str(&format!("source_dirs={dir};shared"));
            m.image.data.push_str("string_instructions=99");
            m
        };
        let mut second = with_markers("g.txt", "more");
        second.image.globals = GlobalVars::new();
        second.image.inits.truncate(1);
        second.image.scripts.clear();
        second.image.code.clear();
        second.image.autostart.clear();
        second.string_instructions.clear();

        let opts = LinkOptions { debug_metadata: true, ..LinkOptions::default() };
        let linked = link(vec![with_markers("a.txt", "scripts"), second], &opts).unwrap();
        let texts: Vec<String> =
            linked.image.data.strings().iter().map(|s| linked.image.data.text_of(s).into_owned()).collect();
        assert_eq!(
            texts,
            [
                "hello",
                "hello",
                "crc32[a.txt]=0badf00d",
                "crc32[g.txt]=0badf00d",
                "source_dirs=scripts;shared;more",
                "string_instructions=2",
            ]
        );
        assert_eq!(linked.manifest.source_dirs, ["scripts", "shared", "more"]);

        let linked = link(vec![with_markers("a.txt", "scripts")], &LinkOptions::default()).unwrap();
        assert_eq!(linked.image.data.as_bytes(), b"hello\0");
        assert_eq!(linked.manifest.build_properties, ["crc32[a.txt]=0badf00d"]);
    }

    #[test]
    fn boundary_slot_is_a_global_and_the_next_one_a_local() {
        let mut b = ModuleBuilder::new("x.txt");
        let x = b.global("x");
        b.begin_script("x_main", 0, &["l"]);
        assert_eq!((x, b.local("l")), (SymRef::Internal(1), Some(SymRef::Internal(2))));
        b.emit(Instruction::load(SymRef::Internal(1)));
        b.emit(Instruction::load(SymRef::Internal(2)));
        b.emit(Instruction::end());

        let linked = link_default(vec![module_a(), b.finish()]).unwrap();
        let img = &linked.image;
        let s = &img.scripts[2];
        let at = s.address as usize;
        assert_eq!(img.code[at].operand, Operand::Var(SymRef::Internal(5)));
        assert_eq!(img.code[at + 1].operand, Operand::Var(SymRef::Internal(6)));
        assert_eq!(img.var_name(s, 5), Some(VarName::Global { name: "x", element: 0 }));
        assert_eq!(img.var_name(s, 6), Some(VarName::Local("l")));
    }

    #[test]
    fn jump_outside_the_image_is_rejected() {
        let mut b = ModuleBuilder::new("j.txt");
        b.begin_script("j_main", 0, &[]);
        b.emit(Instruction::jump(Opcode::Jmp, 50));
        b.emit(Instruction::end());
        assert_eq!(
            link_default(vec![module_a(), b.finish()]).unwrap_err(),
            LinkError::BadJumpTarget { module: "j.txt".into(), address: 0, target: 57 }
        );
    }

    #[test]
    fn internal_ids_outside_the_module_tables_are_rejected() {
        let build = |load: u32, boundary: u32| {
            let mut b = ModuleBuilder::new("d.txt");
            b.global("only");
            b.begin_script("d_main", 0, &["l"]);
            b.emit(Instruction::load(SymRef::Internal(load)));
            b.emit(Instruction::end());
            let mut m = b.finish();
            m.image.scripts[0].global_count = boundary;
            m
        };
        assert!(link_default(vec![build(2, 1)]).is_ok());
        assert_eq!(
            link_default(vec![build(3, 1)]).unwrap_err(),
            LinkError::UnknownSymbol { module: "d.txt".into(), address: 0, what: "local variable", id: 3 }
        );
        assert_eq!(
            link_default(vec![build(5, 10)]).unwrap_err(),
            LinkError::UnknownSymbol { module: "d.txt".into(), address: 0, what: "global variable", id: 5 }
        );
    }

    #[test]
    fn autostart_can_name_an_external_script() {
        let mut b = ModuleBuilder::new("e.txt");
        let reward = b.extern_script("reward", 1);
        b.autostart(reward);
        let linked = link_default(vec![module_a(), b.finish()]).unwrap();
        assert_eq!(linked.image.autostart, [SymRef::Internal(2), SymRef::Internal(1)]);
    }

    #[test]
    fn autostart_without_a_script_is_its_own_error() {
        for (entry, what, id) in [(SymRef::External(3), "external script", 3), (SymRef::Internal(9), "script", 9)] {
            let mut b = ModuleBuilder::new("e.txt");
            b.autostart(entry);
            let err = link_default(vec![module_a(), b.finish()]).unwrap_err();
            assert_eq!(err, LinkError::BadAutostart { module: "e.txt".into(), what, id });
            assert_eq!(err.to_string(), format!("e.txt: autostart references undefined {what} {id}"));
        }
    }

    #[test]
    fn global_slots_past_the_limit_are_rejected() {
        let mut first = ModuleBuilder::new("first.txt");
        first.array("big", MAX_SLOT);
        let mut second = ModuleBuilder::new("second.txt");
        second.global("one_more");
        assert_eq!(
            link_default(vec![first.finish(), second.finish()]).unwrap_err(),
            LinkError::TooManyGlobals { module: "second.txt".into() }
        );
    }
}
