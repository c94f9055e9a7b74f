//! Jeux de données synthétiques partagés par les benchmarks.

use chl_core::bytecode::{InitValue, Instruction, ModuleBuilder, ObjectModule, Opcode};

/// `modules` modules de `scripts` scripts chacun ; chaque module appelle un
/// script et lit une globale du module précédent.
pub fn synthetic_modules(modules: usize, scripts: usize) -> Vec<ObjectModule> {
    (0..modules)
        .map(|m| {
            let mut b = ModuleBuilder::new(format!("bench/m{m}.txt"));
            let counter = b.global(&format!("counter_{m}"));
            b.array(&format!("table_{m}"), 16);
            b.init(&format!("counter_{m}"), InitValue::Float(0.0));
            let previous = (m > 0).then(|| {
                (b.extern_var(&format!("table_{}", m - 1), 3), b.extern_script(&format!("m{}_s0", m - 1), 1))
            });
            for s in 0..scripts {
                b.begin_script(&format!("m{m}_s{s}"), 1, &["arg", "tmp"]);
                let tmp = b.local("tmp").unwrap_or(counter);
                let top = b.here();
                b.emit(Instruction::push_var_id(tmp));
                b.emit(Instruction::push_int(1));
                b.emit(Instruction::by_ref(Opcode::Store));
                b.emit(Instruction::load(counter));
                b.push_string("tick");
                b.push_string(&format!("m{m} s{s}"));
                if let Some((table, call)) = previous {
                    b.emit(Instruction::load(table));
                    b.emit(Instruction::call(call));
                }
                b.emit(Instruction::jump(Opcode::Jnz, top));
                b.emit(Instruction::end());
            }
            b.finish()
        })
        .collect()
}
