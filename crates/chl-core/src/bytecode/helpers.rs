//! Helper validations reused by tooling.

use super::{Image, Operand, SymRef};
use crate::{CoreError, CoreResult};

/// Structural validation of a linked image.
///
/// Keeps the checks lightweight: ids and addresses must be in range, every
/// script run must be closed by END, and no placeholder may survive linking.
pub fn validate_image(image: &Image) -> CoreResult<()> {
    let code_len = image.code.len();
    let script_count = image.scripts.len();

    for (i, s) in image.scripts.iter().enumerate() {
        if s.id as usize != i + 1 {
            return Err(CoreError::corrupted(format!(
                "script `{}` has id {} at position {}", s.name, s.id, i + 1
            )));
        }
        let Some(run) = image.script_code(s) else {
            return Err(CoreError::corrupted(format!(
                "script `{}` at {} is not terminated by END", s.name, s.address
            )));
        };
        for (k, ins) in run.iter().enumerate() {
            if let Operand::Var(SymRef::Internal(v)) = ins.operand {
                if image.var_name(s, v).is_none() {
                    let pc = s.address as usize + k;
                    return Err(CoreError::corrupted(format!(
                        "op {pc} in `{}` references unknown variable {v}", s.name
                    )));
                }
            }
        }
    }

    for (pc, ins) in image.code.iter().enumerate() {
        match ins.operand {
            Operand::Addr(a) if a as usize >= code_len => {
                return Err(CoreError::corrupted(format!("op {pc} jumps to {a} but code size is {code_len}")));
            }
            Operand::Script(SymRef::Internal(id)) if id == 0 || id as usize > script_count => {
                return Err(CoreError::corrupted(format!("op {pc} references unknown script {id}")));
            }
            Operand::Script(SymRef::External(_)) | Operand::Var(SymRef::External(_)) => {
                return Err(CoreError::corrupted(format!("op {pc} keeps an unresolved placeholder")));
            }
            _ => {}
        }
        if ins.is_reference() {
            let paired = pc.checked_sub(2).and_then(|p| image.code.get(p));
            if paired.and_then(|p| p.float_var_id()).is_none() {
                return Err(CoreError::corrupted(format!("op {pc} is a reference without its float PUSH")));
            }
        }
    }

    for s in &image.autostart {
        match s {
            SymRef::Internal(id) if *id >= 1 && (*id as usize) <= script_count => {}
            other => {
                return Err(CoreError::corrupted(format!("autostart entry {other:?} is not a script")));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{GlobalVar, Instruction, Opcode, Script};

    fn one_script(code: Vec<Instruction>) -> Image {
        let mut img = Image::new();
        img.code = code;
        img.scripts.push(Script {
            id: 1,
            name: "main".into(),
            param_count: 0,
            global_count: 0,
            local_vars: vec![],
            address: 0,
            source_file: "main.txt".into(),
        });
        img
    }

    #[test]
    fn well_formed_image_passes() {
        let img = one_script(vec![
            Instruction::jump(Opcode::Jz, 2),
            Instruction::call(SymRef::Internal(1)),
            Instruction::end(),
        ]);
        assert_eq!(validate_image(&img), Ok(()));
    }

    #[test]
    fn variables_must_exist_in_the_script_scope() {
        let mut img = one_script(vec![Instruction::load(SymRef::Internal(1)), Instruction::end()]);
        img.scripts[0].global_count = 1;
        assert!(validate_image(&img).is_err());

        img.globals.push(GlobalVar::scalar("g")).unwrap();
        assert_eq!(validate_image(&img), Ok(()));

        img.code[0] = Instruction::load(SymRef::Internal(2));
        assert!(validate_image(&img).is_err());
        img.scripts[0].local_vars.push("l".into());
        assert_eq!(validate_image(&img), Ok(()));
    }

    #[test]
    fn placeholders_are_rejected() {
        let img = one_script(vec![Instruction::load(SymRef::External(0)), Instruction::end()]);
        assert!(validate_image(&img).is_err());
    }

    #[test]
    fn unterminated_script_is_rejected() {
        let img = one_script(vec![Instruction::push_int(1)]);
        assert!(validate_image(&img).is_err());
    }

    #[test]
    fn reference_needs_its_float_push() {
        let img = one_script(vec![
            Instruction::push_int(0),
            Instruction::push_int(1),
            Instruction::by_ref(Opcode::Load),
            Instruction::end(),
        ]);
        assert!(validate_image(&img).is_err());
    }
}
