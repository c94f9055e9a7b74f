//! Binary layout of images and object modules.
//!
//! ```text
//! Image  : "CHL\0" version:u32 globals scripts code data autostart inits
//! Object : "CHLO" name:str <image body> extern_vars extern_scripts string_instructions
//!
//! globals  = n:u32 (name:str size:u32)*
//! scripts  = n:u32 (id:u32 name:str params:u32 global_count:u32 address:u32
//!                   locals:(n:u32 str*) source:str)*
//! code     = n:u32 (opcode:u8 mode:u8 type:u8 operand:i32 line:u32)*
//! data     = len:u32 bytes
//! autostart= n:u32 i32*            (script refs, -(p+1) for placeholders)
//! inits    = n:u32 (name:str tag:u8 (f32 | str))*
//! ```

use super::{
    DataSection, DataType, ExternScript, ExternVar, GlobalVar, GlobalVars, Image, InitGlobal,
    InitValue, Instruction, Mode, ObjectModule, Opcode, Operand, PushRejected, Script, SymRef,
};
use crate::{len_u32, ByteReader, ByteWriter, CoreError, CoreResult, MAGIC_IMAGE, MAGIC_OBJECT};

const INIT_TAG_FLOAT: u8 = 0x00;
const INIT_TAG_EXPR: u8 = 0x01;

/// Encoded size of one instruction.
const INSTRUCTION_SIZE: usize = 3 + 4 + 4;

impl Image {
    /// Encode to the persisted image layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_bytes(MAGIC_IMAGE);
        write_body(&mut w, self);
        w.into_vec()
    }

    /// Decode from [`Image::to_bytes`] output.
    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(data);
        expect_magic(&mut r, MAGIC_IMAGE)?;
        let image = read_body(&mut r)?;
        r.finish()?;
        Ok(image)
    }
}

impl ObjectModule {
    /// Encode to the object file layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_bytes(MAGIC_OBJECT);
        w.write_str(&self.name);
        write_body(&mut w, &self.image);

        w.write_u32_le(len_u32(self.extern_vars.len()));
        for v in &self.extern_vars {
            w.write_str(&v.name);
            w.write_u32_le(v.index);
        }
        w.write_u32_le(len_u32(self.extern_scripts.len()));
        for s in &self.extern_scripts {
            w.write_str(&s.name);
            w.write_u32_le(s.params);
        }
        w.write_u32_le(len_u32(self.string_instructions.len()));
        for at in &self.string_instructions {
            w.write_u32_le(*at);
        }
        w.into_vec()
    }

    /// Decode from [`ObjectModule::to_bytes`] output.
    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(data);
        expect_magic(&mut r, MAGIC_OBJECT)?;
        let mut m = ObjectModule::new(r.read_str()?);
        m.image = read_body(&mut r)?;

        let n = r.read_count(8)?;
        for _ in 0..n {
            let name = r.read_str()?;
            let index = r.read_u32_le()?;
            if !m.extern_vars.insert(ExternVar { name, index }) {
                return Err(CoreError::corrupted("duplicate extern variable"));
            }
        }
        let n = r.read_count(8)?;
        for _ in 0..n {
            let name = r.read_str()?;
            let params = r.read_u32_le()?;
            if !m.extern_scripts.insert(ExternScript { name, params }) {
                return Err(CoreError::corrupted("duplicate extern script"));
            }
        }
        let n = r.read_count(4)?;
        for _ in 0..n {
            m.string_instructions.insert(r.read_u32_le()?);
        }
        r.finish()?;
        Ok(m)
    }
}

fn expect_magic(r: &mut ByteReader<'_>, magic: &'static [u8; 4]) -> CoreResult<()> {
    if r.read_bytes(4)? == magic {
        Ok(())
    } else {
        Err(CoreError::InvalidMagic { expected: magic })
    }
}

fn write_body(w: &mut ByteWriter, img: &Image) {
    w.write_u32_le(img.version);

    w.write_u32_le(len_u32(img.globals.len()));
    for g in img.globals.iter() {
        w.write_str(&g.name);
        w.write_u32_le(g.size);
    }

    w.write_u32_le(len_u32(img.scripts.len()));
    for s in &img.scripts {
        w.write_u32_le(s.id);
        w.write_str(&s.name);
        w.write_u32_le(s.param_count);
        w.write_u32_le(s.global_count);
        w.write_u32_le(s.address);
        w.write_u32_le(len_u32(s.local_vars.len()));
        for l in &s.local_vars {
            w.write_str(l);
        }
        w.write_str(&s.source_file);
    }

    w.write_u32_le(len_u32(img.code.len()));
    for ins in &img.code {
        w.write_u8(ins.opcode as u8);
        w.write_u8(ins.mode as u8);
        w.write_u8(ins.data_type as u8);
        w.write_i32_le(ins.operand.word());
        w.write_u32_le(ins.line);
    }

    w.write_blob(img.data.as_bytes());

    w.write_u32_le(len_u32(img.autostart.len()));
    for s in &img.autostart {
        w.write_i32_le(s.encode());
    }

    w.write_u32_le(len_u32(img.inits.len()));
    for init in &img.inits {
        w.write_str(&init.name);
        match &init.value {
            InitValue::Float(v) => {
                w.write_u8(INIT_TAG_FLOAT);
                w.write_f32_le(*v);
            }
            InitValue::Expr(e) => {
                w.write_u8(INIT_TAG_EXPR);
                w.write_str(e);
            }
        }
    }
}

fn read_body(r: &mut ByteReader<'_>) -> CoreResult<Image> {
    let version = r.read_u32_le()?;

    let n = r.read_count(8)?;
    let mut globals = GlobalVars::with_capacity(n);
    for _ in 0..n {
        let name = r.read_str()?;
        let size = r.read_u32_le()?;
        match globals.push(GlobalVar { name, size: size.max(1) }) {
            Ok(_) => {}
            Err(PushRejected::DuplicateName) => return Err(CoreError::corrupted("duplicate global variable name")),
            Err(PushRejected::SlotOverflow) => return Err(CoreError::corrupted("global variables overflow the slot space")),
        }
    }

    let n = r.read_count(28)?;
    let mut scripts = Vec::with_capacity(n);
    for _ in 0..n {
        let id = r.read_u32_le()?;
        let name = r.read_str()?;
        let param_count = r.read_u32_le()?;
        let global_count = r.read_u32_le()?;
        let address = r.read_u32_le()?;
        let locals = r.read_count(4)?;
        let local_vars = (0..locals).map(|_| r.read_str()).collect::<CoreResult<Vec<_>>>()?;
        let source_file = r.read_str()?;
        scripts.push(Script { id, name, param_count, global_count, local_vars, address, source_file });
    }

    let n = r.read_count(INSTRUCTION_SIZE)?;
    let mut code = Vec::with_capacity(n);
    for _ in 0..n {
        code.push(read_instruction(r)?);
    }

    let data = DataSection::from_bytes(r.read_blob()?.to_vec());

    let n = r.read_count(4)?;
    let autostart = (0..n).map(|_| r.read_i32_le().map(SymRef::decode)).collect::<CoreResult<Vec<_>>>()?;

    let n = r.read_count(5)?;
    let mut inits = Vec::with_capacity(n);
    for _ in 0..n {
        let name = r.read_str()?;
        let value = match r.read_u8()? {
            INIT_TAG_FLOAT => InitValue::Float(r.read_f32_le()?),
            INIT_TAG_EXPR => InitValue::Expr(r.read_str()?),
            raw => return Err(CoreError::UnknownCode { what: "initializer", raw }),
        };
        inits.push(InitGlobal { name, value });
    }

    Ok(Image { version, globals, scripts, code, data, autostart, inits })
}

fn read_instruction(r: &mut ByteReader<'_>) -> CoreResult<Instruction> {
    let raw = r.read_u8()?;
    let opcode = Opcode::from_u8(raw).ok_or(CoreError::UnknownCode { what: "opcode", raw })?;
    let raw = r.read_u8()?;
    let mode = Mode::from_u8(raw).ok_or(CoreError::UnknownCode { what: "mode", raw })?;
    let raw = r.read_u8()?;
    let data_type = DataType::from_u8(raw).ok_or(CoreError::UnknownCode { what: "data type", raw })?;
    let word = r.read_i32_le()?;
    let operand = Operand::from_word(opcode, mode, data_type, word)
        .ok_or_else(|| CoreError::corrupted(format!("{opcode} has a negative target {word}")))?;
    let line = r.read_u32_le()?;
    Ok(Instruction { opcode, mode, data_type, operand, line })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ModuleBuilder;
    use pretty_assertions::assert_eq;

    fn sample() -> ObjectModule {
        let mut b = ModuleBuilder::new("villager.txt");
        let health = b.global("health");
        b.array("flags", 3);
        b.init("health", InitValue::Float(100.0));
        b.init("flags", InitValue::Expr("2 * 3".into()));
        let ext = b.extern_var("score", 0);
        let other = b.extern_script("reward", 1);
        let main = b.begin_script("villager_main", 0, &["n"]);
        let n = b.local("n").unwrap_or(SymRef::Internal(0));
        b.emit(Instruction::push_float(1.5).at_line(3));
        b.emit(Instruction::store(n));
        b.emit(Instruction::load(health));
        b.emit(Instruction::load(ext));
        b.push_string("hello");
        b.emit(Instruction::call(other));
        b.emit(Instruction::jump(Opcode::Jmp, 0));
        b.emit(Instruction::end());
        b.autostart(main);
        b.finish()
    }

    #[test]
    fn object_roundtrip_keeps_placeholders() -> CoreResult<()> {
        let m = sample();
        let back = ObjectModule::from_bytes(&m.to_bytes())?;
        assert_eq!(back, m);
        assert_eq!(back.image.code[3].operand, Operand::Var(SymRef::External(0)));
        Ok(())
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_form_matches_the_binary_form() {
        let m = sample();
        let back: ObjectModule = serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        assert_eq!(back, m);

        let img: Image = serde_json::from_str(&serde_json::to_string(&m.image).unwrap()).unwrap();
        assert_eq!(img.to_bytes(), m.image.to_bytes());
        assert_eq!(img.data.string_at(0).as_deref(), Some("hello"));
    }

    #[test]
    fn image_and_object_magics_are_not_interchangeable() {
        let m = sample();
        assert_eq!(
            Image::from_bytes(&m.to_bytes()),
            Err(CoreError::InvalidMagic { expected: MAGIC_IMAGE })
        );
        let img = Image::from_bytes(&m.image.to_bytes());
        assert_eq!(img.as_ref().map(|i| i.code.len()).ok(), Some(8));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut img = Image::new();
        img.code.push(Instruction::end());
        let mut bytes = img.to_bytes();
        // magic, version, globals, scripts, code count
        let at = 4 * 5;
        assert_eq!(bytes[at], Opcode::End as u8);
        bytes[at] = 0xEE;
        assert!(matches!(Image::from_bytes(&bytes), Err(CoreError::UnknownCode { what: "opcode", raw: 0xEE })));
    }

    #[test]
    fn negative_jump_target_is_corrupt() {
        let mut img = Image::new();
        img.code.push(Instruction::jump(Opcode::Jmp, 0));
        img.code.push(Instruction::end());
        let mut bytes = img.to_bytes();
        // magic, version, globals, scripts, code count, opcode/mode/type
        let at = 4 * 5 + 3;
        assert_eq!(bytes[at - 3], Opcode::Jmp as u8);
        bytes[at..at + 4].copy_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(Image::from_bytes(&bytes), Err(CoreError::corrupted("JMP has a negative target -1")));
    }

    #[test]
    fn oversized_globals_are_corrupt() {
        let mut w = ByteWriter::new();
        w.write_bytes(MAGIC_IMAGE);
        w.write_u32_le(crate::CHL_VERSION);
        w.write_u32_le(2);
        w.write_str("huge");
        w.write_u32_le(u32::MAX);
        w.write_str("next");
        w.write_u32_le(1);
        assert_eq!(
            Image::from_bytes(&w.into_vec()),
            Err(CoreError::corrupted("global variables overflow the slot space"))
        );
    }
}
