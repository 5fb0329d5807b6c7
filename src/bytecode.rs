// The compiled program: a flat byte string of instructions plus the
// tables the runtime needs to call into it, marshal values across
// it, and walk its stack frames. Immutable once built.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::rc::Rc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::stackinfo::StackInformation;
use crate::value::ExternalValue;
use crate::vm::VM;


// Operands are little-endian i32s except for Push8, which carries a
// full 64-bit immediate. Instruction width is 1 plus the operand
// bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Noop = 0,
    Push1 = 1,
    Push4 = 2,
    Push8 = 3,
    RepushFromN = 4,
    PopNBelow = 5,
    Jump = 6,
    JumpIfFalse = 7,
    AddI32 = 8,
    SubI32 = 9,
    MulI32 = 10,
    DivI32 = 11,
    ModuloI32 = 12,
    CompareLtI32 = 13,
    CompareLeI32 = 14,
    CompareGtI32 = 15,
    CompareGeI32 = 16,
    CompareEqI32 = 17,
    CompareNeI32 = 18,
    AddI64 = 19,
    SubI64 = 20,
    MulI64 = 21,
    DivI64 = 22,
    ModuloI64 = 23,
    CompareLtI64 = 24,
    CompareLeI64 = 25,
    CompareGtI64 = 26,
    CompareGeI64 = 27,
    CompareEqI64 = 28,
    CompareNeI64 = 29,
    LogicalAnd = 30,
    LogicalOr = 31,
    LogicalNot = 32,
    Call = 33,
    Return = 34,
    CreateLambda = 35,
    CreateStructOrEnum = 36,
    CreateList = 37,
    ListPrepend = 38,
    ListGetTail = 39,
    IsListEmpty = 40,
    LoadFromPtr = 41,
    CompareComplexEquality = 42,
    IncreaseStackSize = 43,
    RunGc = 44,
}


impl Opcode {
    pub fn width(self) -> i32 {
        use Opcode::*;
        match self {
            Push1 => 2,
            Push4 => 5,
            Push8 | RepushFromN | PopNBelow | CreateLambda | CreateList
            | LoadFromPtr => 9,
            Jump | JumpIfFalse | Call | Return | CreateStructOrEnum
            | ListPrepend | CompareComplexEquality | IncreaseStackSize => 5,
            _ => 1,
        }
    }
}


pub struct Function {
    pub name: String,
    pub offset: i32,
    pub length: i32,
    // The full function type: return type and parameter types.
    pub datatype: Datatype,
    pub stack_info: StackInformation,
    // Frame size in bytes at every instruction boundary, keyed by ip.
    pub stack_size_per_ip: HashMap<i32, i32>,
}


pub type NativeCallback =
    dyn Fn(&mut VM, Vec<ExternalValue>) -> Result<ExternalValue>;


pub struct NativeFunction {
    pub name: String,
    pub datatype: Datatype,
    pub callback: Rc<NativeCallback>,
}


pub struct Program {
    pub code: Vec<u8>,
    pub functions: Vec<Function>,
    pub native_functions: Vec<NativeFunction>,
    // Type descriptors referenced by id from instructions: lambda
    // capture tuples, complex equality operands.
    pub auxiliary_datatypes: Vec<Datatype>,
}


impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_at_ip(&self, ip: i32) -> Option<&Function> {
        self.functions
            .iter()
            .find(|f| ip >= f.offset && ip < f.offset + f.length)
    }

    // One past the last instruction; doubles as the sentinel return
    // ip of a top-level call.
    pub fn end_ip(&self) -> i32 {
        self.code.len() as i32
    }

    pub fn opcode_at(&self, ip: i32) -> Result<Opcode> {
        let byte = *self
            .code
            .get(ip as usize)
            .ok_or_else(|| Error::Bytecode(format!("ip {} out of range", ip)))?;
        Opcode::try_from(byte).map_err(|_| {
            Error::Bytecode(format!("unknown opcode {} at ip {}", byte, ip))
        })
    }

    pub fn read_i32(&self, at: i32) -> Result<i32> {
        let at = at as usize;
        let bytes = self.code.get(at..at + 4).ok_or_else(|| {
            Error::Bytecode(format!("operand at {} out of range", at))
        })?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, at: i32) -> Result<u64> {
        let at = at as usize;
        let bytes = self.code.get(at..at + 8).ok_or_else(|| {
            Error::Bytecode(format!("operand at {} out of range", at))
        })?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn auxiliary(&self, id: i32) -> Result<&Datatype> {
        self.auxiliary_datatypes.get(id as usize).ok_or_else(|| {
            Error::Bytecode(format!("auxiliary datatype {} missing", id))
        })
    }
}


impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Program")
            .field("code_len", &self.code.len())
            .field(
                "functions",
                &self.functions.iter().map(|x| &x.name).collect::<Vec<_>>(),
            )
            .field(
                "native_functions",
                &self
                    .native_functions
                    .iter()
                    .map(|x| &x.name)
                    .collect::<Vec<_>>(),
            )
            .field("auxiliary_datatypes", &self.auxiliary_datatypes)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_roundtrip() {
        for byte in 0u8..=44 {
            let op = Opcode::try_from(byte).unwrap();
            let back: u8 = op.into();
            assert_eq!(back, byte);
        }
        assert!(Opcode::try_from(45u8).is_err());
        assert!(Opcode::try_from(255u8).is_err());
    }

    #[test]
    fn widths_cover_the_operands() {
        assert_eq!(Opcode::Noop.width(), 1);
        assert_eq!(Opcode::Push8.width(), 9);
        assert_eq!(Opcode::RepushFromN.width(), 9);
        assert_eq!(Opcode::Jump.width(), 5);
        assert_eq!(Opcode::Call.width(), 5);
        assert_eq!(Opcode::CreateLambda.width(), 9);
        assert_eq!(Opcode::RunGc.width(), 1);
    }

    fn empty_program(code: Vec<u8>) -> Program {
        Program {
            code,
            functions: vec![],
            native_functions: vec![],
            auxiliary_datatypes: vec![],
        }
    }

    #[test]
    fn malformed_code_is_an_error_not_a_panic() {
        let program = empty_program(vec![Opcode::Push8.into()]);
        assert!(matches!(program.opcode_at(0), Ok(Opcode::Push8)));
        assert!(matches!(program.read_u64(1), Err(Error::Bytecode(_))));
        assert!(matches!(program.opcode_at(9), Err(Error::Bytecode(_))));
        assert!(matches!(
            empty_program(vec![200]).opcode_at(0),
            Err(Error::Bytecode(_))
        ));
    }

    #[test]
    fn missing_auxiliary_datatype_is_an_error() {
        let program = empty_program(vec![]);
        assert!(matches!(program.auxiliary(0), Err(Error::Bytecode(_))));
    }
}
