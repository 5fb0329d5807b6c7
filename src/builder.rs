// The surface a compiler drives to produce a Program: per-opcode
// emitters with label fixups, running frame-size bookkeeping for
// the stack walker, and scope/variable recording for the stack-shape
// tree. Tests use it to hand-compile programs the same way the real
// lowering pass would.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{
    Function, NativeCallback, NativeFunction, Opcode, Program,
};
use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::funcword;
use crate::stackinfo::StackInformation;
use crate::value::ExternalValue;
use crate::vm::VM;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Label(usize);


enum FixupKind {
    // 4-byte jump target.
    JumpTarget,
    // 8-byte tagged default-function word.
    FunctionWord,
}


struct Fixup {
    at: usize,
    label: Label,
    kind: FixupKind,
}


struct OpenFunction {
    name: String,
    datatype: Datatype,
    offset: i32,
    stack_size: i32,
    stack_info: StackInformation,
    stack_size_per_ip: HashMap<i32, i32>,
}


pub struct ProgramBuilder {
    code: Vec<u8>,
    labels: Vec<Option<i32>>,
    fixups: Vec<Fixup>,
    functions: Vec<Function>,
    native_functions: Vec<NativeFunction>,
    auxiliary_datatypes: Vec<Datatype>,
    current: Option<OpenFunction>,
}


impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        ProgramBuilder {
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            functions: Vec::new(),
            native_functions: Vec::new(),
            auxiliary_datatypes: Vec::new(),
            current: None,
        }
    }

    pub fn here(&self) -> i32 {
        self.code.len() as i32
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn place(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label placed twice");
        self.labels[label.0] = Some(self.here());
    }

    // Begin a function whose parameters are already on the stack at
    // entry. Returns a label placed at the entry, usable as a call
    // target before or after this point.
    pub fn begin_function(
        &mut self,
        name: &str,
        datatype: Datatype,
        param_names: &[&str],
    ) -> Label {
        self.begin_lambda(name, datatype, param_names, &[])
    }

    // Lambda bodies additionally see their captures above the
    // parameters, copied there by CALL.
    pub fn begin_lambda(
        &mut self,
        name: &str,
        datatype: Datatype,
        param_names: &[&str],
        captures: &[(&str, Datatype)],
    ) -> Label {
        assert!(self.current.is_none(), "function already open");
        let entry = self.here();
        let params = datatype.function_info().1.to_vec();
        assert_eq!(param_names.len(), params.len());

        let mut stack_size = 0;
        for p in &params {
            stack_size += p.size_on_stack();
        }
        for (_, c) in captures {
            stack_size += c.size_on_stack();
        }
        let mut stack_info = StackInformation::new(entry, stack_size);

        let mut at = 0;
        for (pname, pty) in param_names.iter().zip(&params) {
            at += pty.size_on_stack();
            stack_info.add_variable(entry, at, pname, pty.clone());
        }
        for (cname, cty) in captures {
            at += cty.size_on_stack();
            stack_info.add_variable(entry, at, cname, cty.clone());
        }

        self.current = Some(OpenFunction {
            name: name.to_string(),
            datatype,
            offset: entry,
            stack_size,
            stack_info,
            stack_size_per_ip: HashMap::new(),
        });
        let label = self.new_label();
        self.place(label);
        label
    }

    pub fn end_function(&mut self) {
        let here = self.here();
        let mut open = self.current.take().expect("no open function");
        open.stack_info.finish(here);
        self.functions.push(Function {
            name: open.name,
            offset: open.offset,
            length: here - open.offset,
            datatype: open.datatype,
            stack_info: open.stack_info,
            stack_size_per_ip: open.stack_size_per_ip,
        });
    }

    fn open(&mut self) -> &mut OpenFunction {
        self.current.as_mut().expect("no open function")
    }

    pub fn stack_size(&self) -> i32 {
        self.current.as_ref().expect("no open function").stack_size
    }

    // Re-synchronize the tracked frame size at a control-flow join.
    pub fn set_stack_size(&mut self, size: i32) {
        self.open().stack_size = size;
    }

    pub fn begin_scope(&mut self) {
        let here = self.here();
        let size = self.stack_size();
        self.open().stack_info.begin_scope(here, size);
    }

    pub fn end_scope(&mut self) {
        let here = self.here();
        self.open().stack_info.end_scope(here);
    }

    // Bind the value most recently left on the stack. The entry
    // records the frame size including the value, which is how the
    // walker later finds its address.
    pub fn declare_variable(&mut self, name: &str, datatype: Datatype) {
        let here = self.here();
        let size = self.stack_size();
        self.open().stack_info.add_variable(here, size, name, datatype);
    }

    // Record that the bindings above have been physically popped.
    pub fn mark_pop(&mut self) {
        let here = self.here();
        let size = self.stack_size();
        self.open().stack_info.add_pop_marker(here, size);
    }

    fn emit(&mut self, op: Opcode, delta: i32) {
        let here = self.here();
        let open = self.open();
        open.stack_size_per_ip.insert(here, open.stack_size);
        open.stack_size += delta;
        self.code.push(op.into());
    }

    fn operand_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn operand_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push8(&mut self, value: i64) {
        self.emit(Opcode::Push8, 8);
        self.operand_u64(value as u64);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push8(value as i64);
    }

    pub fn push_f64(&mut self, value: f64) {
        self.emit(Opcode::Push8, 8);
        self.operand_u64(value.to_bits());
    }

    // Push the tagged function word for a default function.
    pub fn push_function(&mut self, target: Label) {
        self.emit(Opcode::Push8, 8);
        self.fixups.push(Fixup {
            at: self.code.len(),
            label: target,
            kind: FixupKind::FunctionWord,
        });
        self.operand_u64(0);
    }

    pub fn push_native(&mut self, id: i32) {
        self.emit(Opcode::Push8, 8);
        self.operand_u64(funcword::encode_native(id));
    }

    pub fn repush(&mut self, len: i32, offset: i32) {
        self.emit(Opcode::RepushFromN, len);
        self.operand_i32(len);
        self.operand_i32(offset);
    }

    pub fn pop_below(&mut self, len: i32, offset: i32) {
        self.emit(Opcode::PopNBelow, -len);
        self.operand_i32(len);
        self.operand_i32(offset);
    }

    pub fn jump(&mut self, target: Label) {
        self.emit(Opcode::Jump, 0);
        self.fixups.push(Fixup {
            at: self.code.len(),
            label: target,
            kind: FixupKind::JumpTarget,
        });
        self.operand_i32(0);
    }

    pub fn jump_if_false(&mut self, target: Label) {
        self.emit(Opcode::JumpIfFalse, -8);
        self.fixups.push(Fixup {
            at: self.code.len(),
            label: target,
            kind: FixupKind::JumpTarget,
        });
        self.operand_i32(0);
    }

    // Operand-free opcodes: arithmetic, comparisons, logic, list
    // queries, NOOP and RUN_GC.
    pub fn simple(&mut self, op: Opcode) {
        use Opcode::*;
        let delta = match op {
            Noop | RunGc | ListGetTail | IsListEmpty | LogicalNot => 0,
            AddI32 | SubI32 | MulI32 | DivI32 | ModuloI32 | CompareLtI32
            | CompareLeI32 | CompareGtI32 | CompareGeI32 | CompareEqI32
            | CompareNeI32 | AddI64 | SubI64 | MulI64 | DivI64
            | ModuloI64 | CompareLtI64 | CompareLeI64 | CompareGtI64
            | CompareGeI64 | CompareEqI64 | CompareNeI64 | LogicalAnd
            | LogicalOr => -8,
            other => panic!("{:?} takes operands", other),
        };
        self.emit(op, delta);
    }

    pub fn call(&mut self, arg_bytes: i32, ret_bytes: i32) {
        self.emit(Opcode::Call, ret_bytes - arg_bytes - 8);
        self.operand_i32(arg_bytes);
    }

    pub fn ret(&mut self, ret_bytes: i32) {
        self.emit(Opcode::Return, -8);
        self.operand_i32(ret_bytes);
    }

    pub fn create_lambda(&mut self, capture_bytes: i32, tuple_id: i32) {
        self.emit(Opcode::CreateLambda, -capture_bytes);
        self.operand_i32(capture_bytes);
        self.operand_i32(tuple_id);
    }

    pub fn create_struct_or_enum(&mut self, size: i32) {
        self.emit(Opcode::CreateStructOrEnum, 8 - size);
        self.operand_i32(size);
    }

    pub fn create_list(&mut self, element_size: i32, count: i32) {
        self.emit(Opcode::CreateList, 8 - element_size * count);
        self.operand_i32(element_size);
        self.operand_i32(count);
    }

    pub fn list_prepend(&mut self, element_size: i32) {
        self.emit(Opcode::ListPrepend, -element_size);
        self.operand_i32(element_size);
    }

    pub fn load_from_ptr(&mut self, size: i32, offset: i32) {
        self.emit(Opcode::LoadFromPtr, size - 8);
        self.operand_i32(size);
        self.operand_i32(offset);
    }

    pub fn compare_complex_equality(&mut self, type_id: i32) {
        let size = self.auxiliary_datatypes[type_id as usize].size_on_stack();
        self.emit(Opcode::CompareComplexEquality, 8 - 2 * size);
        self.operand_i32(type_id);
    }

    pub fn increase_stack_size(&mut self, amount: i32) {
        self.emit(Opcode::IncreaseStackSize, amount);
        self.operand_i32(amount);
    }

    pub fn add_auxiliary(&mut self, datatype: Datatype) -> i32 {
        self.auxiliary_datatypes.push(datatype);
        self.auxiliary_datatypes.len() as i32 - 1
    }

    // Native functions must be registered before code referencing
    // their ids is emitted; the id feeds `push_native`.
    pub fn register_native_function<F>(
        &mut self,
        name: &str,
        datatype: Datatype,
        callback: F,
    ) -> i32
    where
        F: Fn(&mut VM, Vec<ExternalValue>) -> Result<ExternalValue> + 'static,
    {
        self.native_functions.push(NativeFunction {
            name: name.to_string(),
            datatype,
            callback: Rc::new(callback) as Rc<NativeCallback>,
        });
        self.native_functions.len() as i32 - 1
    }

    pub fn finish(self) -> Result<Program> {
        assert!(self.current.is_none(), "unfinished function");
        let mut code = self.code;
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or_else(|| {
                Error::Compile("reference to unplaced label".to_string())
            })?;
            match fixup.kind {
                FixupKind::JumpTarget => {
                    code[fixup.at..fixup.at + 4]
                        .copy_from_slice(&target.to_le_bytes());
                }
                FixupKind::FunctionWord => {
                    code[fixup.at..fixup.at + 8].copy_from_slice(
                        &funcword::encode_default(target).to_le_bytes(),
                    );
                }
            }
        }
        Ok(Program {
            code,
            functions: self.functions,
            native_functions: self.native_functions,
            auxiliary_datatypes: self.auxiliary_datatypes,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::funcword::FunctionWord;

    #[test]
    fn labels_resolve_forward_and_backward() {
        let mut b = ProgramBuilder::new();
        let f = b.begin_function(
            "f",
            Datatype::function(Datatype::I32, vec![]),
            &[],
        );
        let end = b.new_label();
        b.jump(end);
        b.place(end);
        b.push_function(f);
        b.ret(8);
        b.end_function();
        let program = b.finish().unwrap();

        // The jump target is the instruction after it.
        assert_eq!(program.read_i32(1).unwrap(), 5);
        // The function word decodes back to the entry ip.
        let word = program.read_u64(6).unwrap();
        assert_eq!(
            FunctionWord::decode(word),
            FunctionWord::Default { entry_ip: 0 }
        );
    }

    #[test]
    fn unplaced_labels_are_a_compile_error() {
        let mut b = ProgramBuilder::new();
        b.begin_function("f", Datatype::function(Datatype::I32, vec![]), &[]);
        let nowhere = b.new_label();
        b.jump(nowhere);
        b.end_function();
        assert!(matches!(b.finish(), Err(Error::Compile(_))));
    }

    #[test]
    fn frame_sizes_are_recorded_per_boundary() {
        let mut b = ProgramBuilder::new();
        b.begin_function(
            "f",
            Datatype::function(Datatype::I32, vec![Datatype::I32]),
            &["x"],
        );
        b.push8(1); // boundary at 0, size 8
        b.simple(Opcode::AddI32); // boundary at 9, size 16
        b.ret(8); // boundary at 10, size 8
        b.end_function();
        let program = b.finish().unwrap();
        let f = program.function("f").unwrap();
        assert_eq!(f.stack_size_per_ip[&0], 8);
        assert_eq!(f.stack_size_per_ip[&9], 16);
        assert_eq!(f.stack_size_per_ip[&10], 8);
        assert_eq!(f.length, 15);
    }

    #[test]
    fn call_tracks_the_replaced_arguments() {
        let mut b = ProgramBuilder::new();
        let f = b.begin_function(
            "f",
            Datatype::function(Datatype::I64, vec![Datatype::I64]),
            &["x"],
        );
        b.ret(8);
        b.end_function();
        b.begin_function("main", Datatype::function(Datatype::I64, vec![]), &[]);
        b.push_function(f);
        b.push8(7);
        assert_eq!(b.stack_size(), 16);
        b.call(8, 8);
        // Argument and function word replaced by the return value.
        assert_eq!(b.stack_size(), 8);
        b.ret(8);
        b.end_function();
        b.finish().unwrap();
    }
}
