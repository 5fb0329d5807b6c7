// (C) 2025 Tern contributors
//
// The virtual machine for a small statically-typed functional
// language.
//
// *Execution model*
//
// A compiled Program is a flat byte string of instructions plus the
// function tables and per-ip stack metadata described in bytecode.rs
// and stackinfo.rs. The VM owns one value stack (a raw byte stack,
// see stack.rs), one two-region copying collector (gc.rs) and an
// instruction pointer, and runs a fetch-decode-dispatch loop until
// the sentinel call record placed by `run` is returned through.
//
// *Calling convention*
//
// A caller pushes the 8-byte function word, then the arguments, and
// issues CALL with the argument byte count. CALL overwrites the
// function word with a call record holding the return ip; lambda
// calls additionally copy the closure's captures on top of the
// arguments. The callee drops its locals and parameters before
// RETURN, whose operand is the distance from the return value down
// to the call record.
//
// *Collection*
//
// RUN_GC is the only collection point. The interpreter gathers the
// typed roots by walking every frame through the stack-shape trees,
// then hands them to the collector; between instructions no
// untracked pointer values survive in interpreter state, so the
// walk is complete by construction.
//
// *Validity*
//
// Runtime failures (unknown opcodes, stack underflow, null
// dereference, division by zero) surface as Error values and abort
// the in-flight `run`. The VM stays usable: the next `run` starts
// from a cleared stack. `run` is not re-entrant; a native callback
// that calls back into `run` gets an error.

use std::ptr;

use tracing::trace;

use crate::bytecode::{Opcode, Program};
use crate::config::VMParameters;
use crate::datatype::{Datatype, DatatypeCategory};
use crate::error::{Error, Result};
use crate::funcword::{self, FunctionWord};
use crate::gc::GC;
use crate::stack::Stack;
use crate::value::{self, ExternalValue};


unsafe fn read_i32_at(at: *const u8) -> i32 {
    (at as *const i32).read_unaligned()
}

unsafe fn read_u64_at(at: *const u8) -> u64 {
    (at as *const u64).read_unaligned()
}

unsafe fn write_i32_at(at: *mut u8, value: i32) {
    (at as *mut i32).write_unaligned(value)
}


pub struct VM {
    program: Program,
    stack: Stack,
    gc: GC,
    ip: i32,
    running: bool,
}


impl VM {
    pub fn new(program: Program, params: VMParameters) -> Result<VM> {
        Ok(VM {
            program,
            stack: Stack::new()?,
            gc: GC::new(&params)?,
            ip: 0,
            running: false,
        })
    }

    // Run the named function to completion and marshal its result
    // back out. Not re-entrant: one top-level run per VM at a time.
    pub fn run(
        &mut self,
        name: &str,
        args: Vec<ExternalValue>,
    ) -> Result<ExternalValue> {
        if self.running {
            return Err(Error::Bytecode(
                "run is not re-entrant".to_string(),
            ));
        }
        self.running = true;
        let result = self.run_inner(name, args);
        self.running = false;
        result
    }

    fn run_inner(
        &mut self,
        name: &str,
        args: Vec<ExternalValue>,
    ) -> Result<ExternalValue> {
        let function = self
            .program
            .function(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
        let entry = function.offset;
        let (ret, params) = function.datatype.function_info();
        let ret = ret.clone();
        let params = params.to_vec();
        if args.len() != params.len() {
            return Err(Error::Bytecode(format!(
                "function {} takes {} arguments, got {}",
                name,
                params.len(),
                args.len()
            )));
        }

        self.stack.clear();
        // The sentinel record: returning through it ends the run.
        self.stack.push(
            &funcword::encode_call_record(self.program.end_ip())
                .to_le_bytes(),
        )?;
        for (param, arg) in params.iter().zip(&args) {
            value::check_argument(param, arg)?;
            let bytes = arg.to_stack_value(&mut self.gc)?;
            self.stack.push(&bytes)?;
        }

        trace!("running {} from ip {}", name, entry);
        self.ip = entry;
        while self.interpret_instruction()? {}
        ExternalValue::wrap_from_ptr(&ret, self.stack.get(0))
    }

    fn require_stack(&self, bytes: i32) -> Result<()> {
        if bytes < 0 || self.stack.size() < bytes as usize {
            Err(Error::Bytecode(format!(
                "stack underflow at ip {}",
                self.ip
            )))
        } else {
            Ok(())
        }
    }

    fn binop_i32<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(i32, i32) -> Result<i64>,
    {
        self.require_stack(16)?;
        let lhs = self.stack.read_i32(8);
        let rhs = self.stack.read_i32(0);
        let result = f(lhs, rhs)?;
        self.stack.pop(16);
        self.stack.push(&result.to_le_bytes())
    }

    fn binop_i64<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(i64, i64) -> Result<i64>,
    {
        self.require_stack(16)?;
        let lhs = self.stack.read_i64(8);
        let rhs = self.stack.read_i64(0);
        let result = f(lhs, rhs)?;
        self.stack.pop(16);
        self.stack.push(&result.to_le_bytes())
    }

    // Dispatch one instruction; false means the sentinel was
    // returned through and the result sits on top of the stack.
    fn interpret_instruction(&mut self) -> Result<bool> {
        let op = self.program.opcode_at(self.ip)?;
        trace!(
            "ip {}: {:?} (stack {} bytes)",
            self.ip,
            op,
            self.stack.size()
        );
        let mut next_ip = self.ip + op.width();
        match op {
            Opcode::Noop => {}
            Opcode::Push1 => {
                let at = (self.ip + 1) as usize;
                let byte = *self.program.code.get(at).ok_or_else(|| {
                    Error::Bytecode(format!("operand at {} out of range", at))
                })?;
                self.stack.push(&[byte])?;
            }
            Opcode::Push4 => {
                let value = self.program.read_i32(self.ip + 1)?;
                self.stack.push(&value.to_le_bytes())?;
            }
            Opcode::Push8 => {
                let value = self.program.read_u64(self.ip + 1)?;
                self.stack.push(&value.to_le_bytes())?;
            }
            Opcode::RepushFromN => {
                let len = self.program.read_i32(self.ip + 1)?;
                let offset = self.program.read_i32(self.ip + 5)?;
                if len < 0 || offset < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative repush operand at ip {}",
                        self.ip
                    )));
                }
                self.require_stack(offset + len)?;
                self.stack.repush(offset as usize, len as usize)?;
            }
            Opcode::PopNBelow => {
                let len = self.program.read_i32(self.ip + 1)?;
                let offset = self.program.read_i32(self.ip + 5)?;
                if len < 0 || offset < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative pop operand at ip {}",
                        self.ip
                    )));
                }
                self.require_stack(offset + len)?;
                self.stack.pop_below(offset as usize, len as usize);
            }
            Opcode::Jump => {
                next_ip = self.program.read_i32(self.ip + 1)?;
            }
            Opcode::JumpIfFalse => {
                self.require_stack(8)?;
                let condition = self.stack.read_u64(0);
                self.stack.pop(8);
                if condition == 0 {
                    next_ip = self.program.read_i32(self.ip + 1)?;
                }
            }
            Opcode::AddI32 => {
                self.binop_i32(|a, b| Ok(a.wrapping_add(b) as i64))?
            }
            Opcode::SubI32 => {
                self.binop_i32(|a, b| Ok(a.wrapping_sub(b) as i64))?
            }
            Opcode::MulI32 => {
                self.binop_i32(|a, b| Ok(a.wrapping_mul(b) as i64))?
            }
            Opcode::DivI32 => {
                let ip = self.ip;
                self.binop_i32(|a, b| {
                    if b == 0 {
                        Err(Error::DivisionByZero(ip))
                    } else {
                        Ok(a.wrapping_div(b) as i64)
                    }
                })?
            }
            Opcode::ModuloI32 => {
                let ip = self.ip;
                self.binop_i32(|a, b| {
                    if b == 0 {
                        Err(Error::DivisionByZero(ip))
                    } else {
                        Ok(a.wrapping_rem(b) as i64)
                    }
                })?
            }
            Opcode::CompareLtI32 => {
                self.binop_i32(|a, b| Ok((a < b) as i64))?
            }
            Opcode::CompareLeI32 => {
                self.binop_i32(|a, b| Ok((a <= b) as i64))?
            }
            Opcode::CompareGtI32 => {
                self.binop_i32(|a, b| Ok((a > b) as i64))?
            }
            Opcode::CompareGeI32 => {
                self.binop_i32(|a, b| Ok((a >= b) as i64))?
            }
            Opcode::CompareEqI32 => {
                self.binop_i32(|a, b| Ok((a == b) as i64))?
            }
            Opcode::CompareNeI32 => {
                self.binop_i32(|a, b| Ok((a != b) as i64))?
            }
            Opcode::AddI64 => {
                self.binop_i64(|a, b| Ok(a.wrapping_add(b)))?
            }
            Opcode::SubI64 => {
                self.binop_i64(|a, b| Ok(a.wrapping_sub(b)))?
            }
            Opcode::MulI64 => {
                self.binop_i64(|a, b| Ok(a.wrapping_mul(b)))?
            }
            Opcode::DivI64 => {
                let ip = self.ip;
                self.binop_i64(|a, b| {
                    if b == 0 {
                        Err(Error::DivisionByZero(ip))
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?
            }
            Opcode::ModuloI64 => {
                let ip = self.ip;
                self.binop_i64(|a, b| {
                    if b == 0 {
                        Err(Error::DivisionByZero(ip))
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?
            }
            Opcode::CompareLtI64 => {
                self.binop_i64(|a, b| Ok((a < b) as i64))?
            }
            Opcode::CompareLeI64 => {
                self.binop_i64(|a, b| Ok((a <= b) as i64))?
            }
            Opcode::CompareGtI64 => {
                self.binop_i64(|a, b| Ok((a > b) as i64))?
            }
            Opcode::CompareGeI64 => {
                self.binop_i64(|a, b| Ok((a >= b) as i64))?
            }
            Opcode::CompareEqI64 => {
                self.binop_i64(|a, b| Ok((a == b) as i64))?
            }
            Opcode::CompareNeI64 => {
                self.binop_i64(|a, b| Ok((a != b) as i64))?
            }
            Opcode::LogicalAnd => {
                self.binop_i64(|a, b| Ok((a != 0 && b != 0) as i64))?
            }
            Opcode::LogicalOr => {
                self.binop_i64(|a, b| Ok((a != 0 || b != 0) as i64))?
            }
            Opcode::LogicalNot => {
                self.require_stack(8)?;
                let value = self.stack.read_u64(0);
                self.stack.pop(8);
                self.stack.push(&((value == 0) as i64).to_le_bytes())?;
            }
            Opcode::Call => {
                let arg_bytes = self.program.read_i32(self.ip + 1)?;
                if arg_bytes < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative call operand at ip {}",
                        self.ip
                    )));
                }
                self.require_stack(arg_bytes + 8)?;
                let return_ip = self.ip + op.width();
                let word = self.stack.read_u64(arg_bytes as usize);
                match FunctionWord::decode(word) {
                    FunctionWord::Default { entry_ip } => {
                        self.stack.write_u64(
                            arg_bytes as usize,
                            funcword::encode_call_record(return_ip),
                        );
                        next_ip = entry_ip;
                    }
                    FunctionWord::Native { id } => {
                        self.exec_native_function(id)?;
                    }
                    FunctionWord::Lambda { ptr } => {
                        if ptr.is_null() {
                            return Err(Error::Bytecode(format!(
                                "call through null function word at ip {}",
                                self.ip
                            )));
                        }
                        let capture_bytes = unsafe { read_i32_at(ptr) };
                        let entry_ip = unsafe { read_i32_at(ptr.add(4)) };
                        if capture_bytes < 0 {
                            return Err(Error::Bytecode(
                                "corrupt lambda header".to_string(),
                            ));
                        }
                        self.stack.write_u64(
                            arg_bytes as usize,
                            funcword::encode_call_record(return_ip),
                        );
                        if capture_bytes > 0 {
                            let captures = unsafe {
                                std::slice::from_raw_parts(
                                    ptr.add(16),
                                    capture_bytes as usize,
                                )
                            };
                            self.stack.push(captures)?;
                        }
                        next_ip = entry_ip;
                    }
                }
            }
            Opcode::Return => {
                let offset = self.program.read_i32(self.ip + 1)?;
                if offset < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative return operand at ip {}",
                        self.ip
                    )));
                }
                self.require_stack(offset + 8)?;
                let record = self.stack.read_u64(offset as usize);
                let return_ip = funcword::call_record_return_ip(record);
                self.stack.pop_below(offset as usize, 8);
                if return_ip == self.program.end_ip() {
                    self.ip = return_ip;
                    return Ok(false);
                }
                next_ip = return_ip;
            }
            Opcode::CreateLambda => {
                let capture_bytes = self.program.read_i32(self.ip + 1)?;
                let tuple_id = self.program.read_i32(self.ip + 5)?;
                if capture_bytes < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative capture size at ip {}",
                        self.ip
                    )));
                }
                self.require_stack(capture_bytes + 8)?;
                let word = self.stack.read_u64(0);
                let entry_ip = match FunctionWord::decode(word) {
                    FunctionWord::Default { entry_ip } => entry_ip,
                    _ => {
                        return Err(Error::Bytecode(format!(
                            "CREATE_LAMBDA needs a default function word \
                             at ip {}",
                            self.ip
                        )))
                    }
                };
                let closure = self.gc.alloc(16 + capture_bytes)?;
                unsafe {
                    write_i32_at(closure, capture_bytes);
                    write_i32_at(closure.add(4), entry_ip);
                    write_i32_at(closure.add(8), tuple_id);
                    write_i32_at(closure.add(12), 1);
                    ptr::copy_nonoverlapping(
                        self.stack.get(8),
                        closure.add(16),
                        capture_bytes as usize,
                    );
                }
                self.stack.pop(capture_bytes as usize + 8);
                self.stack
                    .push(&(closure as usize as u64).to_le_bytes())?;
            }
            Opcode::CreateStructOrEnum => {
                let size = self.program.read_i32(self.ip + 1)?;
                self.require_stack(size)?;
                let data = self.gc.alloc(size)?;
                unsafe {
                    ptr::copy_nonoverlapping(
                        self.stack.get(0),
                        data,
                        size as usize,
                    );
                }
                self.stack.pop(size as usize);
                self.stack.push(&(data as usize as u64).to_le_bytes())?;
            }
            Opcode::CreateList => {
                let element_size = self.program.read_i32(self.ip + 1)?;
                let count = self.program.read_i32(self.ip + 5)?;
                if element_size < 0 || count < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative list operand at ip {}",
                        self.ip
                    )));
                }
                self.require_stack(element_size * count)?;
                let mut first: *mut u8 = ptr::null_mut();
                let mut previous: *mut u8 = ptr::null_mut();
                for i in 0..count {
                    // Top of stack is the last element.
                    let at = ((count - 1 - i) * element_size) as usize;
                    let cell = self.gc.alloc(8 + element_size)?;
                    if first.is_null() {
                        first = cell;
                    }
                    unsafe {
                        ptr::copy_nonoverlapping(
                            self.stack.get(at),
                            cell.add(8),
                            element_size as usize,
                        );
                        if !previous.is_null() {
                            (previous as *mut u64)
                                .write_unaligned(cell as usize as u64);
                        }
                    }
                    previous = cell;
                }
                if !previous.is_null() {
                    unsafe {
                        (previous as *mut u64).write_unaligned(0);
                    }
                }
                self.stack.pop((element_size * count) as usize);
                self.stack.push(&(first as usize as u64).to_le_bytes())?;
            }
            Opcode::ListPrepend => {
                let element_size = self.program.read_i32(self.ip + 1)?;
                if element_size < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative element size at ip {}",
                        self.ip
                    )));
                }
                self.require_stack(element_size + 8)?;
                let cell = self.gc.alloc(8 + element_size)?;
                unsafe {
                    // Top is the tail pointer, the element below it.
                    ptr::copy_nonoverlapping(self.stack.get(0), cell, 8);
                    ptr::copy_nonoverlapping(
                        self.stack.get(8),
                        cell.add(8),
                        element_size as usize,
                    );
                }
                self.stack.pop(element_size as usize + 8);
                self.stack.push(&(cell as usize as u64).to_le_bytes())?;
            }
            Opcode::ListGetTail => {
                self.require_stack(8)?;
                let head = self.stack.read_u64(0);
                if head != 0 {
                    let next =
                        unsafe { read_u64_at(head as usize as *const u8) };
                    self.stack.write_u64(0, next);
                }
            }
            Opcode::IsListEmpty => {
                self.require_stack(8)?;
                let head = self.stack.read_u64(0);
                self.stack.pop(8);
                self.stack.push(&((head == 0) as i64).to_le_bytes())?;
            }
            Opcode::LoadFromPtr => {
                let size = self.program.read_i32(self.ip + 1)?;
                let offset = self.program.read_i32(self.ip + 5)?;
                if size < 0 || offset < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative load operand at ip {}",
                        self.ip
                    )));
                }
                self.require_stack(8)?;
                let pointer = self.stack.read_u64(0);
                if pointer == 0 {
                    return Err(Error::NullDeref(self.ip));
                }
                self.stack.pop(8);
                let source = unsafe {
                    std::slice::from_raw_parts(
                        (pointer as usize as *const u8)
                            .add(offset as usize),
                        size as usize,
                    )
                };
                self.stack.push(source)?;
            }
            Opcode::CompareComplexEquality => {
                let type_id = self.program.read_i32(self.ip + 1)?;
                let datatype = self.program.auxiliary(type_id)?.clone();
                // The table is plain data; an unresolved identifier
                // in it must not take the VM down.
                let size = datatype.checked_size_on_stack()?;
                self.require_stack(2 * size)?;
                let equal = complex_equal(
                    &datatype,
                    self.stack.get(size as usize),
                    self.stack.get(0),
                )?;
                self.stack.pop(2 * size as usize);
                self.stack.push(&(equal as i64).to_le_bytes())?;
            }
            Opcode::IncreaseStackSize => {
                let amount = self.program.read_i32(self.ip + 1)?;
                if amount < 0 {
                    return Err(Error::Bytecode(format!(
                        "negative stack growth at ip {}",
                        self.ip
                    )));
                }
                self.stack.grow(amount as usize)?;
            }
            Opcode::RunGc => {
                if self.gc.request_collection() {
                    self.run_collection()?;
                }
            }
        }
        self.ip = next_ip;
        Ok(true)
    }

    fn exec_native_function(&mut self, id: i32) -> Result<()> {
        let native = self
            .program
            .native_functions
            .get(id as usize)
            .ok_or_else(|| {
                Error::Bytecode(format!("native function {} missing", id))
            })?;
        let callback = native.callback.clone();
        let (ret, params) = native.datatype.function_info();
        let ret = ret.clone();
        let params = params.to_vec();

        let mut sizes = Vec::with_capacity(params.len());
        for param in &params {
            sizes.push(param.checked_size_on_stack()?);
        }
        let total: i32 = sizes.iter().sum();
        let ret_size = ret.checked_size_on_stack()?;
        self.require_stack(total + 8)?;
        let mut values = Vec::with_capacity(params.len());
        let mut offset = 0;
        for (param, size) in params.iter().zip(&sizes) {
            offset += size;
            values.push(ExternalValue::wrap_from_ptr(
                param,
                self.stack.get((total - offset) as usize),
            )?);
        }
        self.stack.pop(total as usize);

        let result = callback(self, values)?;
        value::check_argument(&ret, &result)?;
        let bytes = result.to_stack_value(&mut self.gc)?;
        if !bytes.is_empty() {
            self.stack.push(&bytes)?;
        }
        // Drop the function word sitting below the result.
        self.stack.pop_below(ret_size as usize, 8);
        Ok(())
    }

    fn run_collection(&mut self) -> Result<()> {
        let mut roots: Vec<(*mut u8, Datatype)> = Vec::new();
        self.generate_stacktrace(
            |pointer, datatype, _| {
                roots.push((pointer as *mut u8, datatype.clone()))
            },
            |_| {},
        )?;
        self.gc.collect(&roots, &self.program)
    }

    // Walk the frames from the current ip outward, reporting each
    // function and every live variable with its address and type.
    // This is both the debugging stacktrace and the collector's
    // root set.
    pub fn generate_stacktrace<V, F>(
        &self,
        mut variable_cb: V,
        mut function_cb: F,
    ) -> Result<()>
    where
        V: FnMut(*const u8, &Datatype, &str),
        F: FnMut(&str),
    {
        let mut ip = self.ip;
        let mut offset_from_top: i32 = 0;
        let mut first = true;
        loop {
            let function = match self.program.function_at_ip(ip) {
                Some(f) => f,
                None => return Ok(()),
            };
            function_cb(&function.name);
            let frame_size = *function
                .stack_size_per_ip
                .get(&ip)
                .ok_or_else(|| {
                    Error::Bytecode(format!(
                        "no frame size recorded at ip {}",
                        ip
                    ))
                })?;

            let mut node = function.stack_info.best_node_for_ip(ip);
            let mut after_pop = false;
            while let Some(index) = node {
                let n = function.stack_info.node(index);
                if n.at_pop {
                    after_pop = true;
                }
                if let Some(variable) = &n.variable {
                    // In outer frames, a binding recorded at the
                    // return ip is the in-flight call's result; it
                    // does not exist yet.
                    if !after_pop && (first || n.start_ip != ip) {
                        let at = frame_size - n.stack_size
                            + offset_from_top;
                        if at < 0 || at as usize > self.stack.size() {
                            return Err(Error::Bytecode(format!(
                                "stack shape points outside the stack \
                                 at ip {}",
                                ip
                            )));
                        }
                        variable_cb(
                            self.stack.get(at as usize),
                            &variable.datatype,
                            &variable.name,
                        );
                    }
                }
                node = match n.prev_sibling {
                    Some(previous) => Some(previous),
                    None => {
                        after_pop = false;
                        n.parent
                    }
                };
            }

            let record_at = offset_from_top + frame_size;
            if (record_at + 8) as usize > self.stack.size() {
                return Err(Error::Bytecode(
                    "stack walk ran off the stack".to_string(),
                ));
            }
            let caller_ip = funcword::call_record_return_ip(
                self.stack.read_u64(record_at as usize),
            );
            if caller_ip == self.program.end_ip() {
                return Ok(());
            }
            let ret_size = function
                .datatype
                .function_info()
                .0
                .checked_size_on_stack()?;
            offset_from_top = record_at + 8 - ret_size;
            ip = caller_ip;
            first = false;
        }
    }

    // Build a list value on the VM heap, for handing lists in as
    // arguments. The returned pointer is subject to collection like
    // any other.
    pub fn make_list(
        &mut self,
        element: Datatype,
        items: Vec<ExternalValue>,
    ) -> Result<ExternalValue> {
        let element_size = element.checked_size_on_stack()? as usize;
        let mut head: u64 = 0;
        for item in items.iter().rev() {
            value::check_argument(&element, item)?;
            let payload = item.to_stack_value(&mut self.gc)?;
            let cell = self.gc.alloc(8 + element_size as i32)?;
            unsafe {
                ptr::copy_nonoverlapping(
                    head.to_le_bytes().as_ptr(),
                    cell,
                    8,
                );
                ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    cell.add(8),
                    element_size,
                );
            }
            head = cell as usize as u64;
        }
        Ok(ExternalValue::List {
            ptr: head as usize as *const u8,
            element,
        })
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn ip(&self) -> i32 {
        self.ip
    }

    pub fn gc(&self) -> &GC {
        &self.gc
    }
}


// Structural equality for COMPARE_COMPLEX_EQUALITY. Scalars and
// lists are supported; everything else is a deliberate gap that
// surfaces as Unimplemented.
fn complex_equal(
    datatype: &Datatype,
    a: *const u8,
    b: *const u8,
) -> Result<bool> {
    match datatype.category() {
        DatatypeCategory::I32 | DatatypeCategory::Char => unsafe {
            Ok(read_i32_at(a) == read_i32_at(b))
        },
        DatatypeCategory::Bool | DatatypeCategory::Byte
        | DatatypeCategory::I64 => unsafe {
            Ok(read_u64_at(a) == read_u64_at(b))
        },
        DatatypeCategory::F64 => unsafe {
            Ok(f64::from_bits(read_u64_at(a))
                == f64::from_bits(read_u64_at(b)))
        },
        DatatypeCategory::List => {
            let element = datatype.list_element();
            let mut left = unsafe { read_u64_at(a) } as usize as *const u8;
            let mut right = unsafe { read_u64_at(b) } as usize as *const u8;
            loop {
                if left.is_null() && right.is_null() {
                    return Ok(true);
                }
                if left.is_null() || right.is_null() {
                    return Ok(false);
                }
                if !complex_equal(element, unsafe { left.add(8) }, unsafe {
                    right.add(8)
                })? {
                    return Ok(false);
                }
                left = unsafe { read_u64_at(left) } as usize as *const u8;
                right = unsafe { read_u64_at(right) } as usize as *const u8;
            }
        }
        other => Err(Error::Unimplemented(other)),
    }
}
