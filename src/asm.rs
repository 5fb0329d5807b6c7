// A small line-oriented assembly for the instruction set, used by
// tests and by hosts that want to hand-write bytecode without
// driving the builder directly. One instruction per line, labels as
// `name:`, label references as `%name`, comments from `;` to the end
// of the line.
//
//   fn fib(i32) -> i32
//     repush 8 0
//     ...
//     base:
//     ret 8
//   end

use std::collections::HashMap;

use regex::Regex;

use crate::builder::{Label, ProgramBuilder};
use crate::bytecode::{Opcode, Program};
use crate::datatype::Datatype;
use crate::error::{Error, Result};


lazy_static! {
    static ref FN_RE: Regex = Regex::new(
        r"^fn\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)\s*->\s*(.+)$"
    )
    .unwrap();
    static ref LABEL_RE: Regex =
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*):$").unwrap();
}


fn parse_type(text: &str) -> Result<Datatype> {
    let text = text.trim();
    match text {
        "bool" => Ok(Datatype::Bool),
        "i32" => Ok(Datatype::I32),
        "i64" => Ok(Datatype::I64),
        "f64" => Ok(Datatype::F64),
        "char" => Ok(Datatype::Char),
        "byte" => Ok(Datatype::Byte),
        "()" => Ok(Datatype::empty_tuple()),
        _ => {
            if text.starts_with("list<") && text.ends_with('>') {
                let inner = parse_type(&text[5..text.len() - 1])?;
                Ok(Datatype::list_of(inner))
            } else {
                Err(Error::Compile(format!("unknown type {}", text)))
            }
        }
    }
}

fn parse_params(text: &str) -> Result<Vec<Datatype>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',').map(parse_type).collect()
}

fn parse_int(word: &str, line: usize) -> Result<i64> {
    word.parse().map_err(|_| {
        Error::Compile(format!("line {}: bad integer {}", line, word))
    })
}


struct Assembler {
    builder: ProgramBuilder,
    labels: HashMap<String, Label>,
    in_function: bool,
}


impl Assembler {
    fn label(&mut self, name: &str) -> Label {
        if let Some(label) = self.labels.get(name) {
            return *label;
        }
        let label = self.builder.new_label();
        self.labels.insert(name.to_string(), label);
        label
    }

    fn label_ref(&mut self, word: &str, line: usize) -> Result<Label> {
        if let Some(name) = word.strip_prefix('%') {
            Ok(self.label(name))
        } else {
            Err(Error::Compile(format!(
                "line {}: expected %label, found {}",
                line, word
            )))
        }
    }

    fn operands(
        words: &[&str],
        expected: usize,
        line: usize,
    ) -> Result<Vec<i64>> {
        if words.len() != expected {
            return Err(Error::Compile(format!(
                "line {}: expected {} operands, found {}",
                line,
                expected,
                words.len()
            )));
        }
        words.iter().map(|w| parse_int(w, line)).collect()
    }

    fn instruction(&mut self, words: &[&str], line: usize) -> Result<()> {
        if !self.in_function {
            return Err(Error::Compile(format!(
                "line {}: instruction outside a function",
                line
            )));
        }
        let rest = &words[1..];
        match words[0] {
            "push8" => {
                let ops = Assembler::operands(rest, 1, line)?;
                self.builder.push8(ops[0]);
            }
            "pushfn" => {
                if rest.len() != 1 {
                    return Err(Error::Compile(format!(
                        "line {}: pushfn takes one label",
                        line
                    )));
                }
                let target = self.label_ref(rest[0], line)?;
                self.builder.push_function(target);
            }
            "pushnative" => {
                let ops = Assembler::operands(rest, 1, line)?;
                self.builder.push_native(ops[0] as i32);
            }
            "repush" => {
                let ops = Assembler::operands(rest, 2, line)?;
                self.builder.repush(ops[0] as i32, ops[1] as i32);
            }
            "pop_below" => {
                let ops = Assembler::operands(rest, 2, line)?;
                self.builder.pop_below(ops[0] as i32, ops[1] as i32);
            }
            "jump" | "jump_if_false" => {
                if rest.len() != 1 {
                    return Err(Error::Compile(format!(
                        "line {}: {} takes one label",
                        line, words[0]
                    )));
                }
                let target = self.label_ref(rest[0], line)?;
                if words[0] == "jump" {
                    self.builder.jump(target);
                } else {
                    self.builder.jump_if_false(target);
                }
            }
            "call" => {
                let ops = Assembler::operands(rest, 2, line)?;
                self.builder.call(ops[0] as i32, ops[1] as i32);
            }
            "ret" => {
                let ops = Assembler::operands(rest, 1, line)?;
                self.builder.ret(ops[0] as i32);
            }
            "create_lambda" => {
                let ops = Assembler::operands(rest, 2, line)?;
                self.builder.create_lambda(ops[0] as i32, ops[1] as i32);
            }
            "create_struct_or_enum" => {
                let ops = Assembler::operands(rest, 1, line)?;
                self.builder.create_struct_or_enum(ops[0] as i32);
            }
            "create_list" => {
                let ops = Assembler::operands(rest, 2, line)?;
                self.builder.create_list(ops[0] as i32, ops[1] as i32);
            }
            "list_prepend" => {
                let ops = Assembler::operands(rest, 1, line)?;
                self.builder.list_prepend(ops[0] as i32);
            }
            "load_from_ptr" => {
                let ops = Assembler::operands(rest, 2, line)?;
                self.builder.load_from_ptr(ops[0] as i32, ops[1] as i32);
            }
            "compare_complex_equality" => {
                let ops = Assembler::operands(rest, 1, line)?;
                self.builder.compare_complex_equality(ops[0] as i32);
            }
            "increase_stack_size" => {
                let ops = Assembler::operands(rest, 1, line)?;
                self.builder.increase_stack_size(ops[0] as i32);
            }
            word => {
                let op = simple_opcode(word).ok_or_else(|| {
                    Error::Compile(format!(
                        "line {}: unknown instruction {}",
                        line, word
                    ))
                })?;
                Assembler::operands(rest, 0, line)?;
                self.builder.simple(op);
            }
        }
        Ok(())
    }
}


fn simple_opcode(word: &str) -> Option<Opcode> {
    use Opcode::*;
    Some(match word {
        "noop" => Noop,
        "add_i32" => AddI32,
        "sub_i32" => SubI32,
        "mul_i32" => MulI32,
        "div_i32" => DivI32,
        "modulo_i32" => ModuloI32,
        "compare_lt_i32" => CompareLtI32,
        "compare_le_i32" => CompareLeI32,
        "compare_gt_i32" => CompareGtI32,
        "compare_ge_i32" => CompareGeI32,
        "compare_eq_i32" => CompareEqI32,
        "compare_ne_i32" => CompareNeI32,
        "add_i64" => AddI64,
        "sub_i64" => SubI64,
        "mul_i64" => MulI64,
        "div_i64" => DivI64,
        "modulo_i64" => ModuloI64,
        "compare_lt_i64" => CompareLtI64,
        "compare_le_i64" => CompareLeI64,
        "compare_gt_i64" => CompareGtI64,
        "compare_ge_i64" => CompareGeI64,
        "compare_eq_i64" => CompareEqI64,
        "compare_ne_i64" => CompareNeI64,
        "logical_and" => LogicalAnd,
        "logical_or" => LogicalOr,
        "logical_not" => LogicalNot,
        "list_get_tail" => ListGetTail,
        "is_list_empty" => IsListEmpty,
        "run_gc" => RunGc,
        _ => return None,
    })
}


pub fn parse(source: &str) -> Result<Program> {
    let mut asm = Assembler {
        builder: ProgramBuilder::new(),
        labels: HashMap::new(),
        in_function: false,
    };
    let mut param_names: Vec<String> = Vec::new();

    for (index, raw_line) in source.lines().enumerate() {
        let line = index + 1;
        let text = match raw_line.find(';') {
            Some(at) => &raw_line[..at],
            None => raw_line,
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        if let Some(caps) = FN_RE.captures(text) {
            if asm.in_function {
                return Err(Error::Compile(format!(
                    "line {}: fn inside fn",
                    line
                )));
            }
            let name = caps.get(1).unwrap().as_str();
            let params = parse_params(caps.get(2).unwrap().as_str())?;
            let ret = parse_type(caps.get(3).unwrap().as_str())?;
            param_names = (0..params.len())
                .map(|i| format!("arg{}", i))
                .collect();
            let names: Vec<&str> =
                param_names.iter().map(|s| s.as_str()).collect();
            let entry = asm.builder.begin_function(
                name,
                Datatype::function(ret, params),
                &names,
            );
            // Make the function callable by name from other code,
            // including references parsed before this point.
            match asm.labels.get(name) {
                Some(forward) => asm.builder.place(*forward),
                None => {
                    asm.labels.insert(name.to_string(), entry);
                }
            }
            asm.in_function = true;
            continue;
        }

        if text == "end" {
            if !asm.in_function {
                return Err(Error::Compile(format!(
                    "line {}: end outside a function",
                    line
                )));
            }
            asm.builder.end_function();
            asm.in_function = false;
            continue;
        }

        if let Some(caps) = LABEL_RE.captures(text) {
            let label = asm.label(caps.get(1).unwrap().as_str());
            asm.builder.place(label);
            continue;
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        if words[0] == "!stack" {
            let ops = Assembler::operands(&words[1..], 1, line)?;
            asm.builder.set_stack_size(ops[0] as i32);
            continue;
        }
        asm.instruction(&words, line)?;
    }

    if asm.in_function {
        return Err(Error::Compile("missing end".to_string()));
    }
    asm.builder.finish()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_function() {
        let program = parse(
            r"
            ; add one to the argument
            fn incr(i32) -> i32
              push8 1
              add_i32
              ret 8
            end
            ",
        )
        .unwrap();
        assert_eq!(program.functions.len(), 1);
        let f = program.function("incr").unwrap();
        assert_eq!(f.offset, 0);
        assert_eq!(program.opcode_at(0).unwrap(), Opcode::Push8);
        assert_eq!(program.opcode_at(9).unwrap(), Opcode::AddI32);
        assert_eq!(program.opcode_at(10).unwrap(), Opcode::Return);
    }

    #[test]
    fn labels_and_branches() {
        let program = parse(
            r"
            fn f(bool) -> i32
              jump_if_false %no
              push8 1
              ret 8
              no:
              !stack 0
              push8 0
              ret 8
            end
            ",
        )
        .unwrap();
        // jump_if_false at 0 targets the push8 after the first ret.
        assert_eq!(program.read_i32(1).unwrap(), 19);
    }

    #[test]
    fn functions_can_be_referenced_before_definition() {
        let program = parse(
            r"
            fn main() -> i64
              pushfn %leaf
              call 0 8
              ret 8
            end
            fn leaf() -> i64
              push8 11
              ret 8
            end
            ",
        )
        .unwrap();
        assert_eq!(program.functions.len(), 2);
        let leaf = program.function("leaf").unwrap();
        assert_eq!(leaf.offset, 19);
        let word = program.read_u64(1).unwrap();
        assert_eq!(
            crate::funcword::FunctionWord::decode(word),
            crate::funcword::FunctionWord::Default { entry_ip: 19 }
        );
    }

    #[test]
    fn errors_name_the_line() {
        let err = parse("fn f() -> i32\n  frobnicate\nend").unwrap_err();
        match err {
            Error::Compile(msg) => assert!(msg.contains("line 2")),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn instructions_need_a_function() {
        assert!(matches!(parse("push8 1"), Err(Error::Compile(_))));
        assert!(matches!(parse("fn f() -> i32\npush8 1"), Err(Error::Compile(_))));
    }

    #[test]
    fn unknown_types_are_rejected(){
        assert!(matches!(
            parse("fn f(quux) -> i32\nend"),
            Err(Error::Compile(_))
        ));
    }
}
