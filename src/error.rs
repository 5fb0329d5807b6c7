// Every way a run can fail. All of these are fatal to the in-flight
// `run` call; none of them corrupt the loaded program, so a
// subsequent `run` on the same VM may proceed.

use thiserror::Error;

use crate::datatype::{CategorySet, DatatypeCategory};


#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("function {0} not found")]
    UnknownFunction(String),

    #[error("malformed bytecode: {0}")]
    Bytecode(String),

    #[error("null dereference at ip {0}")]
    NullDeref(i32),

    #[error("division by zero at ip {0}")]
    DivisionByZero(i32),

    #[error("stack overflow")]
    StackOverflow,

    #[error("out of memory")]
    OutOfMemory,

    #[error("type mismatch: expected {expect:?}, got {got:?}")]
    TypeMismatch {
        expect: CategorySet,
        got: DatatypeCategory,
    },

    #[error("not implemented for {0:?} values")]
    Unimplemented(DatatypeCategory),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("bad configuration: {0}")]
    Config(String),
}


pub type Result<T> = core::result::Result<T, Error>;
