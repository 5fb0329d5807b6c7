// Canonical representation of the language's types as the runtime
// sees them: sizes on the stack, box sizes on the heap, structural
// equality. Everything here is immutable after compilation.

use std::rc::Rc;

use enumflags2::BitFlags;

use crate::error::{Error, Result};


// Abstract over various memory management strategies.
type Node<T> = Rc<T>;


// One bit per category so that error reporting can express "expected
// one of" sets.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u16)]
pub enum DatatypeCategory {
    Bool = 0x0001,
    I32 = 0x0002,
    I64 = 0x0004,
    F64 = 0x0008,
    Char = 0x0010,
    Byte = 0x0020,
    Tuple = 0x0040,
    List = 0x0080,
    Struct = 0x0100,
    Enum = 0x0200,
    Function = 0x0400,
    Pointer = 0x0800,
    UndeterminedIdentifier = 0x1000,
}


pub type CategorySet = BitFlags<DatatypeCategory>;


#[derive(Clone, Debug, PartialEq)]
pub struct StructField {
    pub name: String,
    pub datatype: Datatype,
}


#[derive(Clone, Debug, PartialEq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}


#[derive(Clone, Debug, PartialEq)]
pub struct EnumVariant {
    pub name: String,
    pub params: Vec<Datatype>,
}


#[derive(Clone, Debug, PartialEq)]
pub struct EnumType {
    pub name: String,
    pub variants: Vec<EnumVariant>,
}


#[derive(Clone, Debug, PartialEq)]
pub enum Datatype {
    Bool,
    I32,
    I64,
    F64,
    Char,
    Byte,
    Tuple(Vec<Datatype>),
    List(Node<Datatype>),
    Struct(Node<StructType>),
    Enum(Node<EnumType>),
    // Return type first, then the parameter types.
    Function(Node<Datatype>, Vec<Datatype>),
    Pointer(Node<Datatype>),
    // An unresolved name; must not survive monomorphization.
    UndeterminedIdentifier(String),
}


impl Datatype {
    pub fn list_of(element: Datatype) -> Datatype {
        Datatype::List(Node::new(element))
    }

    pub fn pointer_to(base: Datatype) -> Datatype {
        Datatype::Pointer(Node::new(base))
    }

    pub fn function(ret: Datatype, params: Vec<Datatype>) -> Datatype {
        Datatype::Function(Node::new(ret), params)
    }

    pub fn empty_tuple() -> Datatype {
        Datatype::Tuple(Vec::new())
    }

    pub fn category(&self) -> DatatypeCategory {
        match self {
            Datatype::Bool => DatatypeCategory::Bool,
            Datatype::I32 => DatatypeCategory::I32,
            Datatype::I64 => DatatypeCategory::I64,
            Datatype::F64 => DatatypeCategory::F64,
            Datatype::Char => DatatypeCategory::Char,
            Datatype::Byte => DatatypeCategory::Byte,
            Datatype::Tuple(_) => DatatypeCategory::Tuple,
            Datatype::List(_) => DatatypeCategory::List,
            Datatype::Struct(_) => DatatypeCategory::Struct,
            Datatype::Enum(_) => DatatypeCategory::Enum,
            Datatype::Function(_, _) => DatatypeCategory::Function,
            Datatype::Pointer(_) => DatatypeCategory::Pointer,
            Datatype::UndeterminedIdentifier(_) => {
                DatatypeCategory::UndeterminedIdentifier
            }
        }
    }

    // Size of the value's stack representation in the canonical
    // 64-bit mode: every scalar is widened to 8 bytes, aggregates
    // that live on the heap are represented by an 8 byte pointer.
    pub fn size_on_stack(&self) -> i32 {
        match self {
            Datatype::Bool
            | Datatype::I32
            | Datatype::I64
            | Datatype::F64
            | Datatype::Char
            | Datatype::Byte => 8,
            Datatype::Tuple(members) => {
                members.iter().map(|m| m.size_on_stack()).sum()
            }
            Datatype::List(_)
            | Datatype::Struct(_)
            | Datatype::Enum(_)
            | Datatype::Pointer(_) => 8,
            Datatype::Function(_, _) => 8,
            Datatype::UndeterminedIdentifier(name) => {
                panic!("undetermined identifier {} has no stack size", name)
            }
        }
    }

    // Size of the heap box behind a pointer-represented value.
    // Struct boxes are the sum of the field sizes; enum boxes are the
    // 8 byte discriminant plus the largest variant payload, so every
    // value of one enum type has the same box size.
    pub fn boxed_size(&self) -> i32 {
        match self {
            Datatype::Struct(info) => info
                .fields
                .iter()
                .map(|f| f.datatype.size_on_stack())
                .sum(),
            Datatype::Enum(info) => 8 + largest_variant_payload(info),
            Datatype::Pointer(base) => base.size_on_stack(),
            other => panic!("{:?} values are not boxed", other.category()),
        }
    }

    // Fallible companions to the size accessors, for types that
    // arrive through compiler-produced tables (auxiliary datatypes,
    // stack shapes, native signatures). An undetermined identifier
    // anywhere in the size computation is an error, not a panic.
    pub fn checked_size_on_stack(&self) -> Result<i32> {
        match self {
            Datatype::UndeterminedIdentifier(name) => {
                Err(Error::Bytecode(format!(
                    "undetermined identifier {} has no stack size",
                    name
                )))
            }
            Datatype::Tuple(members) => {
                let mut total = 0;
                for member in members {
                    total += member.checked_size_on_stack()?;
                }
                Ok(total)
            }
            other => Ok(other.size_on_stack()),
        }
    }

    pub fn checked_boxed_size(&self) -> Result<i32> {
        match self {
            Datatype::Struct(info) => {
                let mut total = 0;
                for field in &info.fields {
                    total += field.datatype.checked_size_on_stack()?;
                }
                Ok(total)
            }
            Datatype::Enum(info) => {
                let mut largest = 0;
                for variant in &info.variants {
                    let mut payload = 0;
                    for param in &variant.params {
                        payload += param.checked_size_on_stack()?;
                    }
                    largest = largest.max(payload);
                }
                Ok(8 + largest)
            }
            Datatype::Pointer(base) => base.checked_size_on_stack(),
            other => panic!("{:?} values are not boxed", other.category()),
        }
    }

    pub fn list_element(&self) -> &Datatype {
        match self {
            Datatype::List(element) => element,
            other => panic!("{:?} is not a list type", other.category()),
        }
    }

    pub fn pointer_base(&self) -> &Datatype {
        match self {
            Datatype::Pointer(base) => base,
            other => panic!("{:?} is not a pointer type", other.category()),
        }
    }

    pub fn tuple_members(&self) -> &[Datatype] {
        match self {
            Datatype::Tuple(members) => members,
            other => panic!("{:?} is not a tuple type", other.category()),
        }
    }

    pub fn struct_info(&self) -> &StructType {
        match self {
            Datatype::Struct(info) => info,
            other => panic!("{:?} is not a struct type", other.category()),
        }
    }

    pub fn enum_info(&self) -> &EnumType {
        match self {
            Datatype::Enum(info) => info,
            other => panic!("{:?} is not an enum type", other.category()),
        }
    }

    // (return type, parameter types)
    pub fn function_info(&self) -> (&Datatype, &[Datatype]) {
        match self {
            Datatype::Function(ret, params) => (ret, params),
            other => panic!("{:?} is not a function type", other.category()),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self.category(),
            DatatypeCategory::Bool
                | DatatypeCategory::I32
                | DatatypeCategory::I64
                | DatatypeCategory::F64
                | DatatypeCategory::Char
                | DatatypeCategory::Byte
        )
    }
}


pub fn largest_variant_payload(info: &EnumType) -> i32 {
    info.variants
        .iter()
        .map(|v| v.params.iter().map(|p| p.size_on_stack()).sum())
        .max()
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Datatype {
        Datatype::Struct(Node::new(StructType {
            name: "Point".to_string(),
            fields: vec![
                StructField { name: "x".to_string(), datatype: Datatype::I32 },
                StructField { name: "y".to_string(), datatype: Datatype::I32 },
            ],
        }))
    }

    fn option_i32() -> Datatype {
        Datatype::Enum(Node::new(EnumType {
            name: "Option".to_string(),
            variants: vec![
                EnumVariant { name: "None".to_string(), params: vec![] },
                EnumVariant {
                    name: "Some".to_string(),
                    params: vec![Datatype::I32],
                },
            ],
        }))
    }

    #[test]
    fn scalar_sizes_are_widened() {
        for ty in &[
            Datatype::Bool,
            Datatype::I32,
            Datatype::I64,
            Datatype::F64,
            Datatype::Char,
            Datatype::Byte,
        ] {
            assert_eq!(ty.size_on_stack(), 8);
        }
    }

    #[test]
    fn aggregates_are_pointer_sized() {
        assert_eq!(Datatype::list_of(Datatype::I32).size_on_stack(), 8);
        assert_eq!(point().size_on_stack(), 8);
        assert_eq!(option_i32().size_on_stack(), 8);
        assert_eq!(Datatype::pointer_to(Datatype::F64).size_on_stack(), 8);
    }

    #[test]
    fn tuple_size_is_member_sum() {
        let ty = Datatype::Tuple(vec![
            Datatype::I32,
            Datatype::I64,
            Datatype::list_of(Datatype::Char),
        ]);
        assert_eq!(ty.size_on_stack(), 24);
        assert_eq!(Datatype::empty_tuple().size_on_stack(), 0);
    }

    #[test]
    fn box_sizes() {
        assert_eq!(point().boxed_size(), 16);
        // Every Option<i32> box pays for the largest variant.
        assert_eq!(option_i32().boxed_size(), 16);
        assert_eq!(Datatype::pointer_to(Datatype::I64).boxed_size(), 8);
    }

    #[test]
    fn structural_equality() {
        assert_eq!(point(), point());
        assert_ne!(point(), option_i32());
        assert_eq!(
            Datatype::list_of(Datatype::I32),
            Datatype::list_of(Datatype::I32)
        );
        assert_ne!(
            Datatype::list_of(Datatype::I32),
            Datatype::list_of(Datatype::I64)
        );
    }

    #[test]
    fn checked_sizes_reject_undetermined_identifiers() {
        let poisoned = Datatype::Tuple(vec![
            Datatype::I64,
            Datatype::UndeterminedIdentifier("T".to_string()),
        ]);
        assert!(matches!(
            poisoned.checked_size_on_stack(),
            Err(Error::Bytecode(_))
        ));
        assert_eq!(
            Datatype::Tuple(vec![Datatype::I64, Datatype::I32])
                .checked_size_on_stack()
                .unwrap(),
            16
        );

        let holey = Datatype::Struct(Node::new(StructType {
            name: "Holey".to_string(),
            fields: vec![StructField {
                name: "gap".to_string(),
                datatype: Datatype::UndeterminedIdentifier("T".to_string()),
            }],
        }));
        assert!(matches!(
            holey.checked_boxed_size(),
            Err(Error::Bytecode(_))
        ));
        // The slot itself is still pointer-sized.
        assert_eq!(holey.checked_size_on_stack().unwrap(), 8);
        assert_eq!(point().checked_boxed_size().unwrap(), 16);
        assert_eq!(option_i32().checked_boxed_size().unwrap(), 16);
    }

    #[test]
    fn category_sets() {
        let numeric = DatatypeCategory::I32 | DatatypeCategory::I64;
        assert!(numeric.contains(Datatype::I32.category()));
        assert!(!numeric.contains(Datatype::Bool.category()));
    }
}
