// Marshalling between host values and the VM's stack and heap
// representations. `to_stack_value` produces the exact byte string a
// value occupies on the stack (allocating heap boxes where the
// representation is a pointer); `wrap_from_ptr` reads one back from
// a stack slot or box interior.
//
// A wrapped List holds a raw heap pointer. Like every heap pointer
// seen by native code, it is only valid until the next collection.

use std::char;
use std::fmt;

use enumflags2::BitFlags;

use crate::datatype::{Datatype, DatatypeCategory};
use crate::error::{Error, Result};
use crate::gc::GC;


#[derive(Clone, Debug, PartialEq)]
pub enum ExternalValue {
    Unit,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Byte(u8),
    // A UTF-32 code point.
    Char(u32),
    Tuple(Vec<ExternalValue>),
    List { ptr: *const u8, element: Datatype },
    // Convenience over list<char>.
    Str(String),
    // Convenience over list<byte>.
    ByteArray(Vec<u8>),
    Struct {
        datatype: Datatype,
        fields: Vec<(String, ExternalValue)>,
    },
    Enum {
        datatype: Datatype,
        variant: String,
        elements: Vec<ExternalValue>,
    },
    FunctionRef(i64),
}


unsafe fn read_ptr(at: *const u8) -> *const u8 {
    (at as *const *const u8).read_unaligned()
}

unsafe fn read_u64_at(at: *const u8) -> u64 {
    (at as *const u64).read_unaligned()
}

unsafe fn read_i64_at(at: *const u8) -> i64 {
    (at as *const i64).read_unaligned()
}

unsafe fn read_i32_at(at: *const u8) -> i32 {
    (at as *const i32).read_unaligned()
}

unsafe fn read_u32_at(at: *const u8) -> u32 {
    (at as *const u32).read_unaligned()
}


fn mismatch(expect: DatatypeCategory, got: &ExternalValue) -> Error {
    Error::TypeMismatch {
        expect: BitFlags::from_flag(expect),
        got: got.datatype().category(),
    }
}


impl ExternalValue {
    // The datatype this value marshals as. A FunctionRef only knows
    // its id, so its signature comes back empty.
    pub fn datatype(&self) -> Datatype {
        match self {
            ExternalValue::Unit => Datatype::empty_tuple(),
            ExternalValue::Bool(_) => Datatype::Bool,
            ExternalValue::I32(_) => Datatype::I32,
            ExternalValue::I64(_) => Datatype::I64,
            ExternalValue::F64(_) => Datatype::F64,
            ExternalValue::Byte(_) => Datatype::Byte,
            ExternalValue::Char(_) => Datatype::Char,
            ExternalValue::Tuple(children) => {
                Datatype::Tuple(children.iter().map(|c| c.datatype()).collect())
            }
            ExternalValue::List { element, .. } => {
                Datatype::list_of(element.clone())
            }
            ExternalValue::Str(_) => Datatype::list_of(Datatype::Char),
            ExternalValue::ByteArray(_) => Datatype::list_of(Datatype::Byte),
            ExternalValue::Struct { datatype, .. } => datatype.clone(),
            ExternalValue::Enum { datatype, .. } => datatype.clone(),
            ExternalValue::FunctionRef(_) => {
                Datatype::function(Datatype::empty_tuple(), vec![])
            }
        }
    }

    // The byte string this value occupies on the stack, lowest
    // address (top of stack) first. Pointer-represented values
    // allocate their boxes through the collector.
    pub fn to_stack_value(&self, gc: &mut GC) -> Result<Vec<u8>> {
        match self {
            ExternalValue::Unit => Ok(Vec::new()),
            ExternalValue::Bool(v) => Ok((*v as i64).to_le_bytes().to_vec()),
            ExternalValue::I32(v) => {
                let mut bytes = vec![0u8; 8];
                bytes[..4].copy_from_slice(&v.to_le_bytes());
                Ok(bytes)
            }
            ExternalValue::I64(v) => Ok(v.to_le_bytes().to_vec()),
            ExternalValue::F64(v) => Ok(v.to_bits().to_le_bytes().to_vec()),
            ExternalValue::Byte(v) => {
                let mut bytes = vec![0u8; 8];
                bytes[0] = *v;
                Ok(bytes)
            }
            ExternalValue::Char(v) => {
                let mut bytes = vec![0u8; 8];
                bytes[..4].copy_from_slice(&v.to_le_bytes());
                Ok(bytes)
            }
            ExternalValue::Tuple(children) => {
                // The last member sits on top of the stack, which is
                // the lowest address.
                let mut bytes = Vec::new();
                for child in children.iter().rev() {
                    bytes.extend(child.to_stack_value(gc)?);
                }
                Ok(bytes)
            }
            ExternalValue::List { ptr, .. } => {
                Ok((*ptr as usize as u64).to_le_bytes().to_vec())
            }
            ExternalValue::Str(s) => {
                let payloads = s.chars().rev().map(|c| {
                    let mut payload = vec![0u8; 8];
                    payload[..4].copy_from_slice(&(c as u32).to_le_bytes());
                    payload
                });
                build_list(gc, payloads)
            }
            ExternalValue::ByteArray(bytes) => {
                let payloads = bytes.iter().rev().map(|b| {
                    let mut payload = vec![0u8; 8];
                    payload[0] = *b;
                    payload
                });
                build_list(gc, payloads)
            }
            ExternalValue::Struct { datatype, fields } => {
                let info = datatype.struct_info();
                if fields.len() != info.fields.len() {
                    return Err(Error::Bytecode(format!(
                        "struct {} expects {} fields, got {}",
                        info.name,
                        info.fields.len(),
                        fields.len()
                    )));
                }
                let size = datatype.checked_boxed_size()? as usize;
                let mut bytes = vec![0u8; size];
                let mut offset = size;
                for ((_, value), decl) in fields.iter().zip(&info.fields) {
                    let child = value.to_stack_value(gc)?;
                    if child.len()
                        != decl.datatype.checked_size_on_stack()? as usize
                    {
                        return Err(mismatch(decl.datatype.category(), value));
                    }
                    offset -= child.len();
                    bytes[offset..offset + child.len()]
                        .copy_from_slice(&child);
                }
                box_bytes(gc, &bytes)
            }
            ExternalValue::Enum { datatype, variant, elements } => {
                let info = datatype.enum_info();
                let (index, decl) = info
                    .variants
                    .iter()
                    .enumerate()
                    .find(|(_, v)| v.name == *variant)
                    .ok_or_else(|| {
                        Error::Bytecode(format!(
                            "enum {} has no variant {}",
                            info.name, variant
                        ))
                    })?;
                if elements.len() != decl.params.len() {
                    return Err(Error::Bytecode(format!(
                        "variant {}::{} expects {} elements, got {}",
                        info.name,
                        variant,
                        decl.params.len(),
                        elements.len()
                    )));
                }
                let size = datatype.checked_boxed_size()? as usize;
                let mut bytes = vec![0u8; size];
                bytes[..8].copy_from_slice(&(index as i64).to_le_bytes());
                let mut offset = size;
                for (value, pty) in elements.iter().zip(&decl.params) {
                    let child = value.to_stack_value(gc)?;
                    if child.len() != pty.checked_size_on_stack()? as usize {
                        return Err(mismatch(pty.category(), value));
                    }
                    offset -= child.len();
                    bytes[offset..offset + child.len()]
                        .copy_from_slice(&child);
                }
                box_bytes(gc, &bytes)
            }
            ExternalValue::FunctionRef(v) => Ok(v.to_le_bytes().to_vec()),
        }
    }

    // Read a value of the given type back out of memory. `ptr` names
    // the stack slot (or box interior) where its representation
    // starts.
    pub fn wrap_from_ptr(
        datatype: &Datatype,
        ptr: *const u8,
    ) -> Result<ExternalValue> {
        match datatype {
            Datatype::Bool => {
                Ok(ExternalValue::Bool(unsafe { read_u64_at(ptr) } != 0))
            }
            Datatype::I32 => {
                Ok(ExternalValue::I32(unsafe { read_i32_at(ptr) }))
            }
            Datatype::I64 => {
                Ok(ExternalValue::I64(unsafe { read_i64_at(ptr) }))
            }
            Datatype::F64 => Ok(ExternalValue::F64(f64::from_bits(unsafe {
                read_u64_at(ptr)
            }))),
            Datatype::Byte => {
                Ok(ExternalValue::Byte(unsafe { ptr.read() }))
            }
            Datatype::Char => {
                Ok(ExternalValue::Char(unsafe { read_u32_at(ptr) }))
            }
            Datatype::Tuple(members) => {
                if members.is_empty() {
                    return Ok(ExternalValue::Unit);
                }
                let mut children = Vec::with_capacity(members.len());
                let mut at = ptr;
                for member in members.iter().rev() {
                    children.push(ExternalValue::wrap_from_ptr(member, at)?);
                    at = unsafe {
                        at.add(member.checked_size_on_stack()? as usize)
                    };
                }
                children.reverse();
                Ok(ExternalValue::Tuple(children))
            }
            Datatype::List(element) => Ok(ExternalValue::List {
                ptr: unsafe { read_ptr(ptr) },
                element: (**element).clone(),
            }),
            Datatype::Struct(info) => {
                let boxp = unsafe { read_ptr(ptr) };
                if boxp.is_null() {
                    return Err(Error::Bytecode(
                        "null struct box".to_string(),
                    ));
                }
                let mut fields = Vec::with_capacity(info.fields.len());
                let mut offset = datatype.checked_boxed_size()?;
                for field in &info.fields {
                    offset -= field.datatype.checked_size_on_stack()?;
                    fields.push((
                        field.name.clone(),
                        ExternalValue::wrap_from_ptr(&field.datatype, unsafe {
                            boxp.add(offset as usize)
                        })?,
                    ));
                }
                Ok(ExternalValue::Struct {
                    datatype: datatype.clone(),
                    fields,
                })
            }
            Datatype::Enum(info) => {
                let boxp = unsafe { read_ptr(ptr) };
                if boxp.is_null() {
                    return Err(Error::Bytecode("null enum box".to_string()));
                }
                let index = unsafe { read_i64_at(boxp) };
                let variant =
                    info.variants.get(index as usize).ok_or_else(|| {
                        Error::Bytecode(format!(
                            "enum {} has no variant {}",
                            info.name, index
                        ))
                    })?;
                let mut elements = Vec::with_capacity(variant.params.len());
                let mut offset = datatype.checked_boxed_size()?;
                for param in &variant.params {
                    offset -= param.checked_size_on_stack()?;
                    elements.push(ExternalValue::wrap_from_ptr(
                        param,
                        unsafe { boxp.add(offset as usize) },
                    )?);
                }
                Ok(ExternalValue::Enum {
                    datatype: datatype.clone(),
                    variant: variant.name.clone(),
                    elements,
                })
            }
            Datatype::Function(_, _) => {
                Ok(ExternalValue::FunctionRef(unsafe { read_i64_at(ptr) }))
            }
            Datatype::Pointer(_) => {
                Err(Error::Unimplemented(DatatypeCategory::Pointer))
            }
            Datatype::UndeterminedIdentifier(name) => Err(Error::Bytecode(
                format!("undetermined identifier {}", name),
            )),
        }
    }

    // Collect the elements of a wrapped list.
    pub fn list_items(&self) -> Result<Vec<ExternalValue>> {
        match self {
            ExternalValue::List { ptr, element } => {
                let mut items = Vec::new();
                let mut cell = *ptr;
                while !cell.is_null() {
                    items.push(ExternalValue::wrap_from_ptr(element, unsafe {
                        cell.add(8)
                    })?);
                    cell = unsafe { read_ptr(cell) };
                }
                Ok(items)
            }
            other => Err(mismatch(DatatypeCategory::List, other)),
        }
    }

    // Decode a list<char> into a host string.
    pub fn as_string(&self) -> Result<String> {
        match self {
            ExternalValue::Str(s) => Ok(s.clone()),
            ExternalValue::List { ptr, element }
                if *element == Datatype::Char =>
            {
                let mut out = String::new();
                let mut cell = *ptr;
                while !cell.is_null() {
                    let code = unsafe { read_u32_at(cell.add(8)) };
                    let c = char::from_u32(code).ok_or_else(|| {
                        Error::Bytecode(format!(
                            "invalid code point {:#x}",
                            code
                        ))
                    })?;
                    out.push(c);
                    cell = unsafe { read_ptr(cell) };
                }
                Ok(out)
            }
            other => Err(mismatch(DatatypeCategory::List, other)),
        }
    }
}


fn build_list<I>(gc: &mut GC, reversed_payloads: I) -> Result<Vec<u8>>
where
    I: Iterator<Item = Vec<u8>>,
{
    let mut head: u64 = 0;
    for payload in reversed_payloads {
        let cell = gc.alloc(8 + payload.len() as i32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                head.to_le_bytes().as_ptr(),
                cell,
                8,
            );
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                cell.add(8),
                payload.len(),
            );
        }
        head = cell as usize as u64;
    }
    Ok(head.to_le_bytes().to_vec())
}

fn box_bytes(gc: &mut GC, bytes: &[u8]) -> Result<Vec<u8>> {
    let boxp = gc.alloc(bytes.len() as i32)?;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), boxp, bytes.len());
    }
    Ok((boxp as usize as u64).to_le_bytes().to_vec())
}


// Reject an argument whose marshalled shape does not match the
// declared parameter type.
pub fn check_argument(
    expected: &Datatype,
    value: &ExternalValue,
) -> Result<()> {
    let ok = match (expected, value) {
        (Datatype::Bool, ExternalValue::Bool(_)) => true,
        (Datatype::I32, ExternalValue::I32(_)) => true,
        (Datatype::I64, ExternalValue::I64(_)) => true,
        (Datatype::F64, ExternalValue::F64(_)) => true,
        (Datatype::Byte, ExternalValue::Byte(_)) => true,
        (Datatype::Char, ExternalValue::Char(_)) => true,
        (Datatype::Tuple(members), ExternalValue::Unit) => members.is_empty(),
        (Datatype::Tuple(members), ExternalValue::Tuple(children)) => {
            members.len() == children.len()
                && members
                    .iter()
                    .zip(children)
                    .all(|(m, c)| check_argument(m, c).is_ok())
        }
        (Datatype::List(e), ExternalValue::List { element, .. }) => {
            **e == *element
        }
        (Datatype::List(e), ExternalValue::Str(_)) => **e == Datatype::Char,
        (Datatype::List(e), ExternalValue::ByteArray(_)) => {
            **e == Datatype::Byte
        }
        (Datatype::Struct(_), ExternalValue::Struct { datatype, .. }) => {
            expected == datatype
        }
        (Datatype::Enum(_), ExternalValue::Enum { datatype, .. }) => {
            expected == datatype
        }
        (Datatype::Function(_, _), ExternalValue::FunctionRef(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(mismatch(expected.category(), value))
    }
}


impl fmt::Display for ExternalValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExternalValue::Unit => write!(f, "()"),
            ExternalValue::Bool(v) => write!(f, "{}", v),
            ExternalValue::I32(v) => write!(f, "{}", v),
            ExternalValue::I64(v) => write!(f, "{}i64", v),
            ExternalValue::F64(v) => write!(f, "{}", v),
            ExternalValue::Byte(v) => write!(f, "{}b", v),
            ExternalValue::Char(v) => write!(
                f,
                "'{}'",
                char::from_u32(*v).unwrap_or(char::REPLACEMENT_CHARACTER)
            ),
            ExternalValue::Tuple(children) => {
                write!(f, "(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            ExternalValue::List { element, .. } => {
                if *element == Datatype::Char {
                    return match self.as_string() {
                        Ok(s) => write!(f, "{:?}", s),
                        Err(_) => write!(f, "\"<invalid>\""),
                    };
                }
                match self.list_items() {
                    Ok(items) => {
                        write!(f, "[")?;
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{}", item)?;
                        }
                        write!(f, "]")
                    }
                    Err(_) => write!(f, "[<invalid>]"),
                }
            }
            ExternalValue::Str(s) => write!(f, "{:?}", s),
            ExternalValue::ByteArray(bytes) => write!(f, "{:?}", bytes),
            ExternalValue::Struct { datatype, fields } => {
                write!(f, "{}{{", datatype.struct_info().name)?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, "}}")
            }
            ExternalValue::Enum { datatype, variant, elements } => {
                write!(f, "{}::{}{{", datatype.enum_info().name, variant)?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "}}")
            }
            ExternalValue::FunctionRef(v) => write!(f, "{:#x}", v),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VMParameters;
    use crate::datatype::{
        EnumType, EnumVariant, StructField, StructType,
    };
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn heap() -> GC {
        GC::new(&VMParameters {
            initial_heap_size: 4096,
            functions_calls_per_gc_run: i32::max_value(),
        })
        .unwrap()
    }

    fn roundtrip(value: ExternalValue) {
        let mut gc = heap();
        let ty = value.datatype();
        let bytes = value.to_stack_value(&mut gc).unwrap();
        assert_eq!(bytes.len(), ty.size_on_stack() as usize);
        let back = ExternalValue::wrap_from_ptr(&ty, bytes.as_ptr()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn scalars_roundtrip() {
        roundtrip(ExternalValue::Unit);
        roundtrip(ExternalValue::Bool(true));
        roundtrip(ExternalValue::Bool(false));
        roundtrip(ExternalValue::I32(-7));
        roundtrip(ExternalValue::I64(1 << 40));
        roundtrip(ExternalValue::F64(2.5));
        roundtrip(ExternalValue::Byte(0xfe));
        roundtrip(ExternalValue::Char('ß' as u32));
        roundtrip(ExternalValue::FunctionRef(0x1234_5678_9abc));
    }

    #[test]
    fn tuples_keep_member_order() {
        roundtrip(ExternalValue::Tuple(vec![
            ExternalValue::I32(1),
            ExternalValue::I64(2),
            ExternalValue::Bool(true),
        ]));

        // The first member sits at the highest address.
        let mut gc = heap();
        let value = ExternalValue::Tuple(vec![
            ExternalValue::I64(0x11),
            ExternalValue::I64(0x22),
        ]);
        let bytes = value.to_stack_value(&mut gc).unwrap();
        assert_eq!(&bytes[..8], &0x22u64.to_le_bytes());
        assert_eq!(&bytes[8..], &0x11u64.to_le_bytes());
    }

    #[test]
    fn strings_marshal_as_char_lists() {
        let mut gc = heap();
        let bytes = ExternalValue::Str("hey".to_string())
            .to_stack_value(&mut gc)
            .unwrap();
        assert_eq!(bytes.len(), 8);
        let wrapped = ExternalValue::wrap_from_ptr(
            &Datatype::list_of(Datatype::Char),
            bytes.as_ptr(),
        )
        .unwrap();
        assert_eq!(wrapped.as_string().unwrap(), "hey");
        assert_eq!(format!("{}", wrapped), "\"hey\"");
    }

    #[test]
    fn byte_arrays_marshal_as_byte_lists() {
        let mut gc = heap();
        let bytes = ExternalValue::ByteArray(vec![1, 2, 3])
            .to_stack_value(&mut gc)
            .unwrap();
        let wrapped = ExternalValue::wrap_from_ptr(
            &Datatype::list_of(Datatype::Byte),
            bytes.as_ptr(),
        )
        .unwrap();
        let items = wrapped.list_items().unwrap();
        assert_eq!(
            items,
            vec![
                ExternalValue::Byte(1),
                ExternalValue::Byte(2),
                ExternalValue::Byte(3)
            ]
        );
    }

    fn point_type() -> Datatype {
        Datatype::Struct(Rc::new(StructType {
            name: "Point".to_string(),
            fields: vec![
                StructField { name: "x".to_string(), datatype: Datatype::I32 },
                StructField { name: "y".to_string(), datatype: Datatype::I32 },
            ],
        }))
    }

    #[test]
    fn structs_roundtrip_through_a_box() {
        let value = ExternalValue::Struct {
            datatype: point_type(),
            fields: vec![
                ("x".to_string(), ExternalValue::I32(3)),
                ("y".to_string(), ExternalValue::I32(4)),
            ],
        };
        roundtrip(value.clone());
        assert_eq!(format!("{}", value), "Point{x: 3, y: 4}");
    }

    fn option_type() -> Datatype {
        Datatype::Enum(Rc::new(EnumType {
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
    fn enums_roundtrip_through_a_box() {
        let some = ExternalValue::Enum {
            datatype: option_type(),
            variant: "Some".to_string(),
            elements: vec![ExternalValue::I32(7)],
        };
        roundtrip(some.clone());
        roundtrip(ExternalValue::Enum {
            datatype: option_type(),
            variant: "None".to_string(),
            elements: vec![],
        });
        assert_eq!(format!("{}", some), "Option::Some{7}");
    }

    #[test]
    fn unknown_variants_are_rejected() {
        let mut gc = heap();
        let bad = ExternalValue::Enum {
            datatype: option_type(),
            variant: "Sum".to_string(),
            elements: vec![],
        };
        assert!(matches!(
            bad.to_stack_value(&mut gc),
            Err(Error::Bytecode(_))
        ));
    }

    #[test]
    fn argument_checking() {
        assert!(check_argument(&Datatype::I32, &ExternalValue::I32(1)).is_ok());
        assert!(check_argument(
            &Datatype::list_of(Datatype::Char),
            &ExternalValue::Str("s".to_string())
        )
        .is_ok());
        let err = check_argument(&Datatype::I32, &ExternalValue::Bool(true))
            .unwrap_err();
        assert_eq!(
            err,
            Error::TypeMismatch {
                expect: BitFlags::from_flag(DatatypeCategory::I32),
                got: DatatypeCategory::Bool,
            }
        );
        assert!(check_argument(
            &Datatype::Tuple(vec![Datatype::I32]),
            &ExternalValue::Tuple(vec![ExternalValue::I64(1)])
        )
        .is_err());
    }

    #[test]
    fn i32_marshals_zero_padded() {
        let mut gc = heap();
        let bytes =
            ExternalValue::I32(-1).to_stack_value(&mut gc).unwrap();
        assert_eq!(&bytes[..4], &(-1i32).to_le_bytes());
        assert_eq!(&bytes[4..], &[0, 0, 0, 0]);
    }
}
