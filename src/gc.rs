// The semi-space copying collector. Allocation bump-allocates out
// of the active region; collection copies everything reachable from
// the typed stack roots into the other region and swaps the two.
//
// The collector is precise: it follows exactly the pointers the
// stack-shape metadata names, interpreting each slot with its
// compile-time type. Evacuated objects leave a forwarding marker in
// their first word so shared structure is copied once.
//
// Allocation sizes are kept even so that heap pointers never have
// their low bit set; the function word encoding depends on it.

use std::ptr;

use tracing::debug;

use crate::bytecode::Program;
use crate::config::VMParameters;
use crate::datatype::{Datatype, DatatypeCategory};
use crate::error::{Error, Result};


struct Region {
    data: Box<[u64]>,
    len: usize,
    offset: usize,
}


impl Region {
    // Backed by u64 words so every handed-out pointer is 8-aligned.
    fn new(len: usize) -> Result<Region> {
        let words = (len + 7) / 8;
        let mut data: Vec<u64> = Vec::new();
        data.try_reserve_exact(words).map_err(|_| Error::OutOfMemory)?;
        data.resize(words, 0);
        Ok(Region { data: data.into_boxed_slice(), len, offset: 0 })
    }

    fn base(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.base().add(self.offset) }
    }

    // Only the already-used prefix counts; the forwarding protocol
    // asks whether a pointer refers to copied data.
    fn contains(&self, p: *const u8) -> bool {
        let p = p as usize;
        let base = self.base() as usize;
        p >= base && p < base + self.offset
    }
}


unsafe fn read_ptr(at: *const u8) -> *mut u8 {
    (at as *const *mut u8).read_unaligned()
}

unsafe fn write_ptr(at: *mut u8, value: *mut u8) {
    (at as *mut *mut u8).write_unaligned(value)
}

unsafe fn read_i32_at(at: *const u8) -> i32 {
    (at as *const i32).read_unaligned()
}

unsafe fn read_i64_at(at: *const u8) -> i64 {
    (at as *const i64).read_unaligned()
}


pub struct GC {
    regions: [Region; 2],
    active: usize,
    overflow: Vec<Box<[u64]>>,
    overflow_bytes: usize,
    calls_since_run: i32,
    calls_per_run: i32,
    collections: u64,
}


impl GC {
    pub fn new(params: &VMParameters) -> Result<GC> {
        Ok(GC {
            regions: [
                Region::new(params.initial_heap_size)?,
                Region::new(params.initial_heap_size)?,
            ],
            active: 0,
            overflow: Vec::new(),
            overflow_bytes: 0,
            calls_since_run: 0,
            calls_per_run: params.functions_calls_per_gc_run,
            collections: 0,
        })
    }

    pub fn alloc(&mut self, size: i32) -> Result<*mut u8> {
        assert!(size >= 0);
        // Keep every allocation even for the low-bit tag.
        let size = (size + (size & 1)) as usize;
        let region = &mut self.regions[self.active];
        if region.offset + size <= region.len {
            let ptr = region.top();
            region.offset += size;
            return Ok(ptr);
        }
        // The region is full; fall back to a host allocation that
        // the next collection folds back in.
        let words = (size + 7) / 8;
        let mut data: Vec<u64> = Vec::new();
        data.try_reserve_exact(words).map_err(|_| Error::OutOfMemory)?;
        data.resize(words, 0);
        let block = data.into_boxed_slice();
        let ptr = block.as_ptr() as *mut u8;
        self.overflow.push(block);
        self.overflow_bytes += size;
        Ok(ptr)
    }

    // Counts one collection request; the caller runs `collect` when
    // this reports true.
    pub fn request_collection(&mut self) -> bool {
        self.calls_since_run += 1;
        if self.calls_since_run > self.calls_per_run {
            self.calls_since_run = 0;
            true
        } else {
            false
        }
    }

    pub fn collect(
        &mut self,
        roots: &[(*mut u8, Datatype)],
        program: &Program,
    ) -> Result<()> {
        debug!(
            "collecting: {} bytes live in region, {} overflow allocations",
            self.regions[self.active].offset,
            self.overflow.len()
        );
        let other = 1 - self.active;
        self.regions[other].offset = 0;
        if !self.overflow.is_empty()
            || self.regions[other].len < self.regions[self.active].len
        {
            self.regions[other] = Region::new(
                self.regions[self.active].len + self.overflow_bytes,
            )?;
        }
        for (slot, datatype) in roots {
            self.scan(*slot, datatype, program)?;
        }
        self.active = other;
        self.overflow.clear();
        self.overflow_bytes = 0;
        self.collections += 1;
        debug!(
            "collection done: {} bytes survive",
            self.regions[self.active].offset
        );
        Ok(())
    }

    fn in_to_region(&self, p: *const u8) -> bool {
        self.regions[1 - self.active].contains(p)
    }

    fn copy_to_other(&mut self, src: *const u8, len: usize) -> *mut u8 {
        let len = len + (len & 1);
        let to = &mut self.regions[1 - self.active];
        assert!(to.offset + len <= to.len, "to-space exhausted");
        let dst = to.top();
        unsafe {
            ptr::copy_nonoverlapping(src, dst, len);
        }
        to.offset += len;
        dst
    }

    // Scan one typed slot. `slot` points at the value's stack (or
    // box-interior) representation; pointer-valued categories get
    // the forwarding protocol, aggregates recurse with offsets
    // walked from the end of the aggregate downward.
    fn scan(
        &mut self,
        slot: *mut u8,
        datatype: &Datatype,
        program: &Program,
    ) -> Result<()> {
        match datatype.category() {
            DatatypeCategory::Bool
            | DatatypeCategory::I32
            | DatatypeCategory::I64
            | DatatypeCategory::F64
            | DatatypeCategory::Char
            | DatatypeCategory::Byte => Ok(()),
            DatatypeCategory::Tuple => {
                let mut offset = datatype.checked_size_on_stack()?;
                for member in datatype.tuple_members() {
                    offset -= member.checked_size_on_stack()?;
                    self.scan(
                        unsafe { slot.add(offset as usize) },
                        member,
                        program,
                    )?;
                }
                Ok(())
            }
            DatatypeCategory::List => self.scan_list(slot, datatype, program),
            DatatypeCategory::Function => {
                self.scan_function(slot, program)
            }
            DatatypeCategory::Struct
            | DatatypeCategory::Enum
            | DatatypeCategory::Pointer => {
                self.forward_box(slot, datatype, program)
            }
            DatatypeCategory::UndeterminedIdentifier => Err(Error::Bytecode(
                "undetermined identifier in stack shape".to_string(),
            )),
        }
    }

    fn scan_list(
        &mut self,
        slot: *mut u8,
        datatype: &Datatype,
        program: &Program,
    ) -> Result<()> {
        let element = datatype.list_element();
        let element_size = element.checked_size_on_stack()? as usize;
        let mut slot = slot;
        loop {
            let cell = unsafe { read_ptr(slot) };
            if cell.is_null() {
                return Ok(());
            }
            if self.in_to_region(cell) {
                // Already evacuated and the slot already updated.
                return Ok(());
            }
            let first_word = unsafe { read_ptr(cell) };
            if self.in_to_region(first_word) {
                // Forwarding marker left by an earlier visit.
                unsafe { write_ptr(slot, first_word) };
                return Ok(());
            }
            self.scan(unsafe { cell.add(8) }, element, program)?;
            let moved = self.copy_to_other(cell, 8 + element_size);
            unsafe {
                write_ptr(slot, moved);
                write_ptr(cell, moved);
            }
            // Continue through the moved cell's next field, which
            // still points into from-space.
            slot = moved;
        }
    }

    fn scan_function(
        &mut self,
        slot: *mut u8,
        program: &Program,
    ) -> Result<()> {
        let low = unsafe { read_i32_at(slot) };
        if low % 2 != 0 {
            // Default or native function id, nothing on the heap.
            return Ok(());
        }
        let lambda = unsafe { read_ptr(slot) };
        if lambda.is_null() {
            return Err(Error::Bytecode("null lambda pointer".to_string()));
        }
        if self.in_to_region(lambda) {
            return Ok(());
        }
        let first_word = unsafe { read_ptr(lambda) };
        if self.in_to_region(first_word) {
            unsafe { write_ptr(slot, first_word) };
            return Ok(());
        }
        let capture_bytes = unsafe { read_i32_at(lambda) };
        let tuple_id = unsafe { read_i32_at(lambda.add(8)) };
        let captures = match program.auxiliary(tuple_id)? {
            Datatype::Tuple(members) => members,
            other => {
                return Err(Error::Bytecode(format!(
                    "auxiliary datatype {} is not a capture tuple but {:?}",
                    tuple_id,
                    other.category()
                )))
            }
        };
        let total = 16 + capture_bytes;
        let mut offset = total;
        for member in captures {
            offset -= member.checked_size_on_stack()?;
            self.scan(
                unsafe { lambda.add(offset as usize) },
                member,
                program,
            )?;
        }
        let moved = self.copy_to_other(lambda, total as usize);
        unsafe {
            write_ptr(lambda, moved);
            write_ptr(slot, moved);
        }
        Ok(())
    }

    // Struct, enum and single-value boxes. The box is evacuated
    // first and its interior scanned in to-space, so the forwarding
    // marker never races against an interior field that was itself
    // just forwarded.
    fn forward_box(
        &mut self,
        slot: *mut u8,
        datatype: &Datatype,
        program: &Program,
    ) -> Result<()> {
        let old = unsafe { read_ptr(slot) };
        if old.is_null() {
            return Err(Error::Bytecode("null box pointer".to_string()));
        }
        if self.in_to_region(old) {
            return Ok(());
        }
        let first_word = unsafe { read_ptr(old) };
        if self.in_to_region(first_word) {
            unsafe { write_ptr(slot, first_word) };
            return Ok(());
        }
        let size = datatype.checked_boxed_size()?;
        let moved = self.copy_to_other(old, size as usize);
        unsafe {
            write_ptr(old, moved);
            write_ptr(slot, moved);
        }
        match datatype.category() {
            DatatypeCategory::Struct => {
                let mut offset = size;
                for field in &datatype.struct_info().fields {
                    offset -= field.datatype.checked_size_on_stack()?;
                    self.scan(
                        unsafe { moved.add(offset as usize) },
                        &field.datatype,
                        program,
                    )?;
                }
            }
            DatatypeCategory::Enum => {
                let info = datatype.enum_info();
                let index = unsafe { read_i64_at(moved) };
                let variant =
                    info.variants.get(index as usize).ok_or_else(|| {
                        Error::Bytecode(format!(
                            "enum {} has no variant {}",
                            info.name, index
                        ))
                    })?;
                let mut offset = size;
                for param in &variant.params {
                    offset -= param.checked_size_on_stack()?;
                    self.scan(
                        unsafe { moved.add(offset as usize) },
                        param,
                        program,
                    )?;
                }
            }
            DatatypeCategory::Pointer => {
                self.scan(moved, datatype.pointer_base(), program)?;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    // Observational accessors, used by native callbacks and tests.

    pub fn collections(&self) -> u64 {
        self.collections
    }

    pub fn active_region_contains(&self, p: *const u8) -> bool {
        self.regions[self.active].contains(p)
    }

    pub fn overflow_allocations(&self) -> usize {
        self.overflow.len()
    }

    pub fn heap_used(&self) -> usize {
        self.regions[self.active].offset + self.overflow_bytes
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn empty_program() -> Program {
        Program {
            code: vec![],
            functions: vec![],
            native_functions: vec![],
            auxiliary_datatypes: vec![],
        }
    }

    fn make_gc(heap: usize) -> GC {
        GC::new(&VMParameters {
            initial_heap_size: heap,
            functions_calls_per_gc_run: 1,
        })
        .unwrap()
    }

    // Build an i64 cons cell by hand: {next, payload}.
    fn cons(gc: &mut GC, next: *mut u8, payload: i64) -> *mut u8 {
        let cell = gc.alloc(16).unwrap();
        unsafe {
            write_ptr(cell, next);
            (cell.add(8) as *mut i64).write_unaligned(payload);
        }
        cell
    }

    fn list_values(mut head: *const u8) -> Vec<i64> {
        let mut out = Vec::new();
        while !head.is_null() {
            unsafe {
                out.push((head.add(8) as *const i64).read_unaligned());
                head = read_ptr(head) as *const u8;
            }
        }
        out
    }

    #[test]
    fn allocations_are_even_and_aligned() {
        let mut gc = make_gc(1024);
        for &size in &[1, 7, 8, 15, 16] {
            let a = gc.alloc(size).unwrap();
            let b = gc.alloc(8).unwrap();
            assert_eq!(a as usize % 2, 0);
            assert_eq!(b as usize % 2, 0);
        }
    }

    #[test]
    fn exhausted_region_falls_back_to_overflow() {
        let mut gc = make_gc(16);
        let _ = gc.alloc(16).unwrap();
        assert_eq!(gc.overflow_allocations(), 0);
        let extra = gc.alloc(16).unwrap();
        assert_eq!(gc.overflow_allocations(), 1);
        assert!(!gc.active_region_contains(extra));
    }

    #[test]
    fn threshold_counts_requests() {
        let mut gc = GC::new(&VMParameters {
            initial_heap_size: 64,
            functions_calls_per_gc_run: 2,
        })
        .unwrap();
        assert!(!gc.request_collection());
        assert!(!gc.request_collection());
        assert!(gc.request_collection());
        assert!(!gc.request_collection());
    }

    #[test_log::test]
    fn live_list_survives_collection() {
        let mut gc = make_gc(1024);
        let tail = cons(&mut gc, std::ptr::null_mut(), 2);
        let head = cons(&mut gc, tail, 1);
        let mut root: u64 = head as u64;
        let ty = Datatype::list_of(Datatype::I64);

        gc.collect(
            &[(&mut root as *mut u64 as *mut u8, ty)],
            &empty_program(),
        )
        .unwrap();

        let moved = root as *const u8;
        assert_ne!(moved, head as *const u8);
        assert!(gc.active_region_contains(moved));
        assert_eq!(list_values(moved), vec![1, 2]);
        // Exactly the two cells were copied.
        assert_eq!(gc.heap_used(), 32);
    }

    #[test]
    fn garbage_is_not_copied() {
        let mut gc = make_gc(1024);
        let _dead = cons(&mut gc, std::ptr::null_mut(), 99);
        let mut root: u64 = 0;
        gc.collect(
            &[(
                &mut root as *mut u64 as *mut u8,
                Datatype::list_of(Datatype::I64),
            )],
            &empty_program(),
        )
        .unwrap();
        assert_eq!(gc.heap_used(), 0);
    }

    #[test]
    fn shared_tails_are_forwarded_once() {
        let mut gc = make_gc(1024);
        let shared = cons(&mut gc, std::ptr::null_mut(), 3);
        let a = cons(&mut gc, shared, 1);
        let b = cons(&mut gc, shared, 2);
        let mut root_a: u64 = a as u64;
        let mut root_b: u64 = b as u64;
        let ty = Datatype::list_of(Datatype::I64);

        gc.collect(
            &[
                (&mut root_a as *mut u64 as *mut u8, ty.clone()),
                (&mut root_b as *mut u64 as *mut u8, ty),
            ],
            &empty_program(),
        )
        .unwrap();

        assert_eq!(list_values(root_a as *const u8), vec![1, 3]);
        assert_eq!(list_values(root_b as *const u8), vec![2, 3]);
        // Three cells total: the shared tail was evacuated once.
        assert_eq!(gc.heap_used(), 48);
        let tail_a = unsafe { read_ptr(root_a as *const u8) };
        let tail_b = unsafe { read_ptr(root_b as *const u8) };
        assert_eq!(tail_a, tail_b);
    }

    #[test_log::test]
    fn overflow_allocations_are_folded_back_in() {
        let mut gc = make_gc(16);
        let tail = cons(&mut gc, std::ptr::null_mut(), 2);
        let head = cons(&mut gc, tail, 1);
        assert_eq!(gc.overflow_allocations(), 1);
        let mut root: u64 = head as u64;
        gc.collect(
            &[(
                &mut root as *mut u64 as *mut u8,
                Datatype::list_of(Datatype::I64),
            )],
            &empty_program(),
        )
        .unwrap();
        assert_eq!(gc.overflow_allocations(), 0);
        assert!(gc.active_region_contains(root as *const u8));
        assert_eq!(list_values(root as *const u8), vec![1, 2]);
    }

    #[test]
    fn collections_are_idempotent_across_cycles() {
        let mut gc = make_gc(1024);
        let tail = cons(&mut gc, std::ptr::null_mut(), 2);
        let head = cons(&mut gc, tail, 1);
        let mut root: u64 = head as u64;
        let ty = Datatype::list_of(Datatype::I64);
        for _ in 0..4 {
            gc.collect(
                &[(&mut root as *mut u64 as *mut u8, ty.clone())],
                &empty_program(),
            )
            .unwrap();
            assert_eq!(list_values(root as *const u8), vec![1, 2]);
            assert_eq!(gc.heap_used(), 32);
        }
        assert_eq!(gc.collections(), 4);
    }

    #[test]
    fn struct_boxes_are_forwarded_with_their_pointers() {
        use crate::datatype::{StructField, StructType};
        use std::rc::Rc;

        let ty = Datatype::Struct(Rc::new(StructType {
            name: "Holder".to_string(),
            fields: vec![
                StructField {
                    name: "items".to_string(),
                    datatype: Datatype::list_of(Datatype::I64),
                },
                StructField { name: "count".to_string(), datatype: Datatype::I64 },
            ],
        }));

        let mut gc = make_gc(1024);
        let cell = cons(&mut gc, std::ptr::null_mut(), 7);
        // Box layout: first field at the highest offset.
        let boxp = gc.alloc(16).unwrap();
        unsafe {
            write_ptr(boxp.add(8), cell); // items
            (boxp as *mut i64).write_unaligned(1); // count
        }
        let mut root: u64 = boxp as u64;
        gc.collect(
            &[(&mut root as *mut u64 as *mut u8, ty)],
            &empty_program(),
        )
        .unwrap();

        let moved = root as *const u8;
        assert!(gc.active_region_contains(moved));
        unsafe {
            assert_eq!(read_i64_at(moved), 1);
            let items = read_ptr(moved.add(8));
            assert!(gc.active_region_contains(items));
            assert_eq!(list_values(items), vec![7]);
        }
    }

    #[test]
    fn enums_only_scan_the_active_variant() {
        use crate::datatype::{EnumType, EnumVariant};
        use std::rc::Rc;

        // Result { Err, Ok(list<i64>) } - the payload area of an Err
        // holds garbage bytes that must not be chased.
        let ty = Datatype::Enum(Rc::new(EnumType {
            name: "Outcome".to_string(),
            variants: vec![
                EnumVariant { name: "Err".to_string(), params: vec![] },
                EnumVariant {
                    name: "Ok".to_string(),
                    params: vec![Datatype::list_of(Datatype::I64)],
                },
            ],
        }));

        let mut gc = make_gc(1024);
        let boxp = gc.alloc(16).unwrap();
        unsafe {
            (boxp as *mut i64).write_unaligned(0); // Err
            write_ptr(boxp.add(8), 0xdead_beee as *mut u8); // junk, even
        }
        let mut root: u64 = boxp as u64;
        gc.collect(
            &[(&mut root as *mut u64 as *mut u8, ty.clone())],
            &empty_program(),
        )
        .unwrap();
        assert!(gc.active_region_contains(root as *const u8));

        // An out-of-range discriminant is a bytecode error, not UB.
        let mut gc = make_gc(1024);
        let boxp = gc.alloc(16).unwrap();
        unsafe {
            (boxp as *mut i64).write_unaligned(9);
        }
        let mut root: u64 = boxp as u64;
        let result = gc.collect(
            &[(&mut root as *mut u64 as *mut u8, ty)],
            &empty_program(),
        );
        assert!(matches!(result, Err(Error::Bytecode(_))));
    }

    #[test]
    fn undetermined_identifiers_are_rejected() {
        let mut gc = make_gc(64);
        let mut root: u64 = 0;
        let result = gc.collect(
            &[(
                &mut root as *mut u64 as *mut u8,
                Datatype::UndeterminedIdentifier("T".to_string()),
            )],
            &empty_program(),
        );
        assert!(matches!(result, Err(Error::Bytecode(_))));
    }

    // The top-level category check alone is not enough: an
    // unresolved identifier can hide inside an aggregate's size
    // computation, and must still surface as an error.
    #[test]
    fn nested_undetermined_identifiers_are_rejected() {
        use crate::datatype::{StructField, StructType};
        use std::rc::Rc;

        let mut gc = make_gc(1024);
        let mut root = [0u8; 16];
        let result = gc.collect(
            &[(
                root.as_mut_ptr(),
                Datatype::Tuple(vec![
                    Datatype::I64,
                    Datatype::UndeterminedIdentifier("T".to_string()),
                ]),
            )],
            &empty_program(),
        );
        assert!(matches!(result, Err(Error::Bytecode(_))));

        let mut gc = make_gc(1024);
        let mut root: u64 = 0;
        let result = gc.collect(
            &[(
                &mut root as *mut u64 as *mut u8,
                Datatype::list_of(Datatype::UndeterminedIdentifier(
                    "T".to_string(),
                )),
            )],
            &empty_program(),
        );
        assert!(matches!(result, Err(Error::Bytecode(_))));

        let mut gc = make_gc(1024);
        let boxp = gc.alloc(8).unwrap();
        let mut slot: u64 = boxp as u64;
        let holey = Datatype::Struct(Rc::new(StructType {
            name: "Holey".to_string(),
            fields: vec![StructField {
                name: "gap".to_string(),
                datatype: Datatype::UndeterminedIdentifier("T".to_string()),
            }],
        }));
        let result = gc.collect(
            &[(&mut slot as *mut u64 as *mut u8, holey)],
            &empty_program(),
        );
        assert!(matches!(result, Err(Error::Bytecode(_))));
    }
}
