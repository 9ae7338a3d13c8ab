use log::debug;

use crate::buffer::Buffer;
use crate::dispatch::NativeCode;
use crate::object::{ObjRef, ObjectData, ObjectHeader, ObjectKind};
use crate::variable::VariableDictionary;

#[derive(Debug, Clone)]
pub struct HeapCreateInfo {
    pub initial_capacity: usize,
}

impl Default for HeapCreateInfo {
    fn default() -> Self {
        Self {
            initial_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub collections: u64,
    pub live: usize,
    pub freed: usize,
}

#[derive(Debug, Clone)]
pub struct HeapObject {
    pub header: ObjectHeader,
    pub data: ObjectData,
}

/// Arena heap: objects live in indexed slots, handles are slot indices.
/// Liveness is a generation-stamped mark phase followed by a sweep.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    generation: u32,
    stats: GcStats,
}

impl Heap {
    pub fn new(info: HeapCreateInfo) -> Self {
        Self {
            slots: Vec::with_capacity(info.initial_capacity),
            free: Vec::new(),
            generation: 0,
            stats: GcStats::default(),
        }
    }

    pub fn alloc(&mut self, data: ObjectData) -> ObjRef {
        let object = HeapObject {
            header: ObjectHeader::new(data.kind()),
            data,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(object);
                ObjRef(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(object));
                ObjRef(index)
            }
        }
    }

    // type-specific factories

    pub fn alloc_string(&mut self, s: &str) -> ObjRef {
        self.alloc(ObjectData::String(s.to_string()))
    }

    pub fn alloc_integer(&mut self, v: i64) -> ObjRef {
        self.alloc(ObjectData::Integer(v))
    }

    pub fn alloc_buffer(&mut self, length: usize) -> ObjRef {
        self.alloc(ObjectData::Buffer(Buffer::with_length(length)))
    }

    pub fn alloc_array(&mut self, fields: Vec<ObjRef>) -> ObjRef {
        self.alloc(ObjectData::Array(fields))
    }

    pub fn alloc_variables(&mut self) -> ObjRef {
        self.alloc(ObjectData::Variables(VariableDictionary::new()))
    }

    pub fn alloc_native_code(&mut self, code: NativeCode) -> ObjRef {
        self.alloc(ObjectData::NativeCode(code))
    }

    fn slot(&self, r: ObjRef) -> &HeapObject {
        self.slots
            .get(r.0 as usize)
            .and_then(Option::as_ref)
            .expect("dangling object reference")
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        self.slots
            .get_mut(r.0 as usize)
            .and_then(Option::as_mut)
            .expect("dangling object reference")
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.0 as usize)
            .is_some_and(Option::is_some)
    }

    pub fn kind(&self, r: ObjRef) -> ObjectKind {
        self.slot(r).header.kind
    }

    pub fn data(&self, r: ObjRef) -> &ObjectData {
        &self.slot(r).data
    }

    pub fn data_mut(&mut self, r: ObjRef) -> &mut ObjectData {
        &mut self.slot_mut(r).data
    }

    /// Replace a slot's payload in place, keeping the handle. Used by image
    /// load to fill placeholder allocations.
    pub fn replace(&mut self, r: ObjRef, data: ObjectData) {
        let slot = self.slot_mut(r);
        slot.header = ObjectHeader::new(data.kind());
        slot.data = data;
    }

    // typed accessors

    pub fn integer_value(&self, r: ObjRef) -> Option<i64> {
        match self.data(r) {
            ObjectData::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn string_value(&self, r: ObjRef) -> Option<&str> {
        match self.data(r) {
            ObjectData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn buffer(&self, r: ObjRef) -> Option<&Buffer> {
        match self.data(r) {
            ObjectData::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn buffer_mut(&mut self, r: ObjRef) -> Option<&mut Buffer> {
        match self.data_mut(r) {
            ObjectData::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn variables(&self, r: ObjRef) -> Option<&VariableDictionary> {
        match self.data(r) {
            ObjectData::Variables(d) => Some(d),
            _ => None,
        }
    }

    pub fn variables_mut(
        &mut self,
        r: ObjRef,
    ) -> Option<&mut VariableDictionary> {
        match self.data_mut(r) {
            ObjectData::Variables(d) => Some(d),
            _ => None,
        }
    }

    pub fn native_code(&self, r: ObjRef) -> Option<&NativeCode> {
        match self.data(r) {
            ObjectData::NativeCode(c) => Some(c),
            _ => None,
        }
    }

    pub fn native_code_mut(&mut self, r: ObjRef) -> Option<&mut NativeCode> {
        match self.data_mut(r) {
            ObjectData::NativeCode(c) => Some(c),
            _ => None,
        }
    }

    /// Grow a buffer object. Allocates a fresh, larger buffer and copies
    /// the old bytes; the old object is left for the collector once the
    /// caller drops its reference.
    pub fn expand_buffer(&mut self, r: ObjRef, min_length: usize) -> ObjRef {
        let grown = self
            .buffer(r)
            .expect("expand_buffer on a non-buffer object")
            .expanded(min_length);
        self.alloc(ObjectData::Buffer(grown))
    }

    pub fn pin(&mut self, r: ObjRef) {
        self.slot_mut(r).header.pin();
    }

    pub fn unpin(&mut self, r: ObjRef) {
        self.slot_mut(r).header.unpin();
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Mark from the given roots plus every pinned object, then sweep.
    pub fn collect(&mut self, roots: &[ObjRef]) -> GcStats {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;

        let mut worklist: Vec<ObjRef> = Vec::new();
        for index in 0..self.slots.len() {
            if let Some(slot) = &self.slots[index] {
                if slot.header.is_pinned() {
                    worklist.push(ObjRef(index as u32));
                }
            }
        }
        worklist.extend_from_slice(roots);

        let mut pending: Vec<ObjRef> = Vec::new();
        for r in worklist {
            self.mark_one(r, generation, &mut pending);
        }
        while let Some(r) = pending.pop() {
            let mut edges: Vec<ObjRef> = Vec::new();
            self.slot(r).data.visit_edges(&mut |edge| edges.push(edge));
            for edge in edges {
                self.mark_one(edge, generation, &mut pending);
            }
        }

        let mut freed = 0;
        for index in 0..self.slots.len() {
            let dead = match &self.slots[index] {
                Some(slot) => !slot.header.is_marked(generation),
                None => false,
            };
            if dead {
                self.slots[index] = None;
                self.free.push(index as u32);
                freed += 1;
            }
        }

        self.stats.collections += 1;
        self.stats.freed += freed;
        self.stats.live = self.live_count();
        debug!(
            "gc: collection {} freed {} objects, {} live",
            self.stats.collections, freed, self.stats.live
        );
        self.stats
    }

    fn mark_one(
        &mut self,
        r: ObjRef,
        generation: u32,
        pending: &mut Vec<ObjRef>,
    ) {
        let slot = self.slot_mut(r);
        if !slot.header.is_marked(generation) {
            slot.header.mark(generation);
            pending.push(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(HeapCreateInfo::default())
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let mut h = heap();
        let kept = h.alloc_integer(1);
        let inner = h.alloc_string("reachable");
        let root = h.alloc_array(vec![kept, inner]);
        let garbage = h.alloc_string("garbage");

        let stats = h.collect(&[root]);
        assert_eq!(stats.freed, 1);
        assert!(h.contains(root));
        assert!(h.contains(kept));
        assert!(h.contains(inner));
        assert!(!h.contains(garbage));
    }

    #[test]
    fn variable_values_are_reachable_through_the_pool() {
        let mut h = heap();
        let value = h.alloc_integer(99);
        let pool = h.alloc_variables();
        h.variables_mut(pool).unwrap().set("X", value);

        h.collect(&[pool]);
        assert!(h.contains(value));

        h.variables_mut(pool).unwrap().drop_variable("X");
        h.collect(&[pool]);
        assert!(!h.contains(value));
    }

    #[test]
    fn pinned_objects_are_roots() {
        let mut h = heap();
        let pinned = h.alloc_string("stay");
        h.pin(pinned);

        h.collect(&[]);
        assert!(h.contains(pinned));

        h.unpin(pinned);
        h.collect(&[]);
        assert!(!h.contains(pinned));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut h = heap();
        let a = h.alloc_integer(1);
        h.collect(&[]);
        let b = h.alloc_integer(2);
        assert_eq!(a, b);
        assert_eq!(h.integer_value(b), Some(2));
    }

    #[test]
    fn cyclic_garbage_is_collected() {
        let mut h = heap();
        let a = h.alloc_array(vec![]);
        let b = h.alloc_array(vec![a]);
        if let ObjectData::Array(fields) = h.data_mut(a) {
            fields.push(b);
        }

        h.collect(&[]);
        assert!(!h.contains(a));
        assert!(!h.contains(b));
    }

    #[test]
    fn expand_buffer_allocates_a_new_object() {
        let mut h = heap();
        let old = h.alloc_buffer(4);
        h.buffer_mut(old).unwrap().data_mut().copy_from_slice(&[
            1, 2, 3, 4,
        ]);

        let new = h.expand_buffer(old, 2);
        assert_ne!(old, new);
        assert_eq!(h.buffer(new).unwrap().length(), 8);
        assert_eq!(&h.buffer(new).unwrap().data()[..4], &[1, 2, 3, 4]);
        // old buffer unchanged
        assert_eq!(h.buffer(old).unwrap().length(), 4);
    }
}
