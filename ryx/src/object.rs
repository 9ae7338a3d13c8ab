use crate::buffer::Buffer;
use crate::dispatch::NativeCode;
use crate::variable::VariableDictionary;

/// Index handle into the arena heap. Objects never move, so a handle stays
/// valid until the collector frees the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub u32);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u8 {
        /// Pinned objects are treated as roots and never freed.
        const PINNED = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    String,
    Integer,
    Buffer,
    Array,
    Variables,
    NativeCode,
}

#[derive(Debug, Clone, Copy)]
pub struct ObjectHeader {
    pub kind: ObjectKind,
    pub flags: ObjectFlags,
    /// Generation stamp of the last mark phase that reached this object.
    pub generation: u32,
}

impl ObjectHeader {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            flags: ObjectFlags::empty(),
            generation: 0,
        }
    }

    #[inline]
    pub fn is_marked(&self, generation: u32) -> bool {
        self.generation == generation
    }

    #[inline]
    pub fn mark(&mut self, generation: u32) {
        self.generation = generation;
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(ObjectFlags::PINNED)
    }

    pub fn pin(&mut self) {
        self.flags.insert(ObjectFlags::PINNED);
    }

    pub fn unpin(&mut self) {
        self.flags.remove(ObjectFlags::PINNED);
    }
}

/// Payload of one heap object. Every variant that stores `ObjRef` fields
/// must enumerate them in `visit_edges` and rewrite them in `map_edges`;
/// a missed field is a collector or image bug.
#[derive(Debug, Clone)]
pub enum ObjectData {
    String(String),
    Integer(i64),
    Buffer(Buffer),
    Array(Vec<ObjRef>),
    Variables(VariableDictionary),
    NativeCode(NativeCode),
}

impl ObjectData {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectData::String(_) => ObjectKind::String,
            ObjectData::Integer(_) => ObjectKind::Integer,
            ObjectData::Buffer(_) => ObjectKind::Buffer,
            ObjectData::Array(_) => ObjectKind::Array,
            ObjectData::Variables(_) => ObjectKind::Variables,
            ObjectData::NativeCode(_) => ObjectKind::NativeCode,
        }
    }

    /// Enumerate every outgoing reference, for the mark phase.
    pub fn visit_edges(&self, visit: &mut dyn FnMut(ObjRef)) {
        match self {
            ObjectData::String(_)
            | ObjectData::Integer(_)
            | ObjectData::Buffer(_)
            | ObjectData::NativeCode(_) => {}
            ObjectData::Array(fields) => {
                for &field in fields {
                    visit(field);
                }
            }
            ObjectData::Variables(dict) => {
                dict.visit_values(visit);
            }
        }
    }

    /// Rewrite every outgoing reference in place, for envelope
    /// flatten/unflatten.
    pub fn map_edges(&mut self, map: &mut dyn FnMut(ObjRef) -> ObjRef) {
        match self {
            ObjectData::String(_)
            | ObjectData::Integer(_)
            | ObjectData::Buffer(_)
            | ObjectData::NativeCode(_) => {}
            ObjectData::Array(fields) => {
                for field in fields.iter_mut() {
                    *field = map(*field);
                }
            }
            ObjectData::Variables(dict) => {
                dict.map_values(map);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_mark_tracks_generation() {
        let mut header = ObjectHeader::new(ObjectKind::Integer);
        assert!(!header.is_marked(1));
        header.mark(1);
        assert!(header.is_marked(1));
        assert!(!header.is_marked(2));
    }

    #[test]
    fn array_edges_are_visited_and_mapped() {
        let mut data =
            ObjectData::Array(vec![ObjRef(3), ObjRef(7), ObjRef(3)]);

        let mut seen = Vec::new();
        data.visit_edges(&mut |r| seen.push(r));
        assert_eq!(seen, vec![ObjRef(3), ObjRef(7), ObjRef(3)]);

        data.map_edges(&mut |r| ObjRef(r.0 + 100));
        let mut mapped = Vec::new();
        data.visit_edges(&mut |r| mapped.push(r));
        assert_eq!(mapped, vec![ObjRef(103), ObjRef(107), ObjRef(103)]);
    }

    #[test]
    fn leaf_objects_have_no_edges() {
        let data = ObjectData::Buffer(Buffer::with_length(8));
        let mut seen = Vec::new();
        data.visit_edges(&mut |r| seen.push(r));
        assert!(seen.is_empty());
    }
}
