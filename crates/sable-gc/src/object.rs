//! Object handles, reference slots and instance layout

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::flags::ObjectFlags;
use crate::processor::ReferenceCollector;
use crate::types::TypeId;

/// Stable index of an object slot in the object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectIndex(pub u32);

impl ObjectIndex {
    /// Slot index as `usize`
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A nullable object reference the collector can clear through a shared borrow.
///
/// Encoded as `index + 1`, with 0 meaning null. Reads and writes are single
/// atomic operations, so worker threads may null a slot (pending-kill
/// elimination) while other workers read unrelated slots of the same object.
pub struct RefSlot(AtomicU32);

impl RefSlot {
    /// Slot holding `target`
    pub fn new(target: Option<ObjectIndex>) -> Self {
        Self(AtomicU32::new(Self::encode(target)))
    }

    /// Null slot
    pub const fn null() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    fn encode(target: Option<ObjectIndex>) -> u32 {
        match target {
            Some(index) => index.0 + 1,
            None => 0,
        }
    }

    /// Current target
    #[inline]
    pub fn get(&self) -> Option<ObjectIndex> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ObjectIndex(raw - 1)),
        }
    }

    /// Point the slot at `target`
    #[inline]
    pub fn set(&self, target: Option<ObjectIndex>) {
        self.0.store(Self::encode(target), Ordering::Release);
    }

    /// Null the slot
    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Whether the slot is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }
}

impl Clone for RefSlot {
    fn clone(&self) -> Self {
        Self(AtomicU32::new(self.0.load(Ordering::Acquire)))
    }
}

impl Default for RefSlot {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(index) => write!(f, "RefSlot({index})"),
            None => f.write_str("RefSlot(null)"),
        }
    }
}

/// One field of an instance.
///
/// Token stream offsets index into an instance's field list. Embedded structs
/// and fixed arrays are flattened into the enclosing list, so a struct of
/// three fields at offset 4 occupies offsets 4, 5 and 6.
#[derive(Debug, Clone)]
pub enum Field {
    /// Plain data, never traced
    Scalar(u64),
    /// Single object reference
    Ref(RefSlot),
    /// Growable array of references
    RefArray(Vec<RefSlot>),
    /// Growable array of structs, each laid out as its own field list
    StructArray(Vec<Vec<Field>>),
    /// Key/value container
    Map(Vec<(Field, Field)>),
    /// Set container
    Set(Vec<Field>),
}

impl Field {
    /// Reference field pointing at `target`
    pub fn reference(target: Option<ObjectIndex>) -> Self {
        Field::Ref(RefSlot::new(target))
    }

    /// Array of references
    pub fn references(targets: impl IntoIterator<Item = Option<ObjectIndex>>) -> Self {
        Field::RefArray(targets.into_iter().map(RefSlot::new).collect())
    }

    /// Reference slot if this is a `Ref` field
    pub fn as_ref_slot(&self) -> Option<&RefSlot> {
        match self {
            Field::Ref(slot) => Some(slot),
            _ => None,
        }
    }

    /// Reference slots if this is a `RefArray` field
    pub fn as_ref_array(&self) -> Option<&[RefSlot]> {
        match self {
            Field::RefArray(slots) => Some(slots),
            _ => None,
        }
    }

    /// Mutable array of references, for resizing
    pub fn as_ref_array_mut(&mut self) -> Option<&mut Vec<RefSlot>> {
        match self {
            Field::RefArray(slots) => Some(slots),
            _ => None,
        }
    }

    /// Elements if this is a `StructArray` field
    pub fn as_struct_array(&self) -> Option<&[Vec<Field>]> {
        match self {
            Field::StructArray(elements) => Some(elements),
            _ => None,
        }
    }

    /// Mutable struct array, for resizing
    pub fn as_struct_array_mut(&mut self) -> Option<&mut Vec<Vec<Field>>> {
        match self {
            Field::StructArray(elements) => Some(elements),
            _ => None,
        }
    }

    /// Report every reference slot in this field (recursively) to `visit`.
    ///
    /// Used by container referencers and the cluster builder, where no token
    /// stream describes the inner layout.
    pub fn for_each_ref_slot<'a>(&'a self, visit: &mut dyn FnMut(&'a RefSlot)) {
        match self {
            Field::Scalar(_) => {}
            Field::Ref(slot) => visit(slot),
            Field::RefArray(slots) => slots.iter().for_each(|s| visit(s)),
            Field::StructArray(elements) => {
                for element in elements {
                    for field in element {
                        field.for_each_ref_slot(visit);
                    }
                }
            }
            Field::Map(pairs) => {
                for (key, value) in pairs {
                    key.for_each_ref_slot(visit);
                    value.for_each_ref_slot(visit);
                }
            }
            Field::Set(elements) => {
                for element in elements {
                    element.for_each_ref_slot(visit);
                }
            }
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Field::Scalar(_) => "scalar",
            Field::Ref(_) => "reference",
            Field::RefArray(_) => "reference array",
            Field::StructArray(_) => "struct array",
            Field::Map(_) => "map",
            Field::Set(_) => "set",
        }
    }
}

/// Hand-written behaviour attached to an instance.
///
/// Covers references that cannot be described by field offsets and the
/// finalization protocol. Teardown may be asynchronous: `begin_destroy` starts
/// it, `is_ready_for_finish_destroy` is polled (possibly over many purge ticks)
/// and `finish_destroy` runs exactly once when it reports ready.
pub trait NativeObject: Send + Sync + 'static {
    /// Report references held outside the field list
    fn add_referenced_objects(&self, _collector: &mut dyn ReferenceCollector) {}

    /// Start teardown. Called once, right after the object is found unreachable.
    fn begin_destroy(&mut self) {}

    /// Whether asynchronous teardown has completed
    fn is_ready_for_finish_destroy(&mut self) -> bool {
        true
    }

    /// Final teardown before the slot is freed
    fn finish_destroy(&mut self) {}
}

/// A live heap object.
pub struct ObjectInstance {
    type_id: TypeId,
    name: String,
    outer: Option<ObjectIndex>,
    flags: ObjectFlags,
    fields: Vec<Field>,
    native: Option<Box<dyn NativeObject>>,
}

impl ObjectInstance {
    pub(crate) fn from_spec(spec: ObjectSpec) -> Self {
        Self {
            type_id: spec.type_id,
            name: spec.name,
            outer: spec.outer,
            flags: spec.flags,
            fields: spec.fields,
            native: spec.native,
        }
    }

    /// Type of this object
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outer object, used for path names only
    pub fn outer(&self) -> Option<ObjectIndex> {
        self.outer
    }

    /// Instance flags
    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    /// Whether any of `flags` is set
    pub fn has_any_flags(&self, flags: ObjectFlags) -> bool {
        self.flags.intersects(flags)
    }

    /// Set instance flags
    pub fn set_flags(&mut self, flags: ObjectFlags) {
        self.flags.insert(flags);
    }

    /// Clear instance flags
    pub fn clear_flags(&mut self, flags: ObjectFlags) {
        self.flags.remove(flags);
    }

    /// Field list
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Mutable field list
    pub fn fields_mut(&mut self) -> &mut [Field] {
        &mut self.fields
    }

    /// Field at `offset`
    pub fn field(&self, offset: usize) -> Option<&Field> {
        self.fields.get(offset)
    }

    /// Mutable field at `offset`
    pub fn field_mut(&mut self, offset: usize) -> Option<&mut Field> {
        self.fields.get_mut(offset)
    }

    /// Convenience: target of the `Ref` field at `offset`
    pub fn reference(&self, offset: usize) -> Option<ObjectIndex> {
        self.field(offset)
            .and_then(Field::as_ref_slot)
            .and_then(RefSlot::get)
    }

    /// Convenience: repoint the `Ref` field at `offset`. Returns false when
    /// the field is missing or not a reference.
    pub fn set_reference(&self, offset: usize, target: Option<ObjectIndex>) -> bool {
        match self.field(offset).and_then(Field::as_ref_slot) {
            Some(slot) => {
                slot.set(target);
                true
            }
            None => false,
        }
    }

    /// Native payload
    pub fn native(&self) -> Option<&dyn NativeObject> {
        self.native.as_deref()
    }

    /// Route `begin_destroy` once. Returns false if it was already routed.
    pub(crate) fn conditional_begin_destroy(&mut self) -> bool {
        if self.flags.contains(ObjectFlags::BEGIN_DESTROYED) {
            return false;
        }
        self.flags.insert(ObjectFlags::BEGIN_DESTROYED);
        if let Some(native) = self.native.as_mut() {
            native.begin_destroy();
        }
        true
    }

    pub(crate) fn is_ready_for_finish_destroy(&mut self) -> bool {
        match self.native.as_mut() {
            Some(native) => native.is_ready_for_finish_destroy(),
            None => true,
        }
    }

    /// Route `finish_destroy` once. Returns false if it was already routed.
    pub(crate) fn conditional_finish_destroy(&mut self) -> bool {
        if self.flags.contains(ObjectFlags::FINISH_DESTROYED) {
            return false;
        }
        debug_assert!(self.flags.contains(ObjectFlags::BEGIN_DESTROYED));
        self.flags.insert(ObjectFlags::FINISH_DESTROYED);
        if let Some(native) = self.native.as_mut() {
            native.finish_destroy();
        }
        true
    }
}

impl fmt::Debug for ObjectInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectInstance")
            .field("type_id", &self.type_id)
            .field("name", &self.name)
            .field("outer", &self.outer)
            .field("flags", &self.flags)
            .field("fields", &self.fields.len())
            .field("native", &self.native.is_some())
            .finish()
    }
}

/// Everything needed to allocate an object.
pub struct ObjectSpec {
    type_id: TypeId,
    name: String,
    outer: Option<ObjectIndex>,
    flags: ObjectFlags,
    fields: Vec<Field>,
    native: Option<Box<dyn NativeObject>>,
}

impl ObjectSpec {
    /// New spec for an instance of `type_id`
    pub fn new(type_id: TypeId, name: impl Into<String>) -> Self {
        Self {
            type_id,
            name: name.into(),
            outer: None,
            flags: ObjectFlags::empty(),
            fields: Vec::new(),
            native: None,
        }
    }

    /// Outer object for path names
    pub fn outer(mut self, outer: ObjectIndex) -> Self {
        self.outer = Some(outer);
        self
    }

    /// Initial instance flags
    pub fn flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Field list matching the type's declared layout
    pub fn fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    /// Native payload
    pub fn native(mut self, native: impl NativeObject) -> Self {
        self.native = Some(Box::new(native));
        self
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }
}
