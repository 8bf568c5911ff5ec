//! Type registry and token stream assembly
//!
//! Each registered type declares its field layout as a list of [`Property`]s.
//! Assembly mirrors the properties that can hold references into token
//! descriptors, prepends the base type's stream and installs the type's
//! native referencer.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::error::{GcError, GcResult};
use crate::object::{Field, ObjectInstance};
use crate::processor::ReferenceCollector;
use crate::token_stream::{
    ContainerReferencer, DebugTokenMap, NativeReferencer, TokenStream, TokenStreamBuilder,
};

/// Registered type handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Shape of a declared property.
#[derive(Debug, Clone)]
pub enum PropertyKind {
    /// Plain data
    Scalar,
    /// Object reference (`Field::Ref`)
    Object,
    /// Embedded struct, flattened into the enclosing field list
    Struct(Vec<Property>),
    /// Growable array (`Field::RefArray` for objects, `Field::StructArray` for structs)
    Array(Box<PropertyKind>),
    /// Key/value container
    Map {
        /// Key shape
        key: Box<PropertyKind>,
        /// Value shape
        value: Box<PropertyKind>,
    },
    /// Set container
    Set(Box<PropertyKind>),
}

impl PropertyKind {
    /// Number of field-list slots one value of this kind occupies
    pub fn size(&self) -> usize {
        match self {
            PropertyKind::Struct(properties) => struct_size(properties),
            _ => 1,
        }
    }

    /// Whether values of this kind can hold object references
    pub fn contains_references(&self) -> bool {
        match self {
            PropertyKind::Scalar => false,
            PropertyKind::Object => true,
            PropertyKind::Struct(properties) => {
                properties.iter().any(|p| p.kind.contains_references())
            }
            PropertyKind::Array(inner) | PropertyKind::Set(inner) => inner.contains_references(),
            PropertyKind::Map { key, value } => {
                key.contains_references() || value.contains_references()
            }
        }
    }
}

fn struct_size(properties: &[Property]) -> usize {
    properties
        .iter()
        .map(|p| p.offset + p.size())
        .max()
        .unwrap_or(0)
}

/// A declared field.
#[derive(Debug, Clone)]
pub struct Property {
    /// Field name, used in diagnostics
    pub name: String,
    /// Offset into the enclosing field list
    pub offset: usize,
    /// Shape
    pub kind: PropertyKind,
    /// Inline array dimension; 1 for a plain field
    pub array_dim: usize,
}

impl Property {
    /// Plain field
    pub fn new(name: impl Into<String>, offset: usize, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            offset,
            kind,
            array_dim: 1,
        }
    }

    /// Inline fixed array of `dim` elements
    pub fn fixed_array(
        name: impl Into<String>,
        offset: usize,
        kind: PropertyKind,
        dim: usize,
    ) -> Self {
        Self {
            array_dim: dim,
            ..Self::new(name, offset, kind)
        }
    }

    /// Field-list slots occupied, array dimension included
    pub fn size(&self) -> usize {
        self.kind.size() * self.array_dim
    }
}

/// Reports every reference slot of a map or set.
pub fn container_referencer(field: &Field, collector: &mut dyn ReferenceCollector) {
    field.for_each_ref_slot(&mut |slot| collector.handle_reference(slot));
}

/// Forwards to the instance's [`NativeObject::add_referenced_objects`](crate::NativeObject).
pub fn native_object_referencer(instance: &ObjectInstance, collector: &mut dyn ReferenceCollector) {
    if let Some(native) = instance.native() {
        native.add_referenced_objects(collector);
    }
}

/// Registered type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    name: String,
    base: Option<TypeId>,
    properties: Vec<Property>,
    native_referencer: Option<NativeReferencer>,
    container_referencer: ContainerReferencer,
    token_stream: TokenStream,
    debug_map: DebugTokenMap,
    assembled: bool,
}

impl TypeInfo {
    /// New type without properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            properties: Vec::new(),
            native_referencer: None,
            container_referencer,
            token_stream: TokenStream::default(),
            debug_map: DebugTokenMap::default(),
            assembled: false,
        }
    }

    /// Inherit the base type's layout and token stream
    pub fn base(mut self, base: TypeId) -> Self {
        self.base = Some(base);
        self
    }

    /// Declare a property
    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Install a native referencer
    pub fn native_referencer(mut self, referencer: NativeReferencer) -> Self {
        self.native_referencer = Some(referencer);
        self
    }

    /// Route to the instance's `NativeObject::add_referenced_objects`
    pub fn with_native_references(self) -> Self {
        self.native_referencer(native_object_referencer)
    }

    /// Override how map and set properties report references
    pub fn container_referencer(mut self, referencer: ContainerReferencer) -> Self {
        self.container_referencer = referencer;
        self
    }

    /// Type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base type
    pub fn base_type(&self) -> Option<TypeId> {
        self.base
    }

    /// Declared properties (excluding the base type's)
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Assembled token stream
    pub fn token_stream(&self) -> &TokenStream {
        &self.token_stream
    }

    /// Token index to field name map
    pub fn debug_map(&self) -> &DebugTokenMap {
        &self.debug_map
    }

    /// Whether the token stream has been assembled
    pub fn is_assembled(&self) -> bool {
        self.assembled
    }
}

/// Registry of all types known to a collector.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
    by_name: FxHashMap<String, TypeId>,
}

impl TypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. The base type, if any, must already be registered.
    pub fn register(&mut self, info: TypeInfo) -> GcResult<TypeId> {
        if let Some(base) = info.base
            && self.get(base).is_none()
        {
            return Err(GcError::UnknownType(base));
        }
        if self.by_name.contains_key(&info.name) {
            return Err(GcError::DuplicateType(info.name));
        }
        let id = TypeId(self.types.len() as u32);
        self.by_name.insert(info.name.clone(), id);
        self.types.push(info);
        Ok(id)
    }

    /// Type by id
    pub fn get(&self, id: TypeId) -> Option<&TypeInfo> {
        self.types.get(id.0 as usize)
    }

    /// Type by name
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types are registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Name of `id`, or a placeholder for unknown ids
    pub fn type_name(&self, id: TypeId) -> &str {
        self.get(id).map_or("<unknown type>", TypeInfo::name)
    }

    /// Build the token stream of `id`.
    ///
    /// Does nothing if the stream is already assembled unless `force` is set,
    /// in which case the stream and debug map are rebuilt from scratch. Base
    /// types are assembled first (without forcing).
    pub fn assemble_token_stream(&mut self, id: TypeId, force: bool) -> GcResult<()> {
        let info = self.get(id).ok_or(GcError::UnknownType(id))?;
        if info.assembled && !force {
            return Ok(());
        }

        let mut builder = TokenStreamBuilder::new();
        if let Some(base) = info.base {
            self.assemble_token_stream(base, false)?;
            let base_info = self.get(base).ok_or(GcError::UnknownType(base))?;
            builder.append_base(&base_info.token_stream, &base_info.debug_map);
        }

        let info = self.get(id).ok_or(GcError::UnknownType(id))?;
        for property in &info.properties {
            emit_reference_info(&mut builder, property, info.container_referencer);
        }
        if let Some(referencer) = info.native_referencer {
            builder.replace_or_add_native_callback(referencer);
        }
        let (stream, debug) = builder.finish();

        tracing::trace!(
            target: "sable::gc",
            type_name = %info.name,
            tokens = stream.len(),
            force,
            "Assembled token stream"
        );

        let info = &mut self.types[id.0 as usize];
        info.token_stream = stream;
        info.debug_map = debug;
        info.assembled = true;
        Ok(())
    }
}

/// Emit the descriptors for one property. Properties that cannot hold
/// references emit nothing.
pub fn emit_reference_info(
    builder: &mut TokenStreamBuilder,
    property: &Property,
    containers: ContainerReferencer,
) {
    if !property.kind.contains_references() {
        return;
    }
    if property.array_dim > 1 {
        let stride = property.kind.size();
        builder.emit_fixed_array_begin(property.offset, stride, property.array_dim, &property.name);
        emit_value(builder, &property.name, 0, &property.kind, containers);
        builder.emit_fixed_array_end();
    } else {
        emit_value(builder, &property.name, property.offset, &property.kind, containers);
    }
}

fn emit_value(
    builder: &mut TokenStreamBuilder,
    name: &str,
    offset: usize,
    kind: &PropertyKind,
    containers: ContainerReferencer,
) {
    match kind {
        PropertyKind::Scalar => {}
        PropertyKind::Object => builder.emit_object_reference(offset, name),
        PropertyKind::Struct(properties) => {
            // Flattened: inner offsets are shifted into the enclosing body.
            for inner in properties {
                let shifted = Property {
                    offset: offset + inner.offset,
                    ..inner.clone()
                };
                emit_reference_info(builder, &shifted, containers);
            }
        }
        PropertyKind::Array(inner) => match inner.as_ref() {
            PropertyKind::Object => builder.emit_object_array_reference(offset, name),
            PropertyKind::Struct(properties) => {
                builder.emit_struct_array_begin(offset, struct_size(properties), name);
                for inner in properties {
                    emit_reference_info(builder, inner, containers);
                }
                builder.emit_struct_array_end();
            }
            // Arrays of containers or nested arrays are opaque to offsets.
            _ => builder.emit_map_reference(offset, name, containers),
        },
        PropertyKind::Map { .. } | PropertyKind::Set(_) => {
            builder.emit_map_reference(offset, name, containers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_stream::Token;

    fn noop_referencer(_: &ObjectInstance, _: &mut dyn ReferenceCollector) {}

    fn vector_struct() -> PropertyKind {
        PropertyKind::Struct(vec![
            Property::new("X", 0, PropertyKind::Scalar),
            Property::new("Y", 1, PropertyKind::Scalar),
        ])
    }

    #[test]
    fn test_scalar_only_type_has_empty_stream() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                TypeInfo::new("Plain")
                    .property(Property::new("Count", 0, PropertyKind::Scalar))
                    .property(Property::new("Pos", 1, vector_struct())),
            )
            .unwrap();
        registry.assemble_token_stream(id, false).unwrap();

        let info = registry.get(id).unwrap();
        assert!(info.is_assembled());
        assert!(info.token_stream().is_empty());
        assert!(!info.token_stream().is_terminated());
    }

    #[test]
    fn test_base_stream_is_prepended_without_terminator() {
        let mut registry = TypeRegistry::new();
        let base = registry
            .register(TypeInfo::new("Base").property(Property::new(
                "Outer",
                0,
                PropertyKind::Object,
            )))
            .unwrap();
        let derived = registry
            .register(
                TypeInfo::new("Derived")
                    .base(base)
                    .property(Property::new("Target", 1, PropertyKind::Object)),
            )
            .unwrap();
        registry.assemble_token_stream(derived, false).unwrap();

        assert!(registry.get(base).unwrap().is_assembled());
        let info = registry.get(derived).unwrap();
        let tokens = info.token_stream().tokens();
        assert_eq!(tokens.len(), 3);
        assert!(matches!(tokens[0], Token::Direct { offset: 0 }));
        assert!(matches!(tokens[1], Token::Direct { offset: 1 }));
        assert!(matches!(tokens[2], Token::EndOfStream));
        assert_eq!(info.debug_map().get(0).unwrap().name, "Outer");
        assert_eq!(info.debug_map().get(1).unwrap().name, "Target");
    }

    #[test]
    fn test_assembly_is_idempotent_unless_forced() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                TypeInfo::new("Node")
                    .property(Property::new("Next", 0, PropertyKind::Object))
                    .native_referencer(noop_referencer),
            )
            .unwrap();
        registry.assemble_token_stream(id, false).unwrap();
        registry.assemble_token_stream(id, false).unwrap();
        assert_eq!(registry.get(id).unwrap().token_stream().len(), 3);

        registry.assemble_token_stream(id, true).unwrap();
        let stream = registry.get(id).unwrap().token_stream();
        assert_eq!(stream.len(), 3);
        assert_eq!(stream.native_callback_count(), 1);
    }

    #[test]
    fn test_fixed_array_of_structs_uses_struct_stride() {
        let slot = PropertyKind::Struct(vec![
            Property::new("Weight", 0, PropertyKind::Scalar),
            Property::new("Item", 1, PropertyKind::Object),
        ]);
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                TypeInfo::new("Inventory").property(Property::fixed_array("Slots", 2, slot, 4)),
            )
            .unwrap();
        registry.assemble_token_stream(id, false).unwrap();

        let tokens = registry.get(id).unwrap().token_stream().tokens();
        assert!(matches!(
            tokens[0],
            Token::FixedArray {
                offset: 2,
                stride: 2,
                count: 4,
                skip: 2
            }
        ));
        assert!(matches!(tokens[1], Token::Direct { offset: 1 }));
        assert!(matches!(tokens[2], Token::Return));
    }

    #[test]
    fn test_containers_without_references_emit_nothing() {
        let mut registry = TypeRegistry::new();
        let id = registry
            .register(
                TypeInfo::new("Tables")
                    .property(Property::new(
                        "Counts",
                        0,
                        PropertyKind::Map {
                            key: Box::new(PropertyKind::Scalar),
                            value: Box::new(PropertyKind::Scalar),
                        },
                    ))
                    .property(Property::new(
                        "Owners",
                        1,
                        PropertyKind::Set(Box::new(PropertyKind::Object)),
                    )),
            )
            .unwrap();
        registry.assemble_token_stream(id, false).unwrap();

        let tokens = registry.get(id).unwrap().token_stream().tokens();
        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[0], Token::MapOrSet { offset: 1, .. }));
    }

    #[test]
    fn test_register_rejects_unknown_base_and_duplicates() {
        let mut registry = TypeRegistry::new();
        assert!(matches!(
            registry.register(TypeInfo::new("Orphan").base(TypeId(9))),
            Err(GcError::UnknownType(TypeId(9)))
        ));
        registry.register(TypeInfo::new("Once")).unwrap();
        assert!(matches!(
            registry.register(TypeInfo::new("Once")),
            Err(GcError::DuplicateType(_))
        ));
        assert_eq!(registry.lookup("Once"), Some(TypeId(0)));
    }
}
