//! Reference token streams
//!
//! A type's token stream is a flat list of [`Token`]s describing where an
//! instance stores object references. The processor walks it instead of
//! inspecting instances reflectively. Fixed arrays and arrays of structs open
//! a body that is closed by [`Token::Return`]; the opening token carries the
//! body length so the walker can iterate the body once per element and then
//! jump past it.

use std::ops::Range;

use crate::error::{GcError, GcResult};
use crate::object::{Field, ObjectIndex, ObjectInstance, RefSlot};
use crate::processor::ReferenceCollector;

/// Reports the references held by a map or set field.
pub type ContainerReferencer = fn(&Field, &mut dyn ReferenceCollector);

/// Reports references that cannot be described by field offsets.
pub type NativeReferencer = fn(&ObjectInstance, &mut dyn ReferenceCollector);

/// One reference descriptor.
///
/// Offsets are field-list indices relative to the enclosing body: the
/// instance itself at top level, the current element inside a fixed-array
/// body, or the element's own field list inside a struct-array body.
#[derive(Debug, Clone, Copy)]
pub enum Token {
    /// Single `Ref` field
    Direct {
        /// Field offset
        offset: usize,
    },
    /// `count` consecutive elements of `stride` fields each; the following
    /// `skip` tokens (the last being `Return`) form the element body
    FixedArray {
        /// Offset of the first element
        offset: usize,
        /// Fields per element
        stride: usize,
        /// Element count
        count: usize,
        /// Body length including the closing `Return`
        skip: usize,
    },
    /// `RefArray` field
    DynamicArrayOfReferences {
        /// Field offset
        offset: usize,
    },
    /// `StructArray` field; the following `skip` tokens form the element body
    DynamicArrayOfStructs {
        /// Field offset
        offset: usize,
        /// Fields per element
        stride: usize,
        /// Body length including the closing `Return`
        skip: usize,
    },
    /// `Map` or `Set` field handled by a container referencer
    MapOrSet {
        /// Field offset
        offset: usize,
        /// Reports the container's references
        referencer: ContainerReferencer,
    },
    /// Hand-written reference reporting for the whole instance
    NativeCallback(NativeReferencer),
    /// Closes a fixed-array or struct-array body
    Return,
    /// Terminates a non-empty stream
    EndOfStream,
}

impl Token {
    fn body_len(&self) -> Option<usize> {
        match *self {
            Token::FixedArray { skip, .. } | Token::DynamicArrayOfStructs { skip, .. } => {
                Some(skip)
            }
            _ => None,
        }
    }

    fn set_body_len(&mut self, len: usize) {
        if let Token::FixedArray { skip, .. } | Token::DynamicArrayOfStructs { skip, .. } = self {
            *skip = len;
        }
    }
}

/// Assembled token list of one type.
#[derive(Debug, Clone, Default)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    /// Tokens in walk order
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Number of tokens, terminator included
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Empty streams carry no terminator and are never walked
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Whether the stream ends with `EndOfStream`
    pub fn is_terminated(&self) -> bool {
        matches!(self.tokens.last(), Some(Token::EndOfStream))
    }

    /// Number of native callback tokens (0 or 1 for an assembled stream)
    pub fn native_callback_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| matches!(t, Token::NativeCallback(_)))
            .count()
    }
}

/// Name and offset of the field behind a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugTokenInfo {
    /// Declared field name
    pub name: String,
    /// Offset relative to the token's body
    pub offset: usize,
}

/// Token index to field name map, used for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct DebugTokenMap {
    entries: Vec<DebugTokenInfo>,
}

impl DebugTokenMap {
    /// Info for token `index`
    pub fn get(&self, index: usize) -> Option<&DebugTokenInfo> {
        self.entries.get(index)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Incremental token stream construction.
#[derive(Debug, Default)]
pub struct TokenStreamBuilder {
    tokens: Vec<Token>,
    debug: Vec<DebugTokenInfo>,
    open_bodies: Vec<usize>,
}

impl TokenStreamBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens emitted so far
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing has been emitted
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn emit(&mut self, token: Token, name: &str, offset: usize) -> usize {
        self.tokens.push(token);
        self.debug.push(DebugTokenInfo {
            name: name.to_owned(),
            offset,
        });
        self.tokens.len() - 1
    }

    /// Prepend-style inheritance: copy a base stream without its terminator.
    pub fn append_base(&mut self, base: &TokenStream, debug: &DebugTokenMap) {
        let end = if base.is_terminated() {
            base.len() - 1
        } else {
            base.len()
        };
        for (index, token) in base.tokens[..end].iter().enumerate() {
            self.tokens.push(*token);
            self.debug.push(debug.get(index).cloned().unwrap_or(DebugTokenInfo {
                name: String::new(),
                offset: 0,
            }));
        }
    }

    /// `Ref` field at `offset`
    pub fn emit_object_reference(&mut self, offset: usize, name: &str) {
        self.emit(Token::Direct { offset }, name, offset);
    }

    /// `RefArray` field at `offset`
    pub fn emit_object_array_reference(&mut self, offset: usize, name: &str) {
        self.emit(Token::DynamicArrayOfReferences { offset }, name, offset);
    }

    /// `Map`/`Set` field at `offset`
    pub fn emit_map_reference(
        &mut self,
        offset: usize,
        name: &str,
        referencer: ContainerReferencer,
    ) {
        self.emit(Token::MapOrSet { offset, referencer }, name, offset);
    }

    /// Open the element body of a `StructArray` field.
    pub fn emit_struct_array_begin(&mut self, offset: usize, stride: usize, name: &str) {
        let at = self.emit(
            Token::DynamicArrayOfStructs {
                offset,
                stride,
                skip: 0,
            },
            name,
            offset,
        );
        self.open_bodies.push(at);
    }

    /// Close the innermost struct-array body; an empty body is dropped
    /// together with its opening token. Returns whether the body was kept.
    pub fn emit_struct_array_end(&mut self) -> bool {
        self.close_body()
    }

    /// Open the element body of an inline fixed array.
    pub fn emit_fixed_array_begin(
        &mut self,
        offset: usize,
        stride: usize,
        count: usize,
        name: &str,
    ) {
        let at = self.emit(
            Token::FixedArray {
                offset,
                stride,
                count,
                skip: 0,
            },
            name,
            offset,
        );
        self.open_bodies.push(at);
    }

    /// Close the innermost fixed-array body; see `emit_struct_array_end`.
    pub fn emit_fixed_array_end(&mut self) -> bool {
        self.close_body()
    }

    /// Close the innermost body and record its length on the opening token.
    ///
    /// A body that emitted nothing is removed together with its opening
    /// token; returns whether the body was kept.
    fn close_body(&mut self) -> bool {
        let Some(begin) = self.open_bodies.pop() else {
            return false;
        };
        if begin + 1 == self.tokens.len() {
            self.tokens.truncate(begin);
            self.debug.truncate(begin);
            return false;
        }
        self.emit(Token::Return, "", 0);
        let len = self.tokens.len() - begin - 1;
        self.tokens[begin].set_body_len(len);
        true
    }

    /// Install `callback`, replacing an inherited one in place.
    pub fn replace_or_add_native_callback(&mut self, callback: NativeReferencer) {
        match self
            .tokens
            .iter()
            .position(|t| matches!(t, Token::NativeCallback(_)))
        {
            Some(at) => self.tokens[at] = Token::NativeCallback(callback),
            None => {
                self.emit(Token::NativeCallback(callback), "", 0);
            }
        }
    }

    /// Finish the stream; non-empty streams get an `EndOfStream` terminator.
    pub fn finish(mut self) -> (TokenStream, DebugTokenMap) {
        debug_assert!(self.open_bodies.is_empty(), "unclosed token stream body");
        if !self.tokens.is_empty() {
            self.emit(Token::EndOfStream, "", 0);
        }
        (
            TokenStream {
                tokens: self.tokens,
            },
            DebugTokenMap {
                entries: self.debug,
            },
        )
    }
}

/// Receives the references found while walking a token stream.
pub trait TokenVisitor: ReferenceCollector {
    /// Called before the references of token `index` are reported;
    /// `None` for native callbacks.
    fn enter_token(&mut self, index: Option<usize>);
}

/// Visitor that records every non-null target.
#[derive(Debug, Default)]
pub(crate) struct TargetGatherer {
    pub(crate) targets: Vec<ObjectIndex>,
}

impl ReferenceCollector for TargetGatherer {
    fn handle_reference(&mut self, slot: &RefSlot) {
        if let Some(target) = slot.get() {
            self.targets.push(target);
        }
    }
}

impl TokenVisitor for TargetGatherer {
    fn enter_token(&mut self, _index: Option<usize>) {}
}

/// Report every reference of `instance` described by `stream` to `visitor`.
///
/// Fails with [`GcError::LayoutMismatch`] when the instance's field list does
/// not have the shape the stream expects.
pub fn walk_references<V: TokenVisitor>(
    stream: &TokenStream,
    type_name: &str,
    instance: &ObjectInstance,
    visitor: &mut V,
) -> GcResult<()> {
    if stream.is_empty() {
        return Ok(());
    }
    let walker = Walker {
        tokens: stream.tokens(),
        type_name,
        instance,
    };
    walker.walk(0..stream.len(), instance.fields(), 0, visitor)
}

struct Walker<'a> {
    tokens: &'a [Token],
    type_name: &'a str,
    instance: &'a ObjectInstance,
}

impl<'a> Walker<'a> {
    fn field<'f>(
        &self,
        fields: &'f [Field],
        offset: usize,
        expected: &'static str,
    ) -> GcResult<&'f Field> {
        fields
            .get(offset)
            .ok_or_else(|| self.mismatch(offset, expected, None))
    }

    fn mismatch(&self, offset: usize, expected: &'static str, found: Option<&Field>) -> GcError {
        GcError::LayoutMismatch {
            type_name: self.type_name.to_owned(),
            offset,
            expected,
            found: found.map_or("nothing", Field::kind_name),
        }
    }

    fn body(&self, at: usize, skip: usize) -> Range<usize> {
        // Body excludes the closing Return.
        at + 1..at + skip
    }

    fn walk<V: TokenVisitor>(
        &self,
        range: Range<usize>,
        fields: &[Field],
        base: usize,
        visitor: &mut V,
    ) -> GcResult<()> {
        let mut at = range.start;
        while at < range.end {
            let token = self.tokens[at];
            match token {
                Token::Direct { offset } => {
                    let slot = match self.field(fields, base + offset, "reference")? {
                        Field::Ref(slot) => slot,
                        other => return Err(self.mismatch(base + offset, "reference", Some(other))),
                    };
                    visitor.enter_token(Some(at));
                    visitor.handle_reference(slot);
                }
                Token::FixedArray {
                    offset,
                    stride,
                    count,
                    skip,
                } => {
                    let body = self.body(at, skip);
                    for element in 0..count {
                        let element_base = base + offset + element * stride;
                        self.walk(body.clone(), fields, element_base, visitor)?;
                    }
                }
                Token::DynamicArrayOfReferences { offset } => {
                    let expected = "reference array";
                    let slots = match self.field(fields, base + offset, expected)? {
                        Field::RefArray(slots) => slots,
                        other => return Err(self.mismatch(base + offset, expected, Some(other))),
                    };
                    visitor.enter_token(Some(at));
                    visitor.handle_references(slots);
                }
                Token::DynamicArrayOfStructs {
                    offset,
                    stride: _,
                    skip,
                } => {
                    let elements = match self.field(fields, base + offset, "struct array")? {
                        Field::StructArray(elements) => elements,
                        other => {
                            return Err(self.mismatch(base + offset, "struct array", Some(other)));
                        }
                    };
                    let body = self.body(at, skip);
                    for element in elements {
                        self.walk(body.clone(), element, 0, visitor)?;
                    }
                }
                Token::MapOrSet { offset, referencer } => {
                    let field = self.field(fields, base + offset, "map or set")?;
                    if !matches!(field, Field::Map(_) | Field::Set(_)) {
                        return Err(self.mismatch(base + offset, "map or set", Some(field)));
                    }
                    visitor.enter_token(Some(at));
                    referencer(field, visitor);
                }
                Token::NativeCallback(callback) => {
                    visitor.enter_token(None);
                    callback(self.instance, visitor);
                }
                Token::Return | Token::EndOfStream => return Ok(()),
            }
            at += 1 + token.body_len().unwrap_or(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectSpec;
    use crate::types::TypeId;

    #[derive(Default)]
    struct Recorder {
        token: Option<usize>,
        seen: Vec<(Option<usize>, Option<ObjectIndex>)>,
    }

    impl ReferenceCollector for Recorder {
        fn handle_reference(&mut self, slot: &RefSlot) {
            self.seen.push((self.token, slot.get()));
        }
    }

    impl TokenVisitor for Recorder {
        fn enter_token(&mut self, index: Option<usize>) {
            self.token = index;
        }
    }

    fn native_refs(_: &ObjectInstance, collector: &mut dyn ReferenceCollector) {
        collector.handle_reference(&RefSlot::new(Some(ObjectIndex(77))));
    }

    fn other_native_refs(_: &ObjectInstance, _: &mut dyn ReferenceCollector) {}

    #[test]
    fn test_empty_body_is_dropped() {
        let mut builder = TokenStreamBuilder::new();
        builder.emit_fixed_array_begin(0, 2, 4, "Pairs");
        assert!(!builder.emit_fixed_array_end());
        assert!(builder.is_empty());

        let (stream, debug) = builder.finish();
        assert!(stream.is_empty());
        assert!(!stream.is_terminated());
        assert!(debug.is_empty());
    }

    #[test]
    fn test_skip_counts_body_and_return() {
        let mut builder = TokenStreamBuilder::new();
        builder.emit_struct_array_begin(1, 2, "Items");
        builder.emit_object_reference(0, "Owner");
        builder.emit_object_reference(1, "Target");
        assert!(builder.emit_struct_array_end());
        builder.emit_object_reference(2, "Next");
        let (stream, debug) = builder.finish();

        assert!(matches!(
            stream.tokens()[0],
            Token::DynamicArrayOfStructs { skip: 3, .. }
        ));
        assert!(matches!(stream.tokens()[3], Token::Return));
        assert!(matches!(stream.tokens()[4], Token::Direct { offset: 2 }));
        assert!(stream.is_terminated());
        assert_eq!(debug.get(4).map(|d| d.name.as_str()), Some("Next"));
    }

    #[test]
    fn test_native_callback_is_replaced() {
        let mut base = TokenStreamBuilder::new();
        base.emit_object_reference(0, "Outer");
        base.replace_or_add_native_callback(native_refs);
        let (base_stream, base_debug) = base.finish();

        let mut derived = TokenStreamBuilder::new();
        derived.append_base(&base_stream, &base_debug);
        derived.replace_or_add_native_callback(other_native_refs);
        let (stream, _) = derived.finish();

        assert_eq!(stream.native_callback_count(), 1);
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn test_walk_visits_nested_layouts() {
        // Fields: [0] Ref, [1..5] fixed array of 2 x (Scalar, Ref), [5] StructArray of (Ref)
        let mut builder = TokenStreamBuilder::new();
        builder.emit_object_reference(0, "Head");
        builder.emit_fixed_array_begin(1, 2, 2, "Pairs");
        builder.emit_object_reference(1, "Value");
        builder.emit_fixed_array_end();
        builder.emit_struct_array_begin(5, 1, "Entries");
        builder.emit_object_reference(0, "Entry");
        builder.emit_struct_array_end();
        builder.replace_or_add_native_callback(native_refs);
        let (stream, _) = builder.finish();

        let instance = ObjectInstance::from_spec(ObjectSpec::new(TypeId(0), "walked").fields(vec![
            Field::reference(Some(ObjectIndex(1))),
            Field::Scalar(0),
            Field::reference(Some(ObjectIndex(2))),
            Field::Scalar(0),
            Field::reference(None),
            Field::StructArray(vec![
                vec![Field::reference(Some(ObjectIndex(3)))],
                vec![Field::reference(Some(ObjectIndex(4)))],
            ]),
        ]));

        let mut recorder = Recorder::default();
        walk_references(&stream, "Walked", &instance, &mut recorder).unwrap();
        let targets: Vec<_> = recorder.seen.iter().map(|(_, t)| *t).collect();
        assert_eq!(
            targets,
            vec![
                Some(ObjectIndex(1)),
                Some(ObjectIndex(2)),
                None,
                Some(ObjectIndex(3)),
                Some(ObjectIndex(4)),
                Some(ObjectIndex(77)),
            ]
        );
        assert_eq!(recorder.seen[0].0, Some(0));
        assert_eq!(recorder.seen[5].0, None);
    }

    #[test]
    fn test_walk_reports_layout_mismatch() {
        let mut builder = TokenStreamBuilder::new();
        builder.emit_object_reference(1, "Missing");
        let (stream, _) = builder.finish();
        let instance = ObjectInstance::from_spec(
            ObjectSpec::new(TypeId(0), "short").fields(vec![Field::Scalar(3)]),
        );

        let err =
            walk_references(&stream, "Short", &instance, &mut Recorder::default()).unwrap_err();
        assert!(matches!(
            err,
            GcError::LayoutMismatch {
                offset: 1,
                found: "nothing",
                ..
            }
        ));
    }

    #[test]
    fn test_layout_mismatch_names_the_field_found() {
        let mut builder = TokenStreamBuilder::new();
        builder.emit_object_reference(0, "Target");
        let (stream, _) = builder.finish();
        let instance = ObjectInstance::from_spec(
            ObjectSpec::new(TypeId(0), "wrong").fields(vec![Field::references([])]),
        );

        let err =
            walk_references(&stream, "Wrong", &instance, &mut Recorder::default()).unwrap_err();
        assert!(matches!(
            err,
            GcError::LayoutMismatch {
                expected: "reference",
                found: "reference array",
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "token stream of Wrong expects reference at field 0, found reference array"
        );
    }
}
