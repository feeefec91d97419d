//! Type provider: creates and caches type descriptors

use super::{ArrayType, BaseType, ClassMetadata, ClassType, FieldDef, PrimitiveType, TypeError, TypeId};
use crate::bytecode::FieldRef;
use rustc_hash::FxHashMap;

/// Name reported for ids this provider never issued
pub const UNRESOLVED_NAME: &str = "<unresolved>";

struct TypeEntry {
    name: String,
    ty: BaseType,
}

/// Owner of every type descriptor in a VM
///
/// Types are append-only: once created a type lives as long as the provider,
/// so a [`TypeId`] never dangles.
pub struct TypeProvider {
    entries: Vec<TypeEntry>,
    by_name: FxHashMap<String, TypeId>,
    int: TypeId,
    float: TypeId,
    bool: TypeId,
    void: TypeId,
}

impl TypeProvider {
    /// Create a provider holding the primitive types
    pub fn new() -> Self {
        let mut provider = Self {
            entries: Vec::new(),
            by_name: FxHashMap::default(),
            int: TypeId::from_index(0),
            float: TypeId::from_index(0),
            bool: TypeId::from_index(0),
            void: TypeId::from_index(0),
        };
        provider.int = provider.push(PrimitiveType::Int.name().to_string(), BaseType::Primitive(PrimitiveType::Int));
        provider.float = provider.push(PrimitiveType::Float.name().to_string(), BaseType::Primitive(PrimitiveType::Float));
        provider.bool = provider.push(PrimitiveType::Bool.name().to_string(), BaseType::Primitive(PrimitiveType::Bool));
        provider.void = provider.push(PrimitiveType::Void.name().to_string(), BaseType::Primitive(PrimitiveType::Void));
        provider
    }

    fn push(&mut self, name: String, ty: BaseType) -> TypeId {
        let id = TypeId::from_index(self.entries.len());
        self.by_name.insert(name.clone(), id);
        self.entries.push(TypeEntry { name, ty });
        id
    }

    pub fn int(&self) -> TypeId {
        self.int
    }

    pub fn float(&self) -> TypeId {
        self.float
    }

    pub fn bool(&self) -> TypeId {
        self.bool
    }

    pub fn void(&self) -> TypeId {
        self.void
    }

    /// Descriptor for an id issued by this provider
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by a different provider.
    pub fn get(&self, id: TypeId) -> &BaseType {
        &self.entries[id.index()].ty
    }

    /// Descriptor for an id that may come from untrusted input (headers, machine code)
    pub fn try_get(&self, id: TypeId) -> Option<&BaseType> {
        self.entries.get(id.index()).map(|entry| &entry.ty)
    }

    /// Canonical name of a type; ids this provider never issued read as `<unresolved>`
    pub fn name(&self, id: TypeId) -> &str {
        self.entries
            .get(id.index())
            .map_or(UNRESOLVED_NAME, |entry| entry.name.as_str())
    }

    /// Check that `id` was issued by this provider
    pub fn resolve(&self, id: TypeId) -> Result<&BaseType, TypeError> {
        self.try_get(id).ok_or(TypeError::UnknownType(id.as_u32()))
    }

    /// Look a type up by its canonical name
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Number of types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: the primitives are always present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The array type with the given element type, created on first use
    pub fn array_of(&mut self, element: TypeId) -> Result<TypeId, TypeError> {
        if element == self.void {
            return Err(TypeError::VoidArrayElement);
        }
        self.resolve(element)?;
        let name = format!("Array[{}]", self.name(element));
        if let Some(id) = self.by_name.get(&name) {
            return Ok(*id);
        }
        Ok(self.push(name, BaseType::Array(ArrayType { element })))
    }

    /// Declare a class whose layout is supplied later by [`TypeProvider::define_class`]
    ///
    /// Declaring first lets a class hold fields of its own type.
    pub fn declare_class(&mut self, name: &str) -> Result<TypeId, TypeError> {
        if self.by_name.contains_key(name) {
            return Err(TypeError::DuplicateType(name.to_string()));
        }
        Ok(self.push(name.to_string(), BaseType::Class(ClassType::new(name.to_string()))))
    }

    /// Freeze the field layout of a declared class
    pub fn define_class(&self, class: TypeId, fields: Vec<FieldDef>) -> Result<(), TypeError> {
        let name = self.name(class);
        let class_type = self
            .resolve(class)?
            .as_class()
            .ok_or_else(|| TypeError::NotAClass(name.to_string()))?;
        if class_type.is_defined() {
            return Err(TypeError::ClassAlreadyDefined(name.to_string()));
        }

        for def in &fields {
            self.resolve(def.ty)?;
        }
        let metadata = ClassMetadata::layout(name, fields, |ty| (self.size_of(ty), self.is_reference(ty)))?;

        class_type
            .metadata
            .set(metadata)
            .map_err(|_| TypeError::ClassAlreadyDefined(name.to_string()))
    }

    /// Declare and define a class in one step
    pub fn create_class(&mut self, name: &str, fields: Vec<FieldDef>) -> Result<TypeId, TypeError> {
        let id = self.declare_class(name)?;
        self.define_class(id, fields)?;
        Ok(id)
    }

    /// Field layout of a class type
    pub fn class_metadata(&self, id: TypeId) -> Option<&ClassMetadata> {
        self.try_get(id)?.as_class()?.metadata()
    }

    /// Element type of an array type
    pub fn element_type(&self, id: TypeId) -> Option<TypeId> {
        self.try_get(id)?.as_array().map(ArrayType::element)
    }

    /// Size of a value of this type at rest
    pub fn size_of(&self, id: TypeId) -> usize {
        self.try_get(id).map_or(0, BaseType::size_of)
    }

    /// Whether values of this type are references
    pub fn is_reference(&self, id: TypeId) -> bool {
        self.try_get(id).is_some_and(BaseType::is_reference)
    }

    /// Resolve `class.field` into the operand form used by field instructions
    pub fn field_ref(&self, class: TypeId, field: &str) -> Option<FieldRef> {
        let metadata = self.class_metadata(class)?;
        let index = metadata.field_index(field)?;
        let resolved = &metadata.fields()[index];
        Some(FieldRef {
            class,
            index,
            offset: resolved.layout_offset(),
            ty: resolved.ty(),
        })
    }
}

impl Default for TypeProvider {
    fn default() -> Self {
        Self::new()
    }
}
