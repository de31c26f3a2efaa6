use std::collections::HashMap;

/// Handle of one type descriptor inside a [`TypeTable`].
///
/// Plain index into the table's arena; descriptors reference each other
/// through these handles, which keeps self-referential types (linked lists,
/// trees) representable without reference cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(pub(crate) usize);

/// One debugging-type descriptor.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    /// Declared name; empty for anonymous types.
    pub name: String,

    /// Byte size of a value of this type.
    pub size: u64,

    pub kind: TypeKind,
}

/// Shape of a debugging type.
#[derive(Debug, Clone)]
pub enum TypeKind {
    Int,
    Uint,
    Float,
    Complex,
    Bool,

    /// Data pointer; `pointee` is absent for `unsafe.Pointer`-like types.
    Pointer { pointee: Option<TypeRef> },

    /// Function pointer; never dereferenced.
    Function,

    Struct { fields: Vec<Field> },

    Array { element: TypeRef, count: i64 },

    /// Named alias; `underlying` is absent when the definition was not
    /// translatable.
    Typedef { underlying: Option<TypeRef> },

    /// Anything the tracer has no decoding rule for.
    Unsupported,
}

/// One member of a struct type.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,

    /// Byte offset of the member inside the struct.
    pub offset: u64,

    pub typ: TypeRef,
}

/// Arena of type descriptors plus the lookup indexes over them.
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Vec<TypeDescriptor>,

    /// Declared name -> descriptor, for the handful of runtime types the
    /// tracer looks up directly (`runtime.g`, `runtime.moduledata`, ...).
    by_name: HashMap<String, TypeRef>,

    /// Go runtime-type offset -> descriptor. The offset is relative to the
    /// owning module's `types` base address.
    by_runtime_offset: HashMap<u64, TypeRef>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor and returns its handle.
    pub fn push(&mut self, descriptor: TypeDescriptor) -> TypeRef {
        let r = TypeRef(self.types.len());
        self.types.push(descriptor);
        r
    }

    /// Replaces the descriptor behind an existing handle.
    ///
    /// Used while translating recursive types: a placeholder is registered
    /// first so that inner references resolve, then patched.
    pub(crate) fn replace(&mut self, r: TypeRef, descriptor: TypeDescriptor) {
        self.types[r.0] = descriptor;
    }

    pub fn get(&self, r: TypeRef) -> &TypeDescriptor {
        &self.types[r.0]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<TypeRef> {
        self.by_name.get(name).copied()
    }

    pub fn by_runtime_offset(&self, offset: u64) -> Option<TypeRef> {
        self.by_runtime_offset.get(&offset).copied()
    }

    pub fn record_name(&mut self, name: &str, r: TypeRef) {
        self.by_name.entry(name.to_owned()).or_insert(r);
    }

    pub fn record_runtime_offset(&mut self, offset: u64, r: TypeRef) {
        self.by_runtime_offset.entry(offset).or_insert(r);
    }

    /// Follows typedef links down to the defining type.
    pub fn strip_typedefs(&self, mut r: TypeRef) -> TypeRef {
        while let TypeKind::Typedef {
            underlying: Some(u),
        } = self.get(r).kind
        {
            r = u;
        }
        r
    }

    /// Looks up a struct member by name, following typedefs first.
    pub fn field<'a>(&'a self, r: TypeRef, name: &str) -> Option<&'a Field> {
        match &self.get(self.strip_typedefs(r)).kind {
            TypeKind::Struct { fields } => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }
}
