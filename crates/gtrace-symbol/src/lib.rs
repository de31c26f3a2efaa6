//! This crate parses the target binary for the `gtrace` tracer.
//!
//! From one ELF file with Go-flavored DWARF it produces everything the
//! observation layer asks the binary for at runtime:
//!
//! - the function list, with entry/end addresses and the parameter layout
//!   (stack offsets relative to the argument base, input/output partition),
//! - a table of debugging-type descriptors, indexed three ways: by identity
//!   ([`TypeRef`]), by declared name, and by Go runtime-type offset (the key
//!   used when resolving interface payloads),
//! - the `runtime.g` and `runtime.moduledata` struct descriptors,
//! - the address of the runtime's first module-data record, and the address
//!   of the `runtime.buildVersion` string variable.
//!
//! All parsing happens once in [`Binary::open`]; the result is an immutable
//! lookup structure with no further file access.

mod binary;
mod error;
mod function;
mod types;

pub use self::binary::Binary;
pub use self::error::{Error, Result};
pub use self::function::{Function, Parameter};
pub use self::types::{Field, TypeDescriptor, TypeKind, TypeRef, TypeTable};
