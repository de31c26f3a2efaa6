use std::collections::HashMap;
use std::path::Path;

use gimli::{AttributeValue, EndianSlice, LittleEndian, Operation};
use goblin::elf::header::EM_X86_64;
use goblin::elf::Elf;

use crate::{Error, Field, Function, Parameter, Result};
use crate::{TypeDescriptor, TypeKind, TypeRef, TypeTable};

type Reader<'data> = EndianSlice<'data, LittleEndian>;

const FIRST_MODULE_DATA_SYMBOL: &str = "runtime.firstmoduledata";
const BUILD_VERSION_SYMBOL: &str = "runtime.buildVersion";

const MODULE_DATA_TYPE: &str = "runtime.moduledata";
const ROUTINE_DESCRIPTOR_TYPE: &str = "runtime.g";

/// Go toolchain DWARF extension attribute, not defined by `gimli`.
const DW_AT_GO_RUNTIME_TYPE: gimli::DwAt = gimli::DwAt(0x2904);

/// Parsed view of the target binary.
///
/// Produced once by [`Binary::open`]; afterwards every lookup is an in-memory
/// operation.
pub struct Binary {
    /// Functions sorted by entry address.
    functions: Vec<Function>,

    types: TypeTable,

    /// Address of the runtime's first module-data record.
    first_module_data_addr: u64,

    module_data_type: TypeRef,
    routine_descriptor_type: TypeRef,

    /// Address of the `runtime.buildVersion` string variable, when present.
    build_version_addr: Option<u64>,
}

impl Binary {
    /// Opens and fully parses the binary at `path`.
    ///
    /// Fails if the file is not an x86-64 ELF, carries no DWARF, or lacks the
    /// runtime anchors the tracer depends on (first module-data symbol, the
    /// module-data and routine-descriptor types).
    #[tracing::instrument(name = "OpenBinary", skip_all, fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let data: &'static [u8] = Box::leak(data.into_boxed_slice());

        let elf = Elf::parse(data)?;

        if elf.header.e_machine != EM_X86_64 {
            return Err(Error::ElfPlatform(elf.header.e_machine));
        }

        let first_module_data_addr = symbol_address(&elf, FIRST_MODULE_DATA_SYMBOL)
            .ok_or_else(|| Error::MissingSymbol(FIRST_MODULE_DATA_SYMBOL.to_owned()))?;
        let build_version_addr = symbol_address(&elf, BUILD_VERSION_SYMBOL);

        if section_bytes(&elf, data, ".debug_info").is_none() {
            return Err(Error::MissingDebugInfo);
        }

        let dwarf = gimli::Dwarf::load(|id| -> core::result::Result<_, gimli::Error> {
            let bytes = section_bytes(&elf, data, id.name()).unwrap_or(&[]);
            Ok(EndianSlice::new(bytes, LittleEndian))
        })?;

        let mut loader = DwarfLoader {
            dwarf: &dwarf,
            types: TypeTable::new(),
            translated: HashMap::new(),
            functions: Vec::new(),
        };

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            loader.walk_unit(&unit)?;
        }

        let DwarfLoader {
            types,
            mut functions,
            ..
        } = loader;

        functions.sort_by_key(|f| f.entry);
        functions.dedup_by_key(|f| f.entry);

        tracing::info!(
            functions = functions.len(),
            types = types.len(),
            "binary parsed"
        );

        let module_data_type = types
            .by_name(MODULE_DATA_TYPE)
            .ok_or_else(|| Error::MissingType(MODULE_DATA_TYPE.to_owned()))?;
        let routine_descriptor_type = types
            .by_name(ROUTINE_DESCRIPTOR_TYPE)
            .ok_or_else(|| Error::MissingType(ROUTINE_DESCRIPTOR_TYPE.to_owned()))?;

        Ok(Self {
            functions,
            types,
            first_module_data_addr,
            module_data_type,
            routine_descriptor_type,
            build_version_addr,
        })
    }

    /// All functions of the binary, sorted by entry address.
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Looks a function up by its fully qualified name.
    pub fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Finds the function whose address range contains `pc`.
    pub fn find_function(&self, pc: u64) -> Option<&Function> {
        let idx = self.functions.partition_point(|f| f.entry <= pc);
        let function = self.functions[..idx].last()?;

        if function.end != 0 && pc >= function.end {
            return None;
        }

        Some(function)
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Maps a Go runtime-type offset (relative to the owning module's
    /// `types` base) to its debugging-type descriptor.
    pub fn type_by_runtime_offset(&self, offset: u64) -> Option<TypeRef> {
        self.types.by_runtime_offset(offset)
    }

    pub fn first_module_data_addr(&self) -> u64 {
        self.first_module_data_addr
    }

    pub fn module_data_type(&self) -> TypeRef {
        self.module_data_type
    }

    /// Descriptor of the runtime's routine-descriptor struct (`g`).
    pub fn routine_descriptor_type(&self) -> TypeRef {
        self.routine_descriptor_type
    }

    pub fn build_version_addr(&self) -> Option<u64> {
        self.build_version_addr
    }

    #[cfg(test)]
    pub(crate) fn for_tests(functions: Vec<Function>, types: TypeTable) -> Self {
        let module_data_type = TypeRef(0);
        Self {
            functions,
            types,
            first_module_data_addr: 0,
            module_data_type,
            routine_descriptor_type: module_data_type,
            build_version_addr: None,
        }
    }
}

fn symbol_address(elf: &Elf, name: &str) -> Option<u64> {
    elf.syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some(name))
        .map(|sym| sym.st_value)
}

fn section_bytes<'d>(elf: &Elf, data: &'d [u8], name: &str) -> Option<&'d [u8]> {
    elf.section_headers.iter().find_map(|sh| {
        if elf.shdr_strtab.get_at(sh.sh_name) != Some(name) {
            return None;
        }
        sh.file_range().and_then(|range| data.get(range))
    })
}

/// Function under construction while its parameter DIEs are walked.
struct FunctionBuilder {
    name: String,
    entry: u64,
    end: u64,
    parameters: Vec<Parameter>,
}

impl FunctionBuilder {
    fn finish(self) -> Function {
        Function {
            name: self.name,
            entry: self.entry,
            end: self.end,
            parameters: self.parameters,
        }
    }
}

/// Translation state while walking the DWARF tree.
struct DwarfLoader<'a, 'data> {
    dwarf: &'a gimli::Dwarf<Reader<'data>>,

    types: TypeTable,

    /// DIE offset (within .debug_info) -> already translated descriptor.
    /// Pre-registered before descending so self-referential types terminate.
    translated: HashMap<usize, TypeRef>,

    functions: Vec<Function>,
}

impl<'data> DwarfLoader<'_, 'data> {
    fn walk_unit(&mut self, unit: &gimli::Unit<Reader<'data>>) -> Result<()> {
        let mut depth = 0isize;
        let mut entries = unit.entries();
        let mut current: Option<FunctionBuilder> = None;

        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;

            if depth <= 1 {
                if let Some(builder) = current.take() {
                    self.functions.push(builder.finish());
                }
            }

            match entry.tag() {
                gimli::DW_TAG_subprogram if depth == 1 => {
                    current = self.start_function(unit, entry)?;
                }

                gimli::DW_TAG_formal_parameter if depth == 2 => {
                    if let Some(builder) = current.as_mut() {
                        if let Some(param) = self.translate_parameter(unit, entry)? {
                            builder.parameters.push(param);
                        }
                    }
                }

                gimli::DW_TAG_base_type
                | gimli::DW_TAG_pointer_type
                | gimli::DW_TAG_structure_type
                | gimli::DW_TAG_array_type
                | gimli::DW_TAG_typedef
                | gimli::DW_TAG_subroutine_type
                    if depth == 1 =>
                {
                    self.translate_type_at(unit, entry.offset())?;
                }

                _ => (),
            }
        }

        if let Some(builder) = current.take() {
            self.functions.push(builder.finish());
        }

        Ok(())
    }

    fn start_function(
        &mut self,
        unit: &gimli::Unit<Reader<'data>>,
        entry: &gimli::DebuggingInformationEntry<Reader<'data>>,
    ) -> Result<Option<FunctionBuilder>> {
        let Some(name) = self.entry_name(unit, entry)? else {
            return Ok(None);
        };

        let Some(AttributeValue::Addr(entry_addr)) = entry.attr_value(gimli::DW_AT_low_pc)? else {
            // declaration without code
            return Ok(None);
        };

        let end = match entry.attr_value(gimli::DW_AT_high_pc)? {
            Some(AttributeValue::Addr(addr)) => addr,
            Some(AttributeValue::Udata(size)) => entry_addr + size,
            _ => 0,
        };

        Ok(Some(FunctionBuilder {
            name,
            entry: entry_addr,
            end,
            parameters: Vec::new(),
        }))
    }

    fn translate_parameter(
        &mut self,
        unit: &gimli::Unit<Reader<'data>>,
        entry: &gimli::DebuggingInformationEntry<Reader<'data>>,
    ) -> Result<Option<Parameter>> {
        let Some(AttributeValue::UnitRef(type_offset)) = entry.attr_value(gimli::DW_AT_type)?
        else {
            tracing::debug!("skipping parameter without type");
            return Ok(None);
        };

        let typ = self.translate_type_at(unit, type_offset)?;
        let name = self.entry_name(unit, entry)?.unwrap_or_default();

        let is_output = matches!(
            entry.attr_value(gimli::DW_AT_variable_parameter)?,
            Some(AttributeValue::Flag(true))
        );

        let offset = self.parameter_offset(unit, entry)?;

        Ok(Some(Parameter {
            name,
            typ,
            offset: offset.unwrap_or_default(),
            is_output,
            exists: offset.is_some(),
        }))
    }

    /// Byte offset of the parameter from the argument base, extracted from
    /// its location expression. Go emits either a frame-base-relative offset
    /// or a bare CFA reference (offset 0).
    fn parameter_offset(
        &self,
        unit: &gimli::Unit<Reader<'data>>,
        entry: &gimli::DebuggingInformationEntry<Reader<'data>>,
    ) -> Result<Option<i64>> {
        let Some(AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_location)? else {
            return Ok(None);
        };

        let mut operations = expr.operations(unit.encoding());

        match operations.next()? {
            Some(Operation::FrameOffset { offset }) => Ok(Some(offset)),
            Some(Operation::CallFrameCFA) => Ok(Some(0)),
            _ => Ok(None),
        }
    }

    /// Translates the type DIE at `offset` into the descriptor table,
    /// returning its handle. Already translated offsets are returned from
    /// the memo table.
    fn translate_type_at(
        &mut self,
        unit: &gimli::Unit<Reader<'data>>,
        offset: gimli::UnitOffset,
    ) -> Result<TypeRef> {
        let key = offset
            .to_debug_info_offset(&unit.header)
            .map(|o| o.0)
            .unwrap_or(offset.0);

        if let Some(&r) = self.translated.get(&key) {
            return Ok(r);
        }

        let r = self.types.push(TypeDescriptor {
            name: String::new(),
            size: 0,
            kind: TypeKind::Unsupported,
        });
        self.translated.insert(key, r);

        let mut tree = unit.entries_tree(Some(offset))?;
        let root = tree.root()?;
        let entry = root.entry().clone();

        let descriptor = self.build_descriptor(unit, &entry, root)?;
        self.types.replace(r, descriptor);

        if let Some(name) = self.entry_name(unit, &entry)? {
            self.types.record_name(&name, r);
        }

        if let Some(AttributeValue::Udata(runtime_offset)) =
            entry.attr_value(DW_AT_GO_RUNTIME_TYPE)?
        {
            self.types.record_runtime_offset(runtime_offset, r);
        }

        Ok(r)
    }

    fn build_descriptor(
        &mut self,
        unit: &gimli::Unit<Reader<'data>>,
        entry: &gimli::DebuggingInformationEntry<Reader<'data>>,
        node: gimli::EntriesTreeNode<'_, '_, '_, Reader<'data>>,
    ) -> Result<TypeDescriptor> {
        let name = self.entry_name(unit, entry)?.unwrap_or_default();
        let size = match entry.attr_value(gimli::DW_AT_byte_size)? {
            Some(attr) => attr.udata_value().unwrap_or(0),
            None => 0,
        };

        let kind = match entry.tag() {
            gimli::DW_TAG_base_type => match entry.attr_value(gimli::DW_AT_encoding)? {
                Some(AttributeValue::Encoding(gimli::DW_ATE_boolean)) => TypeKind::Bool,
                Some(AttributeValue::Encoding(gimli::DW_ATE_float)) => TypeKind::Float,
                Some(AttributeValue::Encoding(gimli::DW_ATE_complex_float)) => TypeKind::Complex,
                Some(AttributeValue::Encoding(
                    gimli::DW_ATE_signed | gimli::DW_ATE_signed_char,
                )) => TypeKind::Int,
                Some(AttributeValue::Encoding(
                    gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char | gimli::DW_ATE_address,
                )) => TypeKind::Uint,
                _ => TypeKind::Unsupported,
            },

            gimli::DW_TAG_pointer_type => {
                let pointee = match entry.attr_value(gimli::DW_AT_type)? {
                    Some(AttributeValue::UnitRef(offset)) => {
                        Some(self.translate_type_at(unit, offset)?)
                    }
                    _ => None,
                };
                TypeKind::Pointer { pointee }
            }

            gimli::DW_TAG_structure_type => TypeKind::Struct {
                fields: self.struct_fields(unit, node)?,
            },

            gimli::DW_TAG_array_type => {
                let element = match entry.attr_value(gimli::DW_AT_type)? {
                    Some(AttributeValue::UnitRef(offset)) => {
                        Some(self.translate_type_at(unit, offset)?)
                    }
                    _ => None,
                };

                match element {
                    Some(element) => TypeKind::Array {
                        element,
                        count: array_count(node)?,
                    },
                    None => TypeKind::Unsupported,
                }
            }

            gimli::DW_TAG_typedef => {
                let underlying = match entry.attr_value(gimli::DW_AT_type)? {
                    Some(AttributeValue::UnitRef(offset)) => {
                        Some(self.translate_type_at(unit, offset)?)
                    }
                    _ => None,
                };
                TypeKind::Typedef { underlying }
            }

            gimli::DW_TAG_subroutine_type => TypeKind::Function,

            _ => TypeKind::Unsupported,
        };

        // pointers and function values are address sized even when the
        // producer omitted the byte size
        let size = match kind {
            TypeKind::Pointer { .. } | TypeKind::Function if size == 0 => 8,
            _ => size,
        };

        Ok(TypeDescriptor { name, size, kind })
    }

    fn struct_fields(
        &mut self,
        unit: &gimli::Unit<Reader<'data>>,
        node: gimli::EntriesTreeNode<'_, '_, '_, Reader<'data>>,
    ) -> Result<Vec<Field>> {
        let mut fields = Vec::new();

        let mut children = node.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();

            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }

            let Some(AttributeValue::UnitRef(type_offset)) = entry.attr_value(gimli::DW_AT_type)?
            else {
                continue;
            };

            let offset = match entry.attr_value(gimli::DW_AT_data_member_location)? {
                Some(attr) => attr.udata_value().unwrap_or(0),
                None => 0,
            };

            let name = self.entry_name(unit, entry)?.unwrap_or_default();
            let typ = self.translate_type_at(unit, type_offset)?;

            fields.push(Field { name, offset, typ });
        }

        Ok(fields)
    }

    fn entry_name(
        &self,
        unit: &gimli::Unit<Reader<'data>>,
        entry: &gimli::DebuggingInformationEntry<Reader<'data>>,
    ) -> Result<Option<String>> {
        let Some(attr) = entry.attr_value(gimli::DW_AT_name)? else {
            return Ok(None);
        };

        let name = self.dwarf.attr_string(unit, attr)?;
        Ok(Some(name.to_string_lossy().into_owned()))
    }
}

fn array_count(node: gimli::EntriesTreeNode<Reader>) -> Result<i64> {
    let mut children = node.children();

    while let Some(child) = children.next()? {
        let entry = child.entry();

        if entry.tag() != gimli::DW_TAG_subrange_type {
            continue;
        }

        if let Some(attr) = entry.attr_value(gimli::DW_AT_count)? {
            if let Some(count) = attr.udata_value() {
                return Ok(count as i64);
            }
        }

        if let Some(attr) = entry.attr_value(gimli::DW_AT_upper_bound)? {
            if let Some(upper) = attr.udata_value() {
                return Ok(upper as i64 + 1);
            }
        }
    }

    // incomplete array
    Ok(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str, entry: u64, end: u64) -> Function {
        Function {
            name: name.to_owned(),
            entry,
            end,
            parameters: Vec::new(),
        }
    }

    #[test]
    fn find_function_respects_ranges() {
        let binary = Binary::for_tests(
            vec![
                function("main.a", 0x1000, 0x1040),
                function("main.b", 0x1040, 0x1080),
                function("main.last", 0x1080, 0),
            ],
            TypeTable::new(),
        );

        assert_eq!(binary.find_function(0x0fff).map(|f| f.name.as_str()), None);
        assert_eq!(
            binary.find_function(0x1000).map(|f| f.name.as_str()),
            Some("main.a")
        );
        assert_eq!(
            binary.find_function(0x103f).map(|f| f.name.as_str()),
            Some("main.a")
        );
        assert_eq!(
            binary.find_function(0x1040).map(|f| f.name.as_str()),
            Some("main.b")
        );

        // unknown end address admits any higher pc
        assert_eq!(
            binary.find_function(0x2000).map(|f| f.name.as_str()),
            Some("main.last")
        );
    }
}
