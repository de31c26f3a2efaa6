use std::rc::Rc;

use gtrace_debugger::MemoryReader;
use gtrace_symbol::{Function, TypeKind, TypeRef, TypeTable};

use crate::{Error, Result};

/// Minimum size the runtime assumes for a function.
const MIN_FUNCTION_SIZE: u64 = 16;

/// Size of one bucket region in the runtime's pc-to-function lookup table.
const PC_BUCKET_SIZE: u64 = 256 * MIN_FUNCTION_SIZE;

/// Sub-buckets per bucket; each covers `PC_BUCKET_SIZE / 16` bytes of code.
const SUB_BUCKETS_PER_BUCKET: u64 = 16;

/// One `findfuncbucket` record: a `u32` base index followed by 16 one-byte
/// sub-bucket deltas.
const FIND_FUNC_BUCKET_SIZE: u64 = 20;

/// Field offsets of the runtime's `moduledata` struct, captured once from
/// the debugging information.
///
/// The struct itself is large and mostly irrelevant; only the offsets of the
/// consulted fields are kept so that views can read single fields on demand.
#[derive(Debug)]
pub struct ModuleDataLayout {
    pub(crate) minpc: u64,
    pub(crate) maxpc: u64,
    pub(crate) types: u64,
    pub(crate) etypes: u64,
    pub(crate) next: u64,
    pub(crate) findfunctab: u64,

    /// Offsets of `ftab.array` / `ftab.len` relative to the module-data
    /// base.
    pub(crate) ftab_array: u64,
    pub(crate) ftab_len: u64,

    /// Size of one `functab` record and the offsets of its two fields.
    pub(crate) functab_size: u64,
    pub(crate) functab_entry: u64,
    pub(crate) functab_funcoff: u64,

    /// Offset of `pclntable.array`.
    pub(crate) pclntable_array: u64,
}

impl ModuleDataLayout {
    /// Derives the layout from the `runtime.moduledata` descriptor.
    pub fn from_table(types: &TypeTable, module_data: TypeRef) -> Result<Self> {
        let field = |name: &str| {
            types.field(module_data, name).ok_or_else(|| {
                Error::FieldNotFound(types.get(module_data).name.clone(), name.to_owned())
            })
        };

        let ftab = field("ftab")?;
        let pclntable = field("pclntable")?;

        let slice_array = |slice: TypeRef| {
            types
                .field(slice, "array")
                .ok_or_else(|| {
                    Error::FieldNotFound(types.get(slice).name.clone(), "array".to_owned())
                })
                .map(|f| (f.offset, f.typ))
        };
        let slice_len_offset = |slice: TypeRef| {
            types
                .field(slice, "len")
                .ok_or_else(|| {
                    Error::FieldNotFound(types.get(slice).name.clone(), "len".to_owned())
                })
                .map(|f| f.offset)
        };

        let (ftab_array_offset, ftab_array_type) = slice_array(ftab.typ)?;
        let (pclntable_array_offset, _) = slice_array(pclntable.typ)?;

        // element type behind `ftab.array` is `*runtime.functab`
        let functab = match &types.get(types.strip_typedefs(ftab_array_type)).kind {
            TypeKind::Pointer {
                pointee: Some(functab),
            } => *functab,
            _ => {
                return Err(Error::FieldNotFound(
                    types.get(module_data).name.clone(),
                    "ftab.array".to_owned(),
                ))
            }
        };

        let functab_field = |name: &str| {
            types
                .field(functab, name)
                .ok_or_else(|| {
                    Error::FieldNotFound(types.get(functab).name.clone(), name.to_owned())
                })
                .map(|f| f.offset)
        };

        Ok(Self {
            minpc: field("minpc")?.offset,
            maxpc: field("maxpc")?.offset,
            types: field("types")?.offset,
            etypes: field("etypes")?.offset,
            next: field("next")?.offset,
            findfunctab: field("findfunctab")?.offset,
            ftab_array: ftab.offset + ftab_array_offset,
            ftab_len: ftab.offset + slice_len_offset(ftab.typ)?,
            functab_size: types.get(functab).size,
            functab_entry: functab_field("entry")?,
            functab_funcoff: functab_field("funcoff")?,
            pclntable_array: pclntable.offset + pclntable_array_offset,
        })
    }
}

/// View over one module-data record in the target's memory.
///
/// The records form a singly linked list in the target; fields are fetched
/// lazily because most of the struct is never consulted.
#[derive(Clone)]
pub struct ModuleData {
    addr: u64,
    layout: Rc<ModuleDataLayout>,
}

impl ModuleData {
    pub fn new(addr: u64, layout: Rc<ModuleDataLayout>) -> Self {
        Self { addr, layout }
    }

    /// Collects the whole module-data list starting at `first`.
    pub fn collect_list<R: MemoryReader>(
        first: u64,
        layout: Rc<ModuleDataLayout>,
        reader: &R,
    ) -> Result<Vec<Self>> {
        let mut list = Vec::new();
        let mut addr = first;

        while addr != 0 {
            let md = Self::new(addr, layout.clone());
            addr = md.next(reader)?;
            list.push(md);
        }

        Ok(list)
    }

    fn read_field<R: MemoryReader>(&self, reader: &R, offset: u64) -> Result<u64> {
        reader.read_u64(self.addr + offset).map_err(Into::into)
    }

    pub fn minpc<R: MemoryReader>(&self, reader: &R) -> Result<u64> {
        self.read_field(reader, self.layout.minpc)
    }

    pub fn maxpc<R: MemoryReader>(&self, reader: &R) -> Result<u64> {
        self.read_field(reader, self.layout.maxpc)
    }

    pub fn types_base<R: MemoryReader>(&self, reader: &R) -> Result<u64> {
        self.read_field(reader, self.layout.types)
    }

    pub fn etypes<R: MemoryReader>(&self, reader: &R) -> Result<u64> {
        self.read_field(reader, self.layout.etypes)
    }

    pub fn next<R: MemoryReader>(&self, reader: &R) -> Result<u64> {
        self.read_field(reader, self.layout.next)
    }

    fn findfunctab<R: MemoryReader>(&self, reader: &R) -> Result<u64> {
        self.read_field(reader, self.layout.findfunctab)
    }

    fn ftab_len<R: MemoryReader>(&self, reader: &R) -> Result<u64> {
        self.read_field(reader, self.layout.ftab_len)
    }

    /// Whether `pc` lies within this module's code range.
    pub fn spans_pc<R: MemoryReader>(&self, reader: &R, pc: u64) -> Result<bool> {
        Ok(self.minpc(reader)? <= pc && pc < self.maxpc(reader)?)
    }

    /// Whether `addr` lies within this module's runtime-type range.
    pub fn spans_type_addr<R: MemoryReader>(&self, reader: &R, addr: u64) -> Result<bool> {
        Ok(self.types_base(reader)? <= addr && addr < self.etypes(reader)?)
    }

    /// Reads the `functab` record at `index`: `(entry, funcoff)`.
    fn functab<R: MemoryReader>(&self, reader: &R, index: u64) -> Result<(u64, u64)> {
        let array = self.read_field(reader, self.layout.ftab_array)?;
        let record = array + index * self.layout.functab_size;

        let entry = reader.read_u64(record + self.layout.functab_entry)?;
        let funcoff = reader.read_u64(record + self.layout.functab_funcoff)?;

        Ok((entry, funcoff))
    }

    /// Address of the `pclntable` byte at `offset`.
    fn pclntable_addr<R: MemoryReader>(&self, reader: &R, offset: u64) -> Result<u64> {
        let array = self.read_field(reader, self.layout.pclntable_array)?;
        Ok(array + offset)
    }

    /// Resolves `pc` to a function using the runtime's own lookup tables.
    ///
    /// Mirrors the runtime's `findfunc`: the bucket and sub-bucket narrow the
    /// `ftab` index down to a small neighborhood, a linear adjustment finds
    /// the exact record, and the `_func` record behind `funcoff` supplies
    /// entry address and name. The recovered function carries no parameter
    /// list.
    pub fn find_function<R: MemoryReader>(&self, reader: &R, pc: u64) -> Result<Function> {
        let index = self.ftab_index_near(reader, pc)?;
        let index = self.adjust_ftab_index(reader, pc, index)?;

        let (_, funcoff) = self.functab(reader, index)?;

        let end = if index + 1 >= self.ftab_len(reader)? {
            0
        } else {
            self.functab(reader, index + 1)?.0
        };

        // `_func` record layout: entry at +0, name offset at +8
        let record = self.pclntable_addr(reader, funcoff)?;
        let entry = reader.read_u64(record)?;
        let nameoff = read_u32(reader, record + 8)?;

        let name = self.read_function_name(reader, nameoff as u64)?;

        Ok(Function {
            name,
            entry,
            end,
            parameters: Vec::new(),
        })
    }

    /// First guess of the `ftab` index covering `pc`, from the
    /// `findfunctab` bucket array.
    fn ftab_index_near<R: MemoryReader>(&self, reader: &R, pc: u64) -> Result<u64> {
        let x = pc - self.minpc(reader)?;
        let bucket = x / PC_BUCKET_SIZE;
        let sub_bucket = x % PC_BUCKET_SIZE / (PC_BUCKET_SIZE / SUB_BUCKETS_PER_BUCKET);

        let bucket_addr = self.findfunctab(reader)? + bucket * FIND_FUNC_BUCKET_SIZE;

        let base = read_u32(reader, bucket_addr)? as u64;
        let mut delta = [0u8; 1];
        reader.read_memory(bucket_addr + 4 + sub_bucket, &mut delta)?;

        Ok(base + delta[0] as u64)
    }

    /// The bucket estimate can be off by a few records in either direction;
    /// both walks terminate because `pc` lies within `[minpc, maxpc)`.
    fn adjust_ftab_index<R: MemoryReader>(
        &self,
        reader: &R,
        pc: u64,
        mut index: u64,
    ) -> Result<u64> {
        let len = self.ftab_len(reader)?;
        if index >= len {
            index = len.saturating_sub(1);
        }

        let (mut entry, _) = self.functab(reader, index)?;

        if pc < entry {
            while entry > pc && index > 0 {
                index -= 1;
                entry = self.functab(reader, index)?.0;
            }
        } else {
            let mut next_entry = self.functab(reader, index + 1)?.0;
            while next_entry <= pc {
                index += 1;
                next_entry = self.functab(reader, index + 1)?.0;
            }
        }

        Ok(index)
    }

    /// Reads the null-terminated function name at the given `pclntable`
    /// offset.
    fn read_function_name<R: MemoryReader>(&self, reader: &R, nameoff: u64) -> Result<String> {
        let mut addr = self.pclntable_addr(reader, nameoff)?;
        let mut raw = Vec::new();

        loop {
            let mut chunk = [0u8; 16];
            reader.read_memory(addr, &mut chunk)?;

            if let Some(end) = chunk.iter().position(|&b| b == 0) {
                raw.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&raw).into_owned());
            }

            raw.extend_from_slice(&chunk);
            addr += chunk.len() as u64;
        }
    }
}

fn read_u32<R: MemoryReader>(reader: &R, addr: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_memory(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMemory;

    const MD_ADDR: u64 = 0x100;
    const FINDFUNCTAB: u64 = 0x400;
    const FTAB: u64 = 0x500;
    const PCLNTABLE: u64 = 0x600;

    const MINPC: u64 = 0x101000;
    const MAXPC: u64 = 0x103000;

    fn test_layout() -> Rc<ModuleDataLayout> {
        Rc::new(ModuleDataLayout {
            minpc: 0,
            maxpc: 8,
            types: 16,
            etypes: 24,
            next: 32,
            findfunctab: 40,
            ftab_array: 48,
            ftab_len: 56,
            functab_size: 16,
            functab_entry: 0,
            functab_funcoff: 8,
            pclntable_array: 64,
        })
    }

    /// Two functions at 0x101000 and 0x102000, a sentinel record at maxpc.
    fn test_image() -> FakeMemory {
        let mem = FakeMemory::new();

        mem.load_u64(MD_ADDR, MINPC);
        mem.load_u64(MD_ADDR + 8, MAXPC);
        mem.load_u64(MD_ADDR + 16, 0x200000);
        mem.load_u64(MD_ADDR + 24, 0x201000);
        mem.load_u64(MD_ADDR + 32, 0);
        mem.load_u64(MD_ADDR + 40, FINDFUNCTAB);
        mem.load_u64(MD_ADDR + 48, FTAB);
        mem.load_u64(MD_ADDR + 56, 3);
        mem.load_u64(MD_ADDR + 64, PCLNTABLE);

        // ftab: (entry, funcoff) records, sentinel entry = maxpc
        mem.load_u64(FTAB, MINPC);
        mem.load_u64(FTAB + 8, 0x00);
        mem.load_u64(FTAB + 16, 0x102000);
        mem.load_u64(FTAB + 24, 0x20);
        mem.load_u64(FTAB + 32, MAXPC);
        mem.load_u64(FTAB + 40, 0);

        // findfunctab: code range of 0x2000 bytes = two buckets
        for bucket in 0..2u64 {
            let addr = FINDFUNCTAB + bucket * FIND_FUNC_BUCKET_SIZE;
            mem.load(addr, &(bucket as u32).to_le_bytes());
            mem.load(addr + 4, &[0u8; 16]);
        }

        // _func records
        mem.load_u64(PCLNTABLE, MINPC);
        mem.load(PCLNTABLE + 8, &0x40u32.to_le_bytes());
        mem.load_u64(PCLNTABLE + 0x20, 0x102000);
        mem.load(PCLNTABLE + 0x28, &0x50u32.to_le_bytes());

        // names, padded so chunked reads stay in bounds
        let mut name_a = [0u8; 16];
        name_a[..6].copy_from_slice(b"main.a");
        mem.load(PCLNTABLE + 0x40, &name_a);
        let mut name_b = [0u8; 16];
        name_b[..6].copy_from_slice(b"main.b");
        mem.load(PCLNTABLE + 0x50, &name_b);

        mem
    }

    #[test]
    fn resolves_functions_at_range_boundaries() {
        let mem = test_image();
        let md = ModuleData::new(MD_ADDR, test_layout());

        let f = md.find_function(&mem, MINPC).unwrap();
        assert_eq!(f.name, "main.a");
        assert_eq!(f.entry, MINPC);
        assert_eq!(f.end, 0x102000);

        let f = md.find_function(&mem, MAXPC - 1).unwrap();
        assert_eq!(f.name, "main.b");
        assert_eq!(f.entry, 0x102000);
        assert_eq!(f.end, MAXPC);
    }

    #[test]
    fn resolves_mid_function_pcs() {
        let mem = test_image();
        let md = ModuleData::new(MD_ADDR, test_layout());

        let f = md.find_function(&mem, MINPC + 0xfff).unwrap();
        assert_eq!(f.name, "main.a");
    }

    #[test]
    fn pc_range_checks() {
        let mem = test_image();
        let md = ModuleData::new(MD_ADDR, test_layout());

        assert!(md.spans_pc(&mem, MINPC).unwrap());
        assert!(md.spans_pc(&mem, MAXPC - 1).unwrap());
        assert!(!md.spans_pc(&mem, MAXPC).unwrap());
        assert!(!md.spans_pc(&mem, MINPC - 1).unwrap());
    }

    #[test]
    fn collects_linked_list() {
        let mem = test_image();

        // second record linked after the first
        let second = 0x800u64;
        mem.load_u64(MD_ADDR + 32, second);
        for offset in (0..72).step_by(8) {
            mem.load_u64(second + offset, 0);
        }

        let list = ModuleData::collect_list(MD_ADDR, test_layout(), &mem).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].addr, MD_ADDR);
        assert_eq!(list[1].addr, second);
    }
}
