use std::collections::HashMap;

use crate::{MemoryAccess, Result};

/// The x86-64 software breakpoint opcode (`int3`).
pub const TRAP_INSTRUCTION: u8 = 0xCC;

/// One logical breakpoint record.
///
/// An empty `routines` list means the breakpoint applies to every routine.
struct BreakpointRecord {
    original_byte: u8,

    /// Routine IDs interested in this breakpoint. Duplicates are tolerated;
    /// removal drops one occurrence at a time.
    routines: Vec<i64>,

    /// Whether the record was created through the conditional path. Only
    /// such records may be physically cleared when their last routine is
    /// removed.
    created_conditional: bool,
}

/// Registry arbitrating logical breakpoints against the single physical trap
/// byte per address.
///
/// Invariant: an address is present here if and only if the target currently
/// holds the trap byte at that address; the byte seen before patching is kept
/// for restoration.
#[derive(Default)]
pub struct Breakpoints {
    records: HashMap<u64, BreakpointRecord>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an unconditional breakpoint at `addr`.
    ///
    /// A conditional record already present at the address is promoted to
    /// unconditional; the physical byte is only written on first set.
    pub fn set<A: MemoryAccess>(&mut self, mem: &A, addr: u64) -> Result<()> {
        match self.records.get_mut(&addr) {
            Some(record) => {
                record.routines.clear();
                record.created_conditional = false;
            }
            None => {
                let original_byte = write_trap(mem, addr)?;
                self.records.insert(
                    addr,
                    BreakpointRecord {
                        original_byte,
                        routines: Vec::new(),
                        created_conditional: false,
                    },
                );
            }
        }

        Ok(())
    }

    /// Sets a breakpoint at `addr` that only `routine` is considered to hit.
    ///
    /// An unconditional record already present subsumes the request and is
    /// left untouched.
    pub fn set_conditional<A: MemoryAccess>(
        &mut self,
        mem: &A,
        addr: u64,
        routine: i64,
    ) -> Result<()> {
        match self.records.get_mut(&addr) {
            Some(record) => {
                if !record.routines.is_empty() {
                    record.routines.push(routine);
                }
            }
            None => {
                let original_byte = write_trap(mem, addr)?;
                self.records.insert(
                    addr,
                    BreakpointRecord {
                        original_byte,
                        routines: vec![routine],
                        created_conditional: true,
                    },
                );
            }
        }

        Ok(())
    }

    /// Clears the breakpoint at `addr`, restoring the original byte.
    /// No-op when absent.
    pub fn clear<A: MemoryAccess>(&mut self, mem: &A, addr: u64) -> Result<()> {
        if let Some(record) = self.records.remove(&addr) {
            mem.write_memory(addr, &[record.original_byte])
                .map_err(crate::Error::from)?;
        }

        Ok(())
    }

    /// Removes `routine` from the interested set at `addr`; the record (and
    /// the physical byte) goes away once the last interested routine of a
    /// conditionally created record is gone.
    pub fn clear_conditional<A: MemoryAccess>(
        &mut self,
        mem: &A,
        addr: u64,
        routine: i64,
    ) -> Result<()> {
        let Some(record) = self.records.get_mut(&addr) else {
            return Ok(());
        };

        if let Some(pos) = record.routines.iter().position(|&r| r == routine) {
            record.routines.remove(pos);
        }

        if record.routines.is_empty() && record.created_conditional {
            return self.clear(mem, addr);
        }

        Ok(())
    }

    /// Clears every conditional breakpoint associated with `routine`.
    pub fn clear_all_for_routine<A: MemoryAccess>(&mut self, mem: &A, routine: i64) -> Result<()> {
        let addrs: Vec<u64> = self.records.keys().copied().collect();

        for addr in addrs {
            self.clear_conditional(mem, addr, routine)?;
        }

        Ok(())
    }

    /// Clears every breakpoint, restoring all original bytes.
    pub fn clear_all<A: MemoryAccess>(&mut self, mem: &A) -> Result<()> {
        let addrs: Vec<u64> = self.records.keys().copied().collect();

        for addr in addrs {
            self.clear(mem, addr)?;
        }

        Ok(())
    }

    /// Whether the breakpoint at `addr` exists and considers `routine` a hit.
    pub fn hit(&self, addr: u64, routine: i64) -> bool {
        self.records
            .get(&addr)
            .is_some_and(|record| record.routines.is_empty() || record.routines.contains(&routine))
    }

    /// Whether any breakpoint record exists at `addr`.
    pub fn exists(&self, addr: u64) -> bool {
        self.records.contains_key(&addr)
    }

    /// The byte that was at `addr` before the trap was written, if a record
    /// exists. Used to temporarily lift the trap around single-steps.
    pub fn original_byte(&self, addr: u64) -> Option<u8> {
        self.records.get(&addr).map(|record| record.original_byte)
    }
}

fn write_trap<A: MemoryAccess>(mem: &A, addr: u64) -> Result<u8> {
    let mut original = [0u8; 1];
    mem.read_memory(addr, &mut original)
        .map_err(crate::Error::from)?;
    mem.write_memory(addr, &[TRAP_INSTRUCTION])
        .map_err(crate::Error::from)?;
    Ok(original[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMemory;

    fn memory_with_code(addr: u64, byte: u8) -> FakeMemory {
        let mem = FakeMemory::new();
        mem.load(addr, &[byte]);
        mem
    }

    #[test]
    fn set_writes_trap_and_clear_restores() {
        let mem = memory_with_code(0x1000, 0x55);
        let mut bks = Breakpoints::new();

        bks.set(&mem, 0x1000).unwrap();
        assert_eq!(mem.byte_at(0x1000), Some(TRAP_INSTRUCTION));
        assert!(bks.exists(0x1000));

        bks.clear(&mem, 0x1000).unwrap();
        assert_eq!(mem.byte_at(0x1000), Some(0x55));
        assert!(!bks.exists(0x1000));
    }

    #[test]
    fn set_is_idempotent() {
        let mem = memory_with_code(0x1000, 0x55);
        let mut bks = Breakpoints::new();

        bks.set(&mem, 0x1000).unwrap();
        bks.set(&mem, 0x1000).unwrap();

        // the original byte recorded at first set survives the second one
        bks.clear(&mem, 0x1000).unwrap();
        assert_eq!(mem.byte_at(0x1000), Some(0x55));
    }

    #[test]
    fn clear_on_absent_address_is_a_noop() {
        let mem = FakeMemory::new();
        let mut bks = Breakpoints::new();

        bks.clear(&mem, 0x2000).unwrap();
        assert!(!bks.exists(0x2000));
    }

    #[test]
    fn conditional_hits_only_interested_routines() {
        let mem = memory_with_code(0x1000, 0x90);
        let mut bks = Breakpoints::new();

        bks.set_conditional(&mem, 0x1000, 1).unwrap();
        bks.set_conditional(&mem, 0x1000, 2).unwrap();

        assert!(bks.hit(0x1000, 1));
        assert!(!bks.hit(0x1000, 3));

        bks.clear_conditional(&mem, 0x1000, 1).unwrap();
        assert!(bks.hit(0x1000, 2));

        bks.clear_conditional(&mem, 0x1000, 2).unwrap();
        assert!(!bks.exists(0x1000));
        assert_eq!(mem.byte_at(0x1000), Some(0x90));
    }

    #[test]
    fn unconditional_hits_every_routine() {
        let mem = memory_with_code(0x1000, 0x90);
        let mut bks = Breakpoints::new();

        bks.set(&mem, 0x1000).unwrap();

        assert!(bks.hit(0x1000, 1));
        assert!(bks.hit(0x1000, 42));
        assert!(!bks.hit(0x1001, 1));
    }

    #[test]
    fn conditional_round_trip_restores_previous_state() {
        let mem = memory_with_code(0x1000, 0x90);
        let mut bks = Breakpoints::new();

        bks.set_conditional(&mem, 0x1000, 7).unwrap();
        bks.clear_conditional(&mem, 0x1000, 7).unwrap();

        assert!(!bks.exists(0x1000));
        assert_eq!(mem.byte_at(0x1000), Some(0x90));
    }

    #[test]
    fn clear_conditional_never_clears_unconditional_records() {
        let mem = memory_with_code(0x1000, 0x90);
        let mut bks = Breakpoints::new();

        bks.set(&mem, 0x1000).unwrap();
        bks.clear_conditional(&mem, 0x1000, 1).unwrap();

        assert!(bks.exists(0x1000));
        assert_eq!(mem.byte_at(0x1000), Some(TRAP_INSTRUCTION));
    }

    #[test]
    fn unconditional_set_subsumes_conditions() {
        let mem = memory_with_code(0x1000, 0x90);
        let mut bks = Breakpoints::new();

        bks.set_conditional(&mem, 0x1000, 1).unwrap();
        bks.set(&mem, 0x1000).unwrap();

        // every routine hits now, and conditional clearing no longer
        // removes the record
        assert!(bks.hit(0x1000, 9));
        bks.clear_conditional(&mem, 0x1000, 1).unwrap();
        assert!(bks.exists(0x1000));

        // later conditional requests leave the unconditional record alone
        bks.set_conditional(&mem, 0x1000, 5).unwrap();
        assert!(bks.hit(0x1000, 6));
    }

    #[test]
    fn clear_all_for_routine_sweeps_conditionals() {
        let mem = FakeMemory::new();
        mem.load(0x1000, &[0x90]);
        mem.load(0x2000, &[0x91]);
        let mut bks = Breakpoints::new();

        bks.set_conditional(&mem, 0x1000, 1).unwrap();
        bks.set_conditional(&mem, 0x2000, 1).unwrap();
        bks.set_conditional(&mem, 0x2000, 2).unwrap();

        bks.clear_all_for_routine(&mem, 1).unwrap();

        assert!(!bks.exists(0x1000));
        assert_eq!(mem.byte_at(0x1000), Some(0x90));
        assert!(bks.exists(0x2000));
        assert!(bks.hit(0x2000, 2));
    }
}
