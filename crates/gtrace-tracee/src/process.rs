use std::rc::Rc;

use capstone::arch::x86::ArchMode;
use capstone::arch::BuildsCapstone;
use capstone::Capstone;

use gtrace_debugger::{Client, Event, MemoryReader};
use gtrace_symbol::{Binary, Function, TypeRef};

use crate::moduledata::{ModuleData, ModuleDataLayout};
use crate::value::{RuntimeTypeResolver, Value, ValueDecoder};
use crate::{Breakpoints, Error, GoVersion, Result, TRAP_INSTRUCTION};

/// The traced process, as the tracing controller sees it.
///
/// Owns the debug transport, the breakpoint registry, the parsed binary and
/// the runtime's module-data views. All observation primitives of the tracer
/// go through here.
pub struct Process {
    client: Client,
    breakpoints: Breakpoints,

    /// Released when the target exits; lookups needed by pending trap
    /// handlers keep it alive until then.
    binary: Option<Binary>,

    module_data: Vec<ModuleData>,
    go_version: GoVersion,
}

/// Snapshot of the routine that hit a trap.
#[derive(Debug, Clone)]
pub struct RoutineInfo {
    /// Runtime-assigned routine ID (`goid`).
    pub id: i64,

    /// `stack.hi - rsp`: how much stack the routine currently uses.
    pub used_stack_bytes: u64,

    pub current_pc: u64,
    pub current_stack_pointer: u64,

    /// Entry address of the function the next `defer` will run; 0 when the
    /// defer chain is empty.
    pub next_defer_func_addr: u64,

    /// Whether the routine has an active panic.
    pub panicking: bool,

    /// The deferred call that will handle the active panic, if one matches.
    pub panic_handler: Option<PanicHandler>,
}

/// Identifies the frame that registered the panic-handling `defer`.
#[derive(Debug, Clone, Copy)]
pub struct PanicHandler {
    /// Stack usage of the routine at the time the `defer` was registered.
    pub used_stack_bytes_at_defer: u64,

    pub pc_at_defer: u64,
}

/// PC/SP snapshot of one thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfo {
    pub id: u64,
    pub current_pc: u64,
    pub current_stack_pointer: u64,
}

/// One stack frame, reconstructed at a function's entry or return.
#[derive(Debug)]
pub struct StackFrame {
    pub function: Function,
    pub return_address: u64,

    pub inputs: Vec<Argument>,
    pub outputs: Vec<Argument>,
}

/// One argument (or result) of a stack frame.
///
/// The value is not read at frame-construction time: output parameters hold
/// garbage until the function returns, and most arguments are never printed.
/// [`Process::argument_value`] performs the read on demand.
#[derive(Debug)]
pub struct Argument {
    pub name: String,
    pub typ: TypeRef,

    /// Where the value lives on the stack; absent when the debugging
    /// information had no location.
    addr: Option<u64>,
}

/// One disassembled instruction of the target.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: u64,
    pub mnemonic: String,
}

impl Process {
    /// Launches a new target process and prepares it for tracing.
    pub fn launch(program: &str, args: &[String]) -> Result<Self> {
        let client = Client::launch(program, args)?;
        Self::init(client, program, None)
    }

    /// Attaches to the running process with the given PID.
    ///
    /// `go_version` overrides the runtime-version probe, for targets whose
    /// binary does not embed its build version.
    pub fn attach(pid: i32, go_version: Option<&str>) -> Result<Self> {
        let client = Client::attach(pid)?;
        let program = format!("/proc/{pid}/exe");
        Self::init(client, &program, go_version)
    }

    fn init(mut client: Client, program: &str, version_override: Option<&str>) -> Result<Self> {
        match Self::parse_target(&client, program, version_override) {
            Ok((binary, module_data, go_version)) => Ok(Self {
                client,
                breakpoints: Breakpoints::new(),
                binary: Some(binary),
                module_data,
                go_version,
            }),
            Err(e) => {
                // leave the target running rather than half-traced
                let _ = client.detach();
                Err(e)
            }
        }
    }

    fn parse_target(
        client: &Client,
        program: &str,
        version_override: Option<&str>,
    ) -> Result<(Binary, Vec<ModuleData>, GoVersion)> {
        let binary = Binary::open(program)?;

        let layout = ModuleDataLayout::from_table(binary.types(), binary.module_data_type())?;
        let module_data =
            ModuleData::collect_list(binary.first_module_data_addr(), Rc::new(layout), client)?;

        let go_version = version_override
            .and_then(GoVersion::parse)
            .or_else(|| read_build_version(client, &binary).as_deref().and_then(GoVersion::parse))
            .unwrap_or_else(GoVersion::newest);

        tracing::debug!(modules = module_data.len(), ?go_version, "target parsed");

        Ok((binary, module_data, go_version))
    }

    /// Process ID of the target.
    pub fn process_id(&self) -> u64 {
        self.client.process_id()
    }

    /// Thread the target was stopped on at launch/attach time.
    pub fn main_thread_id(&self) -> u64 {
        self.client.main_thread_id()
    }

    pub fn go_version(&self) -> GoVersion {
        self.go_version
    }

    /// All functions of the target binary, sorted by entry address.
    pub fn functions(&self) -> Result<&[Function]> {
        Ok(self.binary()?.functions())
    }

    /// Looks a function of the target binary up by name.
    pub fn function_by_name(&self, name: &str) -> Result<Option<&Function>> {
        Ok(self.binary()?.function_by_name(name))
    }

    fn binary(&self) -> Result<&Binary> {
        self.binary.as_ref().ok_or(Error::BinaryReleased)
    }

    /// Clears every outstanding breakpoint, then detaches the transport.
    /// The target keeps running unsupervised.
    pub fn detach(&mut self) -> Result<()> {
        self.breakpoints.clear_all(&self.client)?;
        self.client.detach()?;
        self.binary = None;
        Ok(())
    }

    /// Resumes the target and blocks until the next event. The binary is
    /// released on any exit event.
    pub fn continue_and_wait(&mut self) -> Result<(Vec<u64>, Event)> {
        let (trapped, event) = self.client.continue_and_wait()?;

        if event.is_exit() {
            self.binary = None;
        }

        Ok((trapped, event))
    }

    /// Steps the given thread over the trap at `trap_addr`.
    ///
    /// The instruction pointer is rewound to the trap address, the original
    /// byte is restored around the step, and the trap byte is rewritten
    /// afterwards. Threads that trap concurrently are walked past their own
    /// traps and the step is retried.
    pub fn single_step(&mut self, thread_id: u64, trap_addr: u64) -> Result<()> {
        self.set_pc(thread_id, trap_addr)?;

        let original = self.breakpoints.original_byte(trap_addr);
        if let Some(byte) = original {
            self.client.write_memory(trap_addr, &[byte])?;
        }

        match self.step_and_wait(thread_id) {
            Ok(_) => (),
            Err(Error::Debugger(gtrace_debugger::Error::UnspecifiedThread(threads))) => {
                self.single_step_unspecified_threads(thread_id, &threads)?;
                return self.single_step(thread_id, trap_addr);
            }
            Err(e) => return Err(e),
        }

        if original.is_some() {
            self.client.write_memory(trap_addr, &[TRAP_INSTRUCTION])?;
        }

        Ok(())
    }

    fn step_and_wait(&mut self, thread_id: u64) -> Result<Event> {
        let event = self.client.step_and_wait(thread_id)?;

        if event.is_exit() {
            self.binary = None;
        }

        Ok(event)
    }

    /// Walks every listed thread (except the current one) past its trap.
    fn single_step_unspecified_threads(&mut self, current: u64, threads: &[u64]) -> Result<()> {
        for &thread_id in threads {
            if thread_id == current {
                continue;
            }

            let regs = self.client.read_registers(thread_id)?;
            self.single_step(thread_id, regs.rip() - 1)?;
        }

        Ok(())
    }

    fn set_pc(&self, thread_id: u64, addr: u64) -> Result<()> {
        let mut regs = self.client.read_registers(thread_id)?;
        regs.set_rip(addr);
        self.client.write_registers(thread_id, &regs)?;
        Ok(())
    }

    pub fn set_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.breakpoints.set(&self.client, addr)
    }

    pub fn set_conditional_breakpoint(&mut self, addr: u64, routine: i64) -> Result<()> {
        self.breakpoints.set_conditional(&self.client, addr, routine)
    }

    pub fn clear_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.breakpoints.clear(&self.client, addr)
    }

    pub fn clear_conditional_breakpoint(&mut self, addr: u64, routine: i64) -> Result<()> {
        self.breakpoints
            .clear_conditional(&self.client, addr, routine)
    }

    /// Clears every conditional breakpoint associated with `routine`.
    pub fn clear_all_conditional_breakpoints(&mut self, routine: i64) -> Result<()> {
        self.breakpoints.clear_all_for_routine(&self.client, routine)
    }

    pub fn hit_breakpoint(&self, addr: u64, routine: i64) -> bool {
        self.breakpoints.hit(addr, routine)
    }

    pub fn has_breakpoint(&self, addr: u64) -> bool {
        self.breakpoints.exists(addr)
    }

    /// Reconstructs the frame whose return-address slot `rsp` points at.
    ///
    /// `rsp + 8` is taken as the beginning of the argument area; argument
    /// values themselves are read lazily through [`argument_value`]
    /// (Self::argument_value).
    pub fn stack_frame_at(&self, rsp: u64, rip: u64) -> Result<StackFrame> {
        let function = self.find_function(rip)?;

        let return_address = self.client.read_u64(rsp)?;
        let args_base = rsp + 8;

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();

        for param in &function.parameters {
            let arg = Argument {
                name: param.name.clone(),
                typ: param.typ,
                addr: param
                    .exists
                    .then(|| (args_base as i64 + param.offset) as u64),
            };

            if param.is_output {
                outputs.push(arg);
            } else {
                inputs.push(arg);
            }
        }

        Ok(StackFrame {
            function,
            return_address,
            inputs,
            outputs,
        })
    }

    /// Reads and decodes the argument's current value.
    ///
    /// `None` when the argument has no location, the read fails, or the type
    /// has no decoding rule; a trace line must never fail because one
    /// argument is unreadable.
    pub fn argument_value(&self, arg: &Argument, depth: usize) -> Option<Value> {
        let binary = self.binary.as_ref()?;
        let addr = arg.addr?;

        let size = binary.types().get(arg.typ).size as usize;
        let mut raw = vec![0u8; size];

        if let Err(e) = self.client.read_memory(addr, &mut raw) {
            tracing::debug!(error = %e, name = %arg.name, "failed to read argument");
            return None;
        }

        ValueDecoder::new(&self.client, binary.types(), self).decode(arg.typ, &raw, depth)
    }

    /// Resolves `pc` to a function, first through the debugging information,
    /// then through the runtime's own module-data tables.
    pub fn find_function(&self, pc: u64) -> Result<Function> {
        let binary = self.binary()?;

        if let Some(function) = binary.find_function(pc) {
            return Ok(function.clone());
        }

        let module_data = self
            .module_data
            .iter()
            .find(|md| md.spans_pc(&self.client, pc).unwrap_or(false))
            .ok_or(Error::NoModuleData(pc))?;

        module_data.find_function(&self.client, pc)
    }

    /// Snapshot of the routine currently scheduled on the given thread.
    ///
    /// The routine descriptor is found through the thread-local slot whose
    /// offset depends on the runtime version.
    pub fn current_routine_info(&mut self, thread_id: u64) -> Result<RoutineInfo> {
        let g_addr = match self.client.read_tls(thread_id, self.offset_to_g()) {
            Ok(addr) => addr,
            Err(gtrace_debugger::Error::UnspecifiedThread(threads)) => {
                self.single_step_unspecified_threads(thread_id, &threads)?;
                return self.current_routine_info(thread_id);
            }
            Err(e) => return Err(e.into()),
        };

        let g_type = self.binary()?.routine_descriptor_type();

        let (_, id_raw) = self.read_struct_field(g_addr, g_type, "goid")?;
        let id = le_u64(&id_raw) as i64;

        let (stack_type, stack_raw) = self.read_struct_field(g_addr, g_type, "stack")?;
        let hi_field = self
            .binary()?
            .types()
            .field(stack_type, "hi")
            .ok_or_else(|| Error::FieldNotFound("runtime.stack".to_owned(), "hi".to_owned()))?;
        let stack_hi = stack_raw
            .get(hi_field.offset as usize..)
            .map(le_u64)
            .unwrap_or(0);

        let regs = self.client.read_registers(thread_id)?;
        let used_stack_bytes = stack_hi - regs.rsp();

        let (_, panic_raw) = self.read_struct_field(g_addr, g_type, "_panic")?;
        let panic_addr = le_u64(&panic_raw);

        let panic_handler = self.find_panic_handler(g_addr, panic_addr, stack_hi)?;
        let next_defer_func_addr = self.find_next_defer_func_addr(g_addr)?;

        Ok(RoutineInfo {
            id,
            used_stack_bytes,
            current_pc: regs.rip(),
            current_stack_pointer: regs.rsp(),
            next_defer_func_addr,
            panicking: panic_addr != 0,
            panic_handler,
        })
    }

    /// PC/SP snapshot of the given thread.
    pub fn current_thread_info(&self, thread_id: u64) -> Result<ThreadInfo> {
        let regs = self.client.read_registers(thread_id)?;

        Ok(ThreadInfo {
            id: thread_id,
            current_pc: regs.rip(),
            current_stack_pointer: regs.rsp(),
        })
    }

    /// Reads and disassembles the instructions of the given function.
    pub fn read_instructions(&self, function: &Function) -> Result<Vec<Instruction>> {
        if function.end == 0 {
            return Err(Error::UnknownFunctionEnd(function.name.clone()));
        }

        let mut code = vec![0u8; (function.end - function.entry) as usize];
        self.client.read_memory(function.entry, &mut code)?;

        let cs = Capstone::new().x86().mode(ArchMode::Mode64).build()?;
        let instructions = cs.disasm_all(&code, function.entry)?;

        Ok(instructions
            .iter()
            .map(|insn| Instruction {
                address: insn.address(),
                mnemonic: insn.mnemonic().unwrap_or_default().to_owned(),
            })
            .collect())
    }

    /// TLS offset of the routine-descriptor slot; moved in go1.11.
    fn offset_to_g(&self) -> u64 {
        if self.go_version.later_than(1, 11) {
            0x30
        } else {
            0x8a0
        }
    }

    /// Walks the routine's defer chain for the entry registered against the
    /// active panic.
    fn find_panic_handler(
        &self,
        g_addr: u64,
        panic_addr: u64,
        stack_hi: u64,
    ) -> Result<Option<PanicHandler>> {
        let g_type = self.binary()?.routine_descriptor_type();

        let (defer_ptr_type, defer_raw) = self.read_struct_field(g_addr, g_type, "_defer")?;
        let mut defer_addr = le_u64(&defer_raw);

        let Some(defer_type) = self.pointee_of(defer_ptr_type) else {
            return Ok(None);
        };

        while defer_addr != 0 {
            let (_, panic_raw) = self.read_struct_field(defer_addr, defer_type, "_panic")?;
            if le_u64(&panic_raw) == panic_addr {
                break;
            }

            let (_, link_raw) = self.read_struct_field(defer_addr, defer_type, "link")?;
            defer_addr = le_u64(&link_raw);
        }

        if defer_addr == 0 {
            return Ok(None);
        }

        let (_, sp_raw) = self.read_struct_field(defer_addr, defer_type, "sp")?;
        let (_, pc_raw) = self.read_struct_field(defer_addr, defer_type, "pc")?;

        Ok(Some(PanicHandler {
            used_stack_bytes_at_defer: stack_hi - le_u64(&sp_raw),
            pc_at_defer: le_u64(&pc_raw),
        }))
    }

    /// Entry address of the function the next `defer` will run; 0 when the
    /// chain is empty.
    fn find_next_defer_func_addr(&self, g_addr: u64) -> Result<u64> {
        let g_type = self.binary()?.routine_descriptor_type();

        let (defer_ptr_type, defer_raw) = self.read_struct_field(g_addr, g_type, "_defer")?;
        let defer_addr = le_u64(&defer_raw);
        if defer_addr == 0 {
            return Ok(0);
        }

        let Some(defer_type) = self.pointee_of(defer_ptr_type) else {
            return Ok(0);
        };

        let (_, fn_raw) = self.read_struct_field(defer_addr, defer_type, "fn")?;
        let func_val_addr = le_u64(&fn_raw);
        if func_val_addr == 0 {
            return Ok(0);
        }

        // `fn` points at a funcval; its first word is the code address
        Ok(self.client.read_u64(func_val_addr)?)
    }

    fn read_struct_field(
        &self,
        struct_addr: u64,
        struct_type: TypeRef,
        name: &str,
    ) -> Result<(TypeRef, Vec<u8>)> {
        let types = self.binary()?.types();

        let field = types.field(struct_type, name).ok_or_else(|| {
            Error::FieldNotFound(types.get(struct_type).name.clone(), name.to_owned())
        })?;

        let mut raw = vec![0u8; types.get(field.typ).size as usize];
        self.client
            .read_memory(struct_addr + field.offset, &mut raw)?;

        Ok((field.typ, raw))
    }

    fn pointee_of(&self, r: TypeRef) -> Option<TypeRef> {
        let types = self.binary.as_ref()?.types();
        match types.get(types.strip_typedefs(r)).kind {
            gtrace_symbol::TypeKind::Pointer { pointee } => pointee,
            _ => None,
        }
    }
}

impl RuntimeTypeResolver for Process {
    fn type_by_runtime_addr(&self, addr: u64) -> Option<TypeRef> {
        let binary = self.binary.as_ref()?;

        let module_data = self
            .module_data
            .iter()
            .find(|md| md.spans_type_addr(&self.client, addr).unwrap_or(false))?;

        let base = module_data.types_base(&self.client).ok()?;
        binary.type_by_runtime_offset(addr - base)
    }
}

/// Reads the target's `runtime.buildVersion` string, when the binary tells
/// us where it lives.
fn read_build_version(client: &Client, binary: &Binary) -> Option<String> {
    const MAX_VERSION_LEN: u64 = 128;

    let header_addr = binary.build_version_addr()?;

    let ptr = client.read_u64(header_addr).ok()?;
    let len = client.read_u64(header_addr + 8).ok()?;

    if ptr == 0 || len == 0 || len > MAX_VERSION_LEN {
        return None;
    }

    let mut raw = vec![0u8; len as usize];
    client.read_memory(ptr, &mut raw).ok()?;

    Some(String::from_utf8_lossy(&raw).into_owned())
}

fn le_u64(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = raw.len().min(8);
    buf[..n].copy_from_slice(&raw[..n]);
    u64::from_le_bytes(buf)
}
