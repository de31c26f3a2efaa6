use std::collections::HashMap;
use std::io;
use std::io::IoSliceMut;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::registers::Registers;
use crate::{Error, Event, MemoryReader, Result};

/// Run state of one traced thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Stopped,
}

/// Simplified wait outcome used by the event loops below.
enum Wait {
    /// A thread stopped on a trap (breakpoint or completed single-step).
    Trap(u64),
    /// The whole target is gone.
    Exit(Event),
    /// Nothing to report (non-blocking wait found no status).
    Idle,
}

/// ptrace client over one traced process and its threads.
pub struct Client {
    process_id: Pid,
    threads: HashMap<Pid, RunState>,

    /// Exit event observed while draining a trap batch; surfaced by the next
    /// wait call.
    pending_exit: Option<Event>,
}

impl Client {
    /// Launches the program as a traced child process.
    ///
    /// On success the target is stopped at its entry point. Standard streams
    /// are inherited from the tracer.
    #[tracing::instrument(name = "Launch", skip_all, fields(program = %program))]
    pub fn launch(program: &str, args: &[String]) -> Result<Self> {
        let mut command = Command::new(program);
        command.args(args);

        unsafe {
            command.pre_exec(|| {
                ptrace::traceme().map_err(|e| io::Error::from_raw_os_error(e as i32))
            })
        };

        let child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);

        wait_for_initial_stop(pid)?;

        tracing::info!(pid = pid.as_raw(), "target launched");

        Ok(Self::with_main_thread(pid))
    }

    /// Attaches to the running process with the given PID.
    ///
    /// On success the target is stopped.
    #[tracing::instrument(name = "Attach", skip_all, fields(pid = pid))]
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);

        ptrace::attach(pid)?;
        wait_for_initial_stop(pid)?;

        tracing::info!("target attached");

        Ok(Self::with_main_thread(pid))
    }

    fn with_main_thread(pid: Pid) -> Self {
        Self {
            process_id: pid,
            threads: HashMap::from([(pid, RunState::Stopped)]),
            pending_exit: None,
        }
    }

    /// Process ID of the target.
    pub fn process_id(&self) -> u64 {
        self.process_id.as_raw() as u64
    }

    /// Thread ID the target was stopped on at launch/attach time.
    pub fn main_thread_id(&self) -> u64 {
        self.process_id.as_raw() as u64
    }

    /// Detaches from the target, leaving it running unsupervised.
    pub fn detach(&mut self) -> Result<()> {
        for (&tid, _) in self.threads.iter() {
            match ptrace::detach(tid, None) {
                Ok(()) | Err(nix::Error::ESRCH) => (),
                Err(e) => return Err(e.into()),
            }
        }

        self.threads.clear();
        Ok(())
    }

    /// Resumes every stopped thread and blocks until the next event.
    ///
    /// On [`Event::Trapped`], the returned list holds every thread that is
    /// stopped on a trap, in the order the kernel reported them.
    pub fn continue_and_wait(&mut self) -> Result<(Vec<u64>, Event)> {
        if let Some(event) = self.pending_exit.take() {
            return Ok((Vec::new(), event));
        }

        for (&tid, state) in self.threads.iter_mut() {
            if *state == RunState::Stopped {
                ptrace::cont(tid, None)?;
                *state = RunState::Running;
            }
        }

        match self.next_stop(WaitPidFlag::empty())? {
            Wait::Exit(event) => Ok((Vec::new(), event)),
            Wait::Trap(tid) => {
                let mut trapped = vec![tid];

                // collect the rest of the batch without blocking
                loop {
                    match self.next_stop(WaitPidFlag::WNOHANG)? {
                        Wait::Trap(tid) => trapped.push(tid),
                        Wait::Exit(event) => {
                            self.pending_exit = Some(event);
                            break;
                        }
                        Wait::Idle => break,
                    }
                }

                Ok((trapped, Event::Trapped))
            }
            Wait::Idle => unreachable!("blocking wait returned without status"),
        }
    }

    /// Executes one instruction on the given thread and waits for it.
    ///
    /// If other threads trap before the step completes, they are left stopped
    /// and reported through [`Error::UnspecifiedThread`]; the caller is
    /// expected to walk them past their traps and retry.
    pub fn step_and_wait(&mut self, thread_id: u64) -> Result<Event> {
        let tid = self.known_thread(thread_id)?;

        ptrace::step(tid, None)?;
        self.threads.insert(tid, RunState::Running);

        let mut others = Vec::new();

        loop {
            match self.next_stop(WaitPidFlag::empty())? {
                Wait::Exit(event) => return Ok(event),
                Wait::Trap(t) if t == thread_id => break,
                Wait::Trap(t) => others.push(t),
                Wait::Idle => unreachable!("blocking wait returned without status"),
            }
        }

        if others.is_empty() {
            Ok(Event::Trapped)
        } else {
            Err(Error::UnspecifiedThread(others))
        }
    }

    /// Reads the register state of the given stopped thread.
    pub fn read_registers(&self, thread_id: u64) -> Result<Registers> {
        let tid = self.known_thread(thread_id)?;
        Ok(Registers(ptrace::getregs(tid)?))
    }

    /// Writes the register state back to the given stopped thread.
    pub fn write_registers(&self, thread_id: u64, regs: &Registers) -> Result<()> {
        let tid = self.known_thread(thread_id)?;
        ptrace::setregs(tid, regs.0)?;
        Ok(())
    }

    /// Reads the 8-byte slot at `offset` from the thread-local storage base
    /// of the given thread.
    pub fn read_tls(&self, thread_id: u64, offset: u64) -> Result<u64> {
        let regs = self.read_registers(thread_id)?;
        self.read_u64(regs.fs_base().wrapping_add(offset))
    }

    /// Writes `data` into the target's address space at `addr`.
    ///
    /// The write goes through ptrace word pokes so that read-only text pages
    /// (the usual home of breakpoints) are writable.
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        let pid = self.poke_thread();
        let word_len = std::mem::size_of::<i64>();

        let mut offset = 0;
        while offset < data.len() {
            let word_addr = (addr + offset as u64) as ptrace::AddressType;
            let rest = &data[offset..];

            let word = if rest.len() >= word_len {
                let Ok(bytes) = <[u8; 8]>::try_from(&rest[..word_len]) else {
                    unreachable!("chunk is exactly one word long");
                };
                i64::from_le_bytes(bytes)
            } else {
                // keep the bytes past the end of `data` intact
                let mut bytes = ptrace::read(pid, word_addr)?.to_le_bytes();
                bytes[..rest.len()].copy_from_slice(rest);
                i64::from_le_bytes(bytes)
            };

            ptrace::write(pid, word_addr, word)?;
            offset += word_len.min(rest.len());
        }

        Ok(())
    }

    /// Waits for the next thread status, updating the thread table.
    ///
    /// Thread creations, thread exits and forwarded signals are handled
    /// internally; only traps and whole-process exits are returned.
    fn next_stop(&mut self, flags: WaitPidFlag) -> Result<Wait> {
        loop {
            let status = waitpid(Pid::from_raw(-1), Some(flags | WaitPidFlag::__WALL))?;

            match status {
                WaitStatus::StillAlive => return Ok(Wait::Idle),

                WaitStatus::Exited(pid, code) => {
                    if pid == self.process_id {
                        self.threads.clear();
                        return Ok(Wait::Exit(Event::Exited(code)));
                    }
                    self.threads.remove(&pid);
                }

                WaitStatus::Signaled(pid, signal, core_dumped) => {
                    if pid == self.process_id {
                        self.threads.clear();
                        let event = if core_dumped {
                            Event::CoreDump
                        } else {
                            Event::Terminated(signal as i32)
                        };
                        return Ok(Wait::Exit(event));
                    }
                    self.threads.remove(&pid);
                }

                WaitStatus::PtraceEvent(pid, _, event) => {
                    if event == libc::PTRACE_EVENT_CLONE {
                        let new_tid = Pid::from_raw(ptrace::getevent(pid)? as i32);
                        tracing::debug!(tid = new_tid.as_raw(), "thread created");
                        self.threads.insert(new_tid, RunState::Running);
                    }
                    ptrace::cont(pid, None)?;
                }

                WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                    self.threads.insert(pid, RunState::Stopped);
                    return Ok(Wait::Trap(pid.as_raw() as u64));
                }

                WaitStatus::Stopped(pid, Signal::SIGSTOP)
                    if !self.threads.contains_key(&pid) =>
                {
                    // initial stop of a freshly cloned thread
                    self.threads.insert(pid, RunState::Running);
                    ptrace::cont(pid, None)?;
                }

                WaitStatus::Stopped(pid, signal) => {
                    // not ours to handle, forward to the target
                    ptrace::cont(pid, signal)?;
                }

                _ => (),
            }
        }
    }

    fn known_thread(&self, thread_id: u64) -> Result<Pid> {
        let tid = Pid::from_raw(thread_id as i32);
        if self.threads.contains_key(&tid) {
            Ok(tid)
        } else {
            Err(Error::TargetGone)
        }
    }

    /// Any stopped thread usable for ptrace pokes; falls back to the main
    /// thread.
    fn poke_thread(&self) -> Pid {
        self.threads
            .iter()
            .find_map(|(&tid, &state)| (state == RunState::Stopped).then_some(tid))
            .unwrap_or(self.process_id)
    }
}

impl MemoryReader for Client {
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len();

        let local = &mut [IoSliceMut::new(buf)];
        let remote = &[RemoteIoVec {
            base: addr as usize,
            len: wanted,
        }];

        let read = process_vm_readv(self.process_id, local, remote)?;

        if read != wanted {
            return Err(Error::PartialMemOp(read, wanted));
        }

        Ok(())
    }
}

fn wait_for_initial_stop(pid: Pid) -> Result<()> {
    let status = waitpid(pid, None)?;

    if !matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP | Signal::SIGSTOP)) {
        return Err(Error::BadChildWait(status));
    }

    ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACECLONE)?;

    Ok(())
}
