use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gtrace_debugger::Event;
use gtrace_tracee::{Process, RoutineInfo, StackFrame};

use crate::state::{breakpoint_eligible, frames_to_skip};
use crate::state::{CallingFunction, RoutineStatus, TracingPoint};
use crate::{Error, Result};

/// Parsing depth for argument values: one level of pointers, slices, maps
/// and interfaces is followed.
const ARGUMENT_PARSE_DEPTH: usize = 1;

/// The tracing engine.
///
/// Drives the target through continue/step cycles, classifies every trap as
/// call, return or unrelated, and prints the calls of routines that are
/// inside the tracing point within the configured depth.
pub struct Controller {
    process: Process,
    status_store: HashMap<i64, RoutineStatus>,

    tracing_point: Option<TracingPoint>,
    depth: i64,

    /// Whether the tracing point was hit at least once (and therefore the
    /// full breakpoint set is armed).
    hit_once: bool,

    interrupted: Arc<AtomicBool>,
    output: Box<dyn Write>,
}

impl Controller {
    /// Creates a controller over a launched or attached process. The trace
    /// is written to standard output.
    pub fn new(process: Process) -> Self {
        Self {
            process,
            status_store: HashMap::new(),
            tracing_point: None,
            depth: 1,
            hit_once: false,
            interrupted: Arc::new(AtomicBool::new(false)),
            output: Box::new(std::io::stdout()),
        }
    }

    /// Redirects the trace output.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Sets the function whose entry enables tracing and whose return
    /// disables it. Can be set only once.
    pub fn set_tracing_point(&mut self, function_name: &str) -> Result<()> {
        if self.tracing_point.is_some() {
            return Err(Error::TracingPointAlreadySet);
        }

        let function = self
            .process
            .function_by_name(function_name)?
            .cloned()
            .ok_or_else(|| Error::FunctionNotFound(function_name.to_owned()))?;

        if !breakpoint_eligible(&function) {
            return Err(Error::NotTraceable(function_name.to_owned()));
        }

        self.process.set_breakpoint(function.entry)?;
        self.tracing_point = Some(TracingPoint::new(function));

        Ok(())
    }

    /// Sets the depth limit: calls are printed while the routine's stack
    /// depth is within this value, relative to its depth at the tracing
    /// point.
    pub fn set_depth(&mut self, depth: i64) {
        self.depth = depth;
    }

    /// Requests a clean shutdown; observed between trap batches.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    /// Flag behind [`interrupt`](Self::interrupt), for wiring into signal
    /// handlers.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Repeatedly resumes the target and handles the stops, until the
    /// target exits or the controller is interrupted.
    #[tracing::instrument(name = "MainLoop", skip_all)]
    pub fn main_loop(&mut self) -> Result<()> {
        let (mut trapped_threads, mut event) = self.process.continue_and_wait()?;

        loop {
            match event {
                Event::Exited(_) => return Ok(()),
                Event::CoreDump => return Err(Error::CoreDump),
                Event::Terminated(signal) => return Err(Error::Terminated(signal)),
                Event::Trapped => {
                    (trapped_threads, event) = self.handle_trap_batch(trapped_threads)?;
                }
            }
        }
    }

    fn handle_trap_batch(&mut self, trapped_threads: Vec<u64>) -> Result<(Vec<u64>, Event)> {
        for thread_id in trapped_threads {
            self.handle_trapped_thread(thread_id)?;
        }

        if self.interrupted.load(Ordering::Relaxed) {
            self.process.detach()?;
            return Err(Error::Interrupted);
        }

        self.process.continue_and_wait().map_err(Into::into)
    }

    /// Classifies one thread's trap by comparing the routine's current stack
    /// usage against the tracked one: growth is a call, shrinkage a return,
    /// anything else (stack relocation, another routine's conditional
    /// breakpoint) is stepped over silently.
    fn handle_trapped_thread(&mut self, thread_id: u64) -> Result<()> {
        let info = self.process.current_routine_info(thread_id)?;
        let trap_addr = info.current_pc - 1;

        if !self.process.hit_breakpoint(trap_addr, info.id) {
            return self.step_over(thread_id, trap_addr);
        }

        let tracked_usage = self
            .status_store
            .get(&info.id)
            .map(RoutineStatus::used_stack_bytes)
            .unwrap_or(0);

        if info.used_stack_bytes < tracked_usage {
            self.handle_function_return(thread_id, info)
        } else if info.used_stack_bytes == tracked_usage {
            self.step_over(thread_id, trap_addr)
        } else {
            self.handle_function_call(thread_id, info)
        }
    }

    fn step_over(&mut self, thread_id: u64, trap_addr: u64) -> Result<()> {
        self.process
            .single_step(thread_id, trap_addr)
            .map_err(Into::into)
    }

    fn handle_function_call(&mut self, thread_id: u64, info: RoutineInfo) -> Result<()> {
        let mut status = self.status_store.get(&info.id).cloned().unwrap_or_default();
        let trap_addr = info.current_pc - 1;

        let panicking = status.is_panicking();
        let mut depth = status.calling_functions.len() as i64 + 1;
        if panicking {
            if let Some(handler) = &info.panic_handler {
                depth -=
                    frames_to_skip(&status.calling_functions, handler.used_stack_bytes_at_defer)
                        as i64;
            }
        }

        if self
            .tracing_point
            .as_ref()
            .is_some_and(|point| point.hit(trap_addr))
        {
            if !self.hit_once {
                self.arm_eligible_breakpoints()?;
                self.hit_once = true;
            }

            if let Some(point) = self.tracing_point.as_mut() {
                point.enter(info.id, depth);
            }
        }

        // rsp still points below the just-pushed return address here
        let frame = self
            .process
            .stack_frame_at(info.current_stack_pointer - 8, info.current_pc)?;

        if self.can_print(info.id, depth) {
            self.print_function_input(info.id, &frame, depth)?;
        }

        self.process
            .set_conditional_breakpoint(frame.return_address, info.id)?;

        self.process.single_step(thread_id, frame.function.entry)?;

        status.calling_functions.push(CallingFunction {
            function: frame.function,
            return_address: frame.return_address,
            used_stack_bytes_at_entry: info.used_stack_bytes,
        });
        status.panicking = panicking;
        self.status_store.insert(info.id, status);

        Ok(())
    }

    fn handle_function_return(&mut self, thread_id: u64, info: RoutineInfo) -> Result<()> {
        let mut status = self.status_store.get(&info.id).cloned().unwrap_or_default();
        let trap_addr = info.current_pc - 1;

        let panicking = status.is_panicking();
        let mut depth = status.calling_functions.len() as i64;
        if panicking {
            if let Some(handler) = &info.panic_handler {
                depth -=
                    frames_to_skip(&status.calling_functions, handler.used_stack_bytes_at_defer)
                        as i64;
            }
        }

        if self.can_print(info.id, depth) {
            if let Some(returned) = status.calling_functions.last() {
                // the return trap fires one call deeper than the frame we
                // want, hence the extra slot
                let frame = self
                    .process
                    .stack_frame_at(info.current_stack_pointer - 16, returned.function.entry)?;

                self.print_function_output(info.id, &frame, depth)?;

                let entry = returned.function.entry;
                if let Some(point) = self.tracing_point.as_mut() {
                    if point.hit(entry) {
                        point.exit(info.id, depth);
                    }
                }
            }
        }

        self.process.single_step(thread_id, trap_addr)?;
        self.process
            .clear_conditional_breakpoint(trap_addr, info.id)?;

        status.calling_functions.pop();
        status.panicking = panicking;
        self.status_store.insert(info.id, status);

        Ok(())
    }

    /// Arms breakpoints on every eligible function except the tracing point
    /// itself (which already carries one). Runs once, at the first hit of
    /// the tracing point.
    fn arm_eligible_breakpoints(&mut self) -> Result<()> {
        let Some(point_name) = self
            .tracing_point
            .as_ref()
            .map(|point| point.function.name.clone())
        else {
            return Ok(());
        };

        let targets: Vec<u64> = self
            .process
            .functions()?
            .iter()
            .filter(|f| breakpoint_eligible(f) && f.name != point_name)
            .map(|f| f.entry)
            .collect();

        tracing::info!(count = targets.len(), "arming breakpoints");

        for entry in targets {
            self.process.set_breakpoint(entry)?;
        }

        Ok(())
    }

    fn can_print(&self, routine_id: i64, current_depth: i64) -> bool {
        let Some(point) = self.tracing_point.as_ref() else {
            return false;
        };

        point.is_inside(routine_id)
            && point.relative_depth(routine_id, current_depth) <= self.depth
    }

    fn print_function_input(
        &mut self,
        routine_id: i64,
        frame: &StackFrame,
        depth: i64,
    ) -> Result<()> {
        let args = self.format_arguments(&frame.inputs);
        let line = format_input_line(routine_id, &frame.function.name, &args, depth);

        writeln!(self.output, "{line}").map_err(Into::into)
    }

    fn print_function_output(
        &mut self,
        routine_id: i64,
        frame: &StackFrame,
        depth: i64,
    ) -> Result<()> {
        let args = self.format_arguments(&frame.outputs);
        let line = format_output_line(routine_id, &frame.function.name, &args, depth);

        writeln!(self.output, "{line}").map_err(Into::into)
    }

    fn format_arguments(&self, args: &[gtrace_tracee::Argument]) -> Vec<String> {
        args.iter()
            .map(|arg| {
                match self.process.argument_value(arg, ARGUMENT_PARSE_DEPTH) {
                    Some(value) => format!("{} = {}", arg.name, value),
                    None => format!("{} = -", arg.name),
                }
            })
            .collect()
    }
}

fn indent(depth: i64) -> String {
    " ".repeat(depth.saturating_sub(1).max(0) as usize)
}

fn format_input_line(routine_id: i64, function: &str, args: &[String], depth: i64) -> String {
    format!(
        "{}\\ (#{:02}) {}({})",
        indent(depth),
        routine_id,
        function,
        args.join(", ")
    )
}

fn format_output_line(routine_id: i64, function: &str, args: &[String], depth: i64) -> String {
    format!(
        "{}/ (#{:02}) {}() ({})",
        indent(depth),
        routine_id,
        function,
        args.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_lines_are_indented_by_relative_depth() {
        let args = vec!["n = 3".to_owned()];

        assert_eq!(
            format_input_line(1, "main.fib", &args, 1),
            r"\ (#01) main.fib(n = 3)"
        );
        assert_eq!(
            format_input_line(1, "main.fib", &args, 3),
            r"  \ (#01) main.fib(n = 3)"
        );
    }

    #[test]
    fn output_lines_carry_results_after_the_empty_arg_list() {
        let args = vec!["~r1 = 2".to_owned()];

        assert_eq!(
            format_output_line(1, "main.fib", &args, 2),
            r" / (#01) main.fib() (~r1 = 2)"
        );
    }

    #[test]
    fn routine_ids_are_zero_padded() {
        assert_eq!(format_input_line(2, "main.f", &[], 1), r"\ (#02) main.f()");
        assert_eq!(
            format_output_line(12, "main.f", &[], 1),
            r"/ (#12) main.f() ()"
        );
    }
}
