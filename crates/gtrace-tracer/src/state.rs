use gtrace_symbol::Function;

/// Functions that must stay traceable even though they live in the runtime;
/// they are what makes panic unwinding visible in a trace.
const RUNTIME_ALLOW_LIST: [&str; 3] = [
    "runtime.deferproc",
    "runtime.gopanic",
    "runtime.gorecover",
];

/// Name prefixes that are never traced.
const DENIED_PREFIXES: [&str; 2] = ["_rt0", "type."];

/// Whether the function may carry a breakpoint.
///
/// Unexported runtime internals, early startup code and type stubs are
/// excluded; everything else is eligible.
pub(crate) fn breakpoint_eligible(function: &Function) -> bool {
    if RUNTIME_ALLOW_LIST.contains(&function.name.as_str()) {
        return true;
    }

    if function.name.starts_with("runtime.") && !function.is_exported() {
        return false;
    }

    !DENIED_PREFIXES
        .iter()
        .any(|prefix| function.name.starts_with(prefix))
}

/// Per-routine call-stack summary.
///
/// Only functions that hit a breakpoint are recorded, so the stack is a
/// summary rather than a complete backtrace.
#[derive(Debug, Clone, Default)]
pub(crate) struct RoutineStatus {
    pub calling_functions: Vec<CallingFunction>,
    pub panicking: bool,
}

impl RoutineStatus {
    /// Stack usage recorded at the most recent tracked call; 0 before the
    /// first one.
    pub fn used_stack_bytes(&self) -> u64 {
        self.calling_functions
            .last()
            .map(|cf| cf.used_stack_bytes_at_entry)
            .unwrap_or(0)
    }

    pub fn is_panicking(&self) -> bool {
        self.calling_functions
            .iter()
            .any(|cf| cf.function.name == "runtime.gopanic")
    }
}

/// One tracked call of a routine.
#[derive(Debug, Clone)]
pub(crate) struct CallingFunction {
    pub function: Function,
    pub return_address: u64,
    pub used_stack_bytes_at_entry: u64,
}

/// How many trailing frames of the summary a running panic has logically
/// unwound: those whose recorded stack usage is at least the usage at the
/// time the handling `defer` was registered.
pub(crate) fn frames_to_skip(
    calling_functions: &[CallingFunction],
    used_stack_bytes_at_defer: u64,
) -> usize {
    for (i, cf) in calling_functions.iter().enumerate().rev() {
        if cf.used_stack_bytes_at_entry < used_stack_bytes_at_defer {
            return calling_functions.len() - 1 - i;
        }
    }

    calling_functions.len().saturating_sub(1)
}

/// The function that turns tracing on and off, plus the routines currently
/// between its entry and return.
pub(crate) struct TracingPoint {
    pub function: Function,
    inside: Vec<RoutineInside>,
}

#[derive(Debug, Clone, Copy)]
struct RoutineInside {
    routine_id: i64,

    /// Stack depth of the routine when it entered the tracing point; the
    /// reference frame for relative depths, and the discriminator that keeps
    /// recursive re-entries from ending membership early.
    stack_depth: i64,
}

impl TracingPoint {
    pub fn new(function: Function) -> Self {
        Self {
            function,
            inside: Vec::new(),
        }
    }

    /// Whether `pc` is the tracing-point entry.
    pub fn hit(&self, pc: u64) -> bool {
        pc == self.function.entry
    }

    /// Records the routine as inside. Idempotent per routine.
    pub fn enter(&mut self, routine_id: i64, stack_depth: i64) {
        if self.is_inside(routine_id) {
            return;
        }

        self.inside.push(RoutineInside {
            routine_id,
            stack_depth,
        });
    }

    /// Removes the routine, but only when the depth matches the one recorded
    /// at entry; inner recursive returns leave membership intact.
    pub fn exit(&mut self, routine_id: i64, stack_depth: i64) -> bool {
        let Some(pos) = self
            .inside
            .iter()
            .position(|r| r.routine_id == routine_id && r.stack_depth == stack_depth)
        else {
            return false;
        };

        self.inside.remove(pos);
        true
    }

    pub fn is_inside(&self, routine_id: i64) -> bool {
        self.inside.iter().any(|r| r.routine_id == routine_id)
    }

    /// Current depth relative to the routine's entry depth; -1 when the
    /// routine is not inside.
    pub fn relative_depth(&self, routine_id: i64, current_depth: i64) -> i64 {
        self.inside
            .iter()
            .find(|r| r.routine_id == routine_id)
            .map(|r| current_depth - r.stack_depth)
            .unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str) -> Function {
        Function {
            name: name.to_owned(),
            entry: 0x1000,
            end: 0x1010,
            parameters: Vec::new(),
        }
    }

    fn calling(name: &str, used_stack: u64) -> CallingFunction {
        CallingFunction {
            function: function(name),
            return_address: 0xdead,
            used_stack_bytes_at_entry: used_stack,
        }
    }

    #[test]
    fn eligibility_denies_runtime_internals() {
        assert!(!breakpoint_eligible(&function("runtime.mallocgc")));
        assert!(!breakpoint_eligible(&function("_rt0_amd64_linux")));
        assert!(!breakpoint_eligible(&function("type..hash.main.T")));
    }

    #[test]
    fn eligibility_keeps_exported_runtime_and_user_code() {
        assert!(breakpoint_eligible(&function("runtime.GC")));
        assert!(breakpoint_eligible(&function("main.main")));
        assert!(breakpoint_eligible(&function("fmt.Println")));
    }

    #[test]
    fn eligibility_keeps_the_panic_machinery() {
        assert!(breakpoint_eligible(&function("runtime.gopanic")));
        assert!(breakpoint_eligible(&function("runtime.gorecover")));
        assert!(breakpoint_eligible(&function("runtime.deferproc")));
    }

    #[test]
    fn enter_and_exit_are_depth_scoped() {
        let mut point = TracingPoint::new(function("main.main"));

        point.enter(1, 3);
        assert!(point.is_inside(1));

        // recursive re-entry does not change the recorded depth
        point.enter(1, 5);
        assert_eq!(point.relative_depth(1, 5), 2);

        // inner return at a different depth keeps the routine inside
        assert!(!point.exit(1, 5));
        assert!(point.is_inside(1));

        // the outermost return removes it
        assert!(point.exit(1, 3));
        assert!(!point.is_inside(1));
        assert_eq!(point.relative_depth(1, 3), -1);
    }

    #[test]
    fn routines_are_tracked_independently() {
        let mut point = TracingPoint::new(function("main.main"));

        point.enter(2, 1);
        point.enter(3, 4);

        assert_eq!(point.relative_depth(2, 2), 1);
        assert_eq!(point.relative_depth(3, 5), 1);

        point.exit(2, 1);
        assert!(!point.is_inside(2));
        assert!(point.is_inside(3));
    }

    #[test]
    fn panic_unwind_skips_trailing_frames() {
        let stack = [
            calling("main.main", 100),
            calling("main.f", 200),
            calling("main.g", 300),
            calling("runtime.gopanic", 400),
        ];

        // defer registered while main.f was on top: the two frames above it
        // are logically unwound
        assert_eq!(frames_to_skip(&stack, 300), 2);

        // defer registered below every tracked frame
        assert_eq!(frames_to_skip(&stack, 100), 3);

        // defer registered above everything tracked: nothing was unwound yet
        assert_eq!(frames_to_skip(&stack, 500), 0);
    }

    #[test]
    fn status_reports_latest_stack_usage() {
        let mut status = RoutineStatus::default();
        assert_eq!(status.used_stack_bytes(), 0);

        status.calling_functions.push(calling("main.f", 128));
        status.calling_functions.push(calling("main.g", 256));
        assert_eq!(status.used_stack_bytes(), 256);

        assert!(!status.is_panicking());
        status.calling_functions.push(calling("runtime.gopanic", 512));
        assert!(status.is_panicking());
    }
}
