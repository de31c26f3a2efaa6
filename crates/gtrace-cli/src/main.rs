#![allow(clippy::print_stderr)]

mod cli;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use miette::IntoDiagnostic;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use gtrace_tracee::Process;
use gtrace_tracer::Controller;
use tracing_subscriber::EnvFilter;

use crate::cli::CliOpts;

fn main() {
    let cli = CliOpts::parse_from_cmdline();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("GTRACE_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}

fn run(cli: CliOpts) -> miette::Result<()> {
    let process = match cli.attach {
        Some(pid) => Process::attach(pid, cli.go_version.as_deref()),
        None => {
            let Some((program, args)) = cli.program.split_first() else {
                return Err(miette::miette!(
                    "either a program to launch or --attach is required"
                ));
            };
            Process::launch(program, args)
        }
    }
    .into_diagnostic()?;

    let mut controller = Controller::new(process);

    install_interrupt_handler(controller.interrupt_handle()).into_diagnostic()?;

    controller.set_tracing_point(&cli.function).into_diagnostic()?;
    controller.set_depth(cli.depth);

    controller.main_loop().into_diagnostic()
}

static INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    if let Some(flag) = INTERRUPT_FLAG.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

/// Routes SIGINT into the controller's interrupt flag, so Ctrl-C detaches
/// the target cleanly instead of killing it mid-stop.
fn install_interrupt_handler(flag: Arc<AtomicBool>) -> nix::Result<()> {
    let _ = INTERRUPT_FLAG.set(flag);

    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe { sigaction(Signal::SIGINT, &action) }.map(|_| ())
}
