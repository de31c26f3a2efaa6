/// The gtrace function-call tracer.
///
/// Launches (or attaches to) a Go program and prints the function calls of
/// every routine passing through the tracing point, indented by stack depth,
/// with arguments decoded from the binary's debugging information.
#[derive(clap::Parser)]
#[clap(name = "gtrace")]
pub struct CliOpts {
    /// PID of a running process to attach to, instead of launching one.
    #[clap(short, long, value_name = "PID")]
    pub attach: Option<i32>,

    /// Tracing starts when this function is called and stops when it
    /// returns.
    #[clap(short, long, value_name = "NAME", default_value = "main.main")]
    pub function: String,

    /// Calls are printed while the stack depth is within this value,
    /// relative to the depth at the tracing point.
    #[clap(short, long, default_value_t = 1)]
    pub depth: i64,

    /// Go version of the attached target (e.g. go1.11), for binaries that
    /// do not embed their build version.
    #[clap(long, value_name = "VERSION")]
    pub go_version: Option<String>,

    /// Program to launch, followed by its arguments.
    #[clap(
        value_name = "PROGRAM",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub program: Vec<String>,
}

impl CliOpts {
    /// Parses the CLI from the command-line.
    pub fn parse_from_cmdline() -> Self {
        clap::Parser::parse()
    }
}
