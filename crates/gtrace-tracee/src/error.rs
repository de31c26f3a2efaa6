/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Debugger(#[from] gtrace_debugger::Error),

    #[error(transparent)]
    Symbol(#[from] gtrace_symbol::Error),

    #[error(transparent)]
    Disasm(#[from] capstone::Error),

    /// No function covers the given program counter.
    #[error("no function found for pc {0:#x}")]
    NoFunction(u64),

    /// No module-data record covers the given program counter.
    #[error("no module data found for pc {0:#x}")]
    NoModuleData(u64),

    /// A struct field expected by the runtime layout is missing from the
    /// debugging information.
    #[error("field {1} not found in type {0}")]
    FieldNotFound(String, String),

    /// The end address of the function is unknown, so its instructions
    /// cannot be read.
    #[error("the end address of the function {0} is unknown")]
    UnknownFunctionEnd(String),

    /// The binary was released because the target exited.
    #[error("target binary already released")]
    BinaryReleased,
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
