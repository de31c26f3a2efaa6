/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Elf(#[from] goblin::error::Error),

    #[error(transparent)]
    Dwarf(#[from] gimli::Error),

    /// The binary is not for the only supported machine (x86-64).
    #[error("elf.e_machine={0:#x} not supported")]
    ElfPlatform(u16),

    /// A required symbol is missing from the symbol table.
    #[error("symbol {0} not found")]
    MissingSymbol(String),

    /// A required type is missing from the debugging information.
    #[error("type {0} not found in debugging information")]
    MissingType(String),

    /// The binary carries no DWARF sections at all.
    #[error("no debugging information")]
    MissingDebugInfo,
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
