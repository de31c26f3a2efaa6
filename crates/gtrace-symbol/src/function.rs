use crate::TypeRef;

/// One function of the target binary.
#[derive(Debug, Clone)]
pub struct Function {
    /// Fully qualified name, e.g. `main.main` or `runtime.gopanic`.
    pub name: String,

    /// Entry address.
    pub entry: u64,

    /// Address one past the last instruction; 0 when unknown (functions
    /// recovered from runtime metadata only).
    pub end: u64,

    /// Parameters in declaration order, results included.
    pub parameters: Vec<Parameter>,
}

impl Function {
    /// Whether the function is exported in the Go sense: the identifier
    /// after the last dot starts with an upper-case letter.
    pub fn is_exported(&self) -> bool {
        self.name
            .rsplit('.')
            .next()
            .and_then(|ident| ident.chars().next())
            .is_some_and(|c| c.is_uppercase())
    }
}

/// One parameter (or result) of a function.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,

    pub typ: TypeRef,

    /// Byte offset from the beginning of the argument area on the stack.
    pub offset: i64,

    /// Results carry this flag; their value is only meaningful on return.
    pub is_output: bool,

    /// False when the debugging information had no usable location for the
    /// parameter; such parameters render as `-`.
    pub exists: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Function {
        Function {
            name: name.to_owned(),
            entry: 0x1000,
            end: 0x1010,
            parameters: Vec::new(),
        }
    }

    #[test]
    fn exported_checks_last_path_segment() {
        assert!(named("runtime.GC").is_exported());
        assert!(named("fmt.Println").is_exported());
        assert!(!named("runtime.gopanic").is_exported());
        assert!(!named("main.main").is_exported());
        assert!(!named("main").is_exported());
    }
}
