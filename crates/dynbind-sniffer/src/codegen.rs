//! Declaration boilerplate rendering.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

/// A symbol found in a library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffedSymbol {
    pub name: String,
    pub address: String,
    /// Source-line context, empty when the library has no debug info.
    pub line: String,
}

/// Symbols sniffed from one library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
    path: String,
    symbols: Vec<SniffedSymbol>,
}

impl SniffResult {
    pub fn new(path: impl Into<String>, symbols: Vec<SniffedSymbol>) -> Self {
        Self {
            path: path.into(),
            symbols,
        }
    }

    /// Build a result from `(name, source line)` pairs found another way.
    pub fn from_symbols<N, L>(path: impl Into<String>, symbols: impl IntoIterator<Item = (N, L)>) -> Self
    where
        N: Into<String>,
        L: Into<String>,
    {
        let symbols = symbols
            .into_iter()
            .map(|(name, line)| SniffedSymbol {
                name: name.into(),
                address: String::new(),
                line: line.into(),
            })
            .collect();
        Self::new(path, symbols)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn symbols(&self) -> &[SniffedSymbol] {
        &self.symbols
    }

    pub fn add_symbol(&mut self, symbol: SniffedSymbol) {
        self.symbols.push(symbol);
    }

    /// Render declaration boilerplate stamped with the current time.
    pub fn to_declarations(&self) -> String {
        self.to_declarations_at(Utc::now())
    }

    /// Render declaration boilerplate stamped with `generated`.
    pub fn to_declarations_at(&self, generated: DateTime<Utc>) -> String {
        let mut out = String::new();

        // Writing to a String cannot fail.
        let _ = writeln!(out, "// ---");
        let _ = writeln!(
            out,
            "// Code below was automatically generated {} UTC",
            generated.format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(out, "// Total functions: {}", self.symbols.len());
        let _ = writeln!(out, "// ---");
        let _ = writeln!(
            out,
            "let mut lib = Library::new({:?}, ScopeOptions::new())?;",
            self.path
        );

        for symbol in &self.symbols {
            out.push('\n');
            if !symbol.line.is_empty() {
                let _ = writeln!(out, "// {}", symbol.line);
            }
            let _ = writeln!(
                out,
                "lib.declare_function(FunctionDecl::new({:?}))?;",
                symbol.name
            );
        }

        out.push_str("\nlib.bind()?;\n");
        out
    }
}
