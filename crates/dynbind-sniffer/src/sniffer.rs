//! `nm`-based symbol sniffer.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::codegen::{SniffResult, SniffedSymbol};
use crate::error::SniffError;

/// Uses `nm` from binutils to list the functions a library exports.
#[derive(Debug, Clone)]
pub struct NmSymbolSniffer {
    path: String,
}

impl NmSymbolSniffer {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().display().to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `nm -DCl` on the library and collect its exported functions.
    pub fn sniff(&self) -> Result<SniffResult, SniffError> {
        let output = Command::new("nm")
            .args(["-DCl", &self.path])
            .output()
            .map_err(|e| {
                SniffError::CommandFailed(format!(
                    "{e}; make sure 'nm' from binutils is available"
                ))
            })?;

        if !output.status.success() {
            return Err(SniffError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let symbols = parse_nm_output(&stdout)?;
        debug!(library = %self.path, symbols = symbols.len(), "sniffed library");

        Ok(SniffResult::new(self.path.clone(), symbols))
    }
}

/// Extract exported text symbols from `nm -DCl` output.
///
/// Lines for undefined symbols (leading space) and non-text symbols are
/// skipped, as are reserved names starting with `_`.
pub fn parse_nm_output(output: &str) -> Result<Vec<SniffedSymbol>, SniffError> {
    let mut symbols = Vec::new();

    for line in output.lines() {
        if line.starts_with(' ') {
            continue;
        }

        let chunks: Vec<&str> = line.split(' ').collect();
        if chunks.len() < 2 || chunks[1] != "T" {
            continue;
        }
        let [address, _, name] = chunks[..] else {
            return Err(SniffError::MalformedLine {
                line: line.to_string(),
                chunks: chunks.len(),
            });
        };

        if name.starts_with('_') {
            continue;
        }

        let (name, source_line) = name.split_once('\t').unwrap_or((name, ""));
        symbols.push(SniffedSymbol {
            name: name.to_string(),
            address: address.to_string(),
            line: source_line.to_string(),
        });
    }

    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
                 U free
0000000000001139 T add\t/src/add.c:3
0000000000001150 T _internal
0000000000004010 D counter
0000000000001160 T sub
";

    #[test]
    fn keeps_exported_functions() {
        let symbols = parse_nm_output(OUTPUT).unwrap();
        let names: Vec<_> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["add", "sub"]);
        assert_eq!(symbols[0].address, "0000000000001139");
        assert_eq!(symbols[0].line, "/src/add.c:3");
        assert_eq!(symbols[1].line, "");
    }

    #[test]
    fn malformed_text_line() {
        let err = parse_nm_output("0000 T operator new(unsigned long)\n").unwrap_err();
        assert!(matches!(err, SniffError::MalformedLine { chunks: 5, .. }));
    }

    #[test]
    fn missing_library_fails() {
        let result = NmSymbolSniffer::new("/nonexistent/libnothing.so").sniff();
        assert!(matches!(result, Err(SniffError::CommandFailed(_))));
    }
}
