//! Symbol discovery for dynbind.
//!
//! Inspects a compiled shared library for exported functions and renders
//! declaration boilerplate for them. The output is plain text; nothing here
//! depends on the binding engine.
//!
//! ```no_run
//! use dynbind_sniffer::NmSymbolSniffer;
//!
//! let result = NmSymbolSniffer::new("/usr/lib/libexample.so").sniff()?;
//! println!("{}", result.to_declarations());
//! # Ok::<(), dynbind_sniffer::SniffError>(())
//! ```

mod codegen;
mod error;
mod sniffer;

pub use codegen::{SniffResult, SniffedSymbol};
pub use error::SniffError;
pub use sniffer::{NmSymbolSniffer, parse_nm_output};
