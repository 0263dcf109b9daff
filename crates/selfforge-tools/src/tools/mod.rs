//! Builtin and dynamic tool implementations.

pub mod code;
pub mod dynamic;
pub mod terminal;
pub mod web_reader;

pub use code::CodeTool;
pub use dynamic::DynamicTool;
pub use terminal::TerminalTool;
pub use web_reader::WebReaderTool;
