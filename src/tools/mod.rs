pub mod terminal_tool;

pub use terminal_tool::TerminalTools;
