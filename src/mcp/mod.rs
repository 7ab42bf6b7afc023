pub mod handler;
pub mod schemas;

pub use handler::{server_details, ToolHandler};
