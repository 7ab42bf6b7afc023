pub mod ansi;
pub mod event_log;
pub mod naming;
pub mod path_utils;
