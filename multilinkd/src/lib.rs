#[cfg(not(unix))]
compile_error!("multilinkd needs Unix domain sockets for link hand-off and only builds on Unix");

pub mod cli;
pub mod config;
pub mod runtime;
