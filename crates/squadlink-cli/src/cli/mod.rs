pub mod command;
pub mod config;
pub mod runner;

pub use command::CliCommand;
pub use config::CliConfig;
pub use runner::run;
