pub(crate) mod command;
pub(crate) mod preview;
pub(crate) mod print;
pub(crate) mod scan;
pub(crate) mod ui;

pub use self::command::{
    Args, Command, FakeArgs, LogLevel, OutputFormat, PreviewArgs, PrintArgs, PrinterArgs,
};
