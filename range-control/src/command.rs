pub mod executor;
pub mod result;
pub mod safety;
pub mod sudo;

pub use executor::{
    CommandError, CommandExecutor, CommandRunner, CommandSpec, OutputLine, OutputSink,
    OutputStream, SystemCommandRunner,
};
pub use result::CommandResult;
pub use safety::{SafetyError, SafetyValidator};
pub use sudo::SudoManager;
