//! Session management: the exclusive session record, PTY lifecycle, output
//! pump, and input routing.

pub mod input;
pub mod manager;
pub mod pty;
pub mod pump;
pub mod registry;

pub use input::InputRouter;
pub use manager::{PtyProcessManager, TerminalHandle};
pub use pty::TerminalOptions;
pub use pump::OutputSink;
pub use registry::SessionRegistry;
