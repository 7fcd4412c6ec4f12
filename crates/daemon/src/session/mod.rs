//! Session management module.
//!
//! Sessions live in tmux and outlive connections. This module lists, creates,
//! renames and destroys them ([`registry`], [`tmux`]) and attaches PTY
//! processes to them ([`pty`]). The [`memory`] backends implement the same
//! traits without spawning anything.

pub mod memory;
pub mod output;
pub mod pty;
pub mod registry;
pub mod tmux;

pub use memory::{MemoryProcess, MemoryPty, MemoryRegistry, MemorySpawner};
pub use output::{strip_device_attributes, OutputDecoder};
pub use pty::{
    ExitInfo, Generation, NativePtySpawner, PtyBridge, PtyError, PtyEvent, PtyEventKind,
    PtyEventSender, PtyHandle, PtySpawner, SpawnRequest,
};
pub use registry::{next_free_number, RegistryError, Session, SessionRegistry};
pub use tmux::{parse_session_list, SessionSettings, Tmux, TmuxRegistry};
