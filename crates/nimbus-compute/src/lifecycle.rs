//! Which operations a server accepts in which state.
//!
//! Anything not listed is rejected. A server whose state is not settled has
//! an operation in flight and rejects everything as busy.

use std::fmt;

use uuid::Uuid;

use crate::models::ServerState::{
    Active, Error as Errored, Paused, ResizeAwaitingConfirmation, Stopped, Suspended,
};
use crate::models::{RebootKind, ServerState};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SoftReboot,
    HardReboot,
    Rebuild,
    Resize,
    ConfirmResize,
    RevertResize,
    Pause,
    Unpause,
    Suspend,
    Resume,
    Stop,
    Start,
    CreateImage,
    Delete,
}

const SETTLED: &[ServerState] = &[
    Active,
    ResizeAwaitingConfirmation,
    Paused,
    Suspended,
    Stopped,
    Errored,
];

impl Operation {
    pub const ALL: [Operation; 14] = [
        Self::SoftReboot,
        Self::HardReboot,
        Self::Rebuild,
        Self::Resize,
        Self::ConfirmResize,
        Self::RevertResize,
        Self::Pause,
        Self::Unpause,
        Self::Suspend,
        Self::Resume,
        Self::Stop,
        Self::Start,
        Self::CreateImage,
        Self::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoftReboot => "soft reboot",
            Self::HardReboot => "hard reboot",
            Self::Rebuild => "rebuild",
            Self::Resize => "resize",
            Self::ConfirmResize => "confirm resize",
            Self::RevertResize => "revert resize",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::CreateImage => "create image",
            Self::Delete => "delete",
        }
    }

    pub fn reboot(kind: RebootKind) -> Self {
        match kind {
            RebootKind::Soft => Self::SoftReboot,
            RebootKind::Hard => Self::HardReboot,
        }
    }

    /// States from which this operation may start.
    pub fn allowed_from(&self) -> &'static [ServerState] {
        match self {
            Self::SoftReboot => &[Active],
            Self::HardReboot => &[Active, Paused, Stopped, Errored],
            Self::Rebuild => &[Active, Stopped, Errored],
            Self::Resize => &[Active],
            Self::ConfirmResize | Self::RevertResize => &[ResizeAwaitingConfirmation],
            Self::Pause => &[Active],
            Self::Unpause => &[Paused],
            Self::Suspend => &[Active],
            Self::Resume => &[Suspended],
            Self::Stop => &[Active, Errored],
            Self::Start => &[Stopped],
            Self::CreateImage => &[Active, Stopped, Paused, Suspended],
            Self::Delete => SETTLED,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that `operation` may start on server `id` in `state`.
pub fn check_transition(id: Uuid, state: ServerState, operation: Operation) -> Result<()> {
    if !state.is_settled() {
        return Err(Error::ServerBusy(id));
    }
    if !operation.allowed_from().contains(&state) {
        return Err(Error::InvalidStateTransition { state, operation });
    }
    Ok(())
}
