//! Outstanding requests awaiting an event.
//!
//! Commands are keyed by the physical address of their command TRB, which the
//! controller echoes back in the Command Completion event. The one EP0 control
//! transfer a slot may have in flight is keyed by slot ID.

use alloc::collections::BTreeMap;

use super::trb::CompletionCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// A caller is polling for the result.
    Awaited,
    /// Issued from disconnect handling; the slot's memory is returned when it
    /// completes.
    DisableSlot { slot_id: u8 },
}

/// Result of a completed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    pub code: CompletionCode,
    pub slot_id: u8,
}

struct CommandEntry {
    kind: CommandKind,
    result: Option<CommandResult>,
}

struct ControlEntry {
    /// TRB carrying IOC (the status stage).
    status_trb: u64,
    result: Option<CompletionCode>,
}

#[derive(Default)]
pub struct PendingRequests {
    commands: BTreeMap<u64, CommandEntry>,
    controls: BTreeMap<u8, ControlEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_command(&mut self, trb: u64, kind: CommandKind) {
        self.commands.insert(trb, CommandEntry { kind, result: None });
    }

    /// Records a completion. Fire-and-forget entries are removed at once;
    /// awaited ones stay until [`take_command`](Self::take_command).
    /// Unknown addresses yield `None`.
    pub fn complete_command(&mut self, trb: u64, result: CommandResult) -> Option<CommandKind> {
        let entry = self.commands.get_mut(&trb)?;
        let kind = entry.kind;
        match kind {
            CommandKind::Awaited => entry.result = Some(result),
            CommandKind::DisableSlot { .. } => {
                self.commands.remove(&trb);
            }
        }
        Some(kind)
    }

    pub fn take_command(&mut self, trb: u64) -> Option<CommandResult> {
        let result = self.commands.get(&trb)?.result?;
        self.commands.remove(&trb);
        Some(result)
    }

    /// Gives up on a command; a late completion is then dropped.
    pub fn cancel_command(&mut self, trb: u64) {
        self.commands.remove(&trb);
    }

    pub fn insert_control(&mut self, slot_id: u8, status_trb: u64) {
        self.controls.insert(
            slot_id,
            ControlEntry {
                status_trb,
                result: None,
            },
        );
    }

    /// Offers an EP0 transfer event. Returns false if no control transfer is
    /// outstanding on the slot.
    ///
    /// The transfer is resolved by the status stage event, or by the first
    /// event reporting an error on any stage.
    pub fn complete_control(&mut self, slot_id: u8, trb: u64, code: CompletionCode) -> bool {
        let Some(entry) = self.controls.get_mut(&slot_id) else {
            return false;
        };
        if entry.result.is_none() && (trb == entry.status_trb || !code.is_transfer_ok()) {
            entry.result = Some(code);
        }
        true
    }

    pub fn take_control(&mut self, slot_id: u8) -> Option<CompletionCode> {
        let result = self.controls.get(&slot_id)?.result?;
        self.controls.remove(&slot_id);
        Some(result)
    }

    pub fn cancel_control(&mut self, slot_id: u8) {
        self.controls.remove(&slot_id);
    }

    /// Drops everything tied to a slot that is going away.
    pub fn forget_slot(&mut self, slot_id: u8) {
        self.controls.remove(&slot_id);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.controls.is_empty()
    }
}
