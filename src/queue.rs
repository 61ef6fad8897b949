// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The outbound command queue: two priority levels, compression, deduplication, and a head slot
//! that is simultaneously "queue front" and "the single inflight command".

use crate::message::{state, Command};
use std::collections::VecDeque;

/// Result of a queue deletion attempt, mirroring the device's own status byte vocabulary so
/// callers can reuse the same match arms as response handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Ok,
    UnknownId,
}

/// `VecDeque<Command>` where index 0 is the inflight slot. Insertion helpers never touch index 0,
/// which makes "never reorder the head" a property of the insertion code rather than of the
/// underlying structure.
#[derive(Default)]
pub struct CommandQueue {
    inner: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue {
            inner: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn head(&self) -> Option<&Command> {
        self.inner.front()
    }

    /// Inserts `command`, applying priority ordering, compression and deduplication.
    ///
    /// Priority-1 commands are inserted immediately after the last existing priority-1 entry (or
    /// at position 1 if none, i.e. right after the head). Priority-0 commands go to the tail.
    /// Index 0 is never touched by this function.
    pub fn insert(&mut self, command: Command, compression_enabled: bool) {
        let tail_index = self.inner.len().checked_sub(1).filter(|&i| i != 0);
        if let Some(tail_index) = tail_index {
            let tail = &self.inner[tail_index];
            if tail.identifier() == command.identifier() {
                if tail.wire == command.wire {
                    return; // deduplication: identical wire form, drop silently
                }
                if compression_enabled {
                    self.inner[tail_index] = command;
                    return;
                }
            }
        }

        if command.priority == 1 {
            let insert_at = self.last_priority_one_index().map(|i| i + 1).unwrap_or(1).max(1);
            let insert_at = insert_at.min(self.inner.len()).max(if self.inner.is_empty() { 0 } else { 1 });
            self.inner.insert(insert_at, command);
        } else {
            self.inner.push_back(command);
        }
    }

    fn last_priority_one_index(&self) -> Option<usize> {
        self.inner
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, c)| c.priority == 1)
            .map(|(i, _)| i)
            .last()
    }

    /// Removes the first entry (at any position, including the head) matching `identifier`.
    pub fn delete(&mut self, identifier: &str) -> DeleteOutcome {
        if let Some(pos) = self.inner.iter().position(|c| c.identifier() == identifier) {
            self.inner.remove(pos);
            DeleteOutcome::Ok
        } else {
            DeleteOutcome::UnknownId
        }
    }

    /// Pops the current head (on successful resolution or retry exhaustion) and, if a new head
    /// exists, raises it to priority 1 so it is next to transmit.
    pub fn advance(&mut self) -> Option<&Command> {
        self.inner.pop_front();
        if let Some(new_head) = self.inner.front_mut() {
            new_head.priority = 1;
        }
        self.inner.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.inner.iter()
    }
}

/// Classifies a device status byte for the "should we retire this command" decision used by the
/// response routing table (§4.6): unknown-id/not-supported/parameter-error all retire the
/// command even though they are not `state::OK`.
pub fn is_terminal_state(status: u8) -> bool {
    matches!(
        status,
        state::OK | state::UNKNOWN_ID | state::NOT_SUPPORTED | state::PARAMETER_ERROR
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommandKind;

    fn get_cmd(addr: u16, priority: u8) -> Command {
        Command::get(addr, priority, 3).unwrap()
    }

    #[test]
    fn property5_priorities_non_increasing_head_never_displaced() {
        let mut q = CommandQueue::new();
        q.insert(get_cmd(0x0001, 1), false); // head
        q.insert(get_cmd(0x0002, 0), false);
        q.insert(get_cmd(0x0003, 1), false);
        q.insert(get_cmd(0x0004, 0), false);

        let priorities: Vec<u8> = q.iter().map(|c| c.priority).collect();
        for window in priorities.windows(2) {
            assert!(window[0] >= window[1]);
        }
        assert_eq!(q.head().unwrap().message.address, Some(0x0001));
    }

    #[test]
    fn s6_compression_collapses_rapid_relay_toggles() {
        let mut q = CommandQueue::new();
        // One command already inflight at the head.
        q.insert(Command::bare(CommandKind::Ping, 1, 3).unwrap(), true);

        let relay_on = |value: u8| Command::set(0x1002, vec![value], 0, 3).unwrap();
        q.insert(relay_on(1), true);
        q.insert(relay_on(0), true);
        q.insert(relay_on(1), true);

        assert_eq!(q.len(), 2);
        assert_eq!(
            q.iter().last().unwrap().message.value,
            Some(vec![1])
        );
    }

    #[test]
    fn deduplication_drops_identical_wire_form_at_tail() {
        let mut q = CommandQueue::new();
        q.insert(Command::bare(CommandKind::Ping, 1, 3).unwrap(), true);
        let cmd = Command::set(0x1002, vec![1], 0, 3).unwrap();
        q.insert(cmd.clone(), true);
        q.insert(cmd, true);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn delete_reports_unknown_id_when_absent() {
        let mut q = CommandQueue::new();
        q.insert(get_cmd(0x0001, 1), false);
        assert_eq!(q.delete("99999"), DeleteOutcome::UnknownId);
        assert_eq!(q.delete(&get_cmd(0x0001, 1).identifier()), DeleteOutcome::Ok);
    }

    #[test]
    fn advance_raises_new_head_to_priority_one() {
        let mut q = CommandQueue::new();
        q.insert(get_cmd(0x0001, 1), false);
        q.insert(get_cmd(0x0002, 0), false);
        q.advance();
        assert_eq!(q.head().unwrap().priority, 1);
        assert_eq!(q.head().unwrap().message.address, Some(0x0002));
    }

    #[test]
    fn insertion_order_preserved_within_priority_class() {
        let mut q = CommandQueue::new();
        q.insert(get_cmd(0x0001, 1), false); // head
        q.insert(get_cmd(0x0002, 1), false);
        q.insert(get_cmd(0x0003, 1), false);
        let addrs: Vec<Option<u16>> = q.iter().map(|c| c.message.address).collect();
        assert_eq!(addrs, vec![Some(0x0001), Some(0x0002), Some(0x0003)]);
    }
}
