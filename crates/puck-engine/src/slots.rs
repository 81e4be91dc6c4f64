//! Upload slot accounting.
//!
//! Slots are a global resource shared by every peer connection. A
//! request walks the policy ladder: a normal slot if one is free, a
//! minislot for filelists and tiny files when the peer negotiated
//! `MiniSlots`, an extra slot if the user granted one to that nick, and
//! finally a free-for-all slot when the operator enabled those. A denied
//! request makes the connection answer `$MaxedOut` and close.

use std::collections::HashMap;

/// Files at or below this size qualify for a minislot
pub const MINISLOT_LIMIT: u64 = 64 * 1024;

/// The kind of slot a connection holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No slot; the request was denied
    None,
    /// A regular slot
    Normal,
    /// A small-file slot outside the regular budget
    Mini,
    /// A slot granted specifically to this nick
    Extra,
    /// Free-for-all mode slot
    Free,
}

/// The global slot table
#[derive(Debug)]
pub struct SlotManager {
    total: u32,
    in_use: u32,
    minis_in_use: u32,
    extras: HashMap<String, u32>,
    free_for_all: bool,
}

impl SlotManager {
    /// A manager with `total` regular slots
    #[must_use]
    pub fn new(total: u32) -> Self {
        Self {
            total,
            in_use: 0,
            minis_in_use: 0,
            extras: HashMap::new(),
            free_for_all: false,
        }
    }

    /// Adjust the regular slot budget
    pub fn set_total(&mut self, total: u32) {
        self.total = total;
    }

    /// Regular slots configured
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Regular slots not in use
    #[must_use]
    pub fn free(&self) -> u32 {
        self.total.saturating_sub(self.in_use)
    }

    /// Grant `count` extra slots to a nick
    pub fn grant_extra(&mut self, nick: &str, count: u32) {
        *self.extras.entry(nick.to_string()).or_insert(0) += count;
    }

    /// Enable or disable free-for-all uploads
    pub fn set_free_for_all(&mut self, enabled: bool) {
        self.free_for_all = enabled;
    }

    /// Try to acquire a slot for an upload to `nick`.
    pub fn request(
        &mut self,
        nick: &str,
        file_size: Option<u64>,
        is_filelist: bool,
        peer_has_minislots: bool,
    ) -> SlotState {
        if self.in_use < self.total {
            self.in_use += 1;
            return SlotState::Normal;
        }

        let small = is_filelist || file_size.is_some_and(|s| s <= MINISLOT_LIMIT);
        if small && peer_has_minislots {
            self.minis_in_use += 1;
            return SlotState::Mini;
        }

        if let Some(granted) = self.extras.get_mut(nick) {
            if *granted > 0 {
                *granted -= 1;
                return SlotState::Extra;
            }
        }

        if self.free_for_all {
            return SlotState::Free;
        }

        SlotState::None
    }

    /// Return a previously acquired slot
    pub fn release(&mut self, state: SlotState) {
        match state {
            SlotState::Normal => self.in_use = self.in_use.saturating_sub(1),
            SlotState::Mini => self.minis_in_use = self.minis_in_use.saturating_sub(1),
            SlotState::None | SlotState::Extra | SlotState::Free => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_slots_until_full() {
        let mut slots = SlotManager::new(2);
        assert_eq!(slots.request("a", Some(1 << 20), false, false), SlotState::Normal);
        assert_eq!(slots.request("b", Some(1 << 20), false, false), SlotState::Normal);
        assert_eq!(slots.request("c", Some(1 << 20), false, false), SlotState::None);
        assert_eq!(slots.free(), 0);

        slots.release(SlotState::Normal);
        assert_eq!(slots.free(), 1);
        assert_eq!(slots.request("c", Some(1 << 20), false, false), SlotState::Normal);
    }

    #[test]
    fn test_minislot_for_small_files() {
        let mut slots = SlotManager::new(0);
        // small file, peer negotiated MiniSlots
        assert_eq!(slots.request("a", Some(1024), false, true), SlotState::Mini);
        // filelists always qualify
        assert_eq!(slots.request("a", None, true, true), SlotState::Mini);
        // big file does not
        assert_eq!(
            slots.request("a", Some(MINISLOT_LIMIT + 1), false, true),
            SlotState::None
        );
        // peer without the feature does not
        assert_eq!(slots.request("a", Some(1024), false, false), SlotState::None);
    }

    #[test]
    fn test_extra_grants_are_consumed() {
        let mut slots = SlotManager::new(0);
        slots.grant_extra("friend", 1);
        assert_eq!(
            slots.request("friend", Some(1 << 20), false, false),
            SlotState::Extra
        );
        assert_eq!(
            slots.request("friend", Some(1 << 20), false, false),
            SlotState::None
        );
        assert_eq!(
            slots.request("stranger", Some(1 << 20), false, false),
            SlotState::None
        );
    }

    #[test]
    fn test_free_for_all() {
        let mut slots = SlotManager::new(0);
        slots.set_free_for_all(true);
        assert_eq!(
            slots.request("anyone", Some(1 << 30), false, false),
            SlotState::Free
        );
    }
}
