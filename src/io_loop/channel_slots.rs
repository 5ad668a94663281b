use crate::errors::*;
use indexmap::IndexSet;
use snafu::OptionExt;
use std::collections::hash_map::{Drain, Entry, HashMap};

/// Bookkeeping for the channel-id space of one connection.
///
/// Ids are handed out from 1 upward; ids freed by closed channels are
/// parked in an insertion-ordered set and reused once the fresh range is
/// exhausted. Id 0 is the connection's own channel and is stored here too,
/// but only ever at the explicit request of the I/O loop.
pub(crate) struct ChannelSlots<T> {
    slots: HashMap<u16, T>,
    freed_channel_ids: IndexSet<u16>,
    next_channel_id: u16,
    channel_max: u16,
}

impl<T> ChannelSlots<T> {
    pub(crate) fn new() -> ChannelSlots<T> {
        ChannelSlots {
            slots: HashMap::new(),
            freed_channel_ids: IndexSet::new(),
            next_channel_id: 1,
            channel_max: 0,
        }
    }

    /// Record the negotiated upper bound of the id space. Must happen
    /// before any channel is opened.
    pub(crate) fn set_channel_max(&mut self, channel_max: u16) {
        assert!(
            self.slots.is_empty() && self.freed_channel_ids.is_empty(),
            "channel_max set after channels were opened"
        );
        self.channel_max = channel_max;
    }

    pub(crate) fn get(&self, channel_id: u16) -> Option<&T> {
        self.slots.get(&channel_id)
    }

    pub(crate) fn get_mut(&mut self, channel_id: u16) -> Option<&mut T> {
        self.slots.get_mut(&channel_id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&u16, &T)> {
        self.slots.iter()
    }

    /// Insert a slot built by `make_entry`, either at the caller's explicit
    /// id or at the lowest id available. `make_entry` also produces the
    /// value handed back to the caller (the client-side handle).
    pub(crate) fn insert<F, U>(&mut self, channel_id: Option<u16>, make_entry: F) -> Result<U>
    where
        F: FnOnce(u16) -> Result<(T, U)>,
    {
        match channel_id {
            Some(channel_id) => {
                if channel_id > self.channel_max {
                    return UnavailableChannelIdSnafu { channel_id }.fail();
                }
                match self.slots.entry(channel_id) {
                    Entry::Occupied(_) => UnavailableChannelIdSnafu { channel_id }.fail(),
                    Entry::Vacant(entry) => {
                        let (t, u) = make_entry(channel_id)?;
                        entry.insert(t);
                        Ok(u)
                    }
                }
            }
            None => self.insert_at_free_id(make_entry),
        }
    }

    pub(crate) fn remove(&mut self, channel_id: u16) -> Option<T> {
        let entry = self.slots.remove(&channel_id)?;
        self.freed_channel_ids.insert(channel_id);
        Some(entry)
    }

    pub(crate) fn drain(&mut self) -> Drain<u16, T> {
        for id in self.slots.keys() {
            self.freed_channel_ids.insert(*id);
        }
        self.slots.drain()
    }

    fn insert_at_free_id<F, U>(&mut self, make_entry: F) -> Result<U>
    where
        F: FnOnce(u16) -> Result<(T, U)>,
    {
        // Walk the never-used range first. Explicitly requested ids may be
        // sitting inside it, so skip over occupied entries.
        while self.next_channel_id <= self.channel_max {
            let channel_id = self.next_channel_id;
            self.next_channel_id += 1;
            if let Entry::Vacant(entry) = self.slots.entry(channel_id) {
                let (t, u) = make_entry(channel_id)?;
                entry.insert(t);
                return Ok(u);
            }
        }

        // Fresh range exhausted; recycle an id freed by a closed channel.
        let channel_id = self
            .freed_channel_ids
            .pop()
            .context(ExhaustedChannelIdsSnafu)?;
        match self.slots.entry(channel_id) {
            Entry::Occupied(_) => unreachable!("freed channel id cannot be occupied"),
            Entry::Vacant(entry) => {
                let (t, u) = make_entry(channel_id)?;
                entry.insert(t);
                Ok(u)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u16) -> Result<(u16, u16)> {
        Ok((id, id))
    }

    fn with_channel_max(channel_max: u16) -> ChannelSlots<u16> {
        let mut slots = ChannelSlots::new();
        slots.set_channel_max(channel_max);
        slots
    }

    #[test]
    #[should_panic]
    fn set_channel_max_after_insert_panics() {
        let mut slots = with_channel_max(4);
        if slots.insert(Some(1), entry).is_err() {
            return;
        }
        slots.set_channel_max(4);
    }

    #[test]
    #[should_panic]
    fn set_channel_max_after_insert_and_remove_panics() {
        let mut slots = with_channel_max(4);
        if slots.insert(Some(1), entry).is_err() {
            return;
        }
        if slots.remove(1).is_none() {
            return;
        }
        slots.set_channel_max(4);
    }

    #[test]
    fn explicit_id_above_max_fails() {
        let mut slots = with_channel_max(4);
        match slots.insert(Some(5), entry).unwrap_err() {
            Error::UnavailableChannelId { channel_id } => assert_eq!(channel_id, 5),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn explicit_taken_id_fails() {
        let mut slots = with_channel_max(4);
        slots.insert(Some(1), entry).unwrap();
        match slots.insert(Some(1), entry).unwrap_err() {
            Error::UnavailableChannelId { channel_id } => assert_eq!(channel_id, 1),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn allocation_skips_explicitly_taken_ids() {
        let mut slots = with_channel_max(4);
        slots.insert(Some(1), entry).unwrap();
        slots.insert(Some(2), entry).unwrap();

        // lowest never-used id is 3
        slots.insert(None, entry).unwrap();
        assert!(slots.get(3).is_some());
        assert_eq!(slots.next_channel_id, 4);
    }

    #[test]
    fn allocation_reuses_freed_ids() {
        let mut slots = with_channel_max(4);
        for i in 1..=4 {
            slots.insert(Some(i), entry).unwrap();
        }
        assert!(slots.remove(2).is_some());
        assert!(slots.get(2).is_none());
        slots.insert(None, entry).unwrap();
        assert!(slots.get(2).is_some());
    }

    #[test]
    fn allocation_fails_when_id_space_is_full() {
        let mut slots = with_channel_max(4);
        for i in 1..=4 {
            slots.insert(Some(i), entry).unwrap();
        }
        match slots.insert(None, entry).unwrap_err() {
            Error::ExhaustedChannelIds => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn drain_frees_every_id() {
        let mut slots = with_channel_max(4);
        for i in 1..=4 {
            slots.insert(Some(i), entry).unwrap();
        }
        assert_eq!(slots.drain().count(), 4);
        slots.insert(None, entry).unwrap();
    }
}
