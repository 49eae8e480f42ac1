use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Connection flag written by the event thread of one client generation.
#[derive(Debug, Clone, Default)]
pub struct LinkFlag(Arc<AtomicBool>);

impl LinkFlag {
    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::Relaxed);
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Holds the live MQTT client together with the flag of its own generation.
///
/// A rebuilt client gets a fresh flag, so an event thread that outlives its
/// client can only ever write to a flag nobody reads.
#[derive(Debug)]
pub struct LinkSlot<C> {
    current: Option<(C, LinkFlag)>,
}

impl<C> Default for LinkSlot<C> {
    fn default() -> Self {
        Self { current: None }
    }
}

impl<C> LinkSlot<C> {
    /// Drops the current client and returns the flag for the next one.
    pub fn begin(&mut self) -> LinkFlag {
        self.current = None;
        LinkFlag::default()
    }

    pub fn install(&mut self, client: C, flag: LinkFlag) {
        self.current = Some((client, flag));
    }

    pub fn is_connected(&self) -> bool {
        self.current.as_ref().is_some_and(|(_, flag)| flag.is_up())
    }

    pub fn client_mut(&mut self) -> Option<&mut C> {
        self.current.as_mut().map(|(client, _)| client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_cannot_clear_successor() {
        let mut slot = LinkSlot::default();

        let first = slot.begin();
        first.set(true);
        slot.install("first", first.clone());
        assert!(slot.is_connected());

        let second = slot.begin();
        assert!(!slot.is_connected());
        second.set(true);
        slot.install("second", second);

        // Old poll thread reports its disconnect late.
        first.set(false);

        assert!(slot.is_connected());
        assert_eq!(slot.client_mut(), Some(&mut "second"));
    }

    #[test]
    fn empty_slot_is_disconnected() {
        let mut slot: LinkSlot<&str> = LinkSlot::default();
        assert!(!slot.is_connected());

        let flag = slot.begin();
        flag.set(true);

        // Never installed, e.g. the CONNACK wait timed out.
        assert!(!slot.is_connected());
        assert!(slot.client_mut().is_none());
    }

    #[test]
    fn installed_client_follows_its_flag() {
        let mut slot = LinkSlot::default();
        let flag = slot.begin();
        flag.set(true);
        slot.install(7_u8, flag.clone());

        flag.set(false);
        assert!(!slot.is_connected());
        flag.set(true);
        assert!(slot.is_connected());
    }
}
