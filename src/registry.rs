//! Exclusive ownership of logical devices.
//!
//! Every provisioned pin is one entry in a [`DeviceRegistry`], keyed by the
//! structured [`DeviceKey`]. Uniqueness check and registration happen under a
//! single lock, so two concurrent provisioning calls for the same key can
//! never both succeed.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::common::{DeviceMode, EdgeCallback, InterruptEvent};
use crate::error::Error;

/// Identity of one logical device: device class, bus controller, bus address
/// and pin number.
///
/// Renders as `class-controller-address-pin` in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    class: &'static str,
    controller: u8,
    address: u8,
    pin: u8,
}

impl DeviceKey {
    pub fn new(class: &'static str, controller: u8, address: u8, pin: u8) -> Self {
        Self {
            class,
            controller,
            address,
            pin,
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.class, self.controller, self.address, self.pin
        )
    }
}

/// Static description of one physical pin, supplied by board or device
/// metadata.
#[derive(Debug, Clone)]
pub struct PinInfo {
    number: u8,
    modes: &'static [DeviceMode],
}

impl PinInfo {
    pub fn new(number: u8, modes: &'static [DeviceMode]) -> Self {
        Self { number, modes }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn supports(&self, mode: DeviceMode) -> bool {
        self.modes.contains(&mode)
    }
}

/// State of one entry's listener slot.
///
/// `Delivering` marks a callback that has been taken out of the slot for the
/// duration of one delivery. It lets [`PinEntry::notify`] tell a slot the
/// callback left untouched apart from one it cleared or replaced.
enum ListenerSlot {
    Empty,
    Armed(EdgeCallback),
    Delivering,
}

/// A live registry entry: one provisioned device and its listener slot.
pub struct PinEntry {
    key: DeviceKey,
    mode: DeviceMode,
    listener: Mutex<ListenerSlot>,
}

impl PinEntry {
    fn new(key: DeviceKey, mode: DeviceMode) -> Self {
        Self {
            key,
            mode,
            listener: Mutex::new(ListenerSlot::Empty),
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Install a listener, replacing any previous one.
    pub fn set_listener(&self, callback: EdgeCallback) {
        *self.listener.lock().unwrap() = ListenerSlot::Armed(callback);
    }

    pub fn clear_listener(&self) {
        *self.listener.lock().unwrap() = ListenerSlot::Empty;
    }

    /// Deliver an event to the listener slot, if occupied.
    ///
    /// The callback runs with the slot unlocked, so it may install or clear
    /// the listener of its own pin. It is re-armed afterwards unless the slot
    /// changed while it ran.
    pub(crate) fn notify(&self, event: InterruptEvent) {
        let mut slot = self.listener.lock().unwrap();
        let mut callback = match mem::replace(&mut *slot, ListenerSlot::Delivering) {
            ListenerSlot::Armed(callback) => callback,
            previous => {
                *slot = previous;
                return;
            }
        };
        drop(slot);

        callback(event);

        let mut slot = self.listener.lock().unwrap();
        if matches!(*slot, ListenerSlot::Delivering) {
            *slot = ListenerSlot::Armed(callback);
        }
    }
}

impl fmt::Debug for PinEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinEntry")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Keyed store of currently-open logical devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceKey, Arc<PinEntry>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically validate `mode` against `info` and reserve `key`.
    ///
    /// The caller performs hardware initialization for the new entry while
    /// still holding its own engine lock, releasing the key again if that
    /// fails.
    pub fn provision(
        &self,
        key: DeviceKey,
        info: PinInfo,
        mode: DeviceMode,
    ) -> Result<Arc<PinEntry>, Error> {
        if !info.supports(mode) {
            return Err(Error::InvalidMode {
                pin: info.number(),
                mode,
            });
        }
        let mut devices = self.devices.lock().unwrap();
        match devices.entry(key) {
            Entry::Occupied(occupied) => Err(Error::AlreadyProvisioned(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(PinEntry::new(vacant.key().clone(), mode));
                vacant.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    /// Remove `key`. Unknown keys are a no-op.
    pub fn release(&self, key: &DeviceKey) -> Option<Arc<PinEntry>> {
        self.devices.lock().unwrap().remove(key)
    }

    /// Resolve a live entry without provisioning. Used by the interrupt path.
    pub fn lookup(&self, key: &DeviceKey) -> Option<Arc<PinEntry>> {
        self.devices.lock().unwrap().get(key).cloned()
    }

    /// Remove and return every entry, ordered by pin number, for
    /// whole-device teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<PinEntry>> {
        let mut entries: Vec<_> = self
            .devices
            .lock()
            .unwrap()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        entries.sort_by_key(|entry| entry.key().pin());
        entries
    }

    pub fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIGITAL: &[DeviceMode] = &[DeviceMode::DigitalInput, DeviceMode::DigitalOutput];

    fn key(pin: u8) -> DeviceKey {
        DeviceKey::new("mcp23017", 1, 32, pin)
    }

    #[test]
    fn provision_then_lookup_returns_the_same_entry() {
        let registry = DeviceRegistry::new();
        let entry = registry
            .provision(key(4), PinInfo::new(4, DIGITAL), DeviceMode::DigitalInput)
            .unwrap();

        let found = registry.lookup(&key(4)).unwrap();
        assert!(Arc::ptr_eq(&entry, &found));
        assert_eq!(found.mode(), DeviceMode::DigitalInput);
        assert!(registry.lookup(&key(5)).is_none());
    }

    #[test]
    fn second_provision_of_a_key_fails() {
        let registry = DeviceRegistry::new();
        registry
            .provision(key(0), PinInfo::new(0, DIGITAL), DeviceMode::DigitalOutput)
            .unwrap();

        let err = registry
            .provision(key(0), PinInfo::new(0, DIGITAL), DeviceMode::DigitalInput)
            .unwrap_err();
        assert_eq!(err, Error::AlreadyProvisioned(key(0)));
        assert_eq!(err.to_string(), "mcp23017-1-32-0 is already provisioned");
    }

    #[test]
    fn unsupported_mode_is_rejected_before_registration() {
        let registry = DeviceRegistry::new();
        let err = registry
            .provision(key(2), PinInfo::new(2, DIGITAL), DeviceMode::PwmOutput)
            .unwrap_err();

        assert_eq!(
            err,
            Error::InvalidMode {
                pin: 2,
                mode: DeviceMode::PwmOutput
            }
        );
        // The failed request must not have reserved the key.
        assert!(registry.is_empty());
    }

    #[test]
    fn release_is_idempotent() {
        let registry = DeviceRegistry::new();
        registry
            .provision(key(7), PinInfo::new(7, DIGITAL), DeviceMode::DigitalInput)
            .unwrap();

        assert!(registry.release(&key(7)).is_some());
        assert!(registry.release(&key(7)).is_none());
        assert!(registry.release(&key(9)).is_none());
    }

    #[test]
    fn concurrent_provisioning_has_a_single_winner() {
        let registry = Arc::new(DeviceRegistry::new());
        let successes = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let result = registry.provision(
                        key(3),
                        PinInfo::new(3, DIGITAL),
                        DeviceMode::DigitalInput,
                    );
                    if result.is_ok() {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn listener_slot_replaces_and_clears() {
        let registry = DeviceRegistry::new();
        let entry = registry
            .provision(key(1), PinInfo::new(1, DIGITAL), DeviceMode::DigitalInput)
            .unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        // An empty slot swallows the event.
        entry.notify(InterruptEvent::new(1, true));

        let counter = Arc::clone(&first);
        entry.set_listener(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        entry.notify(InterruptEvent::new(1, true));

        let counter = Arc::clone(&second);
        entry.set_listener(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        entry.notify(InterruptEvent::new(1, false));

        entry.clear_listener();
        entry.notify(InterruptEvent::new(1, true));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_clear_its_own_slot_during_delivery() {
        let registry = DeviceRegistry::new();
        let entry = registry
            .provision(key(6), PinInfo::new(6, DIGITAL), DeviceMode::DigitalInput)
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let own_entry = Arc::clone(&entry);
        entry.set_listener(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            own_entry.clear_listener();
        }));

        // The one-shot listener runs exactly once and is not re-armed.
        entry.notify(InterruptEvent::new(6, true));
        entry.notify(InterruptEvent::new(6, true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_replace_itself_during_delivery() {
        let registry = DeviceRegistry::new();
        let entry = registry
            .provision(key(8), PinInfo::new(8, DIGITAL), DeviceMode::DigitalInput)
            .unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        let successor = Arc::clone(&second);
        let own_entry = Arc::clone(&entry);
        entry.set_listener(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let successor = Arc::clone(&successor);
            own_entry.set_listener(Box::new(move |_| {
                successor.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        // The replacement installed mid-delivery takes over from the next
        // event on; the original is not restored over it.
        entry.notify(InterruptEvent::new(8, true));
        entry.notify(InterruptEvent::new(8, true));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_empties_the_registry_in_pin_order() {
        let registry = DeviceRegistry::new();
        for pin in [9u8, 2, 14] {
            registry
                .provision(
                    key(pin),
                    PinInfo::new(pin, DIGITAL),
                    DeviceMode::DigitalInput,
                )
                .unwrap();
        }

        let drained: Vec<u8> = registry
            .drain()
            .iter()
            .map(|entry| entry.key().pin())
            .collect();
        assert_eq!(drained, vec![2, 9, 14]);
        assert!(registry.is_empty());
    }
}
