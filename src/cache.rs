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

//! The register cache: one descriptor per register, indexed three ways, with staged/committed
//! values and per-descriptor as well as aggregated change listeners.

use fnv::FnvHashMap;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::SystemTime;

/// A value as carried by the telemetry stream or a register response: either an integer in the
/// device's native unit, or an opaque string (`ON`/`OFF`, hex-prefixed tokens such as `PID`).
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Int(i64),
    Text(String),
}

impl RegisterValue {
    /// Parses a raw telemetry value: an integer if the text parses as one, otherwise the text
    /// itself verbatim (this covers `ON`/`OFF` and hex-prefixed tokens like `PID`).
    pub fn parse(raw: &str) -> RegisterValue {
        match raw.parse::<i64>() {
            Ok(n) => RegisterValue::Int(n),
            Err(_) => RegisterValue::Text(raw.to_string()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            RegisterValue::Int(n) => Some(*n as f64),
            RegisterValue::Text(_) => None,
        }
    }
}

/// A single subscriber to one descriptor's changes: `(new, old, frame_timestamp, key)`.
pub type Listener = Box<dyn Fn(&str, &str, SystemTime, &str) + Send>;

/// A subscriber to the aggregated per-frame change set.
pub type ChangeListListener = Box<dyn Fn(&HashMap<String, ChangeEntry>, SystemTime) + Send>;

/// A token returned by registration, opaque to callers, that deregistration consumes.
///
/// Listener slots are never compacted (tombstoned with `None` instead) so a handle stays valid to
/// deregister even after other listeners on the same descriptor have come and gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerHandle {
    Descriptor { id: usize, slot: usize },
    ChangeList { slot: usize },
}

/// One entry of the change set handed to `ChangeList` listeners.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub old_formatted: String,
    pub new_formatted: String,
}

/// Static, mostly-immutable metadata about one register, set at registration time.
pub struct Descriptor {
    pub address: Option<u16>,
    pub telemetry_key: Option<String>,
    pub human_name: String,
    pub native_to_unit_factor: f64,
    pub precision: usize,
    /// Minimum absolute change in SI units required to notify listeners, for numeric registers.
    pub delta: f64,
    pub formatter: Option<fn(&RegisterValue) -> String>,
    pub short_descr: String,
    pub units: String,
}

impl Descriptor {
    fn format(&self, value: &RegisterValue) -> String {
        if let Some(f) = self.formatter {
            return f(value);
        }
        match value {
            RegisterValue::Int(n) => {
                let si = *n as f64 * self.native_to_unit_factor;
                format!("{:.*}", self.precision, si)
            }
            RegisterValue::Text(s) => s.clone(),
        }
    }
}

/// One descriptor's full mutable state: its static metadata plus staged/committed values and
/// per-descriptor listeners.
pub struct CacheObject {
    pub descriptor: Descriptor,
    pub value: Option<RegisterValue>,
    pub new_value: Option<RegisterValue>,
    /// Tombstoned with `None` on removal rather than compacted, so a previously handed-out
    /// `ListenerHandle::Descriptor { slot, .. }` never silently starts pointing at a different
    /// listener.
    pub listeners: Vec<Option<Listener>>,
}

impl CacheObject {
    fn new(descriptor: Descriptor) -> Self {
        CacheObject {
            descriptor,
            value: None,
            new_value: None,
            listeners: Vec::new(),
        }
    }

    /// Whether `new_value` differs from `value` enough to be dispatched.
    fn should_dispatch(&self) -> bool {
        let (new, old) = match (&self.new_value, &self.value) {
            (Some(new), old) => (new, old),
            (None, _) => return false,
        };
        match old {
            None => true,
            Some(old) => match (new.as_f64(), old.as_f64()) {
                (Some(new_f), Some(old_f)) => {
                    let delta =
                        (new_f * self.descriptor.native_to_unit_factor
                            - old_f * self.descriptor.native_to_unit_factor)
                            .abs();
                    delta >= self.descriptor.delta
                }
                _ => new != old,
            },
        }
    }
}

/// The register cache: owns every [`CacheObject`] in one store, indexed three ways so that
/// mutations through any index are visible through the others.
pub struct RegisterCache {
    objects: Vec<CacheObject>,
    by_address: FnvHashMap<u16, usize>,
    by_key: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    change_list_listeners: Vec<Option<ChangeListListener>>,
}

impl RegisterCache {
    pub fn new() -> Self {
        RegisterCache {
            objects: Vec::new(),
            by_address: FnvHashMap::default(),
            by_key: HashMap::new(),
            by_name: HashMap::new(),
            change_list_listeners: Vec::new(),
        }
    }

    /// Registers a descriptor, indexing it under whichever of address/key/name it defines.
    pub fn register(&mut self, descriptor: Descriptor) -> usize {
        let id = self.objects.len();
        if let Some(addr) = descriptor.address {
            self.by_address.insert(addr, id);
        }
        if let Some(key) = &descriptor.telemetry_key {
            self.by_key.insert(key.clone(), id);
        }
        self.by_name.insert(descriptor.human_name.clone(), id);
        self.objects.push(CacheObject::new(descriptor));
        id
    }

    /// Registers a generic, factor-1, no-formatter descriptor for a telemetry key not present in
    /// the static table, so unknown fields are retained rather than dropped.
    pub fn register_dynamic(&mut self, key: &str) -> usize {
        self.register(Descriptor {
            address: None,
            telemetry_key: Some(key.to_string()),
            human_name: key.to_string(),
            native_to_unit_factor: 1.0,
            precision: 0,
            delta: 0.0,
            formatter: None,
            short_descr: format!("unrecognised telemetry field {}", key),
            units: String::new(),
        })
    }

    pub fn lookup_by_address(&self, address: u16) -> Option<usize> {
        self.by_address.get(&address).copied()
    }

    pub fn lookup_by_key(&self, key: &str) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn object(&self, id: usize) -> &CacheObject {
        &self.objects[id]
    }

    /// Looks the key up (registering a dynamic descriptor if unknown) and stages `raw` as its
    /// pending value.
    pub fn stage_telemetry_value(&mut self, key: &str, raw: &str) {
        let id = self
            .lookup_by_key(key)
            .unwrap_or_else(|| self.register_dynamic(key));
        self.objects[id].new_value = Some(RegisterValue::parse(raw));
    }

    /// Stages a value decoded from a register response, by address.
    pub fn stage_value_by_address(&mut self, address: u16, value: RegisterValue) -> bool {
        match self.lookup_by_address(address) {
            Some(id) => {
                self.objects[id].new_value = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn stage_value_by_name(&mut self, name: &str, value: RegisterValue) -> bool {
        match self.lookup_by_name(name) {
            Some(id) => {
                self.objects[id].new_value = Some(value);
                true
            }
            None => false,
        }
    }

    /// Registers a `ChangeList` listener, returning a handle that [`Self::deregister`] accepts.
    pub fn register_change_list_listener(&mut self, listener: ChangeListListener) -> ListenerHandle {
        let slot = self.change_list_listeners.len();
        self.change_list_listeners.push(Some(listener));
        ListenerHandle::ChangeList { slot }
    }

    /// Registers a per-descriptor listener, returning a handle that [`Self::deregister`] accepts.
    pub fn add_listener(&mut self, id: usize, listener: Listener) -> ListenerHandle {
        let slot = self.objects[id].listeners.len();
        self.objects[id].listeners.push(Some(listener));
        ListenerHandle::Descriptor { id, slot }
    }

    /// Removes a previously registered listener. Returns `false` if the handle's slot was already
    /// empty (double deregistration), matching `delete`'s `isUnknownID`-style idempotence.
    pub fn deregister(&mut self, handle: ListenerHandle) -> bool {
        match handle {
            ListenerHandle::Descriptor { id, slot } => match self.objects[id].listeners.get_mut(slot) {
                Some(entry @ Some(_)) => {
                    *entry = None;
                    true
                }
                _ => false,
            },
            ListenerHandle::ChangeList { slot } => match self.change_list_listeners.get_mut(slot) {
                Some(entry @ Some(_)) => {
                    *entry = None;
                    true
                }
                _ => false,
            },
        }
    }

    pub fn has_listeners(&self, id: usize) -> bool {
        self.objects[id].listeners.iter().any(Option::is_some)
    }

    pub fn has_change_list_listeners(&self) -> bool {
        self.change_list_listeners.iter().any(Option::is_some)
    }

    /// Runs the re-entrant commit loop: repeatedly sweeps every descriptor until a full pass
    /// commits nothing, dispatching per-descriptor listeners as it goes, then fires the
    /// aggregated `ChangeList` listeners exactly once with everything that actually changed.
    pub fn commit_and_dispatch(&mut self, frame_timestamp: SystemTime) {
        let mut changed: HashMap<String, ChangeEntry> = HashMap::new();

        loop {
            let mut dirty = false;
            for id in 0..self.objects.len() {
                if !self.objects[id].should_dispatch() {
                    continue;
                }
                dirty = true;

                let key = self.objects[id]
                    .descriptor
                    .telemetry_key
                    .clone()
                    .unwrap_or_else(|| self.objects[id].descriptor.human_name.clone());
                let new_value = self.objects[id].new_value.clone().unwrap();
                let old_formatted = self
                    .objects[id]
                    .value
                    .as_ref()
                    .map(|v| self.objects[id].descriptor.format(v))
                    .unwrap_or_default();
                let new_formatted = self.objects[id].descriptor.format(&new_value);

                for listener in self.objects[id].listeners.iter().flatten() {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        listener(&new_formatted, &old_formatted, frame_timestamp, &key)
                    }));
                    if result.is_err() {
                        log::warn!("listener for {} panicked; continuing dispatch", key);
                    }
                }

                changed.insert(
                    key,
                    ChangeEntry {
                        old_formatted,
                        new_formatted,
                    },
                );

                self.objects[id].value = self.objects[id].new_value.take();
            }
            if !dirty {
                break;
            }
        }

        if !changed.is_empty() {
            for listener in self.change_list_listeners.iter().flatten() {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| listener(&changed, frame_timestamp)));
                if result.is_err() {
                    log::warn!("ChangeList listener panicked; continuing");
                }
            }
        }
    }

    /// Clears staged values on every telemetry-associated descriptor (one with a `telemetry_key`)
    /// without touching command-only registers. Run when a frame fails its checksum.
    pub fn discard_staged(&mut self) {
        for object in &mut self.objects {
            if object.descriptor.telemetry_key.is_some() {
                object.new_value = None;
            }
        }
    }
}

impl Default for RegisterCache {
    fn default() -> Self {
        RegisterCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn numeric_descriptor(key: &str, factor: f64, delta: f64) -> Descriptor {
        Descriptor {
            address: None,
            telemetry_key: Some(key.to_string()),
            human_name: key.to_string(),
            native_to_unit_factor: factor,
            precision: 2,
            delta,
            formatter: None,
            short_descr: String::new(),
            units: String::new(),
        }
    }

    #[test]
    fn unknown_telemetry_key_registers_dynamically() {
        let mut cache = RegisterCache::new();
        cache.stage_telemetry_value("Foo", "42");
        assert!(cache.lookup_by_key("Foo").is_some());
    }

    #[test]
    fn numeric_listener_fires_only_past_delta() {
        let mut cache = RegisterCache::new();
        let id = cache.register(numeric_descriptor("I", 0.001, 0.05));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        cache.add_listener(
            id,
            Box::new(move |_new, _old, _ts, _key| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        cache.stage_value_by_address(0, RegisterValue::Int(0)).ok(); // no-op, no address set
        cache.objects[id].new_value = Some(RegisterValue::Int(1000)); // 1.0 SI unit, no prior value
        cache.commit_and_dispatch(SystemTime::now());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Change below delta threshold (0.001 SI units change < 0.05 delta) must not fire.
        cache.objects[id].new_value = Some(RegisterValue::Int(1001));
        cache.commit_and_dispatch(SystemTime::now());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Change above threshold must fire.
        cache.objects[id].new_value = Some(RegisterValue::Int(1100));
        cache.commit_and_dispatch(SystemTime::now());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn text_listener_fires_on_any_inequality() {
        let mut cache = RegisterCache::new();
        let id = cache.register(Descriptor {
            address: None,
            telemetry_key: Some("Relay".to_string()),
            human_name: "Relay".to_string(),
            native_to_unit_factor: 1.0,
            precision: 0,
            delta: 0.0,
            formatter: None,
            short_descr: String::new(),
            units: String::new(),
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        cache.add_listener(
            id,
            Box::new(move |_n, _o, _t, _k| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.objects[id].new_value = Some(RegisterValue::Text("ON".to_string()));
        cache.commit_and_dispatch(SystemTime::now());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn s3_frame_commit_fires_change_list_once_with_four_entries() {
        let mut cache = RegisterCache::new();
        for key in ["V", "I", "SOC"] {
            cache.register(numeric_descriptor(key, 1.0, 0.0));
        }
        cache.register(Descriptor {
            address: None,
            telemetry_key: Some("Relay".to_string()),
            human_name: "Relay".to_string(),
            native_to_unit_factor: 1.0,
            precision: 0,
            delta: 0.0,
            formatter: None,
            short_descr: String::new(),
            units: String::new(),
        });

        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        cache.register_change_list_listener(Box::new(move |changes, _ts| {
            *seen2.lock().unwrap() = Some(changes.len());
        }));

        cache.stage_telemetry_value("V", "24340");
        cache.stage_telemetry_value("I", "-500");
        cache.stage_telemetry_value("SOC", "876");
        cache.stage_telemetry_value("Relay", "ON");
        cache.commit_and_dispatch(SystemTime::now());

        assert_eq!(*seen.lock().unwrap(), Some(4));
        assert_eq!(
            cache.object(cache.lookup_by_key("V").unwrap()).value,
            Some(RegisterValue::Int(24340))
        );
        assert_eq!(
            cache.object(cache.lookup_by_key("I").unwrap()).value,
            Some(RegisterValue::Int(-500))
        );
    }

    #[test]
    fn discard_staged_only_touches_telemetry_descriptors() {
        let mut cache = RegisterCache::new();
        let telemetry_id = cache.register(numeric_descriptor("V", 1.0, 0.0));
        let command_only_id = cache.register(Descriptor {
            address: Some(0xED8D),
            telemetry_key: None,
            human_name: "chargedVoltage".to_string(),
            native_to_unit_factor: 0.01,
            precision: 2,
            delta: 0.0,
            formatter: None,
            short_descr: String::new(),
            units: "V".to_string(),
        });
        cache.objects[telemetry_id].new_value = Some(RegisterValue::Int(1));
        cache.objects[command_only_id].new_value = Some(RegisterValue::Int(2));

        cache.discard_staged();

        assert!(cache.objects[telemetry_id].new_value.is_none());
        assert!(cache.objects[command_only_id].new_value.is_some());
    }

    #[test]
    fn listener_panic_does_not_abort_dispatch() {
        let mut cache = RegisterCache::new();
        let id = cache.register(numeric_descriptor("V", 1.0, 0.0));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        cache.add_listener(id, Box::new(|_n, _o, _t, _k| panic!("boom")));
        cache.add_listener(
            id,
            Box::new(move |_n, _o, _t, _k| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.objects[id].new_value = Some(RegisterValue::Int(5));
        // Suppress the default panic hook's stderr spam for this expected panic.
        let prev_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        cache.commit_and_dispatch(SystemTime::now());
        panic::set_hook(prev_hook);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregistered_listener_no_longer_fires() {
        let mut cache = RegisterCache::new();
        let id = cache.register(numeric_descriptor("V", 1.0, 0.0));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handle = cache.add_listener(
            id,
            Box::new(move |_n, _o, _t, _k| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(cache.deregister(handle));
        assert!(!cache.has_listeners(id));
        // Double deregistration is reported, not a panic.
        assert!(!cache.deregister(handle));

        cache.objects[id].new_value = Some(RegisterValue::Int(5));
        cache.commit_and_dispatch(SystemTime::now());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn change_list_listener_can_be_deregistered() {
        let mut cache = RegisterCache::new();
        cache.register(numeric_descriptor("V", 1.0, 0.0));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handle = cache.register_change_list_listener(Box::new(move |_c, _t| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(cache.deregister(handle));
        assert!(!cache.has_change_list_listeners());

        cache.stage_telemetry_value("V", "7");
        cache.commit_and_dispatch(SystemTime::now());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
