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

//! The static seed table of register descriptors: the required telemetry tokens plus the handful
//! of addressed registers the facade's named battery-config wrappers need. This is data, not
//! behaviour — extending device coverage means adding rows here, not touching the cache or engine.

use crate::cache::{Descriptor, RegisterCache};

/// Addresses and scaling factors of the named battery-configuration registers, shared between the
/// seed table below and the facade's thin named accessors so the two never drift apart.
pub mod named {
    pub const STATE_OF_CHARGE_ADDR: u16 = 0x0FFF;
    pub const STATE_OF_CHARGE_FACTOR: f64 = 0.1;
    pub const STATE_OF_CHARGE_WIDTH: usize = 2;

    pub const CHARGED_VOLTAGE_ADDR: u16 = 0xED8D;
    pub const CHARGED_VOLTAGE_FACTOR: f64 = 0.01;
    pub const CHARGED_VOLTAGE_WIDTH: usize = 2;

    pub const BATTERY_CAPACITY_ADDR: u16 = 0x1000;
    pub const BATTERY_CAPACITY_FACTOR: f64 = 1.0;
    pub const BATTERY_CAPACITY_WIDTH: usize = 2;

    pub const TAIL_CURRENT_ADDR: u16 = 0x1001;
    pub const TAIL_CURRENT_FACTOR: f64 = 0.1;
    pub const TAIL_CURRENT_WIDTH: usize = 2;

    pub const RELAY_MODE_ADDR: u16 = 0x1002;
    pub const RELAY_MODE_FACTOR: f64 = 1.0;
    pub const RELAY_MODE_WIDTH: usize = 1;

    pub const RELAY_LOW_SOC_ADDR: u16 = 0x1003;
    pub const RELAY_LOW_SOC_FACTOR: f64 = 0.1;
    pub const RELAY_LOW_SOC_WIDTH: usize = 2;

    pub const RELAY_LOW_SOC_CLEAR_ADDR: u16 = 0x1004;
    pub const RELAY_LOW_SOC_CLEAR_FACTOR: f64 = 0.1;
    pub const RELAY_LOW_SOC_CLEAR_WIDTH: usize = 2;
}

fn telemetry(key: &str, human_name: &str, factor: f64, precision: usize, delta: f64, units: &str) -> Descriptor {
    Descriptor {
        address: None,
        telemetry_key: Some(key.to_string()),
        human_name: human_name.to_string(),
        native_to_unit_factor: factor,
        precision,
        delta,
        formatter: None,
        short_descr: human_name.to_string(),
        units: units.to_string(),
    }
}

fn text_telemetry(key: &str, human_name: &str) -> Descriptor {
    telemetry(key, human_name, 1.0, 0, 0.0, "")
}

fn addressed(address: u16, human_name: &str, factor: f64, precision: usize, units: &str) -> Descriptor {
    Descriptor {
        address: Some(address),
        telemetry_key: None,
        human_name: human_name.to_string(),
        native_to_unit_factor: factor,
        precision,
        delta: 0.0,
        formatter: None,
        short_descr: human_name.to_string(),
        units: units.to_string(),
    }
}

/// Registers the required telemetry subset and the named battery-configuration registers into a
/// fresh cache. Called once, at engine construction.
pub fn seed(cache: &mut RegisterCache) {
    // Required telemetry tokens (§6 of the external interface).
    cache.register(text_telemetry("PID", "productIdHex"));
    cache.register(telemetry("V", "mainVoltage", 0.001, 3, 0.001, "V"));
    cache.register(telemetry("VM", "auxVoltage", 0.001, 3, 0.001, "V"));
    cache.register(telemetry("DM", "midpointDeviation", 0.1, 1, 0.1, "%"));
    cache.register(telemetry("I", "current", 0.001, 3, 0.001, "A"));
    cache.register(telemetry("P", "instantaneousPower", 1.0, 0, 1.0, "W"));
    cache.register(telemetry("CE", "consumedEnergy", 0.001, 3, 0.001, "Ah"));
    cache.register(telemetry("SOC", "stateOfCharge", 0.1, 1, 0.1, "%"));
    cache.register(telemetry("TTG", "timeToGo", 1.0, 0, 1.0, "min"));
    cache.register(text_telemetry("Alarm", "alarmActive"));
    cache.register(text_telemetry("Relay", "relayState"));
    cache.register(text_telemetry("AR", "alarmReason"));
    cache.register(text_telemetry("BMV", "modelName"));
    cache.register(text_telemetry("FW", "firmwareVersion"));
    for i in 1..=18 {
        let key = format!("H{}", i);
        let human_name = format!("history{}", i);
        cache.register(telemetry(&key, &human_name, 0.001, 3, 0.001, "Ah"));
    }

    // Named battery-configuration registers exposed by the facade's thin wrapper accessors.
    // Addresses are device-internal; 0x0FFF mirrors the SOC register used in the worked response
    // correlation scenario, the rest are representative placeholders for the accessor surface.
    cache.register(addressed(named::STATE_OF_CHARGE_ADDR, "stateOfChargeRegister", named::STATE_OF_CHARGE_FACTOR, 1, "%"));
    cache.register(addressed(named::CHARGED_VOLTAGE_ADDR, "chargedVoltage", named::CHARGED_VOLTAGE_FACTOR, 2, "V"));
    cache.register(addressed(named::BATTERY_CAPACITY_ADDR, "batteryCapacity", named::BATTERY_CAPACITY_FACTOR, 0, "Ah"));
    cache.register(addressed(named::TAIL_CURRENT_ADDR, "tailCurrent", named::TAIL_CURRENT_FACTOR, 1, "A"));
    cache.register(addressed(named::RELAY_MODE_ADDR, "relayMode", named::RELAY_MODE_FACTOR, 0, ""));
    cache.register(addressed(named::RELAY_LOW_SOC_ADDR, "relayLowSoc", named::RELAY_LOW_SOC_FACTOR, 1, "%"));
    cache.register(addressed(named::RELAY_LOW_SOC_CLEAR_ADDR, "relayLowSocClear", named::RELAY_LOW_SOC_CLEAR_FACTOR, 1, "%"));
}

/// Converts an SI-unit value to the register's raw native-unit bytes (big-endian, internal
/// representation — [`crate::message::Command::set`] swaps to wire order itself).
pub fn si_to_raw_bytes(si_value: f64, factor: f64, width: usize) -> Vec<u8> {
    let raw = (si_value / factor).round() as i64;
    let bytes = raw.to_be_bytes();
    bytes[bytes.len() - width..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_cache_resolves_required_telemetry_tokens() {
        let mut cache = RegisterCache::new();
        seed(&mut cache);
        for key in [
            "PID", "V", "VM", "DM", "I", "P", "CE", "SOC", "TTG", "Alarm", "Relay", "AR", "BMV",
            "FW",
        ] {
            assert!(cache.lookup_by_key(key).is_some(), "missing telemetry key {}", key);
        }
        for i in 1..=18 {
            let key = format!("H{}", i);
            assert!(cache.lookup_by_key(&key).is_some(), "missing telemetry key {}", key);
        }
    }

    #[test]
    fn soc_register_reachable_by_address_and_matches_response_correlation_scenario() {
        let mut cache = RegisterCache::new();
        seed(&mut cache);
        assert!(cache.lookup_by_address(0x0FFF).is_some());
    }

    #[test]
    fn config_registers_are_address_only_not_telemetry() {
        let mut cache = RegisterCache::new();
        seed(&mut cache);
        let id = cache.lookup_by_address(0xED8D).unwrap();
        assert!(cache.object(id).descriptor.telemetry_key.is_none());
    }

    #[test]
    fn si_to_raw_bytes_scales_and_truncates_to_width() {
        // 87.6% state of charge at factor 0.1 -> raw native value 876, 2 bytes big-endian.
        assert_eq!(si_to_raw_bytes(87.6, named::STATE_OF_CHARGE_FACTOR, named::STATE_OF_CHARGE_WIDTH), vec![0x03, 0x6C]);
        assert_eq!(si_to_raw_bytes(1.0, named::RELAY_MODE_FACTOR, named::RELAY_MODE_WIDTH), vec![0x01]);
    }
}
