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

//! The protocol engine: the single-threaded orchestrator that feeds lines to the checksum and
//! message parsers, routes telemetry into the cache, correlates responses against the inflight
//! command, and drives timeouts/retries. Runs entirely on one `async_std` task, the way
//! `kernel/hosted-tcp`'s per-socket task owns all mutable state for that socket.

use crate::cache::{ChangeListListener, Listener, ListenerHandle, RegisterCache, RegisterValue};
use crate::checksum::TelemetryChecksum;
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::message::{state, Command, CommandKind, Response};
use crate::queue::{self, CommandQueue};
use crate::transport::{self, Line, OutboundFrame};
use crate::registers;

use fnv::FnvHashMap;
use futures::channel::{mpsc, oneshot};
use futures::future::FutureExt;
use futures::select;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use futures_timer::Delay;
use std::time::{Duration, SystemTime};

/// Every fifth timeout on the same inflight command triggers a restart, but only when the relay
/// is known `OFF` (a restart's side effect is to force the relay `OFF`, so restarting while it is
/// already `ON` would be destructive).
const RESTART_EVERY_N_RETRIES: u32 = 5;
const BACKPRESSURE_DEFER: Duration = Duration::from_millis(1000);

/// One inflight command awaiting a response.
struct PendingRequest {
    command: Command,
    remaining_retries: u32,
    sent_time: SystemTime,
    /// Number of timeouts observed for this command instance, used to decide the every-fifth
    /// restart heuristic independently of `remaining_retries` (which counts down, not up).
    timeouts_seen: u32,
}

/// Requests the facade sends into the engine task. Every variant that produces a result carries
/// its own oneshot reply channel, mirroring the request/response shape of `kernel/hosted-tcp`.
pub enum FacadeRequest {
    Ping {
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    AppVersion {
        reply: oneshot::Sender<Result<String, DriverError>>,
    },
    ProductId {
        reply: oneshot::Sender<Result<String, DriverError>>,
    },
    Restart,
    Get {
        address: u16,
        /// `None` defers to `config.default_priority`.
        priority: Option<u8>,
        /// `None` defers to `config.default_max_retries`; `force` callers pass `Some(u32::MAX)`.
        max_retries: Option<u32>,
        reply: oneshot::Sender<Result<RegisterValue, DriverError>>,
    },
    Set {
        address: u16,
        value: Vec<u8>,
        priority: Option<u8>,
        max_retries: Option<u32>,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    RegisterListener {
        name: String,
        listener: Listener,
        reply: oneshot::Sender<Option<ListenerHandle>>,
    },
    RegisterChangeListListener {
        listener: ChangeListListener,
        reply: oneshot::Sender<ListenerHandle>,
    },
    DeregisterListener {
        handle: ListenerHandle,
        reply: oneshot::Sender<bool>,
    },
    HasListeners {
        /// The pseudo-property `"ChangeList"` is special-cased to the aggregated listener set;
        /// anything else is looked up by human name, falling back to telemetry key.
        name: String,
        reply: oneshot::Sender<bool>,
    },
    /// Reads the currently committed value of a named or keyed descriptor without enqueueing
    /// anything, for the facade's synchronous-feeling convenience getters.
    CachedValue {
        name: String,
        reply: oneshot::Sender<Option<RegisterValue>>,
    },
    /// Ends the engine's main loop. The process singleton slot stays occupied (frozen) — this
    /// mirrors §5's "instance is frozen after first construction": there is no un-start.
    Shutdown,
}

/// The pseudo-property name the facade and engine agree designates the aggregated change-set
/// listener rather than a single descriptor.
pub const CHANGE_LIST_PROPERTY: &str = "ChangeList";

/// The facade's handle onto a running engine task: just the channel to send it requests.
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::UnboundedSender<FacadeRequest>,
}

impl EngineHandle {
    pub async fn send(&self, request: FacadeRequest) {
        // The engine task only ever stops when the process does; an error here means the process
        // is already tearing down, so dropping the request silently is correct.
        let _ = self.requests.clone().send(request).await;
    }
}

/// Opens the serial transport, seeds the register cache, and spawns the engine's main loop.
pub fn spawn(config: DriverConfig) -> Result<EngineHandle, DriverError> {
    let transport_handle = transport::spawn(&config.serial_device, config.recording_path())?;
    let (requests_tx, requests_rx) = mpsc::unbounded();

    let mut cache = RegisterCache::new();
    registers::seed(&mut cache);

    async_std::task::spawn(run(config, cache, transport_handle.lines, transport_handle.outbound, requests_rx));

    Ok(EngineHandle {
        requests: requests_tx,
    })
}

struct State {
    config: DriverConfig,
    cache: RegisterCache,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    checksum: TelemetryChecksum,
    frame_arrival_timestamp: Option<SystemTime>,
    pending: FnvHashMap<String, PendingRequest>,
    queue: CommandQueue,
    operational: bool,
}

async fn run(
    config: DriverConfig,
    cache: RegisterCache,
    mut lines: mpsc::UnboundedReceiver<Line>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    mut requests: mpsc::UnboundedReceiver<FacadeRequest>,
) {
    let mut state = State {
        config,
        cache,
        outbound,
        checksum: TelemetryChecksum::new(),
        frame_arrival_timestamp: None,
        pending: FnvHashMap::default(),
        queue: CommandQueue::new(),
        operational: false,
    };

    let mut timeout = Delay::new(Duration::from_secs(u64::MAX / 2)).fuse();
    let mut backpressure = Delay::new(Duration::from_secs(u64::MAX / 2)).fuse();

    loop {
        select! {
            line = lines.next() => match line {
                Some(line) => on_line(&mut state, line, &mut timeout),
                None => return,
            },
            request = requests.next() => match request {
                Some(FacadeRequest::Shutdown) | None => return,
                Some(request) => on_request(&mut state, request, &mut timeout),
            },
            () = timeout => on_timeout(&mut state, &mut timeout),
            () = backpressure => drive_head(&mut state, &mut timeout),
        }

        if !state.operational && state.queue.head().is_some() {
            backpressure = Delay::new(BACKPRESSURE_DEFER).fuse();
        }
    }
}

fn on_line(state: &mut State, line: Line, timeout: &mut futures::future::Fuse<Delay>) {
    let text = String::from_utf8_lossy(&line.content).to_string();
    state.operational = true;

    let (key, value) = match text.split_once('\t') {
        Some(pair) => pair,
        None => {
            log::warn!("malformed telemetry line, no tab separator: {:?}", text);
            return;
        }
    };

    if key != "Checksum" {
        if state.checksum.is_empty() {
            state.frame_arrival_timestamp = Some(SystemTime::now());
        }
        state.checksum.feed(b"\r\n");
        state.checksum.feed(line.content.as_slice());
        state.cache.stage_telemetry_value(key, value);
        return;
    }

    // `Checksum` line: the first byte of `value` is the frame's checksum byte; anything after it
    // is zero or more concatenated command responses riding along on the same logical line.
    let mut value_bytes = value.bytes();
    let checksum_byte = value_bytes.next();
    if let Some(b) = checksum_byte {
        state.checksum.feed(b"Checksum\t");
        state.checksum.feed(&[b]);
    }

    let timestamp = state.frame_arrival_timestamp.unwrap_or_else(SystemTime::now);
    if state.checksum.is_valid() {
        state.cache.commit_and_dispatch(timestamp);
    } else {
        log::warn!("telemetry frame checksum mismatch, discarding staged values");
        state.cache.discard_staged();
    }
    state.checksum.reset();
    state.frame_arrival_timestamp = None;

    let remainder: String = value_bytes.map(|b| b as char).collect();
    for fragment in remainder.split(':').filter(|f| !f.is_empty()) {
        let fragment = fragment.trim_end_matches('\n');
        match Response::parse(fragment) {
            Ok(response) => route_response(state, response, timeout),
            Err(e) => log::warn!("failed to parse embedded response {:?}: {}", fragment, e),
        }
    }
}

fn route_response(state: &mut State, response: Response, timeout: &mut futures::future::Fuse<Delay>) {
    let id = response.identifier();

    if id == "40000" || id.starts_with("40000") {
        log::debug!("restart acknowledged");
        return;
    }
    if id.starts_with('3') {
        log::warn!("device reported unknown command for identifier {}", id);
        return;
    }
    if id.starts_with("AAAA") || id == "2AAAA" {
        log::warn!("framing error reported by device for identifier {}", id);
        return;
    }

    let pending = match state.pending.remove(&id) {
        Some(p) => p,
        None => {
            log::warn!("unwarranted response for identifier {}", id);
            return;
        }
    };

    // A response whose command digit disagrees with what was actually sent for this identifier,
    // or whose status byte is outside the known vocabulary (§3's `isOK`/`isUnknownID`/
    // `isNotSupported`/`isParameterError`), is the device "refusing" in a way we don't recognise.
    // Leave it inflight for the timeout path to retry rather than guessing at its meaning.
    let status = response.message.state.unwrap_or(state::OK);
    if pending.command.message.command != response.message.command || !queue::is_terminal_state(status) {
        log::warn!("device refused command {}: response prefix mismatch", id);
        state.pending.insert(id, pending);
        if relay_is_off(state) {
            send_restart(state);
        }
        return;
    }

    if status == state::OK {
        resolve(state, &pending.command, &response);
    } else {
        log::warn!("device reported failure status {:#04x} for command {}", status, id);
    }
    state.queue.delete(&id);
    *timeout = Delay::new(Duration::from_secs(u64::MAX / 2)).fuse();
    drive_head(state, timeout);
}

fn resolve(state: &mut State, command: &Command, response: &Response) {
    match command.message.command {
        CommandKind::Ping => {}
        CommandKind::Version => {
            if let Some(bytes) = &response.message.value {
                state
                    .cache
                    .stage_value_by_name("firmwareVersion", RegisterValue::Text(crate::message::bytes_to_hex(bytes)));
                state.cache.commit_and_dispatch(SystemTime::now());
            }
        }
        CommandKind::ProductId => {
            if let Some(bytes) = &response.message.value {
                state
                    .cache
                    .stage_value_by_name("productIdHex", RegisterValue::Text(crate::message::bytes_to_hex(bytes)));
                state.cache.commit_and_dispatch(SystemTime::now());
            }
        }
        CommandKind::Restart => {}
        CommandKind::Get | CommandKind::Set | CommandKind::AsyncSet => {
            if let (Some(address), Some(bytes)) = (response.message.address, &response.message.value) {
                let value = bytes_to_register_value(bytes);
                if state.cache.stage_value_by_address(address, value) {
                    state.cache.commit_and_dispatch(SystemTime::now());
                } else {
                    log::warn!("response for unknown address {:#06x}", address);
                }
            } else if command.message.command == CommandKind::Set {
                // A `set` ack with no echoed value still confirms the write; re-stage what we
                // sent so listeners observe the confirmed value.
                if let (Some(address), Some(bytes)) = (command.message.address, &command.message.value) {
                    let value = bytes_to_register_value(bytes);
                    if state.cache.stage_value_by_address(address, value) {
                        state.cache.commit_and_dispatch(SystemTime::now());
                    }
                }
            }
        }
    }
}

fn bytes_to_register_value(bytes: &[u8]) -> RegisterValue {
    let mut padded = [0u8; 8];
    let offset = padded.len() - bytes.len().min(8);
    padded[offset..].copy_from_slice(&bytes[bytes.len().saturating_sub(8)..]);
    RegisterValue::Int(i64::from_be_bytes(padded))
}

fn relay_is_off(state: &State) -> bool {
    match state.cache.lookup_by_key("Relay") {
        Some(id) => matches!(&state.cache.object(id).value, Some(RegisterValue::Text(s)) if s == "OFF"),
        None => false,
    }
}

fn send_restart(state: &mut State) {
    if let Ok(command) = Command::bare(CommandKind::Restart, 1, 0) {
        let frame = OutboundFrame {
            bytes: command.wire.into_bytes(),
        };
        let mut outbound = state.outbound.clone();
        async_std::task::spawn(async move {
            let _ = outbound.send(frame).await;
        });
    }
}

fn on_request(state: &mut State, request: FacadeRequest, timeout: &mut futures::future::Fuse<Delay>) {
    match request {
        FacadeRequest::Ping { reply } => {
            enqueue_bare(state, CommandKind::Ping, 1, state.config.default_max_retries, timeout);
            let _ = reply.send(Ok(()));
        }
        FacadeRequest::AppVersion { reply } => {
            enqueue_bare(state, CommandKind::Version, 1, state.config.default_max_retries, timeout);
            let _ = reply.send(Ok(cached_text(state, "firmwareVersion")));
        }
        FacadeRequest::ProductId { reply } => {
            enqueue_bare(state, CommandKind::ProductId, 1, state.config.default_max_retries, timeout);
            let _ = reply.send(Ok(cached_text(state, "productIdHex")));
        }
        FacadeRequest::Restart => send_restart(state),
        FacadeRequest::Get {
            address,
            priority,
            max_retries,
            reply,
        } => {
            let priority = priority.unwrap_or(state.config.default_priority);
            let max_retries = max_retries.unwrap_or(state.config.default_max_retries);
            if let Ok(command) = Command::get(address, priority, max_retries) {
                state.queue.insert(command, state.config.compression_enabled);
                drive_head(state, timeout);
            }
            // The caller gets the last committed value immediately; the round-trip result lands
            // via listener notification once the response is routed.
            let value = state
                .cache
                .lookup_by_address(address)
                .and_then(|id| state.cache.object(id).value.clone())
                .unwrap_or(RegisterValue::Int(0));
            let _ = reply.send(Ok(value));
        }
        FacadeRequest::Set {
            address,
            value,
            priority,
            max_retries,
            reply,
        } => {
            let priority = priority.unwrap_or(state.config.default_priority);
            let max_retries = max_retries.unwrap_or(state.config.default_max_retries);
            match Command::set(address, value, priority, max_retries) {
                Ok(command) => {
                    state.queue.insert(command, state.config.compression_enabled);
                    drive_head(state, timeout);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    log::error!("failed to construct set command: {}", e);
                    let _ = reply.send(Ok(()));
                }
            }
        }
        FacadeRequest::RegisterListener { name, listener, reply } => {
            let handle = state
                .cache
                .lookup_by_name(&name)
                .or_else(|| state.cache.lookup_by_key(&name))
                .map(|id| state.cache.add_listener(id, listener));
            let _ = reply.send(handle);
        }
        FacadeRequest::RegisterChangeListListener { listener, reply } => {
            let handle = state.cache.register_change_list_listener(listener);
            let _ = reply.send(handle);
        }
        FacadeRequest::DeregisterListener { handle, reply } => {
            let _ = reply.send(state.cache.deregister(handle));
        }
        FacadeRequest::HasListeners { name, reply } => {
            let has = if name == CHANGE_LIST_PROPERTY {
                state.cache.has_change_list_listeners()
            } else {
                state
                    .cache
                    .lookup_by_name(&name)
                    .or_else(|| state.cache.lookup_by_key(&name))
                    .map(|id| state.cache.has_listeners(id))
                    .unwrap_or(false)
            };
            let _ = reply.send(has);
        }
        FacadeRequest::CachedValue { name, reply } => {
            let value = state
                .cache
                .lookup_by_name(&name)
                .or_else(|| state.cache.lookup_by_key(&name))
                .and_then(|id| state.cache.object(id).value.clone());
            let _ = reply.send(value);
        }
        FacadeRequest::Shutdown => unreachable!("handled in the run loop before reaching on_request"),
    }
}

/// Formats a cached descriptor's current value as text for the ping/version/productId replies,
/// falling back to an empty string until the first response has landed.
fn cached_text(state: &State, name: &str) -> String {
    match state.cache.lookup_by_name(name).map(|id| state.cache.object(id).value.clone()) {
        Some(Some(RegisterValue::Text(s))) => s,
        Some(Some(RegisterValue::Int(n))) => n.to_string(),
        _ => String::new(),
    }
}

fn enqueue_bare(state: &mut State, kind: CommandKind, priority: u8, max_retries: u32, timeout: &mut futures::future::Fuse<Delay>) {
    if let Ok(command) = Command::bare(kind, priority, max_retries) {
        state.queue.insert(command, state.config.compression_enabled);
        drive_head(state, timeout);
    }
}

/// Transmits the current queue head if nothing is currently inflight for it, arming a timeout.
fn drive_head(state: &mut State, timeout: &mut futures::future::Fuse<Delay>) {
    if !state.operational {
        return; // scheduling backpressure: re-checked by the outer loop's backpressure timer
    }
    let head = match state.queue.head() {
        Some(head) => head.clone(),
        None => return,
    };
    let id = head.identifier();
    if state.pending.contains_key(&id) {
        return; // already inflight, waiting on its timer or a response
    }

    let remaining_retries = head.max_retries;
    state.pending.insert(
        id,
        PendingRequest {
            command: head.clone(),
            remaining_retries,
            sent_time: SystemTime::now(),
            timeouts_seen: 0,
        },
    );
    transmit(state, &head);
    *timeout = Delay::new(Duration::from_millis(state.config.cmd_response_timeout_ms)).fuse();
}

fn transmit(state: &mut State, command: &Command) {
    log::debug!("sending command {}", command.identifier());
    let frame = OutboundFrame {
        bytes: command.wire.clone().into_bytes(),
    };
    let mut outbound = state.outbound.clone();
    async_std::task::spawn(async move {
        let _ = outbound.send(frame).await;
    });
}

fn on_timeout(state: &mut State, timeout: &mut futures::future::Fuse<Delay>) {
    let head = match state.queue.head() {
        Some(head) => head.clone(),
        None => return,
    };
    let id = head.identifier();

    let exhausted = match state.pending.get_mut(&id) {
        Some(pending) => {
            pending.timeouts_seen += 1;
            log::warn!("timeout waiting for response to {}", id);
            if pending.remaining_retries == 0 {
                true
            } else {
                pending.remaining_retries -= 1;
                if pending.timeouts_seen % RESTART_EVERY_N_RETRIES == 0 && relay_is_off(state) {
                    send_restart(state);
                }
                false
            }
        }
        None => return,
    };

    if exhausted {
        log::error!("retries exhausted for {}, dropping command", id);
        state.pending.remove(&id);
        state.queue.advance();
        drive_head(state, timeout);
    } else {
        transmit(state, &head);
        *timeout = Delay::new(Duration::from_millis(state.config.cmd_response_timeout_ms)).fuse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> State {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded();
        let mut cache = RegisterCache::new();
        registers::seed(&mut cache);
        State {
            config: DriverConfig::default(),
            cache,
            outbound: outbound_tx,
            checksum: TelemetryChecksum::new(),
            frame_arrival_timestamp: None,
            pending: FnvHashMap::default(),
            queue: CommandQueue::new(),
            operational: true,
        }
    }

    fn telemetry_line(key: &str, value: &str) -> Line {
        Line {
            content: format!("{}\t{}", key, value).into_bytes(),
        }
    }

    fn checksum_line_with(body_after_byte: &str, checksum_byte: u8) -> Line {
        let mut content = b"Checksum\t".to_vec();
        content.push(checksum_byte);
        content.extend_from_slice(body_after_byte.as_bytes());
        Line { content }
    }

    fn idle_timeout() -> futures::future::Fuse<Delay> {
        Delay::new(Duration::from_secs(u64::MAX / 2)).fuse()
    }

    /// Places `command` at the queue head with a matching `PendingRequest`, the state `drive_head`
    /// would produce, without actually transmitting anything (transmission spawns an `async_std`
    /// task, which needs a running executor these plain `#[test]` functions don't have).
    fn make_inflight(state: &mut State, command: Command) {
        let id = command.identifier();
        state.queue.insert(command.clone(), true);
        state.pending.insert(
            id,
            PendingRequest {
                command,
                remaining_retries: 3,
                sent_time: SystemTime::now(),
                timeouts_seen: 0,
            },
        );
    }

    /// Wraps `response_body_hex` (pre-checksum) as the embedded-response remainder of a telemetry
    /// frame's `Checksum` line, choosing the checksum byte that makes the whole frame valid given
    /// whatever has already been fed into `state.checksum`.
    fn embed_response(state: &State, response_body_hex: &str) -> Line {
        let framed = crate::checksum::append(response_body_hex).unwrap();
        let remainder = format!(":{}\n", framed);
        let mut probe = state.checksum;
        probe.feed(b"Checksum\t");
        let total_before = probe_total(&probe);
        let checksum_byte = (0u8).wrapping_sub(total_before);
        checksum_line_with(&remainder, checksum_byte)
    }

    #[test]
    fn s3_frame_commit_fires_four_changes() {
        let mut state = fresh_state();
        let mut timeout = idle_timeout();
        on_line(&mut state, telemetry_line("V", "24340"), &mut timeout);
        on_line(&mut state, telemetry_line("I", "-500"), &mut timeout);
        on_line(&mut state, telemetry_line("SOC", "876"), &mut timeout);
        on_line(&mut state, telemetry_line("Relay", "ON"), &mut timeout);

        // Recompute the exact checksum byte that makes the running sum zero mod 256, using the
        // same accumulator the engine itself would have after the four lines above.
        let mut probe = state.checksum;
        probe.feed(b"Checksum\t");
        let total_before = probe_total(&probe);
        let checksum_byte = (0u8).wrapping_sub(total_before);

        on_line(&mut state, checksum_line_with("", checksum_byte), &mut timeout);

        assert_eq!(
            state.cache.object(state.cache.lookup_by_key("V").unwrap()).value,
            Some(RegisterValue::Int(24340))
        );
        assert_eq!(
            state.cache.object(state.cache.lookup_by_key("I").unwrap()).value,
            Some(RegisterValue::Int(-500))
        );
        assert_eq!(
            state.cache.object(state.cache.lookup_by_key("SOC").unwrap()).value,
            Some(RegisterValue::Int(876))
        );
    }

    #[test]
    fn s4_frame_reject_leaves_values_unset() {
        let mut state = fresh_state();
        let mut timeout = idle_timeout();
        on_line(&mut state, telemetry_line("V", "24340"), &mut timeout);
        // Deliberately wrong checksum byte.
        on_line(&mut state, checksum_line_with("", 0x00), &mut timeout);

        assert!(state.cache.object(state.cache.lookup_by_key("V").unwrap()).value.is_none());
    }

    #[test]
    fn s5_response_correlation_resolves_get_via_embedded_response() {
        let mut state = fresh_state();
        let mut timeout = idle_timeout();

        let get_soc = Command::get(registers::named::STATE_OF_CHARGE_ADDR, 1, 3).unwrap();
        make_inflight(&mut state, get_soc);
        assert_eq!(state.pending.len(), 1);

        on_line(&mut state, telemetry_line("V", "1"), &mut timeout);
        // :7 FF0F 00 6C03 <CC>\n -- get response for 0x0FFF, state OK, value 0x036C (= 876).
        let line = embed_response(&state, "7FF0F006C03");
        on_line(&mut state, line, &mut timeout);

        assert!(state.queue.is_empty());
        assert!(state.pending.is_empty());
        assert_eq!(
            state
                .cache
                .object(state.cache.lookup_by_address(registers::named::STATE_OF_CHARGE_ADDR).unwrap())
                .value,
            Some(RegisterValue::Int(0x036C))
        );
    }

    #[test]
    fn device_reported_unknown_id_retires_command_without_updating_cache() {
        let mut state = fresh_state();
        let mut timeout = idle_timeout();

        let get_soc = Command::get(registers::named::STATE_OF_CHARGE_ADDR, 1, 3).unwrap();
        make_inflight(&mut state, get_soc);

        on_line(&mut state, telemetry_line("V", "1"), &mut timeout);
        // State byte 01 = isUnknownID, no value field.
        let line = embed_response(&state, "7FF0F01");
        on_line(&mut state, line, &mut timeout);

        assert!(state.queue.is_empty());
        assert!(state.pending.is_empty());
        assert!(state
            .cache
            .object(state.cache.lookup_by_address(registers::named::STATE_OF_CHARGE_ADDR).unwrap())
            .value
            .is_none());
    }

    #[test]
    fn unrecognized_status_byte_leaves_command_inflight_for_retry() {
        let mut state = fresh_state();
        let mut timeout = idle_timeout();

        let get_soc = Command::get(registers::named::STATE_OF_CHARGE_ADDR, 1, 3).unwrap();
        make_inflight(&mut state, get_soc);

        on_line(&mut state, telemetry_line("V", "1"), &mut timeout);
        // State byte 03 is not one of isOK/isUnknownID/isNotSupported/isParameterError.
        let line = embed_response(&state, "7FF0F03");
        on_line(&mut state, line, &mut timeout);

        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.pending.len(), 1);
    }

    fn probe_total(cs: &TelemetryChecksum) -> u8 {
        // TelemetryChecksum keeps its running total private; reconstruct it via is_valid's
        // complement since tests live in the same crate but not the same module.
        // feed(&[0]) would change state, so instead we use the public surface: is_valid() after
        // feeding a trial byte tells us whether that byte completes the frame.
        for candidate in 0u8..=255 {
            let mut trial = *cs;
            trial.feed(&[candidate]);
            if trial.is_valid() {
                return 0u8.wrapping_sub(candidate);
            }
        }
        unreachable!("every accumulator has exactly one completing byte")
    }
}
