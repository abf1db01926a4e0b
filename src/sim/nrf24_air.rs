//! Simulated nRF24 medium
//!
//! Radios are keyed by chip id. A write reaches every other powered,
//! listening radio on the same channel that has a reading pipe open on the
//! writing address. Unicast writes report success only when a receiver with
//! auto-ack on that pipe took the frame.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PaLevel;
use crate::errors::{RcError, Result};
use crate::transport::nrf24::{Nrf24Driver, RadioAddress};
use crate::MESSAGE_SIZE;

const RX_FIFO_DEPTH: usize = 3;

struct Slot {
    powered: bool,
    started: bool,
    channel: u8,
    pa_level: PaLevel,
    listening: bool,
    reading: HashMap<u8, (RadioAddress, bool)>,
    writing: Option<RadioAddress>,
    rx: VecDeque<Vec<u8>>,
    failing_writes: u32,
}

impl Slot {
    fn new() -> Self {
        Self {
            powered: true,
            started: false,
            channel: 0,
            pa_level: PaLevel::Min,
            listening: false,
            reading: HashMap::new(),
            writing: None,
            rx: VecDeque::new(),
            failing_writes: 0,
        }
    }

    /// Ack flag of the pipe matching `addr`, if this radio would take the frame
    fn accepts(&self, channel: u8, addr: RadioAddress) -> Option<bool> {
        if !(self.powered && self.started && self.listening && self.channel == channel) {
            return None;
        }
        self.reading
            .values()
            .find(|(pipe, _)| *pipe == addr)
            .map(|(_, auto_ack)| *auto_ack)
    }
}

#[derive(Default)]
struct AirState {
    slots: HashMap<u64, Slot>,
}

#[derive(Clone, Default)]
pub struct Nrf24Air {
    state: Arc<Mutex<AirState>>,
}

impl Nrf24Air {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn radio(&self, chip_id: u64) -> SimNrf24Radio {
        self.state.lock().slots.insert(chip_id, Slot::new());
        SimNrf24Radio {
            state: self.state.clone(),
            chip_id,
        }
    }

    /// Powering off also flushes the receive FIFO
    pub fn set_powered(&self, chip_id: u64, powered: bool) {
        if let Some(slot) = self.state.lock().slots.get_mut(&chip_id) {
            slot.powered = powered;
            if !powered {
                slot.rx.clear();
            }
        }
    }

    pub fn fail_next_writes(&self, chip_id: u64, count: u32) {
        if let Some(slot) = self.state.lock().slots.get_mut(&chip_id) {
            slot.failing_writes = count;
        }
    }

    /// Queue raw bytes in a radio's receive FIFO
    pub fn inject(&self, chip_id: u64, data: &[u8]) {
        if let Some(slot) = self.state.lock().slots.get_mut(&chip_id) {
            slot.rx.push_back(data.to_vec());
        }
    }

    pub fn writing_pipe(&self, chip_id: u64) -> Option<RadioAddress> {
        self.state
            .lock()
            .slots
            .get(&chip_id)
            .and_then(|slot| slot.writing)
    }

    pub fn is_listening_on(&self, chip_id: u64, addr: RadioAddress) -> bool {
        self.state.lock().slots.get(&chip_id).is_some_and(|slot| {
            slot.listening && slot.reading.values().any(|(pipe, _)| *pipe == addr)
        })
    }
}

/// One radio on an [`Nrf24Air`]
pub struct SimNrf24Radio {
    state: Arc<Mutex<AirState>>,
    chip_id: u64,
}

impl SimNrf24Radio {
    pub fn chip(&self) -> u64 {
        self.chip_id
    }

    pub fn pa_level(&self) -> Option<PaLevel> {
        self.with_slot(|slot| slot.pa_level)
    }

    fn with_slot<T>(&self, f: impl FnOnce(&mut Slot) -> T) -> Option<T> {
        self.state.lock().slots.get_mut(&self.chip_id).map(f)
    }
}

impl Nrf24Driver for SimNrf24Radio {
    fn begin(&mut self) -> Result<()> {
        self.with_slot(|slot| {
            if slot.powered {
                slot.started = true;
                Ok(())
            } else {
                Err(RcError::Driver("radio not responding".to_string()))
            }
        })
        .unwrap_or_else(|| Err(RcError::Driver("radio removed".to_string())))
    }

    fn chip_id(&self) -> u64 {
        self.chip_id
    }

    fn set_channel(&mut self, channel: u8) {
        self.with_slot(|slot| slot.channel = channel);
    }

    fn set_pa_level(&mut self, level: PaLevel) {
        self.with_slot(|slot| slot.pa_level = level);
    }

    fn set_retries(&mut self, _delay: u8, _count: u8) {}

    fn open_reading_pipe(&mut self, pipe: u8, addr: RadioAddress, auto_ack: bool) {
        self.with_slot(|slot| slot.reading.insert(pipe, (addr, auto_ack)));
    }

    fn open_writing_pipe(&mut self, addr: RadioAddress) {
        self.with_slot(|slot| slot.writing = Some(addr));
    }

    fn start_listening(&mut self) {
        self.with_slot(|slot| slot.listening = true);
    }

    fn stop_listening(&mut self) {
        self.with_slot(|slot| slot.listening = false);
    }

    fn write(&mut self, data: &[u8], multicast: bool) -> bool {
        let mut state = self.state.lock();
        let Some(sender) = state.slots.get_mut(&self.chip_id) else {
            return false;
        };
        if !(sender.powered && sender.started) {
            return false;
        }
        if sender.failing_writes > 0 {
            sender.failing_writes -= 1;
            return false;
        }
        let Some(target) = sender.writing else {
            return false;
        };
        let channel = sender.channel;

        let mut acked = false;
        for (id, slot) in state.slots.iter_mut() {
            if *id == self.chip_id {
                continue;
            }
            let Some(auto_ack) = slot.accepts(channel, target) else {
                continue;
            };
            if slot.rx.len() < RX_FIFO_DEPTH {
                slot.rx.push_back(data.to_vec());
                acked |= auto_ack;
            }
        }
        multicast || acked
    }

    fn available(&mut self) -> bool {
        self.with_slot(|slot| slot.powered && !slot.rx.is_empty())
            .unwrap_or(false)
    }

    fn read(&mut self, buf: &mut [u8; MESSAGE_SIZE]) -> usize {
        self.with_slot(|slot| match slot.rx.pop_front() {
            Some(frame) => {
                let len = frame.len().min(MESSAGE_SIZE);
                buf[..len].copy_from_slice(&frame[..len]);
                len
            }
            None => 0,
        })
        .unwrap_or(0)
    }

    fn power_down(&mut self) {
        self.with_slot(|slot| {
            slot.started = false;
            slot.listening = false;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPE_A: RadioAddress = RadioAddress([1, 2, 3, 4, 5]);
    const PIPE_B: RadioAddress = RadioAddress([9, 8, 7, 6, 5]);

    fn started(air: &Nrf24Air, chip: u64, own: RadioAddress) -> SimNrf24Radio {
        let mut radio = air.radio(chip);
        radio.begin().unwrap();
        radio.set_channel(76);
        radio.open_reading_pipe(0, own, true);
        radio.start_listening();
        radio
    }

    #[test]
    fn test_unicast_requires_ack() {
        let air = Nrf24Air::new();
        let mut a = started(&air, 1, PIPE_A);
        let mut b = started(&air, 2, PIPE_B);

        a.open_writing_pipe(PIPE_B);
        assert!(a.write(&[7; 32], false));
        assert!(b.available());
        let mut buf = [0u8; MESSAGE_SIZE];
        assert_eq!(b.read(&mut buf), 32);
        assert_eq!(buf[0], 7);

        b.stop_listening();
        assert!(!a.write(&[7; 32], false), "nobody listening, no ack");
        assert!(a.write(&[7; 32], true), "multicast never waits for ack");
    }

    #[test]
    fn test_channel_mismatch_and_fifo_limit() {
        let air = Nrf24Air::new();
        let mut a = started(&air, 1, PIPE_A);
        let mut b = started(&air, 2, PIPE_B);
        a.open_writing_pipe(PIPE_B);

        b.set_channel(10);
        assert!(!a.write(&[1; 32], false));
        b.set_channel(76);

        for _ in 0..5 {
            a.write(&[1; 32], true);
        }
        let mut count = 0;
        let mut buf = [0u8; MESSAGE_SIZE];
        while b.available() {
            b.read(&mut buf);
            count += 1;
        }
        assert_eq!(count, RX_FIFO_DEPTH);
    }

    #[test]
    fn test_injected_write_failures() {
        let air = Nrf24Air::new();
        let mut a = started(&air, 1, PIPE_A);
        let _b = started(&air, 2, PIPE_B);
        a.open_writing_pipe(PIPE_B);
        air.fail_next_writes(1, 1);

        assert!(!a.write(&[1; 32], false));
        assert!(a.write(&[1; 32], false));
    }
}
