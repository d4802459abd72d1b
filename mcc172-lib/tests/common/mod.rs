//! Common test utilities: a mock backplane and a scripted firmware
//! simulator that stands in for the board on the SPI bus.

// Shared across multiple test files; not every item is used in every file.
#![allow(dead_code)]

use mcc172_lib::constants::{Command, MSG_START};
use mcc172_lib::hal::{Backplane, HatInfo, SpiBus, IRQ_GPIO};
use mcc172_lib::{Error, Mcc172, Result};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const MCC172_ID: u16 = 0x0145;
pub const FW_VERSION: u16 = 0x0103;

pub const GOOD_EEPROM: &str = r#"{
    "serial": "01DF818C",
    "calibration": {
        "date": "2019-03-18",
        "slopes": [1.0, 1.0],
        "offsets": [0.0, 0.0]
    }
}"#;

/// Backplane double: in-process bus lock, scripted IRQ line, canned EEPROM.
pub struct MockBackplane {
    locked: AtomicBool,
    lock_timeout: Duration,
    pub irq_high: AtomicBool,
    eeprom: Mutex<Option<HatInfo>>,
    pub addresses: Mutex<Vec<u8>>,
    pub gpio_writes: Mutex<Vec<(u8, bool)>>,
}

impl MockBackplane {
    pub fn new() -> Arc<MockBackplane> {
        Self::with_eeprom(Some((MCC172_ID, GOOD_EEPROM.as_bytes().to_vec())))
    }

    /// `None` emulates a board with no readable EEPROM.
    pub fn with_eeprom(eeprom: Option<(u16, Vec<u8>)>) -> Arc<MockBackplane> {
        Arc::new(MockBackplane {
            locked: AtomicBool::new(false),
            lock_timeout: Duration::from_millis(200),
            irq_high: AtomicBool::new(true),
            eeprom: Mutex::new(eeprom.map(|(id, custom)| HatInfo { id, custom })),
            addresses: Mutex::new(Vec::new()),
            gpio_writes: Mutex::new(Vec::new()),
        })
    }

    /// Hold the bus lock from outside, as a foreign process would.
    pub fn steal_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn return_lock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Backplane for MockBackplane {
    fn obtain_lock(&self) -> Result<i32> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            if self
                .locked
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(1);
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout);
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    fn release_lock(&self, _token: i32) {
        self.locked.store(false, Ordering::Release);
    }

    fn set_address(&self, address: u8) {
        self.addresses.lock().unwrap().push(address);
    }

    fn gpio_dir(&self, _pin: u8, _input: bool) {}

    fn gpio_write(&self, pin: u8, value: bool) {
        self.gpio_writes.lock().unwrap().push((pin, value));
    }

    fn gpio_status(&self, pin: u8) -> bool {
        if pin == IRQ_GPIO {
            self.irq_high.load(Ordering::Acquire)
        } else {
            false
        }
    }

    fn hat_info(&self, _address: u8) -> Result<HatInfo> {
        self.eeprom
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ResourceUnavail("no EEPROM"))
    }
}

/// Scriptable firmware model behind the SPI byte stream.
pub struct SimState {
    // Fault injection.
    /// Never raise the ready byte; every transaction times out.
    pub never_ready: bool,
    /// Reply with this command byte instead of the echoed one.
    pub respond_as: Option<u8>,
    /// Firmware status byte for every reply.
    pub fw_status: u8,
    /// Zero bytes served before the reply frame starts.
    pub ready_delay: usize,

    // Device model.
    pub clock_source: u8,
    pub clock_div_byte: u8,
    pub synced: bool,
    pub iepe: u8,
    pub trigger_byte: u8,
    pub scan_running: bool,
    pub triggered: bool,
    pub hw_overrun: bool,
    /// Device-side samples ready to read.
    pub available: u16,
    /// Largest contiguous FIFO read the device reports.
    pub max_read_now: u16,
    /// Samples added to `available` on every status poll (continuous pacing).
    pub fill_per_status: u16,
    /// Total samples the fill may add; `None` is unlimited.
    pub fill_budget: Option<u32>,
    /// Total interleaved samples of the running finite scan; `None` while
    /// idle or continuous.
    pub finite_total: Option<u32>,
    /// Whether the finite acquisition has landed in the FIFO.
    pub acquired: bool,
    /// Next raw code the sample generator emits.
    pub next_code: i32,
    /// Generator step; 0 repeats the same code forever.
    pub code_step: i32,

    // Bookkeeping.
    reply: VecDeque<u8>,
    pub commands_seen: Vec<u8>,
    pub interleaved: bool,
}

impl SimState {
    fn new() -> SimState {
        SimState {
            never_ready: false,
            respond_as: None,
            fw_status: 0,
            ready_delay: 0,
            clock_source: 0,
            clock_div_byte: 0,
            synced: true,
            iepe: 0,
            trigger_byte: 0,
            scan_running: false,
            triggered: false,
            hw_overrun: false,
            available: 0,
            max_read_now: u16::MAX,
            fill_per_status: 0,
            fill_budget: None,
            finite_total: None,
            acquired: false,
            next_code: 0,
            code_step: 1,
            reply: VecDeque::new(),
            commands_seen: Vec::new(),
            interleaved: false,
        }
    }

    fn accept(&mut self, frame: &[u8]) {
        if !self.reply.is_empty() {
            // A new command arrived before the previous reply was drained:
            // two transactions interleaved on the bus.
            self.interleaved = true;
            self.reply.clear();
        }

        let command = frame[1];
        let count = frame[2] as usize | (frame[3] as usize) << 8;
        let payload = &frame[4..4 + count];
        self.commands_seen.push(command);

        if self.never_ready {
            return;
        }

        let body = if self.fw_status == 0 {
            self.execute(command, payload)
        } else {
            Vec::new()
        };

        for _ in 0..self.ready_delay {
            self.reply.push_back(0);
        }
        self.reply.push_back(MSG_START);
        self.reply.push_back(self.respond_as.unwrap_or(command));
        self.reply.push_back(self.fw_status);
        self.reply.push_back(body.len() as u8);
        self.reply.push_back((body.len() >> 8) as u8);
        self.reply.extend(body);
    }

    fn execute(&mut self, command: u8, payload: &[u8]) -> Vec<u8> {
        match Command::from(command) {
            Command::Id => {
                let mut body = MCC172_ID.to_le_bytes().to_vec();
                body.extend_from_slice(&FW_VERSION.to_le_bytes());
                body
            }
            Command::Blink | Command::Reset | Command::TestSignalWrite => Vec::new(),
            Command::IepeConfigRead => vec![self.iepe],
            Command::IepeConfigWrite => {
                self.iepe = payload[0];
                Vec::new()
            }
            Command::TestSignalRead => vec![0b011],
            Command::AinClockConfigRead => {
                let synced = if self.synced { 0x80 } else { 0x00 };
                vec![self.clock_source | synced, self.clock_div_byte]
            }
            Command::AinClockConfigWrite => {
                self.clock_source = payload[0];
                self.clock_div_byte = payload[1];
                Vec::new()
            }
            Command::TriggerConfigWrite => {
                self.trigger_byte = payload[0];
                Vec::new()
            }
            Command::AinScanStart => {
                let scan_count = u32::from_le_bytes(payload[..4].try_into().unwrap());
                let mask = payload[4];
                let channel_count = (mask & 0x01 != 0) as u32 + (mask & 0x02 != 0) as u32;
                self.scan_running = true;
                self.triggered = mask & 0x04 == 0;
                self.finite_total = (scan_count > 0).then(|| scan_count * channel_count);
                self.acquired = false;
                self.available = 0;
                Vec::new()
            }
            Command::AinScanStop => {
                self.scan_running = false;
                Vec::new()
            }
            Command::AinScanStatus => {
                if self.scan_running && self.triggered {
                    match self.finite_total {
                        // A finite acquisition is over in microseconds at
                        // these rates; model it as instantly in the FIFO.
                        Some(total) if !self.acquired => {
                            self.available = total.min(u16::MAX as u32) as u16;
                            self.acquired = true;
                        }
                        Some(_) => {}
                        None => {
                            let mut fill = self.fill_per_status as u32;
                            if let Some(budget) = self.fill_budget.as_mut() {
                                fill = fill.min(*budget);
                                *budget -= fill;
                            }
                            self.available = self.available.saturating_add(fill as u16);
                        }
                    }
                }
                let running = self.scan_running && (self.finite_total.is_none() || !self.acquired);
                let mut status = 0u8;
                if running {
                    status |= 0x01;
                }
                if self.hw_overrun {
                    status |= 0x02;
                }
                if self.triggered {
                    status |= 0x04;
                }
                let mut body = vec![status];
                body.extend_from_slice(&self.available.to_le_bytes());
                body.extend_from_slice(&self.max_read_now.to_le_bytes());
                body
            }
            Command::AinScanData => {
                let count = u16::from_le_bytes(payload[..2].try_into().unwrap());
                let mut body = Vec::with_capacity(count as usize * 3);
                for _ in 0..count {
                    let code = self.next_code & 0x00FF_FFFF;
                    body.push((code >> 16) as u8);
                    body.push((code >> 8) as u8);
                    body.push(code as u8);
                    self.next_code += self.code_step;
                }
                self.available = self.available.saturating_sub(count);
                body
            }
            _ => Vec::new(),
        }
    }

    fn serve(&mut self, rx: &mut [u8]) {
        for byte in rx.iter_mut() {
            *byte = self.reply.pop_front().unwrap_or(0);
        }
    }
}

/// [`SpiBus`] double that routes frames into a shared [`SimState`].
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    pub fn new() -> (SimBus, Arc<Mutex<SimState>>) {
        let state = Arc::new(Mutex::new(SimState::new()));
        (
            SimBus {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl SpiBus for SimBus {
    fn configure(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if tx.len() >= 4 && tx[0] == MSG_START {
            state.accept(tx);
            for byte in rx.iter_mut() {
                *byte = 0;
            }
        } else {
            state.serve(rx);
        }
        Ok(())
    }
}

/// Serialise tests that reuse board addresses: the registry is process-wide.
pub fn exclusive() -> std::sync::MutexGuard<'static, ()> {
    static GATE: Mutex<()> = Mutex::new(());
    GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Open a board handle against a fresh simulator.
pub fn open_sim(address: u8) -> (Mcc172, Arc<MockBackplane>, Arc<Mutex<SimState>>) {
    let backplane = MockBackplane::new();
    let (bus, sim) = SimBus::new();
    let board = Mcc172::open_with(address, Arc::clone(&backplane) as Arc<dyn Backplane>, Box::new(bus))
        .expect("open against simulator");
    (board, backplane, sim)
}
