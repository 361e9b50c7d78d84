//! Support for the `MCP23017` and `MCP23S17` "16-Bit I/O Expander with Serial Interface"
//!
//! Datasheet: https://ww1.microchip.com/downloads/en/devicedoc/20001952c.pdf
//!
//! The MCP23x17 offers two eight-bit GPIO banks.  It has three address pins,
//! so eight devices can coexist on one bus.  Flat pin indices 0..7 map to
//! GPA0..GPA7 (bank A) and 8..15 to GPB0..GPB7 (bank B).
//!
//! Each bank has an interrupt output which can work independently or, with
//! mirroring enabled, as a single shared line.  When one or both outputs are
//! wired to host GPIO lines, the engine subscribes to those lines and
//! demultiplexes each hardware interrupt into per-pin edge events for the
//! provisioned input pins.
use std::sync::{Arc, Mutex};

use embedded_hal::i2c::Error as _;
use embedded_hal::spi::Error as _;

use crate::bus::{BusHandle, RegisterBus};
use crate::common::{DeviceMode, EdgeSource, InterruptEvent, PullMode, Trigger};
use crate::error::{Error, TransportError};
use crate::pin::{InputPin, OutputPin};
use crate::registry::{DeviceKey, DeviceRegistry, PinEntry, PinInfo};
use crate::{PortDriver, ShadowReg, ShadowStore};

const PINS: u8 = 16;
const PINS_PER_BANK: u8 = 8;
const BASE_ADDR: u8 = 0x20;

const DIGITAL_MODES: &[DeviceMode] = &[DeviceMode::DigitalInput, DeviceMode::DigitalOutput];

/// N.B.: These values are for BANK=0, which is the reset state of
/// the chip (and which initialization clears again if it finds it set).
///
/// For all registers, the reset value is 0x00, except for
/// IODIR{A,B} which are 0xFF (making all pins inputs) at reset.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regs {
    /// IODIR: input/output direction: 0=output; 1=input
    IODIRA = 0x00,
    /// IPOL: input polarity: 0=register values match input pins; 1=opposite
    IPOLA = 0x02,
    /// GPINTEN: interrupt-on-change: 0=disable; 1=enable
    GPINTENA = 0x04,
    /// DEFVAL: default values for interrupt-on-change
    DEFVALA = 0x06,
    /// INTCON: interrupt-on-change config: 0=compare to previous pin value;
    ///   1=compare to corresponding bit in DEFVAL
    INTCONA = 0x08,
    /// IOCON: configuration register
    /// - Bit 7: BANK (which this driver keeps 0)
    /// - Bit 6: MIRROR: if enabled, the INT pins are logically ORed; an
    ///          interrupt on either bank will cause both pins to activate
    /// - Bit 5: SEQOP: controls the incrementing function of the address pointer
    /// - Bit 4: DISSLW: disables slew rate control on SDA
    /// - Bit 3: HAEN: hardware address enable (MCP23S17 only)
    /// - Bit 2: ODR: interrupt pins are 0=active-driver outputs (INTPOL sets
    ///          polarity) or 1=open-drain outputs (overrides INTPOL)
    /// - Bit 1: INTPOL: interrupt pin is 0=active-low or 1=active-high
    /// - Bit 0: unused
    IOCONA = 0x0a,
    /// GPPU: GPIO pull-ups: enables weak internal pull-ups on each pin (when
    ///   configured as an input)
    GPPUA = 0x0c,
    /// INTF: interrupt flags: 0=no interrupt pending; 1=corresponding pin caused interrupt
    INTFA = 0x0e,
    /// INTCAP: interrupt captured value: reflects value of each pin at the
    ///   time they caused an interrupt
    INTCAPA = 0x10,
    /// GPIO: reflects logic level on pins
    GPIOA = 0x12,
    /// OLAT: output latches: sets state for pins configured as outputs
    OLATA = 0x14,
    /// IODIR: input/output direction: 0=output; 1=input
    IODIRB = 0x01,
    /// IPOL: input polarity: 0=register values match input pins; 1=opposite
    IPOLB = 0x03,
    /// GPINTEN: interrupt-on-change: 0=disable; 1=enable
    GPINTENB = 0x05,
    /// DEFVAL: default values for interrupt-on-change
    DEFVALB = 0x07,
    /// INTCON: interrupt-on-change config: 0=compare to previous pin value;
    ///   1=compare to corresponding bit in DEFVAL
    INTCONB = 0x09,
    /// IOCON: configuration register, same layout as IOCONA
    IOCONB = 0x0b,
    /// GPPU: GPIO pull-ups: enables weak internal pull-ups on each pin (when
    ///   configured as an input)
    GPPUB = 0x0d,
    /// INTF: interrupt flags: 0=no interrupt pending; 1=corresponding pin caused interrupt
    INTFB = 0x0f,
    /// INTCAP: interrupt captured value: reflects value of each pin at the
    ///   time they caused an interrupt
    INTCAPB = 0x11,
    /// GPIO: reflects logic level on pins
    GPIOB = 0x13,
    /// OLAT: output latches: sets state for pins configured as outputs
    OLATB = 0x15,
}

impl From<Regs> for u8 {
    fn from(r: Regs) -> u8 {
        r as u8
    }
}

const IODIR: [Regs; 2] = [Regs::IODIRA, Regs::IODIRB];
const IPOL: [Regs; 2] = [Regs::IPOLA, Regs::IPOLB];
const GPINTEN: [Regs; 2] = [Regs::GPINTENA, Regs::GPINTENB];
const DEFVAL: [Regs; 2] = [Regs::DEFVALA, Regs::DEFVALB];
const INTCON: [Regs; 2] = [Regs::INTCONA, Regs::INTCONB];
const GPPU: [Regs; 2] = [Regs::GPPUA, Regs::GPPUB];
const INTF: [Regs; 2] = [Regs::INTFA, Regs::INTFB];
const INTCAP: [Regs; 2] = [Regs::INTCAPA, Regs::INTCAPB];
const GPIO: [Regs; 2] = [Regs::GPIOA, Regs::GPIOB];
const OLAT: [Regs; 2] = [Regs::OLATA, Regs::OLATB];

const IOCON_BANK: u8 = 1 << 7;
const IOCON_MIRROR: u8 = 1 << 6;
const IOCON_SEQOP: u8 = 1 << 5;
const IOCON_ODR: u8 = 1 << 2;
const IOCON_INTPOL: u8 = 1 << 1;

/// How the expander's interrupt outputs are wired to the host.
///
/// Derived once at construction from the configured host lines; immutable
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// No line wired; input changes are observable through reads only.
    Disabled,
    /// Only INTA is wired; only bank A pins can interrupt.
    BankAOnly,
    /// Only INTB is wired; only bank B pins can interrupt.
    BankBOnly,
    /// INTA and INTB are wired to two distinct host lines.
    BankAAndB,
    /// Both banks signal through one shared host line (IOCON.MIRROR set).
    Mirrored,
}

fn derive_interrupt_mode(int_a: Option<u8>, int_b: Option<u8>) -> InterruptMode {
    match (int_a, int_b) {
        (None, None) => InterruptMode::Disabled,
        (Some(a), Some(b)) if a == b => InterruptMode::Mirrored,
        (Some(_), Some(_)) => InterruptMode::BankAAndB,
        (Some(_), None) => InterruptMode::BankAOnly,
        (None, Some(_)) => InterruptMode::BankBOnly,
    }
}

/// Host lines the engine subscribes to, one entry per physical line.
fn wired_lines(mode: InterruptMode, int_a: Option<u8>, int_b: Option<u8>) -> Vec<u8> {
    let mut lines = Vec::new();
    match mode {
        InterruptMode::Disabled => {}
        InterruptMode::Mirrored | InterruptMode::BankAOnly => lines.extend(int_a),
        InterruptMode::BankBOnly => lines.extend(int_b),
        InterruptMode::BankAAndB => {
            lines.extend(int_a);
            lines.extend(int_b);
        }
    }
    lines
}

fn check_pin(pin: u8) -> Result<(usize, u8), Error> {
    if pin >= PINS {
        return Err(Error::OutOfRange { pin, pins: PINS });
    }
    Ok(split_pin(pin))
}

fn split_pin(pin: u8) -> (usize, u8) {
    ((pin / PINS_PER_BANK) as usize, pin % PINS_PER_BANK)
}

/// Construction parameters beyond the bus itself.
///
/// `int_a`/`int_b` are host GPIO line numbers wired to the chip's INTA/INTB
/// outputs; giving both the same number selects mirrored mode. Interrupt
/// lines without a `host_gpio` service cannot be subscribed and are ignored
/// with a warning.
#[derive(Default)]
pub struct Config {
    /// Bus controller number, part of the device's registry keys and name.
    pub controller: u8,
    /// Host GPIO service for the interrupt lines.
    pub host_gpio: Option<Box<dyn EdgeSource + Send>>,
    /// Host line wired to INTA.
    pub int_a: Option<u8>,
    /// Host line wired to INTB.
    pub int_b: Option<u8>,
}

/// `MCP23x17` 16-bit port expander engine.
///
/// Pins are provisioned individually as digital inputs or outputs; each
/// provisioned pin is an exclusively-owned registry entry until its handle is
/// closed. `close()` tears the whole device down: interrupt lines first, then
/// every still-open pin, then the bus.
pub struct Mcp23x17<B> {
    shared: Arc<Shared<B>>,
}

struct Shared<B> {
    name: String,
    class: &'static str,
    controller: u8,
    address: u8,
    interrupt_mode: InterruptMode,
    int_a: Option<u8>,
    int_b: Option<u8>,
    registry: DeviceRegistry,
    state: Mutex<State<B>>,
}

struct State<B> {
    /// `None` once the device is closed.
    bus: Option<BusHandle<B>>,
    host: Option<Box<dyn EdgeSource + Send>>,
    shadow: ShadowStore,
}

impl<B> State<B> {
    fn bus(&self) -> Result<&BusHandle<B>, Error> {
        self.bus.as_ref().ok_or(Error::Closed)
    }
}

impl<B: RegisterBus> State<B> {
    /// Write one shadow byte through to hardware.
    fn flush(&self, reg: ShadowReg, bank: usize) -> Result<(), Error> {
        let value = self.shadow.value(reg, bank);
        self.bus()?.write_reg(shadow_reg_addr(reg, bank), value)
    }
}

fn shadow_reg_addr(reg: ShadowReg, bank: usize) -> Regs {
    match reg {
        ShadowReg::Direction => IODIR[bank],
        ShadowReg::PullUp => GPPU[bank],
        ShadowReg::IntEnable => GPINTEN[bank],
        ShadowReg::DefaultValue => DEFVAL[bank],
        ShadowReg::IntCompare => INTCON[bank],
        ShadowReg::OutputLatch => OLAT[bank],
    }
}

impl<I2C> Mcp23x17<Mcp23017Bus<I2C>>
where
    I2C: crate::I2cBus + Send + 'static,
{
    /// MCP23017 on an I2C bus, interrupts disabled.
    ///
    /// `a0..a2` reflect the state of the chip's address pins.
    pub fn new_mcp23017(i2c: I2C, a0: bool, a1: bool, a2: bool) -> Result<Self, Error> {
        Self::with_config(Mcp23017Bus::new(i2c, a0, a1, a2), Config::default())
    }
}

impl<SPI> Mcp23x17<Mcp23S17Bus<SPI>>
where
    SPI: crate::SpiBus + Send + 'static,
{
    /// MCP23S17 on a SPI bus, interrupts disabled.
    pub fn new_mcp23s17(spi: SPI, a0: bool, a1: bool, a2: bool) -> Result<Self, Error> {
        Self::with_config(Mcp23S17Bus::new(spi, a0, a1, a2), Config::default())
    }
}

impl<B> Mcp23x17<B>
where
    B: RegisterBus + Send + 'static,
{
    /// Create an expander with explicit controller id and interrupt wiring.
    ///
    /// Initializes the chip (IOCON feature bits, every per-pin register
    /// cleared) and then subscribes to the configured interrupt lines, so no
    /// edge notification can observe a partially initialized device.
    pub fn with_config(bus: B, config: Config) -> Result<Self, Error> {
        let Config {
            controller,
            host_gpio,
            mut int_a,
            mut int_b,
        } = config;
        if host_gpio.is_none() && (int_a.is_some() || int_b.is_some()) {
            log::warn!("interrupt lines configured without a host gpio service, ignoring them");
            int_a = None;
            int_b = None;
        }
        let interrupt_mode = derive_interrupt_mode(int_a, int_b);

        let class = bus.class();
        let address = bus.address();
        let name = format!("{class}-{controller}-{address}");
        let bus = BusHandle::new(bus);
        initialize(&bus, &name, interrupt_mode)?;

        let shared = Arc::new(Shared {
            name,
            class,
            controller,
            address,
            interrupt_mode,
            int_a,
            int_b,
            registry: DeviceRegistry::new(),
            state: Mutex::new(State {
                bus: Some(bus),
                host: None,
                shadow: ShadowStore::default(),
            }),
        });

        if let Some(mut host) = host_gpio {
            let lines = wired_lines(interrupt_mode, int_a, int_b);
            for (i, &line) in lines.iter().enumerate() {
                let weak = Arc::downgrade(&shared);
                let subscribed = host.subscribe_edge(
                    line,
                    Trigger::Rising,
                    Box::new(move |event| {
                        if let Some(shared) = weak.upgrade() {
                            shared.handle_interrupt(event);
                        }
                    }),
                );
                if let Err(err) = subscribed {
                    for &prev in &lines[..i] {
                        if let Err(err) = host.unsubscribe(prev) {
                            log::warn!(
                                "{}: releasing line {prev} after failed setup: {err}",
                                shared.name
                            );
                        }
                    }
                    return Err(err);
                }
                log::debug!("{}: subscribed to host line {line}", shared.name);
            }
            shared.state.lock().unwrap().host = Some(host);
        }

        log::debug!("{}: opened, interrupt mode {:?}", shared.name, interrupt_mode);
        Ok(Self { shared })
    }

    /// Provision `pin` as a digital input.
    ///
    /// With interrupts wired, `trigger` selects which edges raise events for
    /// this pin; without, the pin is poll-only and `trigger` has no effect.
    pub fn provision_input(
        &self,
        pin: u8,
        pull: PullMode,
        trigger: Trigger,
    ) -> Result<InputPin, Error> {
        let (bank, bit) = check_pin(pin)?;
        let mut state = self.shared.state.lock().unwrap();
        state.bus()?;
        let entry = self.shared.registry.provision(
            self.shared.key(pin),
            PinInfo::new(pin, DIGITAL_MODES),
            DeviceMode::DigitalInput,
        )?;
        if let Err(err) = configure_input(
            &mut state,
            self.shared.interrupt_mode,
            bank,
            bit,
            pull,
            trigger,
        ) {
            self.shared.registry.release(entry.key());
            return Err(err);
        }
        drop(state);
        log::debug!("{}: pin {pin} provisioned as input", self.shared.name);
        let driver: Arc<dyn PortDriver> = self.shared.clone();
        Ok(InputPin::new(driver, entry))
    }

    /// Provision `pin` as a digital output driving `initial`.
    pub fn provision_output(&self, pin: u8, initial: bool) -> Result<OutputPin, Error> {
        let (bank, bit) = check_pin(pin)?;
        let mut state = self.shared.state.lock().unwrap();
        state.bus()?;
        let entry = self.shared.registry.provision(
            self.shared.key(pin),
            PinInfo::new(pin, DIGITAL_MODES),
            DeviceMode::DigitalOutput,
        )?;
        if let Err(err) = configure_output(&mut state, bank, bit, initial) {
            self.shared.registry.release(entry.key());
            return Err(err);
        }
        drop(state);
        log::debug!("{}: pin {pin} provisioned as output", self.shared.name);
        let driver: Arc<dyn PortDriver> = self.shared.clone();
        Ok(OutputPin::new(driver, pin))
    }

    /// Live level of any in-range pin, read fresh from the GPIO register.
    pub fn read_pin(&self, pin: u8) -> Result<bool, Error> {
        self.shared.read_pin(pin)
    }

    /// Drive a pin provisioned as an output.
    pub fn write_pin(&self, pin: u8, value: bool) -> Result<(), Error> {
        self.shared.write_pin(pin, value)
    }

    /// The wiring-derived interrupt mode.
    pub fn interrupt_mode(&self) -> InterruptMode {
        self.shared.interrupt_mode
    }

    /// Stable `class-controller-address` identity, the prefix of every
    /// registry key of this device.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Tear the device down: interrupt lines first, then every still-open
    /// pin, then the bus.
    ///
    /// Teardown always runs to completion; the first failure is reported
    /// afterwards. Handles that outlive the device report [`Error::Closed`].
    pub fn close(self) -> Result<(), Error> {
        self.shared.shutdown()
    }
}

fn initialize<B: RegisterBus>(
    bus: &BusHandle<B>,
    name: &str,
    mode: InterruptMode,
) -> Result<(), Error> {
    // Power-on feature bits unrelated to this driver are preserved.
    let power_on = bus.read_reg(Regs::IOCONA)?;
    let mut iocon = power_on;
    match mode {
        InterruptMode::Disabled => {}
        InterruptMode::Mirrored => {
            iocon |= IOCON_MIRROR | IOCON_INTPOL;
        }
        InterruptMode::BankAOnly | InterruptMode::BankBOnly | InterruptMode::BankAAndB => {
            iocon &= !IOCON_MIRROR;
            iocon |= IOCON_INTPOL;
        }
    }
    // Sequential register layout (BANK=0) is what `Regs` encodes. SEQOP=1
    // keeps the address pointer fixed per transaction, ODR=0 makes INTPOL
    // authoritative for the interrupt outputs.
    iocon &= !IOCON_BANK;
    iocon |= IOCON_SEQOP;
    iocon &= !IOCON_ODR;
    if iocon != power_on {
        log::debug!("{name}: updating IOCON 0x{power_on:02x} -> 0x{iocon:02x}");
        bus.write_reg(Regs::IOCONA, iocon)?;
    }

    // Drive every per-pin register to the reset state the shadow assumes.
    for bank in 0..2 {
        bus.write_reg(IODIR[bank], 0x00)?;
        bus.write_reg(IPOL[bank], 0x00)?;
        bus.write_reg(GPINTEN[bank], 0x00)?;
        bus.write_reg(DEFVAL[bank], 0x00)?;
        bus.write_reg(INTCON[bank], 0x00)?;
        bus.write_reg(GPPU[bank], 0x00)?;
        bus.write_reg(GPIO[bank], 0x00)?;
    }
    Ok(())
}

fn configure_input<B: RegisterBus>(
    state: &mut State<B>,
    mode: InterruptMode,
    bank: usize,
    bit: u8,
    pull: PullMode,
    trigger: Trigger,
) -> Result<(), Error> {
    state.shadow.set_bit(ShadowReg::Direction, bank, bit);
    state.flush(ShadowReg::Direction, bank)?;

    match pull {
        PullMode::Up => {
            state.shadow.set_bit(ShadowReg::PullUp, bank, bit);
            state.flush(ShadowReg::PullUp, bank)?;
        }
        PullMode::Down => {
            // This chip has no pull-down resistors.
            log::warn!("pull-down requested on a pin without pull-downs, ignoring");
        }
        PullMode::Off => {}
    }

    if mode != InterruptMode::Disabled {
        match trigger {
            Trigger::Rising => {
                state.shadow.clear_bit(ShadowReg::DefaultValue, bank, bit);
                state.shadow.set_bit(ShadowReg::IntCompare, bank, bit);
            }
            Trigger::Falling => {
                state.shadow.set_bit(ShadowReg::DefaultValue, bank, bit);
                state.shadow.set_bit(ShadowReg::IntCompare, bank, bit);
            }
            Trigger::Both => {
                state.shadow.clear_bit(ShadowReg::IntCompare, bank, bit);
            }
        }
        state.shadow.set_bit(ShadowReg::IntEnable, bank, bit);
        state.flush(ShadowReg::DefaultValue, bank)?;
        state.flush(ShadowReg::IntCompare, bank)?;
        state.flush(ShadowReg::IntEnable, bank)?;
    }
    Ok(())
}

fn configure_output<B: RegisterBus>(
    state: &mut State<B>,
    bank: usize,
    bit: u8,
    initial: bool,
) -> Result<(), Error> {
    state.shadow.clear_bit(ShadowReg::Direction, bank, bit);
    state.flush(ShadowReg::Direction, bank)?;
    write_output(state, bank, bit, initial)
}

/// Read-modify-write of the output latch, keeping the latch shadow in step.
///
/// Writes are byte-granular at the hardware boundary, so the whole latch byte
/// is rewritten for one bit.
fn write_output<B: RegisterBus>(
    state: &mut State<B>,
    bank: usize,
    bit: u8,
    value: bool,
) -> Result<(), Error> {
    let mask = 1u8 << bit;
    let (mask_set, mask_clear) = if value { (mask, 0) } else { (0, mask) };
    let latch = state.bus()?.update_reg(OLAT[bank], mask_set, mask_clear)?;
    state.shadow.set_value(ShadowReg::OutputLatch, bank, latch);
    Ok(())
}

/// Restore a pin's registers to the all-clear state, one flush per register.
///
/// Clearing an already-clear bit is a no-op but the flush still happens;
/// flushes are idempotent on hardware. All five registers are attempted even
/// if one flush fails, and the first failure is reported.
fn deconfigure_pin<B: RegisterBus>(state: &mut State<B>, bank: usize, bit: u8) -> Result<(), Error> {
    let mut result = Ok(());
    for reg in [
        ShadowReg::IntEnable,
        ShadowReg::DefaultValue,
        ShadowReg::IntCompare,
        ShadowReg::PullUp,
        ShadowReg::Direction,
    ] {
        state.shadow.clear_bit(reg, bank, bit);
        if let Err(err) = state.flush(reg, bank) {
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

impl<B: RegisterBus> Shared<B> {
    fn key(&self, pin: u8) -> DeviceKey {
        DeviceKey::new(self.class, self.controller, self.address, pin)
    }

    fn read_pin(&self, pin: u8) -> Result<bool, Error> {
        let (bank, bit) = check_pin(pin)?;
        let state = self.state.lock().unwrap();
        let byte = state.bus()?.read_reg(GPIO[bank])?;
        Ok(byte & (1 << bit) != 0)
    }

    fn write_pin(&self, pin: u8, value: bool) -> Result<(), Error> {
        let (bank, bit) = check_pin(pin)?;
        let mut state = self.state.lock().unwrap();
        state.bus()?;
        if state.shadow.is_bit_set(ShadowReg::Direction, bank, bit) {
            return Err(Error::WrongDirection { pin });
        }
        write_output(&mut state, bank, bit, value)
    }

    fn toggle_pin(&self, pin: u8) -> Result<(), Error> {
        let (bank, bit) = check_pin(pin)?;
        let mut state = self.state.lock().unwrap();
        state.bus()?;
        if state.shadow.is_bit_set(ShadowReg::Direction, bank, bit) {
            return Err(Error::WrongDirection { pin });
        }
        let value = !state.shadow.is_bit_set(ShadowReg::OutputLatch, bank, bit);
        write_output(&mut state, bank, bit, value)
    }

    fn is_pin_set(&self, pin: u8) -> Result<bool, Error> {
        let (bank, bit) = check_pin(pin)?;
        let state = self.state.lock().unwrap();
        state.bus()?;
        Ok(state.shadow.is_bit_set(ShadowReg::OutputLatch, bank, bit))
    }

    fn close_pin(&self, pin: u8) -> Result<(), Error> {
        let (bank, bit) = check_pin(pin)?;
        let mut state = self.state.lock().unwrap();
        if state.bus.is_none() {
            // Whole-device teardown already released this entry.
            self.registry.release(&self.key(pin));
            return Ok(());
        }
        let result = deconfigure_pin(&mut state, bank, bit);
        self.registry.release(&self.key(pin));
        log::debug!("{}: pin {pin} closed", self.name);
        result
    }

    fn shutdown(&self) -> Result<(), Error> {
        // Host lines are released outside the engine lock: a backend's
        // unsubscribe may block on an in-flight callback that needs the lock.
        let host = self.state.lock().unwrap().host.take();
        let mut result = Ok(());
        if let Some(mut host) = host {
            for line in wired_lines(self.interrupt_mode, self.int_a, self.int_b) {
                if let Err(err) = host.unsubscribe(line) {
                    log::warn!("{}: unsubscribing host line {line} failed: {err}", self.name);
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        if state.bus.is_none() {
            return result;
        }
        for entry in self.registry.drain() {
            let pin = entry.key().pin();
            let (bank, bit) = split_pin(pin);
            if let Err(err) = deconfigure_pin(&mut state, bank, bit) {
                log::warn!("{}: closing pin {pin} failed: {err}", self.name);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        state.bus = None;
        log::debug!("{}: closed", self.name);
        result
    }

    /// Demultiplex one edge notification from a host interrupt line.
    fn handle_interrupt(&self, event: InterruptEvent) {
        // Only the asserted edge of the physical line is meaningful; a false
        // value is a spurious or trailing notification.
        if !event.value {
            log::debug!(
                "{}: ignoring deasserted notification on line {}",
                self.name,
                event.pin
            );
            return;
        }
        let from_a = self.int_a == Some(event.pin);
        let from_b = self.int_b == Some(event.pin);
        if !from_a && !from_b {
            log::error!("{}: interrupt from unexpected line {}", self.name, event.pin);
            return;
        }

        let mut pending: Vec<(Arc<PinEntry>, InterruptEvent)> = Vec::new();
        {
            let state = self.state.lock().unwrap();
            let bus = match state.bus.as_ref() {
                Some(bus) => bus,
                // Mid-teardown; the capture registers are gone with the bus.
                None => return,
            };

            let banks = match self.interrupt_mode {
                InterruptMode::Disabled => return,
                InterruptMode::Mirrored => [true, true],
                InterruptMode::BankAOnly => [true, false],
                InterruptMode::BankBOnly => [false, true],
                InterruptMode::BankAAndB => [from_a, from_b],
            };

            for bank in 0..2 {
                if !banks[bank] {
                    continue;
                }
                let (flags, capture) = match read_interrupt_state(bus, bank) {
                    Ok(v) => v,
                    Err(err) => {
                        log::error!(
                            "{}: reading interrupt state of bank {bank} failed: {err}",
                            self.name
                        );
                        return;
                    }
                };
                log::debug!(
                    "{}: bank {bank} interrupt flags 0x{flags:02x} capture 0x{capture:02x}",
                    self.name
                );
                for bit in 0..PINS_PER_BANK {
                    if flags & (1 << bit) == 0 {
                        continue;
                    }
                    let pin = bank as u8 * PINS_PER_BANK + bit;
                    let value = capture & (1 << bit) != 0;
                    if let Some(entry) = self.registry.lookup(&self.key(pin)) {
                        if entry.mode() == DeviceMode::DigitalInput {
                            pending.push((
                                entry,
                                InterruptEvent {
                                    pin,
                                    value,
                                    timestamp: event.timestamp,
                                },
                            ));
                        }
                    }
                }
            }
        }
        // Listeners run after the engine lock is released, in ascending pin
        // order, so they may call back into the engine.
        for (entry, event) in pending {
            entry.notify(event);
        }
    }
}

fn read_interrupt_state<B: RegisterBus>(
    bus: &BusHandle<B>,
    bank: usize,
) -> Result<(u8, u8), Error> {
    let flags = bus.read_reg(INTF[bank])?;
    let capture = bus.read_reg(INTCAP[bank])?;
    Ok((flags, capture))
}

impl<B: RegisterBus + Send + 'static> PortDriver for Shared<B> {
    fn read_pin(&self, pin: u8) -> Result<bool, Error> {
        Shared::read_pin(self, pin)
    }

    fn write_pin(&self, pin: u8, value: bool) -> Result<(), Error> {
        Shared::write_pin(self, pin, value)
    }

    fn toggle_pin(&self, pin: u8) -> Result<(), Error> {
        Shared::toggle_pin(self, pin)
    }

    fn is_pin_set(&self, pin: u8) -> Result<bool, Error> {
        Shared::is_pin_set(self, pin)
    }

    fn close_pin(&self, pin: u8) -> Result<(), Error> {
        Shared::close_pin(self, pin)
    }
}

// Newtype wrappers supply the interface-specific register framing; the SPI
// variant prefixes every transfer with a control byte.
pub struct Mcp23017Bus<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C: crate::I2cBus> Mcp23017Bus<I2C> {
    pub fn new(i2c: I2C, a0: bool, a1: bool, a2: bool) -> Self {
        let address = BASE_ADDR | ((a2 as u8) << 2) | ((a1 as u8) << 1) | (a0 as u8);
        Self { i2c, address }
    }
}

impl<I2C: crate::I2cBus> RegisterBus for Mcp23017Bus<I2C> {
    fn class(&self) -> &'static str {
        "mcp23017"
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, TransportError> {
        let mut buf = [0x00];
        self.i2c
            .write_read(self.address, &[reg], &mut buf)
            .map_err(|err| TransportError::I2c(err.kind()))?;
        Ok(buf[0])
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), TransportError> {
        self.i2c
            .write(self.address, &[reg, value])
            .map_err(|err| TransportError::I2c(err.kind()))
    }

    fn read_block(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), TransportError> {
        self.i2c
            .write_read(self.address, &[reg], buf)
            .map_err(|err| TransportError::I2c(err.kind()))
    }

    fn write_block(&mut self, reg: u8, data: &[u8]) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(reg);
        frame.extend_from_slice(data);
        self.i2c
            .write(self.address, &frame)
            .map_err(|err| TransportError::I2c(err.kind()))
    }

    /// An empty write tests for the address acknowledge.
    fn probe(&mut self) -> bool {
        self.i2c.write(self.address, &[]).is_ok()
    }
}

pub struct Mcp23S17Bus<SPI> {
    spi: SPI,
    address: u8,
}

impl<SPI: crate::SpiBus> Mcp23S17Bus<SPI> {
    pub fn new(spi: SPI, a0: bool, a1: bool, a2: bool) -> Self {
        let address = BASE_ADDR | ((a2 as u8) << 2) | ((a1 as u8) << 1) | (a0 as u8);
        Self { spi, address }
    }

    /// Control byte `0100 A2 A1 A0 R/W`.
    fn control(&self, read: bool) -> u8 {
        0x40 | self.address << 1 | read as u8
    }
}

impl<SPI: crate::SpiBus> RegisterBus for Mcp23S17Bus<SPI> {
    fn class(&self) -> &'static str {
        "mcp23s17"
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, TransportError> {
        let mut val = [0x00];
        let header = [self.control(true), reg];
        let mut tx = [
            embedded_hal::spi::Operation::Write(&header),
            embedded_hal::spi::Operation::Read(&mut val),
        ];
        self.spi
            .transaction(&mut tx)
            .map_err(|err| TransportError::Spi(err.kind()))?;
        Ok(val[0])
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), TransportError> {
        self.spi
            .write(&[self.control(false), reg, value])
            .map_err(|err| TransportError::Spi(err.kind()))
    }

    fn read_block(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), TransportError> {
        let header = [self.control(true), reg];
        let mut tx = [
            embedded_hal::spi::Operation::Write(&header),
            embedded_hal::spi::Operation::Read(buf),
        ];
        self.spi
            .transaction(&mut tx)
            .map_err(|err| TransportError::Spi(err.kind()))
    }

    fn write_block(&mut self, reg: u8, data: &[u8]) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(data.len() + 2);
        frame.push(self.control(false));
        frame.push(reg);
        frame.extend_from_slice(data);
        self.spi
            .write(&frame)
            .map_err(|err| TransportError::Spi(err.kind()))
    }

    /// SPI has no acknowledge, so probing falls back to a register read.
    fn probe(&mut self) -> bool {
        self.read_reg(Regs::IODIRA.into()).is_ok()
    }
}
