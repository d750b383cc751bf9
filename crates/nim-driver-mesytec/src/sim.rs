//! Line-level emulators of the MSCF-16 and MHV-4.
//!
//! Each emulator runs as a task on the device side of a [`mock_serial`] pair and answers
//! frames the way the real module does: echo, body lines, prompt. State is kept so that
//! read-backs and `DS` listings reflect earlier writes.
//!
//! The [`SimControl`] handle lets tests and the simulated bench misbehave on purpose:
//! slow replies, swallow or garble frames, or pull the cable.

use nim_core::mock_serial::{self, MockDeviceHarness, MockSerialPort, WireLog};
use nim_core::Family;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Body of a rejected frame.
const ERROR_LINE: &str = "ERROR: invalid command or argument";

/// Module behaviour behind the line protocol.
pub trait Emulator: Send + 'static {
    /// Prompt printed after every reply.
    fn prompt(&self) -> &'static str;

    /// Body lines answering `frame`.
    fn respond(&mut self, frame: &str) -> Vec<String>;
}

/// Remote handle on a running emulator.
#[derive(Debug, Clone)]
pub struct SimControl {
    unplug: Arc<watch::Sender<bool>>,
    delay: Arc<Mutex<Duration>>,
    silent: Arc<AtomicBool>,
    garbled: Arc<AtomicBool>,
    wire: WireLog,
}

impl SimControl {
    /// Drop the device side of the line. The host sees EOF on its next read.
    pub fn unplug(&self) {
        self.unplug.send_replace(true);
    }

    /// Whether [`SimControl::unplug`] was called.
    pub fn is_unplugged(&self) -> bool {
        *self.unplug.borrow()
    }

    /// Delay between the echo and the rest of each reply.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// When silent, frames are consumed but never answered.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// When garbled, each reply echoes a corrupted copy of the request.
    pub fn set_garbled(&self, garbled: bool) {
        self.garbled.store(garbled, Ordering::SeqCst);
    }

    /// Host-side record of the line.
    pub fn wire_log(&self) -> WireLog {
        self.wire.clone()
    }
}

/// Start an emulator for `family` and return the host end of its line.
pub fn spawn(family: Family) -> (MockSerialPort, SimControl) {
    match family {
        Family::Mscf16 => spawn_emulator(Mscf16Sim::default()),
        Family::Mhv4 => spawn_emulator(Mhv4Sim::default()),
    }
}

/// Start `emulator` on a fresh mock line.
pub fn spawn_emulator<E: Emulator>(emulator: E) -> (MockSerialPort, SimControl) {
    let (port, harness) = mock_serial::new();
    let (unplug_tx, unplug_rx) = watch::channel(false);
    let control = SimControl {
        unplug: Arc::new(unplug_tx),
        delay: Arc::new(Mutex::new(Duration::ZERO)),
        silent: Arc::new(AtomicBool::new(false)),
        garbled: Arc::new(AtomicBool::new(false)),
        wire: harness.wire_log(),
    };
    tokio::spawn(run(harness, emulator, control.clone(), unplug_rx));
    (port, control)
}

async fn run<E: Emulator>(
    mut harness: MockDeviceHarness,
    mut emulator: E,
    control: SimControl,
    mut unplug: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            () = unplugged(&mut unplug) => break,
            frame = harness.next_frame() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        trace!(frame = %frame, "emulator received");
        if control.silent.load(Ordering::SeqCst) || frame.is_empty() {
            continue;
        }

        let echo = if control.garbled.load(Ordering::SeqCst) {
            format!("~{frame}")
        } else {
            frame.clone()
        };
        if harness.send_response(format!("{echo}\r\n").as_bytes()).is_err() {
            break;
        }
        let delay = *control.delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                () = unplugged(&mut unplug) => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        let mut rest = String::new();
        for line in emulator.respond(&frame) {
            rest.push_str(&line);
            rest.push_str("\r\n");
        }
        rest.push_str(emulator.prompt());
        if harness.send_response(rest.as_bytes()).is_err() {
            break;
        }
    }
    debug!("emulator stopped");
}

/// Resolves once the cable is pulled. Dropping every control handle is not an unplug.
async fn unplugged(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn args(frame: &str) -> (String, Vec<&str>) {
    let mut tokens = frame.split_whitespace();
    let mnemonic = tokens.next().unwrap_or_default().to_ascii_uppercase();
    (mnemonic, tokens.collect())
}

fn int_arg(args: &[&str], i: usize, min: i64, max: i64) -> Option<i64> {
    args.get(i)
        .and_then(|a| a.parse::<i64>().ok())
        .filter(|v| (min..=max).contains(v))
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn list(values: &[i64], common: i64) -> String {
    let mut out: Vec<String> = values.iter().map(i64::to_string).collect();
    out.push(format!("c:{common}"));
    out.join(" ")
}

/// One settings memory (front panel or remote control) of the MSCF-16.
#[derive(Debug, Clone, PartialEq)]
struct Memory {
    gains: [i64; 4],
    gain_common: i64,
    thresholds: [i64; 16],
    threshold_common: i64,
    pz: [i64; 16],
    pz_common: i64,
    shaping_times: [i64; 4],
    shaping_time_common: i64,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            gains: [0; 4],
            gain_common: 0,
            thresholds: [128; 16],
            threshold_common: 128,
            pz: [100; 16],
            pz_common: 100,
            shaping_times: [1; 4],
            shaping_time_common: 1,
        }
    }
}

impl Memory {
    fn listing(&self, out: &mut Vec<String>) {
        out.push(format!("gains: {}", list(&self.gains, self.gain_common)));
        out.push(format!(
            "threshs: {}",
            list(&self.thresholds, self.threshold_common)
        ));
        out.push(format!("pz: {}", list(&self.pz, self.pz_common)));
        out.push(format!(
            "shts: {}",
            list(&self.shaping_times, self.shaping_time_common)
        ));
    }
}

/// Sets `bank[index - 1]`, or every member and `common` when `index` is the broadcast index.
fn set_banked(bank: &mut [i64], common: &mut i64, index: i64, value: i64) -> bool {
    let broadcast = bank.len() as i64 + 1;
    if index == broadcast {
        bank.iter_mut().for_each(|v| *v = value);
        *common = value;
        return true;
    }
    match usize::try_from(index - 1).ok().and_then(|i| bank.get_mut(i)) {
        Some(slot) => {
            *slot = value;
            true
        }
        None => false,
    }
}

/// MSCF-16 emulator. Writes land in the remote control memory.
#[derive(Debug, Clone)]
pub struct Mscf16Sim {
    panel: Memory,
    rc: Memory,
    monitor: i64,
    multiplicity: (i64, i64),
    coincidence_time: i64,
    shaper_offset: i64,
    threshold_offset: i64,
    blr_threshold: i64,
    timing_filter: i64,
    single_mode: bool,
    ecl_delay: bool,
    blr_active: bool,
    rc_mode: bool,
    /// Reported software version.
    pub software_version: String,
}

impl Default for Mscf16Sim {
    fn default() -> Self {
        Self {
            panel: Memory::default(),
            rc: Memory::default(),
            monitor: 1,
            multiplicity: (9, 1),
            coincidence_time: 128,
            shaper_offset: 100,
            threshold_offset: 100,
            blr_threshold: 10,
            timing_filter: 0,
            single_mode: false,
            ecl_delay: false,
            blr_active: true,
            rc_mode: true,
            software_version: "5.3".to_string(),
        }
    }
}

impl Mscf16Sim {
    fn display_setup(&self) -> Vec<String> {
        let mut out = vec!["MSCF-16 Panel settings:".to_string()];
        self.panel.listing(&mut out);
        out.push("MSCF-16 rc settings:".to_string());
        self.rc.listing(&mut out);
        out.push(format!("mult: {} {}", self.multiplicity.0, self.multiplicity.1));
        out.push(format!("monitor: {}", self.monitor));
        out.push(format!("ECL delay: {}", on_off(self.ecl_delay)));
        out.push(format!("TF int: {}", self.timing_filter));
        out.push(format!(
            "BLR {}",
            if self.blr_active { "active" } else { "inactive" }
        ));
        out.push(if self.single_mode { "single mode" } else { "common mode" }.to_string());
        out.push(format!("rc {}", on_off(self.rc_mode)));
        out.push("MSCF-16 general settings:".to_string());
        out.push(format!("BLR thresh: {}", self.blr_threshold));
        out.push(format!("Coincidence time: {}", self.coincidence_time));
        out.push("Sum discr thresh: 0".to_string());
        out.push(format!("Shaper offset: {}", self.shaper_offset));
        out.push(format!("Threshold offset: {}", self.threshold_offset));
        out.push(format!("MSCF-16 software version: {}", self.software_version));
        out.push("MSCF-16 firmware version: 2.1".to_string());
        out
    }

    fn apply(&mut self, mnemonic: &str, a: &[&str]) -> Option<Vec<String>> {
        let ok = Some(Vec::new());
        match mnemonic {
            "ST" | "SP" => {
                let (index, value) = (int_arg(a, 0, 1, 17)?, int_arg(a, 1, 0, 255)?);
                let rc = &mut self.rc;
                let done = if mnemonic == "ST" {
                    set_banked(&mut rc.thresholds, &mut rc.threshold_common, index, value)
                } else {
                    set_banked(&mut rc.pz, &mut rc.pz_common, index, value)
                };
                done.then(Vec::new)
            }
            "SS" | "SG" => {
                let (index, value) = (int_arg(a, 0, 1, 5)?, int_arg(a, 1, 0, 15)?);
                let rc = &mut self.rc;
                let done = if mnemonic == "SS" {
                    set_banked(&mut rc.shaping_times, &mut rc.shaping_time_common, index, value)
                } else {
                    set_banked(&mut rc.gains, &mut rc.gain_common, index, value)
                };
                done.then(Vec::new)
            }
            "MC" => {
                self.monitor = int_arg(a, 0, 1, 16)?;
                ok
            }
            "AP" => match a.first() {
                None => ok,
                Some(_) => int_arg(a, 0, 1, 17).map(|_| Vec::new()),
            },
            "SC" => {
                self.coincidence_time = int_arg(a, 0, 0, 255)?;
                ok
            }
            "SSO" => {
                self.shaper_offset = int_arg(a, 0, 0, 200)?;
                ok
            }
            "STO" => {
                self.threshold_offset = int_arg(a, 0, 0, 200)?;
                ok
            }
            "SBT" => {
                self.blr_threshold = int_arg(a, 0, 0, 255)?;
                ok
            }
            "SF" => {
                self.timing_filter = int_arg(a, 0, 0, 3)?;
                ok
            }
            "SM" => {
                self.multiplicity = (int_arg(a, 0, 1, 9)?, int_arg(a, 1, 1, 8)?);
                ok
            }
            "SI" => {
                self.single_mode = int_arg(a, 0, 0, 1)? == 1;
                ok
            }
            "SE" => {
                self.ecl_delay = int_arg(a, 0, 0, 1)? == 1;
                ok
            }
            "SBL" => {
                self.blr_active = int_arg(a, 0, 0, 1)? == 1;
                ok
            }
            "ON" => {
                self.rc_mode = true;
                ok
            }
            "OFF" => {
                self.rc_mode = false;
                ok
            }
            "CPY" => match a.first().map(|s| s.to_ascii_uppercase()).as_deref() {
                Some("F") => {
                    self.rc = self.panel.clone();
                    ok
                }
                Some("R") => {
                    self.panel = self.rc.clone();
                    ok
                }
                _ => None,
            },
            "V" => Some(vec![
                format!("Software version: {}", self.software_version),
                "Hardware version: 2.1".to_string(),
            ]),
            "DS" => Some(self.display_setup()),
            _ => None,
        }
    }
}

impl Emulator for Mscf16Sim {
    fn prompt(&self) -> &'static str {
        "mscf>"
    }

    fn respond(&mut self, frame: &str) -> Vec<String> {
        let (mnemonic, a) = args(frame);
        self.apply(&mnemonic, &a)
            .unwrap_or_else(|| vec![ERROR_LINE.to_string()])
    }
}

#[derive(Debug, Clone, PartialEq)]
struct HvChannel {
    preset: f64,
    limit: f64,
    current_limit_na: i64,
    positive: bool,
    on: bool,
    auto_shutdown: bool,
    sensor: Option<u8>,
    ref_temp: f64,
    slope: i64,
}

impl Default for HvChannel {
    fn default() -> Self {
        Self {
            preset: 0.0,
            limit: 800.0,
            current_limit_na: 20000,
            positive: true,
            on: false,
            auto_shutdown: false,
            sensor: None,
            ref_temp: 25.0,
            slope: 0,
        }
    }
}

impl HvChannel {
    fn output_voltage(&self) -> f64 {
        if self.on {
            self.preset.min(self.limit)
        } else {
            0.0
        }
    }
}

/// MHV-4 emulator. Output follows the preset immediately while switched on; the
/// simulated load draws 1 nA per volt.
#[derive(Debug, Clone, Default)]
pub struct Mhv4Sim {
    channels: [HvChannel; 4],
    ramp_index: usize,
}

impl Mhv4Sim {
    fn channel(&mut self, arg: Option<&&str>) -> Option<&mut HvChannel> {
        let index: usize = arg?.parse().ok()?;
        self.channels.get_mut(index)
    }

    fn switch(&mut self, arg: Option<&&str>, on: bool) -> Option<Vec<String>> {
        if arg.is_some_and(|a| a.eq_ignore_ascii_case("a")) {
            self.channels.iter_mut().for_each(|c| c.on = on);
        } else {
            self.channel(arg)?.on = on;
        }
        Some(Vec::new())
    }

    fn apply(&mut self, mnemonic: &str, a: &[&str]) -> Option<Vec<String>> {
        let index = a.first().copied().unwrap_or_default();
        match mnemonic {
            "ON" => self.switch(a.first(), true),
            "OFF" => self.switch(a.first(), false),
            "SU" => {
                let v = int_arg(a, 1, 0, 8000)?;
                self.channel(a.first())?.preset = v as f64 / 10.0;
                Some(Vec::new())
            }
            "SUL" => {
                let v = int_arg(a, 1, 0, 8000)?;
                self.channel(a.first())?.limit = v as f64 / 10.0;
                Some(Vec::new())
            }
            "SIL" => {
                let v = int_arg(a, 1, 0, 20000)?;
                self.channel(a.first())?.current_limit_na = v;
                Some(Vec::new())
            }
            "SP" => {
                let positive = match a.get(1).map(|s| s.to_ascii_lowercase()).as_deref() {
                    Some("p") => true,
                    Some("n") => false,
                    _ => return None,
                };
                let ch = self.channel(a.first())?;
                ch.on = false;
                ch.preset = 0.0;
                ch.positive = positive;
                Some(Vec::new())
            }
            "AS" => {
                let v = int_arg(a, 1, 0, 1)?;
                self.channel(a.first())?.auto_shutdown = v == 1;
                Some(Vec::new())
            }
            "STC" => {
                let sensor = match a.get(1).copied() {
                    Some("-") => None,
                    _ => Some(u8::try_from(int_arg(a, 1, 0, 3)?).ok()?),
                };
                self.channel(a.first())?.sensor = sensor;
                Some(Vec::new())
            }
            "STO" => {
                let t = int_arg(a, 1, -500, 1500)?;
                self.channel(a.first())?.ref_temp = t as f64 / 10.0;
                Some(Vec::new())
            }
            "STS" => {
                let s = int_arg(a, 1, -10000, 10000)?;
                self.channel(a.first())?.slope = s;
                Some(Vec::new())
            }
            "SRA" => {
                self.ramp_index = usize::try_from(int_arg(a, 0, 0, 3)?).ok()?;
                Some(Vec::new())
            }
            "RU" => {
                let ch = self.channel(a.first())?;
                let sign = if ch.positive { 1.0 } else { -1.0 };
                Some(vec![format!(
                    "chan {index}: {:.1} V",
                    sign * ch.output_voltage()
                )])
            }
            "RI" => {
                let ch = self.channel(a.first())?;
                Some(vec![format!(
                    "chan {index}: {:.3} uA",
                    ch.output_voltage() / 1000.0
                )])
            }
            "RUP" => {
                let ch = self.channel(a.first())?;
                Some(vec![format!("chan {index} preset: {:.1} V", ch.preset)])
            }
            "RUL" => {
                let ch = self.channel(a.first())?;
                Some(vec![format!("chan {index} limit: {:.1} V", ch.limit)])
            }
            "RIL" => {
                let ch = self.channel(a.first())?;
                Some(vec![format!(
                    "chan {index} current limit: {} nA",
                    ch.current_limit_na
                )])
            }
            "RP" => {
                let ch = self.channel(a.first())?;
                let word = if ch.positive { "positive" } else { "negative" };
                Some(vec![format!("chan {index} polarity: {word}")])
            }
            "RTC" => {
                let ch = self.channel(a.first())?;
                let sensor = ch.sensor.map_or_else(|| "off".to_string(), |s| s.to_string());
                Some(vec![format!(
                    "chan {index}: TC sensor: {sensor}, Tref: {:.1} C, slope: {} mV/C",
                    ch.ref_temp, ch.slope
                )])
            }
            "RT" => {
                int_arg(a, 0, 0, 3)?;
                Some(vec![format!("temperature {index}: 23.5 C")])
            }
            "RRA" => {
                let speed = crate::mhv4::RAMP_SPEEDS.get(self.ramp_index)?;
                Some(vec![format!("ramp speed: {speed} V/s")])
            }
            _ => None,
        }
    }
}

impl Emulator for Mhv4Sim {
    fn prompt(&self) -> &'static str {
        "mhv4>"
    }

    fn respond(&mut self, frame: &str) -> Vec<String> {
        let (mnemonic, a) = args(frame);
        self.apply(&mnemonic, &a)
            .unwrap_or_else(|| vec![ERROR_LINE.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mscf16_setup::SetupListing;
    use crate::{Mhv4Driver, Mscf16Driver};
    use nim_core::{Command, DeviceDriver, ParamKey, ParamUpdate, ParamValue, Reply};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// One request/response over the mock line.
    async fn ask(port: &mut MockSerialPort, frame: &str) -> Reply {
        port.write_all(format!("{frame}\r").as_bytes()).await.unwrap();
        let mut raw = String::new();
        let mut buf = [0u8; 256];
        while !Reply::is_complete(&raw) {
            let n = port.read(&mut buf).await.unwrap();
            assert!(n > 0, "emulator hung up");
            raw.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        Reply::parse(frame, &raw).unwrap()
    }

    #[test]
    fn mscf16_listing_round_trips_through_parser() {
        let mut sim = Mscf16Sim::default();
        sim.respond("ST 17 42");
        sim.respond("SG 2 7");
        sim.respond("SM 4 2");
        let listing = SetupListing::parse(sim.respond("DS").as_slice());
        let updates = listing.updates();
        assert!(updates.contains(&ParamUpdate::new(
            ParamKey::channel("rc_threshold", 16),
            42i64
        )));
        assert!(updates.contains(&ParamUpdate::new(ParamKey::group("rc_gain", 2), 7i64)));
        assert!(updates.contains(&ParamUpdate::new(
            ParamKey::global("multiplicity"),
            ParamValue::Borders { hi: 4, lo: 2 }
        )));
        assert!(updates.contains(&ParamUpdate::new(ParamKey::global("version"), "5.3")));
        // panel memory untouched until copied
        assert!(updates.contains(&ParamUpdate::new(ParamKey::channel("threshold", 1), 128i64)));

        sim.respond("CPY R");
        let updates = SetupListing::parse(sim.respond("DS").as_slice()).updates();
        assert!(updates.contains(&ParamUpdate::new(ParamKey::channel("threshold", 1), 42i64)));
    }

    #[test]
    fn mscf16_rejects_bad_arguments() {
        let mut sim = Mscf16Sim::default();
        assert_eq!(sim.respond("ST 5 300"), vec![ERROR_LINE.to_string()]);
        assert_eq!(sim.respond("XYZ"), vec![ERROR_LINE.to_string()]);
        assert!(sim.respond("ST 5 200").is_empty());
    }

    #[tokio::test]
    async fn mscf16_version_over_the_line() {
        let (mut port, _control) = spawn(Family::Mscf16);
        let reply = ask(&mut port, "V").await;
        let outcome = Mscf16Driver
            .decode(&Command::new("get_version"), &[reply])
            .unwrap();
        assert_eq!(
            outcome.updates[0],
            ParamUpdate::new(ParamKey::global("version"), "5.3")
        );
    }

    #[tokio::test]
    async fn mhv4_readback_matches_driver_parsers() {
        let (mut port, _control) = spawn(Family::Mhv4);
        ask(&mut port, "SU 1 1205").await;
        ask(&mut port, "ON 1").await;

        let cmd = Mhv4Driver.telemetry_command().unwrap();
        let mut replies = Vec::new();
        for frame in Mhv4Driver.encode(&cmd).unwrap() {
            replies.push(ask(&mut port, &frame).await);
        }
        let outcome = Mhv4Driver.decode(&cmd, &replies).unwrap();
        assert_eq!(outcome.readings["voltage_1"], 120.5);
        assert_eq!(outcome.readings["voltage_0"], 0.0);
        assert!((outcome.readings["current_1"] - 0.1205).abs() < 1e-3);

        let mut initial = Vec::new();
        for cmd in Mhv4Driver.initial_reads() {
            let frames = Mhv4Driver.encode(&cmd).unwrap();
            let mut replies = Vec::new();
            for frame in &frames {
                replies.push(ask(&mut port, frame).await);
            }
            initial.extend(Mhv4Driver.decode(&cmd, &replies).unwrap().updates);
        }
        assert!(initial.contains(&ParamUpdate::new(
            ParamKey::channel("voltage_preset", 1),
            120.5
        )));
        assert!(initial.contains(&ParamUpdate::new(ParamKey::channel("ntc", 3), 0i64)));
        assert!(initial.contains(&ParamUpdate::new(
            ParamKey::channel("current_limit", 0),
            20.0
        )));
        assert!(initial.contains(&ParamUpdate::new(ParamKey::global("ramp_speed"), 0i64)));
    }

    #[tokio::test]
    async fn unplug_reads_eof_and_logs_writes() {
        let (mut port, control) = spawn(Family::Mscf16);
        ask(&mut port, "DS").await;
        assert_eq!(control.wire_log().writes(), vec!["DS\r".to_string()]);

        control.unplug();
        assert!(control.is_unplugged());
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), port.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
