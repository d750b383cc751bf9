//! Mesytec MHV-4 four-channel high-voltage supply driver
//!
//! Protocol Overview:
//! - Format: ASCII `MNEMONIC channel [value]\r`, module echoes, prints a body, ends with a prompt
//! - Channels 0-3; `a` (or 4 from clients) addresses all channels for `ON`/`OFF`
//! - Values on the wire are fixed point: 0.1 V, nA, 0.1 °C
//!
//! Clients speak gateway units (V, µA, °C). Conversion happens here so the rest of the
//! gateway never sees wire units.
//!
//! Reply parsing follows the module's free-text answers: the last numeric token carries
//! the value. Voltage readings above 800 are tenths of a volt, current readings above 100
//! are nanoamps.

use nim_core::driver::expect_replies;
use nim_core::{
    Command, DeviceDriver, Family, NimError, NimResult, Outcome, ParamKey, ParamReader,
    ParamUpdate, Readings, Reply, Target,
};
use std::ops::RangeInclusive;

/// Output channels.
pub const CHANNELS: RangeInclusive<u8> = 0..=3;
/// Client-side index addressing every channel.
pub const ALL_CHANNELS: u8 = 4;
/// Ramp speeds in V/s, indexed by `SRA` argument.
pub const RAMP_SPEEDS: [i64; 4] = [5, 25, 100, 500];
/// Maximum output voltage in V.
pub const MAX_VOLTAGE: f64 = 800.0;
/// Maximum current limit in µA.
pub const MAX_CURRENT_LIMIT: f64 = 20.0;

/// Read-back commands that address one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readback {
    Voltage,
    Current,
    VoltagePreset,
    VoltageLimit,
    CurrentLimit,
    Polarity,
    TemperatureCompensation,
    Temperature,
}

impl Readback {
    fn mnemonic(self) -> &'static str {
        match self {
            Readback::Voltage => "RU",
            Readback::Current => "RI",
            Readback::VoltagePreset => "RUP",
            Readback::VoltageLimit => "RUL",
            Readback::CurrentLimit => "RIL",
            Readback::Polarity => "RP",
            Readback::TemperatureCompensation => "RTC",
            Readback::Temperature => "RT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Output(Target, bool),
    Voltage(u8, f64),
    VoltageLimit(u8, f64),
    CurrentLimit(u8, f64),
    Polarity(u8, Polarity),
    AutoShutdown(u8, bool),
    TemperatureCompensation(u8, Option<u8>),
    ReferenceTemperature(u8, f64),
    TemperatureSlope(u8, i64),
    RampSpeed(i64),
    Read(Readback, u8),
    ReadRampSpeed,
    ReadReadings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    fn letter(self) -> &'static str {
        match self {
            Polarity::Positive => "p",
            Polarity::Negative => "n",
        }
    }

    fn parse(raw: &str) -> NimResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "p" | "+" | "1" | "positive" => Ok(Polarity::Positive),
            "n" | "-" | "0" | "negative" => Ok(Polarity::Negative),
            other => Err(NimError::Validation(format!(
                "polarity must be p or n, got '{other}'"
            ))),
        }
    }
}

fn channel(p: &ParamReader<'_>) -> NimResult<u8> {
    match p.target("channel", CHANNELS, None)? {
        Target::Single(c) => Ok(c),
        Target::All => Err(NimError::Validation(
            "channel must be a single channel 0-3".into(),
        )),
    }
}

fn ntc_sensor(p: &ParamReader<'_>) -> NimResult<Option<u8>> {
    if p.is_absent("ntc_channel") {
        return Ok(None);
    }
    let raw = p.text("ntc_channel")?.to_ascii_lowercase();
    if matches!(raw.as_str(), "-" | "off" | "none" | "4") {
        return Ok(None);
    }
    match raw.parse::<u8>() {
        Ok(n) if CHANNELS.contains(&n) => Ok(Some(n)),
        _ => Err(NimError::out_of_range("ntc_channel", 0, 3)),
    }
}

/// Fixed-point wire value, e.g. 120.5 V -> 1205.
fn to_wire(value: f64, scale: f64) -> i64 {
    (value * scale).round() as i64
}

impl Op {
    fn parse(command: &Command) -> NimResult<Self> {
        let p = command.params();
        let op = match command.op.as_str() {
            "turn_on" | "turn_off" => Op::Output(
                p.target("channel", CHANNELS, Some(ALL_CHANNELS))?,
                command.op == "turn_on",
            ),
            "set_voltage" => Op::Voltage(channel(&p)?, p.float("voltage", 0.0, MAX_VOLTAGE)?),
            "set_voltage_limit" => Op::VoltageLimit(
                channel(&p)?,
                p.float("voltage_limit", 0.0, MAX_VOLTAGE)?,
            ),
            "set_current_limit" => Op::CurrentLimit(
                channel(&p)?,
                p.float("current_limit", 0.0, MAX_CURRENT_LIMIT)?,
            ),
            "set_polarity" => Op::Polarity(channel(&p)?, Polarity::parse(&p.text("polarity")?)?),
            "set_auto_shutdown" => Op::AutoShutdown(channel(&p)?, p.flag("enable")?),
            "set_temperature_compensation" => {
                Op::TemperatureCompensation(channel(&p)?, ntc_sensor(&p)?)
            }
            "set_reference_temperature" => Op::ReferenceTemperature(
                channel(&p)?,
                p.float("temperature", -50.0, 150.0)?,
            ),
            "set_temperature_slope" => {
                Op::TemperatureSlope(channel(&p)?, p.int("slope", -10000, 10000)?)
            }
            "set_ramp_speed" => Op::RampSpeed(p.int("ramp_speed_index", 0, 3)?),
            "read_voltage" => Op::Read(Readback::Voltage, channel(&p)?),
            "read_current" => Op::Read(Readback::Current, channel(&p)?),
            "read_voltage_preset" => Op::Read(Readback::VoltagePreset, channel(&p)?),
            "read_voltage_limit" => Op::Read(Readback::VoltageLimit, channel(&p)?),
            "read_current_limit" => Op::Read(Readback::CurrentLimit, channel(&p)?),
            "read_polarity" => Op::Read(Readback::Polarity, channel(&p)?),
            "read_temperature_compensation" => {
                Op::Read(Readback::TemperatureCompensation, channel(&p)?)
            }
            "read_temperature" => Op::Read(Readback::Temperature, channel(&p)?),
            "read_ramp_speed" => Op::ReadRampSpeed,
            "read_readings" => Op::ReadReadings,
            other => return Err(NimError::UnknownCommand(other.to_string())),
        };
        Ok(op)
    }

    fn frames(&self) -> Vec<String> {
        match self {
            Op::Output(target, on) => {
                let verb = if *on { "ON" } else { "OFF" };
                match target {
                    Target::Single(c) => vec![format!("{verb} {c}")],
                    Target::All => vec![format!("{verb} a")],
                }
            }
            Op::Voltage(c, v) => vec![format!("SU {c} {:04}", to_wire(*v, 10.0))],
            Op::VoltageLimit(c, v) => vec![format!("SUL {c} {:04}", to_wire(*v, 10.0))],
            Op::CurrentLimit(c, v) => vec![format!("SIL {c} {:05}", to_wire(*v, 1000.0))],
            Op::Polarity(c, pol) => vec![format!("SP {c} {}", pol.letter())],
            Op::AutoShutdown(c, on) => vec![format!("AS {c} {}", u8::from(*on))],
            Op::TemperatureCompensation(c, Some(n)) => vec![format!("STC {c} {n}")],
            Op::TemperatureCompensation(c, None) => vec![format!("STC {c} -")],
            Op::ReferenceTemperature(c, t) => vec![format!("STO {c} {:03}", to_wire(*t, 10.0))],
            Op::TemperatureSlope(c, s) => vec![format!("STS {c} {s:04}")],
            Op::RampSpeed(i) => vec![format!("SRA {i}")],
            Op::Read(kind, c) => vec![format!("{} {c}", kind.mnemonic())],
            Op::ReadRampSpeed => vec!["RRA".to_string()],
            Op::ReadReadings => CHANNELS
                .flat_map(|c| [format!("RU {c}"), format!("RI {c}")])
                .collect(),
        }
    }

    fn decode(&self, replies: &[Reply]) -> NimResult<Outcome> {
        let ch = ParamKey::channel;
        let outcome = match self {
            Op::Output(target, on) => Outcome::updates(
                target
                    .members(CHANNELS)
                    .into_iter()
                    .map(|c| ParamUpdate::new(ch("output", c), *on))
                    .collect(),
            ),
            Op::Voltage(c, v) => Outcome::updates(vec![ParamUpdate::new(ch("voltage_preset", *c), *v)]),
            Op::VoltageLimit(c, v) => {
                Outcome::updates(vec![ParamUpdate::new(ch("voltage_limit", *c), *v)])
            }
            Op::CurrentLimit(c, v) => {
                Outcome::updates(vec![ParamUpdate::new(ch("current_limit", *c), *v)])
            }
            Op::Polarity(c, pol) => {
                Outcome::updates(vec![ParamUpdate::new(ch("polarity", *c), pol.letter())])
            }
            Op::AutoShutdown(c, on) => {
                Outcome::updates(vec![ParamUpdate::new(ch("auto_shutdown", *c), *on)])
            }
            Op::TemperatureCompensation(c, sensor) => Outcome::updates(vec![ParamUpdate::new(
                ch("ntc", *c),
                sensor.map_or(0, |n| i64::from(n) + 1),
            )]),
            Op::ReferenceTemperature(c, t) => {
                Outcome::updates(vec![ParamUpdate::new(ch("ref_temp", *c), *t)])
            }
            Op::TemperatureSlope(c, s) => {
                Outcome::updates(vec![ParamUpdate::new(ch("slope", *c), *s)])
            }
            Op::RampSpeed(i) => {
                Outcome::updates(vec![ParamUpdate::new(ParamKey::global("ramp_speed"), *i)])
            }
            Op::Read(kind, c) => decode_readback(*kind, *c, &replies[0])?,
            Op::ReadRampSpeed => Outcome::updates(vec![ParamUpdate::new(
                ParamKey::global("ramp_speed"),
                parse_ramp_speed(&replies[0])?,
            )]),
            Op::ReadReadings => Outcome {
                readings: parse_readings(replies),
                ..Outcome::default()
            },
        };
        Ok(outcome)
    }
}

fn number(reply: &Reply) -> NimResult<f64> {
    reply.last_number().ok_or_else(|| {
        NimError::Protocol(format!("no numeric value in reply to '{}'", reply.echo))
    })
}

/// Measured voltage in V.
pub fn parse_voltage(reply: &Reply) -> NimResult<f64> {
    let v = number(reply)?.abs();
    Ok(if v > MAX_VOLTAGE { v / 10.0 } else { v })
}

/// Measured current in µA.
pub fn parse_current(reply: &Reply) -> NimResult<f64> {
    let i = number(reply)?;
    Ok(if i > 100.0 { i / 1000.0 } else { i })
}

fn parse_ramp_speed(reply: &Reply) -> NimResult<i64> {
    let tokens = reply.tokens();
    tokens
        .len()
        .checked_sub(2)
        .and_then(|i| tokens[i].parse::<i64>().ok())
        .and_then(|speed| RAMP_SPEEDS.iter().position(|s| *s == speed))
        .map(|i| i as i64)
        .ok_or_else(|| NimError::Protocol(format!("unexpected ramp speed reply: {:?}", reply.body)))
}

/// `chan 0: TC sensor: 1, Tref: 25.0 C, slope: 800 mV/C`
fn parse_temperature_compensation(channel: u8, reply: &Reply) -> NimResult<Vec<ParamUpdate>> {
    let tokens = reply.tokens();
    let malformed =
        || NimError::Protocol(format!("unexpected compensation reply: {:?}", reply.body));
    if tokens.len() < 10 {
        return Err(malformed());
    }
    let sensor = tokens[4].trim_end_matches(',').to_ascii_lowercase();
    let ntc = match sensor.as_str() {
        "off" | "-" | "4" => 0,
        n => n.parse::<i64>().map_err(|_| malformed())? + 1,
    };

    let mut updates = vec![ParamUpdate::new(ParamKey::channel("ntc", channel), ntc)];
    if let Ok(t) = tokens[6].parse::<f64>() {
        updates.push(ParamUpdate::new(ParamKey::channel("ref_temp", channel), t));
    }
    if let Ok(s) = tokens[9].parse::<i64>() {
        updates.push(ParamUpdate::new(ParamKey::channel("slope", channel), s));
    }
    Ok(updates)
}

fn decode_readback(kind: Readback, c: u8, reply: &Reply) -> NimResult<Outcome> {
    let key = |kind| ParamKey::channel(kind, c);
    let outcome = match kind {
        Readback::Voltage => {
            let mut readings = Readings::new();
            readings.insert(format!("voltage_{c}"), parse_voltage(reply)?);
            Outcome {
                readings,
                ..Outcome::default()
            }
        }
        Readback::Current => {
            let mut readings = Readings::new();
            readings.insert(format!("current_{c}"), parse_current(reply)?);
            Outcome {
                readings,
                ..Outcome::default()
            }
        }
        Readback::VoltagePreset => {
            Outcome::updates(vec![ParamUpdate::new(key("voltage_preset"), number(reply)?.abs())])
        }
        Readback::VoltageLimit => {
            Outcome::updates(vec![ParamUpdate::new(key("voltage_limit"), number(reply)?.abs())])
        }
        Readback::CurrentLimit => Outcome::updates(vec![ParamUpdate::new(
            key("current_limit"),
            number(reply)?.abs() / 1000.0,
        )]),
        Readback::Polarity => {
            let word = reply.tokens().last().map(|t| t.to_ascii_lowercase());
            let letter = if word.as_deref() == Some("positive") { "p" } else { "n" };
            Outcome::updates(vec![ParamUpdate::new(key("polarity"), letter)])
        }
        Readback::TemperatureCompensation => {
            Outcome::updates(parse_temperature_compensation(c, reply)?)
        }
        Readback::Temperature => {
            Outcome::updates(vec![ParamUpdate::new(key("temperature"), number(reply)?)])
        }
    };
    Ok(outcome)
}

/// Readings from one `RU`/`RI` sweep. Unparseable values are left out.
fn parse_readings(replies: &[Reply]) -> Readings {
    let mut readings = Readings::new();
    for (c, pair) in CHANNELS.zip(replies.chunks(2)) {
        if let [ru, ri] = pair {
            match parse_voltage(ru) {
                Ok(v) => {
                    readings.insert(format!("voltage_{c}"), v);
                }
                Err(e) => tracing::debug!(channel = c, error = %e, "voltage reading skipped"),
            }
            match parse_current(ri) {
                Ok(i) => {
                    readings.insert(format!("current_{c}"), i);
                }
                Err(e) => tracing::debug!(channel = c, error = %e, "current reading skipped"),
            }
        }
    }
    readings
}

/// Driver for the Mesytec MHV-4.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mhv4Driver;

impl DeviceDriver for Mhv4Driver {
    fn family(&self) -> Family {
        Family::Mhv4
    }

    fn validate(&self, command: &Command) -> NimResult<()> {
        Op::parse(command).map(|_| ())
    }

    fn encode(&self, command: &Command) -> NimResult<Vec<String>> {
        Ok(Op::parse(command)?.frames())
    }

    fn decode(&self, command: &Command, replies: &[Reply]) -> NimResult<Outcome> {
        let op = Op::parse(command)?;
        expect_replies(command, replies, op.frames().len())?;
        Ok(op.decode(replies)?.with_response(replies))
    }

    fn initial_reads(&self) -> Vec<Command> {
        let mut reads = vec![Command::new("read_ramp_speed")];
        for c in CHANNELS {
            for op in [
                "read_voltage_preset",
                "read_voltage_limit",
                "read_current_limit",
                "read_polarity",
                "read_temperature_compensation",
            ] {
                reads.push(Command::new(op).with("channel", c));
            }
        }
        reads
    }

    fn telemetry_command(&self) -> Option<Command> {
        Some(Command::new("read_readings"))
    }
}
