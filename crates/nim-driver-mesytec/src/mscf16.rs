//! Mesytec MSCF-16 shaping amplifier / discriminator driver
//!
//! Protocol Overview:
//! - Format: ASCII `MNEMONIC args\r`, module echoes, prints a body, ends with a prompt
//! - Baud: 9600 at power-up, 8N1, no flow control
//! - Channels 1-16 (17 on the wire addresses all), groups 1-4 (5 addresses all)
//!
//! | operation | wire | range |
//! |---|---|---|
//! | set_threshold | `ST c v` | 0-255 |
//! | set_pz_value | `SP c v` | 0-255 |
//! | set_shaping_time | `SS g v` | 0-15 |
//! | set_gain | `SG g v` | 0-15 |
//! | set_monitor_channel | `MC c` | 1-16 |
//! | set_automatic_pz | `AP c`, bare `AP` toggles | |
//! | set_coincidence_window | `SC v` | 0-255 |
//! | set_shaper_offset | `SSO v` | 0-200 |
//! | set_threshold_offset | `STO v` | 0-200 |
//! | set_blr_threshold | `SBT v` | 0-255 |
//! | set_multiplicity_borders | `SM hi lo` | hi 1-9, lo 1-8 |
//! | set_timing_filter | `SF v` | 0-3 |
//! | set_single_channel_mode / set_ecl_delay / set_blr_mode | `SI` / `SE` / `SBL` 0/1 | |
//! | set_rc_mode | `ON` / `OFF` | |
//! | copy_panel_to_rc / copy_rc_to_panel | `CPY F` / `CPY R`, then `DS` | |
//! | get_version / display_setup | `V` / `DS` | |
//!
//! An "all" target is sent as one broadcast frame and caches the value for every
//! member plus the `*_common` slot.
//!
//! Writes are cached under the plain keys (`threshold`, `gain`, ...), which a
//! `display_setup` fills from the front panel memory. With rc mode on the module
//! stores writes in its remote control memory, so a later `display_setup` replaces the
//! written value with the panel one; the written value then shows up as `rc_threshold`,
//! `rc_gain`, and so on.

use crate::mscf16_setup::SetupListing;
use nim_core::driver::expect_replies;
use nim_core::{
    Command, DeviceDriver, Family, NimError, NimResult, Outcome, ParamKey, ParamUpdate,
    ParamValue, Reply, Target,
};
use std::ops::RangeInclusive;

/// Addressable channels.
pub const CHANNELS: RangeInclusive<u8> = 1..=16;
/// Wire index addressing every channel.
pub const COMMON_CHANNEL: u8 = 17;
/// Addressable groups of four channels.
pub const GROUPS: RangeInclusive<u8> = 1..=4;
/// Wire index addressing every group.
pub const COMMON_GROUP: u8 = 5;

/// Banked parameter kinds: (member kind, common kind).
const THRESHOLD: (&str, &str) = ("threshold", "threshold_common");
const PZ: (&str, &str) = ("pz", "pz_common");
const SHAPING_TIME: (&str, &str) = ("shaping_time", "shaping_time_common");
const GAIN: (&str, &str) = ("gain", "gain_common");

/// MSCF-16 operations after validation.
#[derive(Debug, Clone, PartialEq)]
enum Op {
    Threshold(Target, i64),
    Pz(Target, i64),
    ShapingTime(Target, i64),
    Gain(Target, i64),
    Monitor(u8),
    AutoPz(Option<u8>),
    Scalar {
        mnemonic: &'static str,
        kind: &'static str,
        value: i64,
    },
    Multiplicity { hi: i64, lo: i64 },
    Flag {
        mnemonic: &'static str,
        kind: &'static str,
        enable: bool,
    },
    RcMode(bool),
    Copy { mnemonic: &'static str },
    Version,
    DisplaySetup,
}

impl Op {
    fn parse(command: &Command) -> NimResult<Self> {
        let p = command.params();
        let channel = || p.target("channel", CHANNELS, Some(COMMON_CHANNEL));
        let group = || p.target("group", GROUPS, Some(COMMON_GROUP));
        let scalar = |mnemonic: &'static str, kind: &'static str, max: i64| -> NimResult<Op> {
            Ok(Op::Scalar {
                mnemonic,
                kind,
                value: p.int("value", 0, max)?,
            })
        };
        let flag = |mnemonic: &'static str, kind: &'static str| -> NimResult<Op> {
            Ok(Op::Flag {
                mnemonic,
                kind,
                enable: p.flag("enable")?,
            })
        };

        let op = match command.op.as_str() {
            "set_threshold" => Op::Threshold(channel()?, p.int("value", 0, 255)?),
            "set_pz_value" => Op::Pz(channel()?, p.int("value", 0, 255)?),
            "set_shaping_time" => Op::ShapingTime(group()?, p.int("value", 0, 15)?),
            "set_gain" => Op::Gain(group()?, p.int("value", 0, 15)?),
            "set_monitor_channel" => match p.target("channel", CHANNELS, None)? {
                Target::Single(c) => Op::Monitor(c),
                Target::All => {
                    return Err(NimError::Validation(
                        "monitor channel must be a single channel".into(),
                    ))
                }
            },
            "set_automatic_pz" => {
                if p.is_absent("channel") {
                    Op::AutoPz(None)
                } else {
                    match channel()? {
                        Target::Single(c) => Op::AutoPz(Some(c)),
                        Target::All => Op::AutoPz(None),
                    }
                }
            }
            "set_coincidence_window" => scalar("SC", "coincidence_window", 255)?,
            "set_shaper_offset" => scalar("SSO", "shaper_offset", 200)?,
            "set_threshold_offset" => scalar("STO", "threshold_offset", 200)?,
            "set_blr_threshold" => scalar("SBT", "blr_threshold", 255)?,
            "set_timing_filter" => scalar("SF", "timing_filter", 3)?,
            "set_multiplicity_borders" => Op::Multiplicity {
                hi: p.int("hi", 1, 9)?,
                lo: p.int("lo", 1, 8)?,
            },
            "set_single_channel_mode" => flag("SI", "single_mode")?,
            "set_ecl_delay" => flag("SE", "ecl_delay")?,
            "set_blr_mode" => flag("SBL", "blr_mode")?,
            "set_rc_mode" => Op::RcMode(p.flag("enable")?),
            "switch_rc_mode_on" => Op::RcMode(true),
            "switch_rc_mode_off" => Op::RcMode(false),
            "copy_panel_to_rc" => Op::Copy { mnemonic: "CPY F" },
            "copy_rc_to_panel" => Op::Copy { mnemonic: "CPY R" },
            "get_version" => Op::Version,
            "display_setup" => Op::DisplaySetup,
            other => return Err(NimError::UnknownCommand(other.to_string())),
        };
        Ok(op)
    }

    fn frames(&self) -> Vec<String> {
        let banked = |mnemonic: &str, target: &Target, common: u8, value: i64| {
            let index = match target {
                Target::Single(i) => *i,
                Target::All => common,
            };
            format!("{mnemonic} {index} {value}")
        };

        match self {
            Op::Threshold(t, v) => vec![banked("ST", t, COMMON_CHANNEL, *v)],
            Op::Pz(t, v) => vec![banked("SP", t, COMMON_CHANNEL, *v)],
            Op::ShapingTime(t, v) => vec![banked("SS", t, COMMON_GROUP, *v)],
            Op::Gain(t, v) => vec![banked("SG", t, COMMON_GROUP, *v)],
            Op::Monitor(c) => vec![format!("MC {c}")],
            Op::AutoPz(Some(c)) => vec![format!("AP {c}")],
            Op::AutoPz(None) => vec!["AP".to_string()],
            Op::Scalar {
                mnemonic, value, ..
            } => vec![format!("{mnemonic} {value}")],
            Op::Multiplicity { hi, lo } => vec![format!("SM {hi} {lo}")],
            Op::Flag {
                mnemonic, enable, ..
            } => vec![format!("{mnemonic} {}", u8::from(*enable))],
            Op::RcMode(true) => vec!["ON".to_string()],
            Op::RcMode(false) => vec!["OFF".to_string()],
            Op::Copy { mnemonic } => vec![mnemonic.to_string(), "DS".to_string()],
            Op::Version => vec!["V".to_string()],
            Op::DisplaySetup => vec!["DS".to_string()],
        }
    }

    fn decode(&self, replies: &[Reply]) -> NimResult<Vec<ParamUpdate>> {
        let updates = match self {
            Op::Threshold(t, v) => banked_updates(THRESHOLD, *t, CHANNELS, false, *v),
            Op::Pz(t, v) => banked_updates(PZ, *t, CHANNELS, false, *v),
            Op::ShapingTime(t, v) => banked_updates(SHAPING_TIME, *t, GROUPS, true, *v),
            Op::Gain(t, v) => banked_updates(GAIN, *t, GROUPS, true, *v),
            Op::Monitor(c) => vec![ParamUpdate::new(
                ParamKey::global("monitor"),
                i64::from(*c),
            )],
            Op::AutoPz(_) => Vec::new(),
            Op::Scalar { kind, value, .. } => {
                vec![ParamUpdate::new(ParamKey::global(kind), *value)]
            }
            Op::Multiplicity { hi, lo } => vec![ParamUpdate::new(
                ParamKey::global("multiplicity"),
                ParamValue::Borders { hi: *hi, lo: *lo },
            )],
            Op::Flag { kind, enable, .. } => {
                vec![ParamUpdate::new(ParamKey::global(kind), *enable)]
            }
            Op::RcMode(on) => vec![ParamUpdate::new(ParamKey::global("rc_mode"), *on)],
            Op::Copy { .. } => SetupListing::parse(replies[1].body.as_slice()).updates(),
            Op::Version => parse_version(&replies[0])?,
            Op::DisplaySetup => {
                let updates = SetupListing::parse(replies[0].body.as_slice()).updates();
                if updates.is_empty() {
                    return Err(NimError::Protocol("setup listing had no settings".into()));
                }
                updates
            }
        };
        Ok(updates)
    }
}

/// Updates for a banked parameter. `All` touches every member and the common slot.
///
/// Keys are the panel kinds; see the module docs for how a setup listing overwrites them.
fn banked_updates(
    (kind, common): (&'static str, &'static str),
    target: Target,
    bank: RangeInclusive<u8>,
    grouped: bool,
    value: i64,
) -> Vec<ParamUpdate> {
    let key = |index| {
        if grouped {
            ParamKey::group(kind, index)
        } else {
            ParamKey::channel(kind, index)
        }
    };
    let mut updates: Vec<ParamUpdate> = target
        .members(bank)
        .into_iter()
        .map(|i| ParamUpdate::new(key(i), value))
        .collect();
    if target == Target::All {
        updates.push(ParamUpdate::new(ParamKey::global(common), value));
    }
    updates
}

/// `V` prints `...: <software>` then `...: <hardware>`.
fn parse_version(reply: &Reply) -> NimResult<Vec<ParamUpdate>> {
    let field = |line: &str| line.split_once(':').map(|(_, v)| v.trim().to_string());
    let software = reply
        .body
        .first()
        .and_then(|l| field(l))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NimError::Protocol(format!("unexpected version reply: {:?}", reply.body)))?;

    let mut updates = vec![ParamUpdate::new(ParamKey::global("version"), software)];
    if let Some(hardware) = reply.body.get(1).and_then(|l| field(l)) {
        updates.push(ParamUpdate::new(ParamKey::global("firmware_version"), hardware));
    }
    Ok(updates)
}

/// Driver for the Mesytec MSCF-16.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mscf16Driver;

impl DeviceDriver for Mscf16Driver {
    fn family(&self) -> Family {
        Family::Mscf16
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
        Ok(Outcome::updates(op.decode(replies)?).with_response(replies))
    }

    fn initial_reads(&self) -> Vec<Command> {
        vec![Command::new("get_version"), Command::new("display_setup")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(cmd: Command) -> NimResult<Vec<String>> {
        Mscf16Driver.encode(&cmd)
    }

    fn ok_reply(frame: &str) -> Reply {
        Reply::parse(frame, &format!("{frame}\r\nmscf>")).unwrap()
    }

    #[test]
    fn threshold_frames() {
        let cmd = Command::new("set_threshold").with("channel", 5).with("value", 200);
        assert_eq!(encode(cmd).unwrap(), vec!["ST 5 200"]);

        let all = Command::new("set_threshold").with("channel", 17).with("value", 40);
        assert_eq!(encode(all).unwrap(), vec!["ST 17 40"]);

        let named = Command::new("set_threshold").with("channel", "all").with("value", 40);
        assert_eq!(encode(named).unwrap(), vec!["ST 17 40"]);
    }

    #[test]
    fn threshold_range_is_enforced() {
        let cmd = Command::new("set_threshold").with("channel", 5).with("value", 300);
        let err = Mscf16Driver.validate(&cmd).unwrap_err();
        assert_eq!(err.to_string(), "value out of range 0-255");

        let bad_channel = Command::new("set_threshold").with("channel", 18).with("value", 1);
        assert!(matches!(
            Mscf16Driver.validate(&bad_channel),
            Err(NimError::Validation(_))
        ));
    }

    #[test]
    fn common_threshold_updates_every_channel_and_common_slot() {
        let cmd = Command::new("set_threshold").with("channel", 17).with("value", 42);
        let outcome = Mscf16Driver.decode(&cmd, &[ok_reply("ST 17 42")]).unwrap();
        assert_eq!(outcome.updates.len(), 17);
        for ch in CHANNELS {
            assert!(outcome
                .updates
                .contains(&ParamUpdate::new(ParamKey::channel("threshold", ch), 42i64)));
        }
        assert!(outcome
            .updates
            .contains(&ParamUpdate::new(ParamKey::global("threshold_common"), 42i64)));
    }

    #[test]
    fn group_all_uses_group_sentinel() {
        let cmd = Command::new("set_gain").with("group", 5).with("value", 3);
        assert_eq!(encode(cmd.clone()).unwrap(), vec!["SG 5 3"]);
        let outcome = Mscf16Driver.decode(&cmd, &[ok_reply("SG 5 3")]).unwrap();
        assert_eq!(outcome.updates.len(), 5);
        assert!(outcome
            .updates
            .contains(&ParamUpdate::new(ParamKey::group("gain", 4), 3i64)));

        let too_big = Command::new("set_shaping_time").with("group", 1).with("value", 16);
        assert_eq!(
            Mscf16Driver.validate(&too_big).unwrap_err().to_string(),
            "value out of range 0-15"
        );
    }

    #[test]
    fn automatic_pz_toggle_and_channel() {
        assert_eq!(encode(Command::new("set_automatic_pz")).unwrap(), vec!["AP"]);
        let null = Command::new("set_automatic_pz").with("channel", json!(null));
        assert_eq!(encode(null).unwrap(), vec!["AP"]);
        let one = Command::new("set_automatic_pz").with("channel", 3);
        assert_eq!(encode(one).unwrap(), vec!["AP 3"]);
    }

    #[test]
    fn scalar_and_mode_frames() {
        let cases = [
            (Command::new("set_coincidence_window").with("value", 128), "SC 128"),
            (Command::new("set_shaper_offset").with("value", 100), "SSO 100"),
            (Command::new("set_threshold_offset").with("value", 100), "STO 100"),
            (Command::new("set_blr_threshold").with("value", 10), "SBT 10"),
            (Command::new("set_timing_filter").with("value", 2), "SF 2"),
            (Command::new("set_multiplicity_borders").with("hi", 9).with("lo", 1), "SM 9 1"),
            (Command::new("set_single_channel_mode").with("enable", true), "SI 1"),
            (Command::new("set_ecl_delay").with("enable", false), "SE 0"),
            (Command::new("set_blr_mode").with("enable", true), "SBL 1"),
            (Command::new("set_rc_mode").with("enable", true), "ON"),
            (Command::new("switch_rc_mode_off"), "OFF"),
            (Command::new("set_monitor_channel").with("channel", 16), "MC 16"),
        ];
        for (cmd, frame) in cases {
            assert_eq!(encode(cmd).unwrap(), vec![frame.to_string()]);
        }
    }

    #[test]
    fn offsets_have_narrower_range() {
        let cmd = Command::new("set_shaper_offset").with("value", 201);
        assert_eq!(
            Mscf16Driver.validate(&cmd).unwrap_err().to_string(),
            "value out of range 0-200"
        );
        let lo = Command::new("set_multiplicity_borders").with("hi", 9).with("lo", 9);
        assert_eq!(
            Mscf16Driver.validate(&lo).unwrap_err().to_string(),
            "lo out of range 1-8"
        );
    }

    #[test]
    fn version_is_parsed_from_body() {
        let raw = "V\r\nSoftware version: 5.3\r\nHardware version: 2.0\r\nmscf>";
        let reply = Reply::parse("V", raw).unwrap();
        let outcome = Mscf16Driver
            .decode(&Command::new("get_version"), &[reply])
            .unwrap();
        assert_eq!(
            outcome.updates[0],
            ParamUpdate::new(ParamKey::global("version"), "5.3")
        );
        assert_eq!(outcome.updates[1].key, ParamKey::global("firmware_version"));
    }

    #[test]
    fn empty_version_body_is_protocol_error() {
        let err = Mscf16Driver
            .decode(&Command::new("get_version"), &[ok_reply("V")])
            .unwrap_err();
        assert!(matches!(err, NimError::Protocol(_)));
    }

    #[test]
    fn copy_rereads_setup() {
        assert_eq!(
            encode(Command::new("copy_rc_to_panel")).unwrap(),
            vec!["CPY R", "DS"]
        );
        let ds = Reply::parse(
            "DS",
            "DS\r\nMSCF-16 Panel settings:\r\ngains: 1 2 3 4 c:2\r\nmscf>",
        )
        .unwrap();
        let outcome = Mscf16Driver
            .decode(&Command::new("copy_rc_to_panel"), &[ok_reply("CPY R"), ds])
            .unwrap();
        assert!(outcome
            .updates
            .contains(&ParamUpdate::new(ParamKey::global("gain_common"), 2i64)));
    }

    #[test]
    fn wrong_reply_count_is_protocol_error() {
        let err = Mscf16Driver
            .decode(&Command::new("copy_panel_to_rc"), &[ok_reply("CPY F")])
            .unwrap_err();
        assert!(matches!(err, NimError::Protocol(_)));
    }

    #[test]
    fn unknown_operation() {
        let err = Mscf16Driver.validate(&Command::new("set_voltage")).unwrap_err();
        assert_eq!(err, NimError::UnknownCommand("set_voltage".into()));
    }
}
