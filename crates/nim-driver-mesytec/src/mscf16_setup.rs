//! Parser for the MSCF-16 `DS` (display setup) listing.
//!
//! The listing has three sections, each introduced by a header line:
//!
//! ```text
//! MSCF-16 Panel settings:
//! gains: 4 5 0 5 c:4
//! threshs: 20 20 ... 20 c:20
//! pz: 100 ... c:100
//! shts: 1 1 1 1 c:1
//! mult: 4 1
//! monitor: 1
//! ECL delay: off
//! TF int: 2
//! BLR active
//! single mode
//! MSCF-16 rc settings:
//! ...same keys, plus "rc on"/"rc off" and "pz disp resolution: 1"
//! MSCF-16 general settings:
//! BLR thresh: 10
//! Coincidence time: 128
//! Sum discr thresh: 0
//! Shaper offset: 100
//! Threshold offset: 100
//! MSCF-16 software version: 5.3
//! MSCF-16 firmware version: 3.2
//! ```
//!
//! Unknown lines are ignored.

use nim_core::{ParamKey, ParamUpdate, ParamValue};

/// List values of one bank plus the trailing `c:` common value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BankList {
    /// Per-member values in index order.
    pub members: Vec<i64>,
    /// Common value, when listed.
    pub common: Option<i64>,
}

/// Settings of one memory (front panel or remote control).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BankSettings {
    /// Group gains.
    pub gains: Option<BankList>,
    /// Channel thresholds.
    pub thresholds: Option<BankList>,
    /// Channel pole-zero values.
    pub pz: Option<BankList>,
    /// Group shaping times.
    pub shaping_times: Option<BankList>,
    /// Multiplicity borders (hi, lo).
    pub multiplicity: Option<(i64, i64)>,
    /// Monitor channel.
    pub monitor: Option<i64>,
    /// ECL delay enabled.
    pub ecl_delay: Option<bool>,
    /// Timing filter integration time.
    pub timing_filter: Option<i64>,
    /// Baseline restorer active.
    pub blr_active: Option<bool>,
    /// Single channel mode (false = common mode).
    pub single_mode: Option<bool>,
    /// Remote control mode (rc memory only).
    pub rc_mode: Option<bool>,
}

/// Module-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneralSettings {
    /// BLR threshold.
    pub blr_threshold: Option<i64>,
    /// Coincidence window.
    pub coincidence_time: Option<i64>,
    /// Sum discriminator threshold.
    pub sum_discriminator_threshold: Option<i64>,
    /// Shaper offset.
    pub shaper_offset: Option<i64>,
    /// Threshold offset.
    pub threshold_offset: Option<i64>,
    /// Software version string.
    pub software_version: Option<String>,
    /// Firmware version string.
    pub firmware_version: Option<String>,
}

/// Parsed `DS` listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupListing {
    /// Front panel memory.
    pub panel: BankSettings,
    /// Remote control memory.
    pub rc: BankSettings,
    /// Module-wide values.
    pub general: GeneralSettings,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Panel,
    Rc,
    General,
}

impl SetupListing {
    /// Parse the body lines of a `DS` reply.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut listing = SetupListing::default();
        let mut section = None;

        for line in lines.iter().map(|l| l.as_ref().trim()) {
            if line.starts_with("MSCF-16 Panel settings") {
                section = Some(Section::Panel);
                continue;
            }
            if line.starts_with("MSCF-16 rc settings") {
                section = Some(Section::Rc);
                continue;
            }
            if line.starts_with("MSCF-16 general settings") {
                section = Some(Section::General);
                continue;
            }
            match section {
                Some(Section::Panel) => parse_bank_line(&mut listing.panel, line, false),
                Some(Section::Rc) => parse_bank_line(&mut listing.rc, line, true),
                Some(Section::General) => parse_general_line(&mut listing.general, line),
                None => {}
            }
        }
        listing
    }

    /// Cache updates for everything the listing contained.
    ///
    /// Banked values come from the front panel memory (`threshold`, `gain`, ...) and the
    /// remote control memory (`rc_threshold`, `rc_gain`, ...). The panel keys are the
    /// ones writes are cached under, so they are overwritten with the panel memory. Mode flags, monitor,
    /// multiplicity and timing filter reflect the remote control memory.
    pub fn updates(&self) -> Vec<ParamUpdate> {
        let mut out = Vec::new();

        for (bank, kinds) in [(&self.panel, &PANEL_KINDS), (&self.rc, &RC_KINDS)] {
            push_channels(&mut out, bank.thresholds.as_ref(), kinds.threshold);
            push_channels(&mut out, bank.pz.as_ref(), kinds.pz);
            push_groups(&mut out, bank.shaping_times.as_ref(), kinds.shaping_time);
            push_groups(&mut out, bank.gains.as_ref(), kinds.gain);
        }

        let rc = &self.rc;
        if let Some(monitor) = rc.monitor {
            out.push(ParamUpdate::new(ParamKey::global("monitor"), monitor));
        }
        if let Some((hi, lo)) = rc.multiplicity {
            out.push(ParamUpdate::new(
                ParamKey::global("multiplicity"),
                ParamValue::Borders { hi, lo },
            ));
        }
        if let Some(tf) = rc.timing_filter {
            out.push(ParamUpdate::new(ParamKey::global("timing_filter"), tf));
        }
        for (flag, name) in [
            (rc.single_mode, "single_mode"),
            (rc.ecl_delay, "ecl_delay"),
            (rc.blr_active, "blr_mode"),
            (rc.rc_mode, "rc_mode"),
        ] {
            if let Some(value) = flag {
                out.push(ParamUpdate::new(ParamKey::global(name), value));
            }
        }

        let general = &self.general;
        if let Some(v) = general.coincidence_time {
            out.push(ParamUpdate::new(ParamKey::global("coincidence_window"), v));
        }
        if let Some(v) = general.blr_threshold {
            out.push(ParamUpdate::new(ParamKey::global("blr_threshold"), v));
        }
        if let Some(v) = general.shaper_offset {
            out.push(ParamUpdate::new(ParamKey::global("shaper_offset"), v));
        }
        if let Some(v) = general.threshold_offset {
            out.push(ParamUpdate::new(ParamKey::global("threshold_offset"), v));
        }
        if let Some(v) = &general.software_version {
            out.push(ParamUpdate::new(ParamKey::global("version"), v.as_str()));
        }
        if let Some(v) = &general.firmware_version {
            out.push(ParamUpdate::new(ParamKey::global("firmware_version"), v.as_str()));
        }
        out
    }
}

/// (member kind, common kind) pairs of one memory.
struct BankKinds {
    threshold: (&'static str, &'static str),
    pz: (&'static str, &'static str),
    shaping_time: (&'static str, &'static str),
    gain: (&'static str, &'static str),
}

const PANEL_KINDS: BankKinds = BankKinds {
    threshold: ("threshold", "threshold_common"),
    pz: ("pz", "pz_common"),
    shaping_time: ("shaping_time", "shaping_time_common"),
    gain: ("gain", "gain_common"),
};

const RC_KINDS: BankKinds = BankKinds {
    threshold: ("rc_threshold", "rc_threshold_common"),
    pz: ("rc_pz", "rc_pz_common"),
    shaping_time: ("rc_shaping_time", "rc_shaping_time_common"),
    gain: ("rc_gain", "rc_gain_common"),
};

fn push_channels(out: &mut Vec<ParamUpdate>, list: Option<&BankList>, kinds: (&'static str, &'static str)) {
    let Some(list) = list else { return };
    for (index, value) in list.members.iter().take(16).enumerate() {
        out.push(ParamUpdate::new(ParamKey::channel(kinds.0, index as u8 + 1), *value));
    }
    if let Some(common) = list.common {
        out.push(ParamUpdate::new(ParamKey::global(kinds.1), common));
    }
}

fn push_groups(out: &mut Vec<ParamUpdate>, list: Option<&BankList>, kinds: (&'static str, &'static str)) {
    let Some(list) = list else { return };
    for (index, value) in list.members.iter().take(4).enumerate() {
        out.push(ParamUpdate::new(ParamKey::group(kinds.0, index as u8 + 1), *value));
    }
    if let Some(common) = list.common {
        out.push(ParamUpdate::new(ParamKey::global(kinds.1), common));
    }
}

fn parse_bank_line(bank: &mut BankSettings, line: &str, rc_memory: bool) {
    if let Some(rest) = line.strip_prefix("gains:") {
        bank.gains = Some(parse_list(rest));
    } else if let Some(rest) = line.strip_prefix("threshs:") {
        bank.thresholds = Some(parse_list(rest));
    } else if line.starts_with("upper lim:") {
        // upper thresholds are not exposed
    } else if let Some(rest) = line.strip_prefix("pz:") {
        bank.pz = Some(parse_list(rest));
    } else if let Some(rest) = line.strip_prefix("shts:") {
        bank.shaping_times = Some(parse_list(rest));
    } else if let Some(rest) = line.strip_prefix("mult:") {
        let nums: Vec<i64> = rest.split_whitespace().filter_map(|t| t.parse().ok()).collect();
        if let [hi, lo] = nums.as_slice() {
            bank.multiplicity = Some((*hi, *lo));
        }
    } else if let Some(rest) = line.strip_prefix("monitor:") {
        bank.monitor = rest.trim().parse().ok();
    } else if let Some(rest) = line.strip_prefix("ECL delay:") {
        bank.ecl_delay = Some(rest.trim() == "on");
    } else if let Some(rest) = line.strip_prefix("TF int:") {
        bank.timing_filter = rest.trim().parse().ok();
    } else {
        if line.contains("BLR") {
            bank.blr_active = Some(line.contains("active") && !line.contains("inactive"));
        }
        if line.contains("single mode") || line.contains("common mode") {
            bank.single_mode = Some(line.contains("single"));
        }
        if rc_memory && (line.contains("rc on") || line.contains("rc off")) {
            bank.rc_mode = Some(line.contains("rc on"));
        }
    }
}

fn parse_general_line(general: &mut GeneralSettings, line: &str) {
    let value = || line.split_once(':').map(|(_, v)| v.trim());
    if line.starts_with("BLR thresh:") {
        general.blr_threshold = value().and_then(|v| v.parse().ok());
    } else if line.starts_with("Coincidence time:") {
        general.coincidence_time = value().and_then(|v| v.parse().ok());
    } else if line.starts_with("Sum discr thresh:") {
        general.sum_discriminator_threshold = value().and_then(|v| v.parse().ok());
    } else if line.starts_with("Shaper offset:") {
        general.shaper_offset = value().and_then(|v| v.parse().ok());
    } else if line.starts_with("Threshold offset:") {
        general.threshold_offset = value().and_then(|v| v.parse().ok());
    } else if line.starts_with("MSCF-16 software version:") {
        general.software_version = value().map(str::to_string);
    } else if line.starts_with("MSCF-16 firmware version:") {
        general.firmware_version = value().map(str::to_string);
    }
}

fn parse_list(rest: &str) -> BankList {
    let mut list = BankList::default();
    for token in rest.split_whitespace() {
        if let Some(common) = token.strip_prefix("c:") {
            list.common = common.parse().ok();
        } else if let Ok(v) = token.parse() {
            list.members.push(v);
        }
    }
    list
}
