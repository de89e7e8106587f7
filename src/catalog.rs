//! Built-in catalog of LuxOS API commands.
//!
//! The session layer dispatches every command generically; the catalog only
//! records which commands need an authenticated session and what they do.
//! Commands missing from the catalog are still sent as-is.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Functional group of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    Session,
    Status,
    Pools,
    Atm,
    Profiles,
    Tuning,
    Fans,
    System,
}

/// Metadata for one catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandSpec {
    pub name: String,
    pub category: CommandCategory,
    pub logon_required: bool,
    pub description: String,
}

use CommandCategory::*;

const CATALOG: &[(&str, CommandCategory, bool, &str)] = &[
    ("logon", Session, false, "Open an authenticated session"),
    ("logoff", Session, false, "Close the authenticated session"),
    ("session", Session, false, "Show the active session"),
    ("kill", Session, false, "Terminate the active session"),
    ("version", Status, false, "Firmware and API versions"),
    ("config", Status, false, "Miner configuration"),
    ("summary", Status, false, "Mining summary"),
    ("stats", Status, false, "Detailed statistics"),
    ("devs", Status, false, "Per-board device status"),
    ("devdetails", Status, false, "Per-board hardware details"),
    ("temps", Status, false, "Board temperatures"),
    ("power", Status, false, "Power consumption"),
    ("limits", Status, false, "Configurable value limits"),
    ("healthchipget", Status, false, "Per-chip health for a board"),
    ("pools", Pools, false, "Configured pools"),
    ("groups", Pools, false, "Configured pool groups"),
    ("addpool", Pools, true, "Add a pool"),
    ("removepool", Pools, true, "Remove a pool"),
    ("switchpool", Pools, true, "Make a pool the active one"),
    ("enablepool", Pools, true, "Enable a pool"),
    ("disablepool", Pools, true, "Disable a pool"),
    ("groupadd", Pools, true, "Add a pool group"),
    ("groupremove", Pools, true, "Remove a pool group"),
    ("atm", Atm, false, "Advanced thermal management settings"),
    ("atmset", Atm, true, "Change advanced thermal management settings"),
    ("profiles", Profiles, false, "Available frequency/voltage profiles"),
    ("profileset", Profiles, true, "Apply a profile to a board"),
    ("profilenew", Profiles, true, "Create a profile"),
    ("profilerem", Profiles, true, "Remove a profile"),
    ("autotunerget", Tuning, false, "Autotuner settings"),
    ("autotunerset", Tuning, true, "Change autotuner settings"),
    ("frequencyget", Tuning, false, "Board frequency"),
    ("frequencyset", Tuning, true, "Set board frequency"),
    ("voltageget", Tuning, false, "Board voltage"),
    ("voltageset", Tuning, true, "Set board voltage"),
    ("powertargetset", Tuning, true, "Set the power target"),
    ("fans", Fans, false, "Fan speeds"),
    ("fanset", Fans, true, "Set fan speed limits"),
    ("tempctrl", Fans, false, "Temperature control settings"),
    ("tempctrlset", Fans, true, "Change temperature control settings"),
    ("curtail", System, true, "Sleep or wake up the miner"),
    ("ledset", System, true, "Toggle the locate LED"),
    ("netset", System, true, "Change network settings"),
    ("rebootdevice", System, true, "Reboot the control board"),
    ("resetminer", System, true, "Restart the mining process"),
    ("updaterun", System, true, "Run a firmware update"),
    ("updateset", System, true, "Change firmware update settings"),
];

fn spec_for(name: &str) -> Option<CommandSpec> {
    CATALOG
        .iter()
        .find(|(entry, ..)| *entry == name)
        .map(|(name, category, logon_required, description)| CommandSpec {
            name: name.to_string(),
            category: *category,
            logon_required: *logon_required,
            description: description.to_string(),
        })
}

/// Returns the names of all catalog commands.
pub fn available_commands() -> Vec<&'static str> {
    CATALOG.iter().map(|(name, ..)| *name).collect()
}

/// Returns metadata for every catalog command.
pub fn command_catalog() -> Vec<CommandSpec> {
    CATALOG
        .iter()
        .filter_map(|(name, ..)| spec_for(name))
        .collect()
}

/// Looks up one command by name (case-insensitive).
pub fn command_spec(name: &str) -> Option<CommandSpec> {
    spec_for(&name.to_ascii_lowercase())
}

/// Whether `name` needs a session id; `None` for commands the catalog does
/// not know.
pub fn logon_required(name: &str) -> Option<bool> {
    command_spec(name).map(|spec| spec.logon_required)
}

/// Commands of one category.
pub fn commands_in(category: CommandCategory) -> Vec<CommandSpec> {
    command_catalog()
        .into_iter()
        .filter(|spec| spec.category == category)
        .collect()
}
