use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default path of the Unix socket the control surface listens on.
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/vmadmd.http";

/// First TCP port of the VNC display range; `display = port - VNC_BASE_PORT`.
pub const VNC_BASE_PORT: u16 = 5900;

// ---------------------------------------------------------------------------
// Zone events (zoneevent helper -> daemon)
// ---------------------------------------------------------------------------

/// One line of output from the `zoneevent` helper.
///
/// Every field is optional on the wire; the daemon validates the event before
/// acting on it and drops anything incomplete.
///
/// ```json
/// {"zonename":"fb622681-...","oldstate":"ready","newstate":"running",
///  "zoneid":"463","when":"1494617613097227838"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawZoneEvent {
    #[serde(default)]
    pub zonename: Option<String>,
    #[serde(default)]
    pub oldstate: Option<String>,
    #[serde(default)]
    pub newstate: Option<String>,
    /// Nanoseconds since the epoch, as a decimal string.
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoneid: Option<String>,
}

// ---------------------------------------------------------------------------
// Control surface vocabulary
// ---------------------------------------------------------------------------

/// Error returned when a query parameter does not name a known value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static [&'static str],
}

impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid {} \"{}\", valid values: \"{}\"",
            self.kind,
            self.value,
            self.expected.join("\",\"")
        )
    }
}

impl std::error::Error for UnknownValue {}

/// Actions accepted by `POST /vm/:id?action=...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Stop,
    Reset,
    Sysrq,
    ReloadDisplay,
}

impl ControlAction {
    pub const ALL: &'static [&'static str] = &["stop", "reset", "sysrq", "reload_display"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Reset => "reset",
            Self::Sysrq => "sysrq",
            Self::ReloadDisplay => "reload_display",
        }
    }
}

impl FromStr for ControlAction {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "reset" => Ok(Self::Reset),
            "sysrq" => Ok(Self::Sysrq),
            "reload_display" => Ok(Self::ReloadDisplay),
            other => Err(UnknownValue {
                kind: "action",
                value: other.to_string(),
                expected: Self::ALL,
            }),
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests accepted by `action=sysrq&request=...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SysrqKind {
    Nmi,
    Screenshot,
}

impl SysrqKind {
    pub const ALL: &'static [&'static str] = &["nmi", "screenshot"];
}

impl FromStr for SysrqKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nmi" => Ok(Self::Nmi),
            "screenshot" => Ok(Self::Screenshot),
            other => Err(UnknownValue {
                kind: "sysrq",
                value: other.to_string(),
                expected: Self::ALL,
            }),
        }
    }
}

impl fmt::Display for SysrqKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nmi => f.write_str("nmi"),
            Self::Screenshot => f.write_str("screenshot"),
        }
    }
}

/// Sections that `GET /vm/:id?types=...` can return.
///
/// Every variant except `Vnc`, `Spice` and `All` maps to one `query-*`
/// hypervisor command; the result is keyed by the name without the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoType {
    All,
    Version,
    Chardev,
    Block,
    Blockstats,
    Cpus,
    Pci,
    Kvm,
    Vnc,
    Spice,
}

impl InfoType {
    pub const ALL: &'static [&'static str] = &[
        "all", "version", "chardev", "block", "blockstats", "cpus", "pci", "kvm", "vnc", "spice",
    ];

    /// Types backed by a hypervisor query, in the order they are issued.
    pub const QUERIES: &'static [InfoType] = &[
        InfoType::Version,
        InfoType::Chardev,
        InfoType::Block,
        InfoType::Blockstats,
        InfoType::Cpus,
        InfoType::Pci,
        InfoType::Kvm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Version => "version",
            Self::Chardev => "chardev",
            Self::Block => "block",
            Self::Blockstats => "blockstats",
            Self::Cpus => "cpus",
            Self::Pci => "pci",
            Self::Kvm => "kvm",
            Self::Vnc => "vnc",
            Self::Spice => "spice",
        }
    }

    /// The hypervisor command behind this type, if any.
    pub fn query_command(&self) -> Option<String> {
        match self {
            Self::All | Self::Vnc | Self::Spice => None,
            other => Some(format!("query-{}", other.as_str())),
        }
    }

    /// Parse a comma-separated `types` parameter. Empty input means `all`.
    pub fn parse_list(raw: &str) -> Result<Vec<InfoType>, UnknownValue> {
        let mut types = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let t: InfoType = part.parse()?;
            if !types.contains(&t) {
                types.push(t);
            }
        }
        if types.is_empty() {
            types.push(InfoType::All);
        }
        Ok(types)
    }

    /// Whether `wanted` selects this type (directly or through `all`).
    pub fn selected_by(&self, wanted: &[InfoType]) -> bool {
        wanted.contains(&InfoType::All) || wanted.contains(self)
    }
}

impl FromStr for InfoType {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => Self::All,
            "version" => Self::Version,
            "chardev" => Self::Chardev,
            "block" => Self::Block,
            "blockstats" => Self::Blockstats,
            "cpus" => Self::Cpus,
            "pci" => Self::Pci,
            "kvm" => Self::Kvm,
            "vnc" => Self::Vnc,
            "spice" => Self::Spice,
            other => {
                return Err(UnknownValue {
                    kind: "info type",
                    value: other.to_string(),
                    expected: Self::ALL,
                })
            }
        })
    }
}

/// States a caller can wait for with `GET /vm/:id/wait?state=...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitState {
    Running,
    Stopped,
}

impl WaitState {
    pub const ALL: &'static [&'static str] = &["running", "stopped"];
}

impl FromStr for WaitState {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            other => Err(UnknownValue {
                kind: "state",
                value: other.to_string(),
                expected: Self::ALL,
            }),
        }
    }
}

impl fmt::Display for WaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Display descriptors (info responses)
// ---------------------------------------------------------------------------

/// Live VNC listener details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VncInfo {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Live SPICE listener details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceInfo {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spice_opts: Option<String>,
}

/// Snapshot of the display sessions of one VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc: Option<VncInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spice: Option<SpiceInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // RawZoneEvent
    // -----------------------------------------------------------------------

    #[test]
    fn test_raw_event_full_line() {
        let line = r#"{"zonename":"fb622681-3d62-413b-dc8a-c7515367464f","newstate":"running","oldstate":"ready","zoneid":"463","when":"1494617613097227838"}"#;
        let ev: RawZoneEvent = serde_json::from_str(line).unwrap();
        assert_eq!(ev.zonename.as_deref(), Some("fb622681-3d62-413b-dc8a-c7515367464f"));
        assert_eq!(ev.oldstate.as_deref(), Some("ready"));
        assert_eq!(ev.newstate.as_deref(), Some("running"));
        assert_eq!(ev.when.as_deref(), Some("1494617613097227838"));
        assert_eq!(ev.zoneid.as_deref(), Some("463"));
    }

    #[test]
    fn test_raw_event_missing_fields_parse_as_none() {
        let ev: RawZoneEvent = serde_json::from_str(r#"{"zonename":"z1"}"#).unwrap();
        assert_eq!(ev.zonename.as_deref(), Some("z1"));
        assert!(ev.oldstate.is_none());
        assert!(ev.newstate.is_none());
        assert!(ev.when.is_none());
    }

    #[test]
    fn test_raw_event_empty_oldstate_is_kept() {
        let ev: RawZoneEvent =
            serde_json::from_str(r#"{"zonename":"z","oldstate":"","newstate":"configured","when":"1"}"#)
                .unwrap();
        assert_eq!(ev.oldstate.as_deref(), Some(""));
    }

    // -----------------------------------------------------------------------
    // Parsing of query parameters
    // -----------------------------------------------------------------------

    #[test]
    fn test_control_action_parse() {
        assert_eq!("stop".parse::<ControlAction>().unwrap(), ControlAction::Stop);
        assert_eq!(
            "reload_display".parse::<ControlAction>().unwrap(),
            ControlAction::ReloadDisplay
        );
        let err = "halt".parse::<ControlAction>().unwrap_err();
        assert_eq!(err.kind, "action");
        assert!(err.to_string().contains("halt"));
    }

    #[test]
    fn test_sysrq_parse() {
        assert_eq!("nmi".parse::<SysrqKind>().unwrap(), SysrqKind::Nmi);
        assert_eq!("screenshot".parse::<SysrqKind>().unwrap(), SysrqKind::Screenshot);
        let err = "reboot".parse::<SysrqKind>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid sysrq \"reboot\", valid values: \"nmi\",\"screenshot\""
        );
    }

    #[test]
    fn test_info_type_list_defaults_to_all() {
        assert_eq!(InfoType::parse_list("").unwrap(), vec![InfoType::All]);
        assert_eq!(InfoType::parse_list(" , ").unwrap(), vec![InfoType::All]);
    }

    #[test]
    fn test_info_type_list_dedups_and_keeps_order() {
        let types = InfoType::parse_list("vnc,block,vnc").unwrap();
        assert_eq!(types, vec![InfoType::Vnc, InfoType::Block]);
    }

    #[test]
    fn test_info_type_list_rejects_unknown() {
        let err = InfoType::parse_list("block,bogus").unwrap_err();
        assert_eq!(err.value, "bogus");
    }

    #[test]
    fn test_info_type_query_command() {
        assert_eq!(InfoType::Blockstats.query_command().as_deref(), Some("query-blockstats"));
        assert_eq!(InfoType::Vnc.query_command(), None);
        assert_eq!(InfoType::All.query_command(), None);
        assert!(InfoType::QUERIES.iter().all(|t| t.query_command().is_some()));
    }

    #[test]
    fn test_info_type_selected_by() {
        assert!(InfoType::Pci.selected_by(&[InfoType::All]));
        assert!(InfoType::Pci.selected_by(&[InfoType::Vnc, InfoType::Pci]));
        assert!(!InfoType::Pci.selected_by(&[InfoType::Vnc]));
    }

    #[test]
    fn test_wait_state_rejects_arbitrary_states() {
        assert_eq!("running".parse::<WaitState>().unwrap(), WaitState::Running);
        assert_eq!("stopped".parse::<WaitState>().unwrap(), WaitState::Stopped);
        assert!("provisioning".parse::<WaitState>().is_err());
    }

    // -----------------------------------------------------------------------
    // Display descriptors
    // -----------------------------------------------------------------------

    #[test]
    fn test_display_info_omits_absent_protocols() {
        let info = DisplayInfo {
            vnc: Some(VncInfo {
                host: "10.0.0.5".into(),
                port: 5901,
                display: Some(1),
                password: None,
            }),
            spice: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["vnc"]["port"], 5901);
        assert_eq!(json["vnc"]["display"], 1);
        assert!(json["vnc"].get("password").is_none());
        assert!(json.get("spice").is_none());
    }

    #[test]
    fn test_empty_display_info_serializes_to_empty_object() {
        let json = serde_json::to_string(&DisplayInfo::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
