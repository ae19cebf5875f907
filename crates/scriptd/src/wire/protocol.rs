//! Wire protocol types for control-daemon / worker communication.
//!
//! Every message travels as one frame; the frame header carries the message
//! type, the payload carries a serde_json body. Messages that expect a reply
//! embed an optional correlation key in their payload. SHUTDOWN has no body
//! and encodes as a zero-length payload.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Correlation key matching an asynchronous completion to its request.
///
/// UUID v4 keeps keys unique across concurrently outstanding requests
/// without central coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(uuid::Uuid);

impl RequestKey {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Script categories the worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptCategory {
    Prolog,
    Epilog,
    Power,
    BbLua,
    Mail,
    Reboot,
    Resv,
}

impl ScriptCategory {
    /// Power scripts are excluded from every kill path: interrupting a node
    /// resume/suspend mid-flight can leave hardware state inconsistent.
    pub fn is_killable(&self) -> bool {
        !matches!(self, Self::Power)
    }

    /// Value exported as `SLURM_SCRIPT_CONTEXT` in the script environment.
    pub fn context(&self) -> &'static str {
        match self {
            Self::Prolog => "prolog_slurmctld",
            Self::Epilog => "epilog_slurmctld",
            Self::Power => "power_save",
            Self::BbLua => "burst_buffer",
            Self::Mail => "mail",
            Self::Reboot => "reboot",
            Self::Resv => "reservation",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prolog => "prolog",
            Self::Epilog => "epilog",
            Self::Power => "power",
            Self::BbLua => "bb_lua",
            Self::Mail => "mail",
            Self::Reboot => "reboot",
            Self::Resv => "resv",
        }
    }
}

impl std::fmt::Display for ScriptCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to run one external script.
///
/// The control daemon builds argv/env; the worker supplements them per
/// category before spawning. `extra` is the side-channel payload forwarded
/// to burst-buffer scripts through a temp file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub job_id: u32,
    pub name: String,
    pub category: ScriptCategory,
    pub path: PathBuf,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Vec<u8>>,
}

impl ScriptRequest {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Outcome of one script run, reported back as data.
///
/// Classification priority is `timed_out` over `signalled` over exit
/// status: a timed-out script is reported as timed out even though the
/// force-kill also makes it die by signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptCompletion {
    pub job_id: u32,
    pub name: String,
    pub category: ScriptCategory,
    /// Exit code on normal exit, `128 + signo` when signalled, 124 on
    /// timeout, 127 when the script could not be spawned at all.
    pub status: i32,
    pub signalled: bool,
    pub timed_out: bool,
    /// Combined stdout+stderr, or the spawn error text.
    pub resp_msg: String,
}

/// Bitmask selecting extra per-subsystem debug output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebugFlags(pub u64);

impl DebugFlags {
    pub const SCRIPT: DebugFlags = DebugFlags(1 << 0);
    pub const POWER: DebugFlags = DebugFlags(1 << 1);
    pub const BURST_BUF: DebugFlags = DebugFlags(1 << 2);
    pub const PROTOCOL: DebugFlags = DebugFlags(1 << 3);

    pub fn contains(&self, other: DebugFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DebugFlags {
    type Output = DebugFlags;

    fn bitor(self, rhs: DebugFlags) -> DebugFlags {
        DebugFlags(self.0 | rhs.0)
    }
}

/// Base verbosity of the worker's logging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Wire tag carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    RunScript,
    Flush,
    FlushJob,
    UpdateDebugFlags,
    UpdateLog,
    Shutdown,
    ScriptComplete,
}

impl MsgType {
    pub fn wire(self) -> i32 {
        match self {
            Self::RunScript => 1,
            Self::Flush => 2,
            Self::FlushJob => 3,
            Self::UpdateDebugFlags => 4,
            Self::UpdateLog => 5,
            Self::Shutdown => 6,
            Self::ScriptComplete => 7,
        }
    }

    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::RunScript),
            2 => Some(Self::Flush),
            3 => Some(Self::FlushJob),
            4 => Some(Self::UpdateDebugFlags),
            5 => Some(Self::UpdateLog),
            6 => Some(Self::Shutdown),
            7 => Some(Self::ScriptComplete),
            _ => None,
        }
    }
}

/// All messages exchanged over the pipes.
///
/// Dispatch sites match exhaustively; adding a variant forces every handler
/// to decide what it does with it.
#[derive(Debug, Clone)]
pub enum Msg {
    RunScript {
        key: Option<RequestKey>,
        request: ScriptRequest,
    },
    Flush {
        key: Option<RequestKey>,
    },
    FlushJob {
        job_id: u32,
    },
    UpdateDebugFlags {
        flags: DebugFlags,
    },
    UpdateLog {
        level: LogLevel,
    },
    Shutdown,
    /// Script outcome, or a bare keyed acknowledgement (flush) when
    /// `completion` is absent.
    ScriptComplete {
        key: Option<RequestKey>,
        completion: Option<ScriptCompletion>,
    },
}

#[derive(Serialize, Deserialize)]
struct RunScriptBody {
    key: Option<RequestKey>,
    request: ScriptRequest,
}

#[derive(Serialize, Deserialize)]
struct FlushBody {
    key: Option<RequestKey>,
}

#[derive(Serialize, Deserialize)]
struct FlushJobBody {
    job_id: u32,
}

#[derive(Serialize, Deserialize)]
struct UpdateDebugFlagsBody {
    flags: DebugFlags,
}

#[derive(Serialize, Deserialize)]
struct UpdateLogBody {
    level: LogLevel,
}

#[derive(Serialize, Deserialize)]
struct ScriptCompleteBody {
    key: Option<RequestKey>,
    completion: Option<ScriptCompletion>,
}

impl Msg {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::RunScript { .. } => MsgType::RunScript,
            Self::Flush { .. } => MsgType::Flush,
            Self::FlushJob { .. } => MsgType::FlushJob,
            Self::UpdateDebugFlags { .. } => MsgType::UpdateDebugFlags,
            Self::UpdateLog { .. } => MsgType::UpdateLog,
            Self::Shutdown => MsgType::Shutdown,
            Self::ScriptComplete { .. } => MsgType::ScriptComplete,
        }
    }

    /// Serialize the payload body. SHUTDOWN is the zero-length payload.
    pub fn encode_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::RunScript { key, request } => serde_json::to_vec(&RunScriptBody {
                key: *key,
                request: request.clone(),
            }),
            Self::Flush { key } => serde_json::to_vec(&FlushBody { key: *key }),
            Self::FlushJob { job_id } => serde_json::to_vec(&FlushJobBody { job_id: *job_id }),
            Self::UpdateDebugFlags { flags } => {
                serde_json::to_vec(&UpdateDebugFlagsBody { flags: *flags })
            }
            Self::UpdateLog { level } => serde_json::to_vec(&UpdateLogBody { level: *level }),
            Self::Shutdown => Ok(Vec::new()),
            Self::ScriptComplete { key, completion } => {
                serde_json::to_vec(&ScriptCompleteBody {
                    key: *key,
                    completion: completion.clone(),
                })
            }
        }
    }

    /// Deserialize a payload for the given type tag.
    pub fn decode_payload(msg_type: MsgType, payload: &[u8]) -> serde_json::Result<Msg> {
        match msg_type {
            MsgType::RunScript => {
                let body: RunScriptBody = serde_json::from_slice(payload)?;
                Ok(Msg::RunScript {
                    key: body.key,
                    request: body.request,
                })
            }
            MsgType::Flush => {
                let body: FlushBody = serde_json::from_slice(payload)?;
                Ok(Msg::Flush { key: body.key })
            }
            MsgType::FlushJob => {
                let body: FlushJobBody = serde_json::from_slice(payload)?;
                Ok(Msg::FlushJob {
                    job_id: body.job_id,
                })
            }
            MsgType::UpdateDebugFlags => {
                let body: UpdateDebugFlagsBody = serde_json::from_slice(payload)?;
                Ok(Msg::UpdateDebugFlags { flags: body.flags })
            }
            MsgType::UpdateLog => {
                let body: UpdateLogBody = serde_json::from_slice(payload)?;
                Ok(Msg::UpdateLog { level: body.level })
            }
            MsgType::Shutdown => Ok(Msg::Shutdown),
            MsgType::ScriptComplete => {
                let body: ScriptCompleteBody = serde_json::from_slice(payload)?;
                Ok(Msg::ScriptComplete {
                    key: body.key,
                    completion: body.completion,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> ScriptRequest {
        ScriptRequest {
            job_id: 42,
            name: "PrologSlurmctld".to_string(),
            category: ScriptCategory::Prolog,
            path: PathBuf::from("/etc/slurm/prolog.sh"),
            argv: vec!["prolog.sh".to_string()],
            env: vec![("SLURM_JOB_UID".to_string(), "1000".to_string())],
            timeout_secs: Some(300),
            extra: None,
        }
    }

    #[test]
    fn request_key_roundtrips_through_display() {
        let key = RequestKey::new();
        let parsed = RequestKey::parse(&key.to_string()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_value(ScriptCategory::BbLua).unwrap();
        assert_eq!(json, serde_json::json!("bb_lua"));
        let back: ScriptCategory = serde_json::from_value(json).unwrap();
        assert_eq!(back, ScriptCategory::BbLua);
    }

    #[test]
    fn power_is_the_only_unkillable_category() {
        for cat in [
            ScriptCategory::Prolog,
            ScriptCategory::Epilog,
            ScriptCategory::BbLua,
            ScriptCategory::Mail,
            ScriptCategory::Reboot,
            ScriptCategory::Resv,
        ] {
            assert!(cat.is_killable(), "{cat} should be killable");
        }
        assert!(!ScriptCategory::Power.is_killable());
    }

    #[test]
    fn run_script_payload_roundtrips() {
        let key = RequestKey::new();
        let msg = Msg::RunScript {
            key: Some(key),
            request: test_request(),
        };
        let payload = msg.encode_payload().unwrap();
        let decoded = Msg::decode_payload(MsgType::RunScript, &payload).unwrap();
        match decoded {
            Msg::RunScript {
                key: Some(k),
                request,
            } => {
                assert_eq!(k, key);
                assert_eq!(request.job_id, 42);
                assert_eq!(request.category, ScriptCategory::Prolog);
                assert_eq!(request.timeout(), Some(Duration::from_secs(300)));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn shutdown_payload_is_empty() {
        let payload = Msg::Shutdown.encode_payload().unwrap();
        assert!(payload.is_empty());
        assert!(matches!(
            Msg::decode_payload(MsgType::Shutdown, &payload).unwrap(),
            Msg::Shutdown
        ));
    }

    #[test]
    fn completion_roundtrips_without_key() {
        let msg = Msg::ScriptComplete {
            key: None,
            completion: Some(ScriptCompletion {
                job_id: 7,
                name: "EpilogSlurmctld".to_string(),
                category: ScriptCategory::Epilog,
                status: 1,
                signalled: false,
                timed_out: false,
                resp_msg: "exit 1\n".to_string(),
            }),
        };
        let payload = msg.encode_payload().unwrap();
        match Msg::decode_payload(MsgType::ScriptComplete, &payload).unwrap() {
            Msg::ScriptComplete {
                key: None,
                completion: Some(completion),
            } => {
                assert_eq!(completion.status, 1);
                assert_eq!(completion.resp_msg, "exit 1\n");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn bare_acknowledgement_roundtrips() {
        let key = RequestKey::new();
        let msg = Msg::ScriptComplete {
            key: Some(key),
            completion: None,
        };
        let payload = msg.encode_payload().unwrap();
        match Msg::decode_payload(MsgType::ScriptComplete, &payload).unwrap() {
            Msg::ScriptComplete {
                key: Some(k),
                completion: None,
            } => assert_eq!(k, key),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn wire_tags_roundtrip() {
        for mt in [
            MsgType::RunScript,
            MsgType::Flush,
            MsgType::FlushJob,
            MsgType::UpdateDebugFlags,
            MsgType::UpdateLog,
            MsgType::Shutdown,
            MsgType::ScriptComplete,
        ] {
            assert_eq!(MsgType::from_wire(mt.wire()), Some(mt));
        }
        assert_eq!(MsgType::from_wire(0), None);
        assert_eq!(MsgType::from_wire(99), None);
    }

    #[test]
    fn debug_flags_combine() {
        let flags = DebugFlags::SCRIPT | DebugFlags::POWER;
        assert!(flags.contains(DebugFlags::SCRIPT));
        assert!(flags.contains(DebugFlags::POWER));
        assert!(!flags.contains(DebugFlags::BURST_BUF));
        assert!(DebugFlags::default().is_empty());
    }
}
