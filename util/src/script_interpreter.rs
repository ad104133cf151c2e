//! # Reference script interpreter module
//!
//! This module provides an interpreter for reference scripts, allowing motion
//! references to be replayed from a file in place of a live reference source.
//!
//! A script is a sequence of entries of the form
//!
//! ```text
//! <time_s>: <json reference message>;
//! ```
//!
//! where the time is relative to the start of the session and the message is a
//! JSON encoded `comms_if::msg::RefMsg`.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::fs;
use regex::RegexBuilder;
use thiserror::Error;

// Internal
use comms_if::msg::RefMsg;
use crate::session::get_elapsed_seconds;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A reference message which is scripted to occur at a specific time.
struct ScriptedRef {
    /// The time the message is supposed to be released at
    exec_time_s: f64,

    /// The message to release
    msg: RefMsg
}

/// A script interpreter.
///
/// After initialising with the path to the script use `.get_pending` to
/// acquire the list of messages that are due.
pub struct ScriptInterpreter {
    script_path: PathBuf,
    refs: VecDeque<ScriptedRef>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Could not find the script at {0:?}")]
    ScriptNotFound(PathBuf),

    #[error("Could not load the script: {0}")]
    ScriptLoadError(std::io::Error),

    #[error("The script is empty (or is so bad it can't be read)")]
    ScriptEmpty,

    #[error(
        "Script contains an invalid timestamp: {0}. \
        Should be a float (like 1.0)")]
    InvalidTimestamp(String),

    #[error("Script entries must be in time order, found {0} s after {1} s")]
    OutOfOrder(f64, f64),

    #[error("Script contains an invalid reference at {0} s: {1}")]
    InvalidRef(f64, serde_json::Error)
}

#[derive(Debug, PartialEq)]
pub enum PendingRefs {
    None,
    Some(Vec<RefMsg>),
    EndOfScript
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ScriptInterpreter {

    /// Create a new interpreter from the given script path.
    pub fn new<P: AsRef<Path>>(script_path: P) -> Result<Self, ScriptError> {

        let path = PathBuf::from(script_path.as_ref());

        if !path.exists() {
            return Err(ScriptError::ScriptNotFound(path));
        }

        let script = fs::read_to_string(&path)
            .map_err(ScriptError::ScriptLoadError)?;

        let mut interp = Self::from_str(&script)?;
        interp.script_path = path;

        Ok(interp)
    }

    /// Create a new interpreter from the contents of a script.
    pub fn from_str(script: &str) -> Result<Self, ScriptError> {

        let mut queue: VecDeque<ScriptedRef> = VecDeque::new();

        // Each entry is `time: payload;`, payloads may not contain `;`.
        let re = RegexBuilder::
            new(r"^\s*(\d+(\.\d+)?)\s*:\s*([^;]*);")
            .multi_line(true)
            .build()
            .map_err(|e| ScriptError::InvalidTimestamp(format!("{}", e)))?;

        for cap in re.captures_iter(script) {
            let time_str = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            let exec_time_s: f64 = time_str.parse()
                .map_err(|e| ScriptError::InvalidTimestamp(format!("{}", e)))?;

            if let Some(last) = queue.back() {
                if exec_time_s < last.exec_time_s {
                    return Err(ScriptError::OutOfOrder(exec_time_s, last.exec_time_s))
                }
            }

            let payload = cap.get(3).map(|m| m.as_str()).unwrap_or("");
            let msg = RefMsg::from_json(payload)
                .map_err(|e| ScriptError::InvalidRef(exec_time_s, e))?;

            queue.push_back(ScriptedRef {
                exec_time_s,
                msg
            });
        }

        if queue.is_empty() {
            return Err(ScriptError::ScriptEmpty)
        }

        Ok(ScriptInterpreter {
            script_path: PathBuf::new(),
            refs: queue
        })
    }

    /// Return the references which are due at the current session time.
    pub fn get_pending(&mut self) -> PendingRefs {
        self.get_pending_at(get_elapsed_seconds())
    }

    /// Return the references which are due at the given script time.
    pub fn get_pending_at(&mut self, current_time_s: f64) -> PendingRefs {

        // If the queue is empty the script is over
        if self.refs.is_empty() {
            return PendingRefs::EndOfScript
        }

        let mut due: Vec<RefMsg> = vec![];

        while let Some(head) = self.refs.front() {
            if head.exec_time_s > current_time_s {
                break
            }

            if let Some(r) = self.refs.pop_front() {
                due.push(r.msg);
            }
        }

        if due.is_empty() {
            PendingRefs::None
        }
        else {
            PendingRefs::Some(due)
        }
    }

    /// Get the number of references remaining in the script
    pub fn get_num_refs(&self) -> usize {
        self.refs.len()
    }

    /// Get the length of the script in seconds
    pub fn get_duration(&self) -> f64 {
        match self.refs.back() {
            Some(r) => r.exec_time_s,
            None => 0f64
        }
    }

    /// Path the script was loaded from, empty if loaded from a string.
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::msg::{ControlMode, YawMode};

    const SCRIPT: &str = r#"
        0.0: {"set_mode": {"control_mode": "trajectory", "yaw_mode": "angle"}};
        0.5: {"trajectory": {"position_m": [0.0, 0.0, 1.0], "yaw_rad": 0.0}};
        0.5: {"trajectory": {"position_m": [0.0, 0.0, 1.1], "yaw_rad": 0.0}};
        2.0: "stop";
    "#;

    #[test]
    fn test_script_playback() {
        let mut si = ScriptInterpreter::from_str(SCRIPT).unwrap();

        assert_eq!(si.get_num_refs(), 4);
        assert_eq!(si.get_duration(), 2.0);

        assert_eq!(
            si.get_pending_at(0.1),
            PendingRefs::Some(vec![RefMsg::SetMode {
                control_mode: ControlMode::Trajectory,
                yaw_mode: YawMode::Angle
            }])
        );
        assert_eq!(si.get_pending_at(0.2), PendingRefs::None);

        match si.get_pending_at(1.0) {
            PendingRefs::Some(v) => assert_eq!(v.len(), 2),
            p => panic!("Expected two references, got {:?}", p)
        }

        assert_eq!(si.get_pending_at(2.0), PendingRefs::Some(vec![RefMsg::Stop]));
        assert_eq!(si.get_pending_at(3.0), PendingRefs::EndOfScript);
    }

    #[test]
    fn test_script_errors() {
        assert!(matches!(
            ScriptInterpreter::from_str("no entries here"),
            Err(ScriptError::ScriptEmpty)
        ));
        assert!(matches!(
            ScriptInterpreter::from_str("1.0: \"stop\";\n0.5: \"stop\";"),
            Err(ScriptError::OutOfOrder(_, _))
        ));
        assert!(matches!(
            ScriptInterpreter::from_str("1.0: {\"bogus\": 1};"),
            Err(ScriptError::InvalidRef(_, _))
        ));
        assert!(matches!(
            ScriptInterpreter::new("/not/a/script.txt"),
            Err(ScriptError::ScriptNotFound(_))
        ));
    }
}
