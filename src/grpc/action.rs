//! P2P command actions.
//!
//! Action names are parsed once into [`Action`]; [`execute`] matches on it
//! exhaustively, so an unknown name is rejected before anything is read.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{PatrickError, Result};
use crate::proto::CommandRequest;
use crate::scheduler::{Caller, JobStateMachine, LockState, Report};

/// Key/value reply sent back as a JSON object.
pub type Reply = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    List,
    Info,
    Lock,
    IsLocked,
    Unlock,
    Done,
    Failed,
    Cancel,
    Timeout,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::List,
        Action::Info,
        Action::Lock,
        Action::IsLocked,
        Action::Unlock,
        Action::Done,
        Action::Failed,
        Action::Cancel,
        Action::Timeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::List => "list",
            Action::Info => "info",
            Action::Lock => "lock",
            Action::IsLocked => "isLocked",
            Action::Unlock => "unlock",
            Action::Done => "done",
            Action::Failed => "failed",
            Action::Cancel => "cancel",
            Action::Timeout => "timeout",
        }
    }

    pub fn needs_jid(self) -> bool {
        !matches!(self, Action::List)
    }

    /// Actions that touch a lease must come from an identified peer.
    pub fn needs_peer(self) -> bool {
        matches!(
            self,
            Action::Lock
                | Action::Unlock
                | Action::Done
                | Action::Failed
                | Action::Cancel
                | Action::Timeout
        )
    }
}

impl FromStr for Action {
    type Err = PatrickError;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| PatrickError::UnknownAction(s.to_string()))
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn reply(value: Value) -> Reply {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Validates a request for `action` and runs it against the state machine.
pub async fn execute(
    machine: &JobStateMachine,
    action: Action,
    peer: Option<String>,
    request: CommandRequest,
) -> Result<Reply> {
    let jid = request.jid.trim().to_string();
    if action.needs_jid() && jid.is_empty() {
        return Err(PatrickError::InvalidArgument(format!(
            "`{}` requires a jid",
            action
        )));
    }
    let caller = match peer {
        Some(peer) => Some(Caller::Peer(peer)),
        None if action.needs_peer() => {
            return Err(PatrickError::Unauthorized(format!(
                "`{}` requires a peer id",
                action
            )))
        }
        None => None,
    };
    let peer_caller = || {
        caller
            .clone()
            .ok_or_else(|| PatrickError::Unauthorized(format!("`{}` requires a peer id", action)))
    };
    debug!(action = %action, job_id = %jid, caller = ?caller, "Command received");

    let logs: BTreeMap<String, String> = request.cid.into_iter().collect();
    let asset_cid: BTreeMap<String, String> = request.asset_cid.into_iter().collect();

    match action {
        Action::List => {
            let ids = machine.list().await?;
            Ok(reply(json!({ "Ids": ids })))
        }
        Action::Info => {
            let job = machine.info(&jid).await?;
            let job = serde_json::to_value(&job)
                .map_err(|e| PatrickError::Internal(e.to_string()))?;
            Ok(reply(json!({ "job": job })))
        }
        Action::Lock => {
            let eta = request.eta.ok_or_else(|| {
                PatrickError::InvalidArgument("`lock` requires an eta".to_string())
            })?;
            let grant = machine.lock(&jid, &peer_caller()?.to_string(), eta).await?;
            Ok(reply(json!({
                "generation": grant.lock.generation,
                "till": grant.lock.expires_at(),
            })))
        }
        Action::IsLocked => match machine.is_locked(&jid).await? {
            LockState::Held(lock) => Ok(reply(json!({
                "locked": true,
                "locked-by": lock.owner,
            }))),
            LockState::Expired(_) | LockState::Absent => Ok(reply(json!({ "locked": false }))),
        },
        Action::Unlock => {
            machine.unlock(&jid, &peer_caller()?).await?;
            Ok(reply(json!({ "unlocked": jid })))
        }
        Action::Done => {
            let report = Report {
                logs,
                asset_cid,
                generation: request.generation,
            };
            machine.done(&jid, &peer_caller()?, report).await?;
            Ok(Reply::new())
        }
        Action::Failed => {
            let report = Report {
                logs,
                asset_cid,
                generation: request.generation,
            };
            machine.failed(&jid, &peer_caller()?, report).await?;
            Ok(Reply::new())
        }
        Action::Cancel => {
            machine.cancel(&jid, &peer_caller()?, logs).await?;
            Ok(reply(json!({ "cancelled": jid })))
        }
        Action::Timeout => {
            machine.timeout(&jid, &peer_caller()?, logs).await?;
            Ok(Reply::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_action_round_trips_through_its_name() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
    }

    #[test]
    fn names_are_case_sensitive() {
        assert!(matches!(
            "islocked".parse::<Action>(),
            Err(PatrickError::UnknownAction(_))
        ));
        assert!(matches!(
            "stats".parse::<Action>(),
            Err(PatrickError::UnknownAction(_))
        ));
    }

    #[test]
    fn only_list_skips_jid() {
        let without: Vec<_> = Action::ALL.into_iter().filter(|a| !a.needs_jid()).collect();
        assert_eq!(without, vec![Action::List]);
    }

    #[test]
    fn read_only_actions_skip_peer() {
        assert!(!Action::List.needs_peer());
        assert!(!Action::Info.needs_peer());
        assert!(!Action::IsLocked.needs_peer());
        assert!(Action::Done.needs_peer());
        assert!(Action::Timeout.needs_peer());
    }
}
