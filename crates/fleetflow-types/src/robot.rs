//! Robot (worker agent) records as tracked by the dispatcher.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Online,
    /// Every job slot is occupied.
    Busy,
    Offline,
}

impl std::fmt::Display for RobotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RobotStatus::Online => "online",
            RobotStatus::Busy => "busy",
            RobotStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Robot {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub environment: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub current_job_ids: BTreeSet<Uuid>,
    pub status: RobotStatus,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl Robot {
    /// Free job slots.
    pub fn available_slots(&self) -> u32 {
        self.max_concurrent_jobs
            .saturating_sub(self.current_job_ids.len() as u32)
    }

    /// Recompute Online/Busy from slot usage. Offline robots stay offline.
    pub fn refresh_status(&mut self) {
        if self.status == RobotStatus::Offline {
            return;
        }
        self.status = if self.available_slots() == 0 {
            RobotStatus::Busy
        } else {
            RobotStatus::Online
        };
    }
}

/// Registration data sent by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotRegistration {
    /// Stable id the agent wants to reuse; assigned by the dispatcher if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "crate::job::default_environment")]
    pub environment: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub max_concurrent_jobs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn robot(max: u32, jobs: usize) -> Robot {
        let now = Utc::now();
        Robot {
            id: "r1".into(),
            name: "r1".into(),
            capabilities: BTreeSet::new(),
            environment: "default".into(),
            tags: BTreeSet::new(),
            max_concurrent_jobs: max,
            current_job_ids: (0..jobs).map(|_| Uuid::now_v7()).collect(),
            status: RobotStatus::Online,
            last_heartbeat: now,
            last_assigned_at: None,
            registered_at: now,
        }
    }

    #[test]
    fn slots_and_status() {
        let mut r = robot(2, 1);
        assert_eq!(r.available_slots(), 1);
        r.refresh_status();
        assert_eq!(r.status, RobotStatus::Online);

        let mut full = robot(1, 1);
        full.refresh_status();
        assert_eq!(full.status, RobotStatus::Busy);

        let mut off = robot(1, 0);
        off.status = RobotStatus::Offline;
        off.refresh_status();
        assert_eq!(off.status, RobotStatus::Offline);
    }
}
