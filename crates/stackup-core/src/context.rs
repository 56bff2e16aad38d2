use std::path::PathBuf;

use nix::unistd::{getegid, geteuid, getgid, getgroups, getuid, Group, User};
use serde::Serialize;

use crate::error::{Result, StackupError};

/// One group as recorded in the group database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupFacts {
    pub name: String,
    pub gid: u32,
    /// Supplementary members listed in the database. Users whose primary
    /// group this is are not repeated here.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialCache {
    /// Running as root; sudo is never used.
    NotNeeded,
    /// Not checked yet.
    Unknown,
    /// `sudo -n` works without a prompt.
    Valid,
}

/// Who is running the pipeline, and with which groups in effect.
///
/// Captured once at startup and passed explicitly to every stage that cares.
/// Group membership granted during the run only reaches a *new* process, so
/// `effective_gids` never changes after capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionContext {
    pub user: String,
    pub uid: u32,
    pub euid: u32,
    pub primary_gid: u32,
    pub effective_gids: Vec<u32>,
    /// The runtime group, or `None` when it does not exist on this host.
    pub required_group: Option<GroupFacts>,
    pub credentials: CredentialCache,
    pub workdir: PathBuf,
    /// How many times this run has already replaced itself.
    pub reexec_depth: u32,
}

impl ExecutionContext {
    /// Read identity and group facts from the operating system.
    pub fn capture(required_group: &str, workdir: PathBuf, reexec_depth: u32) -> Result<Self> {
        let uid = getuid();
        // Containers often run under a uid with no passwd entry.
        let (user, primary_gid) = match User::from_uid(uid)
            .map_err(|e| StackupError::UnknownUser(e.to_string()))?
        {
            Some(user) => (user.name, user.gid.as_raw()),
            None => (
                std::env::var("USER").unwrap_or_else(|_| uid.to_string()),
                getgid().as_raw(),
            ),
        };

        let mut effective_gids: Vec<u32> = getgroups()
            .map_err(|e| StackupError::UnknownUser(e.to_string()))?
            .into_iter()
            .map(|g| g.as_raw())
            .collect();
        let egid = getegid().as_raw();
        if !effective_gids.contains(&egid) {
            effective_gids.push(egid);
        }

        let required_group = lookup_group(required_group)?;

        let euid = geteuid().as_raw();
        Ok(Self {
            user,
            uid: uid.as_raw(),
            euid,
            primary_gid,
            effective_gids,
            required_group,
            credentials: if euid == 0 {
                CredentialCache::NotNeeded
            } else {
                CredentialCache::Unknown
            },
            workdir,
            reexec_depth,
        })
    }

    pub fn is_root(&self) -> bool {
        self.euid == 0
    }

    /// The runtime group is part of this process's credentials.
    pub fn group_effective(&self) -> bool {
        self.required_group
            .as_ref()
            .is_some_and(|g| self.effective_gids.contains(&g.gid))
    }

    /// The group database lists the user in the runtime group, whether or not
    /// this process has picked it up.
    pub fn listed_in_group(&self) -> bool {
        self.required_group
            .as_ref()
            .is_some_and(|g| g.gid == self.primary_gid || g.members.iter().any(|m| *m == self.user))
    }

    /// Replace the database view of the runtime group, e.g. after an install
    /// created it. Process credentials are untouched.
    pub fn refresh_group(&mut self, facts: Option<GroupFacts>) {
        self.required_group = facts;
    }

    /// Record a membership grant made during this run. Only the database view
    /// changes; the running process keeps its old credentials.
    pub fn record_grant(&mut self) {
        let user = self.user.clone();
        if let Some(group) = self.required_group.as_mut() {
            if !group.members.contains(&user) {
                group.members.push(user);
            }
        }
    }
}

pub fn lookup_group(name: &str) -> Result<Option<GroupFacts>> {
    let group = Group::from_name(name).map_err(|e| StackupError::UnknownUser(e.to_string()))?;
    Ok(group.map(|g| GroupFacts {
        name: g.name,
        gid: g.gid.as_raw(),
        members: g.mem,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A non-root user `dev` (uid 1000) with the `docker` group (gid 999).
    pub(crate) fn ctx(listed: bool, effective: bool) -> ExecutionContext {
        let mut effective_gids = vec![1000];
        if effective {
            effective_gids.push(999);
        }
        ExecutionContext {
            user: "dev".into(),
            uid: 1000,
            euid: 1000,
            primary_gid: 1000,
            effective_gids,
            required_group: Some(GroupFacts {
                name: "docker".into(),
                gid: 999,
                members: if listed { vec!["dev".into()] } else { vec![] },
            }),
            credentials: CredentialCache::Unknown,
            workdir: PathBuf::from("/srv/project"),
            reexec_depth: 0,
        }
    }

    #[test]
    fn listed_but_not_effective_is_distinguished() {
        let c = ctx(true, false);
        assert!(c.listed_in_group());
        assert!(!c.group_effective());
    }

    #[test]
    fn primary_group_counts_as_listed() {
        let mut c = ctx(false, false);
        c.primary_gid = 999;
        assert!(c.listed_in_group());
    }

    #[test]
    fn missing_group_is_neither_listed_nor_effective() {
        let mut c = ctx(true, true);
        c.required_group = None;
        assert!(!c.listed_in_group());
        assert!(!c.group_effective());
    }

    #[test]
    fn record_grant_updates_database_view_only() {
        let mut c = ctx(false, false);
        c.record_grant();
        c.record_grant();
        assert!(c.listed_in_group());
        assert!(!c.group_effective());
        assert_eq!(c.required_group.unwrap().members, vec!["dev".to_string()]);
    }

    #[test]
    fn refresh_group_picks_up_a_group_created_later() {
        let mut c = ctx(false, false);
        c.required_group = None;
        c.refresh_group(Some(GroupFacts {
            name: "docker".into(),
            gid: 999,
            members: vec!["dev".into()],
        }));
        assert!(c.listed_in_group());
        assert!(!c.group_effective());
    }

    #[test]
    fn lookup_of_an_unknown_group_is_none() {
        assert_eq!(lookup_group("stackup-no-such-group").unwrap(), None);
    }

    #[test]
    fn capture_reads_the_current_process() {
        let c = ExecutionContext::capture("root", PathBuf::from("."), 0).unwrap();
        assert_eq!(c.uid, nix::unistd::getuid().as_raw());
        assert!(!c.user.is_empty());
        assert!(!c.effective_gids.is_empty());
    }
}
