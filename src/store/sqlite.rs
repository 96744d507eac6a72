//! SQLite persistence for pull requests, build results, mergeability and
//! build triggers.
//!
//! All four tables use natural keys with upsert semantics; there are no
//! cross-row transactions because only one supervisor writes rows for its
//! repository at a time.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add a
//! migration in `run_migrations`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::types::{BuildResult, BuildVerdict, Mergeable, PrNumber, PrStatus, PullRequest, RepoLabel, Sha};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Errors raised by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Provenance for one integration-branch push.
///
/// Keyed on the SHA that was requested of the host; records what the host
/// actually produced and how many times a build was launched for it. Used
/// to suppress duplicate launches when a push webhook races a build start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTrigger {
    pub branch: String,
    pub trigger_sha: Sha,
    pub target_sha: Sha,
    pub build_count: u32,
}

/// SQLite-backed store.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// Callers on the async runtime should wrap calls in
/// `tokio::task::spawn_blocking` when latency matters; in practice each
/// write is a single-row upsert.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens or creates the database file at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        // WAL survives crashes and lets intake read while a supervisor
        // writes; busy_timeout covers the handful of cross-connection
        // collisions that remain.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        let store = Store {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory database (for tests).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < SCHEMA_VERSION {
            Self::run_migrations(&conn, current)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE pull (
                    repo        TEXT NOT NULL,
                    num         INTEGER NOT NULL,
                    status      TEXT NOT NULL,
                    merge_sha   TEXT,
                    title       TEXT NOT NULL DEFAULT '',
                    body        TEXT NOT NULL DEFAULT '',
                    head_sha    TEXT NOT NULL,
                    head_ref    TEXT NOT NULL DEFAULT '',
                    base_ref    TEXT NOT NULL DEFAULT '',
                    assignee    TEXT,
                    approved_by TEXT,
                    priority    INTEGER NOT NULL DEFAULT 0,
                    try_        INTEGER NOT NULL DEFAULT 0,
                    rollup      INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (repo, num)
                );

                CREATE TABLE build_res (
                    repo      TEXT NOT NULL,
                    num       INTEGER NOT NULL,
                    builder   TEXT NOT NULL,
                    res       TEXT NOT NULL,
                    url       TEXT,
                    merge_sha TEXT,
                    PRIMARY KEY (repo, num, builder)
                );

                CREATE TABLE mergeable (
                    repo      TEXT NOT NULL,
                    num       INTEGER NOT NULL,
                    mergeable INTEGER NOT NULL,
                    PRIMARY KEY (repo, num)
                );

                CREATE TABLE build_triggers (
                    branch      TEXT NOT NULL,
                    trigger_sha TEXT NOT NULL PRIMARY KEY,
                    target_sha  TEXT NOT NULL,
                    build_count INTEGER NOT NULL DEFAULT 0
                );
                "#,
            )?;
        }
        Ok(())
    }

    /// Writes the full current state of one pull request.
    pub fn upsert_pull(&self, pr: &PullRequest) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO pull (repo, num, status, merge_sha, title, body, head_sha,
                              head_ref, base_ref, assignee, approved_by, priority, try_, rollup)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT (repo, num) DO UPDATE SET
                status = excluded.status,
                merge_sha = excluded.merge_sha,
                title = excluded.title,
                body = excluded.body,
                head_sha = excluded.head_sha,
                head_ref = excluded.head_ref,
                base_ref = excluded.base_ref,
                assignee = excluded.assignee,
                approved_by = excluded.approved_by,
                priority = excluded.priority,
                try_ = excluded.try_,
                rollup = excluded.rollup
            "#,
            params![
                pr.repo.as_str(),
                pr.number.0 as i64,
                pr.status.as_str(),
                pr.integration_sha.as_ref().map(|s| s.as_str()),
                pr.title,
                pr.body,
                pr.head_sha.as_str(),
                pr.head_ref,
                pr.base_ref,
                pr.assignee,
                pr.approved_by,
                pr.priority,
                pr.try_build,
                pr.rollup,
            ],
        )?;
        Ok(())
    }

    /// Removes one pull request and its subordinate rows.
    pub fn delete_pull(&self, repo: &RepoLabel, num: PrNumber) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let key = params![repo.as_str(), num.0 as i64];
        conn.execute("DELETE FROM pull WHERE repo = ?1 AND num = ?2", key)?;
        conn.execute("DELETE FROM build_res WHERE repo = ?1 AND num = ?2", key)?;
        conn.execute("DELETE FROM mergeable WHERE repo = ?1 AND num = ?2", key)?;
        Ok(())
    }

    /// Upserts a build result for one builder.
    pub fn record_build(
        &self,
        repo: &RepoLabel,
        num: PrNumber,
        builder: &str,
        verdict: BuildVerdict,
        url: Option<&str>,
        merge_sha: Option<&Sha>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO build_res (repo, num, builder, res, url, merge_sha)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (repo, num, builder) DO UPDATE SET
                res = excluded.res,
                url = excluded.url,
                merge_sha = excluded.merge_sha
            "#,
            params![
                repo.as_str(),
                num.0 as i64,
                builder,
                verdict.as_str(),
                url,
                merge_sha.map(|s| s.as_str()),
            ],
        )?;
        Ok(())
    }

    /// Drops all build results for one pull request.
    pub fn clear_builds(&self, repo: &RepoLabel, num: PrNumber) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM build_res WHERE repo = ?1 AND num = ?2",
            params![repo.as_str(), num.0 as i64],
        )?;
        Ok(())
    }

    /// Caches a definite mergeability signal.
    pub fn set_mergeable(
        &self,
        repo: &RepoLabel,
        num: PrNumber,
        mergeable: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO mergeable (repo, num, mergeable) VALUES (?1, ?2, ?3)
            ON CONFLICT (repo, num) DO UPDATE SET mergeable = excluded.mergeable
            "#,
            params![repo.as_str(), num.0 as i64, mergeable],
        )?;
        Ok(())
    }

    /// Drops the cached mergeability hint.
    pub fn clear_mergeable(&self, repo: &RepoLabel, num: PrNumber) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM mergeable WHERE repo = ?1 AND num = ?2",
            params![repo.as_str(), num.0 as i64],
        )?;
        Ok(())
    }

    /// Streams every persisted pull request, with build results and
    /// mergeability attached, so the model can be rehydrated at startup.
    ///
    /// Build-result rows whose `merge_sha` does not match the pull request's
    /// current integration SHA are stale: they are deleted here and not
    /// surfaced. A `testing` row without an integration SHA cannot be
    /// resumed and falls back to `approved` or `pending`.
    pub fn load_all(&self) -> Result<Vec<PullRequest>, StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut prs: HashMap<(String, u64), PullRequest> = HashMap::new();

        {
            let mut stmt = conn.prepare(
                r#"
                SELECT repo, num, status, merge_sha, title, body, head_sha,
                       head_ref, base_ref, assignee, approved_by, priority, try_, rollup
                FROM pull
                "#,
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let repo: String = row.get(0)?;
                let num: i64 = row.get(1)?;
                let status_str: String = row.get(2)?;
                let merge_sha: Option<String> = row.get(3)?;
                let head_sha: String = row.get(6)?;

                let status = PrStatus::parse(&status_str).ok_or_else(|| {
                    StoreError::CorruptRow {
                        table: "pull",
                        detail: format!("unknown status {:?} for {}#{}", status_str, repo, num),
                    }
                })?;
                let head_sha = Sha::parse(head_sha).map_err(|e| StoreError::CorruptRow {
                    table: "pull",
                    detail: format!("bad head_sha for {}#{}: {}", repo, num, e),
                })?;
                let integration_sha = merge_sha
                    .map(Sha::parse)
                    .transpose()
                    .map_err(|e| StoreError::CorruptRow {
                        table: "pull",
                        detail: format!("bad merge_sha for {}#{}: {}", repo, num, e),
                    })?;

                let mut pr =
                    PullRequest::new(RepoLabel::new(repo.clone()), PrNumber(num as u64), head_sha);
                pr.status = status;
                pr.integration_sha = integration_sha;
                pr.title = row.get(4)?;
                pr.body = row.get(5)?;
                pr.head_ref = row.get(7)?;
                pr.base_ref = row.get(8)?;
                pr.assignee = row.get(9)?;
                pr.approved_by = row.get(10)?;
                pr.priority = row.get(11)?;
                pr.try_build = row.get(12)?;
                pr.rollup = row.get(13)?;

                // A testing row without an integration SHA cannot be resumed.
                if pr.status == PrStatus::Testing && pr.integration_sha.is_none() {
                    pr.status = if pr.approved_by.is_some() {
                        PrStatus::Approved
                    } else {
                        PrStatus::Pending
                    };
                }

                prs.insert((repo, num as u64), pr);
            }
        }

        let mut stale: Vec<(String, u64, String)> = Vec::new();
        {
            let mut stmt = conn
                .prepare("SELECT repo, num, builder, res, url, merge_sha FROM build_res")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let repo: String = row.get(0)?;
                let num: i64 = row.get(1)?;
                let builder: String = row.get(2)?;
                let res: String = row.get(3)?;
                let url: Option<String> = row.get(4)?;
                let merge_sha: Option<String> = row.get(5)?;

                let pr = prs.get_mut(&(repo.clone(), num as u64));
                let sha = merge_sha.and_then(|s| Sha::parse(s).ok());

                match pr {
                    Some(pr) if sha.is_some() && sha == pr.integration_sha => {
                        let verdict =
                            BuildVerdict::parse(&res).ok_or_else(|| StoreError::CorruptRow {
                                table: "build_res",
                                detail: format!("unknown verdict {:?}", res),
                            })?;
                        pr.builds.insert(
                            builder,
                            BuildResult {
                                verdict,
                                url,
                                integration_sha: sha,
                            },
                        );
                    }
                    _ => stale.push((repo, num as u64, builder)),
                }
            }
        }
        for (repo, num, builder) in stale {
            conn.execute(
                "DELETE FROM build_res WHERE repo = ?1 AND num = ?2 AND builder = ?3",
                params![repo, num as i64, builder],
            )?;
        }

        let mut orphaned: Vec<(String, u64)> = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT repo, num, mergeable FROM mergeable")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let repo: String = row.get(0)?;
                let num: i64 = row.get(1)?;
                let mergeable: bool = row.get(2)?;
                match prs.get_mut(&(repo.clone(), num as u64)) {
                    Some(pr) => pr.mergeable = Mergeable::from_hint(Some(mergeable)),
                    None => orphaned.push((repo, num as u64)),
                }
            }
        }
        for (repo, num) in orphaned {
            conn.execute(
                "DELETE FROM mergeable WHERE repo = ?1 AND num = ?2",
                params![repo, num as i64],
            )?;
        }

        Ok(prs.into_values().collect())
    }

    /// Records provenance for an integration-branch push.
    pub fn record_trigger(
        &self,
        branch: &str,
        trigger_sha: &Sha,
        target_sha: &Sha,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO build_triggers (branch, trigger_sha, target_sha, build_count)
            VALUES (?1, ?2, ?3, 0)
            ON CONFLICT (trigger_sha) DO UPDATE SET
                branch = excluded.branch,
                target_sha = excluded.target_sha
            "#,
            params![branch, trigger_sha.as_str(), target_sha.as_str()],
        )?;
        Ok(())
    }

    /// Bumps the launch counter for a trigger and returns the new count.
    ///
    /// Returns `None` if no trigger is recorded for this SHA.
    pub fn increment_trigger_count(&self, trigger_sha: &Sha) -> Result<Option<u32>, StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let updated = conn.execute(
            "UPDATE build_triggers SET build_count = build_count + 1 WHERE trigger_sha = ?1",
            params![trigger_sha.as_str()],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        let count: u32 = conn.query_row(
            "SELECT build_count FROM build_triggers WHERE trigger_sha = ?1",
            params![trigger_sha.as_str()],
            |row| row.get(0),
        )?;
        Ok(Some(count))
    }

    /// Looks up the trigger recorded for an integration SHA.
    pub fn trigger_for(&self, trigger_sha: &Sha) -> Result<Option<BuildTrigger>, StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let trigger = conn
            .query_row(
                "SELECT branch, trigger_sha, target_sha, build_count FROM build_triggers WHERE trigger_sha = ?1",
                params![trigger_sha.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()?;

        trigger
            .map(|(branch, trigger_sha, target_sha, build_count)| {
                Ok(BuildTrigger {
                    branch,
                    trigger_sha: Sha::parse(trigger_sha).map_err(|e| StoreError::CorruptRow {
                        table: "build_triggers",
                        detail: e.to_string(),
                    })?,
                    target_sha: Sha::parse(target_sha).map_err(|e| StoreError::CorruptRow {
                        table: "build_triggers",
                        detail: e.to_string(),
                    })?,
                    build_count,
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(c: char) -> Sha {
        Sha::parse(c.to_string().repeat(40)).unwrap()
    }

    fn sample_pr(num: u64) -> PullRequest {
        let mut pr = PullRequest::new(RepoLabel::new("rust"), PrNumber(num), sha('a'));
        pr.title = "Fix the thing".into();
        pr.body = "A body".into();
        pr.head_ref = "fix-thing".into();
        pr.base_ref = "master".into();
        pr
    }

    #[test]
    fn upsert_and_load_roundtrip() {
        let store = Store::in_memory().unwrap();
        let mut pr = sample_pr(7);
        pr.approved_by = Some("alice".into());
        pr.status = PrStatus::Approved;
        pr.priority = 3;
        pr.rollup = true;
        store.upsert_pull(&pr).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![pr]);
    }

    #[test]
    fn upsert_overwrites_by_natural_key() {
        let store = Store::in_memory().unwrap();
        let mut pr = sample_pr(7);
        store.upsert_pull(&pr).unwrap();

        pr.priority = 10;
        pr.status = PrStatus::Approved;
        pr.approved_by = Some("bob".into());
        store.upsert_pull(&pr).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].priority, 10);
        assert_eq!(loaded[0].approved_by.as_deref(), Some("bob"));
    }

    #[test]
    fn build_results_attach_on_load() {
        let store = Store::in_memory().unwrap();
        let mut pr = sample_pr(7);
        pr.status = PrStatus::Testing;
        pr.integration_sha = Some(sha('b'));
        store.upsert_pull(&pr).unwrap();
        store
            .record_build(
                &pr.repo,
                pr.number,
                "linux",
                BuildVerdict::Success,
                Some("http://ci/1"),
                Some(&sha('b')),
            )
            .unwrap();

        let loaded = store.load_all().unwrap();
        let linux = &loaded[0].builds["linux"];
        assert_eq!(linux.verdict, BuildVerdict::Success);
        assert_eq!(linux.url.as_deref(), Some("http://ci/1"));
        assert_eq!(linux.integration_sha, Some(sha('b')));
    }

    #[test]
    fn stale_build_results_dropped_on_load() {
        let store = Store::in_memory().unwrap();
        let mut pr = sample_pr(7);
        pr.status = PrStatus::Testing;
        pr.integration_sha = Some(sha('b'));
        store.upsert_pull(&pr).unwrap();
        // Result recorded for an older integration SHA.
        store
            .record_build(
                &pr.repo,
                pr.number,
                "linux",
                BuildVerdict::Success,
                None,
                Some(&sha('c')),
            )
            .unwrap();

        let loaded = store.load_all().unwrap();
        assert!(loaded[0].builds.is_empty());

        // And the stale row is gone for good.
        let again = store.load_all().unwrap();
        assert!(again[0].builds.is_empty());
    }

    #[test]
    fn testing_without_merge_sha_demoted() {
        let store = Store::in_memory().unwrap();
        let mut pr = sample_pr(7);
        pr.status = PrStatus::Testing;
        pr.approved_by = Some("alice".into());
        pr.integration_sha = None;
        store.upsert_pull(&pr).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[0].status, PrStatus::Approved);
    }

    #[test]
    fn mergeable_cache_roundtrip() {
        let store = Store::in_memory().unwrap();
        let pr = sample_pr(7);
        store.upsert_pull(&pr).unwrap();
        store.set_mergeable(&pr.repo, pr.number, false).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[0].mergeable, Mergeable::No);

        store.clear_mergeable(&pr.repo, pr.number).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[0].mergeable, Mergeable::Unknown);
    }

    #[test]
    fn delete_pull_cascades() {
        let store = Store::in_memory().unwrap();
        let mut pr = sample_pr(7);
        pr.integration_sha = Some(sha('b'));
        store.upsert_pull(&pr).unwrap();
        store
            .record_build(
                &pr.repo,
                pr.number,
                "linux",
                BuildVerdict::Pending,
                None,
                Some(&sha('b')),
            )
            .unwrap();
        store.set_mergeable(&pr.repo, pr.number, true).unwrap();

        store.delete_pull(&pr.repo, pr.number).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn trigger_provenance() {
        let store = Store::in_memory().unwrap();
        store.record_trigger("auto", &sha('b'), &sha('a')).unwrap();

        let trigger = store.trigger_for(&sha('b')).unwrap().unwrap();
        assert_eq!(trigger.branch, "auto");
        assert_eq!(trigger.target_sha, sha('a'));
        assert_eq!(trigger.build_count, 0);

        assert_eq!(store.increment_trigger_count(&sha('b')).unwrap(), Some(1));
        assert_eq!(store.increment_trigger_count(&sha('b')).unwrap(), Some(2));
        assert_eq!(store.increment_trigger_count(&sha('d')).unwrap(), None);
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homu.sqlite");

        let mut pr = sample_pr(7);
        pr.status = PrStatus::Approved;
        pr.approved_by = Some("alice".into());
        {
            let store = Store::open(&path).unwrap();
            store.upsert_pull(&pr).unwrap();
        }

        let store = Store::open(&path).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![pr]);
    }

    #[test]
    fn corrupt_status_rejected() {
        let store = Store::in_memory().unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO pull (repo, num, status, head_sha) VALUES ('r', 1, 'bogus', ?1)",
                params![sha('a').as_str()],
            )
            .unwrap();
        }
        assert!(matches!(
            store.load_all(),
            Err(StoreError::CorruptRow { table: "pull", .. })
        ));
    }
}
