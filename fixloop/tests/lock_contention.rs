//! Several processes reclaiming the same stale lock at once.
//!
//! The test binary re-executes itself: with `CONTENDER_DIR_ENV` set, the
//! `contender` test waits for a start signal, races for the lock and reports
//! the outcome on stdout.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use fixloop::io::lockfile::{LockData, LockHeld, LockStatus, create_lockfile, lock_path};

const CONTENDER_DIR_ENV: &str = "FIXLOOP_LOCK_CONTENDER_DIR";
const CONTENDER_ID_ENV: &str = "FIXLOOP_LOCK_CONTENDER_ID";
const PROJECT: &str = "/srv/contended";
const CONTENDERS: usize = 3;
const TRIALS: usize = 12;

#[test]
fn contender() {
    let Ok(dir) = std::env::var(CONTENDER_DIR_ENV) else {
        return;
    };
    let dir = Path::new(&dir);
    let id = std::env::var(CONTENDER_ID_ENV).expect("contender id");
    let go = dir.join("go");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !go.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }

    match create_lockfile(dir, PROJECT, &format!("contender-{id}"), "race", "main") {
        Ok(_) => println!("outcome=won"),
        Err(e) if e.downcast_ref::<LockHeld>().is_some() => println!("outcome=held"),
        Err(e) => println!("outcome=error {e:#}"),
    }
}

#[cfg(unix)]
fn seed_dead_lock(logs_dir: &Path) {
    let path = lock_path(logs_dir, PROJECT);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    let dead = LockData {
        session_id: "crashed".to_string(),
        session_name: "crashed".to_string(),
        start_time: Utc::now() - chrono::Duration::hours(1),
        pid: 999_999_999,
        project_path: PROJECT.to_string(),
        branch: "main".to_string(),
        status: LockStatus::Running,
        current_agent: None,
        iteration: Some(3),
    };
    fs::write(&path, serde_json::to_string(&dead).expect("json")).expect("seed lock");
}

/// Exactly one of several simultaneous reclaimers ends up owning the project.
#[cfg(unix)]
#[test]
fn concurrent_reclaim_has_a_single_owner() {
    let exe = std::env::current_exe().expect("test binary");
    for trial in 0..TRIALS {
        let temp = tempfile::tempdir().expect("tempdir");
        seed_dead_lock(temp.path());

        let children: Vec<_> = (0..CONTENDERS)
            .map(|id| {
                Command::new(&exe)
                    .args(["--exact", "contender", "--nocapture", "--test-threads=1", "-q"])
                    .env(CONTENDER_DIR_ENV, temp.path())
                    .env(CONTENDER_ID_ENV, id.to_string())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
                    .expect("spawn contender")
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        fs::write(temp.path().join("go"), "").expect("start signal");

        let mut outcomes = Vec::new();
        for child in children {
            let output = child.wait_with_output().expect("contender output");
            assert!(output.status.success(), "contender failed in trial {trial}");
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let outcome = stdout
                .lines()
                .find_map(|line| line.strip_prefix("outcome="))
                .unwrap_or("missing")
                .to_string();
            outcomes.push(outcome);
        }

        let winners = outcomes.iter().filter(|o| *o == "won").count();
        assert_eq!(winners, 1, "trial {trial}: {outcomes:?}");
        assert!(
            outcomes.iter().all(|o| o == "won" || o == "held"),
            "trial {trial}: {outcomes:?}"
        );
    }
}
