//! End-to-end runs through the OS process backend. Skipped when `python3`
//! is not installed.

use codeexec::{
    create_engine_with_options, AbortToken, EngineConfig, EngineOptions, ExecutionEngine,
    ExecutionRequest, ExecutionStatus, Language, PoolConfig, PolicySet, RateLimitConfig,
    SecurityPolicy,
};
use std::time::Duration;
use tempfile::TempDir;

fn python_available() -> bool {
    if which::which("python3").is_ok() {
        true
    } else {
        eprintln!("python3 not found, skipping");
        false
    }
}

fn engine(scratch: &TempDir, policies: PolicySet) -> ExecutionEngine {
    let config = EngineConfig {
        scratch_base: Some(scratch.path().to_path_buf()),
        pool: PoolConfig {
            max_concurrent: 4,
            max_queue_depth: 8,
        },
        rate_limits: RateLimitConfig::unlimited(),
        ..EngineConfig::default()
    };
    create_engine_with_options(
        EngineOptions::default()
            .with_config(config)
            .with_policies(policies),
    )
    .unwrap()
}

fn confined(engine: &ExecutionEngine) -> bool {
    if engine.backend_capabilities().filesystem_confinement {
        true
    } else {
        eprintln!("filesystem confinement unavailable, skipping");
        false
    }
}

fn permissive() -> PolicySet {
    PolicySet::default().with_policy(Language::Python, SecurityPolicy::permissive())
}

#[tokio::test]
async fn test_hello_world_completes() {
    if !python_available() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());

    let result = engine
        .execute(
            ExecutionRequest::new(Language::Python, "print('hello')")
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::Completed, "{}", result.stderr());
    assert_eq!(result.stdout(), "hello\n");
    assert_eq!(result.exit_code(), Some(0));
    assert!(!result.truncated());
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    if !python_available() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());

    let result = engine
        .execute(
            ExecutionRequest::new(Language::Python, "while True: pass")
                .with_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::TimedOut);
    assert!(result.duration() >= Duration::from_secs(2));
    assert!(
        result.duration() < Duration::from_millis(2250),
        "{:?}",
        result.duration()
    );
}

#[tokio::test]
async fn test_runtime_errors_are_completed_runs() {
    if !python_available() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());

    let result = engine
        .execute(ExecutionRequest::new(Language::Python, "print(1 / 0)"))
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::Completed);
    assert_ne!(result.exit_code(), Some(0));
    assert!(result.stderr().contains("ZeroDivisionError"));
    assert!(!result.status().is_system_fault());
}

#[tokio::test]
async fn test_large_output_is_truncated() {
    if !python_available() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());

    // About 1 MB of output
    let source = "for i in range(20000):\n    print('x' * 49)\n";
    let result = engine
        .execute(
            ExecutionRequest::new(Language::Python, source)
                .with_timeout(Duration::from_secs(10))
                .with_max_output(10 * 1024),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::Completed, "{}", result.stderr());
    assert!(result.truncated());
    assert_eq!(result.stdout().len(), 10 * 1024);
}

#[tokio::test]
async fn test_memory_ceiling() {
    if !python_available() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());

    let source = "import time\n\
                  blocks = []\n\
                  while True:\n    \
                      blocks.append(bytearray(1024 * 1024))\n    \
                      time.sleep(0.005)\n";
    let result = engine
        .execute(
            ExecutionRequest::new(Language::Python, source)
                .with_timeout(Duration::from_secs(10))
                .with_memory_limit(64 * 1024 * 1024),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::MemoryExceeded, "{}", result.stderr());
}

#[tokio::test]
async fn test_raised_memory_error_is_a_completed_run() {
    if !python_available() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());

    let result = engine
        .execute(
            ExecutionRequest::new(Language::Python, "raise MemoryError('student raised this')")
                .with_memory_limit(64 * 1024 * 1024),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::Completed, "{}", result.stderr());
    assert_ne!(result.exit_code(), Some(0));
    assert!(result.stderr().contains("MemoryError: student raised this"));
}

#[cfg(target_os = "linux")]
fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        // A zombie has been killed and only waits to be reaped by init
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_abort_kills_the_whole_group() {
    if !python_available() || which::which("sleep").is_err() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, permissive());

    let source = "import subprocess, time\n\
                  child = subprocess.Popen(['sleep', '60'])\n\
                  print(child.pid, flush=True)\n\
                  time.sleep(60)\n";
    let abort = AbortToken::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let result = engine
        .execute_with_abort(
            ExecutionRequest::new(Language::Python, source).with_timeout(Duration::from_secs(20)),
            abort,
        )
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::Killed);
    assert!(result.duration() < Duration::from_secs(10));

    let child: i32 = result
        .stdout()
        .trim()
        .parse()
        .expect("program printed its child pid");
    let mut gone = false;
    for _ in 0..40 {
        if process_gone(child) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "grandchild {} survived the abort", child);
}

#[tokio::test]
async fn test_host_paths_outside_scratch_are_denied() {
    if !python_available() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());
    if !confined(&engine) {
        return;
    }
    let outside = tempfile::tempdir().unwrap();
    let planted = outside.path().join("escape.zip");
    let existing = outside.path().join("notes.txt");
    std::fs::write(&existing, "host data").unwrap();

    let source = format!(
        "import zipfile\n\
         with zipfile.ZipFile('local.zip', 'w') as archive:\n    \
             archive.writestr('note.txt', 'inside')\n\
         print('local ok')\n\
         for path, mode in (('{planted}', 'w'), ('{existing}', 'r')):\n    \
             try:\n        \
                 zipfile.ZipFile(path, mode).close()\n        \
                 print('reached', mode)\n    \
             except PermissionError:\n        \
                 print('denied', mode)\n",
        planted = planted.display(),
        existing = existing.display(),
    );
    let result = engine
        .execute(ExecutionRequest::new(Language::Python, source))
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::Completed, "{}", result.stderr());
    assert_eq!(result.stdout(), "local ok\ndenied w\ndenied r\n");
    assert!(!planted.exists());
}

#[tokio::test]
async fn test_concurrent_runs_do_not_share_scratch() {
    if !python_available() {
        return;
    }
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());
    if !confined(&engine) {
        return;
    }

    let writer = "import time, zipfile\n\
                  with zipfile.ZipFile('secret_alpha.zip', 'w') as archive:\n    \
                      archive.writestr('secret.txt', 'alpha')\n\
                  time.sleep(1.0)\n\
                  print('done')\n";
    // Archives the parent directory, which holds every run's scratch
    let reader = "import tarfile\n\
                  try:\n    \
                      with tarfile.open('listing.tar', 'w') as archive:\n        \
                          archive.add('..')\n    \
                      print(archive.getnames())\n\
                  except PermissionError:\n    \
                      print('denied')\n";

    let (a, b) = tokio::join!(
        engine.execute(ExecutionRequest::new(Language::Python, writer)),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            engine
                .execute(ExecutionRequest::new(Language::Python, reader))
                .await
        },
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.status(), ExecutionStatus::Completed, "{}", a.stderr());
    assert_eq!(b.status(), ExecutionStatus::Completed, "{}", b.stderr());
    assert_eq!(a.stdout(), "done\n");
    assert_eq!(b.stdout(), "denied\n");
    assert!(!b.stdout().contains("secret_alpha"));

    // Workspaces are removed once the runs finish
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_policy_violation_reports_construct() {
    let scratch = tempfile::tempdir().unwrap();
    let engine = engine(&scratch, PolicySet::default());

    let result = engine
        .execute(ExecutionRequest::new(
            Language::Python,
            "import os\nos.system('ls')",
        ))
        .await
        .unwrap();

    assert_eq!(result.status(), ExecutionStatus::SecurityViolation);
    let violation = result.violation().unwrap();
    assert_eq!(violation.construct, "os");
    assert_eq!(violation.line, 1);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}
