//! Session scenarios against the in-memory runtime

use sandpit_core::runtime::SandboxRuntime;
use sandpit_core::testing::{Behavior, MemoryRuntime};
use sandpit_core::{ErrorKind, ManagerConfig, SandboxManager, SandpitError, SessionKey};
use std::sync::Arc;
use std::time::Duration;

fn key(s: &str) -> SessionKey {
    SessionKey::new(s).unwrap()
}

fn python_manager() -> (Arc<MemoryRuntime>, Arc<SandboxManager>) {
    let runtime = Arc::new(MemoryRuntime::python());
    let manager = Arc::new(SandboxManager::new(runtime.clone(), ManagerConfig::default()));
    (runtime, manager)
}

#[tokio::test(start_paused = true)]
async fn playground_session_walkthrough() {
    let (_runtime, manager) = python_manager();
    let u1 = key("u1");

    manager.start(&u1).await.unwrap();

    let out = manager.execute(&u1, "print('hi')").await.unwrap();
    assert!(out.text.contains("hi"));
    assert_eq!(out.html, None);

    let err = manager.execute(&u1, "while True: pass").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionTimeout);

    let err = manager.execute(&u1, "1/0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
    assert!(err.message().contains("ZeroDivisionError"));
    assert!(err.message().contains("Traceback"));

    let report = manager.lint(&u1, "x = 1").await.unwrap();
    assert_eq!(report.report, "");

    manager.stop(&u1).await.unwrap();
    let err = manager.execute(&u1, "print(1)").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SandboxNotFound);
}

#[tokio::test]
async fn lint_mirrors_checker_exit_status() {
    let (_runtime, manager) = python_manager();
    let u1 = key("u1");
    manager.start(&u1).await.unwrap();

    let err = manager.lint(&u1, "x == 1\n").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LintFailure);
    assert!(err.message().contains("E001"));
    assert!(err.message().contains("script.py"));
}

#[tokio::test]
async fn lint_report_is_trimmed_on_success() {
    let runtime = Arc::new(MemoryRuntime::new(|call| {
        if call.program() == "ruff" {
            Behavior::exit(0, "\nAll checks passed!\n")
        } else {
            Behavior::exit(0, "")
        }
    }));
    let manager = SandboxManager::new(runtime, ManagerConfig::default());
    manager.start(&key("u1")).await.unwrap();

    let report = manager.lint(&key("u1"), "x = 1").await.unwrap();
    assert_eq!(report.report, "All checks passed!");
}

#[tokio::test(start_paused = true)]
async fn timeout_returns_within_deadline_and_kills() {
    let (runtime, manager) = python_manager();
    let u1 = key("u1");
    manager.start(&u1).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = manager.execute(&u1, "while True:\n  pass").await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SandpitError::ExecutionTimeout(30)));
    assert!(err.message().contains("30-second"));
    assert!(elapsed >= Duration::from_secs(30));
    assert!(elapsed < Duration::from_secs(31));
    assert_eq!(runtime.kills(&u1), 1);
    assert_eq!(runtime.restarts(&u1), 1);

    // the sandbox is usable again straight away
    let out = manager.execute(&u1, "print('again')").await.unwrap();
    assert_eq!(out.text, "again");
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_share_one_sandbox() {
    let runtime = Arc::new(MemoryRuntime::python().with_create_delay(Duration::from_millis(50)));
    let u1 = key("u1");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let runtime = Arc::clone(&runtime);
        let u1 = u1.clone();
        handles.push(tokio::spawn(async move {
            runtime.acquire(&u1).await.unwrap().into_sandbox().id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(runtime.created_count(), 1);
}

#[tokio::test]
async fn sessions_do_not_see_each_others_files() {
    let (runtime, manager) = python_manager();
    let (a, b) = (key("alice"), key("bob"));
    manager.start(&a).await.unwrap();
    manager.start(&b).await.unwrap();

    manager.execute(&a, "print('secret')").await.unwrap();
    let tabs: std::collections::BTreeMap<_, _> = [("notes.py".to_owned(), "A = 1".to_owned())].into_iter().collect();
    manager.save_tabs(&a, &tabs).await.unwrap();

    assert_eq!(runtime.file(&a, "/sandbox/script.py").as_deref(), Some("print('secret')"));
    assert!(runtime.file(&b, "/sandbox/script.py").is_none());
    assert!(runtime.file(&b, "/sandbox/tabs/notes.py").is_none());
    assert_ne!(runtime.sandbox_id(&a), runtime.sandbox_id(&b));
}

#[tokio::test(start_paused = true)]
async fn overlapping_runs_are_serialized() {
    let runtime = Arc::new(MemoryRuntime::new(|_| Behavior::Exit {
        code: 0,
        output: "tick".into(),
        after: Duration::from_secs(5),
    }));
    let manager = Arc::new(SandboxManager::new(runtime.clone(), ManagerConfig::default()));
    let u1 = key("u1");
    manager.start(&u1).await.unwrap();

    let started = tokio::time::Instant::now();
    let runs: Vec<_> = (0..3)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let u1 = u1.clone();
            tokio::spawn(async move { manager.execute(&u1, "work()").await })
        })
        .collect();
    for run in runs {
        assert_eq!(run.await.unwrap().unwrap().text, "tick");
    }

    assert_eq!(runtime.max_concurrent(&u1), 1);
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert_eq!(runtime.restarts(&u1), 3);
}

#[tokio::test(start_paused = true)]
async fn different_sessions_run_in_parallel() {
    let runtime = Arc::new(MemoryRuntime::new(|_| Behavior::Exit {
        code: 0,
        output: String::new(),
        after: Duration::from_secs(5),
    }));
    let manager = Arc::new(SandboxManager::new(runtime.clone(), ManagerConfig::default()));
    let sessions: Vec<_> = (0..4).map(|i| key(&format!("s{i}"))).collect();
    for session in &sessions {
        manager.start(session).await.unwrap();
    }

    let started = tokio::time::Instant::now();
    let runs: Vec<_> = sessions
        .iter()
        .cloned()
        .map(|session| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.execute(&session, "work()").await })
        })
        .collect();
    for run in runs {
        run.await.unwrap().unwrap();
    }

    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn restart_after_stop_gets_a_fresh_sandbox() {
    let (runtime, manager) = python_manager();
    let u1 = key("u1");

    manager.start(&u1).await.unwrap();
    let first = runtime.sandbox_id(&u1);
    manager.execute(&u1, "print(1)").await.unwrap();
    manager.stop(&u1).await.unwrap();

    manager.start(&u1).await.unwrap();
    assert_ne!(runtime.sandbox_id(&u1), first);
    assert!(runtime.file(&u1, "/sandbox/script.py").is_none());
    assert!(runtime.file(&u1, "/sandbox/playground.py").is_some());
}
