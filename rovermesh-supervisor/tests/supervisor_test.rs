//! Supervisor tests against real child processes (`sh` one-liners).

use rovermesh_supervisor::{RestartPolicy, Supervisor, SupervisorError};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep, timeout};

async fn wait_until<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !condition().await {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn run_once_records_exit_code() {
    let supervisor = Supervisor::new();
    supervisor
        .create("job", "sh -c 'exit 3'", RestartPolicy::RunOnce)
        .await
        .expect("create");
    supervisor.start("job").await.expect("start");

    let supervisor_ref = &supervisor;
    wait_until("the child to exit", || async {
        matches!(
            supervisor_ref.status("job").await,
            Some(status) if !status.running && status.exit_code == Some(3)
        )
    })
    .await;

    // RunOnce does not restart, even on a nonzero exit
    sleep(Duration::from_millis(300)).await;
    let status = supervisor.status("job").await.expect("status");
    assert!(!status.running);
    assert_eq!(status.exit_code, Some(3));
}

#[tokio::test]
async fn restart_on_crash_restarts_until_stopped() {
    let supervisor = Supervisor::new();
    supervisor
        .create(
            "crasher",
            "sh -c 'sleep 0.15; exit 1'",
            RestartPolicy::RestartOnCrash,
        )
        .await
        .expect("create");
    supervisor.start("crasher").await.expect("start");

    // sample pids for a while; a restarting entry shows several
    let mut pids = HashSet::new();
    for _ in 0..40 {
        if let Some(status) = supervisor.status("crasher").await {
            if let Some(pid) = status.pid {
                pids.insert(pid);
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(pids.len() >= 2, "expected restarts, saw pids {pids:?}");

    supervisor
        .stop("crasher", Duration::from_secs(1))
        .await
        .expect("stop");

    // stopped means stopped: no respawn afterwards
    sleep(Duration::from_millis(500)).await;
    let status = supervisor.status("crasher").await.expect("status");
    assert!(!status.running);
}

#[tokio::test]
async fn zero_exit_is_not_a_crash() {
    let supervisor = Supervisor::new();
    supervisor
        .create("clean", "sh -c 'exit 0'", RestartPolicy::RestartOnCrash)
        .await
        .expect("create");
    supervisor.start("clean").await.expect("start");

    let supervisor_ref = &supervisor;
    wait_until("the child to exit", || async {
        matches!(
            supervisor_ref.status("clean").await,
            Some(status) if !status.running && status.exit_code == Some(0)
        )
    })
    .await;

    sleep(Duration::from_millis(300)).await;
    let status = supervisor.status("clean").await.expect("status");
    assert!(!status.running, "clean exit must not restart");
}

#[tokio::test]
async fn name_conflict_is_rejected() {
    let supervisor = Supervisor::new();
    supervisor
        .create("job", "sleep 10", RestartPolicy::RunOnce)
        .await
        .expect("create");
    let err = supervisor
        .create("job", "sleep 20", RestartPolicy::RunOnce)
        .await
        .expect_err("duplicate name must fail");
    assert!(matches!(err, SupervisorError::NameConflict(_)));

    // the original entry is untouched
    let status = supervisor.status("job").await.expect("status");
    assert_eq!(status.command, "sleep 10");
}

#[tokio::test]
async fn start_unknown_process_fails() {
    let supervisor = Supervisor::new();
    let err = supervisor.start("ghost").await.expect_err("must fail");
    assert!(matches!(err, SupervisorError::UnknownProcess(_)));
}

#[tokio::test]
async fn bad_command_fails_without_spawning() {
    let supervisor = Supervisor::new();
    supervisor
        .create("broken", "sh -c 'unterminated", RestartPolicy::RunOnce)
        .await
        .expect("create");
    let err = supervisor.start("broken").await.expect_err("must fail");
    assert!(matches!(err, SupervisorError::BadCommand(_)));
}

#[tokio::test]
async fn stop_escalates_to_sigkill() {
    let supervisor = Supervisor::new();
    supervisor
        .create(
            "stubborn",
            "sh -c 'trap \"\" TERM; while true; do sleep 0.1; done'",
            RestartPolicy::RunOnce,
        )
        .await
        .expect("create");
    supervisor.start("stubborn").await.expect("start");

    // give the shell a moment to install the trap
    sleep(Duration::from_millis(300)).await;

    timeout(
        Duration::from_secs(5),
        supervisor.stop("stubborn", Duration::from_millis(300)),
    )
    .await
    .expect("stop hung")
    .expect("stop failed");

    let status = supervisor.status("stubborn").await.expect("status");
    assert!(!status.running);
}

mod remote {
    use super::*;
    use rovermesh_network::{Kwargs, Member, MeshConfig};
    use serde_json::json;

    fn test_config(tag: &str) -> MeshConfig {
        MeshConfig::new(format!("{tag}-{:08x}", rand::random::<u32>()))
    }

    #[tokio::test]
    async fn remote_create_start_stop() {
        let config = test_config("manager");
        let manager = Member::new("manager", config.clone());
        let client = Member::new("client", config);

        let supervisor = Supervisor::new();
        supervisor.attach(&manager);

        manager.start().await.expect("manager start");
        client.start().await.expect("client start");

        // discovery can take a couple of beacons
        let spec = json!({
            "name": "remote-job",
            "command": "sh -c 'sleep 5'",
            "policy": "RunOnce",
        });
        let reply = timeout(Duration::from_secs(5), async {
            loop {
                match client
                    .request("manager", "createProcess", vec![spec.clone()], Kwargs::new())
                    .await
                {
                    Ok(reply) => return reply,
                    Err(_) => sleep(Duration::from_millis(100)).await,
                }
            }
        })
        .await
        .expect("createProcess never answered");
        assert_eq!(reply, json!("ok"));

        let status = supervisor.status("remote-job").await.expect("status");
        assert!(status.running);

        // a second create with the same name propagates the conflict
        let conflict = client
            .request("manager", "createProcess", vec![spec], Kwargs::new())
            .await
            .expect("request failed");
        assert!(conflict.get("error").is_some(), "got {conflict}");

        let reply = client
            .request("manager", "stop", vec![json!("remote-job")], Kwargs::new())
            .await
            .expect("stop request failed");
        assert_eq!(reply, json!("ok"));

        let status = supervisor.status("remote-job").await.expect("status");
        assert!(!status.running);

        client.stop().await;
        manager.stop().await;
    }
}
