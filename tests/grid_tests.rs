//! End-to-end tests: a driver on a loopback port and real node agents
//! running shell tasks.


use std::sync::Arc;
use std::time::Duration;

use gridlite::policy::system_info::{NODE_RESERVED_JOB, NODE_RESERVED_UUID};
use gridlite::policy::{ExecutionPolicy, SystemInfo};
use gridlite::scheduler::job::{JobSpec, JobStatus, TaskState};
use gridlite::scheduler::reservation::ReservationState;
use gridlite::scheduler::sla::JobSla;
use test_harness::{assert_eventually, outcome, test_driver_config, wait_done, TestGrid};

const JOB_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_dispatched(job: &Arc<gridlite::scheduler::Job>) {
    let job = Arc::clone(job);
    assert_eventually(
        || {
            let job = Arc::clone(&job);
            async move { !job.lock().await.dispatches.is_empty() }
        },
        Duration::from_secs(5),
        "job was never dispatched",
    )
    .await;
}

#[tokio::test]
async fn echo_job_completes() {
    let grid = TestGrid::start(test_driver_config()).await;
    let _node = grid.spawn_agent(grid.agent_config("node-1"));
    grid.wait_for_nodes(1).await;

    let job = grid
        .ctx
        .submit_job(JobSpec::new("echo", ["echo hello", "echo world"]))
        .await
        .unwrap();
    wait_done(&job, JOB_TIMEOUT).await;

    assert_eq!(job.lock().await.status(), JobStatus::Completed);
    assert!(grid.ctx.queue.get(&job.uuid()).await.is_some());
    assert_eq!(outcome(&job, 0).await.output.as_deref(), Some("hello\n"));
    assert_eq!(outcome(&job, 1).await.output.as_deref(), Some("world\n"));
    // finished jobs leave the dispatchable set but stay visible
    let ctx = Arc::clone(&grid.ctx);
    assert_eventually(
        || {
            let ctx = Arc::clone(&ctx);
            async move {
                let stats = ctx.stats.snapshot();
                ctx.queue.is_empty().await && stats.jobs_completed == 1 && stats.tasks_completed == 2
            }
        },
        Duration::from_secs(2),
        "finished job was not retired",
    )
    .await;
    grid.shutdown().await;
}

#[tokio::test]
async fn tempfail_is_resubmitted_until_the_limit() {
    let grid = TestGrid::start(test_driver_config()).await;
    let _node = grid.spawn_agent(grid.agent_config("node-1"));
    grid.wait_for_nodes(1).await;

    let spec = JobSpec::new("flaky", ["exit 75"]).with_sla(JobSla::default().with_max_task_resubmits(1));
    let job = grid.ctx.submit_job(spec).await.unwrap();
    wait_done(&job, JOB_TIMEOUT).await;

    let result = outcome(&job, 0).await;
    assert_eq!(result.exit_code, Some(75));
    assert_eq!(job.lock().await.tasks[0].resubmit_count, 2);
    assert_eq!(grid.ctx.stats.snapshot().tasks_resubmitted, 1);
    grid.shutdown().await;
}

#[tokio::test]
async fn cancel_stops_running_tasks() {
    let grid = TestGrid::start(test_driver_config()).await;
    let _node = grid.spawn_agent(grid.agent_config("node-1"));
    grid.wait_for_nodes(1).await;

    let job = grid.ctx.submit_job(JobSpec::new("slow", ["sleep 30"])).await.unwrap();
    wait_dispatched(&job).await;
    assert!(grid.ctx.cancel_job(job.uuid()).await.unwrap());
    // a second cancel is a no-op, or the job is already gone
    assert!(!matches!(grid.ctx.cancel_job(job.uuid()).await, Ok(true)));

    wait_done(&job, JOB_TIMEOUT).await;
    let state = job.lock().await;
    assert_eq!(state.status(), JobStatus::Cancelled);
    assert_eq!(state.tasks[0].state, TaskState::Cancelled);
    assert!(state.tasks[0].result.is_none());
    drop(state);
    grid.shutdown().await;
}

#[tokio::test]
async fn unit_of_lost_node_runs_elsewhere() {
    let grid = TestGrid::start(test_driver_config()).await;
    let first = grid.spawn_agent(grid.agent_config("node-1"));
    grid.wait_for_nodes(1).await;

    let job = grid
        .ctx
        .submit_job(JobSpec::new("moved", ["sleep 1; echo done"]))
        .await
        .unwrap();
    wait_dispatched(&job).await;
    first.kill().await;

    let _second = grid.spawn_agent(grid.agent_config("node-2"));
    wait_done(&job, JOB_TIMEOUT).await;

    assert_eq!(outcome(&job, 0).await.output.as_deref(), Some("done\n"));
    // node failures do not count against the resubmit limit
    assert_eq!(job.lock().await.tasks[0].resubmit_count, 0);
    assert_eq!(grid.ctx.stats.snapshot().tasks_resubmitted, 1);
    grid.shutdown().await;
}

#[tokio::test]
async fn offline_node_delivers_results_on_reconnect() {
    let grid = TestGrid::start(test_driver_config()).await;
    let _node = grid.spawn_agent(grid.agent_config("offline-1").with_offline(true));
    grid.wait_for_nodes(1).await;

    let job = grid
        .ctx
        .submit_job(JobSpec::new("offline", ["sleep 0.2; echo later"]))
        .await
        .unwrap();
    wait_done(&job, JOB_TIMEOUT).await;

    assert_eq!(outcome(&job, 0).await.output.as_deref(), Some("later\n"));
    assert!(grid.ctx.offline.is_empty().await);
    assert_eq!(grid.ctx.stats.snapshot().tasks_resubmitted, 0);
    grid.shutdown().await;
}

#[tokio::test]
async fn expired_dispatch_is_cancelled() {
    let grid = TestGrid::start(test_driver_config()).await;
    let _node = grid.spawn_agent(grid.agent_config("node-1"));
    grid.wait_for_nodes(1).await;

    let mut sla = JobSla::default().with_dispatch_expiration_ms(100);
    sla.max_dispatch_expirations = 0;
    let job = grid
        .ctx
        .submit_job(JobSpec::new("stuck", ["sleep 30"]).with_sla(sla))
        .await
        .unwrap();
    wait_done(&job, JOB_TIMEOUT).await;

    let state = job.lock().await;
    assert_eq!(state.tasks[0].state, TaskState::Cancelled);
    assert_eq!(state.tasks[0].expiration_count, 1);
    drop(state);
    assert_eq!(grid.ctx.stats.snapshot().dispatch_expirations, 1);
    grid.shutdown().await;
}

#[tokio::test]
async fn job_waits_for_a_matching_node() {
    let grid = TestGrid::start(test_driver_config()).await;
    let _plain = grid.spawn_agent(grid.agent_config("plain"));
    grid.wait_for_nodes(1).await;

    let sla = JobSla::default().with_execution_policy(ExecutionPolicy::is_true("gpu"));
    let job = grid
        .ctx
        .submit_job(JobSpec::new("gpu", ["echo rendered"]).with_sla(sla))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!job.is_done());
    assert!(job.lock().await.dispatches.is_empty());

    let _gpu = grid.spawn_agent(grid.agent_config("gpu-node").with_property("gpu", "true"));
    wait_done(&job, JOB_TIMEOUT).await;
    assert_eq!(outcome(&job, 0).await.output.as_deref(), Some("rendered\n"));
    grid.shutdown().await;
}

#[tokio::test]
async fn reserved_node_restarts_with_desired_configuration() {
    let grid = TestGrid::start(test_driver_config()).await;
    let _node = grid.spawn_agent(grid.agent_config("node-1").with_property("mode", "slow"));
    grid.wait_for_nodes(1).await;

    let sla = JobSla::default().with_desired_configuration(SystemInfo::new().with("mode", "fast"));
    let job = grid
        .ctx
        .submit_job(JobSpec::new("tuned", ["echo tuned"]).with_sla(sla))
        .await
        .unwrap();
    wait_done(&job, JOB_TIMEOUT).await;
    assert_eq!(outcome(&job, 0).await.output.as_deref(), Some("tuned\n"));

    let channel = grid.ctx.channel_by_node("node-1").await.unwrap();
    let state = channel.lock().await;
    assert_eq!(state.system_info.get("mode"), Some("fast"));
    let reserved_job = job.uuid().to_string();
    assert_eq!(state.system_info.get(NODE_RESERVED_JOB), Some(reserved_job.as_str()));
    assert_eq!(state.system_info.get(NODE_RESERVED_UUID), Some("node-1"));
    drop(state);
    // finishing the job releases the reservation
    let ctx = Arc::clone(&grid.ctx);
    assert_eventually(
        || {
            let ctx = Arc::clone(&ctx);
            async move { ctx.reservations.state_of("node-1").await == ReservationState::None }
        },
        Duration::from_secs(2),
        "reservation was not released",
    )
    .await;
    grid.shutdown().await;
}
