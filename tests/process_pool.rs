//! Integration tests for process-worker pools.
//!
//! Runs without the libtest harness: this binary doubles as its own worker
//! through current-exe re-execution, so `main` hands control to
//! `worker::run_if_worker` before any scenario runs.

use std::time::{Duration, Instant};

use serde_json::{Value, json};

use offload::{Pool, PoolConfig, PoolError, Registry, RemoteError, Reply, WorkerKind};

fn worker_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_sync("add", |params| {
        let a = params[0].as_i64().unwrap_or(0);
        let b = params[1].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });
    registry.register_sync("boom", |_params| Err(RemoteError::new("x")));
    registry.register("sleep", |params: Vec<Value>, _cx| async move {
        let ms = params.first().and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Reply::from(json!("slept")))
    });
    registry.register_sync("die", |_params| std::process::exit(7));
    registry
}

fn process_pool() -> Pool {
    Pool::new(
        PoolConfig::new()
            .with_worker_kind(WorkerKind::Process)
            .with_min_workers(1)
            .with_max_workers(2)
            .with_worker_terminate_timeout(Duration::from_millis(800)),
    )
    .expect("pool construction failed")
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

async fn exec_roundtrip(pool: &Pool) {
    let result = pool.exec("add", vec![json!(2), json!(3)]).unwrap().await;
    assert_eq!(result.unwrap(), json!(5));
}

async fn remote_error(pool: &Pool) {
    match pool.exec("boom", vec![]).unwrap().await {
        Err(PoolError::Remote(err)) => assert_eq!(err.message, "x"),
        other => panic!("expected remote error, got {:?}", other),
    }
}

async fn crash_rejects_and_replaces(pool: &Pool) {
    match pool.exec("die", vec![]).unwrap().await {
        Err(PoolError::WorkerCrashed(report)) => {
            assert!(report.to_string().contains("exited with code 7"));
        }
        other => panic!("expected crash error, got {:?}", other),
    }
    // min_workers restores the pool after the crash.
    assert!(
        wait_until(Duration::from_secs(5), || pool.stats().total_workers == 1).await,
        "crashed worker was not replaced"
    );
    exec_roundtrip(pool).await;
}

async fn timeout_destroys_stuck_worker(pool: &Pool) {
    let fut = pool
        .exec("sleep", vec![json!(60_000)])
        .unwrap()
        .timeout(Duration::from_millis(150));
    match fut.await {
        Err(PoolError::TimedOut(after)) => assert_eq!(after, Duration::from_millis(150)),
        other => panic!("expected timeout, got {:?}", other),
    }
    // No abort listeners are registered: the worker goes down and is
    // replaced, and the pool keeps serving.
    assert!(
        wait_until(Duration::from_secs(5), || {
            let stats = pool.stats();
            stats.total_workers == 1 && stats.busy_workers == 0
        })
        .await,
        "stuck worker was not replaced"
    );
    exec_roundtrip(pool).await;
}

async fn default_worker_binary_serves_builtins() {
    let pool = Pool::new(
        PoolConfig::new()
            .with_worker_kind(WorkerKind::Process)
            .with_worker_script(env!("CARGO_BIN_EXE_offload-worker"))
            .with_max_workers(1),
    )
    .expect("pool construction failed");

    let proxy = pool.proxy().await.expect("proxy query failed");
    assert!(proxy.methods().contains(&"methods".to_string()));
    assert!(proxy.methods().contains(&"run".to_string()));

    // The default worker has no user methods.
    match pool.exec("add", vec![json!(1), json!(2)]).unwrap().await {
        Err(PoolError::Remote(err)) => assert_eq!(err.name, "MethodNotFound"),
        other => panic!("expected unknown-method error, got {:?}", other),
    }
    pool.terminate(false, None).await;
}

async fn graceful_terminate_waits_for_exit() {
    let pool = process_pool();
    exec_roundtrip(&pool).await;
    pool.terminate(false, None).await;
    assert!(matches!(
        pool.exec("add", vec![]),
        Err(PoolError::PoolTerminated)
    ));
}

fn main() {
    // Worker children re-enter here; this call diverges for them.
    offload::worker::run_if_worker(worker_registry);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build test runtime");

    rt.block_on(async {
        let pool = process_pool();
        exec_roundtrip(&pool).await;
        remote_error(&pool).await;
        crash_rejects_and_replaces(&pool).await;
        timeout_destroys_stuck_worker(&pool).await;
        pool.terminate(true, None).await;

        default_worker_binary_serves_builtins().await;
        graceful_terminate_waits_for_exit().await;
    });

    println!("process_pool: all scenarios passed");
}
