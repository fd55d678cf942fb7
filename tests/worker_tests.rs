use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_json_diff::assert_json_include;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use sandbox_exec::config::Config;
use sandbox_exec::env::environ::EnvironConfig;
use sandbox_exec::env::{EnvironmentPool, LocalEnvironmentBuilder};
use sandbox_exec::envexec::Status;
use sandbox_exec::filestore::{FileStore, MemoryFileStore};
use sandbox_exec::worker::{Request, Response, StreamEvent, Worker, WorkerConfig, WorkerState};

struct TestWorker {
    worker: Worker,
    store: Arc<MemoryFileStore>,
    env_pool: Arc<EnvironmentPool>,
    _dir: TempDir,
}

fn worker(parallelism: usize) -> TestWorker {
    let dir = tempfile::tempdir().unwrap();
    let builder =
        LocalEnvironmentBuilder::new(dir.path().join("envs"), None, EnvironConfig::default());
    let env_pool = Arc::new(EnvironmentPool::new(builder));
    let store = Arc::new(MemoryFileStore::new());
    let config = Config {
        parallelism,
        work_dir: Some(dir.path().to_path_buf()),
        time_limit_tick_interval: sandbox_exec::config::MilliSecond(10),
        ..Default::default()
    };
    let worker = Worker::new(WorkerConfig::new(&config, store.clone(), env_pool.clone()));
    TestWorker {
        worker,
        store,
        env_pool,
        _dir: dir,
    }
}

fn request(value: serde_json::Value) -> Request {
    serde_json::from_value(value).unwrap()
}

fn echo_request(id: &str, text: &str) -> Request {
    request(json!({
        "request_id": id,
        "cmd": [{
            "args": ["/bin/echo", text],
            "files": [null, {"name": "stdout", "max": 1024}, {"name": "stderr", "max": 1024}],
            "cpu_limit": 1_000_000_000u64,
            "memory_limit": "256m",
        }],
    }))
}

#[tokio::test]
async fn test_response_shape() {
    let t = worker(2);
    t.worker.start();

    let response = t
        .worker
        .submit(CancellationToken::new(), echo_request("req-1", "hello"))
        .await;
    let actual = serde_json::to_value(&response).unwrap();
    assert_json_include!(
        actual: actual,
        expected: json!({
            "request_id": "req-1",
            "results": [{
                "status": "Accepted",
                "exit_status": 0,
                "files": {"stdout": "hello\n", "stderr": ""},
            }],
        })
    );
    assert!(actual.get("error").is_none());

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_copy_out_cached_goes_to_store() {
    let t = worker(1);
    t.worker.start();

    let req = request(json!({
        "request_id": "cached",
        "cmd": [{
            "args": ["/bin/sh", "-c", "printf answer > result.txt"],
            "files": [null, {"name": "stdout", "max": 1024}, {"name": "stderr", "max": 1024}],
            "copy_out_cached": ["result.txt"],
            "copy_out": ["other.txt?"],
        }],
    }));
    let response = t.worker.submit(CancellationToken::new(), req).await;
    assert_eq!(response.error, None);
    let result = &response.results[0];
    assert_eq!(result.status, Status::Accepted);
    assert!(!result.files.contains_key("result.txt"));

    let id = &result.file_ids["result.txt"];
    let (name, file) = t.store.get(id).unwrap();
    assert_eq!(name, "result.txt");
    let mut content = String::new();
    file.into_reader().unwrap().read_to_string(&mut content).unwrap();
    assert_eq!(content, "answer");

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_cached_copy_in() {
    let t = worker(1);
    t.worker.start();
    let id = sandbox_exec::filestore::store_bytes(t.store.as_ref(), "in.txt", b"from store\n").unwrap();

    let req = request(json!({
        "cmd": [{
            "args": ["/bin/cat", "data.txt"],
            "files": [null, {"name": "stdout", "max": 1024}],
            "copy_in": {"data.txt": {"file_id": id}},
        }],
    }));
    let response = t.worker.submit(CancellationToken::new(), req).await;
    assert_eq!(response.results[0].status, Status::Accepted);
    assert_eq!(response.results[0].files["stdout"], b"from store\n");

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_unknown_file_id_is_request_error() {
    let t = worker(1);
    t.worker.start();

    let req = request(json!({
        "request_id": "bad",
        "cmd": [{"args": ["/bin/true"], "files": [{"file_id": "missing"}]}],
    }));
    let response = t.worker.submit(CancellationToken::new(), req).await;
    assert!(response.results.is_empty());
    assert!(response.error.unwrap().contains("missing"));

    let response = t
        .worker
        .submit(CancellationToken::new(), request(json!({"request_id": "empty"})))
        .await;
    assert_eq!(response.error.as_deref(), Some("no cmd provided"));

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_failed_prepare_returns_environments() {
    let t = worker(1);
    t.worker.start();

    let req = request(json!({
        "request_id": "bad-second",
        "cmd": [
            {"args": ["/bin/true"]},
            {"args": ["/bin/true"], "files": [{"file_id": "missing"}]},
        ],
    }));
    let response = t.worker.submit(CancellationToken::new(), req).await;
    assert!(response.error.unwrap().contains("missing"));
    assert_eq!(t.env_pool.idle(), 2);

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_lifecycle() {
    let t = worker(2);
    let response = t
        .worker
        .submit(CancellationToken::new(), echo_request("early", "x"))
        .await;
    assert_eq!(response.error.as_deref(), Some("worker is not running"));
    assert_eq!(t.worker.state(), WorkerState::Created);

    t.worker.start();
    t.worker.start();
    assert_eq!(t.worker.state(), WorkerState::Running);

    let response = t
        .worker
        .submit(CancellationToken::new(), echo_request("ok", "x"))
        .await;
    assert_eq!(response.results[0].status, Status::Accepted);

    t.worker.shutdown().await;
    t.worker.shutdown().await;
    assert_eq!(t.worker.state(), WorkerState::Stopped);

    let response = t
        .worker
        .submit(CancellationToken::new(), echo_request("late", "x"))
        .await;
    assert!(response.error.is_some());
}

#[tokio::test]
async fn test_parallel_submissions() {
    let t = Arc::new(worker(4));
    t.worker.start();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let t = t.clone();
        tasks.push(tokio::spawn(async move {
            let text = format!("job {i}");
            let response = t
                .worker
                .submit(CancellationToken::new(), echo_request(&i.to_string(), &text))
                .await;
            assert_eq!(response.request_id, i.to_string());
            assert_eq!(response.results[0].files["stdout"], format!("{text}\n").into_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_pipe_mapping() {
    let t = worker(1);
    t.worker.start();

    let req = request(json!({
        "cmd": [
            {
                "args": ["/bin/echo", "through the pipe"],
                "files": [null, null, {"name": "stderr", "max": 1024}],
            },
            {
                "args": ["/bin/cat"],
                "files": [null, {"name": "stdout", "max": 1024}, {"name": "stderr", "max": 1024}],
            },
        ],
        "pipe_mapping": [{"in": {"index": 0, "fd": 1}, "out": {"index": 1, "fd": 0}}],
    }));
    // fd 0 of the first command has nothing bound
    let response = t.worker.submit(CancellationToken::new(), req).await;
    assert!(response.error.unwrap().contains("not resolved"));

    let req = request(json!({
        "cmd": [
            {
                "args": ["/bin/echo", "through the pipe"],
                "files": [{"content": ""}, null, {"name": "stderr", "max": 1024}],
            },
            {
                "args": ["/bin/cat"],
                "files": [null, {"name": "stdout", "max": 1024}, {"name": "stderr", "max": 1024}],
            },
        ],
        "pipe_mapping": [{
            "in": {"index": 0, "fd": 1},
            "out": {"index": 1, "fd": 0},
            "proxy": true,
            "name": "captured",
            "max": 1024,
        }],
    }));
    let response = t.worker.submit(CancellationToken::new(), req).await;
    assert_eq!(response.error, None);
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].files["captured"], b"through the pipe\n");
    assert_eq!(response.results[1].files["stdout"], b"through the pipe\n");

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_before_execute() {
    let t = worker(1);
    t.worker.start();

    let ctx = CancellationToken::new();
    ctx.cancel();
    let response = t.worker.submit(ctx, echo_request("cancelled", "x")).await;
    assert_eq!(response.error.as_deref(), Some("cancelled before execute"));

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_request_is_signalled() {
    let t = worker(1);
    t.worker.start();

    let req = request(json!({
        "cmd": [{
            "args": ["/bin/sleep", "10"],
            "cpu_limit": 20_000_000_000u64,
            "clock_limit": 20_000_000_000u64,
        }],
    }));
    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });
    let response = t.worker.submit(ctx, req).await;
    assert_eq!(response.results[0].status, Status::Signalled);

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_time_limit_exceeded() {
    let t = worker(1);
    t.worker.start();

    let req = request(json!({
        "cmd": [{
            "args": ["/bin/sleep", "5"],
            "cpu_limit": 100_000_000u64,
        }],
    }));
    let response = t.worker.submit(CancellationToken::new(), req).await;
    assert_eq!(response.results[0].status, Status::TimeLimitExceeded);

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_exec_observer_sees_every_response() {
    let dir = tempfile::tempdir().unwrap();
    let builder = LocalEnvironmentBuilder::new(dir.path().to_path_buf(), None, EnvironConfig::default());
    let config = Config {
        parallelism: 1,
        ..Default::default()
    };
    let mut worker_config = WorkerConfig::new(
        &config,
        Arc::new(MemoryFileStore::new()),
        Arc::new(EnvironmentPool::new(builder)),
    );
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    worker_config.exec_observer = Some(Arc::new(move |_: &Response| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let worker = Worker::new(worker_config);
    worker.start();

    worker.submit(CancellationToken::new(), echo_request("a", "x")).await;
    worker
        .execute(&CancellationToken::new(), echo_request("b", "y"))
        .await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_stream_session() {
    let t = worker(1);
    t.worker.start();

    let req = request(json!({
        "request_id": "stream",
        "cmd": [{
            "args": ["/bin/cat"],
            "files": [{"stream_in": "stdin"}, {"stream_out": "stdout"}, {"name": "stderr", "max": 1024}],
            "clock_limit": 10_000_000_000u64,
        }],
    }));
    let mut session = t.worker.stream(&CancellationToken::new(), req).await.unwrap();
    let mut input = session.input("stdin").unwrap();
    tokio::task::spawn_blocking(move || {
        input.write_all(b"ping\n").unwrap();
        input.close().unwrap();
    })
    .await
    .unwrap();

    let mut output = Vec::new();
    let response = loop {
        match session.next_event().await.unwrap() {
            StreamEvent::Output { name, content } => {
                assert_eq!(name, "stdout");
                output.extend(content);
            }
            StreamEvent::Finished(response) => break response,
        }
    };
    assert_eq!(output, b"ping\n");
    assert_eq!(response.request_id, "stream");
    assert_eq!(response.results[0].status, Status::Accepted);
    assert!(session.next_event().await.is_none());

    t.worker.shutdown().await;
}

#[tokio::test]
async fn test_stream_files_rejected_outside_session() {
    let t = worker(1);
    t.worker.start();

    let req = request(json!({
        "cmd": [{"args": ["/bin/cat"], "files": [{"stream_in": "stdin"}]}],
    }));
    let response = t.worker.submit(CancellationToken::new(), req).await;
    assert!(response.error.unwrap().contains("streaming session"));

    t.worker.shutdown().await;
}
