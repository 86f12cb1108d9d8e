// Integration tests for pledge::process::ProcessPool, driven against the
// pledge-worker binary built alongside them

use pledge::logging;
use pledge::{
    InlineRunner, ProcessPool, ProcessPoolConfig, PromiseRunner, PromiseState, TaskError, WorkItem,
};
use serde_json::json;
use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

fn worker_config(pool_size: usize) -> ProcessPoolConfig {
    ProcessPoolConfig::new(env!("CARGO_BIN_EXE_pledge-worker")).with_pool_size(pool_size)
}

fn pool(pool_size: usize) -> ProcessPool {
    logging::init_test();
    ProcessPool::new(worker_config(pool_size)).unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    // A registered function runs in a worker and its value comes back
    #[test]
    fn test_call_registered_function() {
        let pool = pool(1);
        assert_eq!(pool.call("add", vec![json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(
            pool.call("sum", vec![json!([0.5, 1.5, 2.0])]).unwrap(),
            json!(4.0)
        );
        assert_eq!(
            pool.call("echo", vec![json!({"nested": [1, "two"]})]).unwrap(),
            json!({"nested": [1, "two"]})
        );
    }

    // Typed decoding of the result
    #[test]
    fn test_wait_as() {
        let pool = pool(1);
        let handle = pool
            .submit(WorkItem::new("add", vec![json!(40), json!(2)]))
            .unwrap();
        assert_eq!(handle.function(), "add");
        assert_eq!(handle.wait_as::<i64>().unwrap(), 42);

        let handle = pool.submit(WorkItem::new("echo", vec![json!("text")])).unwrap();
        assert!(matches!(
            handle.wait_as::<u32>(),
            Err(TaskError::Transport { .. })
        ));
    }

    // Failures inside the worker come back as rejections
    #[test]
    fn test_task_rejections() {
        let pool = pool(1);

        assert_eq!(
            pool.call("missing", vec![]),
            Err(TaskError::UnknownFunction {
                name: "missing".into()
            })
        );
        assert_eq!(
            pool.call("add", vec![json!(1)]),
            Err(TaskError::Arity {
                function: "add".into(),
                expected: 2,
                actual: 1,
            })
        );
        assert!(matches!(
            pool.call("add", vec![json!("one"), json!(2)]),
            Err(TaskError::Argument { index: 0, .. })
        ));
        assert_eq!(
            pool.call("fail", vec![json!("no luck")]),
            Err(TaskError::Failed {
                function: "fail".into(),
                message: "no luck".into(),
            })
        );
        assert!(matches!(
            pool.call("add", vec![json!(i64::MAX), json!(1)]),
            Err(TaskError::Failed { message, .. }) if message.contains("overflows")
        ));

        // None of these cost the worker
        assert!(pool.errors().is_empty());
        assert_eq!(pool.call("add", vec![json!(1), json!(1)]).unwrap(), json!(2));
    }

    // A panicking task is reported and the worker keeps serving
    #[test]
    fn test_task_panic() {
        let pool = pool(1);
        let pid = pool.worker_pids()[0];

        assert!(matches!(
            pool.call("crash", vec![json!("worker test panic")]),
            Err(TaskError::Failed { message, .. }) if message.contains("worker test panic")
        ));
        assert_eq!(pool.call("pid", vec![]).unwrap(), json!(pid));
    }

    // Work items alternate between the workers
    #[test]
    fn test_round_robin_workers() {
        let pool = pool(2);
        let expected: HashSet<u32> = pool.worker_pids().into_iter().collect();
        assert_eq!(expected.len(), 2);

        let pids: Vec<u32> = (0..4)
            .map(|_| pool.submit(WorkItem::new("pid", vec![])).unwrap())
            .map(|handle| handle.wait_as::<u32>().unwrap())
            .collect();

        assert_ne!(pids[0], pids[1]);
        assert_eq!(pids[0], pids[2]);
        assert_eq!(pids[1], pids[3]);
        assert_eq!(pids.iter().copied().collect::<HashSet<_>>(), expected);
    }

    // Items run concurrently on different workers
    #[test]
    fn test_workers_run_in_parallel() {
        let pool = pool(2);
        let started = Instant::now();

        let handles: Vec<_> = (0..2)
            .map(|_| pool.submit(WorkItem::new("sleep_ms", vec![json!(300)])).unwrap())
            .collect();
        assert_eq!(pool.in_flight(), 2);
        for handle in handles {
            assert_eq!(handle.wait().unwrap(), json!(300));
        }

        assert!(started.elapsed() < Duration::from_millis(550));
        assert_eq!(pool.in_flight(), 0);
    }

    // Timing out leaves the item running
    #[test]
    fn test_wait_timeout() {
        let pool = pool(1);
        let handle = pool
            .submit(WorkItem::new("sleep_ms", vec![json!(200)]))
            .unwrap();

        let timeout = Duration::from_millis(20);
        assert_eq!(handle.wait_timeout(timeout), Err(TaskError::Timeout { timeout }));
        assert!(handle.try_result().is_none());
        assert_eq!(handle.wait().unwrap(), json!(200));
    }

    // A dying worker fails its item, is reported once and gets replaced
    #[test]
    fn test_worker_exit_is_replaced() {
        let pool = pool(1);
        let old_pid = pool.worker_pids()[0];

        let handle = pool.submit(WorkItem::new("exit", vec![json!(3)])).unwrap();
        assert!(matches!(
            handle.wait(),
            Err(TaskError::WorkerExited { worker: 0, .. })
        ));

        let mut errors = Vec::new();
        assert!(wait_until(Duration::from_secs(2), || {
            errors.extend(pool.errors());
            !errors.is_empty()
        }));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], TaskError::WorkerExited { worker: 0, .. }));

        assert_eq!(pool.call("add", vec![json!(1), json!(2)]).unwrap(), json!(3));
        assert_ne!(pool.worker_pids()[0], old_pid);
        assert!(pool.errors().is_empty());
    }

    // A handle can be driven as a promise by any runner
    #[test]
    fn test_handle_into_promise() {
        let pool = pool(1);

        let promise = pool
            .submit(WorkItem::new("add", vec![json!(20), json!(22)]))
            .unwrap()
            .into_promise();
        InlineRunner::new().add_promise(&promise).unwrap();
        assert_eq!(promise.state(), PromiseState::Fulfilled);
        assert_eq!(promise.last_result(), Some(json!(42)));

        let promise = pool
            .submit(WorkItem::new("fail", vec![json!("rejected")]))
            .unwrap()
            .into_promise();
        promise.catch(|_| {});
        InlineRunner::new().add_promise(&promise).unwrap();
        assert_eq!(promise.state(), PromiseState::Rejected);
    }

    // No work is accepted after shutdown
    #[test]
    fn test_shutdown() {
        let pool = pool(2);
        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_shutting_down());
        assert!(pool.worker_pids().is_empty());
        assert_eq!(
            pool.submit(WorkItem::new("pid", vec![])).unwrap_err(),
            TaskError::PoolShutdown
        );
        assert!(pool.errors().is_empty());
    }

    // Misconfiguration is reported up front
    #[test]
    fn test_invalid_config() {
        logging::init_test();
        assert!(matches!(
            ProcessPool::new(worker_config(0)),
            Err(TaskError::InvalidConfig { .. })
        ));
        assert!(matches!(
            ProcessPool::new(ProcessPoolConfig::new("/nonexistent/pledge-worker").with_pool_size(1)),
            Err(TaskError::Transport { .. })
        ));
    }
}
