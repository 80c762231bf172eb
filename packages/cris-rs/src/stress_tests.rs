//! Stress tests for the execution host.
//!
//! These tests hammer the runner pool with concurrent jobs, resizes, panics
//! and deep call chains.

#[cfg(test)]
mod stress_tests {
    use crate::config::HostConfig;
    use crate::context::ExecutionContext;
    use crate::core::{cris_object, CrisPoco};
    use crate::handler::Handler;
    use crate::host::ExecutionHost;
    use crate::job::{ClosureExecutor, Job, JobExecutor, ScopeData};
    use crate::registry::{HandlerRegistry, RegistryBuilder};
    use crate::testing::init_tracing;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Default)]
    struct Deps {
        executed: AtomicUsize,
    }

    #[derive(Debug)]
    struct Work {
        id: usize,
        delay_ms: u64,
    }
    impl CrisPoco for Work {}

    #[derive(Debug)]
    struct Crash {
        id: usize,
    }
    impl CrisPoco for Crash {}

    #[derive(Debug)]
    struct Countdown {
        n: u32,
    }
    impl CrisPoco for Countdown {}

    #[derive(Debug)]
    #[allow(dead_code)]
    struct Tick {
        level: u32,
    }
    impl CrisPoco for Tick {}

    struct WorkHandler {
        executed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<Work, Deps> for WorkHandler {
        type Output = usize;

        async fn handle(&self, cmd: &Work, ctx: &mut ExecutionContext<Deps>) -> Result<usize> {
            if cmd.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(cmd.delay_ms)).await;
            }
            ctx.services().executed.fetch_add(1, Ordering::SeqCst);
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(cmd.id)
        }
    }

    struct CrashHandler;

    #[async_trait]
    impl Handler<Crash, Deps> for CrashHandler {
        type Output = ();

        async fn handle(&self, cmd: &Crash, _: &mut ExecutionContext<Deps>) -> Result<()> {
            panic!("crash #{}", cmd.id)
        }
    }

    struct CountdownHandler;

    #[async_trait]
    impl Handler<Countdown, Deps> for CountdownHandler {
        type Output = u32;

        async fn handle(&self, cmd: &Countdown, ctx: &mut ExecutionContext<Deps>) -> Result<u32> {
            ctx.emit_event(Tick { level: cmd.n }).await?;
            if cmd.n == 0 {
                return Ok(0);
            }
            let inner = ctx.execute(Countdown { n: cmd.n - 1 }).await?;
            Ok(inner.downcast_ref::<u32>().copied().unwrap_or_default() + 1)
        }
    }

    fn registry(executed: Arc<AtomicUsize>) -> Arc<HandlerRegistry<Deps>> {
        let registry = RegistryBuilder::<Deps>::new()
            .command_with_result::<Work, usize>()
            .command::<Crash>()
            .command_with_result::<Countdown, u32>()
            .caller_only_event::<Tick>()
            .handler::<Work, _>(WorkHandler { executed })
            .handler::<Crash, _>(CrashHandler)
            .handler::<Countdown, _>(CountdownHandler)
            .build()
            .unwrap();
        Arc::new(registry)
    }

    fn executor() -> Arc<dyn JobExecutor<Deps>> {
        Arc::new(ClosureExecutor::new(|_: &ScopeData| Ok(Deps::default())))
    }

    fn start(runners: usize) -> (ExecutionHost<Deps>, Arc<AtomicUsize>) {
        init_tracing();
        let executed = Arc::new(AtomicUsize::new(0));
        let host = ExecutionHost::start(
            registry(executed.clone()),
            HostConfig::with_runner_count(runners),
        )
        .unwrap();
        (host, executed)
    }

    // ==========================================================================
    // Tests
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_resizing_under_load() {
        let (host, executed) = start(4);
        let executor = executor();

        let mut handles = Vec::new();
        for id in 0..200 {
            let work = Work {
                id,
                delay_ms: fastrand::u64(0..3),
            };
            let (job, handle) = Job::new(cris_object(work), executor.clone(), ScopeData::default());
            host.submit(job).unwrap();
            handles.push(handle);

            if id % 20 == 0 {
                host.set_runner_count(fastrand::usize(1..=16)).unwrap();
            }
        }

        for (id, handle) in handles.into_iter().enumerate() {
            let executed = handle.wait().await.unwrap();
            assert_eq!(
                executed.result.success().unwrap().downcast_ref::<usize>(),
                Some(&id)
            );
        }
        assert_eq!(executed.load(Ordering::SeqCst), 200);

        host.set_runner_count(3).unwrap();
        let mut status = host.subscribe();
        status
            .wait_for(|s| s.runner_count == 3 && s.planned_count == 3)
            .await
            .unwrap();

        host.shutdown().await;
        assert_eq!(host.status().runner_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panics_do_not_shrink_the_pool() {
        let (host, executed) = start(3);
        let executor = executor();

        let mut handles = Vec::new();
        for id in 0..60 {
            let command = if id % 3 == 0 {
                cris_object(Crash { id })
            } else {
                cris_object(Work { id, delay_ms: 0 })
            };
            let (job, handle) = Job::new(command, executor.clone(), ScopeData::default());
            host.submit(job).unwrap();
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            let executed = handle.wait().await.unwrap();
            assert_eq!(executed.is_success(), id % 3 != 0, "job {}", id);
        }
        assert_eq!(executed.load(Ordering::SeqCst), 40);
        assert_eq!(host.status().runner_count, 3);

        host.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deep_call_chains_bubble_every_event() {
        let (host, _) = start(2);
        let executor = executor();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (job, handle) = Job::new(
                cris_object(Countdown { n: 32 }),
                executor.clone(),
                ScopeData::default(),
            );
            host.submit(job).unwrap();
            handles.push(handle);
        }

        for handle in handles {
            let executed = handle.wait().await.unwrap();
            assert_eq!(
                executed.result.success().unwrap().downcast_ref::<u32>(),
                Some(&32)
            );
            // Outermost first: each level emits before executing the next.
            assert_eq!(executed.events.len(), 33);
            let first = executed.events[0].downcast_ref::<Tick>().unwrap();
            assert_eq!(first.level, 32);
        }

        host.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dropped_handles_do_not_block_runners() {
        let (host, executed) = start(2);
        let executor = executor();

        for id in 0..50 {
            let (job, handle) = Job::new(
                cris_object(Work { id, delay_ms: 0 }),
                executor.clone(),
                ScopeData::default(),
            );
            drop(handle);
            host.submit(job).unwrap();
        }

        host.shutdown().await;
        assert_eq!(executed.load(Ordering::SeqCst), 50);
    }
}
