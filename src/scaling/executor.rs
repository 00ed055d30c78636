//! Decision executor
//!
//! A single worker drains the decision FIFO, enforces a per-VM execution
//! cooldown, and calls into the VM manager. Failed executions are re-queued
//! with a delay a bounded number of times, then dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::ResourceKind;
use crate::dispatcher::EventDispatcher;
use crate::Result;

use super::decision::{ScalingAction, ScalingDecision};

/// Where executed decisions land. `VmManager` is the production
/// implementation; tests substitute a recorder.
pub trait ScalingBackend: Send + Sync {
    fn scale_cpu(&self, vm_name: &str, vcpus: u16) -> Result<()>;
    fn scale_memory(&self, vm_name: &str, memory_mib: u64) -> Result<()>;
    fn migrate(&self, vm_name: &str, dest_uri: &str) -> Result<()>;
    fn pause(&self, vm_name: &str) -> Result<()>;
    fn resume(&self, vm_name: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ExecutorPolicy {
    /// Minimum spacing between executions for one VM.
    pub cooldown: Duration,
    /// Total attempts per decision, including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Destination for `Migrate` decisions.
    pub migrate_dest_uri: Option<String>,
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            migrate_dest_uri: None,
        }
    }
}

struct Queued {
    decision: ScalingDecision,
    attempt: u32,
}

pub struct DecisionExecutor {
    sender: Mutex<Option<Sender<Queued>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl DecisionExecutor {
    /// Start the worker immediately.
    pub fn new(
        backend: Arc<dyn ScalingBackend>,
        dispatcher: Arc<EventDispatcher>,
        policy: ExecutorPolicy,
    ) -> Self {
        let (sender, receiver) = channel::<Queued>();
        let retry_sender = sender.clone();
        let stopping = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stopping);
        let worker = std::thread::Builder::new()
            .name("decision-executor".to_string())
            .spawn(move || {
                execution_loop(receiver, retry_sender, stop_flag, backend, dispatcher, policy)
            })
            .expect("failed to spawn executor worker");
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            stopping,
        }
    }

    /// Enqueue a decision for execution. `Maintain` is ignored.
    pub fn submit(&self, decision: ScalingDecision) {
        if decision.is_maintain() {
            return;
        }
        let guard = self.sender.lock();
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(Queued {
                decision,
                attempt: 0,
            });
        }
    }

    /// Drain the queue and join the worker. No-op after the first call.
    pub fn stop(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DecisionExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn execution_loop(
    receiver: Receiver<Queued>,
    retry_sender: Sender<Queued>,
    stopping: Arc<AtomicBool>,
    backend: Arc<dyn ScalingBackend>,
    dispatcher: Arc<EventDispatcher>,
    policy: ExecutorPolicy,
) {
    let mut last_execution: HashMap<String, Instant> = HashMap::new();

    loop {
        // the loop holds a retry sender to its own queue, so disconnect alone
        // cannot end it; poll the stop flag once the queue runs dry
        let queued = match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(queued) => queued,
            Err(RecvTimeoutError::Timeout) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let decision = &queued.decision;

        // retries already paid the cooldown for their original execution
        if queued.attempt == 0 {
            if let Some(last) = last_execution.get(&decision.vm_name) {
                if last.elapsed() < policy.cooldown {
                    tracing::info!(
                        vm = %decision.vm_name,
                        action = %decision.action,
                        "Execution cooldown active, decision skipped"
                    );
                    continue;
                }
            }
            last_execution.insert(decision.vm_name.clone(), Instant::now());
        }

        tracing::info!(
            vm = %decision.vm_name,
            action = %decision.action,
            resource = %decision.resource,
            amount = decision.amount,
            attempt = queued.attempt,
            "Executing decision"
        );

        match execute(&*backend, decision, &policy) {
            Ok(()) => {
                tracing::info!(vm = %decision.vm_name, action = %decision.action, "Decision executed");
            }
            Err(e) => {
                let next_attempt = queued.attempt + 1;
                if next_attempt < policy.max_attempts {
                    tracing::warn!(
                        vm = %decision.vm_name,
                        error = %e,
                        attempt = next_attempt,
                        "Execution failed, re-queueing"
                    );
                    let sender = retry_sender.clone();
                    let requeued = Queued {
                        decision: queued.decision,
                        attempt: next_attempt,
                    };
                    dispatcher.submit_after(policy.retry_delay, move || {
                        let _ = sender.send(requeued);
                    });
                } else {
                    tracing::error!(
                        vm = %decision.vm_name,
                        error = %e,
                        "Execution failed after {} attempts, dropping",
                        policy.max_attempts
                    );
                }
            }
        }
    }
}

fn execute(
    backend: &dyn ScalingBackend,
    decision: &ScalingDecision,
    policy: &ExecutorPolicy,
) -> Result<()> {
    match decision.action {
        ScalingAction::ScaleUp | ScalingAction::ScaleDown => match decision.resource {
            ResourceKind::Cpu => backend.scale_cpu(&decision.vm_name, decision.amount as u16),
            ResourceKind::Memory => {
                backend.scale_memory(&decision.vm_name, decision.amount / (1024 * 1024))
            }
            // throughput limits have no domain-level knob here; the cgroup
            // is reprogrammed by the manager when a device is known
            ResourceKind::Io | ResourceKind::Network => Ok(()),
        },
        ScalingAction::Migrate => {
            let dest = policy.migrate_dest_uri.as_deref().ok_or_else(|| {
                crate::Error::Configuration("no migration destination configured".into())
            })?;
            backend.migrate(&decision.vm_name, dest)
        }
        ScalingAction::Suspend => backend.pause(&decision.vm_name),
        ScalingAction::Resume => backend.resume(&decision.vm_name),
        ScalingAction::Maintain => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
        fail_first: AtomicUsize,
    }

    impl RecordingBackend {
        fn failing(times: usize) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(times),
            }
        }

        fn record(&self, call: String) -> Result<()> {
            self.calls.lock().push(call);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Internal("injected failure".into()));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl ScalingBackend for RecordingBackend {
        fn scale_cpu(&self, vm: &str, vcpus: u16) -> Result<()> {
            self.record(format!("scale_cpu {vm} {vcpus}"))
        }
        fn scale_memory(&self, vm: &str, mib: u64) -> Result<()> {
            self.record(format!("scale_memory {vm} {mib}"))
        }
        fn migrate(&self, vm: &str, dest: &str) -> Result<()> {
            self.record(format!("migrate {vm} {dest}"))
        }
        fn pause(&self, vm: &str) -> Result<()> {
            self.record(format!("pause {vm}"))
        }
        fn resume(&self, vm: &str) -> Result<()> {
            self.record(format!("resume {vm}"))
        }
    }

    fn decision(vm: &str, action: ScalingAction, resource: ResourceKind, amount: u64) -> ScalingDecision {
        ScalingDecision {
            vm_name: vm.to_string(),
            action,
            resource,
            amount,
            timestamp: Utc::now(),
            confidence: 0.9,
            reason: "test".to_string(),
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_dispatch_by_action_and_resource() {
        let backend = Arc::new(RecordingBackend::default());
        let dispatcher = Arc::new(EventDispatcher::new(1));
        let policy = ExecutorPolicy {
            cooldown: Duration::ZERO,
            migrate_dest_uri: Some("qemu+ssh://peer/system".to_string()),
            ..ExecutorPolicy::default()
        };
        let executor = DecisionExecutor::new(backend.clone(), dispatcher, policy);

        executor.submit(decision("vm-a", ScalingAction::ScaleUp, ResourceKind::Cpu, 3));
        executor.submit(decision(
            "vm-a",
            ScalingAction::ScaleUp,
            ResourceKind::Memory,
            3 * 1024 * 1024 * 1024,
        ));
        executor.submit(decision("vm-a", ScalingAction::Suspend, ResourceKind::Cpu, 0));
        executor.submit(decision("vm-a", ScalingAction::Resume, ResourceKind::Cpu, 0));
        executor.submit(decision("vm-a", ScalingAction::Migrate, ResourceKind::Cpu, 0));
        executor.stop();

        assert_eq!(
            backend.calls(),
            vec![
                "scale_cpu vm-a 3",
                "scale_memory vm-a 3072",
                "pause vm-a",
                "resume vm-a",
                "migrate vm-a qemu+ssh://peer/system",
            ]
        );
    }

    #[test]
    fn test_cooldown_drops_decisions() {
        let backend = Arc::new(RecordingBackend::default());
        let dispatcher = Arc::new(EventDispatcher::new(1));
        let executor = DecisionExecutor::new(
            backend.clone(),
            dispatcher,
            ExecutorPolicy::default(), // 30s cooldown
        );

        executor.submit(decision("vm-a", ScalingAction::ScaleUp, ResourceKind::Cpu, 3));
        executor.submit(decision("vm-a", ScalingAction::ScaleUp, ResourceKind::Cpu, 4));
        // a different VM is not affected by vm-a's cooldown
        executor.submit(decision("vm-b", ScalingAction::ScaleUp, ResourceKind::Cpu, 2));
        executor.stop();

        assert_eq!(backend.calls(), vec!["scale_cpu vm-a 3", "scale_cpu vm-b 2"]);
    }

    #[test]
    fn test_retry_until_success() {
        let backend = Arc::new(RecordingBackend::failing(1));
        let dispatcher = Arc::new(EventDispatcher::new(1));
        let policy = ExecutorPolicy {
            cooldown: Duration::ZERO,
            retry_delay: Duration::from_millis(20),
            ..ExecutorPolicy::default()
        };
        let executor = DecisionExecutor::new(backend.clone(), dispatcher, policy);

        executor.submit(decision("vm-a", ScalingAction::ScaleUp, ResourceKind::Cpu, 3));
        wait_for(|| backend.calls().len() == 2);
        executor.stop();
        assert_eq!(backend.calls(), vec!["scale_cpu vm-a 3", "scale_cpu vm-a 3"]);
    }

    #[test]
    fn test_retries_capped_at_max_attempts() {
        let backend = Arc::new(RecordingBackend::failing(10));
        let dispatcher = Arc::new(EventDispatcher::new(1));
        let policy = ExecutorPolicy {
            cooldown: Duration::ZERO,
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
            ..ExecutorPolicy::default()
        };
        let executor = DecisionExecutor::new(backend.clone(), dispatcher, policy);

        executor.submit(decision("vm-a", ScalingAction::ScaleUp, ResourceKind::Cpu, 3));
        wait_for(|| backend.calls().len() == 3);
        // give a further retry the chance to fire wrongly
        std::thread::sleep(Duration::from_millis(100));
        executor.stop();
        assert_eq!(backend.calls().len(), 3);
    }

    #[test]
    fn test_migrate_without_destination_fails_cleanly() {
        let backend = Arc::new(RecordingBackend::default());
        let dispatcher = Arc::new(EventDispatcher::new(1));
        let policy = ExecutorPolicy {
            cooldown: Duration::ZERO,
            max_attempts: 1,
            ..ExecutorPolicy::default()
        };
        let executor = DecisionExecutor::new(backend.clone(), dispatcher, policy);
        executor.submit(decision("vm-a", ScalingAction::Migrate, ResourceKind::Cpu, 0));
        executor.stop();
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_maintain_is_ignored() {
        let backend = Arc::new(RecordingBackend::default());
        let dispatcher = Arc::new(EventDispatcher::new(1));
        let executor = DecisionExecutor::new(
            backend.clone(),
            dispatcher,
            ExecutorPolicy::default(),
        );
        executor.submit(ScalingDecision::maintain("vm-a"));
        executor.stop();
        assert!(backend.calls().is_empty());
    }
}
